// Library root: the study room synchronization core. Re-exports every module
// so integration tests and the line driver share one public API.

pub mod api;
pub mod chat;
pub mod cli;
pub mod presence;
pub mod quiz;
pub mod room;
pub mod timer;
pub mod view;
