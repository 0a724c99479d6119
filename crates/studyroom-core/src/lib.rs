// Shared foundation for the study room client: configuration, the local
// persisted store, wire types, the wall clock, and the channel transport.

pub mod channel;
pub mod clock;
pub mod config;
pub mod db;
pub mod protocol;
