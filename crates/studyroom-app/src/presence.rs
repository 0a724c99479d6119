// Presence Session Manager.
//
// Pure state machine: the room loop performs the calls and feeds results
// back. Membership is replaced wholesale on every poll; nothing is diffed.

use std::time::Duration;

use tracing::{debug, info, warn};

use studyroom_core::protocol::{JoinOutcome, PresenceEntry};

use crate::api::ApiError;

/// Join attempts before the session is blocked: the first call plus one retry.
pub const MAX_JOIN_ATTEMPTS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresencePhase {
    Idle,
    Joining { attempt: u8 },
    /// First join was rejected; waiting out the retry delay.
    RetryPending,
    Joined,
    /// Terminal for this mount. The user has to leave and re-enter.
    Blocked { reason: String },
}

/// What the caller must do after a join result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinStep {
    Joined,
    RetryAfter(Duration),
    Blocked,
}

#[derive(Debug)]
pub struct PresenceSession {
    room_id: String,
    phase: PresencePhase,
    has_joined: bool,
    members: Vec<PresenceEntry>,
    retry_delay: Duration,
}

impl PresenceSession {
    pub fn new(room_id: impl Into<String>, retry_delay: Duration) -> Self {
        Self {
            room_id: room_id.into(),
            phase: PresencePhase::Idle,
            has_joined: false,
            members: Vec::new(),
            retry_delay,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn phase(&self) -> &PresencePhase {
        &self.phase
    }

    pub fn members(&self) -> &[PresenceEntry] {
        &self.members
    }

    pub fn has_joined(&self) -> bool {
        self.has_joined
    }

    pub fn is_joined(&self) -> bool {
        self.phase == PresencePhase::Joined
    }

    /// Move `Idle -> Joining`. Returns false if a join is already underway or
    /// finished, in which case no call should be made.
    pub fn begin_join(&mut self) -> bool {
        if self.phase != PresencePhase::Idle {
            return false;
        }
        self.phase = PresencePhase::Joining { attempt: 1 };
        true
    }

    /// Move `RetryPending -> Joining` once the retry delay has elapsed.
    pub fn begin_retry(&mut self) -> bool {
        if self.phase != PresencePhase::RetryPending {
            return false;
        }
        self.phase = PresencePhase::Joining {
            attempt: MAX_JOIN_ATTEMPTS,
        };
        true
    }

    pub fn on_join_result(&mut self, result: Result<JoinOutcome, ApiError>) -> JoinStep {
        let attempt = match self.phase {
            PresencePhase::Joining { attempt } => attempt,
            // A late result for a phase we already left.
            PresencePhase::Joined => return JoinStep::Joined,
            _ => return JoinStep::Blocked,
        };

        let rejection = match result {
            Ok(JoinOutcome::Joined) => {
                info!("Joined room {} on attempt {attempt}", self.room_id);
                self.phase = PresencePhase::Joined;
                self.has_joined = true;
                return JoinStep::Joined;
            }
            Ok(JoinOutcome::Forbidden) => "not accepted into this room".to_string(),
            Err(e) => format!("could not join room: {e}"),
        };

        if attempt < MAX_JOIN_ATTEMPTS {
            debug!(
                "Join of room {} rejected ({rejection}), retrying in {:?}",
                self.room_id, self.retry_delay
            );
            self.phase = PresencePhase::RetryPending;
            JoinStep::RetryAfter(self.retry_delay)
        } else {
            warn!("Join of room {} blocked: {rejection}", self.room_id);
            self.phase = PresencePhase::Blocked { reason: rejection };
            JoinStep::Blocked
        }
    }

    /// Polling runs while joined and while a rejected join awaits its retry.
    pub fn should_poll(&self) -> bool {
        matches!(self.phase, PresencePhase::Joined | PresencePhase::RetryPending)
    }

    /// Apply a poll response. Success replaces the member list; failure keeps
    /// the previous list and is retried on the next tick.
    pub fn apply_poll(&mut self, result: Result<Vec<PresenceEntry>, ApiError>) {
        if !self.should_poll() {
            return;
        }
        match result {
            Ok(members) => self.members = members,
            Err(e) => debug!("Presence poll for {} failed: {e}", self.room_id),
        }
    }

    /// Returns true exactly when a leave call should be sent, and resets the
    /// session. A session that never joined never sends a leave.
    pub fn take_leave_permit(&mut self) -> bool {
        let permitted = self.has_joined;
        self.has_joined = false;
        self.phase = PresencePhase::Idle;
        self.members.clear();
        permitted
    }
}
