// Realtime Message Channel: the local message log and its reconciliation.
//
// The log is the single ordered list the user sees. Sends are inserted
// optimistically under a fresh idempotency key; server echoes replace the
// matching entry in place. The transport itself lives in
// `studyroom_core::channel`, and the room loop owns the connection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use studyroom_core::protocol::{Delivery, OutboundFrame, RoomMessage};

/// Connection state surfaced to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    /// Lost unexpectedly; a new connection is scheduled.
    Reconnecting { attempt: u32 },
    /// Torn down on unmount.
    Closed,
    /// The transport could not be constructed. Chat is disabled for this
    /// mount while presence and quiz keep working.
    Unavailable,
}

impl ChannelState {
    pub fn can_send(&self) -> bool {
        *self == ChannelState::Open
    }
}

/// How an inbound message was folded into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// Matched a pending entry, which is now confirmed in place.
    Confirmed,
    /// Repeat of a message already confirmed; nothing new is visible.
    Duplicate,
    /// A message we had not seen, appended at the end.
    Appended,
}

#[derive(Debug)]
pub struct MessageLog {
    room_id: String,
    sender_id: String,
    sender_name: String,
    entries: Vec<RoomMessage>,
}

impl MessageLog {
    pub fn new(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            entries: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[RoomMessage] {
        &self.entries
    }

    /// Insert `content` optimistically and return its idempotency key with
    /// the frame to transmit.
    pub fn send(&mut self, content: &str, created_at: DateTime<Utc>) -> (String, OutboundFrame) {
        let key = Uuid::new_v4().to_string();
        self.entries.push(RoomMessage {
            id: format!("local-{key}"),
            idempotency_key: Some(key.clone()),
            room_id: self.room_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            content: content.to_string(),
            created_at,
            delivery: Delivery::Pending,
        });
        let frame = self.frame_for(&key, content);
        (key, frame)
    }

    /// Fold an authoritative message into the log.
    ///
    /// Matching is by idempotency key first, then by server id, so neither a
    /// repeated echo nor a history replay produces a second visible copy.
    pub fn on_inbound(&mut self, mut message: RoomMessage) -> Reconcile {
        message.delivery = Delivery::Confirmed;

        let by_key = message.idempotency_key.as_deref().and_then(|key| {
            self.entries
                .iter()
                .position(|m| m.idempotency_key.as_deref() == Some(key))
        });
        let slot = by_key.or_else(|| self.entries.iter().position(|m| m.id == message.id));

        match slot {
            Some(i) => {
                let was_confirmed = self.entries[i].delivery == Delivery::Confirmed;
                self.entries[i] = message;
                if was_confirmed {
                    Reconcile::Duplicate
                } else {
                    Reconcile::Confirmed
                }
            }
            None => {
                self.entries.push(message);
                Reconcile::Appended
            }
        }
    }

    /// Frames for every message still awaiting its echo, in log order.
    /// Re-sent on each (re)open with their original keys.
    pub fn pending_frames(&self) -> Vec<OutboundFrame> {
        self.entries
            .iter()
            .filter(|m| m.delivery == Delivery::Pending)
            .filter_map(|m| {
                m.idempotency_key
                    .as_deref()
                    .map(|key| self.frame_for(key, &m.content))
            })
            .collect()
    }

    /// Mark a pending message as undeliverable. It stays visible.
    pub fn mark_failed(&mut self, key: &str) -> bool {
        match self.find_mut(key) {
            Some(m) if m.delivery == Delivery::Pending => {
                debug!("Message {key} marked failed");
                m.delivery = Delivery::Failed;
                true
            }
            _ => false,
        }
    }

    /// Flip a failed message back to pending and return the frame to resend
    /// under the same key.
    pub fn retry(&mut self, key: &str) -> Option<OutboundFrame> {
        let m = self.find_mut(key)?;
        if m.delivery != Delivery::Failed {
            return None;
        }
        m.delivery = Delivery::Pending;
        let content = m.content.clone();
        Some(self.frame_for(key, &content))
    }

    pub fn join_frame(&self) -> OutboundFrame {
        OutboundFrame::Join {
            room_id: self.room_id.clone(),
        }
    }

    pub fn leave_frame(&self) -> OutboundFrame {
        OutboundFrame::Leave {
            room_id: self.room_id.clone(),
        }
    }

    fn find_mut(&mut self, key: &str) -> Option<&mut RoomMessage> {
        self.entries
            .iter_mut()
            .find(|m| m.idempotency_key.as_deref() == Some(key))
    }

    fn frame_for(&self, key: &str, content: &str) -> OutboundFrame {
        OutboundFrame::Send {
            room_id: self.room_id.clone(),
            content: content.to_string(),
            idempotency_key: key.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Autoscroll
// ---------------------------------------------------------------------------

/// Remembers whether the viewer was near the bottom at the last scroll event.
#[derive(Debug, Clone)]
pub struct ScrollTracker {
    threshold_px: f64,
    near_bottom: bool,
}

impl ScrollTracker {
    pub fn new(threshold_px: f64) -> Self {
        Self {
            threshold_px,
            near_bottom: true,
        }
    }

    pub fn on_scroll(&mut self, distance_from_bottom_px: f64) {
        self.near_bottom = distance_from_bottom_px <= self.threshold_px;
    }

    pub fn should_autoscroll(&self) -> bool {
        self.near_bottom
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: initial, then doubled, capped at max.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        self.attempt += 1;
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.attempt = 0;
    }
}
