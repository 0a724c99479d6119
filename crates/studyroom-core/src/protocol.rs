// Wire and data types shared between the room core and its collaborators.
//
// Field names follow the collaborator's camelCase JSON. Client-only
// bookkeeping (message delivery state) is never serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// One member of a room's live membership list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub participant_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
}

/// Result of a join call. Forbidden is an expected answer, not a transport
/// failure: the server may not yet recognize a just-accepted participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Forbidden,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// Client-side delivery state of a message in the local log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Inserted optimistically, waiting for the server echo.
    Pending,
    /// Authoritative copy received from the server.
    #[default]
    Confirmed,
    /// Could not be handed to any channel. Kept visible until retried.
    Failed,
}

/// A chat message in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub delivery: Delivery,
}

impl RoomMessage {
    /// True from optimistic insert until the matching echo arrives.
    pub fn pending(&self) -> bool {
        self.delivery == Delivery::Pending
    }
}

/// Frames the client writes to the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    Join { room_id: String },
    #[serde(rename_all = "camelCase")]
    Leave { room_id: String },
    #[serde(rename_all = "camelCase")]
    Send {
        room_id: String,
        content: String,
        idempotency_key: String,
    },
}

impl OutboundFrame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Frames the server pushes over the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundFrame {
    Message { message: RoomMessage },
    Error { message: String },
    /// Acks, typing indicators and anything newer than this client.
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Persisted record of the single active study timer for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub subject_id: String,
    pub start_timestamp: DateTime<Utc>,
    pub base_elapsed_seconds: i64,
}

impl TimerState {
    /// `base + (now - start)`, never negative even if the wall clock moved
    /// backwards.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        let running = (now - self.start_timestamp).num_seconds().max(0);
        self.base_elapsed_seconds.max(0) + running
    }
}

/// A milestone the collaborator reports as newly crossed by a stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub threshold_minutes: Option<u32>,
}

/// Response of the timer-stop collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub elapsed_minutes: u32,
    #[serde(default)]
    pub newly_unlocked_achievements: Vec<Achievement>,
}

// ---------------------------------------------------------------------------
// Quiz
// ---------------------------------------------------------------------------

pub const OPTIONS_PER_QUESTION: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub id: String,
    pub prompt: String,
    pub options: [String; OPTIONS_PER_QUESTION],
    pub correct_option_index: usize,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuizData {
    pub questions: Vec<QuizQuestion>,
}

impl QuizData {
    pub fn question(&self, question_id: &str) -> Option<&QuizQuestion> {
        self.questions.iter().find(|q| q.id == question_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Parameters submitted when generating a quiz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizConfig {
    pub question_count: u32,
    pub difficulty: Difficulty,
}

/// One user's choice for one question. Upsert semantics per question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub question_id: String,
    pub chosen_option_index: usize,
}

/// Server-derived progress of every participant. Never computed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompletionStatus {
    pub completed_count: u32,
    pub total_participants: u32,
    pub all_completed: bool,
}

/// Aggregate outcome of one question across all participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizResult {
    pub question_id: String,
    pub question: String,
    pub options: Vec<String>,
    pub correct_option_index: usize,
    #[serde(default)]
    pub explanation: String,
    pub correct_count: u32,
    pub incorrect_count: u32,
    pub unanswered_count: u32,
}

/// A study material selected for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Metadata the collaborator returns for an uploaded material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub size_bytes: u64,
}
