// Messages between the room loop and whatever presents it.

use std::time::Duration;

use studyroom_core::protocol::{
    CompletionStatus, MaterialFile, PresenceEntry, QuizConfig, QuizResult, RoomMessage,
};

use crate::chat::ChannelState;
use crate::presence::PresencePhase;
use crate::quiz::{MaterialEntry, QuizPhase, ReviewItem};
use crate::timer::{StopSummary, TimerSnapshot};

/// User intents delivered to a mounted room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomCommand {
    SendMessage(String),
    /// Re-send a failed message under its original idempotency key.
    RetryMessage(String),
    Scrolled {
        distance_from_bottom_px: f64,
    },
    UploadMaterial(MaterialFile),
    GenerateQuiz {
        config: QuizConfig,
        confirmed: bool,
    },
    Answer {
        question_id: String,
        option_index: usize,
    },
    RequestResults,
    EnterReview,
    ExitReview,
    StartTimer(String),
    StopTimer,
    SetTimerTarget(Option<Duration>),
    /// Explicit leave: removes presence and stops the timer.
    Leave,
    /// Navigation away: tears down the channel only.
    Unmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// One-shot toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    View(Box<RoomView>),
    Notice(Notice),
    /// The timer reached its target and stopped itself.
    TimerCompleted(StopSummary),
}

/// Everything presentation needs to draw a room, rebuilt after each event.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    pub room_id: String,
    pub presence: PresencePhase,
    pub members: Vec<PresenceEntry>,
    pub channel: ChannelState,
    pub messages: Vec<RoomMessage>,
    pub autoscroll: bool,
    pub quiz_phase: QuizPhase,
    pub reviewing: bool,
    pub materials: Vec<MaterialEntry>,
    pub question_count: usize,
    pub answered_count: usize,
    pub completion: CompletionStatus,
    pub results: Option<Vec<QuizResult>>,
    pub review: Vec<ReviewItem>,
    pub timer: Option<TimerSnapshot>,
}

impl RoomView {
    /// Progress line for the convergence wait, e.g. "2/3 completed, waiting".
    pub fn waiting_label(&self) -> Option<String> {
        match &self.quiz_phase {
            QuizPhase::WaitingForAll { status, stalled } => {
                let mut label = format!(
                    "{}/{} completed, waiting",
                    status.completed_count, status.total_participants
                );
                if *stalled {
                    label.push_str(" (stalled)");
                }
                Some(label)
            }
            _ => None,
        }
    }

    pub fn timer_label(&self) -> Option<String> {
        self.timer.as_ref().map(|t| {
            let secs = t.elapsed_seconds.max(0);
            format!(
                "{} {}:{:02}:{:02}",
                t.subject_id,
                secs / 3600,
                (secs / 60) % 60,
                secs % 60
            )
        })
    }
}
