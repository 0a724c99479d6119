// Timer Recovery Engine.
//
// Elapsed time is always recomputed from the persisted `{start, base}` pair
// and the wall clock. There is no in-memory counter, so suspension, reloads
// and crashes lose nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use studyroom_core::clock::Clock;
use studyroom_core::db::{scoped_key, Database};
use studyroom_core::protocol::{Achievement, TimerState};

use crate::api::{ApiError, TimerApi};

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("a timer for subject '{running}' is already running")]
    AlreadyRunning { running: String },

    #[error("timer collaborator failed: {0}")]
    Api(#[from] ApiError),

    #[error("local store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// The engine is shared between the room loop (ticks, auto-stop) and explicit
/// user commands. The async mutex serialises stops, which is what makes a
/// racing auto-stop and manual stop observe each other.
pub type SharedTimer = Arc<tokio::sync::Mutex<TimerEngine>>;

/// What the view shows for a running timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub subject_id: String,
    pub elapsed_seconds: i64,
}

/// Result of a completed stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSummary {
    pub subject_id: String,
    pub elapsed_seconds: i64,
    pub elapsed_minutes: u32,
    pub newly_unlocked: Vec<Achievement>,
    pub totals: StudyTotals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Running(TimerSnapshot),
    /// The bound target was reached and the engine stopped itself.
    Completed(StopSummary),
}

// ---------------------------------------------------------------------------
// Study totals
// ---------------------------------------------------------------------------

/// Accumulated study seconds for the current day, ISO week and month. A
/// bucket restarts from zero when its period key no longer matches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyTotals {
    pub day_key: String,
    pub day_seconds: i64,
    pub week_key: String,
    pub week_seconds: i64,
    pub month_key: String,
    pub month_seconds: i64,
}

impl StudyTotals {
    pub fn fold(&mut self, seconds: i64, at: DateTime<Utc>) {
        let day = at.format("%Y-%m-%d").to_string();
        let iso = at.iso_week();
        let week = format!("{}-W{:02}", iso.year(), iso.week());
        let month = at.format("%Y-%m").to_string();

        fold_bucket(&mut self.day_key, &mut self.day_seconds, day, seconds);
        fold_bucket(&mut self.week_key, &mut self.week_seconds, week, seconds);
        fold_bucket(&mut self.month_key, &mut self.month_seconds, month, seconds);
    }
}

fn fold_bucket(key: &mut String, total: &mut i64, current: String, seconds: i64) {
    if *key != current {
        *key = current;
        *total = 0;
    }
    *total += seconds;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct TimerEngine {
    db: Arc<Database>,
    api: Arc<dyn TimerApi>,
    clock: Arc<dyn Clock>,
    user_id: String,
    target: Option<Duration>,
}

impl TimerEngine {
    pub fn new(
        db: Arc<Database>,
        api: Arc<dyn TimerApi>,
        clock: Arc<dyn Clock>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            api,
            clock,
            user_id: user_id.into(),
            target: None,
        }
    }

    pub fn into_shared(self) -> SharedTimer {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Bind (or clear) the planned session length used for auto-stop.
    pub fn set_target(&mut self, target: Option<Duration>) {
        self.target = target;
    }

    pub fn target(&self) -> Option<Duration> {
        self.target
    }

    /// Start timing `subject_id`.
    ///
    /// Starting the subject that is already running keeps the original start
    /// timestamp and does not call the collaborator again. Starting a
    /// different subject is rejected until the running one is stopped.
    pub async fn start(&mut self, subject_id: &str) -> Result<TimerState, TimerError> {
        if let Some(existing) = self.db.load_timer(&self.user_id)? {
            if existing.subject_id == subject_id {
                info!("Timer for {subject_id} already running, start ignored");
                return Ok(existing);
            }
            return Err(TimerError::AlreadyRunning {
                running: existing.subject_id,
            });
        }

        self.api.start_timer(subject_id).await?;

        let state = TimerState {
            subject_id: subject_id.to_string(),
            start_timestamp: self.clock.now(),
            base_elapsed_seconds: 0,
        };
        self.db.save_timer(&self.user_id, &state)?;
        info!("Timer started for {subject_id}");
        Ok(state)
    }

    /// Current elapsed time, straight from the persisted record.
    pub fn snapshot(&self) -> Result<Option<TimerSnapshot>, TimerError> {
        let now = self.clock.now();
        Ok(self.db.load_timer(&self.user_id)?.map(|state| TimerSnapshot {
            elapsed_seconds: state.elapsed_seconds(now),
            subject_id: state.subject_id,
        }))
    }

    /// Presentation refresh. Also the place the auto-stop target is enforced.
    pub async fn tick(&mut self) -> Result<TickOutcome, TimerError> {
        let Some(snapshot) = self.snapshot()? else {
            return Ok(TickOutcome::Idle);
        };

        if let Some(target) = self.target {
            let target_seconds = i64::try_from(target.as_secs()).unwrap_or(i64::MAX);
            if snapshot.elapsed_seconds >= target_seconds {
                info!(
                    "Timer for {} reached its target of {}s, stopping",
                    snapshot.subject_id,
                    target.as_secs()
                );
                self.target = None;
                return Ok(match self.stop().await? {
                    Some(summary) => TickOutcome::Completed(summary),
                    None => TickOutcome::Idle,
                });
            }
        }

        Ok(TickOutcome::Running(snapshot))
    }

    /// Stop the running timer. With nothing persisted this is a no-op and
    /// returns `Ok(None)`, so a second stop never double-counts.
    ///
    /// The record is cleared before the collaborator is called; a failed
    /// collaborator call does not resurrect it.
    pub async fn stop(&mut self) -> Result<Option<StopSummary>, TimerError> {
        let Some(state) = self.db.load_timer(&self.user_id)? else {
            return Ok(None);
        };

        let now = self.clock.now();
        let elapsed = state.elapsed_seconds(now);
        self.db.clear_timer(&self.user_id)?;

        let report = match self.api.stop_timer(&state.subject_id, elapsed).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Timer stop for {} failed after {elapsed}s: {e}", state.subject_id);
                return Err(e.into());
            }
        };

        let totals = self.fold_totals(elapsed, now)?;
        info!(
            "Timer stopped for {}: {elapsed}s, {} new achievement(s)",
            state.subject_id,
            report.newly_unlocked_achievements.len()
        );

        Ok(Some(StopSummary {
            subject_id: state.subject_id,
            elapsed_seconds: elapsed,
            elapsed_minutes: report.elapsed_minutes,
            newly_unlocked: report.newly_unlocked_achievements,
            totals,
        }))
    }

    /// Crash-recovery path: resume whatever was persisted without calling the
    /// start collaborator again.
    pub fn recover_on_launch(&self) -> Result<Option<TimerSnapshot>, TimerError> {
        let snapshot = self.snapshot()?;
        if let Some(s) = &snapshot {
            info!(
                "Recovered running timer for {} at {}s elapsed",
                s.subject_id, s.elapsed_seconds
            );
        }
        Ok(snapshot)
    }

    pub fn totals(&self) -> Result<StudyTotals, TimerError> {
        let key = self.totals_key();
        Ok(match self.db.load_state(&key)? {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!("Discarding unreadable study totals: {e}");
                StudyTotals::default()
            }),
            None => StudyTotals::default(),
        })
    }

    fn fold_totals(&self, seconds: i64, at: DateTime<Utc>) -> Result<StudyTotals, TimerError> {
        let mut totals = self.totals()?;
        totals.fold(seconds, at);
        let value = serde_json::to_value(&totals).map_err(anyhow::Error::from)?;
        self.db.save_state(&self.totals_key(), &value)?;
        Ok(totals)
    }

    fn totals_key(&self) -> String {
        scoped_key("totals", &self.user_id, "study")
    }
}
