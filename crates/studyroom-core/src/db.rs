// SQLite persistence for state that must survive a process restart: the
// active study timer, locally recorded quiz answers, and small JSON blobs.
//
// Every row is scoped by user id (and room id where relevant) so that
// different users or rooms on a shared device never see each other's state.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::protocol::{AnswerRecord, TimerState};

/// Builds a namespaced key for the generic state table.
pub fn scoped_key(kind: &str, user_id: &str, scope: &str) -> String {
    format!("{kind}:{user_id}:{scope}")
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS timer_state (
                user_id              TEXT PRIMARY KEY,
                subject_id           TEXT NOT NULL,
                start_timestamp      TEXT NOT NULL,
                base_elapsed_seconds INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS quiz_answers (
                user_id      TEXT NOT NULL,
                room_id      TEXT NOT NULL,
                question_id  TEXT NOT NULL,
                option_index INTEGER NOT NULL,
                answered_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (user_id, room_id, question_id)
            );

            CREATE TABLE IF NOT EXISTS session_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Panics if the mutex is poisoned, which only happens after another
    /// thread panicked mid-query.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    /// Persist the active timer for `user_id`, replacing any previous record.
    pub fn save_timer(&self, user_id: &str, state: &TimerState) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO timer_state
                (user_id, subject_id, start_timestamp, base_elapsed_seconds)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id,
                state.subject_id,
                state.start_timestamp.to_rfc3339(),
                state.base_elapsed_seconds,
            ],
        )
        .context("failed to save timer state")?;
        Ok(())
    }

    pub fn load_timer(&self, user_id: &str) -> Result<Option<TimerState>> {
        let conn = self.conn();
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT subject_id, start_timestamp, base_elapsed_seconds
                 FROM timer_state WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("failed to query timer state")?;

        let Some((subject_id, start, base)) = row else {
            return Ok(None);
        };
        let start_timestamp = DateTime::parse_from_rfc3339(&start)
            .with_context(|| format!("corrupt timer start timestamp: {start}"))?
            .with_timezone(&Utc);
        Ok(Some(TimerState {
            subject_id,
            start_timestamp,
            base_elapsed_seconds: base,
        }))
    }

    /// Remove the active timer. Returns `true` if a record existed.
    pub fn clear_timer(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn();
        let removed = conn
            .execute("DELETE FROM timer_state WHERE user_id = ?1", params![user_id])
            .context("failed to clear timer state")?;
        Ok(removed > 0)
    }

    // -----------------------------------------------------------------------
    // Quiz answers
    // -----------------------------------------------------------------------

    /// Record an answer. Re-answering the same question overwrites the
    /// previous choice but keeps its original position in replay order.
    pub fn upsert_answer(&self, user_id: &str, room_id: &str, answer: &AnswerRecord) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO quiz_answers (user_id, room_id, question_id, option_index)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, room_id, question_id) DO UPDATE SET
                option_index = excluded.option_index,
                answered_at  = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            params![
                user_id,
                room_id,
                answer.question_id,
                answer.chosen_option_index as i64
            ],
        )
        .context("failed to upsert quiz answer")?;
        Ok(())
    }

    /// Load every answer recorded for `(user_id, room_id)` in first-answered
    /// order.
    pub fn load_answers(&self, user_id: &str, room_id: &str) -> Result<Vec<AnswerRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT question_id, option_index FROM quiz_answers
                 WHERE user_id = ?1 AND room_id = ?2 ORDER BY rowid",
            )
            .context("failed to prepare load_answers query")?;

        let answers = stmt
            .query_map(params![user_id, room_id], |row| {
                let index: i64 = row.get(1)?;
                Ok(AnswerRecord {
                    question_id: row.get(0)?,
                    chosen_option_index: index.max(0) as usize,
                })
            })
            .context("failed to query quiz answers")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map quiz answer rows")?;

        Ok(answers)
    }

    pub fn delete_answer(&self, user_id: &str, room_id: &str, question_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM quiz_answers WHERE user_id = ?1 AND room_id = ?2 AND question_id = ?3",
            params![user_id, room_id, question_id],
        )
        .context("failed to delete quiz answer")?;
        Ok(())
    }

    /// Drop all answers for `(user_id, room_id)`. Returns how many were removed.
    pub fn clear_answers(&self, user_id: &str, room_id: &str) -> Result<usize> {
        let conn = self.conn();
        let removed = conn
            .execute(
                "DELETE FROM quiz_answers WHERE user_id = ?1 AND room_id = ?2",
                params![user_id, room_id],
            )
            .context("failed to clear quiz answers")?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Generic JSON state
    // -----------------------------------------------------------------------

    /// Persist an arbitrary JSON value under `key`, overwriting any previous
    /// value.
    pub fn save_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn();
        let json_str = serde_json::to_string(value).context("failed to serialize state value")?;
        conn.execute(
            "INSERT OR REPLACE INTO session_state (key, value) VALUES (?1, ?2)",
            params![key, json_str],
        )
        .context("failed to save state")?;
        Ok(())
    }

    /// Load a previously saved JSON value by `key`.
    pub fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn();
        let json_str: Option<String> = conn
            .query_row(
                "SELECT value FROM session_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query session state")?;

        match json_str {
            Some(s) => {
                let value = serde_json::from_str(&s).context("failed to deserialize state value")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn remove_state(&self, key: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM session_state WHERE key = ?1", params![key])
            .context("failed to remove state")?;
        Ok(())
    }
}
