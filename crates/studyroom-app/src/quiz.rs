// Quiz Convergence State Machine.
//
// Flow: Collecting -> Ready -> Generating -> Active -> PerUserCompleted ->
// WaitingForAll -> ResultsAvailable, with review as a read-only overlay.
//
// The machine never performs network calls. Operations that need one return
// a `QuizEffect` for the room loop to execute; the loop feeds the outcome
// back through the matching `on_*` method. Local answers are written to the
// store synchronously, before the effect is handed out.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use studyroom_core::db::{scoped_key, Database};
use studyroom_core::protocol::{
    AnswerRecord, CompletionStatus, FileMeta, MaterialFile, QuizConfig, QuizData, QuizResult,
    OPTIONS_PER_QUESTION,
};

use crate::api::ApiError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuizError {
    #[error("material '{0}' is already selected")]
    DuplicateMaterial(String),

    #[error("at most {max} materials can be uploaded")]
    TooManyMaterials { max: usize },

    #[error("upload at least one material first")]
    NoMaterials,

    #[error("a quiz needs at least one question")]
    EmptyQuiz,

    #[error("starting a new quiz discards current progress and must be confirmed")]
    ConfirmationRequired,

    #[error("not allowed while {0}")]
    InvalidPhase(&'static str),

    #[error("unknown question '{0}'")]
    UnknownQuestion(String),

    #[error("option {0} does not exist")]
    InvalidOption(usize),

    #[error("results are not available until every participant has finished")]
    BarrierClosed,

    #[error("local store error: {0}")]
    Store(String),
}

impl From<anyhow::Error> for QuizError {
    fn from(e: anyhow::Error) -> Self {
        QuizError::Store(format!("{e:#}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuizPhase {
    Collecting,
    Ready,
    Generating,
    Active,
    PerUserCompleted,
    /// The local user is done; the server barrier is still closed.
    WaitingForAll {
        status: CompletionStatus,
        stalled: bool,
    },
    ResultsAvailable,
}

impl QuizPhase {
    pub fn label(&self) -> &'static str {
        match self {
            QuizPhase::Collecting => "collecting materials",
            QuizPhase::Ready => "ready to generate",
            QuizPhase::Generating => "generating",
            QuizPhase::Active => "answering",
            QuizPhase::PerUserCompleted => "completed",
            QuizPhase::WaitingForAll { .. } => "waiting for others",
            QuizPhase::ResultsAvailable => "showing results",
        }
    }
}

/// Network work requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuizEffect {
    Upload(MaterialFile),
    Generate(QuizConfig),
    SubmitAnswer {
        question_id: String,
        option_index: usize,
    },
    FetchResults,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialEntry {
    pub name: String,
    /// `None` while the upload is in flight.
    pub meta: Option<FileMeta>,
}

/// One line of the review listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewItem {
    pub question_id: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub chosen_option_index: Option<usize>,
    pub correct_option_index: usize,
    pub is_correct: bool,
    pub explanation: String,
}

pub struct QuizMachine {
    db: Arc<Database>,
    user_id: String,
    room_id: String,
    max_materials: usize,
    stall_after: Option<Duration>,

    phase: QuizPhase,
    materials: Vec<MaterialEntry>,
    quiz: Option<QuizData>,
    answers: Vec<AnswerRecord>,
    status: CompletionStatus,
    results: Option<Vec<QuizResult>>,
    results_requested: bool,
    waiting_since: Option<Instant>,
    reviewing: bool,
    /// Bumped whenever the room's quiz is replaced. Barrier polls carry the
    /// round they were issued in and are dropped once it has moved on.
    round: u64,
    /// Set once a quiz generated in this mount has been adopted. A load that
    /// resolves after that is older than the generated quiz.
    generated: bool,
}

impl QuizMachine {
    pub fn new(
        db: Arc<Database>,
        user_id: impl Into<String>,
        room_id: impl Into<String>,
        max_materials: usize,
        stall_after: Option<Duration>,
    ) -> Self {
        Self {
            db,
            user_id: user_id.into(),
            room_id: room_id.into(),
            max_materials,
            stall_after,
            phase: QuizPhase::Collecting,
            materials: Vec::new(),
            quiz: None,
            answers: Vec::new(),
            status: CompletionStatus::default(),
            results: None,
            results_requested: false,
            waiting_since: None,
            reviewing: false,
            round: 0,
            generated: false,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn phase(&self) -> &QuizPhase {
        &self.phase
    }

    pub fn quiz(&self) -> Option<&QuizData> {
        self.quiz.as_ref()
    }

    pub fn answers(&self) -> &[AnswerRecord] {
        &self.answers
    }

    pub fn materials(&self) -> &[MaterialEntry] {
        &self.materials
    }

    pub fn status(&self) -> CompletionStatus {
        self.status
    }

    pub fn results(&self) -> Option<&[QuizResult]> {
        self.results.as_deref()
    }

    pub fn is_reviewing(&self) -> bool {
        self.reviewing
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn chosen_option(&self, question_id: &str) -> Option<usize> {
        self.answers
            .iter()
            .find(|a| a.question_id == question_id)
            .map(|a| a.chosen_option_index)
    }

    // -----------------------------------------------------------------------
    // Load / resync
    // -----------------------------------------------------------------------

    /// Adopt the room's quiz on mount and return the answer replays.
    ///
    /// A fetch error falls back to the locally cached quiz so progress stays
    /// visible offline. Local answers that no longer belong to the current
    /// quiz are discarded. Every remaining answer is re-submitted, which
    /// repairs server writes that failed silently before the reload.
    ///
    /// A load can resolve while a generation requested in this mount is in
    /// flight or already done. The fetched quiz is then only a fallback for
    /// a failed generation, and the phase is left alone.
    pub fn load(
        &mut self,
        fetched: Result<Option<QuizData>, ApiError>,
    ) -> Result<Vec<QuizEffect>, QuizError> {
        if self.generated {
            debug!("Quiz load for {} is older than the generated quiz", self.room_id);
            return Ok(Vec::new());
        }
        let cached = self.load_cached_quiz()?;

        let quiz = match fetched {
            Ok(Some(server)) => {
                if cached.as_ref().is_some_and(|c| !same_questions(c, &server)) {
                    info!("Room {} has a new quiz, discarding local answers", self.room_id);
                    self.db.clear_answers(&self.user_id, &self.room_id)?;
                }
                self.cache_quiz(&server)?;
                Some(server)
            }
            Ok(None) => {
                if cached.is_some() {
                    debug!("Room {} has no quiz any more, dropping local copy", self.room_id);
                    self.db.remove_state(&self.cache_key())?;
                    self.db.clear_answers(&self.user_id, &self.room_id)?;
                }
                None
            }
            Err(e) => {
                warn!("Quiz fetch for {} failed, using local copy: {e}", self.room_id);
                cached
            }
        };

        self.quiz = quiz;
        self.answers.clear();
        self.round += 1;
        self.reset_barrier();
        if self.phase == QuizPhase::Generating {
            debug!("Quiz load for {} resolved during generation", self.room_id);
            return Ok(Vec::new());
        }
        if let Some(quiz) = &self.quiz {
            for record in self.db.load_answers(&self.user_id, &self.room_id)? {
                let valid = quiz
                    .question(&record.question_id)
                    .is_some_and(|_| record.chosen_option_index < OPTIONS_PER_QUESTION);
                if valid {
                    self.answers.push(record);
                } else {
                    self.db
                        .delete_answer(&self.user_id, &self.room_id, &record.question_id)?;
                }
            }
        }

        self.phase = self.derived_phase();
        Ok(self
            .answers
            .iter()
            .map(|a| QuizEffect::SubmitAnswer {
                question_id: a.question_id.clone(),
                option_index: a.chosen_option_index,
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Materials
    // -----------------------------------------------------------------------

    /// Validate a material locally and hand out the upload. Duplicates and
    /// overflow are rejected before any call is made.
    pub fn select_material(&mut self, file: MaterialFile) -> Result<QuizEffect, QuizError> {
        if !matches!(self.phase, QuizPhase::Collecting | QuizPhase::Ready) {
            return Err(QuizError::InvalidPhase(self.phase.label()));
        }
        if self.materials.iter().any(|m| m.name == file.name) {
            return Err(QuizError::DuplicateMaterial(file.name));
        }
        if self.materials.len() >= self.max_materials {
            return Err(QuizError::TooManyMaterials {
                max: self.max_materials,
            });
        }
        self.materials.push(MaterialEntry {
            name: file.name.clone(),
            meta: None,
        });
        Ok(QuizEffect::Upload(file))
    }

    /// A failed upload frees its slot so the same file can be picked again.
    pub fn on_upload_result(
        &mut self,
        name: &str,
        result: Result<FileMeta, ApiError>,
    ) -> Result<(), ApiError> {
        match result {
            Ok(meta) => {
                if let Some(entry) = self.materials.iter_mut().find(|m| m.name == name) {
                    entry.meta = Some(meta);
                }
                if self.phase == QuizPhase::Collecting {
                    self.phase = QuizPhase::Ready;
                }
                Ok(())
            }
            Err(e) => {
                self.materials.retain(|m| m.name != name);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Request a fresh quiz. When a quiz already exists the caller must pass
    /// `confirmed`, since local answers for this room are wiped before the
    /// generation request goes out.
    pub fn request_new_quiz(
        &mut self,
        config: QuizConfig,
        confirmed: bool,
    ) -> Result<QuizEffect, QuizError> {
        if self.phase == QuizPhase::Generating {
            return Err(QuizError::InvalidPhase(self.phase.label()));
        }
        if config.question_count == 0 {
            return Err(QuizError::EmptyQuiz);
        }
        if self.quiz.is_some() {
            if !confirmed {
                return Err(QuizError::ConfirmationRequired);
            }
        } else if self.phase != QuizPhase::Ready {
            return Err(QuizError::NoMaterials);
        }

        let cleared = self.db.clear_answers(&self.user_id, &self.room_id)?;
        debug!("Cleared {cleared} local answer(s) for room {}", self.room_id);
        self.answers.clear();
        self.round += 1;
        self.reset_barrier();
        self.reviewing = false;
        self.phase = QuizPhase::Generating;
        Ok(QuizEffect::Generate(config))
    }

    pub fn on_generated(&mut self, result: Result<QuizData, ApiError>) -> Result<(), ApiError> {
        if self.phase != QuizPhase::Generating {
            debug!("Ignoring generation result outside of Generating");
            return Ok(());
        }
        match result {
            Ok(quiz) => {
                info!(
                    "Quiz generated for room {} with {} question(s)",
                    self.room_id,
                    quiz.questions.len()
                );
                if let Err(e) = self.cache_quiz(&quiz) {
                    warn!("Could not cache quiz locally: {e}");
                }
                self.quiz = Some(quiz);
                self.generated = true;
                self.phase = self.derived_phase();
                Ok(())
            }
            Err(e) => {
                self.phase = self.derived_phase();
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Answering
    // -----------------------------------------------------------------------

    /// Record a choice (upsert), persist it, and hand out the server submit.
    pub fn answer(
        &mut self,
        question_id: &str,
        option_index: usize,
    ) -> Result<QuizEffect, QuizError> {
        if self.reviewing {
            return Err(QuizError::InvalidPhase("reviewing"));
        }
        if !matches!(
            self.phase,
            QuizPhase::Active | QuizPhase::PerUserCompleted | QuizPhase::WaitingForAll { .. }
        ) {
            return Err(QuizError::InvalidPhase(self.phase.label()));
        }
        let known = self
            .quiz
            .as_ref()
            .is_some_and(|q| q.question(question_id).is_some());
        if !known {
            return Err(QuizError::UnknownQuestion(question_id.to_string()));
        }
        if option_index >= OPTIONS_PER_QUESTION {
            return Err(QuizError::InvalidOption(option_index));
        }

        let record = AnswerRecord {
            question_id: question_id.to_string(),
            chosen_option_index: option_index,
        };
        self.db.upsert_answer(&self.user_id, &self.room_id, &record)?;
        match self.answers.iter_mut().find(|a| a.question_id == question_id) {
            Some(existing) => existing.chosen_option_index = option_index,
            None => self.answers.push(record),
        }

        if self.phase == QuizPhase::Active && self.locally_complete() {
            info!("All questions answered locally in room {}", self.room_id);
            self.phase = QuizPhase::PerUserCompleted;
        }

        Ok(QuizEffect::SubmitAnswer {
            question_id: question_id.to_string(),
            option_index,
        })
    }

    // -----------------------------------------------------------------------
    // Convergence barrier
    // -----------------------------------------------------------------------

    /// True while the completion endpoint should be polled.
    pub fn needs_completion_poll(&self) -> bool {
        matches!(
            self.phase,
            QuizPhase::PerUserCompleted | QuizPhase::WaitingForAll { .. }
        ) && !self.results_requested
    }

    /// Apply a completion poll issued in `round`. Returns the results fetch
    /// the first time the barrier is seen open.
    pub fn on_completion_status(
        &mut self,
        round: u64,
        result: Result<CompletionStatus, ApiError>,
        now: Instant,
    ) -> Option<QuizEffect> {
        if round != self.round {
            debug!("Dropping completion status from an earlier quiz in {}", self.room_id);
            return None;
        }
        if !self.needs_completion_poll() {
            return None;
        }
        let since = *self.waiting_since.get_or_insert(now);

        match result {
            Ok(status) => self.status = status,
            Err(e) => debug!("Completion poll for {} failed: {e}", self.room_id),
        }

        if self.status.all_completed {
            info!(
                "Barrier open in room {}: {}/{} completed",
                self.room_id, self.status.completed_count, self.status.total_participants
            );
            self.phase = QuizPhase::WaitingForAll {
                status: self.status,
                stalled: false,
            };
            self.results_requested = true;
            return Some(QuizEffect::FetchResults);
        }

        let stalled = self
            .stall_after
            .is_some_and(|limit| now.duration_since(since) >= limit);
        self.phase = QuizPhase::WaitingForAll {
            status: self.status,
            stalled,
        };
        None
    }

    /// Explicit results request. Rejected while the barrier is closed.
    pub fn request_results(&mut self) -> Result<Option<QuizEffect>, QuizError> {
        if !self.status.all_completed {
            return Err(QuizError::BarrierClosed);
        }
        if self.results.is_some() || self.results_requested {
            return Ok(None);
        }
        self.results_requested = true;
        Ok(Some(QuizEffect::FetchResults))
    }

    /// A failed fetch re-arms the barrier poll, which fetches again on the
    /// next tick.
    pub fn on_results(
        &mut self,
        round: u64,
        result: Result<Vec<QuizResult>, ApiError>,
    ) -> Result<(), ApiError> {
        if round != self.round || !self.results_requested {
            return Ok(());
        }
        match result {
            Ok(results) => {
                self.results = Some(results);
                self.phase = QuizPhase::ResultsAvailable;
                Ok(())
            }
            Err(e) => {
                self.results_requested = false;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Review
    // -----------------------------------------------------------------------

    pub fn enter_review(&mut self) -> Result<(), QuizError> {
        match self.phase {
            QuizPhase::PerUserCompleted
            | QuizPhase::WaitingForAll { .. }
            | QuizPhase::ResultsAvailable => {
                self.reviewing = true;
                Ok(())
            }
            _ => Err(QuizError::InvalidPhase(self.phase.label())),
        }
    }

    pub fn exit_review(&mut self) {
        self.reviewing = false;
    }

    /// The user's own answers against the correct ones. Read-only.
    pub fn review_items(&self) -> Vec<ReviewItem> {
        let Some(quiz) = &self.quiz else {
            return Vec::new();
        };
        quiz.questions
            .iter()
            .map(|q| {
                let chosen = self.chosen_option(&q.id);
                ReviewItem {
                    question_id: q.id.clone(),
                    prompt: q.prompt.clone(),
                    options: q.options.to_vec(),
                    chosen_option_index: chosen,
                    correct_option_index: q.correct_option_index,
                    is_correct: chosen == Some(q.correct_option_index),
                    explanation: q.explanation.clone(),
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn locally_complete(&self) -> bool {
        self.quiz.as_ref().is_some_and(|q| {
            !q.questions.is_empty() && self.answers.len() == q.questions.len()
        })
    }

    fn derived_phase(&self) -> QuizPhase {
        match &self.quiz {
            Some(_) if self.locally_complete() => QuizPhase::PerUserCompleted,
            Some(_) => QuizPhase::Active,
            None if self.materials.iter().any(|m| m.meta.is_some()) => QuizPhase::Ready,
            None => QuizPhase::Collecting,
        }
    }

    fn reset_barrier(&mut self) {
        self.status = CompletionStatus::default();
        self.results = None;
        self.results_requested = false;
        self.waiting_since = None;
    }

    fn cache_key(&self) -> String {
        scoped_key("quiz", &self.user_id, &self.room_id)
    }

    fn cache_quiz(&self, quiz: &QuizData) -> Result<(), QuizError> {
        let value = serde_json::to_value(quiz).map_err(|e| QuizError::Store(e.to_string()))?;
        self.db.save_state(&self.cache_key(), &value)?;
        Ok(())
    }

    fn load_cached_quiz(&self) -> Result<Option<QuizData>, QuizError> {
        Ok(self
            .db
            .load_state(&self.cache_key())?
            .and_then(|v| serde_json::from_value(v).ok()))
    }
}

fn same_questions(a: &QuizData, b: &QuizData) -> bool {
    a.questions.len() == b.questions.len()
        && a.questions.iter().zip(&b.questions).all(|(x, y)| x.id == y.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use studyroom_core::protocol::{Difficulty, QuizQuestion};

    fn question(id: &str, correct: usize) -> QuizQuestion {
        QuizQuestion {
            id: id.into(),
            prompt: format!("prompt {id}"),
            options: ["a".into(), "b".into(), "c".into(), "d".into()],
            correct_option_index: correct,
            explanation: String::new(),
        }
    }

    fn quiz(n: usize) -> QuizData {
        QuizData {
            questions: (0..n).map(|i| question(&format!("q{i}"), i % 4)).collect(),
        }
    }

    fn config(n: u32) -> QuizConfig {
        QuizConfig {
            question_count: n,
            difficulty: Difficulty::Medium,
        }
    }

    fn file(name: &str) -> MaterialFile {
        MaterialFile {
            name: name.into(),
            bytes: vec![1, 2, 3],
        }
    }

    fn meta(name: &str) -> FileMeta {
        FileMeta {
            file_id: format!("f-{name}"),
            file_name: name.into(),
            size_bytes: 3,
        }
    }

    fn machine(db: Arc<Database>) -> QuizMachine {
        QuizMachine::new(db, "u1", "r1", 2, None)
    }

    fn active_machine(n: usize) -> (QuizMachine, Arc<Database>) {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let mut m = machine(db.clone());
        m.load(Ok(Some(quiz(n)))).unwrap();
        (m, db)
    }

    fn status(done: u32, total: u32) -> CompletionStatus {
        CompletionStatus {
            completed_count: done,
            total_participants: total,
            all_completed: done == total,
        }
    }

    #[test]
    fn duplicate_and_overflow_materials_rejected_before_upload() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let mut m = machine(db);

        assert!(matches!(m.select_material(file("a.pdf")), Ok(QuizEffect::Upload(_))));
        assert_eq!(
            m.select_material(file("a.pdf")),
            Err(QuizError::DuplicateMaterial("a.pdf".into()))
        );
        m.select_material(file("b.pdf")).unwrap();
        assert_eq!(
            m.select_material(file("c.pdf")),
            Err(QuizError::TooManyMaterials { max: 2 })
        );
    }

    #[test]
    fn failed_upload_frees_slot() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let mut m = machine(db);
        m.select_material(file("a.pdf")).unwrap();
        assert!(m
            .on_upload_result("a.pdf", Err(ApiError::Transport("x".into())))
            .is_err());
        assert!(m.materials().is_empty());
        assert_eq!(m.phase(), &QuizPhase::Collecting);
        assert!(m.select_material(file("a.pdf")).is_ok());
    }

    #[test]
    fn upload_then_generate_reaches_active() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let mut m = machine(db);

        assert_eq!(m.request_new_quiz(config(3), false), Err(QuizError::NoMaterials));

        m.select_material(file("a.pdf")).unwrap();
        m.on_upload_result("a.pdf", Ok(meta("a.pdf"))).unwrap();
        assert_eq!(m.phase(), &QuizPhase::Ready);

        assert_eq!(
            m.request_new_quiz(config(3), false).unwrap(),
            QuizEffect::Generate(config(3))
        );
        assert_eq!(m.phase(), &QuizPhase::Generating);
        m.on_generated(Ok(quiz(3))).unwrap();
        assert_eq!(m.phase(), &QuizPhase::Active);
    }

    #[test]
    fn failed_generation_returns_to_ready() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let mut m = machine(db);
        m.select_material(file("a.pdf")).unwrap();
        m.on_upload_result("a.pdf", Ok(meta("a.pdf"))).unwrap();
        m.request_new_quiz(config(3), false).unwrap();
        let failed = Err(ApiError::Status {
            status: 502,
            body: String::new(),
        });
        assert!(m.on_generated(failed).is_err());
        assert_eq!(m.phase(), &QuizPhase::Ready);
    }

    #[test]
    fn new_quiz_requires_confirmation_and_clears_answers() {
        let (mut m, db) = active_machine(3);
        m.answer("q0", 1).unwrap();

        assert_eq!(
            m.request_new_quiz(config(5), false),
            Err(QuizError::ConfirmationRequired)
        );
        assert_eq!(db.load_answers("u1", "r1").unwrap().len(), 1);

        m.request_new_quiz(config(5), true).unwrap();
        assert!(m.answers().is_empty());
        assert!(db.load_answers("u1", "r1").unwrap().is_empty());
    }

    #[test]
    fn answer_upsert_keeps_one_record_with_latest_choice() {
        let (mut m, db) = active_machine(3);
        m.answer("q1", 0).unwrap();
        let effect = m.answer("q1", 2).unwrap();

        assert_eq!(
            effect,
            QuizEffect::SubmitAnswer {
                question_id: "q1".into(),
                option_index: 2
            }
        );
        assert_eq!(m.answers().len(), 1);
        assert_eq!(m.chosen_option("q1"), Some(2));
        assert_eq!(
            db.load_answers("u1", "r1").unwrap(),
            vec![AnswerRecord {
                question_id: "q1".into(),
                chosen_option_index: 2
            }]
        );
    }

    #[test]
    fn answer_validation() {
        let (mut m, _db) = active_machine(2);
        assert_eq!(
            m.answer("nope", 0),
            Err(QuizError::UnknownQuestion("nope".into()))
        );
        assert_eq!(m.answer("q0", 4), Err(QuizError::InvalidOption(4)));
    }

    #[test]
    fn answering_every_question_completes_locally() {
        let (mut m, _db) = active_machine(2);
        m.answer("q0", 0).unwrap();
        assert_eq!(m.phase(), &QuizPhase::Active);
        assert!(!m.needs_completion_poll());
        m.answer("q1", 0).unwrap();
        assert_eq!(m.phase(), &QuizPhase::PerUserCompleted);
        assert!(m.needs_completion_poll());
    }

    #[test]
    fn reload_replays_persisted_answers_and_drops_stale_ones() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        {
            let mut first = machine(db.clone());
            first.load(Ok(Some(quiz(3)))).unwrap();
            first.answer("q0", 1).unwrap();
            first.answer("q2", 3).unwrap();
        }
        // A record for a question this quiz doesn't have.
        db.upsert_answer(
            "u1",
            "r1",
            &AnswerRecord {
                question_id: "old".into(),
                chosen_option_index: 0,
            },
        )
        .unwrap();

        let mut reloaded = machine(db.clone());
        let replays = reloaded.load(Ok(Some(quiz(3)))).unwrap();
        assert_eq!(
            replays,
            vec![
                QuizEffect::SubmitAnswer {
                    question_id: "q0".into(),
                    option_index: 1
                },
                QuizEffect::SubmitAnswer {
                    question_id: "q2".into(),
                    option_index: 3
                },
            ]
        );
        assert_eq!(reloaded.phase(), &QuizPhase::Active);
        assert_eq!(db.load_answers("u1", "r1").unwrap().len(), 2);
    }

    #[test]
    fn offline_reload_uses_cached_quiz() {
        let (mut m, db) = active_machine(2);
        m.answer("q0", 1).unwrap();

        let mut reloaded = machine(db);
        let replays = reloaded
            .load(Err(ApiError::Transport("offline".into())))
            .unwrap();
        assert_eq!(replays.len(), 1);
        assert_eq!(reloaded.quiz().map(|q| q.questions.len()), Some(2));
    }

    #[test]
    fn different_server_quiz_discards_local_answers() {
        let (mut m, db) = active_machine(2);
        m.answer("q0", 1).unwrap();

        let replacement = QuizData {
            questions: vec![question("n0", 0), question("n1", 1)],
        };
        let mut reloaded = machine(db.clone());
        assert!(reloaded.load(Ok(Some(replacement))).unwrap().is_empty());
        assert!(db.load_answers("u1", "r1").unwrap().is_empty());
    }

    #[test]
    fn results_unreachable_until_barrier_opens() {
        let (mut m, _db) = active_machine(1);
        m.answer("q0", 0).unwrap();
        let t = Instant::now();

        assert_eq!(m.request_results(), Err(QuizError::BarrierClosed));
        assert_eq!(m.on_completion_status(m.round(), Ok(status(2, 3)), t), None);
        assert_eq!(
            m.phase(),
            &QuizPhase::WaitingForAll {
                status: status(2, 3),
                stalled: false
            }
        );
        assert_eq!(m.request_results(), Err(QuizError::BarrierClosed));

        assert_eq!(
            m.on_completion_status(m.round(), Ok(status(3, 3)), t + Duration::from_secs(2)),
            Some(QuizEffect::FetchResults)
        );
        // Fetched once only.
        assert!(!m.needs_completion_poll());
        assert_eq!(m.request_results(), Ok(None));

        m.on_results(m.round(), Ok(vec![])).unwrap();
        assert_eq!(m.phase(), &QuizPhase::ResultsAvailable);
    }

    #[test]
    fn failed_results_fetch_rearms_poll() {
        let (mut m, _db) = active_machine(1);
        m.answer("q0", 0).unwrap();
        let t = Instant::now();
        m.on_completion_status(m.round(), Ok(status(1, 1)), t);
        assert!(m.on_results(m.round(), Err(ApiError::Transport("x".into()))).is_err());
        assert!(m.needs_completion_poll());
        assert_eq!(
            m.on_completion_status(m.round(), Ok(status(1, 1)), t),
            Some(QuizEffect::FetchResults)
        );
    }

    #[test]
    fn long_wait_is_flagged_stalled_without_results() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let mut m = QuizMachine::new(db, "u1", "r1", 2, Some(Duration::from_secs(30)));
        m.load(Ok(Some(quiz(1)))).unwrap();
        m.answer("q0", 0).unwrap();

        let t = Instant::now();
        m.on_completion_status(m.round(), Ok(status(1, 2)), t);
        m.on_completion_status(m.round(), Ok(status(1, 2)), t + Duration::from_secs(31));
        assert_eq!(
            m.phase(),
            &QuizPhase::WaitingForAll {
                status: status(1, 2),
                stalled: true
            }
        );
        assert!(m.results().is_none());
        assert_eq!(m.request_results(), Err(QuizError::BarrierClosed));
    }

    #[test]
    fn review_lists_answers_and_blocks_answering() {
        let (mut m, _db) = active_machine(2);
        assert!(m.enter_review().is_err());
        m.answer("q0", 0).unwrap(); // correct (q0 -> 0)
        m.answer("q1", 3).unwrap(); // wrong (q1 -> 1)
        m.enter_review().unwrap();

        let items = m.review_items();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_correct);
        assert!(!items[1].is_correct);
        assert_eq!(items[1].chosen_option_index, Some(3));

        assert_eq!(m.answer("q1", 1), Err(QuizError::InvalidPhase("reviewing")));
        m.exit_review();
        assert!(m.answer("q1", 1).is_ok());
    }

    fn generating_machine(db: Arc<Database>) -> QuizMachine {
        let mut m = machine(db);
        m.select_material(file("a.pdf")).unwrap();
        m.on_upload_result("a.pdf", Ok(meta("a.pdf"))).unwrap();
        m.request_new_quiz(config(3), false).unwrap();
        m
    }

    #[test]
    fn load_during_generation_keeps_waiting_for_the_new_quiz() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let mut m = generating_machine(db);

        assert!(m.load(Ok(None)).unwrap().is_empty());
        assert_eq!(m.phase(), &QuizPhase::Generating);
        assert_eq!(m.materials().len(), 1);

        m.on_generated(Ok(quiz(3))).unwrap();
        assert_eq!(m.phase(), &QuizPhase::Active);
        assert_eq!(m.quiz().map(|q| q.questions.len()), Some(3));
    }

    #[test]
    fn failed_generation_falls_back_to_the_loaded_quiz() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let mut m = generating_machine(db);

        m.load(Ok(Some(quiz(2)))).unwrap();
        assert_eq!(m.phase(), &QuizPhase::Generating);

        assert!(m.on_generated(Err(ApiError::Transport("x".into()))).is_err());
        assert_eq!(m.phase(), &QuizPhase::Active);
        assert_eq!(m.quiz().map(|q| q.questions.len()), Some(2));
    }

    #[test]
    fn load_after_generation_does_not_replace_the_generated_quiz() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let mut m = generating_machine(db.clone());
        m.on_generated(Ok(quiz(3))).unwrap();

        assert!(m.load(Ok(None)).unwrap().is_empty());
        assert_eq!(m.phase(), &QuizPhase::Active);
        assert_eq!(m.quiz().map(|q| q.questions.len()), Some(3));

        let reloaded = machine(db).load_cached_quiz().unwrap();
        assert_eq!(reloaded.map(|q| q.questions.len()), Some(3));
    }

    #[test]
    fn completion_status_from_the_previous_quiz_is_dropped() {
        let (mut m, _db) = active_machine(1);
        m.answer("q0", 0).unwrap();
        let previous = m.round();
        let t = Instant::now();

        m.request_new_quiz(config(1), true).unwrap();
        m.on_generated(Ok(QuizData {
            questions: vec![question("n0", 2)],
        }))
        .unwrap();
        m.answer("n0", 1).unwrap();
        assert_eq!(m.phase(), &QuizPhase::PerUserCompleted);

        assert_eq!(m.on_completion_status(previous, Ok(status(1, 1)), t), None);
        assert_eq!(m.phase(), &QuizPhase::PerUserCompleted);
        assert_eq!(m.request_results(), Err(QuizError::BarrierClosed));
        m.on_results(previous, Ok(vec![])).unwrap();
        assert!(m.results().is_none());

        assert_eq!(
            m.on_completion_status(m.round(), Ok(status(1, 1)), t),
            Some(QuizEffect::FetchResults)
        );
    }
}
