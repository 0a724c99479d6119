// Room Orchestrator.
//
// One `run` call is one room mount. A single `tokio::select!` loop owns the
// presence session, the message log and channel, and the quiz machine; all
// state is mutated here and nowhere else. Network calls run in spawned tasks
// that report back through `TaskResult`. Once the mount is torn down a
// shared cancelled flag stops late results from being delivered.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use studyroom_core::channel::{ChannelConnector, ChannelEvent, ChannelLink};
use studyroom_core::clock::Clock;
use studyroom_core::config::Config;
use studyroom_core::db::Database;
use studyroom_core::protocol::{
    CompletionStatus, FileMeta, InboundFrame, JoinOutcome, OutboundFrame, PresenceEntry,
    QuizData, QuizResult, TimerState,
};

use crate::api::{ApiError, PresenceApi, QuizApi};
use crate::chat::{Backoff, ChannelState, MessageLog, Reconcile, ScrollTracker};
use crate::presence::{JoinStep, PresenceSession};
use crate::quiz::{QuizEffect, QuizMachine};
use crate::timer::{SharedTimer, StopSummary, TickOutcome, TimerError, TimerSnapshot};
use crate::view::{Notice, RoomCommand, RoomView, UiUpdate};

/// Capacity of the internal task-result channel.
const TASK_CAPACITY: usize = 256;

/// Collaborators a room mount needs.
#[derive(Clone)]
pub struct RoomDeps {
    pub config: Config,
    pub db: Arc<Database>,
    pub presence_api: Arc<dyn PresenceApi>,
    pub quiz_api: Arc<dyn QuizApi>,
    pub connector: Arc<dyn ChannelConnector>,
    pub timer: SharedTimer,
    pub clock: Arc<dyn Clock>,
}

/// How a mount ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomExit {
    /// Navigated away. Presence and the timer are left as they were.
    Unmounted,
    /// Explicit leave. Presence removed, timer stopped.
    Left,
}

/// Outcomes of spawned work, applied by the loop.
enum TaskResult {
    Join(Result<JoinOutcome, ApiError>),
    Presence(Result<Vec<PresenceEntry>, ApiError>),
    ChannelConnected(anyhow::Result<ChannelLink>),
    QuizLoaded(Result<Option<QuizData>, ApiError>),
    Uploaded {
        name: String,
        result: Result<FileMeta, ApiError>,
    },
    Generated(Result<QuizData, ApiError>),
    Submitted {
        question_id: String,
        result: Result<(), ApiError>,
    },
    Completion {
        round: u64,
        result: Result<CompletionStatus, ApiError>,
    },
    Results {
        round: u64,
        result: Result<Vec<QuizResult>, ApiError>,
    },
    TimerStarted {
        subject_id: String,
        result: Result<TimerState, TimerError>,
    },
    TimerStopped(Result<Option<StopSummary>, TimerError>),
    TimerTicked {
        epoch: u64,
        result: Result<TickOutcome, TimerError>,
    },
}

/// Spawns collaborator calls and routes their results back to the loop,
/// unless the mount has been torn down in the meantime.
#[derive(Clone)]
struct TaskSink {
    tx: mpsc::Sender<TaskResult>,
    cancelled: Arc<AtomicBool>,
}

impl TaskSink {
    fn spawn<F>(&self, work: F)
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let result = work.await;
            if sink.cancelled.load(Ordering::SeqCst) {
                debug!("Discarding task result that resolved after teardown");
                return;
            }
            let _ = sink.tx.send(result).await;
        });
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// The timer as the view shows it. Every applied start or stop opens a new
/// epoch; a tick spawned in an earlier epoch may have read the engine before
/// that start or stop, so its snapshot is dropped.
#[derive(Debug, Default)]
struct TimerDisplay {
    snapshot: Option<TimerSnapshot>,
    epoch: u64,
}

impl TimerDisplay {
    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn started(&mut self, snapshot: TimerSnapshot) {
        self.epoch += 1;
        self.snapshot = Some(snapshot);
    }

    fn stopped(&mut self) {
        self.epoch += 1;
        self.snapshot = None;
    }

    /// Apply a tick spawned during `epoch`. A completed target is always
    /// applied, since the engine really did stop; its summary is returned.
    fn apply_tick(&mut self, epoch: u64, outcome: TickOutcome) -> Option<StopSummary> {
        match outcome {
            TickOutcome::Completed(summary) => {
                self.stopped();
                Some(summary)
            }
            _ if epoch != self.epoch => {
                debug!("Dropping timer tick from epoch {epoch} (now {})", self.epoch);
                None
            }
            TickOutcome::Running(snapshot) => {
                self.snapshot = Some(snapshot);
                None
            }
            TickOutcome::Idle => {
                self.snapshot = None;
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Mount `room_id` and run until the user navigates away, leaves, or the
/// command channel closes.
pub async fn run(
    room_id: &str,
    deps: RoomDeps,
    mut cmd_rx: mpsc::Receiver<RoomCommand>,
    ui_tx: mpsc::Sender<UiUpdate>,
) -> anyhow::Result<RoomExit> {
    info!("Mounting room {room_id}");

    let (task_tx, mut task_rx) = mpsc::channel(TASK_CAPACITY);
    let sink = TaskSink {
        tx: task_tx,
        cancelled: Arc::new(AtomicBool::new(false)),
    };

    let mut presence_interval = tokio::time::interval(deps.config.presence.poll_interval());
    let mut completion_interval =
        tokio::time::interval(deps.config.quiz.completion_poll_interval());
    let mut timer_interval = tokio::time::interval(deps.config.timer.tick_interval());
    // The first tick of an interval completes immediately; consume it so the
    // first real poll happens one full interval after mount.
    presence_interval.tick().await;
    completion_interval.tick().await;

    let mut state = RoomState::new(room_id, deps, sink.clone());
    if state.presence.begin_join() {
        state.spawn_join();
    }
    state.publish(&ui_tx).await;

    let exit = loop {
        tokio::select! {
            // --- User commands ---
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RoomCommand::Unmount) | None => break RoomExit::Unmounted,
                    Some(RoomCommand::Leave) => {
                        state.leave(&ui_tx).await;
                        break RoomExit::Left;
                    }
                    Some(cmd) => state.handle_command(cmd, &ui_tx).await,
                }
            }

            // --- Results of spawned collaborator calls ---
            Some(result) = task_rx.recv() => {
                state.handle_task_result(result, &ui_tx).await;
            }

            // --- Chat channel (pending while there is no link) ---
            event = next_channel_event(&mut state.inbound) => {
                state.on_channel_event(event, &ui_tx).await;
            }

            // --- Deadlines: join retry and channel reconnect ---
            _ = sleep_until_deadline(state.join_retry_at) => {
                state.join_retry_at = None;
                if state.presence.begin_retry() {
                    state.spawn_join();
                }
            }
            _ = sleep_until_deadline(state.reconnect_at) => {
                state.reconnect_at = None;
                state.spawn_connect();
            }

            // --- Polling ---
            _ = presence_interval.tick() => {
                if state.presence.should_poll() {
                    state.spawn_presence_poll();
                }
                continue;
            }
            _ = completion_interval.tick() => {
                if state.presence.is_joined() && state.quiz.needs_completion_poll() {
                    state.spawn_completion_poll();
                }
                continue;
            }
            _ = timer_interval.tick() => {
                state.spawn_timer_tick();
                continue;
            }
        }

        state.publish(&ui_tx).await;
    };

    state.teardown();
    state.publish(&ui_tx).await;
    info!("Room {room_id} closed ({exit:?})");
    Ok(exit)
}

async fn next_channel_event(
    inbound: &mut Option<mpsc::Receiver<ChannelEvent>>,
) -> Option<ChannelEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn notify(ui_tx: &mpsc::Sender<UiUpdate>, notice: Notice) {
    let _ = ui_tx.send(UiUpdate::Notice(notice)).await;
}

// ---------------------------------------------------------------------------
// Room state
// ---------------------------------------------------------------------------

struct RoomState {
    room_id: String,
    deps: RoomDeps,
    sink: TaskSink,

    presence: PresenceSession,
    join_retry_at: Option<Instant>,

    log: MessageLog,
    scroll: ScrollTracker,
    channel_state: ChannelState,
    outbound: Option<mpsc::Sender<String>>,
    inbound: Option<mpsc::Receiver<ChannelEvent>>,
    ever_opened: bool,
    backoff: Backoff,
    reconnect_at: Option<Instant>,

    quiz: QuizMachine,
    quiz_loaded: bool,
    timer_display: TimerDisplay,
}

impl RoomState {
    fn new(room_id: &str, deps: RoomDeps, sink: TaskSink) -> Self {
        let config = &deps.config;
        Self {
            room_id: room_id.to_string(),
            presence: PresenceSession::new(room_id, config.presence.join_retry_delay()),
            join_retry_at: None,
            log: MessageLog::new(
                room_id,
                config.user.user_id.clone(),
                config.user.display_name.clone(),
            ),
            scroll: ScrollTracker::new(config.chat.autoscroll_threshold_px),
            channel_state: ChannelState::Connecting,
            outbound: None,
            inbound: None,
            ever_opened: false,
            backoff: Backoff::new(config.chat.reconnect_initial(), config.chat.reconnect_max()),
            reconnect_at: None,
            quiz: QuizMachine::new(
                deps.db.clone(),
                config.user.user_id.clone(),
                room_id,
                config.quiz.max_materials,
                config.quiz.barrier_stall(),
            ),
            quiz_loaded: false,
            timer_display: TimerDisplay::default(),
            sink,
            deps,
        }
    }

    fn view(&self) -> RoomView {
        RoomView {
            room_id: self.room_id.clone(),
            presence: self.presence.phase().clone(),
            members: self.presence.members().to_vec(),
            channel: self.channel_state,
            messages: self.log.messages().to_vec(),
            autoscroll: self.scroll.should_autoscroll(),
            quiz_phase: self.quiz.phase().clone(),
            reviewing: self.quiz.is_reviewing(),
            materials: self.quiz.materials().to_vec(),
            question_count: self.quiz.quiz().map_or(0, |q| q.questions.len()),
            answered_count: self.quiz.answers().len(),
            completion: self.quiz.status(),
            results: self.quiz.results().map(|r| r.to_vec()),
            review: if self.quiz.is_reviewing() {
                self.quiz.review_items()
            } else {
                Vec::new()
            },
            timer: self.timer_display.snapshot.clone(),
        }
    }

    async fn publish(&self, ui_tx: &mpsc::Sender<UiUpdate>) {
        let _ = ui_tx.send(UiUpdate::View(Box::new(self.view()))).await;
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: RoomCommand, ui_tx: &mpsc::Sender<UiUpdate>) {
        match cmd {
            RoomCommand::SendMessage(content) => {
                let content = content.trim();
                if content.is_empty() {
                    return;
                }
                let (key, frame) = self.log.send(content, self.deps.clock.now());
                self.dispatch_send(&key, &frame, ui_tx).await;
            }
            RoomCommand::RetryMessage(key) => match self.log.retry(&key) {
                Some(frame) => self.dispatch_send(&key, &frame, ui_tx).await,
                None => {
                    let text = "That message is not waiting for a retry.";
                    notify(ui_tx, Notice::info(text)).await
                }
            },
            RoomCommand::Scrolled {
                distance_from_bottom_px,
            } => self.scroll.on_scroll(distance_from_bottom_px),

            RoomCommand::UploadMaterial(file) => {
                if !self.require_joined(ui_tx).await {
                    return;
                }
                match self.quiz.select_material(file) {
                    Ok(effect) => self.spawn_quiz_effect(effect),
                    Err(e) => notify(ui_tx, Notice::error(e.to_string())).await,
                }
            }
            RoomCommand::GenerateQuiz { config, confirmed } => {
                if !self.require_joined(ui_tx).await {
                    return;
                }
                match self.quiz.request_new_quiz(config, confirmed) {
                    Ok(effect) => self.spawn_quiz_effect(effect),
                    Err(e) => notify(ui_tx, Notice::error(e.to_string())).await,
                }
            }
            RoomCommand::Answer {
                question_id,
                option_index,
            } => {
                if !self.require_joined(ui_tx).await {
                    return;
                }
                match self.quiz.answer(&question_id, option_index) {
                    Ok(effect) => self.spawn_quiz_effect(effect),
                    Err(e) => notify(ui_tx, Notice::error(e.to_string())).await,
                }
            }
            RoomCommand::RequestResults => match self.quiz.request_results() {
                Ok(Some(effect)) => self.spawn_quiz_effect(effect),
                Ok(None) => {}
                Err(e) => notify(ui_tx, Notice::info(e.to_string())).await,
            },
            RoomCommand::EnterReview => {
                if let Err(e) = self.quiz.enter_review() {
                    notify(ui_tx, Notice::info(e.to_string())).await;
                }
            }
            RoomCommand::ExitReview => self.quiz.exit_review(),

            RoomCommand::StartTimer(subject_id) => {
                let timer = self.deps.timer.clone();
                self.sink.spawn(async move {
                    let result = timer.lock().await.start(&subject_id).await;
                    TaskResult::TimerStarted { subject_id, result }
                });
            }
            RoomCommand::StopTimer => {
                let timer = self.deps.timer.clone();
                self.sink.spawn(async move {
                    TaskResult::TimerStopped(timer.lock().await.stop().await)
                });
            }
            RoomCommand::SetTimerTarget(target) => {
                let timer = self.deps.timer.clone();
                tokio::spawn(async move { timer.lock().await.set_target(target) });
            }

            // Handled by the loop itself.
            RoomCommand::Leave | RoomCommand::Unmount => {}
        }
    }

    async fn require_joined(&self, ui_tx: &mpsc::Sender<UiUpdate>) -> bool {
        if self.presence.is_joined() {
            return true;
        }
        notify(ui_tx, Notice::warning("You have not joined this room yet.")).await;
        false
    }

    /// Route an outgoing chat frame according to the channel state. While a
    /// (re)connect is underway the message stays pending and goes out on the
    /// next open; with no channel at all it is marked failed.
    async fn dispatch_send(
        &mut self,
        key: &str,
        frame: &OutboundFrame,
        ui_tx: &mpsc::Sender<UiUpdate>,
    ) {
        let delivered = match self.channel_state {
            ChannelState::Open => self.write_frame(frame),
            ChannelState::Connecting | ChannelState::Reconnecting { .. } => {
                debug!("Message {key} queued until the channel opens");
                return;
            }
            ChannelState::Closed | ChannelState::Unavailable => false,
        };
        if !delivered {
            self.log.mark_failed(key);
            warn!("Message {key} could not be sent in room {}", self.room_id);
            notify(ui_tx, Notice::error("Message could not be sent. You can retry it.")).await;
        }
    }

    // -----------------------------------------------------------------------
    // Spawned work
    // -----------------------------------------------------------------------

    fn spawn_join(&self) {
        let api = self.deps.presence_api.clone();
        let room_id = self.room_id.clone();
        self.sink
            .spawn(async move { TaskResult::Join(api.join_room(&room_id).await) });
    }

    fn spawn_presence_poll(&self) {
        let api = self.deps.presence_api.clone();
        let room_id = self.room_id.clone();
        self.sink
            .spawn(async move { TaskResult::Presence(api.poll_presence(&room_id).await) });
    }

    fn spawn_connect(&mut self) {
        if !self.ever_opened {
            self.channel_state = ChannelState::Connecting;
        }
        let connector = self.deps.connector.clone();
        let room_id = self.room_id.clone();
        self.sink.spawn(async move {
            TaskResult::ChannelConnected(connector.connect(&room_id).await)
        });
    }

    fn spawn_quiz_load(&self) {
        let api = self.deps.quiz_api.clone();
        let room_id = self.room_id.clone();
        self.sink
            .spawn(async move { TaskResult::QuizLoaded(api.fetch_quiz(&room_id).await) });
    }

    fn spawn_completion_poll(&self) {
        let api = self.deps.quiz_api.clone();
        let room_id = self.room_id.clone();
        let round = self.quiz.round();
        self.sink.spawn(async move {
            TaskResult::Completion {
                round,
                result: api.completion_status(&room_id).await,
            }
        });
    }

    /// Ticks are skipped while the engine is busy (a start or stop holding
    /// the lock), so they never queue up behind a slow collaborator.
    fn spawn_timer_tick(&self) {
        let Ok(mut engine) = self.deps.timer.clone().try_lock_owned() else {
            return;
        };
        let epoch = self.timer_display.epoch();
        self.sink.spawn(async move {
            TaskResult::TimerTicked {
                epoch,
                result: engine.tick().await,
            }
        });
    }

    fn spawn_quiz_effect(&self, effect: QuizEffect) {
        let api = self.deps.quiz_api.clone();
        let room_id = self.room_id.clone();
        match effect {
            QuizEffect::Upload(file) => self.sink.spawn(async move {
                let result = api.upload_material(&room_id, &file).await;
                TaskResult::Uploaded {
                    name: file.name,
                    result,
                }
            }),
            QuizEffect::Generate(config) => self.sink.spawn(async move {
                TaskResult::Generated(api.generate_quiz(&room_id, config).await)
            }),
            QuizEffect::SubmitAnswer {
                question_id,
                option_index,
            } => self.sink.spawn(async move {
                let result = api.submit_answer(&room_id, &question_id, option_index).await;
                TaskResult::Submitted {
                    question_id,
                    result,
                }
            }),
            QuizEffect::FetchResults => {
                let round = self.quiz.round();
                self.sink.spawn(async move {
                    TaskResult::Results {
                        round,
                        result: api.results(&room_id).await,
                    }
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Task results
    // -----------------------------------------------------------------------

    async fn handle_task_result(&mut self, result: TaskResult, ui_tx: &mpsc::Sender<UiUpdate>) {
        match result {
            TaskResult::Join(result) => self.on_join(result, ui_tx).await,
            TaskResult::Presence(result) => self.presence.apply_poll(result),
            TaskResult::ChannelConnected(result) => self.on_connected(result, ui_tx).await,
            TaskResult::QuizLoaded(result) => match self.quiz.load(result) {
                Ok(replays) => {
                    self.quiz_loaded = true;
                    if !replays.is_empty() {
                        info!(
                            "Replaying {} local answer(s) in room {}",
                            replays.len(),
                            self.room_id
                        );
                    }
                    for effect in replays {
                        self.spawn_quiz_effect(effect);
                    }
                }
                Err(e) => {
                    warn!("Quiz state for room {} could not be loaded: {e}", self.room_id);
                    notify(ui_tx, Notice::error(format!("Quiz progress unavailable: {e}"))).await;
                }
            },
            TaskResult::Uploaded { name, result } => {
                if let Err(e) = self.quiz.on_upload_result(&name, result) {
                    warn!("Upload of {name} failed: {e}");
                    notify(ui_tx, Notice::error(format!("Upload of {name} failed: {e}"))).await;
                }
            }
            TaskResult::Generated(result) => {
                if let Err(e) = self.quiz.on_generated(result) {
                    warn!("Quiz generation failed in room {}: {e}", self.room_id);
                    notify(ui_tx, Notice::error(format!("Quiz generation failed: {e}"))).await;
                }
            }
            TaskResult::Submitted {
                question_id,
                result,
            } => {
                // Fire-and-forget. The next reload replays local answers.
                if let Err(e) = result {
                    debug!("Answer submit for {question_id} failed: {e}");
                }
            }
            TaskResult::Completion { round, result } => {
                let now = Instant::now();
                if let Some(effect) = self.quiz.on_completion_status(round, result, now) {
                    self.spawn_quiz_effect(effect);
                }
            }
            TaskResult::Results { round, result } => {
                if let Err(e) = self.quiz.on_results(round, result) {
                    debug!(
                        "Results fetch for {} failed, retrying on next poll: {e}",
                        self.room_id
                    );
                }
            }
            TaskResult::TimerStarted { subject_id, result } => match result {
                Ok(state) => self.timer_display.started(TimerSnapshot {
                    elapsed_seconds: state.elapsed_seconds(self.deps.clock.now()),
                    subject_id: state.subject_id,
                }),
                Err(e) => {
                    warn!("Timer start for {subject_id} failed: {e}");
                    notify(ui_tx, Notice::error(format!("Could not start timer: {e}"))).await;
                }
            },
            TaskResult::TimerStopped(result) => {
                // The engine clears its record before calling out, so even a
                // failed stop leaves no timer running.
                self.timer_display.stopped();
                match result {
                    Ok(Some(summary)) => notify_stopped(&summary, ui_tx).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Timer stop failed: {e}");
                        let text = format!("Could not record study time: {e}");
                        notify(ui_tx, Notice::error(text)).await;
                    }
                }
            }
            TaskResult::TimerTicked { epoch, result } => match result {
                Ok(outcome) => {
                    if let Some(summary) = self.timer_display.apply_tick(epoch, outcome) {
                        notify_stopped(&summary, ui_tx).await;
                        let _ = ui_tx.send(UiUpdate::TimerCompleted(summary)).await;
                    }
                }
                Err(e) => debug!("Timer tick failed: {e}"),
            },
        }
    }

    async fn on_join(
        &mut self,
        result: Result<JoinOutcome, ApiError>,
        ui_tx: &mpsc::Sender<UiUpdate>,
    ) {
        match self.presence.on_join_result(result) {
            JoinStep::Joined => {
                if self.quiz_loaded || self.inbound.is_some() {
                    return;
                }
                // Membership is confirmed; now open everything that relies on it.
                self.spawn_presence_poll();
                self.spawn_connect();
                self.spawn_quiz_load();
            }
            JoinStep::RetryAfter(delay) => {
                self.join_retry_at = Some(Instant::now() + delay);
            }
            JoinStep::Blocked => {
                self.channel_state = ChannelState::Closed;
                notify(
                    ui_tx,
                    Notice::error("You could not be admitted to this room. Leave and try again."),
                )
                .await;
                // No channel will ever open for this mount.
                self.fail_pending(ui_tx).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Channel
    // -----------------------------------------------------------------------

    async fn on_connected(
        &mut self,
        result: anyhow::Result<ChannelLink>,
        ui_tx: &mpsc::Sender<UiUpdate>,
    ) {
        match result {
            Ok(link) => {
                self.outbound = Some(link.outbound);
                self.inbound = Some(link.inbound);
            }
            Err(e) if self.ever_opened => {
                debug!("Reconnect to room {} failed: {e:#}", self.room_id);
                self.schedule_reconnect();
            }
            Err(e) => {
                warn!("Chat channel for room {} unavailable: {e:#}", self.room_id);
                self.channel_state = ChannelState::Unavailable;
                notify(ui_tx, Notice::warning("Chat is unavailable in this room.")).await;
                self.fail_pending(ui_tx).await;
            }
        }
    }

    /// Mark every message still waiting for a channel as failed, so it can
    /// be retried instead of showing as sending forever.
    async fn fail_pending(&mut self, ui_tx: &mpsc::Sender<UiUpdate>) {
        let mut failed = 0;
        for frame in self.log.pending_frames() {
            if let OutboundFrame::Send {
                idempotency_key, ..
            } = frame
            {
                self.log.mark_failed(&idempotency_key);
                failed += 1;
            }
        }
        if failed > 0 {
            warn!("{failed} pending message(s) failed in room {}", self.room_id);
            notify(ui_tx, Notice::error("Message could not be sent. You can retry it.")).await;
        }
    }

    async fn on_channel_event(
        &mut self,
        event: Option<ChannelEvent>,
        ui_tx: &mpsc::Sender<UiUpdate>,
    ) {
        match event {
            Some(ChannelEvent::Opened) => {
                info!("Chat channel open for room {}", self.room_id);
                self.channel_state = ChannelState::Open;
                self.ever_opened = true;
                self.backoff.reset();
                self.write_frame(&self.log.join_frame());
                let pending = self.log.pending_frames();
                if !pending.is_empty() {
                    debug!("Re-sending {} pending message(s)", pending.len());
                }
                for frame in pending {
                    self.write_frame(&frame);
                }
            }
            Some(ChannelEvent::Frame(json)) => match InboundFrame::parse(&json) {
                Ok(InboundFrame::Message { message }) => {
                    if self.log.on_inbound(message) == Reconcile::Duplicate {
                        debug!("Duplicate message ignored in room {}", self.room_id);
                    }
                }
                Ok(InboundFrame::Error { message }) => {
                    warn!("Channel error frame in room {}: {message}", self.room_id);
                    notify(ui_tx, Notice::warning(message)).await;
                }
                Ok(InboundFrame::Unknown) => {}
                Err(e) => debug!("Unparseable channel frame: {e}"),
            },
            Some(ChannelEvent::Closed { reason }) => self.on_channel_closed(reason),
            None => self.on_channel_closed(None),
        }
    }

    fn on_channel_closed(&mut self, reason: Option<String>) {
        self.outbound = None;
        self.inbound = None;
        if matches!(
            self.channel_state,
            ChannelState::Closed | ChannelState::Unavailable
        ) {
            return;
        }
        info!(
            "Chat channel for room {} lost ({})",
            self.room_id,
            reason.as_deref().unwrap_or("closed")
        );
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        self.channel_state = ChannelState::Reconnecting {
            attempt: self.backoff.attempt(),
        };
        self.reconnect_at = Some(Instant::now() + delay);
        info!("Reconnecting room {} in {delay:?}", self.room_id);
    }

    /// Serialize and hand a frame to the writer. Returns false if no open
    /// channel could take it.
    fn write_frame(&self, frame: &OutboundFrame) -> bool {
        let Some(outbound) = &self.outbound else {
            return false;
        };
        match frame.to_json() {
            Ok(json) => outbound.try_send(json).is_ok(),
            Err(e) => {
                warn!("Failed to serialize outbound frame: {e}");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Explicit leave: remove presence if this session ever joined, and stop
    /// the timer. Both are awaited since the mount ends right after.
    async fn leave(&mut self, ui_tx: &mpsc::Sender<UiUpdate>) {
        if self.presence.take_leave_permit() {
            if let Err(e) = self.deps.presence_api.leave_room(&self.room_id).await {
                warn!("Leave call for room {} failed: {e}", self.room_id);
            }
        }

        let stopped = self.deps.timer.lock().await.stop().await;
        match stopped {
            Ok(Some(summary)) => notify_stopped(&summary, ui_tx).await,
            Ok(None) => {}
            Err(e) => {
                warn!("Timer stop on leave failed: {e}");
                notify(ui_tx, Notice::error(format!("Could not record study time: {e}"))).await;
            }
        }
        self.timer_display.stopped();
    }

    /// Cancel in-flight work, send the leave frame best-effort, and drop the
    /// channel. Never waits for an acknowledgment.
    fn teardown(&mut self) {
        self.sink.cancel();
        if self.channel_state == ChannelState::Open {
            self.write_frame(&self.log.leave_frame());
        }
        self.outbound = None;
        self.inbound = None;
        self.reconnect_at = None;
        self.join_retry_at = None;
        self.channel_state = ChannelState::Closed;
    }
}

async fn notify_stopped(summary: &StopSummary, ui_tx: &mpsc::Sender<UiUpdate>) {
    notify(
        ui_tx,
        Notice::info(format!(
            "Studied {} for {} minute(s)",
            summary.subject_id, summary.elapsed_minutes
        )),
    )
    .await;
    for achievement in &summary.newly_unlocked {
        notify(ui_tx, Notice::info(format!("Achievement unlocked: {}", achievement.name))).await;
    }
}
