// Shared fakes for the room integration tests: a scripted in-memory backend
// implementing every collaborator trait, and a channel connector that hands
// the server side of each link to the test.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use studyroom_app::api::{ApiError, ApiResult, PresenceApi, QuizApi, TimerApi};
use studyroom_app::room::{self, RoomDeps, RoomExit};
use studyroom_app::timer::{SharedTimer, TimerEngine};
use studyroom_app::view::{Notice, RoomCommand, RoomView, UiUpdate};
use studyroom_core::channel::{ChannelConnector, ChannelEvent, ChannelLink, LINK_CAPACITY};
use studyroom_core::clock::ManualClock;
use studyroom_core::config::*;
use studyroom_core::db::Database;
use studyroom_core::protocol::*;

// ===========================================================================
// Config
// ===========================================================================

pub const ROOM: &str = "room-1";
pub const USER: &str = "u-me";

pub fn test_config() -> Config {
    Config {
        user: UserConfig {
            user_id: USER.into(),
            display_name: "Me".into(),
        },
        server: ServerConfig {
            base_url: "http://127.0.0.1:1/api".into(),
            ws_url: "ws://127.0.0.1:1/ws".into(),
            request_timeout_ms: 1000,
        },
        presence: PresenceConfig {
            poll_interval_ms: 2000,
            join_retry_delay_ms: 1000,
        },
        chat: ChatConfig {
            autoscroll_threshold_px: 80.0,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 8000,
        },
        quiz: QuizSettings {
            completion_poll_interval_ms: 2000,
            max_materials: 3,
            barrier_stall_secs: 0,
        },
        timer: TimerSettings {
            tick_interval_ms: 1000,
        },
        credentials: CredentialsConfig::default(),
        db_path: ":memory:".into(),
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 14, 8, 0, 0).unwrap()
}

pub fn member(id: &str) -> PresenceEntry {
    PresenceEntry {
        participant_id: id.into(),
        display_name: id.to_uppercase(),
        badge: None,
    }
}

pub fn quiz(n: usize) -> QuizData {
    QuizData {
        questions: (0..n)
            .map(|i| QuizQuestion {
                id: format!("q{i}"),
                prompt: format!("Question {i}"),
                options: ["a".into(), "b".into(), "c".into(), "d".into()],
                correct_option_index: i % 4,
                explanation: format!("because {i}"),
            })
            .collect(),
    }
}

// ===========================================================================
// Fake backend
// ===========================================================================

#[derive(Default)]
pub struct FakeBackend {
    /// Join outcomes served in order; `Joined` once exhausted.
    pub joins: Mutex<VecDeque<JoinOutcome>>,
    pub members: Mutex<Vec<PresenceEntry>>,
    pub quiz: Mutex<Option<QuizData>>,
    pub completion: Mutex<CompletionStatus>,
    pub results: Mutex<Vec<QuizResult>>,
    pub fail_uploads: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn script_joins(&self, outcomes: impl IntoIterator<Item = JoinOutcome>) {
        self.joins.lock().unwrap().extend(outcomes);
    }

    pub fn set_members(&self, members: Vec<PresenceEntry>) {
        *self.members.lock().unwrap() = members;
    }

    pub fn set_completion(&self, completed: u32, total: u32) {
        *self.completion.lock().unwrap() = CompletionStatus {
            completed_count: completed,
            total_participants: total,
            all_completed: completed == total,
        };
    }
}

#[async_trait]
impl PresenceApi for FakeBackend {
    async fn join_room(&self, room_id: &str) -> ApiResult<JoinOutcome> {
        self.record(format!("join:{room_id}"));
        Ok(self
            .joins
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(JoinOutcome::Joined))
    }

    async fn poll_presence(&self, room_id: &str) -> ApiResult<Vec<PresenceEntry>> {
        self.record(format!("poll:{room_id}"));
        Ok(self.members.lock().unwrap().clone())
    }

    async fn leave_room(&self, room_id: &str) -> ApiResult<()> {
        self.record(format!("leave:{room_id}"));
        Ok(())
    }
}

#[async_trait]
impl QuizApi for FakeBackend {
    async fn fetch_quiz(&self, _room_id: &str) -> ApiResult<Option<QuizData>> {
        self.record("fetch_quiz".into());
        Ok(self.quiz.lock().unwrap().clone())
    }

    async fn upload_material(&self, _room_id: &str, file: &MaterialFile) -> ApiResult<FileMeta> {
        self.record(format!("upload:{}", file.name));
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 413,
                body: "too large".into(),
            });
        }
        Ok(FileMeta {
            file_id: format!("f-{}", file.name),
            file_name: file.name.clone(),
            size_bytes: file.bytes.len() as u64,
        })
    }

    async fn generate_quiz(&self, _room_id: &str, config: QuizConfig) -> ApiResult<QuizData> {
        self.record(format!("generate:{}", config.question_count));
        let generated = quiz(config.question_count as usize);
        *self.quiz.lock().unwrap() = Some(generated.clone());
        Ok(generated)
    }

    async fn submit_answer(
        &self,
        _room_id: &str,
        question_id: &str,
        option_index: usize,
    ) -> ApiResult<()> {
        self.record(format!("submit:{question_id}:{option_index}"));
        Ok(())
    }

    async fn completion_status(&self, _room_id: &str) -> ApiResult<CompletionStatus> {
        self.record("completion".into());
        Ok(*self.completion.lock().unwrap())
    }

    async fn results(&self, _room_id: &str) -> ApiResult<Vec<QuizResult>> {
        self.record("results".into());
        Ok(self.results.lock().unwrap().clone())
    }
}

#[async_trait]
impl TimerApi for FakeBackend {
    async fn start_timer(&self, subject_id: &str) -> ApiResult<()> {
        self.record(format!("start:{subject_id}"));
        Ok(())
    }

    async fn stop_timer(&self, subject_id: &str, elapsed_seconds: i64) -> ApiResult<StopReport> {
        self.record(format!("stop:{subject_id}:{elapsed_seconds}"));
        let minutes = (elapsed_seconds / 60) as u32;
        let newly_unlocked_achievements = if minutes >= 60 {
            vec![Achievement {
                id: "first-hour".into(),
                name: "First hour".into(),
                threshold_minutes: Some(60),
            }]
        } else {
            vec![]
        };
        Ok(StopReport {
            elapsed_minutes: minutes,
            newly_unlocked_achievements,
        })
    }
}

// ===========================================================================
// Fake channel connector
// ===========================================================================

/// The server's end of one channel link.
pub struct ServerEnd {
    pub from_client: mpsc::Receiver<String>,
    pub to_client: mpsc::Sender<ChannelEvent>,
}

impl ServerEnd {
    /// Next frame the client wrote, parsed as JSON.
    pub async fn next_frame(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(30), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the link");
        serde_json::from_str(&text).unwrap()
    }

    /// Push a chat message to the client.
    pub async fn deliver(&self, message: &RoomMessage) {
        let json = serde_json::json!({ "type": "message", "message": message }).to_string();
        self.to_client.send(ChannelEvent::Frame(json)).await.unwrap();
    }
}

pub struct FakeConnector {
    ends: mpsc::UnboundedSender<ServerEnd>,
    pub fail: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                ends: tx,
                fail: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(&self, _room_id: &str) -> anyhow::Result<ChannelLink> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);
        in_tx.send(ChannelEvent::Opened).await?;
        let _ = self.ends.send(ServerEnd {
            from_client: out_rx,
            to_client: in_tx,
        });
        Ok(ChannelLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ===========================================================================
// Mounted room harness
// ===========================================================================

pub struct Harness {
    pub cmd_tx: mpsc::Sender<RoomCommand>,
    pub ui_rx: mpsc::Receiver<UiUpdate>,
    pub backend: Arc<FakeBackend>,
    pub connector: Arc<FakeConnector>,
    pub ends: mpsc::UnboundedReceiver<ServerEnd>,
    pub db: Arc<Database>,
    pub clock: ManualClock,
    pub timer: SharedTimer,
    pub handle: JoinHandle<anyhow::Result<RoomExit>>,
    pub notices: Vec<Notice>,
    pub last_view: Option<RoomView>,
}

pub struct Setup {
    pub backend: Arc<FakeBackend>,
    pub db: Arc<Database>,
    pub clock: ManualClock,
    pub config: Config,
    pub connector_fails: bool,
}

impl Setup {
    pub fn new() -> Self {
        Self {
            backend: FakeBackend::new(),
            db: Arc::new(Database::open(":memory:").unwrap()),
            clock: ManualClock::new(t0()),
            config: test_config(),
            connector_fails: false,
        }
    }

    pub fn mount(self) -> Harness {
        let (connector, ends) = FakeConnector::new();
        connector.fail.store(self.connector_fails, Ordering::SeqCst);

        let timer = TimerEngine::new(
            self.db.clone(),
            self.backend.clone(),
            Arc::new(self.clock.clone()),
            USER,
        )
        .into_shared();

        let deps = RoomDeps {
            config: self.config,
            db: self.db.clone(),
            presence_api: self.backend.clone(),
            quiz_api: self.backend.clone(),
            connector: connector.clone(),
            timer: timer.clone(),
            clock: Arc::new(self.clock.clone()),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (ui_tx, ui_rx) = mpsc::channel(4096);
        let handle = tokio::spawn(async move { room::run(ROOM, deps, cmd_rx, ui_tx).await });

        Harness {
            cmd_tx,
            ui_rx,
            backend: self.backend,
            connector,
            ends,
            db: self.db,
            clock: self.clock,
            timer,
            handle,
            notices: Vec::new(),
            last_view: None,
        }
    }
}

impl Harness {
    pub async fn send(&self, cmd: RoomCommand) {
        self.cmd_tx.send(cmd).await.unwrap();
    }

    /// Consume updates until a view satisfies `pred`. Notices seen on the way
    /// are collected. Paused test time auto-advances while waiting.
    pub async fn wait_view(&mut self, pred: impl Fn(&RoomView) -> bool) -> RoomView {
        let fut = async {
            loop {
                match self.ui_rx.recv().await {
                    Some(UiUpdate::View(view)) => {
                        let view = *view;
                        self.last_view = Some(view.clone());
                        if pred(&view) {
                            return view;
                        }
                    }
                    Some(UiUpdate::Notice(n)) => self.notices.push(n),
                    Some(UiUpdate::TimerCompleted(_)) => {}
                    None => panic!("room loop ended while waiting for a view"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(120), fut)
            .await
            .expect("timed out waiting for view")
    }

    /// Wait until a notice containing `text` has been seen.
    pub async fn wait_notice(&mut self, text: &str) -> Notice {
        let fut = async {
            loop {
                if let Some(n) = self.notices.iter().find(|n| n.text.contains(text)) {
                    return n.clone();
                }
                match self.ui_rx.recv().await {
                    Some(UiUpdate::Notice(n)) => self.notices.push(n),
                    Some(UiUpdate::View(view)) => self.last_view = Some(*view),
                    Some(UiUpdate::TimerCompleted(_)) => {}
                    None => panic!("room loop ended while waiting for a notice"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(120), fut)
            .await
            .expect("timed out waiting for notice")
    }

    /// Wait for the join and the first channel link, consuming the join frame.
    pub async fn joined_with_channel(&mut self) -> ServerEnd {
        self.wait_view(|v| v.presence == studyroom_app::presence::PresencePhase::Joined)
            .await;
        let mut end = self.next_end().await;
        let join = end.next_frame().await;
        assert_eq!(join["type"], "join");
        end
    }

    pub async fn next_end(&mut self) -> ServerEnd {
        tokio::time::timeout(Duration::from_secs(120), self.ends.recv())
            .await
            .expect("timed out waiting for a channel link")
            .expect("connector dropped")
    }

    /// Send `cmd` and wait for the room task to finish.
    pub async fn finish(mut self, cmd: RoomCommand) -> (RoomExit, Harness) {
        self.send(cmd).await;
        let exit = (&mut self.handle).await.unwrap().unwrap();
        // Drain whatever the loop published on the way out.
        while let Ok(update) = self.ui_rx.try_recv() {
            match update {
                UiUpdate::Notice(n) => self.notices.push(n),
                UiUpdate::View(v) => self.last_view = Some(*v),
                UiUpdate::TimerCompleted(_) => {}
            }
        }
        (exit, self)
    }
}

pub fn echo_of(frame: &serde_json::Value, id: &str, at: DateTime<Utc>) -> RoomMessage {
    RoomMessage {
        id: id.into(),
        idempotency_key: frame["idempotencyKey"].as_str().map(String::from),
        room_id: ROOM.into(),
        sender_id: USER.into(),
        sender_name: "Me".into(),
        content: frame["content"].as_str().unwrap_or_default().into(),
        created_at: at,
        delivery: Delivery::Confirmed,
    }
}
