// External collaborators of the room core, and their HTTP implementation.
//
// The core only depends on the traits. `HttpStudyApi` speaks JSON over
// reqwest with a bearer token; tests substitute in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use studyroom_core::config::Config;
use studyroom_core::protocol::{
    CompletionStatus, FileMeta, JoinOutcome, MaterialFile, PresenceEntry, QuizConfig, QuizData,
    QuizResult, StopReport,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("permission denied")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Transport(String),

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("invalid server URL {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PresenceApi: Send + Sync {
    async fn join_room(&self, room_id: &str) -> ApiResult<JoinOutcome>;
    async fn poll_presence(&self, room_id: &str) -> ApiResult<Vec<PresenceEntry>>;
    async fn leave_room(&self, room_id: &str) -> ApiResult<()>;
}

#[async_trait]
pub trait QuizApi: Send + Sync {
    /// The room's current quiz, if one has been generated.
    async fn fetch_quiz(&self, room_id: &str) -> ApiResult<Option<QuizData>>;
    async fn upload_material(&self, room_id: &str, file: &MaterialFile) -> ApiResult<FileMeta>;
    async fn generate_quiz(&self, room_id: &str, config: QuizConfig) -> ApiResult<QuizData>;
    async fn submit_answer(&self, room_id: &str, question_id: &str, option_index: usize)
        -> ApiResult<()>;
    async fn completion_status(&self, room_id: &str) -> ApiResult<CompletionStatus>;
    async fn results(&self, room_id: &str) -> ApiResult<Vec<QuizResult>>;
}

#[async_trait]
pub trait TimerApi: Send + Sync {
    async fn start_timer(&self, subject_id: &str) -> ApiResult<()>;
    async fn stop_timer(&self, subject_id: &str, elapsed_seconds: i64) -> ApiResult<StopReport>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpStudyApi {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpStudyApi {
    pub fn new(
        base_url: impl AsRef<str>,
        token: Option<String>,
        timeout: Duration,
    ) -> ApiResult<Self> {
        let raw = base_url.as_ref();
        let base_url = Url::parse(raw).map_err(|e| ApiError::InvalidUrl(format!("{raw}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(raw.to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(config: &Config) -> ApiResult<Self> {
        Self::new(
            &config.server.base_url,
            config.credentials.session_token.clone(),
            Duration::from_millis(config.server.request_timeout_ms),
        )
    }

    /// Append `segments` to the base path. Each segment is percent-encoded,
    /// so ids containing `/`, `?` or spaces stay a single segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, segments: &[&str]) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.endpoint(segments));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> ApiResult<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        debug!(%status, url = %response.url(), "collaborator response");
        match status {
            s if s.is_success() => Ok(response),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Err(ApiError::Forbidden),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::Status {
                    status: s.as_u16(),
                    body,
                })
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> ApiResult<T> {
        let response = self.send(self.request(reqwest::Method::GET, segments)).await?;
        Ok(response.json().await?)
    }

    async fn post_json<B, T>(&self, segments: &[&str], body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .send(self.request(reqwest::Method::POST, segments).json(body))
            .await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PresenceApi for HttpStudyApi {
    async fn join_room(&self, room_id: &str) -> ApiResult<JoinOutcome> {
        let request = self.request(reqwest::Method::POST, &["rooms", room_id, "join"]);
        match self.send(request).await {
            Ok(_) => Ok(JoinOutcome::Joined),
            Err(ApiError::Forbidden) => Ok(JoinOutcome::Forbidden),
            Err(e) => Err(e),
        }
    }

    async fn poll_presence(&self, room_id: &str) -> ApiResult<Vec<PresenceEntry>> {
        self.get_json(&["rooms", room_id, "participants"]).await
    }

    async fn leave_room(&self, room_id: &str) -> ApiResult<()> {
        self.send(self.request(reqwest::Method::DELETE, &["rooms", room_id, "join"]))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QuizApi for HttpStudyApi {
    async fn fetch_quiz(&self, room_id: &str) -> ApiResult<Option<QuizData>> {
        match self.get_json(&["rooms", room_id, "quiz"]).await {
            Ok(quiz) => Ok(Some(quiz)),
            Err(ApiError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn upload_material(&self, room_id: &str, file: &MaterialFile) -> ApiResult<FileMeta> {
        let builder = self
            .request(reqwest::Method::POST, &["rooms", room_id, "materials"])
            .header("content-type", "application/octet-stream")
            .header("x-file-name", file.name.as_str())
            .body(file.bytes.clone());
        let response = self.send(builder).await?;
        Ok(response.json().await?)
    }

    async fn generate_quiz(&self, room_id: &str, config: QuizConfig) -> ApiResult<QuizData> {
        self.post_json(&["rooms", room_id, "quiz"], &config).await
    }

    async fn submit_answer(
        &self,
        room_id: &str,
        question_id: &str,
        option_index: usize,
    ) -> ApiResult<()> {
        let body = serde_json::json!({ "optionIndex": option_index });
        let segments = ["rooms", room_id, "quiz", "answers", question_id];
        self.send(self.request(reqwest::Method::PUT, &segments).json(&body))
            .await?;
        Ok(())
    }

    async fn completion_status(&self, room_id: &str) -> ApiResult<CompletionStatus> {
        self.get_json(&["rooms", room_id, "quiz", "completion"]).await
    }

    async fn results(&self, room_id: &str) -> ApiResult<Vec<QuizResult>> {
        self.get_json(&["rooms", room_id, "quiz", "results"]).await
    }
}

#[async_trait]
impl TimerApi for HttpStudyApi {
    async fn start_timer(&self, subject_id: &str) -> ApiResult<()> {
        self.send(self.request(reqwest::Method::POST, &["timers", subject_id, "start"]))
            .await?;
        Ok(())
    }

    async fn stop_timer(&self, subject_id: &str, elapsed_seconds: i64) -> ApiResult<StopReport> {
        let body = serde_json::json!({ "elapsedSeconds": elapsed_seconds });
        self.post_json(&["timers", subject_id, "stop"], &body).await
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
