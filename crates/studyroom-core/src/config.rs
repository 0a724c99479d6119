// Configuration loading and parsing (studyroom.toml, credentials.toml).

use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to seed config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub user: UserConfig,
    pub server: ServerConfig,
    pub presence: PresenceConfig,
    pub chat: ChatConfig,
    pub quiz: QuizSettings,
    pub timer: TimerSettings,
    pub credentials: CredentialsConfig,
    pub db_path: String,
}

// ---------------------------------------------------------------------------
// studyroom.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire studyroom.toml file.
#[derive(Debug, Clone, Deserialize)]
struct StudyroomFile {
    user: UserConfig,
    server: ServerConfig,
    presence: PresenceConfig,
    chat: ChatConfig,
    quiz: QuizSettings,
    timer: TimerSettings,
    database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    #[serde(default)]
    path: String,
}

/// Identity of the local user. Every persisted key is scoped by `user_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    pub ws_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    pub poll_interval_ms: u64,
    pub join_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    pub autoscroll_threshold_px: f64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuizSettings {
    pub completion_poll_interval_ms: u64,
    /// Upper bound on uploaded materials per room (the participant cap).
    pub max_materials: usize,
    /// Seconds the barrier may stay closed before the wait is flagged as
    /// stalled. `0` never flags.
    #[serde(default)]
    pub barrier_stall_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimerSettings {
    pub tick_interval_ms: u64,
}

impl PresenceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_retry_delay(&self) -> Duration {
        Duration::from_millis(self.join_retry_delay_ms)
    }
}

impl ChatConfig {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

impl QuizSettings {
    pub fn completion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.completion_poll_interval_ms)
    }

    pub fn barrier_stall(&self) -> Option<Duration> {
        (self.barrier_stall_secs > 0).then(|| Duration::from_secs(self.barrier_stall_secs))
    }
}

impl TimerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    /// Bearer token issued by the (external) authentication service.
    pub session_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/studyroom.toml` and
/// (optionally) `config/credentials.toml`, relative to `base_dir`.
///
/// Does not copy defaults; prefer `load_config()` for that.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    let main_path = config_dir.join(MAIN_FILE);
    let main_text = read_file(&main_path)?;
    let file: StudyroomFile = toml::from_str(&main_text).map_err(|e| ConfigError::ParseError {
        path: main_path.clone(),
        source: e,
    })?;

    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        user: file.user,
        server: file.server,
        presence: file.presence,
        chat: file.chat,
        quiz: file.quiz,
        timer: file.timer,
        credentials,
        db_path: resolve_db_path(&file.database.path),
    };

    validate(&config)?;

    Ok(config)
}

/// The client configuration, required in `config/`.
const MAIN_FILE: &str = "studyroom.toml";

/// Files seeded from `defaults/` when missing. Credentials normally ship only
/// as a `.example` template, which is never copied, so they stay optional.
const SEEDED_FILES: [&str; 2] = [MAIN_FILE, "credentials.toml"];

/// Seed `config/` from `defaults/` for every file that is missing, leaving
/// edited files alone. Returns the files that were created.
///
/// Fails only when `studyroom.toml` exists in neither directory.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");
    let mut seeded = Vec::new();

    for name in SEEDED_FILES {
        let source = defaults_dir.join(name);
        let target = config_dir.join(name);
        if target.exists() || !source.is_file() {
            continue;
        }
        std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("cannot create {}: {e}", config_dir.display()),
        })?;
        if seed_file(&source, &target)? {
            info!("Seeded {} from defaults", target.display());
            seeded.push(target);
        }
    }

    if !config_dir.join(MAIN_FILE).exists() {
        return Err(ConfigError::DefaultsCopyError {
            message: format!(
                "no {MAIN_FILE} in config/ or defaults/ under {}; \
                 start the study room client from its install directory",
                base_dir.display()
            ),
        });
    }

    Ok(seeded)
}

/// Copy `source` to `target` unless `target` appeared in the meantime.
/// Returns whether a file was written.
fn seed_file(source: &Path, target: &Path) -> Result<bool, ConfigError> {
    let content = std::fs::read(source).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("cannot read default {}: {e}", source.display()),
    })?;
    let mut dest = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
    {
        Ok(dest) => dest,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => {
            return Err(ConfigError::DefaultsCopyError {
                message: format!("cannot create {}: {e}", target.display()),
            });
        }
    };
    dest.write_all(&content).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("cannot write {}: {e}", target.display()),
    })?;
    Ok(true)
}

/// Load config relative to the current working directory, seeding missing
/// files from `defaults/` first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Unreadable {
        path: PathBuf::from("."),
        source,
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        },
    })
}

/// An empty database path means "the platform data directory".
fn resolve_db_path(configured: &str) -> String {
    if !configured.trim().is_empty() {
        return configured.to_string();
    }
    match directories::ProjectDirs::from("", "", "studyroom") {
        Some(dirs) => dirs
            .data_dir()
            .join("studyroom.db")
            .to_string_lossy()
            .into_owned(),
        None => "studyroom.db".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.user.user_id.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "user.user_id".into(),
            message: "must not be empty".into(),
        });
    }

    let interval_fields: &[(&str, u64)] = &[
        ("presence.poll_interval_ms", config.presence.poll_interval_ms),
        ("chat.reconnect_initial_ms", config.chat.reconnect_initial_ms),
        (
            "quiz.completion_poll_interval_ms",
            config.quiz.completion_poll_interval_ms,
        ),
        ("timer.tick_interval_ms", config.timer.tick_interval_ms),
        ("server.request_timeout_ms", config.server.request_timeout_ms),
    ];
    for (name, val) in interval_fields {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    if config.chat.reconnect_max_ms < config.chat.reconnect_initial_ms {
        return Err(ConfigError::ValidationError {
            field: "chat.reconnect_max_ms".into(),
            message: format!(
                "must be >= reconnect_initial_ms ({}), got {}",
                config.chat.reconnect_initial_ms, config.chat.reconnect_max_ms
            ),
        });
    }

    if config.chat.autoscroll_threshold_px < 0.0 {
        return Err(ConfigError::ValidationError {
            field: "chat.autoscroll_threshold_px".into(),
            message: format!("must be >= 0, got {}", config.chat.autoscroll_threshold_px),
        });
    }

    if config.quiz.max_materials == 0 {
        return Err(ConfigError::ValidationError {
            field: "quiz.max_materials".into(),
            message: "must be > 0".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// The workspace-level `defaults/` directory.
    fn defaults_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../defaults")
    }

    /// Fresh temp dir with `config/studyroom.toml` copied from defaults,
    /// optionally rewritten by `edit`.
    fn temp_config(name: &str, edit: impl FnOnce(String) -> String) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let config_dir = tmp.join("config");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&config_dir).unwrap();
        let text = fs::read_to_string(defaults_dir().join("studyroom.toml")).unwrap();
        fs::write(config_dir.join("studyroom.toml"), edit(text)).unwrap();
        tmp
    }

    fn expect_validation_field(err: ConfigError, expected: &str) {
        match &err {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, expected),
            other => panic!("expected ValidationError, got: {other}"),
        }
    }

    #[test]
    fn load_default_config() {
        let tmp = temp_config("studyroom_cfg_defaults", |t| t);
        let config = load_config_from(&tmp).expect("should load valid config");

        assert_eq!(config.user.user_id, "local-user");
        assert_eq!(config.presence.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.quiz.completion_poll_interval(), Duration::from_secs(2));
        assert_eq!(config.timer.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.quiz.max_materials, 5);
        assert!(config.quiz.barrier_stall().is_none());
        assert_eq!(config.db_path, "studyroom.db");
        assert!(config.credentials.session_token.is_none());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn credentials_toml_with_token() {
        let tmp = temp_config("studyroom_cfg_creds", |t| t);
        fs::write(
            tmp.join("config/credentials.toml"),
            "session_token = \"tok-123\"\n",
        )
        .unwrap();

        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.credentials.session_token.as_deref(), Some("tok-123"));

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn empty_db_path_resolves_to_data_dir() {
        let tmp = temp_config("studyroom_cfg_dbpath", |t| {
            t.replace("path = \"studyroom.db\"", "path = \"\"")
        });
        let config = load_config_from(&tmp).unwrap();
        assert!(config.db_path.ends_with("studyroom.db"));
        assert!(!config.db_path.is_empty());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let tmp = temp_config("studyroom_cfg_zero_poll", |t| {
            t.replace("poll_interval_ms = 2000", "poll_interval_ms = 0")
        });
        expect_validation_field(load_config_from(&tmp).unwrap_err(), "presence.poll_interval_ms");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_empty_user_id() {
        let tmp = temp_config("studyroom_cfg_empty_user", |t| {
            t.replace("user_id = \"local-user\"", "user_id = \"  \"")
        });
        expect_validation_field(load_config_from(&tmp).unwrap_err(), "user.user_id");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_reconnect_max_below_initial() {
        let tmp = temp_config("studyroom_cfg_backoff", |t| {
            t.replace("reconnect_max_ms = 30000", "reconnect_max_ms = 10")
        });
        expect_validation_field(load_config_from(&tmp).unwrap_err(), "chat.reconnect_max_ms");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_max_materials() {
        let tmp = temp_config("studyroom_cfg_materials", |t| {
            t.replace("max_materials = 5", "max_materials = 0")
        });
        expect_validation_field(load_config_from(&tmp).unwrap_err(), "quiz.max_materials");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn file_not_found_for_missing_main_file() {
        let tmp = std::env::temp_dir().join("studyroom_cfg_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();

        match load_config_from(&tmp).unwrap_err() {
            ConfigError::FileNotFound { path } => assert!(path.ends_with("studyroom.toml")),
            other => panic!("expected FileNotFound, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn parse_error_for_invalid_toml() {
        let tmp = temp_config("studyroom_cfg_invalid", |_| "not valid [[[ toml".into());
        match load_config_from(&tmp).unwrap_err() {
            ConfigError::ParseError { path, .. } => assert!(path.ends_with("studyroom.toml")),
            other => panic!("expected ParseError, got: {other}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_copies_missing_and_skips_examples() {
        let tmp = std::env::temp_dir().join("studyroom_cfg_ensure");
        let _ = fs::remove_dir_all(&tmp);
        let defaults = tmp.join("defaults");
        fs::create_dir_all(&defaults).unwrap();
        fs::copy(defaults_dir().join("studyroom.toml"), defaults.join("studyroom.toml")).unwrap();
        fs::write(defaults.join("credentials.toml.example"), "session_token = \"...\"\n").unwrap();

        let copied = ensure_config_files(&tmp).expect("should succeed");
        assert_eq!(copied.len(), 1);
        assert!(tmp.join("config/studyroom.toml").exists());
        assert!(!tmp.join("config/credentials.toml.example").exists());

        // Second run leaves the existing file alone.
        fs::write(tmp.join("config/studyroom.toml"), "# custom\n").unwrap();
        assert!(ensure_config_files(&tmp).unwrap().is_empty());
        assert_eq!(
            fs::read_to_string(tmp.join("config/studyroom.toml")).unwrap(),
            "# custom\n"
        );

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_errors_without_any_studyroom_toml() {
        let tmp = std::env::temp_dir().join("studyroom_cfg_both_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("defaults")).unwrap();
        fs::write(tmp.join("defaults/credentials.toml.example"), "").unwrap();

        match ensure_config_files(&tmp).unwrap_err() {
            ConfigError::DefaultsCopyError { message } => {
                assert!(message.contains("no studyroom.toml"), "{message}")
            }
            other => panic!("expected DefaultsCopyError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_accepts_existing_config_without_defaults() {
        let tmp = temp_config("studyroom_cfg_no_defaults", |t| t);
        assert!(ensure_config_files(&tmp).unwrap().is_empty());
        assert!(load_config_from(&tmp).is_ok());
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_seeds_credentials_when_a_default_exists() {
        let tmp = temp_config("studyroom_cfg_seed_creds", |t| t);
        fs::create_dir_all(tmp.join("defaults")).unwrap();
        fs::write(tmp.join("defaults/credentials.toml"), "session_token = \"dev\"\n").unwrap();

        let seeded = ensure_config_files(&tmp).unwrap();
        assert_eq!(seeded, vec![tmp.join("config/credentials.toml")]);
        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.credentials.session_token.as_deref(), Some("dev"));

        let _ = fs::remove_dir_all(&tmp);
    }
}
