// Study room client entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, not terminal)
// 2. Load config
// 3. Open database
// 4. Build collaborators, recover any running timer
// 5. Mount the room named on the command line
// 6. Feed stdin commands to the room, print updates
// 7. Cleanup on exit

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use studyroom_app::api::HttpStudyApi;
use studyroom_app::cli::{self, Input};
use studyroom_app::room::{self, RoomDeps};
use studyroom_app::timer::TimerEngine;
use studyroom_app::view::RoomCommand;
use studyroom_core::channel::TungsteniteConnector;
use studyroom_core::clock::{Clock, SystemClock};
use studyroom_core::config;
use studyroom_core::db::Database;
use studyroom_core::protocol::MaterialFile;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("Study room client starting up");

    let Some(room_id) = std::env::args().nth(1) else {
        bail!("usage: studyroom <room-id>");
    };

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: user={}, server={}",
        config.user.user_id, config.server.base_url
    );

    // 3. Open database
    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let db = Arc::new(Database::open(&config.db_path).context("failed to open database")?);
    info!("Database opened at {}", config.db_path);

    // 4. Collaborators and timer recovery
    let api =
        Arc::new(HttpStudyApi::from_config(&config).context("failed to build HTTP client")?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = TimerEngine::new(
        db.clone(),
        api.clone(),
        clock.clone(),
        config.user.user_id.clone(),
    );
    match engine.recover_on_launch() {
        Ok(Some(snapshot)) => println!(
            "Resuming timer for {} ({}s elapsed)",
            snapshot.subject_id, snapshot.elapsed_seconds
        ),
        Ok(None) => {}
        Err(e) => error!("Timer recovery failed: {e}"),
    }

    let connector = Arc::new(TungsteniteConnector::new(
        config.server.ws_url.clone(),
        config.credentials.session_token.clone(),
    ));

    let deps = RoomDeps {
        config: config.clone(),
        db,
        presence_api: api.clone(),
        quiz_api: api,
        connector,
        timer: engine.into_shared(),
        clock,
    };

    // 5. Mount the room
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, mut ui_rx) = mpsc::channel(256);

    let room_handle = tokio::spawn({
        let room_id = room_id.clone();
        async move { room::run(&room_id, deps, cmd_rx, ui_tx).await }
    });

    let printer = tokio::spawn(async move {
        let mut last_view = String::new();
        while let Some(update) = ui_rx.recv().await {
            let text = cli::render(&update);
            if matches!(update, studyroom_app::view::UiUpdate::View(_)) {
                if text == last_view {
                    continue;
                }
                last_view = text.clone();
            }
            println!("{text}");
        }
    });

    // 6. Stdin commands
    println!("Entered room {room_id}. Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let cmd = match cli::parse_line(&line) {
            Ok(Input::Command(cmd)) => cmd,
            Ok(Input::Upload(path)) => match tokio::fs::read(&path).await {
                Ok(bytes) => RoomCommand::UploadMaterial(MaterialFile {
                    name: file_name(&path),
                    bytes,
                }),
                Err(e) => {
                    println!("[error] cannot read {path}: {e}");
                    continue;
                }
            },
            Ok(Input::Quit) => RoomCommand::Unmount,
            Ok(Input::Help) => {
                println!("{}", cli::HELP);
                continue;
            }
            Err(e) => {
                println!("[error] {e}");
                continue;
            }
        };
        let ends_mount = matches!(cmd, RoomCommand::Unmount | RoomCommand::Leave);
        if cmd_tx.send(cmd).await.is_err() || ends_mount {
            break;
        }
    }
    drop(cmd_tx);

    // 7. Cleanup
    let exit = room_handle.await.context("room task panicked")??;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), printer).await;
    info!("Study room client shut down ({exit:?})");
    Ok(())
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "studyroom_app=info,studyroom_core=info,warn";

/// Send tracing output to `logs/studyroom.log`; stdout belongs to the room
/// driver. The file is appended to, so a launch that resumes a timer keeps
/// the log of the session that started it.
fn init_tracing() -> anyhow::Result<()> {
    use std::fs::OpenOptions;
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let log_path = log_dir.join("studyroom.log");
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install the study room log subscriber")?;

    Ok(())
}
