// Line-oriented driver: parses typed commands into `RoomCommand`s and renders
// views as short text summaries.

use std::time::Duration;

use studyroom_core::protocol::{Delivery, Difficulty, QuizConfig};

use crate::view::{NoticeLevel, RoomCommand, RoomView, UiUpdate};

/// A parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(RoomCommand),
    /// Upload needs the file read first; the driver does that.
    Upload(String),
    Quit,
    Help,
}

pub const HELP: &str = "\
commands:
  say <text>                      send a chat message
  retry <key>                     resend a failed message
  scroll <px-from-bottom>         report the log scroll position
  upload <path>                   upload a study material
  generate <count> <difficulty> [confirm]
  answer <question-id> <option>   option is 0-3
  results | review | unreview
  start <subject> | stop | target <minutes|off>
  leave | quit | help";

pub fn parse_line(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };

    let cmd = match word {
        "say" if !rest.is_empty() => RoomCommand::SendMessage(rest.to_string()),
        "retry" if !rest.is_empty() => RoomCommand::RetryMessage(rest.to_string()),
        "scroll" => RoomCommand::Scrolled {
            distance_from_bottom_px: rest
                .parse()
                .map_err(|_| format!("invalid scroll distance '{rest}'"))?,
        },
        "upload" if !rest.is_empty() => return Ok(Input::Upload(rest.to_string())),
        "generate" => parse_generate(rest)?,
        "answer" => {
            let mut parts = rest.split_whitespace();
            let (Some(question_id), Some(option)) = (parts.next(), parts.next()) else {
                return Err("usage: answer <question-id> <option>".into());
            };
            RoomCommand::Answer {
                question_id: question_id.to_string(),
                option_index: option
                    .parse()
                    .map_err(|_| format!("invalid option '{option}'"))?,
            }
        }
        "results" => RoomCommand::RequestResults,
        "review" => RoomCommand::EnterReview,
        "unreview" => RoomCommand::ExitReview,
        "start" if !rest.is_empty() => RoomCommand::StartTimer(rest.to_string()),
        "stop" => RoomCommand::StopTimer,
        "target" => RoomCommand::SetTimerTarget(match rest {
            "off" => None,
            minutes => Some(parse_target(minutes)?),
        }),
        "leave" => RoomCommand::Leave,
        "quit" => return Ok(Input::Quit),
        "help" | "" => return Ok(Input::Help),
        other => return Err(format!("unknown command '{other}' (try 'help')")),
    };
    Ok(Input::Command(cmd))
}

fn parse_generate(rest: &str) -> Result<RoomCommand, String> {
    let mut parts = rest.split_whitespace();
    let count = parts
        .next()
        .ok_or("usage: generate <count> <difficulty> [confirm]")?
        .parse::<u32>()
        .map_err(|_| "question count must be a number".to_string())?;
    let difficulty = match parts.next().unwrap_or("medium") {
        "easy" => Difficulty::Easy,
        "medium" => Difficulty::Medium,
        "hard" => Difficulty::Hard,
        other => return Err(format!("unknown difficulty '{other}'")),
    };
    let confirmed = parts.next() == Some("confirm");
    Ok(RoomCommand::GenerateQuiz {
        config: QuizConfig {
            question_count: count,
            difficulty,
        },
        confirmed,
    })
}

/// Compact multi-line rendering of a view.
pub fn summarize(view: &RoomView) -> String {
    let mut out = format!(
        "room {} | presence {:?} | {} member(s) | chat {:?}",
        view.room_id,
        view.presence,
        view.members.len(),
        view.channel
    );

    for m in &view.messages {
        let marker = match m.delivery {
            Delivery::Pending => " (sending)",
            Delivery::Failed => " (failed)",
            Delivery::Confirmed => "",
        };
        out.push_str(&format!("\n  {}: {}{marker}", m.sender_name, m.content));
    }

    out.push_str(&format!(
        "\nquiz: {} ({}/{} answered)",
        view.quiz_phase.label(),
        view.answered_count,
        view.question_count
    ));
    if let Some(waiting) = view.waiting_label() {
        out.push_str(&format!("\n  {waiting}"));
    }
    if let Some(results) = &view.results {
        for r in results {
            out.push_str(&format!(
                "\n  {}: {} correct, {} incorrect, {} unanswered",
                r.question, r.correct_count, r.incorrect_count, r.unanswered_count
            ));
        }
    }
    for item in &view.review {
        let mark = if item.is_correct { "+" } else { "-" };
        out.push_str(&format!("\n  [{mark}] {}", item.prompt));
    }
    if let Some(timer) = view.timer_label() {
        out.push_str(&format!("\ntimer: {timer}"));
    }
    out
}

pub fn render(update: &UiUpdate) -> String {
    match update {
        UiUpdate::View(view) => summarize(view),
        UiUpdate::Notice(n) => {
            let tag = match n.level {
                NoticeLevel::Info => "info",
                NoticeLevel::Warning => "warn",
                NoticeLevel::Error => "error",
            };
            format!("[{tag}] {}", n.text)
        }
        UiUpdate::TimerCompleted(summary) => {
            format!("[timer] {} target reached", summary.subject_id)
        }
    }
}

/// A study target in whole minutes.
fn parse_target(minutes: &str) -> Result<Duration, String> {
    minutes
        .parse::<u64>()
        .ok()
        .filter(|m| *m > 0)
        .and_then(|m| m.checked_mul(60))
        .map(Duration::from_secs)
        .ok_or_else(|| format!("invalid minutes '{minutes}'"))
}
