//! REPL – the interactive teleoperation console.
//!
//! Supported slash-commands:
//!   /help             – show this list
//!   /status           – operator state and component health
//!   /record <id>      – start recording episode `<id>`
//!   /stop             – seal the current episode
//!   /pause <robot>    – pause an operator
//!   /resume <robot>   – resume a paused operator
//!   /episodes         – list stored episodes
//!   /quit | /exit     – shut down and exit

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use teleop_types::{ControlRequest, ControlResponse};
use tokio::runtime::Handle;

use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Status,
    Record(String),
    Stop,
    Pause(String),
    Resume(String),
    Episodes,
    Quit,
}

/// Parse one console line.  `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let arg = words.next().map(str::to_string);
    if words.next().is_some() {
        return Err(format!("too many arguments for {head}"));
    }
    let needs = |what: &str| format!("usage: {head} <{what}>");
    let cmd = match (head, arg) {
        ("/help", None) => ConsoleCommand::Help,
        ("/status", None) => ConsoleCommand::Status,
        ("/record", Some(id)) => ConsoleCommand::Record(id),
        ("/record", None) => return Err(needs("episode-id")),
        ("/stop", None) => ConsoleCommand::Stop,
        ("/pause", Some(robot)) => ConsoleCommand::Pause(robot),
        ("/resume", Some(robot)) => ConsoleCommand::Resume(robot),
        ("/pause" | "/resume", None) => return Err(needs("robot")),
        ("/episodes", None) => ConsoleCommand::Episodes,
        ("/quit" | "/exit", None) => ConsoleCommand::Quit,
        (other, _) => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(cmd))
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is checked before every prompt; the REPL also exits on
/// Ctrl-C / Ctrl-D at the prompt and on `/quit`.
pub fn run(session: &Session, runtime: &Handle, shutdown: Arc<AtomicBool>) -> Result<(), ReadlineError> {
    let mut editor = DefaultEditor::new()?;
    let prompt = format!("{} ", "teleop>".bold().cyan());

    while !shutdown.load(Ordering::SeqCst) {
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e),
        };
        let cmd = match parse(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                println!("{} {}. Type {} for available commands.", "Error:".red(), e, "/help".bold());
                continue;
            }
        };
        let _ = editor.add_history_entry(line.as_str());

        match cmd {
            ConsoleCommand::Help => cmd_help(),
            ConsoleCommand::Status => cmd_status(session),
            ConsoleCommand::Record(id) => {
                control(session, runtime, ControlRequest::StartRecording { episode_id: id });
            }
            ConsoleCommand::Stop => control(session, runtime, ControlRequest::StopRecording),
            ConsoleCommand::Pause(robot) => {
                control(session, runtime, ControlRequest::PauseOperator { robot_id: robot });
            }
            ConsoleCommand::Resume(robot) => {
                control(session, runtime, ControlRequest::ResumeOperator { robot_id: robot });
            }
            ConsoleCommand::Episodes => cmd_episodes(session),
            ConsoleCommand::Quit => {
                println!("{}", "Goodbye.".green());
                break;
            }
        }
    }
    shutdown.store(true, Ordering::SeqCst);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Teleop Commands".bold().underline());
    println!("  {}          – operator state and component health", "/status".bold().cyan());
    println!("  {}     – start recording an episode", "/record <id>".bold().cyan());
    println!("  {}            – seal the current episode", "/stop".bold().cyan());
    println!("  {}  – pause an operator", "/pause <robot>".bold().cyan());
    println!("  {} – resume a paused operator", "/resume <robot>".bold().cyan());
    println!("  {}        – list stored episodes", "/episodes".bold().cyan());
    println!("  {}     – shut down and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(session: &Session) {
    println!("{}", "Operators".bold().underline());
    for robot in session.robots() {
        match session.diagnostics(robot) {
            Some(d) => {
                let flags = if d.flags.any() {
                    format!("{:?}", d.flags).yellow().to_string()
                } else {
                    "-".dimmed().to_string()
                };
                println!(
                    "  {:<12} {:<24} seq {:<8} tick {:>6} µs  {:?}  {}",
                    robot.bold(),
                    d.state.to_string(),
                    d.last_seq.map_or("-".to_string(), |s| s.to_string()),
                    d.tick_latency_us,
                    d.solver,
                    flags
                );
            }
            None => println!("  {:<12} {}", robot.bold(), "no diagnostics yet".dimmed()),
        }
    }

    if let Some(rec) = session.recorder_status() {
        println!("{}", "Recorder".bold().underline());
        match &rec.episode_id {
            Some(id) => {
                let status = if rec.incomplete {
                    "incomplete".yellow()
                } else {
                    "ok".green()
                };
                println!(
                    "  {:<12} {:>6} steps  {}  (gaps {}, discarded {}, late {}, missing {} states / {} frames, dropped {})",
                    id.bold(),
                    rec.steps,
                    status,
                    rec.gaps,
                    rec.discarded,
                    rec.late_states,
                    rec.missing_states,
                    rec.missing_frames,
                    rec.dropped_samples
                );
            }
            None => println!("  {} {}", rec.robot_id.bold(), "idle".dimmed()),
        }
    }

    println!("{}", "Components".bold().underline());
    for (component, health) in session.health() {
        let badge = if health.is_healthy() {
            "●".green()
        } else {
            "●".red()
        };
        println!("  {} {:<20} {}", badge, component, health);
    }
    println!("  Diagnostics stream: ws://{}", session.dashboard());
}

fn cmd_episodes(session: &Session) {
    match session.episodes() {
        Ok(episodes) if episodes.is_empty() => println!("  {}", "No episodes recorded yet.".dimmed()),
        Ok(episodes) => {
            println!("{}", "Episodes".bold().underline());
            for e in episodes {
                let status = if e.incomplete {
                    "incomplete".yellow()
                } else {
                    "complete".green()
                };
                println!(
                    "  {:<20} {:>6} steps  {}  (missing: {} states, {} frames)",
                    e.episode_id.bold(),
                    e.steps,
                    status,
                    e.missing_states,
                    e.missing_frames
                );
            }
        }
        Err(e) => println!("{}: {}", "Cannot read episodes".red(), e),
    }
}

fn control(session: &Session, runtime: &Handle, request: ControlRequest) {
    match runtime.block_on(session.request(request)) {
        Ok(ControlResponse::Ok) => println!("  {}", "✓ ok".green()),
        Ok(ControlResponse::Recording { episode_id }) => {
            println!("  {} recording {}", "●".red(), episode_id.bold());
        }
        Ok(ControlResponse::EpisodeSealed(summary)) => {
            println!(
                "  {} sealed {} ({} steps{})",
                "✓".green(),
                summary.episode_id.bold(),
                summary.steps,
                if summary.incomplete { ", incomplete" } else { "" }
            );
        }
        Ok(ControlResponse::Rejected { reason }) => println!("  {} {}", "Rejected:".yellow(), reason),
        Err(e) => println!("  {} {}", "Error:".red(), e),
    }
}
