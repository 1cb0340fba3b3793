//! `teleop-cli` – teleoperation console.
//!
//! This binary is the entry point for the teleoperation stack.  It:
//!
//! 1. Checks for `~/.teleop/config.toml`; runs a **First-Run Wizard** when the
//!    file is absent.
//! 2. Starts a [`session::Session`]: one operator, sink driver and
//!    diagnostics forwarder per robot, plus cameras, recorder and supervisor.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/status`, `/record`, `/pause`, `/episodes`, `/help`).
//! 4. Intercepts **Ctrl-C** / SIGTERM to send `Shutdown` to every operator
//!    and stop the pipeline.

mod config;
mod demo;
mod repl;
mod session;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, warn};

use crate::config::{BuiltinModel, Config, RobotConfig};
use crate::session::Session;

/// How long the signal handler waits for the main thread to finish
/// sealing before it exits the process itself.
const SIGNAL_GRACE: Duration = Duration::from_secs(5);

fn main() {
    // RUST_LOG selects levels (default "info"), TELEOP_LOG_FORMAT=json
    // switches to newline-delimited JSON, OTEL_EXPORTER_OTLP_ENDPOINT adds
    // span export.
    let _telemetry = teleop_runtime::init_tracing("teleop");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("teleop")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot start tokio runtime");
            std::process::exit(1);
        }
    };

    let session = match runtime.block_on(Session::start(&cfg)) {
        Ok(session) => session,
        Err(e) => {
            println!("{}: {}", "Startup failed".red().bold(), e);
            std::process::exit(if e.is_fatal() { 2 } else { 1 });
        }
    };

    println!("  Robots: {}", session.robots().join(", ").bold());
    println!(
        "  Diagnostics stream on {}",
        format!("ws://{}", session.dashboard()).bold()
    );
    if cfg.demo_headset {
        println!("  {}", "Demo headset is driving the right hand.".dimmed());
    }

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────
    {
        let shutdown = shutdown.clone();
        let finished = finished.clone();
        let controller = session.controller();
        let handle = runtime.handle().clone();
        if let Err(e) = ctrlc::set_handler(move || {
            if shutdown.swap(true, Ordering::SeqCst) {
                return;
            }
            println!();
            println!("{}", "⚠  Signal received – initiating graceful shutdown …".yellow().bold());
            handle.block_on(controller.shutdown());
            println!("{}", "  ✓ Shutdown sent to every operator.".green());

            // The REPL may be blocked on stdin; give the main thread a
            // chance to seal the episode, then leave.
            let deadline = std::time::Instant::now() + SIGNAL_GRACE;
            while std::time::Instant::now() < deadline {
                if finished.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            std::process::exit(130);
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
        }
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    if let Err(e) = repl::run(&session, runtime.handle(), shutdown) {
        error!(error = %e, "console failed");
    }

    println!("{}", "  Stopping pipeline …".dimmed());
    runtime.block_on(session.shutdown());
    finished.store(true, Ordering::SeqCst);
    println!("{}", "  ✓ Exiting teleop.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       Teleop First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up teleoperation.\n");

    let mut cfg = Config::default();

    println!("  Which robots should be driven?");
    println!("    1) Three-joint arm with pinch gripper  (default)");
    println!("    2) Four-finger hand");
    println!("    3) Both");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    cfg.robots = match choice.trim() {
        "2" => vec![RobotConfig::builtin("hand", BuiltinModel::Hand)],
        "3" => vec![
            RobotConfig::builtin("arm", BuiltinModel::Arm),
            RobotConfig::builtin("hand", BuiltinModel::Hand),
        ],
        _ => vec![RobotConfig::builtin("arm", BuiltinModel::Arm)],
    };

    let rate_str = prompt_line(
        &format!("  Operator rate in Hz [{}]: ", cfg.operator_rate_hz),
        &cfg.operator_rate_hz.to_string(),
    );
    if let Ok(rate) = rate_str.trim().parse::<f64>()
        && rate.is_finite()
        && rate > 0.0
    {
        cfg.operator_rate_hz = rate;
    }

    let port_str = prompt_line(
        &format!("  Diagnostics WebSocket port [{}]: ", cfg.dashboard_port),
        &cfg.dashboard_port.to_string(),
    );
    if let Ok(p) = port_str.trim().parse::<u16>() {
        cfg.dashboard_port = p;
    }

    let demo = prompt_line("  Use the built-in demo headset? [Y/n]: ", "y");
    cfg.demo_headset = !matches!(demo.trim(), "n" | "N" | "no");

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  ______     __                "#.bold().cyan());
    println!("{}", r#" /_  __/__  / /__ ___  ___     "#.bold().cyan());
    println!("{}", r#"  / / / -_)/ / -_) _ \/ _ \    "#.bold().cyan());
    println!("{}", r#" /_/  \__//_/\__/\___/ .__/    "#.bold().cyan());
    println!("{}", r#"                    /_/        "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Teleop".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  VR teleoperation and episode recording");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
