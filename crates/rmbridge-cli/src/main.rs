//! `rmbridge` – interactive shell for a RoboMaster bridge.
//!
//! On start it:
//!
//! 1. Installs `tracing` (see `rmbridge_runtime::telemetry`).
//! 2. Loads `~/.rmbridge/config.toml`, running a short first-run wizard
//!    when the file is absent.
//! 3. Loads the native bridge library.
//! 4. Drops the user into the REPL. Ctrl-C outside a prompt requests a
//!    graceful shutdown: the client is stopped before exit.

mod config;
mod repl;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use rmbridge_runtime::{Client, ClientConfig};
use tracing::{error, warn};

fn main() {
    // Held until exit so buffered spans are flushed.
    let _telemetry = rmbridge_runtime::init_tracing("rmbridge");

    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down after the current command …".yellow().bold());
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

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
            println!("  Using default configuration.");
            config::defaults()
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "could not start the async runtime");
            eprintln!("{}: {}", "Fatal".red(), e);
            std::process::exit(1);
        }
    };

    let client = match Client::from_config(&cfg) {
        Ok(client) => {
            println!("  Native bridge {}", "loaded".green());
            Some(client)
        }
        Err(e) => {
            println!("  Native bridge {}: {}", "unavailable".yellow(), e);
            println!("  {}", "Only /find and /keys will work.".dimmed());
            None
        }
    };

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(repl::Session::new(cfg, client, runtime), shutdown);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> ClientConfig {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      rmbridge First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up rmbridge.\n");

    let mut cfg = ClientConfig::default();

    let id = prompt_line("  Robot app id (0 = any) [0]: ", "0");
    match id.trim().parse::<u64>() {
        Ok(id) => cfg.app_id = id,
        Err(_) => println!("  {} '{}' is not a number, keeping 0", "Warning:".yellow(), id),
    }

    let library = prompt_line("  Bridge library path [platform default]: ", "");
    if !library.is_empty() {
        cfg.library_path = Some(PathBuf::from(library));
    }

    cfg.bridge_name = prompt_line(&format!("  Bridge name [{}]: ", cfg.bridge_name), &cfg.bridge_name);

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  ┬─┐┌┬┐┌┐ ┬─┐┬┌┬┐┌─┐┌─┐"#.bold().cyan());
    println!("{}", r#"  ├┬┘│││├┴┐├┬┘│ │││ ┬├┤ "#.bold().cyan());
    println!("{}", r#"  ┴└─┴ ┴└─┘┴└─┴─┴┘└─┘└─┘"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "rmbridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  RoboMaster bridge shell");
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
