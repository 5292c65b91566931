//! Breakwater CLI — inspect profiles, validate settings files and run
//! synthetic load against a flaky in-process endpoint.
//!
//! # Commands
//! ```text
//! breakwater profiles
//! breakwater check-config --file <settings.{json,yaml}>
//! breakwater simulate     --calls <N> --failure-rate <F> --concurrency <C>
//!                         [--profile <name>] [--adaptive] [--json]
//! ```

use anyhow::{Context, Result};
use breakwater_core::config::{profiles, BUILTIN_PROFILES};
use breakwater_core::GuardSettings;
use breakwater_observability::{init_tracing, LogConfig};
use clap::{Parser, Subcommand};

mod cmd_simulate;

#[derive(Parser)]
#[command(
    name = "breakwater",
    about = "Circuit breaker, bulkhead and adaptive thresholds for LLM provider calls",
    version
)]
struct Cli {
    /// Global log level: trace | debug | info | warn | error
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in profiles and their parameters
    Profiles,

    /// Load and validate a settings file
    #[command(name = "check-config")]
    CheckConfig {
        /// Path to a .json, .yaml or .yml settings file
        #[arg(short, long)]
        file: String,
    },

    /// Drive a synthetic flaky endpoint through the guard
    Simulate(cmd_simulate::SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = LogConfig {
        level: cli.log_level.clone(),
        json: cli.json_logs,
        ..Default::default()
    };
    init_tracing(&log).context("failed to initialise logging")?;

    match cli.command {
        Commands::Profiles => {
            cmd_profiles();
            Ok(())
        }
        Commands::CheckConfig { file } => cmd_check_config(&file),
        Commands::Simulate(args) => cmd_simulate::run(args).await,
    }
}

fn cmd_profiles() {
    println!(
        "{:<16} {:>8} {:>8} {:>10} {:>10} {:>11} {:>7} {:>12}",
        "profile", "failure", "success", "reset_ms", "timeout_ms", "concurrent", "queued", "queue_ms"
    );
    for name in BUILTIN_PROFILES {
        let Some(cfg) = profiles::builtin(name) else {
            continue;
        };
        println!(
            "{:<16} {:>8} {:>8} {:>10} {:>10} {:>11} {:>7} {:>12}",
            name,
            cfg.circuit.failure_threshold,
            cfg.circuit.success_threshold,
            cfg.circuit.reset_timeout.as_millis(),
            cfg.circuit.call_timeout.as_millis(),
            cfg.bulkhead.max_concurrent,
            cfg.bulkhead.max_queued,
            cfg.bulkhead.queue_timeout.as_millis(),
        );
    }
}

fn cmd_check_config(file: &str) -> Result<()> {
    let settings = GuardSettings::from_path(file)
        .with_context(|| format!("invalid settings file {file}"))?;

    println!("✓ Settings file '{file}' is valid");
    let d = &settings.defaults;
    println!(
        "  Defaults:        failure={} success={} reset={}ms timeout={}ms",
        d.circuit.failure_threshold,
        d.circuit.success_threshold,
        d.circuit.reset_timeout.as_millis(),
        d.circuit.call_timeout.as_millis(),
    );
    println!(
        "  Bulkhead:        concurrent={} queued={} queue_timeout={}ms",
        d.bulkhead.max_concurrent,
        d.bulkhead.max_queued,
        d.bulkhead.queue_timeout.as_millis(),
    );
    let a = &settings.adaptive;
    println!(
        "  Adaptive:        {} (every {}ms, thresholds {}..={})",
        if a.enabled { "enabled" } else { "disabled" },
        a.update_interval.as_millis(),
        a.min_threshold,
        a.max_threshold,
    );
    println!("  History:         {} versions", settings.max_history);

    let mut endpoints: Vec<_> = settings.endpoints.iter().collect();
    endpoints.sort_by(|a, b| a.0.cmp(b.0));
    println!("  Endpoints:       {}", endpoints.len());
    for (name, ov) in endpoints {
        let profile = ov.profile.as_deref().unwrap_or("-");
        let changed = if ov.changes.as_ref().is_some_and(|c| !c.is_empty()) {
            " +changes"
        } else {
            ""
        };
        println!("    - {name}: profile {profile}{changed}");
    }

    let mut custom: Vec<_> = settings.custom_profiles.keys().collect();
    custom.sort();
    if !custom.is_empty() {
        let names: Vec<&str> = custom.iter().map(|s| s.as_str()).collect();
        println!("  Custom profiles: {}", names.join(", "));
    }
    Ok(())
}
