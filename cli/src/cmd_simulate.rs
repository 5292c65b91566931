//! `breakwater simulate` — drive a synthetic endpoint through the guard and
//! report circuit, bulkhead, telemetry and health state afterwards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use breakwater_core::{CallOptions, Guard, GuardSettings};
use clap::Args;

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Total number of calls to make
    #[arg(long, default_value_t = 100)]
    calls: u64,

    /// Fraction of calls that fail, in [0, 1]
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,

    /// Number of concurrent callers
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Simulated latency of each call in milliseconds
    #[arg(long, default_value_t = 5)]
    latency_ms: u64,

    /// Endpoint name to simulate
    #[arg(long, default_value = "simulated")]
    endpoint: String,

    /// Profile to apply before the run
    #[arg(long)]
    profile: Option<String>,

    /// Settings file to build the guard from
    #[arg(long)]
    config: Option<String>,

    /// Run the adaptive threshold controller during the run
    #[arg(long)]
    adaptive: bool,

    /// Adaptation period in milliseconds (with --adaptive)
    #[arg(long, default_value_t = 250)]
    adapt_interval_ms: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

/// Call `i` fails when the running count of expected failures ticks over,
/// which spreads failures evenly across the run.
fn should_fail(i: u64, rate: f64) -> bool {
    ((i + 1) as f64 * rate).floor() > (i as f64 * rate).floor()
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    if !(0.0..=1.0).contains(&args.failure_rate) {
        bail!("--failure-rate must be within [0, 1], got {}", args.failure_rate);
    }
    if args.concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }

    let mut settings = match &args.config {
        Some(path) => GuardSettings::from_path(path)
            .with_context(|| format!("invalid settings file {path}"))?,
        None => GuardSettings::default(),
    };
    if args.adaptive {
        settings.adaptive.enabled = true;
        settings.adaptive.update_interval = Duration::from_millis(args.adapt_interval_ms.max(1));
    }

    let guard = Arc::new(Guard::new(settings).context("failed to build guard")?);
    if let Some(profile) = &args.profile {
        guard
            .apply_profile(&args.endpoint, profile)
            .with_context(|| format!("cannot apply profile {profile}"))?;
    }
    let adaptive = if args.adaptive {
        guard.start_adaptive()
    } else {
        None
    };

    tracing::info!(
        endpoint = %args.endpoint,
        calls = args.calls,
        failure_rate = args.failure_rate,
        concurrency = args.concurrency,
        "simulation starting"
    );

    let next = Arc::new(AtomicU64::new(0));
    let mut workers = Vec::with_capacity(args.concurrency);
    for _ in 0..args.concurrency {
        let guard = guard.clone();
        let next = next.clone();
        let endpoint = args.endpoint.clone();
        let (calls, rate, latency) = (args.calls, args.failure_rate, args.latency_ms);
        workers.push(tokio::spawn(async move {
            let mut tally: BTreeMap<&'static str, u64> = BTreeMap::new();
            loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= calls {
                    break;
                }
                let fail = should_fail(i, rate);
                let result = guard
                    .execute_with_bulkhead(
                        &endpoint,
                        || async move {
                            tokio::time::sleep(Duration::from_millis(latency)).await;
                            if fail {
                                Err(format!("synthetic failure #{i}"))
                            } else {
                                Ok(())
                            }
                        },
                        CallOptions::default(),
                    )
                    .await;
                let key = match &result {
                    Ok(()) => "success",
                    Err(e) => e.kind(),
                };
                *tally.entry(key).or_default() += 1;
            }
            tally
        }));
    }

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    for worker in workers {
        let tally = worker.await.context("simulation worker panicked")?;
        for (key, n) in tally {
            *outcomes.entry(key).or_default() += n;
        }
    }

    if let Some(handle) = adaptive {
        handle.shutdown().await;
    }

    let stats = guard.get_stats(&args.endpoint);
    let metrics = guard.get_metrics(&args.endpoint);
    let bulkhead = guard.bulkhead_stats(&args.endpoint);
    let health = guard.health(&args.endpoint);
    let config = guard.config_snapshot(&args.endpoint);
    let adaptation = guard.adaptive_metrics(&args.endpoint);

    if args.json {
        let report = serde_json::json!({
            "endpoint": args.endpoint,
            "outcomes": outcomes,
            "circuit": stats,
            "bulkhead": bulkhead,
            "telemetry": metrics,
            "health": health,
            "config": config,
            "adaptive": adaptation,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("✓ Simulated {} calls against '{}'", args.calls, args.endpoint);
    println!("  Outcomes:");
    for (kind, n) in &outcomes {
        println!("    {kind:<20} {n}");
    }
    if let Some(s) = &stats {
        println!(
            "  Circuit:         {} (failures={} trips={})",
            s.status, s.failure_count, s.total_trips
        );
    }
    if let Some(b) = &bulkhead {
        println!(
            "  Bulkhead:        {} accepted, {} rejected, {} timed out, avg queue wait {:.1}ms",
            b.total_accepted, b.total_rejected, b.total_timeouts, b.avg_queue_wait_ms
        );
    }
    println!(
        "  Telemetry:       {:.1}% success, {:.1}% failure over {} calls",
        metrics.success_rate * 100.0,
        metrics.failure_rate * 100.0,
        metrics.total_calls
    );
    if let Some(avg) = metrics.avg_duration_ms {
        println!("  Avg duration:    {avg:.1}ms");
    }
    println!(
        "  Config:          v{} failure_threshold={}",
        config.version, config.config.circuit.failure_threshold
    );
    if let Some(a) = &adaptation {
        println!(
            "  Adaptive:        threshold {} after {} adjustments",
            a.current_threshold,
            a.history.len()
        );
    }
    let mark = if health.score >= 50 { "✓" } else { "✗" };
    println!("{mark} Health:          {} ({})", health.score, health.level);
    for issue in &health.issues {
        println!("    - {issue}");
    }
    Ok(())
}
