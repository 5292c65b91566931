//! End-to-end behaviour through the public `Guard` API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use breakwater_core::events::MemorySink;
use breakwater_core::policy::{AdaptationOutcome, Bulkhead};
use breakwater_core::{
    AdaptiveConfig, BulkheadConfig, CallOptions, CircuitStatus, ConfigChanges, Guard, GuardError,
    GuardSettings, InvalidField,
};

type Work = Result<u32, std::io::Error>;

fn guard_with(failure_threshold: u32) -> (Guard, Arc<MemorySink>) {
    let mut settings = GuardSettings::default();
    settings.defaults.circuit.failure_threshold = failure_threshold;
    let sink = Arc::new(MemorySink::new());
    let guard = Guard::with_sink(settings, sink.clone()).expect("valid settings");
    (guard, sink)
}

async fn fail() -> Work {
    Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down"))
}

async fn succeed() -> Work {
    Ok(1)
}

#[tokio::test]
async fn three_failures_open_the_circuit() {
    let (guard, _) = guard_with(3);
    let calls = AtomicUsize::new(0);
    let counted = || {
        calls.fetch_add(1, Ordering::SeqCst);
        fail()
    };

    for _ in 0..3 {
        let err = guard
            .execute("svc", counted, CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution_error");
    }
    let err = guard
        .execute("svc", counted, CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, GuardError::CircuitOpen { .. }));
    assert!(err.is_rejection());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_admits_trial_after_reset_timeout() {
    let (guard, sink) = guard_with(1);
    guard.execute("svc", fail, CallOptions::default()).await.unwrap_err();
    assert_eq!(guard.get_stats("svc").unwrap().status, CircuitStatus::Open);

    tokio::time::advance(Duration::from_millis(29_999)).await;
    let calls = AtomicUsize::new(0);
    let err = guard
        .execute(
            "svc",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                succeed()
            },
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::CircuitOpen { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_millis(2)).await;
    guard
        .execute(
            "svc",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                succeed()
            },
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // success_threshold defaults to 1, so one good trial closes it again
    assert_eq!(guard.get_stats("svc").unwrap().status, CircuitStatus::Closed);
    // closed → open, open → half_open, half_open → closed
    assert_eq!(sink.count("svc", "state_change"), 3);
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens_immediately() {
    let (guard, _) = guard_with(1);
    guard
        .update_config("svc", &ConfigChanges::new().success_threshold(2))
        .unwrap();
    guard.execute("svc", fail, CallOptions::default()).await.unwrap_err();

    tokio::time::advance(Duration::from_secs(31)).await;
    guard.execute("svc", succeed, CallOptions::default()).await.unwrap();
    assert_eq!(guard.get_stats("svc").unwrap().status, CircuitStatus::HalfOpen);

    guard.execute("svc", fail, CallOptions::default()).await.unwrap_err();
    let stats = guard.get_stats("svc").unwrap();
    assert_eq!(stats.status, CircuitStatus::Open);
    assert_eq!(stats.total_trips, 2);
}

#[tokio::test]
async fn bulkhead_grants_queues_and_rejects() {
    let sink = Arc::new(MemorySink::new());
    let bulkhead = Arc::new(Bulkhead::new(
        "svc",
        BulkheadConfig {
            max_concurrent: 2,
            max_queued: 1,
            queue_timeout: Duration::from_secs(5),
        },
        breakwater_core::events::EventBus::new(sink.clone()),
    ));

    let first = bulkhead.acquire(None).await.unwrap();
    let second = bulkhead.acquire(None).await.unwrap();

    let queued = {
        let bulkhead = bulkhead.clone();
        tokio::spawn(async move { bulkhead.acquire(None).await.map(|_| ()) })
    };
    while bulkhead.snapshot().queued == 0 {
        tokio::task::yield_now().await;
    }

    let err = bulkhead.acquire(None).await.unwrap_err();
    assert!(matches!(err, GuardError::BulkheadQueueFull { .. }));

    let snap = bulkhead.snapshot();
    assert_eq!((snap.active, snap.queued, snap.total_rejected), (2, 1, 1));

    drop(first);
    queued.await.unwrap().unwrap();
    drop(second);
    assert_eq!(bulkhead.snapshot().active, 0);
    assert_eq!(sink.count("svc", "bulkhead_accepted"), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_the_limit() {
    let (guard, _) = guard_with(1_000);
    guard
        .update_config(
            "svc",
            &ConfigChanges::new().bulkhead(
                breakwater_core::BulkheadChanges::new()
                    .max_concurrent(3)
                    .max_queued(100),
            ),
        )
        .unwrap();
    let guard = Arc::new(guard);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let guard = guard.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                guard
                    .execute_with_bulkhead(
                        "svc",
                        || async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, std::io::Error>(())
                        },
                        CallOptions::default(),
                    )
                    .await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(guard.get_metrics("svc").successes, 40);
    assert_eq!(guard.bulkhead_stats("svc").unwrap().active, 0);
}

#[tokio::test]
async fn aborted_holder_frees_its_slot() {
    let (guard, _) = guard_with(5);
    guard
        .update_config(
            "svc",
            &ConfigChanges::new().bulkhead(
                breakwater_core::BulkheadChanges::new()
                    .max_concurrent(1)
                    .max_queued(0),
            ),
        )
        .unwrap();
    let guard = Arc::new(guard);

    let holder = {
        let guard = guard.clone();
        tokio::spawn(async move {
            guard
                .execute_with_bulkhead(
                    "svc",
                    || async {
                        std::future::pending::<()>().await;
                        Ok::<u32, std::io::Error>(0)
                    },
                    CallOptions::default(),
                )
                .await
        })
    };
    while guard.bulkhead_stats("svc").unwrap().active == 0 {
        tokio::task::yield_now().await;
    }

    let err = guard
        .execute_with_bulkhead("svc", succeed, CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::BulkheadFull { .. }));

    holder.abort();
    let _ = holder.await;
    assert_eq!(guard.bulkhead_stats("svc").unwrap().active, 0);
    guard
        .execute_with_bulkhead("svc", succeed, CallOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn adaptive_step_keeps_threshold_at_five() {
    let settings = GuardSettings {
        adaptive: AdaptiveConfig {
            enabled: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let guard = Guard::with_sink(settings, Arc::new(breakwater_core::events::NoopSink)).unwrap();

    // 15 calls, 6 failures, never 5 in a row: error rate 0.4
    for i in 0..15 {
        if i % 5 < 2 {
            guard.execute("svc", fail, CallOptions::default()).await.unwrap_err();
        } else {
            guard.execute("svc", succeed, CallOptions::default()).await.unwrap();
        }
    }
    let metrics = guard.get_metrics("svc");
    assert_eq!(metrics.total_calls, 15);
    assert_eq!(metrics.failures, 6);

    let outcomes = guard.adapt_now();
    assert_eq!(
        outcomes,
        vec![("svc".to_string(), AdaptationOutcome::Unchanged { threshold: 5 })]
    );
    assert_eq!(guard.get_config("svc").circuit.failure_threshold, 5);
}

#[tokio::test]
async fn adaptive_thresholds_stay_in_bounds() {
    let settings = GuardSettings {
        adaptive: AdaptiveConfig {
            enabled: true,
            adaptation_factor: 0.5,
            min_threshold: 3,
            max_threshold: 8,
            ..Default::default()
        },
        ..Default::default()
    };
    let guard = Guard::with_sink(settings, Arc::new(breakwater_core::events::NoopSink)).unwrap();

    for _ in 0..20 {
        guard.execute("good", succeed, CallOptions::default()).await.unwrap();
    }
    // keep the circuit closed so every failure is an executed call
    guard
        .update_config("bad", &ConfigChanges::new().failure_threshold(100))
        .unwrap();
    for _ in 0..20 {
        guard.execute("bad", fail, CallOptions::default()).await.unwrap_err();
    }

    for _ in 0..5 {
        guard.adapt_now();
        for name in ["good", "bad"] {
            let t = guard.get_config(name).circuit.failure_threshold;
            assert!((3..=8).contains(&t), "{name}: {t}");
        }
    }
    assert_eq!(guard.get_config("good").circuit.failure_threshold, 8);
    assert_eq!(guard.get_config("bad").circuit.failure_threshold, 3);
    assert_eq!(guard.adaptive_metrics("bad").unwrap().current_threshold, 3);
}

#[test]
fn invalid_update_changes_nothing() {
    let (guard, _) = guard_with(5);
    let before = guard.config_snapshot("svc");

    let err = guard
        .update_config(
            "svc",
            &ConfigChanges::new().failure_threshold(-1).timeout_ms(0),
        )
        .unwrap_err();
    assert_eq!(
        err.invalid_fields(),
        Some(&[InvalidField::FailureThreshold, InvalidField::Timeout][..])
    );

    let single = guard
        .update_config("svc", &ConfigChanges::new().failure_threshold(-1))
        .unwrap_err();
    assert_eq!(single.to_string(), "invalid config: invalid_failure_threshold");

    let after = guard.config_snapshot("svc");
    assert_eq!(after.version, before.version);
    assert_eq!(after.config, before.config);
}

#[test]
fn profile_then_rollback_restores_prior_values() {
    let (guard, sink) = guard_with(5);
    let before = guard.config_snapshot("svc");

    let applied = guard.apply_profile("svc", "aggressive").unwrap();
    assert_eq!(guard.get_config("svc").circuit.failure_threshold, 10);

    let rolled = guard.rollback("svc").unwrap();
    let after = guard.config_snapshot("svc");
    assert_eq!(after.config, before.config);
    assert!(rolled > applied);
    assert!(applied > before.version);
    assert_eq!(sink.count("svc", "profile_applied"), 1);
    assert_eq!(sink.count("svc", "config_rollback"), 1);

    let err = guard.rollback("svc").unwrap_err();
    assert_eq!(err.kind(), "no_history");
}

#[tokio::test]
async fn health_reflects_open_circuit() {
    let (guard, _) = guard_with(1);
    guard.execute("bad", fail, CallOptions::default()).await.unwrap_err();
    guard.execute("good", succeed, CallOptions::default()).await.unwrap();

    let bad = guard.health("bad");
    assert_eq!(bad.status, Some(CircuitStatus::Open));
    assert_eq!(bad.score, 10);
    assert!(bad.issues.iter().any(|i| i == "circuit open"));

    let good = guard.health("good");
    assert_eq!(good.score, 100);

    let system = guard.system_health();
    assert_eq!(system.endpoints.len(), 2);
    assert_eq!(system.counts.critical, 1);
    assert_eq!(system.critical_penalty, 10);
    assert_eq!(system.score, 45);
}
