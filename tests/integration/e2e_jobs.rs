//! End-to-end job runtime tests over the wired kit with a durable queue.

use basekit::{Config, Dependencies, Kit};
use bk_jobs::{EnqueueOptions, JobError, handler};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn test_config(queue_path: std::path::PathBuf) -> Config {
    let mut config = Config::default();
    config.dev_mode = true;
    config.broker.heartbeat_secs = 600;
    config.broker.cleanup_secs = 600;
    config.jobs.queue_path = Some(queue_path);
    config.jobs.poll_ms = 20;
    config
}

async fn start_kit(config: Config) -> (SocketAddr, Kit) {
    let kit = basekit::wire(config, Dependencies::default())
        .await
        .expect("wiring failed");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind server");
    let addr = listener.local_addr().expect("local addr");
    let router = kit.router(axum::Router::new());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server error");
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, kit)
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Scenario: a registered handler runs exactly once with the enqueued
/// payload and the job completes.
#[tokio::test]
async fn typed_job_runs_exactly_once_with_its_payload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_addr, kit) = start_kit(test_config(dir.path().join("queue.sqlite3"))).await;

    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(std::sync::Mutex::new(String::new()));
    {
        let calls = Arc::clone(&calls);
        let seen = Arc::clone(&seen);
        kit.jobs.handle(
            "report:build",
            handler(move |_ctx, payload| {
                let calls = Arc::clone(&calls);
                let seen = Arc::clone(&seen);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    *seen.lock().expect("seen lock") =
                        String::from_utf8_lossy(&payload).into_owned();
                    Ok(())
                }
            }),
        );
    }

    kit.jobs
        .enqueue(
            "report:build",
            br#"{"user_id":"u1"}"#.to_vec(),
            EnqueueOptions::default(),
        )
        .await
        .expect("enqueue");

    wait_for(|| calls.load(Ordering::SeqCst) == 1, "job to run").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one invocation");
    assert_eq!(seen.lock().expect("seen lock").as_str(), r#"{"user_id":"u1"}"#);

    kit.shutdown().await;
}

/// A persistently failing job retries with backoff and surfaces in the
/// dead-letter count on `/stats`.
#[tokio::test]
async fn failing_job_dead_letters_and_shows_in_stats() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (addr, kit) = start_kit(test_config(dir.path().join("queue.sqlite3"))).await;

    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = Arc::clone(&calls);
        kit.jobs.handle(
            "always:fails",
            handler(move |_ctx, _payload| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::Retryable("backend unreachable".to_owned()))
                }
            }),
        );
    }

    kit.jobs
        .enqueue(
            "always:fails",
            Vec::new(),
            EnqueueOptions {
                max_retries: Some(1),
                ..EnqueueOptions::default()
            },
        )
        .await
        .expect("enqueue");

    // 1 initial attempt + 1 retry (default backoff base is one second).
    wait_for(|| calls.load(Ordering::SeqCst) == 2, "both invocations").await;

    let http = reqwest::Client::new();
    let mut dead = 0;
    for _ in 0..100 {
        let stats: serde_json::Value = http
            .get(format!("http://{addr}/stats"))
            .send()
            .await
            .expect("stats request")
            .json()
            .await
            .expect("stats json");
        dead = stats["jobs"]["dead"].as_u64().unwrap_or(0);
        if dead == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(dead, 1, "the exhausted job must be visible to operators");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    kit.shutdown().await;
}

/// Graceful shutdown: after `shutdown` returns no handler is in flight and
/// new enqueues are refused.
#[tokio::test]
async fn shutdown_drains_in_flight_work_and_closes_intake() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_addr, kit) = start_kit(test_config(dir.path().join("queue.sqlite3"))).await;

    let finished = Arc::new(AtomicU32::new(0));
    {
        let finished = Arc::clone(&finished);
        kit.jobs.handle(
            "slow:job",
            handler(move |_ctx, _payload| {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
    }
    kit.jobs
        .enqueue("slow:job", Vec::new(), EnqueueOptions::default())
        .await
        .expect("enqueue");
    // Let the dispatcher lease it before draining.
    tokio::time::sleep(Duration::from_millis(100)).await;

    kit.shutdown().await;
    assert_eq!(
        finished.load(Ordering::SeqCst),
        1,
        "shutdown returns only after the in-flight job finished"
    );

    let err = kit
        .jobs
        .enqueue("slow:job", Vec::new(), EnqueueOptions::default())
        .await
        .expect_err("intake must be closed");
    assert!(matches!(err, bk_jobs::EnqueueError::ShuttingDown));
}

/// The maintenance chains bootstrapped by `wire` stay pending as scheduled
/// work on the durable queue.
#[tokio::test]
async fn wire_bootstraps_the_maintenance_chains() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (addr, kit) = start_kit(test_config(dir.path().join("queue.sqlite3"))).await;

    let stats: serde_json::Value = reqwest::Client::new()
        .get(format!("http://{addr}/stats"))
        .send()
        .await
        .expect("stats request")
        .json()
        .await
        .expect("stats json");
    assert_eq!(
        stats["jobs"]["scheduled"], 2,
        "cleanup:sessions and accounts:unlock are scheduled"
    );

    kit.shutdown().await;
}
