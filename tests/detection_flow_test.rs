mod common;

use std::time::Duration as StdDuration;

use assert_matches::assert_matches;
use chrono::{Duration, SubsecRound, Utc};
use common::TestHarness;
use telemetry_anomaly::config::DetectionConfig;
use telemetry_anomaly::task_queue::TaskQueue;
use telemetry_anomaly::worker::TaskOutcome;
use telemetry_anomaly::{Scheduler, WorkerPool};
use tokio::sync::watch;

fn armed() -> DetectionConfig {
    DetectionConfig {
        schedule_enabled: true,
        worker_concurrency: 2,
        ..DetectionConfig::default()
    }
}

fn baseline_with_spike() -> Vec<f64> {
    let mut values = vec![100.0; 10];
    values.push(300.0);
    values
}

#[tokio::test]
async fn scheduled_scan_detects_engine_temp_spike() {
    let harness = TestHarness::new(armed()).await;
    let end = (Utc::now() - Duration::seconds(1)).trunc_subsecs(0);
    let samples = harness
        .seed_series("rocket-1", "engine_temp", end, 10, &baseline_with_spike())
        .await;
    let spike = samples.last().unwrap();

    let scheduler = Scheduler::from_context(&harness.ctx);
    let summary = scheduler.tick().await.unwrap().unwrap();
    assert_eq!(summary.pairs_found, 1);
    assert_eq!(summary.enqueued, 1);
    assert_eq!(harness.queue.len().await.unwrap(), 1);

    let workers = WorkerPool::from_context(&harness.ctx);
    let outcome = workers.process_next().await.unwrap().unwrap();
    assert_matches!(
        outcome,
        TaskOutcome::Completed { ref status, .. }
            if status == "Detected 1 anomalies for rocket-1/engine_temp."
    );

    let findings = harness
        .anomalies
        .find_by_asset("rocket-1", end - Duration::hours(1), end)
        .await
        .unwrap();
    assert_eq!(findings.len(), 1);

    let finding = &findings[0];
    assert_eq!(finding.telemetry_id, Some(spike.id));
    assert_eq!(finding.timestamp, spike.timestamp);
    assert_eq!(finding.metric, "engine_temp");
    assert!(finding.score > 3.0);
    assert!((finding.score - 10f64.sqrt()).abs() < 1e-9);

    let details = finding.details.clone().unwrap();
    assert_eq!(details["window_size"], 11);
    assert!((details["mean"].as_f64().unwrap() - 1300.0 / 11.0).abs() < 1e-9);
    assert!(finding
        .explanation
        .as_deref()
        .unwrap()
        .starts_with("Anomaly detected for rocket-1/engine_temp: Value 300 is 3.16"));
}

#[tokio::test]
async fn rescanning_does_not_duplicate_findings() {
    let harness = TestHarness::new(armed()).await;
    let end = Utc::now() - Duration::seconds(1);
    harness
        .seed_series("rocket-1", "engine_temp", end, 10, &baseline_with_spike())
        .await;

    let scheduler = Scheduler::from_context(&harness.ctx);
    let workers = WorkerPool::from_context(&harness.ctx);

    for _ in 0..3 {
        scheduler.scan_once().await.unwrap();
        let outcome = workers.process_next().await.unwrap().unwrap();
        assert_matches!(outcome, TaskOutcome::Completed { .. });
    }

    assert_eq!(harness.anomalies.count().await.unwrap(), 1);
}

#[tokio::test]
async fn scan_skips_pairs_without_recent_samples() {
    let harness = TestHarness::new(armed()).await;
    let now = Utc::now();
    harness
        .seed_series("rocket-1", "engine_temp", now - Duration::seconds(5), 10, &[1.0, 2.0])
        .await;
    harness
        .seed_series("rocket-9", "engine_temp", now - Duration::hours(3), 10, &[1.0, 2.0])
        .await;

    let summary = Scheduler::from_context(&harness.ctx)
        .scan_once_at(now)
        .await
        .unwrap();
    assert_eq!(summary.pairs_found, 1);

    let task = harness
        .queue
        .dequeue(StdDuration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.name(), "detect");
    assert_eq!(
        serde_json::to_value(&task).unwrap()["kind"]["args"],
        serde_json::json!({ "asset_id": "rocket-1", "metric": "engine_temp" })
    );
}

#[tokio::test]
async fn worker_pool_drains_all_pairs_and_stops() {
    let harness = TestHarness::new(armed()).await;
    let end = Utc::now() - Duration::seconds(1);
    harness
        .seed_series("rocket-1", "engine_temp", end, 10, &baseline_with_spike())
        .await;
    harness
        .seed_series("rocket-2", "engine_temp", end, 10, &[50.0; 12])
        .await;
    harness
        .seed_series("rocket-3", "chamber_pressure", end, 10, &[1.0, 2.0, 3.0])
        .await;

    let summary = Scheduler::from_context(&harness.ctx).scan_once().await.unwrap();
    assert_eq!(summary.enqueued, 3);

    let (tx, rx) = watch::channel(false);
    let handles = WorkerPool::from_context(&harness.ctx).start(rx);

    for _ in 0..200 {
        if harness.queue.len().await.unwrap() == 0 && harness.queue.in_flight() == 0 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(harness.queue.len().await.unwrap(), 0);
    assert_eq!(harness.queue.in_flight(), 0);

    tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(harness.anomalies.count().await.unwrap(), 1);
}
