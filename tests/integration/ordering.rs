//! Dependency order and retry bounds, observed through scheduler events.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use pixsweep::config::CampaignConfig;
use pixsweep::core::task::TaskId;
use pixsweep::orchestration::{Campaign, SchedulerEvent};

use crate::fixtures::{drain_events, StubRunner, Workspace};

async fn run_with_events(
    cfg: CampaignConfig,
    runner: Arc<StubRunner>,
) -> Vec<SchedulerEvent> {
    let (tx, mut rx) = mpsc::channel(10_000);
    Campaign::new(cfg, runner).with_events(tx).run().await.unwrap();
    drain_events(&mut rx)
}

fn sim_of(recon: &TaskId) -> TaskId {
    TaskId(recon.as_str().replacen("recon/", "sim/", 1))
}

#[tokio::test]
async fn test_reconstruction_starts_only_after_simulation_succeeds() {
    let ws = Workspace::new();
    let mut raw = ws.raw_config();
    raw.workers = Some(4);
    let cfg = CampaignConfig::load(&ws.write_config(&raw)).unwrap();

    let events = run_with_events(cfg, Arc::new(StubRunner::new())).await;

    let mut succeeded_at: HashMap<TaskId, usize> = HashMap::new();
    let mut recon_starts = 0;
    for (i, event) in events.iter().enumerate() {
        match event {
            SchedulerEvent::TaskSucceeded { task_id, .. } => {
                succeeded_at.insert(task_id.clone(), i);
            }
            SchedulerEvent::TaskStarted { task_id, .. } if task_id.as_str().starts_with("recon/") => {
                recon_starts += 1;
                let sim = sim_of(task_id);
                assert!(
                    succeeded_at.get(&sim).is_some_and(|at| *at < i),
                    "{} started before {} succeeded",
                    task_id,
                    sim
                );
            }
            _ => {}
        }
    }
    assert_eq!(recon_starts, 6);
    assert_eq!(events.last(), Some(&SchedulerEvent::AllTasksComplete));
}

#[tokio::test]
async fn test_attempts_never_exceed_max_without_serial_fallback() {
    let ws = Workspace::new();
    let mut raw = ws.raw_config();
    raw.max_attempts = Some(2);
    raw.serial_fallback = Some(false);
    let cfg = CampaignConfig::load(&ws.write_config(&raw)).unwrap();

    let events = run_with_events(cfg, Arc::new(StubRunner::with_small_variant("2.0x0.1"))).await;

    let mut starts: HashMap<TaskId, u32> = HashMap::new();
    for event in &events {
        if let SchedulerEvent::TaskStarted { task_id, attempt } = event {
            let count = starts.entry(task_id.clone()).or_insert(0);
            *count += 1;
            assert_eq!(*count, *attempt);
        }
    }
    for (id, count) in &starts {
        if id.as_str().starts_with("sim/2.0x0.1/") {
            assert_eq!(*count, 2, "{}", id);
        } else {
            assert_eq!(*count, 1, "{}", id);
        }
    }
    assert!(!events
        .iter()
        .any(|e| matches!(e, SchedulerEvent::TaskDeferred { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::TaskFailed { .. }))
            .count(),
        3
    );
}

#[tokio::test]
async fn test_serial_fallback_adds_exactly_one_attempt() {
    let ws = Workspace::new();
    let cfg = CampaignConfig::load(&ws.write_config(&ws.raw_config())).unwrap();

    let events = run_with_events(cfg, Arc::new(StubRunner::with_small_variant("2.0x0.1"))).await;

    let deferred: Vec<&TaskId> = events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskDeferred { task_id, .. } => Some(task_id),
            _ => None,
        })
        .collect();
    assert_eq!(deferred.len(), 3);

    let max_attempt = events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskStarted { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .max();
    assert_eq!(max_attempt, Some(4));

    // Serial attempts come after every pool attempt.
    let last_pool_start = events
        .iter()
        .rposition(|e| matches!(e, SchedulerEvent::TaskStarted { attempt, .. } if *attempt <= 3));
    let first_serial_start = events
        .iter()
        .position(|e| matches!(e, SchedulerEvent::TaskStarted { attempt: 4, .. }));
    assert!(last_pool_start < first_serial_start);
}
