//! Scheduler contract through the public API: backpressure, cancellation of
//! queued work, and the persistence acknowledgement gate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use replaybook::config::EngineConfig;
use replaybook::models::{Execution, ExecutionResult, ExecutionStatus, TestCase};
use replaybook::runner::{cancelled_result, CaseRunner};
use replaybook::scheduler::Scheduler;

/// Holds every case until cancelled; records the order cases started in
#[derive(Default)]
struct Holding {
    started: Mutex<Vec<u64>>,
}

#[async_trait]
impl CaseRunner for Holding {
    async fn run(&self, execution: &Execution, _c: &TestCase, cancel: CancellationToken) -> ExecutionResult {
        self.started.lock().unwrap().push(execution.id);
        tokio::select! {
            _ = cancel.cancelled() => cancelled_result(Vec::new()),
            _ = tokio::time::sleep(Duration::from_secs(3600)) => ExecutionResult {
                success: true,
                ..Default::default()
            },
        }
    }
}

fn engine(workers: usize) -> EngineConfig {
    EngineConfig {
        max_workers: workers,
        direct_isolation_ms: 0,
        ..EngineConfig::default()
    }
}

fn job(id: u64) -> (Execution, TestCase) {
    let mut execution = Execution::for_case(id);
    execution.id = id;
    let case: TestCase = serde_json::from_value(serde_json::json!({
        "id": id, "name": format!("case {}", id), "environment_base_url": "https://x.test"
    }))
    .unwrap();
    (execution, case)
}

#[tokio::test(start_paused = true)]
async fn full_queue_holds_the_submitter() {
    let runner = Arc::new(Holding::default());
    let scheduler = Scheduler::new(&engine(1), runner.clone());

    let (e, c) = job(1);
    let first = scheduler.submit(e, c).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*runner.started.lock().unwrap(), vec![1]);

    // One worker busy, two queued slots
    let mut queued = Vec::new();
    for id in 2..=3 {
        let (e, c) = job(id);
        queued.push(scheduler.submit(e, c).await.unwrap());
    }

    let blocked = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let (e, c) = job(4);
            scheduler.submit(e, c).await
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!blocked.is_finished());
    assert_eq!(scheduler.running_count(), 4);

    assert!(scheduler.cancel(1));
    assert!(first.await.unwrap().cancelled);
    scheduler.acknowledge(1);

    let fourth = tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .expect("submit stayed blocked after a slot freed")
        .unwrap();
    assert!(fourth.is_ok());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*runner.started.lock().unwrap(), vec![1, 2]);
    scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn cancelled_while_queued_never_reaches_the_runner() {
    let runner = Arc::new(Holding::default());
    let scheduler = Scheduler::new(&engine(1), runner.clone());

    let (e, c) = job(10);
    let running = scheduler.submit(e, c).await.unwrap();
    let (e, c) = job(11);
    let waiting = scheduler.submit(e, c).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(scheduler.cancel(11));
    assert!(scheduler.cancel(10));
    assert!(running.await.unwrap().cancelled);
    scheduler.acknowledge(10);

    let result = waiting.await.unwrap();
    assert!(result.cancelled);
    assert_eq!(result.status(), ExecutionStatus::Cancelled);
    assert_eq!(*runner.started.lock().unwrap(), vec![10]);
}

#[tokio::test(start_paused = true)]
async fn slot_is_released_only_after_acknowledgement() {
    let runner = Arc::new(Holding::default());
    let scheduler = Scheduler::new(&engine(2), runner);
    assert_eq!(scheduler.max_workers(), 2);

    let (e, c) = job(20);
    let rx = scheduler.submit(e.clone(), c.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    scheduler.cancel(20);
    rx.await.unwrap();

    // The result is out but not yet persisted, so the id is still claimed
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(scheduler.is_running(20));
    assert!(scheduler.submit(e.clone(), c.clone()).await.is_err());

    scheduler.acknowledge(20);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!scheduler.is_running(20));
    assert_eq!(scheduler.running_count(), 0);
    assert!(scheduler.submit(e, c).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn shutdown_forgets_queued_executions() {
    let runner = Arc::new(Holding::default());
    let scheduler = Scheduler::new(&engine(1), runner.clone());

    let (e, c) = job(40);
    let running = scheduler.submit(e, c).await.unwrap();
    let (e, c) = job(41);
    let queued = scheduler.submit(e, c).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.running_count(), 2);

    scheduler.shutdown();
    assert!(!scheduler.is_running(41));
    assert!(scheduler.is_running(40));

    assert!(running.await.unwrap().cancelled);
    scheduler.acknowledge(40);

    // The freed worker answers the queued job instead of running it
    assert!(queued.await.unwrap().cancelled);
    assert_eq!(*runner.started.lock().unwrap(), vec![40]);
    assert_eq!(scheduler.running_count(), 0);

    let (e, c) = job(42);
    assert!(scheduler.submit(e, c).await.is_err());
    assert!(!scheduler.is_running(42));
}
