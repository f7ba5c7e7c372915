//! Suite runs against the file-backed store with a scripted case runner.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use replaybook::config::{EngineConfig, SuiteConfig};
use replaybook::models::{
    Execution, ExecutionKind, ExecutionResult, ExecutionStatus, LogEntry, TestCase, TestSuite,
};
use replaybook::runner::{cancelled_result, CaseRunner};
use replaybook::scheduler::Scheduler;
use replaybook::suite::{
    stop_suite, suite_snapshot, ExecutionStore, JsonStore, SuiteOrchestrator, SuiteRunOptions,
};

/// Passes every case except `failing`; `hang` waits for cancellation instead
struct Scripted {
    failing: Vec<u64>,
    hang: bool,
    runs: AtomicUsize,
}

impl Scripted {
    fn new(failing: Vec<u64>, hang: bool) -> Arc<Self> {
        Arc::new(Self {
            failing,
            hang,
            runs: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CaseRunner for Scripted {
    async fn run(&self, _e: &Execution, case: &TestCase, cancel: CancellationToken) -> ExecutionResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let delay = if self.hang {
            Duration::from_secs(30)
        } else {
            Duration::from_millis(50)
        };
        tokio::select! {
            _ = cancel.cancelled() => return cancelled_result(Vec::new()),
            _ = tokio::time::sleep(delay) => {}
        }
        if self.failing.contains(&case.id) {
            ExecutionResult::failed(format!("case {} failed", case.id))
        } else {
            ExecutionResult {
                success: true,
                logs: vec![LogEntry::info(format!("case {} ok", case.id))],
                screenshots: vec![format!("case-{}.png", case.id)],
                ..Default::default()
            }
        }
    }
}

fn suite(cases: u64, parallel: bool) -> TestSuite {
    serde_json::from_value(serde_json::json!({
        "id": 30,
        "name": "checkout",
        "is_parallel": parallel,
        "test_cases": (1..=cases).map(|id| serde_json::json!({
            "id": id, "name": format!("case {}", id), "environment_base_url": "https://shop.test"
        })).collect::<Vec<_>>()
    }))
    .unwrap()
}

async fn orchestrator(dir: &TempDir, runner: Arc<Scripted>) -> SuiteOrchestrator {
    let engine = EngineConfig {
        max_workers: 4,
        direct_isolation_ms: 0,
        ..EngineConfig::default()
    };
    let config = SuiteConfig {
        isolation_delay_ms: 0,
        parallel_stagger_ms: 0,
        store_dir: dir.path().to_path_buf(),
        ..SuiteConfig::default()
    };
    let store: Arc<dyn ExecutionStore> = Arc::new(JsonStore::open(dir.path()).await.unwrap());
    SuiteOrchestrator::new(Scheduler::new(&engine, runner), store, config)
}

#[tokio::test]
async fn parallel_suite_persists_children_and_aggregates() {
    let dir = TempDir::new().unwrap();
    let runner = Scripted::new(vec![2], false);
    let orchestrator = orchestrator(&dir, runner.clone()).await;

    let record = orchestrator
        .run(suite(3, true), SuiteRunOptions::default())
        .await
        .unwrap();

    assert_eq!(record.execution_type, ExecutionKind::TestSuite);
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_message, "1 of 3 test cases failed");
    assert_eq!((record.passed_count, record.failed_count, record.total_count), (2, 1, 3));
    assert_eq!(record.screenshots.len(), 2);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 3);

    // A fresh handle on the same directory sees the same records
    let reopened = JsonStore::open(dir.path()).await.unwrap();
    let children = reopened.children(record.id).await.unwrap();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|c| c.status.is_terminal()));
    assert!(children
        .iter()
        .all(|c| c.execution_type == ExecutionKind::TestCaseInternal));

    let snapshot = suite_snapshot(&reopened, record.id).await.unwrap();
    assert_eq!((snapshot.passed_count, snapshot.failed_count), (2, 1));
}

#[tokio::test]
async fn resume_reruns_only_what_failed_in_the_parent() {
    let dir = TempDir::new().unwrap();
    let first = orchestrator(&dir, Scripted::new(vec![3], false))
        .await
        .run(suite(3, false), SuiteRunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Failed);

    let runner = Scripted::new(Vec::new(), false);
    let second = orchestrator(&dir, runner.clone())
        .await
        .run(
            suite(3, false),
            SuiteRunOptions {
                resume_failed: true,
                parent_execution_id: Some(first.id),
            },
        )
        .await
        .unwrap();

    assert_eq!(second.status, ExecutionStatus::Passed);
    assert_eq!(second.passed_count, 3);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

    // Copied cases bring their evidence along with their count
    let mut screenshots = second.screenshots.clone();
    screenshots.sort();
    assert_eq!(screenshots, vec!["case-1.png", "case-2.png", "case-3.png"]);
    for id in 1..=3 {
        let line = format!("case {} ok", id);
        assert!(second.execution_logs.iter().any(|l| l.message == line));
    }
}

#[tokio::test]
async fn stop_from_another_store_handle_cancels_running_cases() {
    let dir = TempDir::new().unwrap();
    let runner = Scripted::new(Vec::new(), true);
    let orchestrator = orchestrator(&dir, runner.clone()).await;

    let task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(suite(2, true), SuiteRunOptions::default()).await })
    };

    // Another process would only have the directory
    let other = JsonStore::open(dir.path()).await.unwrap();
    let suite_id = loop {
        let running: Vec<Execution> = other.with_status(ExecutionStatus::Running).await.unwrap();
        let children = running
            .iter()
            .filter(|e| e.execution_type == ExecutionKind::TestCaseInternal)
            .count();
        if let (Some(suite), 2) = (
            running.iter().find(|e| e.execution_type == ExecutionKind::TestSuite),
            children,
        ) {
            break suite.id;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let cancelled = stop_suite(&other, None, suite_id).await.unwrap();
    assert_eq!(cancelled, 2);

    let record = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("suite did not notice the stop")
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.passed_count, 0);

    for child in other.children(suite_id).await.unwrap() {
        assert_eq!(child.status, ExecutionStatus::Cancelled);
    }
    assert!(stop_suite(&other, None, suite_id).await.is_err());
}
