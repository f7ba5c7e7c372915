//! Suite runs: one suite record plus one case-internal record per test case.

pub mod store;
pub mod watcher;

pub use store::{ExecutionStore, JsonStore, MemoryStore};
pub use watcher::{spawn_sweeper, sweep, watch_execution, SweepReport};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::SuiteConfig;
use crate::error::{ReplayError, Result};
use crate::models::{
    Execution, ExecutionResult, ExecutionStatus, LogEntry, TestCase, TestSuite,
};
use crate::runner::contain;
use crate::scheduler::Scheduler;

const STOP_POLL: Duration = Duration::from_secs(1);
const STUCK_MESSAGE: &str = "Test case execution did not complete properly";

#[derive(Debug, Clone, Default)]
pub struct SuiteRunOptions {
    /// Only run cases whose latest record did not pass
    pub resume_failed: bool,
    /// Scope the "latest record" lookup to this earlier suite execution
    pub parent_execution_id: Option<u64>,
}

/// Counters and artifacts folded from finished cases
#[derive(Debug, Default)]
struct Aggregate {
    passed: usize,
    failed: usize,
    logs: Vec<LogEntry>,
    screenshots: Vec<String>,
    completed: HashMap<u64, ExecutionStatus>,
}

impl Aggregate {
    fn record(&mut self, execution: &Execution, result: &ExecutionResult) {
        match result.status() {
            ExecutionStatus::Passed => self.passed += 1,
            ExecutionStatus::Failed => self.failed += 1,
            _ => {}
        }
        self.logs.extend(result.logs.iter().cloned());
        self.screenshots.extend(result.screenshots.iter().cloned());
        self.completed.insert(execution.id, result.status());
    }

    /// Count a child whose passing outcome was copied from an earlier run
    fn carry(&mut self, child: &Execution) {
        self.passed += 1;
        self.logs.extend(child.execution_logs.iter().cloned());
        self.screenshots.extend(child.screenshots.iter().cloned());
        self.completed.insert(child.id, ExecutionStatus::Passed);
    }
}

type SharedAggregate = Arc<Mutex<Aggregate>>;

fn lock(aggregate: &SharedAggregate) -> std::sync::MutexGuard<'_, Aggregate> {
    aggregate.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct SuiteOrchestrator {
    scheduler: Scheduler,
    store: Arc<dyn ExecutionStore>,
    config: SuiteConfig,
}

impl SuiteOrchestrator {
    pub fn new(scheduler: Scheduler, store: Arc<dyn ExecutionStore>, config: SuiteConfig) -> Self {
        Self {
            scheduler,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Run `suite` to completion and return its final suite record.
    ///
    /// Pre-flight failures (nothing to rerun, not enough free workers) return
    /// an error before any record is written.
    pub async fn run(&self, suite: TestSuite, options: SuiteRunOptions) -> Result<Execution> {
        let plan = self.plan(&suite, &options).await?;

        let required = if suite.is_parallel { plan.to_run.len() } else { 1 };
        let running = self.scheduler.running_count();
        let max = self.scheduler.max_workers();
        if running + required > max {
            return Err(ReplayError::CapacityExceeded {
                running,
                required,
                max,
            });
        }

        let mut suite_record = Execution::for_suite(suite.id, suite.test_cases.len());
        suite_record.mark_running();
        let suite_record = self.store.create(suite_record).await?;
        tracing::info!(
            "Suite {} ({}) started as execution {}: {} to run, {} already passed",
            suite.id,
            suite.name,
            suite_record.id,
            plan.to_run.len(),
            plan.already_passed.len()
        );

        let aggregate: SharedAggregate = Arc::new(Mutex::new(Aggregate::default()));
        let mut queued = Vec::with_capacity(plan.to_run.len());
        for case in &suite.test_cases {
            let mut child = Execution::for_suite_case(case.id, suite.id, suite_record.id);
            if let Some(prior) = plan.already_passed.get(&case.id) {
                child.copy_outcome_from(prior);
                let child = self.store.create(child).await?;
                lock(&aggregate).carry(&child);
            } else {
                queued.push((self.store.create(child).await?, case.clone()));
            }
        }

        let suite_id = suite_record.id;
        let stop_watch = self.spawn_stop_watch(suite_id, queued.iter().map(|(e, _)| e.id).collect());

        let body = {
            let this = self.clone();
            let aggregate = aggregate.clone();
            let parallel = suite.is_parallel;
            async move {
                if parallel {
                    this.run_parallel(suite_id, queued, aggregate).await
                } else {
                    this.run_serial(suite_id, queued, aggregate).await
                }
            }
        };
        let outcome = contain(body).await;
        stop_watch.cancel();

        match outcome {
            Ok(Ok(())) => self.complete(suite_id, &aggregate).await,
            Ok(Err(e)) => self.fail_suite(suite_id, &aggregate, e.to_string()).await,
            Err(fault) => {
                tracing::error!("Suite execution {} fault: {}", suite_id, fault);
                self.fail_suite(suite_id, &aggregate, format!("Suite execution panic: {}", fault))
                    .await
            }
        }
    }

    async fn plan(&self, suite: &TestSuite, options: &SuiteRunOptions) -> Result<Plan> {
        let mut plan = Plan::default();
        for case in &suite.test_cases {
            if options.resume_failed {
                let prior = self
                    .store
                    .latest_for_case(case.id, options.parent_execution_id)
                    .await?;
                if let Some(prior) = prior.filter(|p| p.status == ExecutionStatus::Passed) {
                    plan.already_passed.insert(case.id, prior);
                    continue;
                }
            }
            plan.to_run.push(case.id);
        }
        if options.resume_failed && plan.to_run.is_empty() {
            return Err(ReplayError::Other(
                "All test cases already passed; nothing to rerun".to_string(),
            ));
        }
        Ok(plan)
    }

    async fn suite_cancelled(&self, suite_id: u64) -> bool {
        matches!(
            self.store.get(suite_id).await.map(|s| s.status),
            Ok(ExecutionStatus::Cancelled)
        )
    }

    async fn cancel_record(&self, execution: &mut Execution) {
        execution.finish(ExecutionStatus::Cancelled, "Suite execution was stopped");
        if let Err(e) = self.store.finalize(execution).await {
            tracing::warn!("Could not mark execution {} cancelled: {}", execution.id, e);
        }
    }

    /// Mark running, hand to the scheduler, persist and acknowledge
    async fn run_case(&self, mut execution: Execution, case: TestCase) -> (Execution, ExecutionResult) {
        execution.mark_running();
        if let Err(e) = self.store.save(&execution).await {
            tracing::warn!("Could not mark execution {} running: {}", execution.id, e);
        }
        let safety = watch_execution(
            self.store.clone(),
            self.scheduler.clone(),
            execution.id,
            Duration::from_secs(self.config.safety_timeout_secs),
        );

        let result = match self.scheduler.run_direct(execution.clone(), case).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failed(e.to_string()),
        };

        execution.apply_result(&result);
        match self.store.finalize(&execution).await {
            Ok(_) => self.scheduler.acknowledge(execution.id),
            Err(e) => tracing::error!("Could not persist execution {}: {}", execution.id, e),
        }
        safety.abort();
        (execution, result)
    }

    async fn run_serial(
        &self,
        suite_id: u64,
        queued: Vec<(Execution, TestCase)>,
        aggregate: SharedAggregate,
    ) -> Result<()> {
        let mut remaining = queued.into_iter();
        let mut first = true;

        while let Some((execution, case)) = remaining.next() {
            if !first {
                tokio::time::sleep(Duration::from_millis(self.config.isolation_delay_ms)).await;
            }
            first = false;

            if self.suite_cancelled(suite_id).await {
                tracing::info!("Suite execution {} stopped; cancelling the rest", suite_id);
                for (mut pending, _) in std::iter::once((execution, case)).chain(remaining) {
                    self.cancel_record(&mut pending).await;
                }
                break;
            }

            let (execution, result) = self.run_case(execution, case).await;
            lock(&aggregate).record(&execution, &result);
        }
        Ok(())
    }

    async fn run_parallel(
        &self,
        suite_id: u64,
        queued: Vec<(Execution, TestCase)>,
        aggregate: SharedAggregate,
    ) -> Result<()> {
        let stagger = Duration::from_millis(self.config.parallel_stagger_ms);
        let mut tasks = Vec::with_capacity(queued.len());

        for (index, (mut execution, case)) in queued.into_iter().enumerate() {
            if self.suite_cancelled(suite_id).await {
                self.cancel_record(&mut execution).await;
                continue;
            }

            let this = self.clone();
            let aggregate = aggregate.clone();
            let execution_id = execution.id;
            let task = async move {
                tokio::time::sleep(stagger * index as u32).await;
                if this.suite_cancelled(suite_id).await {
                    let mut execution = execution;
                    this.cancel_record(&mut execution).await;
                    return;
                }
                let (execution, result) = this.run_case(execution, case).await;
                lock(&aggregate).record(&execution, &result);
            };
            tasks.push((execution_id, tokio::spawn(task)));
        }

        for (execution_id, task) in tasks {
            if let Err(e) = task.await {
                // The case task itself died; its record is healed as stuck below
                tracing::error!("Suite case task for execution {} failed: {}", execution_id, e);
            }
        }
        Ok(())
    }

    /// Cancel in-flight children once a stop request lands on the suite record
    fn spawn_stop_watch(&self, suite_id: u64, children: Vec<u64>) -> CancellationToken {
        let done = CancellationToken::new();
        let this = self.clone();
        let token = done.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(STOP_POLL) => {}
                }
                if this.suite_cancelled(suite_id).await {
                    for id in &children {
                        this.scheduler.cancel(*id);
                    }
                    return;
                }
            }
        });
        done
    }

    /// Any child still `running` at the end never reported back
    async fn heal_stuck(&self, suite_id: u64) -> usize {
        let children = match self.store.children(suite_id).await {
            Ok(children) => children,
            Err(e) => {
                tracing::warn!("Could not list children of suite {}: {}", suite_id, e);
                return 0;
            }
        };
        let mut healed = 0;
        for mut child in children
            .into_iter()
            .filter(|c| c.status == ExecutionStatus::Running)
        {
            child.finish(ExecutionStatus::Failed, STUCK_MESSAGE);
            if matches!(self.store.finalize(&child).await, Ok(true)) {
                tracing::warn!("Healed stuck execution {}", child.id);
                healed += 1;
            }
        }
        healed
    }

    async fn complete(&self, suite_id: u64, aggregate: &SharedAggregate) -> Result<Execution> {
        let healed = self.heal_stuck(suite_id).await;
        let mut record = self.store.get(suite_id).await?;

        let (passed, failed, logs, screenshots) = {
            let agg = lock(aggregate);
            (agg.passed, agg.failed + healed, agg.logs.clone(), agg.screenshots.clone())
        };
        record.passed_count = passed;
        record.failed_count = failed;
        record.execution_logs = logs;
        record.screenshots = screenshots;

        if record.status == ExecutionStatus::Cancelled {
            // Stopped by the user: keep the status, refresh the numbers
            self.store.save(&record).await?;
        } else if failed > 0 {
            record.finish(
                ExecutionStatus::Failed,
                format!("{} of {} test cases failed", failed, record.total_count),
            );
            self.store.finalize(&record).await?;
        } else {
            record.finish(ExecutionStatus::Passed, "");
            self.store.finalize(&record).await?;
        }

        tracing::info!(
            "Suite execution {} finished {}: {} passed, {} failed",
            suite_id,
            record.status,
            passed,
            failed
        );
        Ok(record)
    }

    async fn fail_suite(
        &self,
        suite_id: u64,
        aggregate: &SharedAggregate,
        message: String,
    ) -> Result<Execution> {
        self.heal_stuck(suite_id).await;
        let mut record = self.store.get(suite_id).await?;
        {
            let agg = lock(aggregate);
            record.passed_count = agg.passed;
            record.failed_count = agg.failed;
            record.execution_logs = agg.logs.clone();
            record.screenshots = agg.screenshots.clone();
        }
        record
            .execution_logs
            .push(LogEntry::error(message.clone()));
        record.finish(ExecutionStatus::Failed, message);
        self.store.finalize(&record).await?;
        Ok(record)
    }

    /// Stop a suite run: cancel running children, then mark everything
    /// unfinished as cancelled. Returns how many records were cancelled.
    pub async fn stop(&self, suite_execution_id: u64) -> Result<usize> {
        stop_suite(&*self.store, Some(&self.scheduler), suite_execution_id).await
    }
}

#[derive(Default)]
struct Plan {
    to_run: Vec<u64>,
    already_passed: HashMap<u64, Execution>,
}

/// Stop a suite through the store alone, optionally cancelling in-process work
pub async fn stop_suite(
    store: &dyn ExecutionStore,
    scheduler: Option<&Scheduler>,
    suite_execution_id: u64,
) -> Result<usize> {
    let mut suite = store.get(suite_execution_id).await?;
    let unfinished: Vec<Execution> = store
        .children(suite_execution_id)
        .await?
        .into_iter()
        .filter(|c| !c.status.is_terminal())
        .collect();

    if unfinished.is_empty() && suite.status.is_terminal() {
        return Err(ReplayError::Other(format!(
            "Suite execution {} has nothing running",
            suite_execution_id
        )));
    }

    if let Some(scheduler) = scheduler {
        for child in unfinished
            .iter()
            .filter(|c| c.status == ExecutionStatus::Running)
        {
            scheduler.cancel(child.id);
        }
    }

    let mut cancelled = 0;
    for mut child in unfinished {
        child.finish(ExecutionStatus::Cancelled, "Cancelled by user");
        if store.finalize(&child).await? {
            cancelled += 1;
        }
    }
    if !suite.status.is_terminal() {
        suite.finish(ExecutionStatus::Cancelled, "Cancelled by user");
        store.finalize(&suite).await?;
    }
    tracing::info!(
        "Stopped suite execution {} ({} cases cancelled)",
        suite_execution_id,
        cancelled
    );
    Ok(cancelled)
}

/// Suite record with counts recomputed from its children, for mid-run queries
pub async fn suite_snapshot(store: &dyn ExecutionStore, suite_execution_id: u64) -> Result<Execution> {
    let mut suite = store.get(suite_execution_id).await?;
    let children = store.children(suite_execution_id).await?;
    suite.passed_count = children
        .iter()
        .filter(|c| c.status == ExecutionStatus::Passed)
        .count();
    suite.failed_count = children
        .iter()
        .filter(|c| c.status == ExecutionStatus::Failed)
        .count();
    Ok(suite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::runner::CaseRunner;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the cases whose id is listed
    struct Scripted {
        failing: Vec<u64>,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl CaseRunner for Scripted {
        async fn run(&self, _e: &Execution, case: &TestCase, _t: CancellationToken) -> ExecutionResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.failing.contains(&case.id) {
                ExecutionResult::failed(format!("case {} failed", case.id))
            } else {
                ExecutionResult {
                    success: true,
                    logs: vec![LogEntry::info(format!("case {} ok", case.id))],
                    ..Default::default()
                }
            }
        }
    }

    fn suite(n: u64, parallel: bool) -> TestSuite {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "checkout",
            "is_parallel": parallel,
            "test_cases": (1..=n).map(|id| serde_json::json!({
                "id": id, "name": format!("case {}", id), "environment_base_url": "https://x.test"
            })).collect::<Vec<_>>()
        }))
        .unwrap()
    }

    fn orchestrator(failing: Vec<u64>, workers: usize) -> (SuiteOrchestrator, Arc<Scripted>) {
        let runner = Arc::new(Scripted {
            failing,
            runs: AtomicUsize::new(0),
        });
        let engine = EngineConfig {
            max_workers: workers,
            direct_isolation_ms: 0,
            ..EngineConfig::default()
        };
        let scheduler = Scheduler::new(&engine, runner.clone());
        let store: Arc<dyn ExecutionStore> = Arc::new(MemoryStore::new());
        (
            SuiteOrchestrator::new(scheduler, store, SuiteConfig::default()),
            runner,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn serial_suite_aggregates_failures() {
        let (orch, _) = orchestrator(vec![2, 4], 10);
        let record = orch.run(suite(5, false), SuiteRunOptions::default()).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!((record.passed_count, record.failed_count), (3, 2));
        assert_eq!(orch.store.children(record.id).await.unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_suite_needs_a_slot_per_case() {
        let (orch, runner) = orchestrator(vec![], 3);
        let err = orch.run(suite(4, true), SuiteRunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ReplayError::CapacityExceeded { required: 4, max: 3, .. }));
        assert!(orch.store.list().await.unwrap().is_empty());
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);

        let record = orch.run(suite(3, true), SuiteRunOptions::default()).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Passed);
        assert_eq!(record.passed_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_copies_passed_cases_without_running_them() {
        let (orch, runner) = orchestrator(vec![2], 10);
        let first = orch.run(suite(3, false), SuiteRunOptions::default()).await.unwrap();
        assert_eq!(runner.runs.load(Ordering::SeqCst), 3);

        let options = SuiteRunOptions {
            resume_failed: true,
            parent_execution_id: Some(first.id),
        };
        let second = orch.run(suite(3, false), options).await.unwrap();
        assert_eq!(runner.runs.load(Ordering::SeqCst), 4);
        assert_eq!((second.passed_count, second.failed_count), (2, 1));

        let before = orch.store.children(first.id).await.unwrap();
        let after = orch.store.children(second.id).await.unwrap();
        for case_id in [1, 3] {
            let old = before.iter().find(|e| e.test_case_id == Some(case_id)).unwrap();
            let new = after.iter().find(|e| e.test_case_id == Some(case_id)).unwrap();
            assert_ne!(old.id, new.id);
            assert_eq!(old.status, new.status);
            assert_eq!(old.execution_logs, new.execution_logs);
            assert_eq!(old.screenshots, new.screenshots);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resume_with_nothing_failed_is_rejected() {
        let (orch, _) = orchestrator(vec![], 10);
        let first = orch.run(suite(2, false), SuiteRunOptions::default()).await.unwrap();
        let options = SuiteRunOptions {
            resume_failed: true,
            parent_execution_id: Some(first.id),
        };
        assert!(orch.run(suite(2, false), options).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_serial_suite_cancels_the_rest() {
        let (orch, runner) = orchestrator(vec![], 10);
        let handle = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run(suite(5, false), SuiteRunOptions::default()).await })
        };

        // Case 1 runs for 1s, then 2s isolation, case 2 for 1s: stop during the next gap
        tokio::time::sleep(Duration::from_millis(4_500)).await;
        let suite_id = orch
            .store
            .list()
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.execution_type == crate::models::ExecutionKind::TestSuite)
            .unwrap()
            .id;
        orch.stop(suite_id).await.unwrap();

        let record = handle.await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert_eq!(record.passed_count, 2);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);

        let children = orch.store.children(suite_id).await.unwrap();
        let cancelled = children
            .iter()
            .filter(|c| c.status == ExecutionStatus::Cancelled)
            .count();
        assert_eq!(cancelled, 3);
    }

    #[tokio::test]
    async fn snapshot_counts_children() {
        let store = MemoryStore::new();
        let parent = store.create(Execution::for_suite(1, 2)).await.unwrap();
        let mut a = Execution::for_suite_case(1, 1, parent.id);
        a.finish(ExecutionStatus::Passed, "");
        store.create(a).await.unwrap();
        store
            .create(Execution::for_suite_case(2, 1, parent.id))
            .await
            .unwrap();

        let snapshot = suite_snapshot(&store, parent.id).await.unwrap();
        assert_eq!((snapshot.passed_count, snapshot.failed_count), (1, 0));
    }
}
