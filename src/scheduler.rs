//! Bounded worker pool for test case executions.
//!
//! Jobs queue on a bounded channel (twice the worker count) so submitters feel
//! backpressure. An execution id counts as running from acceptance until the
//! caller acknowledges the result was persisted, or the ack window lapses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{ReplayError, Result};
use crate::models::{Execution, ExecutionResult, TestCase};
use crate::runner::{cancelled_result, contain, CaseRunner};

struct Job {
    execution: Execution,
    case: TestCase,
    result_tx: oneshot::Sender<ExecutionResult>,
    ack_rx: oneshot::Receiver<()>,
}

struct Tracked {
    cancel: CancellationToken,
    ack_tx: Option<oneshot::Sender<()>>,
    /// Still waiting in the queue for a worker
    queued: bool,
}

struct Inner {
    runner: Arc<dyn CaseRunner>,
    queue: mpsc::Sender<Job>,
    running: Mutex<HashMap<u64, Tracked>>,
    max_workers: usize,
    ack_timeout: Duration,
    direct_isolation: Duration,
    shutdown: CancellationToken,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, HashMap<u64, Tracked>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `id`, handing back its cancel token and ack receiver
    fn track(&self, id: u64, queued: bool) -> Result<(CancellationToken, oneshot::Receiver<()>)> {
        let mut table = self.table();
        if table.contains_key(&id) {
            return Err(ReplayError::Other(format!(
                "Execution {} is already running",
                id
            )));
        }
        let cancel = self.shutdown.child_token();
        let (ack_tx, ack_rx) = oneshot::channel();
        table.insert(
            id,
            Tracked {
                cancel: cancel.clone(),
                ack_tx: Some(ack_tx),
                queued,
            },
        );
        Ok((cancel, ack_rx))
    }

    /// A worker took `id` off the queue
    fn start(&self, id: u64) -> CancellationToken {
        match self.table().get_mut(&id) {
            Some(tracked) => {
                tracked.queued = false;
                tracked.cancel.clone()
            }
            None => self.shutdown.child_token(),
        }
    }

    fn untrack(&self, id: u64) {
        self.table().remove(&id);
    }

    async fn execute(&self, execution: Execution, case: TestCase, cancel: CancellationToken) -> ExecutionResult {
        if cancel.is_cancelled() {
            return cancelled_result(Vec::new());
        }
        let id = execution.id;
        let runner = self.runner.clone();
        match contain(async move { runner.run(&execution, &case, cancel).await }).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Execution {} runner fault: {}", id, e);
                ExecutionResult::failed(format!("Execution panic: {}", e))
            }
        }
    }

    /// Hold the id as running until the caller acknowledges persistence
    async fn await_ack(&self, id: u64, ack_rx: oneshot::Receiver<()>) {
        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(())) => tracing::debug!("Execution {} result persisted", id),
            Ok(Err(_)) => tracing::debug!("Execution {} ack channel dropped", id),
            Err(_) => tracing::warn!(
                "Execution {} result not acknowledged within {}s",
                id,
                self.ack_timeout.as_secs()
            ),
        }
        self.untrack(id);
    }
}

/// Handle to the worker pool; cheap to clone
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn new(config: &EngineConfig, runner: Arc<dyn CaseRunner>) -> Self {
        let max_workers = config.max_workers.max(1);
        let (queue, rx) = mpsc::channel(max_workers * 2);
        let inner = Arc::new(Inner {
            runner,
            queue,
            running: Mutex::new(HashMap::new()),
            max_workers,
            ack_timeout: config.ack_timeout(),
            direct_isolation: Duration::from_millis(config.direct_isolation_ms),
            shutdown: CancellationToken::new(),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..max_workers {
            tokio::spawn(work(worker, inner.clone(), rx.clone()));
        }
        tracing::debug!("Scheduler started with {} workers", max_workers);

        Self { inner }
    }

    /// Queue a job; waits while the queue is full. The receiver yields the result.
    pub async fn submit(
        &self,
        execution: Execution,
        case: TestCase,
    ) -> Result<oneshot::Receiver<ExecutionResult>> {
        let id = execution.id;
        let (_, ack_rx) = self.inner.track(id, true)?;
        let (result_tx, result_rx) = oneshot::channel();
        let job = Job {
            execution,
            case,
            result_tx,
            ack_rx,
        };
        if self.inner.queue.send(job).await.is_err() {
            self.inner.untrack(id);
            return Err(ReplayError::Other("scheduler is shut down".to_string()));
        }
        Ok(result_rx)
    }

    /// Run in the caller's task, bypassing the queue
    pub async fn run_direct(&self, execution: Execution, case: TestCase) -> Result<ExecutionResult> {
        let id = execution.id;
        let (cancel, ack_rx) = self.inner.track(id, false)?;

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.inner.direct_isolation) => {}
        }
        let result = self.inner.execute(execution, case, cancel).await;

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.await_ack(id, ack_rx).await });
        Ok(result)
    }

    pub fn is_running(&self, id: u64) -> bool {
        self.inner.table().contains_key(&id)
    }

    pub fn running_count(&self) -> usize {
        self.inner.table().len()
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Signal cancellation; false when the id is not running
    pub fn cancel(&self, id: u64) -> bool {
        match self.inner.table().get(&id) {
            Some(tracked) => {
                tracked.cancel.cancel();
                tracing::info!("Cancellation requested for execution {}", id);
                true
            }
            None => false,
        }
    }

    /// Confirm the result for `id` is durable, releasing its slot
    pub fn acknowledge(&self, id: u64) {
        if let Some(tracked) = self.inner.table().get_mut(&id) {
            if let Some(ack) = tracked.ack_tx.take() {
                let _ = ack.send(());
            }
        }
    }

    /// Stop accepting work and cancel everything in flight.
    ///
    /// Queued executions are forgotten at once; their receivers get a
    /// cancelled result once a worker drains the queue.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut table = self.inner.table();
        let before = table.len();
        table.retain(|_, tracked| !tracked.queued);
        let dropped = before - table.len();
        if dropped > 0 {
            tracing::info!("Scheduler shut down with {} queued execution(s) dropped", dropped);
        }
    }
}

async fn work(
    worker: usize,
    inner: Arc<Inner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            let job = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => None,
                job = rx.recv() => job,
            };
            if job.is_none() {
                drain(&inner, &mut rx);
            }
            job
        };
        let Some(job) = job else { break };

        let id = job.execution.id;
        tracing::debug!("Worker {} picked up execution {}", worker, id);
        let cancel = inner.start(id);
        let result = inner.execute(job.execution, job.case, cancel).await;

        if job.result_tx.send(result).is_err() {
            tracing::warn!("Execution {} finished but nobody is waiting for it", id);
        }
        inner.await_ack(id, job.ack_rx).await;
    }
    tracing::debug!("Worker {} stopped", worker);
}

/// Refuse further submissions and answer everything still queued as cancelled
fn drain(inner: &Inner, rx: &mut mpsc::Receiver<Job>) {
    rx.close();
    while let Ok(job) = rx.try_recv() {
        let id = job.execution.id;
        inner.untrack(id);
        let _ = job.result_tx.send(cancelled_result(Vec::new()));
        tracing::debug!("Execution {} dropped from the queue at shutdown", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sleeper {
        delay: Duration,
        live: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Sleeper {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                live: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CaseRunner for Sleeper {
        async fn run(&self, _e: &Execution, _c: &TestCase, cancel: CancellationToken) -> ExecutionResult {
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(live, Ordering::SeqCst);
            let result = tokio::select! {
                _ = cancel.cancelled() => cancelled_result(Vec::new()),
                _ = tokio::time::sleep(self.delay) => ExecutionResult { success: true, ..Default::default() },
            };
            self.live.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct Panicker;

    #[async_trait]
    impl CaseRunner for Panicker {
        async fn run(&self, _e: &Execution, _c: &TestCase, _cancel: CancellationToken) -> ExecutionResult {
            panic!("selector table corrupted");
        }
    }

    fn engine_config(workers: usize) -> EngineConfig {
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
    async fn concurrency_never_exceeds_worker_count() {
        let runner = Sleeper::new(Duration::from_secs(5));
        let scheduler = Scheduler::new(&engine_config(2), runner.clone());

        let mut receivers = Vec::new();
        for id in 1..=4 {
            let (e, c) = job(id);
            receivers.push(scheduler.submit(e, c).await.unwrap());
        }
        for (i, rx) in receivers.into_iter().enumerate() {
            assert!(rx.await.unwrap().success);
            scheduler.acknowledge(i as u64 + 1);
        }
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn id_stays_running_until_acknowledged() {
        let scheduler = Scheduler::new(&engine_config(1), Sleeper::new(Duration::from_millis(10)));
        let (e, c) = job(7);
        let rx = scheduler.submit(e, c).await.unwrap();
        assert!(scheduler.is_running(7));

        rx.await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.is_running(7));

        scheduler.acknowledge(7);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!scheduler.is_running(7));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_releases_after_timeout() {
        let scheduler = Scheduler::new(&engine_config(1), Sleeper::new(Duration::from_millis(10)));
        let (e, c) = job(3);
        scheduler.submit(e, c).await.unwrap().await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!scheduler.is_running(3));
        assert_eq!(scheduler.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_running_job() {
        let scheduler = Scheduler::new(&engine_config(1), Sleeper::new(Duration::from_secs(60)));
        let (e, c) = job(5);
        let rx = scheduler.submit(e, c).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(scheduler.cancel(5));
        let result = rx.await.unwrap();
        assert!(result.cancelled);
        assert!(!scheduler.cancel(99));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_runner_fails_only_its_job() {
        let scheduler = Scheduler::new(&engine_config(1), Arc::new(Panicker));
        let (e, c) = job(1);
        let result = scheduler.run_direct(e, c).await.unwrap();
        assert!(!result.success);
        assert!(result.error_message.contains("selector table corrupted"));

        let (e, c) = job(2);
        let rx = scheduler.submit(e, c).await.unwrap();
        assert!(!rx.await.unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_running_id_is_rejected() {
        let scheduler = Scheduler::new(&engine_config(1), Sleeper::new(Duration::from_secs(5)));
        let (e, c) = job(4);
        let _rx = scheduler.submit(e.clone(), c.clone()).await.unwrap();
        assert!(scheduler.submit(e, c).await.is_err());
    }
}
