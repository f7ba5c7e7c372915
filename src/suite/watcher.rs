//! Healing of execution records stuck in `running`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::store::ExecutionStore;
use crate::error::Result;
use crate::models::{Execution, ExecutionStatus};
use crate::scheduler::Scheduler;

/// Untracked records younger than this may still be mid-handoff
const SWEEP_GRACE_SECS: i64 = 30;
const SWEEP_HARD_LIMIT_SECS: i64 = 30 * 60;
/// Below this a watcher-healed run is assumed to have died early
const SAFETY_PASS_THRESHOLD_SECS: i64 = 30;
/// Sweep-healed runs shorter than this count as failed
const SWEEP_PASS_THRESHOLD_SECS: i64 = 5;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub healed: Vec<u64>,
    pub timed_out: Vec<u64>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.healed.is_empty() && self.timed_out.is_empty()
    }
}

/// One pass over every `running` record
pub async fn sweep(store: &dyn ExecutionStore, scheduler: &Scheduler) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for mut record in store.with_status(ExecutionStatus::Running).await? {
        let elapsed = record.elapsed().num_seconds();

        if elapsed > SWEEP_HARD_LIMIT_SECS {
            scheduler.cancel(record.id);
            record.finish(ExecutionStatus::Failed, "Execution timed out after 30 minutes");
            if store.finalize(&record).await? {
                tracing::warn!("Execution {} timed out after 30 minutes", record.id);
                report.timed_out.push(record.id);
            }
            continue;
        }

        if scheduler.is_running(record.id) || elapsed <= SWEEP_GRACE_SECS {
            continue;
        }

        // The stored duration is only written on completion, so judge by wall time
        let ran_cleanly = elapsed > SWEEP_PASS_THRESHOLD_SECS && record.error_message.is_empty();
        if ran_cleanly {
            record.finish(ExecutionStatus::Passed, "");
        } else {
            record.finish(
                ExecutionStatus::Failed,
                "Execution completed but status was not updated properly",
            );
        }
        if store.finalize(&record).await? {
            tracing::info!("Healed execution {} as {}", record.id, record.status);
            report.healed.push(record.id);
        }
    }

    Ok(report)
}

/// Run `sweep` every `every` until `stop` fires
pub fn spawn_sweeper(
    store: Arc<dyn ExecutionStore>,
    scheduler: Scheduler,
    every: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(every) => {}
            }
            if let Err(e) = sweep(&*store, &scheduler).await {
                tracing::warn!("Status sweep failed: {}", e);
            }
        }
    })
}

/// Decide the outcome of a record whose result never arrived
fn infer_outcome(record: &mut Execution) {
    if record.elapsed().num_seconds() > SAFETY_PASS_THRESHOLD_SECS {
        record.finish(ExecutionStatus::Passed, "");
    } else {
        record.finish(
            ExecutionStatus::Failed,
            "Execution completed but result communication failed",
        );
    }
}

/// After `timeout`, heal `execution_id` if it is still `running` but no longer
/// tracked by the scheduler
pub fn watch_execution(
    store: Arc<dyn ExecutionStore>,
    scheduler: Scheduler,
    execution_id: u64,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if scheduler.is_running(execution_id) {
            return;
        }
        let mut record = match store.get(execution_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!("Safety watcher for {}: {}", execution_id, e);
                return;
            }
        };
        if record.status != ExecutionStatus::Running {
            return;
        }
        infer_outcome(&mut record);
        match store.finalize(&record).await {
            Ok(true) => tracing::warn!(
                "Execution {} never reported back, inferred {}",
                execution_id,
                record.status
            ),
            Ok(false) => {}
            Err(e) => tracing::warn!("Safety watcher could not save {}: {}", execution_id, e),
        }
    })
}
