use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio_util::sync::CancellationToken;

use super::{finish_spinner, load_config, open_store, print_summary, read_json, spinner, status_label};
use crate::cli::{Cli, SuiteCommands};
use replaybook::browser::SessionManager;
use replaybook::models::{ExecutionKind, ExecutionStatus, TestSuite};
use replaybook::runner::TestCaseRunner;
use replaybook::scheduler::Scheduler;
use replaybook::suite::{
    spawn_sweeper, stop_suite, ExecutionStore, SuiteOrchestrator, SuiteRunOptions,
};
use replaybook::{ReplayError, Result};

const SWEEP_EVERY: Duration = Duration::from_secs(60);

pub async fn run(cli: &Cli, command: &SuiteCommands) -> Result<()> {
    match command {
        SuiteCommands::Run {
            suite,
            resume_failed,
            parent,
        } => run_suite(cli, suite, *resume_failed, *parent).await,
        SuiteCommands::Stop { execution_id } => stop(cli, *execution_id).await,
    }
}

async fn run_suite(
    cli: &Cli,
    path: &Path,
    resume_failed: bool,
    parent: Option<u64>,
) -> Result<()> {
    let config = Arc::new(load_config(cli)?);
    let suite: TestSuite = read_json(path).await?;
    let suite_id = suite.id;
    let total = suite.test_cases.len();

    let store: Arc<dyn ExecutionStore> = open_store(&config).await?;
    let sessions = Arc::new(SessionManager::new((*config).clone()));
    let runner = TestCaseRunner::new(config.clone(), sessions.clone()).visual(!config.browser.headless);
    let scheduler = Scheduler::new(&config.engine, Arc::new(runner));
    let orchestrator = SuiteOrchestrator::new(scheduler.clone(), store.clone(), config.suite.clone());

    let stop_sweeper = CancellationToken::new();
    let sweeper = spawn_sweeper(store.clone(), scheduler.clone(), SWEEP_EVERY, stop_sweeper.clone());

    let pb = spinner(
        cli.json,
        &format!(
            "Running suite {} ({} cases, {})",
            suite.name,
            total,
            if suite.is_parallel { "parallel" } else { "serial" }
        ),
    );

    let options = SuiteRunOptions {
        resume_failed,
        parent_execution_id: parent,
    };
    let mut task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(suite, options).await })
    };

    let outcome = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::signal::ctrl_c() => {
            if let Some(pb) = &pb {
                pb.set_message("Stopping suite...");
            }
            if let Some(running) = running_suite_execution(&*store, suite_id).await {
                if let Err(e) = orchestrator.stop(running).await {
                    tracing::warn!("Stopping suite execution {} failed: {}", running, e);
                }
            }
            task.await
        }
    };
    finish_spinner(pb);

    stop_sweeper.cancel();
    sweeper.abort();
    scheduler.shutdown();
    sessions.cleanup_all().await;

    let execution = outcome.map_err(|e| ReplayError::Fault(e.to_string()))??;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        let children = store.children(execution.id).await?;
        for child in &children {
            println!(
                "  {} case {} {}",
                "•".dimmed(),
                child.test_case_id.unwrap_or_default(),
                status_label(child.status)
            );
            if !child.error_message.is_empty() && child.status != ExecutionStatus::Passed {
                println!("      {}", child.error_message.dimmed());
            }
        }
        print_summary(&execution);
        println!(
            "  {} passed, {} failed, {} total",
            execution.passed_count.to_string().green(),
            execution.failed_count.to_string().red(),
            execution.total_count
        );
    }

    match execution.status {
        ExecutionStatus::Passed => Ok(()),
        status => Err(ReplayError::Other(format!(
            "Suite execution {} {}",
            execution.id, status
        ))),
    }
}

/// Newest running suite record for `suite_id`
async fn running_suite_execution(store: &dyn ExecutionStore, suite_id: u64) -> Option<u64> {
    store
        .with_status(ExecutionStatus::Running)
        .await
        .ok()?
        .into_iter()
        .filter(|e| e.execution_type == ExecutionKind::TestSuite && e.test_suite_id == Some(suite_id))
        .map(|e| e.id)
        .max()
}

async fn stop(cli: &Cli, execution_id: u64) -> Result<()> {
    let config = load_config(cli)?;
    let store = open_store(&config).await?;

    // The process running the suite notices the cancelled record and stops its own work
    let cancelled = stop_suite(&*store, None, execution_id).await?;

    if cli.json {
        println!(
            "{}",
            serde_json::json!({ "execution_id": execution_id, "cancelled": cancelled })
        );
    } else {
        println!(
            "{} Suite execution {} stopped ({} cases cancelled)",
            "✓".green(),
            execution_id,
            cancelled
        );
    }
    Ok(())
}
