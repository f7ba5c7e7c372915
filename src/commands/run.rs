use std::path::Path;
use std::sync::Arc;

use colored::Colorize;

use super::{finish_spinner, load_config, open_store, print_summary, read_json, resolve_device, spinner};
use crate::cli::Cli;
use replaybook::browser::SessionManager;
use replaybook::models::{Execution, ExecutionStatus, LogLevel, TestCase};
use replaybook::runner::TestCaseRunner;
use replaybook::scheduler::Scheduler;
use replaybook::suite::{watch_execution, ExecutionStore};
use replaybook::{ReplayError, Result};

pub async fn run(cli: &Cli, case_path: &Path, device: Option<&str>) -> Result<()> {
    let config = Arc::new(load_config(cli)?);
    let mut case: TestCase = read_json(case_path).await?;
    if let Some(name) = device {
        case.device = resolve_device(name)?;
    }

    let store = open_store(&config).await?;
    let mut execution = store.create(Execution::for_case(case.id)).await?;
    execution.mark_running();
    store.save(&execution).await?;

    let sessions = Arc::new(SessionManager::new((*config).clone()));
    let runner = TestCaseRunner::new(config.clone(), sessions.clone()).visual(!config.browser.headless);
    let scheduler = Scheduler::new(&config.engine, Arc::new(runner));

    let dyn_store: Arc<dyn ExecutionStore> = store.clone();
    let watcher = watch_execution(
        dyn_store,
        scheduler.clone(),
        execution.id,
        std::time::Duration::from_secs(config.suite.safety_timeout_secs),
    );

    let pb = spinner(
        cli.json,
        &format!("Running {} ({} steps) on {}", case.name, case.steps.len(), case.device.name),
    );

    let mut result_rx = scheduler.submit(execution.clone(), case).await?;
    let result = tokio::select! {
        result = &mut result_rx => result,
        _ = tokio::signal::ctrl_c() => {
            if let Some(pb) = &pb {
                pb.set_message("Cancelling...");
            }
            scheduler.cancel(execution.id);
            result_rx.await
        }
    };
    finish_spinner(pb);

    let result = result.map_err(|_| {
        ReplayError::Other(format!("Execution {} produced no result", execution.id))
    })?;

    execution.apply_result(&result);
    if !store.finalize(&execution).await? {
        execution = store.get(execution.id).await?;
    }
    scheduler.acknowledge(execution.id);
    watcher.abort();
    scheduler.shutdown();
    sessions.cleanup_all().await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        if cli.verbose {
            for entry in &execution.execution_logs {
                let level = match entry.level {
                    LogLevel::Error => "ERROR".red(),
                    LogLevel::Warn => "WARN ".yellow(),
                    LogLevel::Info => "INFO ".normal(),
                    LogLevel::Debug => "DEBUG".dimmed(),
                };
                println!("  {} {}", level, entry.message);
            }
        }
        print_summary(&execution);
        for shot in &execution.screenshots {
            println!("  {} {}", "📷".dimmed(), shot.dimmed());
        }
    }

    match execution.status {
        ExecutionStatus::Passed => Ok(()),
        status => Err(ReplayError::Other(format!(
            "Execution {} {}",
            execution.id, status
        ))),
    }
}
