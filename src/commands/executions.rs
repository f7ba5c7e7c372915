use colored::Colorize;

use super::{load_config, open_store, status_label};
use crate::cli::{Cli, ExecutionsCommands};
use replaybook::models::{Execution, ExecutionKind, LogLevel};
use replaybook::suite::{suite_snapshot, ExecutionStore};
use replaybook::Result;

pub async fn run(cli: &Cli, command: &ExecutionsCommands) -> Result<()> {
    match command {
        ExecutionsCommands::List { suite, limit } => list(cli, *suite, *limit).await,
        ExecutionsCommands::Show { id } => show(cli, *id).await,
    }
}

fn kind_label(kind: ExecutionKind) -> &'static str {
    match kind {
        ExecutionKind::TestCase => "case",
        ExecutionKind::TestSuite => "suite",
        ExecutionKind::TestCaseInternal => "suite-case",
    }
}

async fn list(cli: &Cli, suite: Option<u64>, limit: usize) -> Result<()> {
    let config = load_config(cli)?;
    let store = open_store(&config).await?;

    let mut records: Vec<Execution> = match suite {
        Some(parent) => store.children(parent).await?,
        None => store.list().await?,
    };
    records.sort_by(|a, b| b.id.cmp(&a.id));
    records.truncate(limit);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("{} No executions found", "!".yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{:>6}  {:<10}  {:<8}  {:<19}  {:>8}  {}",
            "ID", "KIND", "TARGET", "STARTED", "DURATION", "STATUS"
        )
        .bold()
    );
    for record in &records {
        let target = record
            .test_case_id
            .or(record.test_suite_id)
            .map(|id| id.to_string())
            .unwrap_or_default();
        println!(
            "{:>6}  {:<10}  {:<8}  {:<19}  {:>7.1}s  {}",
            record.id,
            kind_label(record.execution_type),
            target,
            record
                .start_time
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S"),
            record.duration as f64 / 1000.0,
            status_label(record.status)
        );
    }
    Ok(())
}

async fn show(cli: &Cli, id: u64) -> Result<()> {
    let config = load_config(cli)?;
    let store = open_store(&config).await?;

    let record = store.get(id).await?;
    let record = if record.execution_type == ExecutionKind::TestSuite {
        suite_snapshot(&*store, id).await?
    } else {
        record
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("{} {}", "Execution".bold(), record.id);
    println!("  Kind:     {}", kind_label(record.execution_type));
    if let Some(case) = record.test_case_id {
        println!("  Case:     {}", case);
    }
    if let Some(suite) = record.test_suite_id {
        println!("  Suite:    {}", suite);
    }
    if let Some(parent) = record.parent_execution_id {
        println!("  Parent:   {}", parent);
    }
    println!("  Status:   {}", status_label(record.status));
    println!(
        "  Started:  {}",
        record.start_time.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
    );
    println!("  Duration: {:.1}s", record.duration as f64 / 1000.0);
    if record.execution_type == ExecutionKind::TestSuite {
        println!(
            "  Cases:    {} passed, {} failed, {} total",
            record.passed_count, record.failed_count, record.total_count
        );
    }
    if !record.error_message.is_empty() {
        println!("  Error:    {}", record.error_message.red());
    }

    if let Some(metrics) = &record.metrics {
        println!();
        println!("{}", "Metrics:".bold());
        println!("  Page load:          {:.0}ms", metrics.page_load_time);
        println!("  DOM content loaded: {:.0}ms", metrics.dom_content_loaded);
        println!("  First paint:        {:.0}ms", metrics.first_paint);
        println!("  Requests:           {}", metrics.network_requests);
        println!("  JS heap:            {:.1}MB", metrics.js_heap_size);
    }

    if !record.screenshots.is_empty() {
        println!();
        println!("{}", "Screenshots:".bold());
        for shot in &record.screenshots {
            println!("  {}", shot);
        }
    }

    if !record.execution_logs.is_empty() {
        println!();
        println!("{}", "Log:".bold());
        for entry in &record.execution_logs {
            let level = match entry.level {
                LogLevel::Error => "ERROR".red(),
                LogLevel::Warn => "WARN ".yellow(),
                LogLevel::Info => "INFO ".normal(),
                LogLevel::Debug => "DEBUG".dimmed(),
            };
            if entry.level == LogLevel::Debug && !cli.verbose {
                continue;
            }
            println!(
                "  {} {} {}",
                entry.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S").to_string().dimmed(),
                level,
                entry.message
            );
        }
    }
    Ok(())
}
