pub mod browser;
pub mod devices;
pub mod executions;
pub mod record;
pub mod run;
pub mod suite;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::de::DeserializeOwned;

use crate::cli::Cli;
use replaybook::config::{device, Config};
use replaybook::models::{DeviceProfile, Execution, ExecutionStatus};
use replaybook::suite::JsonStore;
use replaybook::{ReplayError, Result};

/// Config file and environment, then command-line overrides
pub(crate) fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load()?;
    if let Some(path) = &cli.browser_path {
        config.browser.executable = Some(path.clone());
    }
    if cli.headless {
        config.browser.headless = true;
    }
    Ok(config)
}

pub(crate) async fn open_store(config: &Config) -> Result<Arc<JsonStore>> {
    Ok(Arc::new(JsonStore::open(&config.suite.store_dir).await?))
}

pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ReplayError::Other(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&body)
        .map_err(|e| ReplayError::Other(format!("{} is not valid: {}", path.display(), e)))
}

pub(crate) fn resolve_device(name: &str) -> Result<DeviceProfile> {
    device::find(name).ok_or_else(|| {
        let known: Vec<String> = device::presets().into_iter().map(|d| d.name).collect();
        ReplayError::ConfigError(format!(
            "Unknown device '{}'. Known devices: {}",
            name,
            known.join(", ")
        ))
    })
}

/// Spinner for long waits; `None` in JSON mode
pub(crate) fn spinner(json: bool, message: &str) -> Option<ProgressBar> {
    if json {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template("  {spinner} {msg}")
            .expect("valid spinner template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Some(pb)
}

pub(crate) fn finish_spinner(pb: Option<ProgressBar>) {
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
}

pub(crate) fn status_label(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Passed => "passed".green().to_string(),
        ExecutionStatus::Failed => "failed".red().to_string(),
        ExecutionStatus::Cancelled => "cancelled".yellow().to_string(),
        ExecutionStatus::Running => "running".cyan().to_string(),
        ExecutionStatus::Pending => "pending".dimmed().to_string(),
    }
}

/// One-line human summary of an execution
pub(crate) fn print_summary(execution: &Execution) {
    let icon = match execution.status {
        ExecutionStatus::Passed => "✓".green(),
        ExecutionStatus::Failed => "✗".red(),
        _ => "○".yellow(),
    };
    println!(
        "{} Execution {} {} in {:.1}s",
        icon,
        execution.id,
        status_label(execution.status),
        execution.duration as f64 / 1000.0
    );
    if !execution.error_message.is_empty() {
        println!("  {}", execution.error_message.dimmed());
    }
}
