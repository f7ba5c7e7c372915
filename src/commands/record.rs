use std::path::Path;
use std::sync::Arc;

use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;

use super::{load_config, resolve_device};
use crate::cli::Cli;
use replaybook::browser::SessionManager;
use replaybook::config::device;
use replaybook::models::TestCase;
use replaybook::recorder::{codegen, RecorderManager};
use replaybook::Result;

const SESSION_ID: &str = "cli";

pub async fn run(
    cli: &Cli,
    url: &str,
    out: &Path,
    device_name: Option<&str>,
    name: Option<&str>,
) -> Result<()> {
    let config = load_config(cli)?;
    let device = match device_name {
        Some(name) => resolve_device(name)?,
        None => device::default_device(),
    };

    let sessions = Arc::new(SessionManager::new(config.clone()));
    let recorder = RecorderManager::new(&config, sessions.clone());
    let mut events = recorder.subscribe();

    if let Err(e) = recorder.start_session(SESSION_ID, url, &device).await {
        sessions.cleanup_all().await;
        return Err(e);
    }
    if !cli.json {
        println!(
            "{} Recording {} as {} (Ctrl-C to finish)",
            "●".red(),
            url.cyan(),
            device.name
        );
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) if cli.json => println!("{}", serde_json::to_string(&event)?),
                Ok(event) => println!(
                    "  {} {:<10} {}",
                    format!("{:>3}", event.index + 1).dimmed(),
                    event.step.kind.to_string().bold(),
                    if event.step.selector.is_empty() { &event.step.value } else { &event.step.selector }
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Display skipped {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let steps = recorder.stop_session(SESSION_ID).await?;
    sessions.cleanup_all().await;

    let case = TestCase {
        id: 0,
        name: name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Recording of {}", url)),
        steps,
        device,
        environment_base_url: url.to_string(),
    };

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(out, serde_json::to_string_pretty(&case)?).await?;
    let code_path = out.with_extension("js");
    tokio::fs::write(&code_path, codegen::session_script(url, &case.steps)).await?;

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "steps": case.steps.len(),
                "case": out.display().to_string(),
                "code": code_path.display().to_string(),
            })
        );
    } else {
        println!(
            "{} Recorded {} steps to {}",
            "✓".green(),
            case.steps.len(),
            out.display()
        );
        println!("  {} {}", "Code:".dimmed(), code_path.display());
    }
    Ok(())
}
