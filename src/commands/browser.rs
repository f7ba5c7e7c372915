use std::time::Duration;

use colored::Colorize;

use super::{finish_spinner, load_config, spinner};
use crate::cli::{BrowserCommands, Cli};
use replaybook::browser::{
    cdp, discover_all_browsers, force_kill_automation_browsers, scan_debug_ports,
};
use replaybook::config::Config;
use replaybook::Result;

pub async fn run(cli: &Cli, command: &BrowserCommands) -> Result<()> {
    let config = load_config(cli)?;
    match command {
        BrowserCommands::Status => status(cli, &config).await,
        BrowserCommands::Kill => kill(cli).await,
    }
}

async fn status(cli: &Cli, config: &Config) -> Result<()> {
    let browsers = discover_all_browsers();

    let pb = spinner(
        cli.json,
        &format!(
            "Scanning debug ports {}..={}",
            config.browser.port_start, config.browser.port_end
        ),
    );
    let ports = scan_debug_ports(config.browser.port_start, config.browser.port_end).await;
    finish_spinner(pb);

    let mut live = Vec::new();
    for port in &ports {
        let pages = cdp::list_targets(*port, Duration::from_secs(2))
            .await
            .map(|targets| targets.into_iter().filter(|t| t.is_page()).collect::<Vec<_>>())
            .unwrap_or_default();
        live.push((*port, pages));
    }

    if cli.json {
        let report = serde_json::json!({
            "configured_executable": config.browser.executable,
            "browsers": browsers.iter().map(|b| serde_json::json!({
                "type": b.browser_type.name(),
                "path": b.path.display().to_string(),
                "version": b.version,
            })).collect::<Vec<_>>(),
            "debug_ports": live.iter().map(|(port, pages)| serde_json::json!({
                "port": port,
                "pages": pages.iter().map(|p| p.url.clone()).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "Configured Browser:".bold());
    match config.browser_executable() {
        Some(path) if path.exists() => {
            println!("  {} {}", "✓".green(), path.display())
        }
        Some(path) => println!("  {} {} (not found)", "!".yellow(), path.display()),
        None => println!("  {} Auto-discovery", "○".dimmed()),
    }
    println!();

    println!("{}", "Detected Browsers:".bold());
    if browsers.is_empty() {
        println!("  {} No browsers found", "!".yellow());
    } else {
        for browser in &browsers {
            println!(
                "  {} {} {}",
                "✓".green(),
                browser.browser_type.name(),
                browser
                    .version
                    .as_ref()
                    .map(|v| format!("(v{})", v))
                    .unwrap_or_default()
                    .dimmed()
            );
            println!("    {}", browser.path.display().to_string().dimmed());
        }
    }
    println!();

    println!("{}", "Debug Ports:".bold());
    if live.is_empty() {
        println!("  {} No browsers listening", "○".dimmed());
    } else {
        for (port, pages) in &live {
            println!("  {} {} ({} pages)", "●".green(), port, pages.len());
            for page in pages {
                println!("    {}", page.url.dimmed());
            }
        }
    }
    Ok(())
}

async fn kill(cli: &Cli) -> Result<()> {
    force_kill_automation_browsers().await;
    if cli.json {
        println!("{}", serde_json::json!({ "killed": true }));
    } else {
        println!("{} Automation browsers terminated", "✓".green());
    }
    Ok(())
}
