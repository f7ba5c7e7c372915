use colored::Colorize;

use crate::cli::Cli;
use replaybook::config::device;
use replaybook::Result;

pub async fn run(cli: &Cli) -> Result<()> {
    let presets = device::presets();
    let default = device::default_device();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&presets)?);
        return Ok(());
    }

    println!("{}", "Device presets:".bold());
    for preset in presets {
        let marker = if preset.name == default.name {
            "*".green()
        } else {
            " ".normal()
        };
        println!(
            "  {} {:<20} {:>4}x{:<5} {}",
            marker,
            preset.name,
            preset.width,
            preset.height,
            if preset.touch { "touch".dimmed() } else { "".normal() }
        );
    }
    Ok(())
}
