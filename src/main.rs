mod cli;
mod commands;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use replaybook::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Frame-level websocket chatter is only useful when asked for explicitly
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(default_level)
            .add_directive("tokio_tungstenite=warn".parse().unwrap())
            .add_directive("tungstenite=warn".parse().unwrap())
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    cli.run().await
}
