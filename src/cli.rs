use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands;
use replaybook::Result;

/// Replaybook CLI - record browser interactions and replay them as tests
#[derive(Parser)]
#[command(name = "replaybook")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Browser executable path (overrides auto-discovery)
    #[arg(long, env = "REPLAYBOOK_BROWSER_PATH", global = true)]
    pub browser_path: Option<String>,

    /// Run non-visual sessions headless
    #[arg(long, env = "REPLAYBOOK_HEADLESS", global = true)]
    pub headless: bool,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay one test case
    Run {
        /// Test case JSON file
        case: PathBuf,

        /// Device preset to emulate (overrides the case's device)
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Run or stop test suites
    Suite {
        #[command(subcommand)]
        command: SuiteCommands,
    },

    /// Record interactions in a visible browser until Ctrl-C
    Record {
        /// Page to start recording on
        url: String,

        /// Where the recorded test case is written
        #[arg(short, long, default_value = "recording.json")]
        out: PathBuf,

        /// Device preset to emulate
        #[arg(short, long)]
        device: Option<String>,

        /// Name stored in the recorded test case
        #[arg(long)]
        name: Option<String>,
    },

    /// Query stored executions
    Executions {
        #[command(subcommand)]
        command: ExecutionsCommands,
    },

    /// List device presets
    Devices,

    /// Browser discovery and process management
    Browser {
        #[command(subcommand)]
        command: BrowserCommands,
    },
}

#[derive(Subcommand)]
pub enum SuiteCommands {
    /// Run a test suite
    Run {
        /// Test suite JSON file
        suite: PathBuf,

        /// Only run cases whose latest execution did not pass
        #[arg(long)]
        resume_failed: bool,

        /// Suite execution whose case results the resume is scoped to
        #[arg(long, requires = "resume_failed")]
        parent: Option<u64>,
    },

    /// Stop a running suite execution
    Stop {
        /// Suite execution ID
        execution_id: u64,
    },
}

#[derive(Subcommand)]
pub enum ExecutionsCommands {
    /// List executions
    List {
        /// Only the case executions of this suite execution
        #[arg(long)]
        suite: Option<u64>,

        /// Maximum number of records to show (newest first)
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one execution with its log
    Show {
        /// Execution ID
        id: u64,
    },
}

#[derive(Subcommand)]
pub enum BrowserCommands {
    /// Show detected browsers and live debug ports
    Status,

    /// Force-kill automation browser processes
    Kill,
}

impl Cli {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Run { case, device } => {
                commands::run::run(self, case, device.as_deref()).await
            }
            Commands::Suite { command } => commands::suite::run(self, command).await,
            Commands::Record {
                url,
                out,
                device,
                name,
            } => commands::record::run(self, url, out, device.as_deref(), name.as_deref()).await,
            Commands::Executions { command } => commands::executions::run(self, command).await,
            Commands::Devices => commands::devices::run(self).await,
            Commands::Browser { command } => commands::browser::run(self, command).await,
        }
    }
}
