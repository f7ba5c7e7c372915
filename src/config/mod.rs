pub mod device;

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub suite: SuiteConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    #[serde(default)]
    pub captcha: CaptchaConfig,
}

/// Worker pool and per-case execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrent executions
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How long a worker waits for the caller to confirm the result was persisted
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// Hard ceiling for one test case
    #[serde(default = "default_case_timeout_secs")]
    pub case_timeout_secs: u64,

    /// Pause before a direct (unqueued) run starts its browser work
    #[serde(default = "default_direct_isolation_ms")]
    pub direct_isolation_ms: u64,

    /// Delay before the safety-net browser kill after a contained fault
    #[serde(default = "default_force_kill_delay_secs")]
    pub force_kill_delay_secs: u64,

    /// Pause between consecutive steps
    #[serde(default = "default_step_gap_ms")]
    pub step_gap_ms: u64,

    /// Root folder for screenshots (per-day subfolders are created below it)
    #[serde(default = "default_screenshots_dir")]
    pub screenshots_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            ack_timeout_secs: default_ack_timeout_secs(),
            case_timeout_secs: default_case_timeout_secs(),
            direct_isolation_ms: default_direct_isolation_ms(),
            force_kill_delay_secs: default_force_kill_delay_secs(),
            step_gap_ms: default_step_gap_ms(),
            screenshots_dir: default_screenshots_dir(),
        }
    }
}

impl EngineConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn case_timeout(&self) -> Duration {
        Duration::from_secs(self.case_timeout_secs)
    }

    pub fn step_gap(&self) -> Duration {
        Duration::from_millis(self.step_gap_ms)
    }
}

fn default_max_workers() -> usize {
    10
}

fn default_ack_timeout_secs() -> u64 {
    10
}

fn default_case_timeout_secs() -> u64 {
    600
}

fn default_direct_isolation_ms() -> u64 {
    500
}

fn default_force_kill_delay_secs() -> u64 {
    2
}

fn default_step_gap_ms() -> u64 {
    500
}

fn default_screenshots_dir() -> PathBuf {
    PathBuf::from("screenshots")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Browser executable path (overrides auto-discovery)
    pub executable: Option<String>,

    /// Run non-visual sessions headless
    #[serde(default)]
    pub headless: bool,

    /// Keep one visible browser alive across executions
    #[serde(default = "default_true")]
    pub visual_reuse: bool,

    /// First debug port probed for new instances
    #[serde(default = "default_port_start")]
    pub port_start: u16,

    /// Last debug port probed for new instances
    #[serde(default = "default_port_end")]
    pub port_end: u16,

    /// How long a freshly launched instance may take to answer on its debug port
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Extra browser arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            headless: false,
            visual_reuse: true,
            port_start: default_port_start(),
            port_end: default_port_end(),
            ready_timeout_secs: default_ready_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_port_start() -> u16 {
    9222
}

fn default_port_end() -> u16 {
    9322
}

fn default_ready_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Delay between serial cases
    #[serde(default = "default_isolation_delay_ms")]
    pub isolation_delay_ms: u64,

    /// Per-index launch stagger for parallel cases
    #[serde(default = "default_parallel_stagger_ms")]
    pub parallel_stagger_ms: u64,

    /// When a still-running record is given up on and its outcome inferred
    #[serde(default = "default_safety_timeout_secs")]
    pub safety_timeout_secs: u64,

    /// Directory of the file-backed execution store
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            isolation_delay_ms: default_isolation_delay_ms(),
            parallel_stagger_ms: default_parallel_stagger_ms(),
            safety_timeout_secs: default_safety_timeout_secs(),
            store_dir: default_store_dir(),
        }
    }
}

fn default_isolation_delay_ms() -> u64 {
    2000
}

fn default_parallel_stagger_ms() -> u64 {
    500
}

fn default_safety_timeout_secs() -> u64 {
    12 * 60
}

fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("replaybook")
        .join("executions")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Harvest interval for queued in-page events
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    /// OCR service accepting a PNG body and answering `{"code": "..."}`
    pub ocr_service_url: Option<String>,

    #[serde(default = "default_image_load_attempts")]
    pub image_load_attempts: u32,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            ocr_service_url: None,
            image_load_attempts: default_image_load_attempts(),
        }
    }
}

fn default_image_load_attempts() -> u32 {
    10
}

impl Config {
    /// Load configuration from all sources (file, env, defaults)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration using an explicit file path
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            // REPLAYBOOK_ENGINE__MAX_WORKERS=4 -> engine.max_workers
            .merge(Env::prefixed("REPLAYBOOK_").split("__"))
            .extract()
            .map_err(|e| ReplayError::ConfigError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_workers == 0 {
            return Err(ReplayError::ConfigError(
                "engine.max_workers must be at least 1".to_string(),
            ));
        }
        if self.browser.port_start > self.browser.port_end {
            return Err(ReplayError::ConfigError(format!(
                "browser.port_start ({}) is above browser.port_end ({})",
                self.browser.port_start, self.browser.port_end
            )));
        }
        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("replaybook")
            .join("config.toml")
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ReplayError::ConfigError(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve the browser executable, expanding `~` in configured paths
    pub fn browser_executable(&self) -> Option<PathBuf> {
        self.browser
            .executable
            .as_deref()
            .map(|exe| PathBuf::from(shellexpand::tilde(exe).to_string()))
    }
}
