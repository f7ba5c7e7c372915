use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Browser not found. Please install Chrome, Chromium, or Edge.")]
    BrowserNotFound,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("CDP connection failed: {0}")]
    CdpConnectionFailed(String),

    #[error("No page target available on debug port {0}")]
    NoPageTarget(u16),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("failed to click element with any selector (tried {tried} selectors)")]
    SelectorExhausted { tried: usize },

    #[error("JavaScript execution failed: {0}")]
    JavaScriptError(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Step failed: {0}")]
    StepFailed(String),

    #[error("unsupported step type: {0}")]
    UnsupportedStep(String),

    #[error("Captcha handling failed: {0}")]
    Captcha(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("Concurrency limit reached: {running} running, {required} required, {max} max")]
    CapacityExceeded {
        running: usize,
        required: usize,
        max: usize,
    },

    #[error("Execution fault: {0}")]
    Fault(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(u64),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Recording session error: {0}")]
    RecorderSession(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ReplayError {
    /// Whether the failure came from the browser environment rather than the test itself.
    pub fn is_environment(&self) -> bool {
        matches!(
            self,
            ReplayError::BrowserNotFound
                | ReplayError::BrowserLaunchFailed(_)
                | ReplayError::CdpConnectionFailed(_)
                | ReplayError::NoPageTarget(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;
