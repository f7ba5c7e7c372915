use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};

use super::cdp;
use super::discovery::{discover_browser, BrowserInfo};
use crate::config::Config;
use crate::error::{ReplayError, Result};
use crate::models::DeviceProfile;

/// A browser process started with remote debugging enabled.
///
/// The scratch profile directory lives as long as this handle.
#[derive(Debug)]
pub struct LaunchedBrowser {
    pub child: Child,
    pub port: u16,
    pub profile_dir: Option<TempDir>,
}

impl LaunchedBrowser {
    /// Process id, or 0 once the process has been reaped
    pub fn pid(&self) -> u32 {
        self.child.id().unwrap_or(0)
    }
}

/// Browser launcher that starts a browser with CDP enabled
pub struct BrowserLauncher {
    browser_info: BrowserInfo,
    cdp_port: u16,
    headless: bool,
    device: DeviceProfile,
    target_url: Option<String>,
    extra_args: Vec<String>,
    ready_timeout: Duration,
}

impl BrowserLauncher {
    pub fn from_config(config: &Config) -> Result<Self> {
        let browser_info = discover_browser(config.browser_executable().as_deref())?;
        Ok(Self {
            browser_info,
            cdp_port: config.browser.port_start,
            headless: config.browser.headless,
            device: DeviceProfile::default(),
            target_url: None,
            extra_args: config.browser.extra_args.clone(),
            ready_timeout: Duration::from_secs(config.browser.ready_timeout_secs),
        })
    }

    pub fn cdp_port(mut self, port: u16) -> Self {
        self.cdp_port = port;
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn device(mut self, device: &DeviceProfile) -> Self {
        self.device = device.clone();
        self
    }

    /// Page opened directly at startup, avoiding a blank first tab
    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn browser_info(&self) -> &BrowserInfo {
        &self.browser_info
    }

    fn build_args(&self, profile_dir: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            format!("--remote-debugging-port={}", self.cdp_port),
            format!("--user-data-dir={}", profile_dir.display()),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-default-apps".to_string(),
            "--disable-extensions".to_string(),
            "--disable-infobars".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-background-timer-throttling".to_string(),
            "--disable-backgrounding-occluded-windows".to_string(),
            "--disable-renderer-backgrounding".to_string(),
            "--disable-sync".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            format!("--window-size={},{}", self.device.width, self.device.height),
        ];

        if !self.device.user_agent.is_empty() {
            args.push(format!("--user-agent={}", self.device.user_agent));
        }

        if self.headless {
            args.push("--headless=new".to_string());
        } else {
            args.push("--start-minimized".to_string());
        }

        args.extend(self.extra_args.iter().cloned());

        // The URL must come last
        if let Some(url) = &self.target_url {
            args.push(url.clone());
        }

        args
    }

    /// Spawn the process and wait until its debug endpoint lists targets.
    /// A process that never becomes ready is killed before returning the error.
    pub async fn launch(&self) -> Result<LaunchedBrowser> {
        let profile_dir = tempfile::Builder::new()
            .prefix("replaybook-profile-")
            .tempdir()?;
        let args = self.build_args(profile_dir.path());

        tracing::debug!(
            "Launching browser: {:?} with args: {:?}",
            self.browser_info.path,
            args
        );

        let child = Command::new(&self.browser_info.path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                ReplayError::BrowserLaunchFailed(format!(
                    "Failed to launch {}: {}",
                    self.browser_info.browser_type.name(),
                    e
                ))
            })?;

        let mut launched = LaunchedBrowser {
            child,
            port: self.cdp_port,
            profile_dir: Some(profile_dir),
        };

        if let Err(e) = wait_for_cdp(self.cdp_port, self.ready_timeout).await {
            let _ = launched.child.kill().await;
            return Err(e);
        }

        tracing::info!(
            "Browser ready on port {} (pid {})",
            self.cdp_port,
            launched.pid()
        );
        Ok(launched)
    }
}

/// Poll `/json/list` every 500ms until the endpoint answers or `timeout` passes
pub async fn wait_for_cdp(port: u16, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;

    while Instant::now() < deadline {
        sleep(Duration::from_millis(500)).await;
        attempt += 1;

        match cdp::list_targets(port, Duration::from_secs(2)).await {
            Ok(_) => return Ok(()),
            Err(e) => tracing::debug!("CDP not ready yet (attempt {}): {}", attempt, e),
        }
    }

    Err(ReplayError::CdpConnectionFailed(format!(
        "Timeout waiting for CDP on port {} after {}s",
        port,
        timeout.as_secs()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::discovery::BrowserType;
    use std::path::PathBuf;

    fn launcher() -> BrowserLauncher {
        BrowserLauncher {
            browser_info: BrowserInfo::new(BrowserType::Chrome, PathBuf::from("/usr/bin/chrome")),
            cdp_port: 9333,
            headless: false,
            device: crate::config::device::find("Pixel 5").unwrap(),
            target_url: Some("https://shop.test/home".to_string()),
            extra_args: vec!["--lang=en-US".to_string()],
            ready_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn args_carry_port_device_and_url_last() {
        let args = launcher().build_args(std::path::Path::new("/tmp/p"));

        assert_eq!(args[0], "--remote-debugging-port=9333");
        assert!(args.contains(&"--user-data-dir=/tmp/p".to_string()));
        assert!(args.contains(&"--window-size=393,851".to_string()));
        assert!(args.contains(&"--start-minimized".to_string()));
        assert!(args.contains(&"--lang=en-US".to_string()));
        assert_eq!(args.last().unwrap(), "https://shop.test/home");
    }

    #[test]
    fn headless_replaces_minimized() {
        let args = launcher().headless(true).build_args(std::path::Path::new("/tmp/p"));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(!args.contains(&"--start-minimized".to_string()));
    }

    #[tokio::test]
    async fn wait_for_cdp_times_out_on_dead_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = wait_for_cdp(port, Duration::from_millis(1100)).await.unwrap_err();
        assert!(matches!(err, ReplayError::CdpConnectionFailed(_)));
    }
}
