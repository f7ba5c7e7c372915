use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{ReplayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserType {
    Chrome,
    Chromium,
    Edge,
}

impl BrowserType {
    pub fn name(&self) -> &'static str {
        match self {
            BrowserType::Chrome => "Google Chrome",
            BrowserType::Chromium => "Chromium",
            BrowserType::Edge => "Microsoft Edge",
        }
    }

    /// Executable names probed on PATH
    fn path_names(&self) -> &'static [&'static str] {
        match self {
            BrowserType::Chrome => &["google-chrome", "google-chrome-stable", "chrome"],
            BrowserType::Chromium => &["chromium", "chromium-browser"],
            BrowserType::Edge => &["microsoft-edge", "msedge"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrowserInfo {
    pub browser_type: BrowserType,
    pub path: PathBuf,
    pub version: Option<String>,
}

impl BrowserInfo {
    pub fn new(browser_type: BrowserType, path: PathBuf) -> Self {
        Self {
            browser_type,
            path,
            version: None,
        }
    }

    pub fn with_version(mut self) -> Self {
        self.version = detect_version(&self.path);
        self
    }
}

/// Resolve the browser to launch.
///
/// An explicit path wins and must exist; otherwise well-known install
/// locations are probed, then PATH.
pub fn discover_browser(explicit: Option<&Path>) -> Result<BrowserInfo> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ReplayError::BrowserLaunchFailed(format!(
                "Browser not found at: {}",
                path.display()
            )));
        }
        return Ok(BrowserInfo::new(guess_type(path), path.to_path_buf()));
    }

    discover_all_browsers()
        .into_iter()
        .next()
        .ok_or(ReplayError::BrowserNotFound)
}

/// All Chrome-family browsers found, highest priority first
pub fn discover_all_browsers() -> Vec<BrowserInfo> {
    let mut found = Vec::new();

    for (browser_type, paths) in browser_candidates() {
        let on_disk = paths
            .iter()
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
            .find(|p| p.exists());

        let located = on_disk.or_else(|| {
            browser_type
                .path_names()
                .iter()
                .find_map(|name| which::which(name).ok())
        });

        if let Some(path) = located {
            found.push(BrowserInfo::new(browser_type, path).with_version());
        }
    }

    found
}

fn guess_type(path: &Path) -> BrowserType {
    let name = path.to_string_lossy().to_lowercase();
    if name.contains("edge") {
        BrowserType::Edge
    } else if name.contains("chromium") {
        BrowserType::Chromium
    } else {
        BrowserType::Chrome
    }
}

fn browser_candidates() -> Vec<(BrowserType, Vec<&'static str>)> {
    #[cfg(target_os = "macos")]
    {
        vec![
            (
                BrowserType::Chrome,
                vec![
                    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                    "~/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                ],
            ),
            (
                BrowserType::Chromium,
                vec!["/Applications/Chromium.app/Contents/MacOS/Chromium"],
            ),
            (
                BrowserType::Edge,
                vec!["/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"],
            ),
        ]
    }

    #[cfg(target_os = "linux")]
    {
        vec![
            (
                BrowserType::Chrome,
                vec![
                    "/usr/bin/google-chrome",
                    "/usr/bin/google-chrome-stable",
                    "/opt/google/chrome/chrome",
                ],
            ),
            (
                BrowserType::Chromium,
                vec![
                    "/usr/bin/chromium",
                    "/usr/bin/chromium-browser",
                    "/snap/bin/chromium",
                ],
            ),
            (
                BrowserType::Edge,
                vec!["/usr/bin/microsoft-edge", "/usr/bin/microsoft-edge-stable"],
            ),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![
            (
                BrowserType::Chrome,
                vec![
                    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
                    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
                ],
            ),
            (
                BrowserType::Edge,
                vec![
                    r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
                    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
                ],
            ),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        vec![]
    }
}

/// "Google Chrome 120.0.6099.109" -> "120.0.6099.109"
fn detect_version(path: &Path) -> Option<String> {
    let output = Command::new(path).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout);
    let version = version.trim();
    match version.rfind(' ') {
        Some(idx) => Some(version[idx + 1..].to_string()),
        None => Some(version.to_string()),
    }
}
