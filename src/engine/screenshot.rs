use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::browser::Page;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotKind {
    Initial,
    Step,
    Error,
    Final,
}

impl ShotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShotKind::Initial => "initial",
            ShotKind::Step => "step",
            ShotKind::Error => "error",
            ShotKind::Final => "final",
        }
    }
}

/// Screenshot files grouped into per-day folders under one root.
///
/// Paths handed back to callers are relative to the root:
/// `<YYYY-MM-DD>/<name>_<kind>_<index>_<HH-MM-SS>.png`.
#[derive(Debug, Clone)]
pub struct ScreenshotStore {
    root: PathBuf,
}

impl ScreenshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn save(
        &self,
        case_name: &str,
        kind: ShotKind,
        index: usize,
        png: &[u8],
    ) -> Result<String> {
        let now = Local::now();
        let relative = relative_path(case_name, kind, index, now);
        let full = self.root.join(&relative);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, png).await?;
        Ok(relative)
    }

    /// Capture the page and store it. Failures are logged and yield `None`.
    pub async fn capture(
        &self,
        page: &dyn Page,
        case_name: &str,
        kind: ShotKind,
        index: usize,
    ) -> Option<String> {
        let png = match page.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                tracing::warn!("{} screenshot failed: {}", kind.as_str(), e);
                return None;
            }
        };
        match self.save(case_name, kind, index, &png).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("Saving {} screenshot failed: {}", kind.as_str(), e);
                None
            }
        }
    }
}

pub fn relative_path(case_name: &str, kind: ShotKind, index: usize, at: DateTime<Local>) -> String {
    format!(
        "{}/{}_{}_{}_{}.png",
        at.format("%Y-%m-%d"),
        sanitize_name(case_name),
        kind.as_str(),
        index,
        at.format("%H-%M-%S")
    )
}

/// Replace path-hostile characters with `_`
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "case".to_string()
    } else {
        cleaned
    }
}
