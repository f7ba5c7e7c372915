//! Browser session lifecycle for executions.
//!
//! Every execution gets exactly one attached page. Non-visual runs own a
//! private browser process that is stopped on release; visual runs share a
//! single long-lived instance that survives release so the window stays on
//! screen for the operator.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use super::cdp::{self, CdpConnection};
use super::launcher::{BrowserLauncher, LaunchedBrowser};
use super::page::{CdpPage, Page};
use crate::config::Config;
use crate::error::{ReplayError, Result};
use crate::models::DeviceProfile;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);
const TARGET_LIST_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Common loading-indicator selectors waited away during stabilization
const LOADING_SELECTORS: &[&str] = &[
    ".loading",
    ".spinner",
    ".uni-loading",
    ".van-loading",
    ".el-loading-mask",
    ".ant-spin-spinning",
    "[class*='skeleton']",
];

/// Page handle for one execution.
pub struct Session {
    pub execution_id: u64,
    pub port: u16,
    pub visual: bool,
    page: Arc<CdpPage>,
}

impl Session {
    pub fn page(&self) -> Arc<CdpPage> {
        self.page.clone()
    }

    pub fn connection(&self) -> &Arc<CdpConnection> {
        self.page.connection()
    }
}

struct VisualInstance {
    browser: LaunchedBrowser,
    holder: Option<u64>,
}

#[derive(Default)]
struct Registry {
    /// Private processes keyed by execution id
    processes: HashMap<u64, LaunchedBrowser>,
    /// Live connections keyed by execution id
    attached: HashMap<u64, Arc<CdpConnection>>,
    /// Execution ids with an acquire in flight
    claiming: HashSet<u64>,
    visual: Option<VisualInstance>,
    ports: HashSet<u16>,
}

impl Registry {
    fn allocate_port(&mut self, start: u16, end: u16) -> Result<u16> {
        for port in start..=end {
            if self.ports.contains(&port) {
                continue;
            }
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                self.ports.insert(port);
                return Ok(port);
            }
        }
        Err(ReplayError::BrowserLaunchFailed(format!(
            "No free debug port in {}..={}",
            start, end
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Shared visual instance, with the execution currently attached to it
    Visual { port: u16, pid: u32, holder: Option<u64> },
    Private { execution_id: u64, port: u16, pid: u32 },
}

/// The teardown half of session management, as seen by case runners
#[async_trait]
pub trait SessionTeardown: Send + Sync {
    async fn release(&self, execution_id: u64);
    async fn force_kill(&self, execution_id: u64);
}

/// Starts, reuses, and tears down browser instances for executions
pub struct SessionManager {
    config: Config,
    registry: Mutex<Registry>,
}

impl SessionManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Produce a ready, navigated, device-emulated page for `execution_id`
    pub async fn acquire(
        &self,
        execution_id: u64,
        device: &DeviceProfile,
        target_url: &str,
        visual: bool,
    ) -> Result<Session> {
        {
            let mut registry = self.lock();
            if registry.attached.contains_key(&execution_id)
                || !registry.claiming.insert(execution_id)
            {
                return Err(ReplayError::Other(format!(
                    "Execution {} already has a live session",
                    execution_id
                )));
            }
        }

        let attached = match self
            .claim_instance(execution_id, device, target_url, visual)
            .await
        {
            Ok((port, is_visual)) => self
                .attach(port, device, target_url)
                .await
                .map(|page| (port, is_visual, Arc::new(page))),
            Err(e) => Err(e),
        };

        match attached {
            Ok((port, is_visual, page)) => {
                let mut registry = self.lock();
                registry.claiming.remove(&execution_id);
                registry
                    .attached
                    .insert(execution_id, page.connection().clone());
                Ok(Session {
                    execution_id,
                    port,
                    visual: is_visual,
                    page,
                })
            }
            Err(e) => {
                tracing::warn!(
                    "Acquiring browser for execution {} failed: {}",
                    execution_id,
                    e
                );
                self.release(execution_id).await;
                self.lock().claiming.remove(&execution_id);
                Err(e)
            }
        }
    }

    /// Reuse the healthy visual instance or launch a new process
    async fn claim_instance(
        &self,
        execution_id: u64,
        device: &DeviceProfile,
        target_url: &str,
        visual: bool,
    ) -> Result<(u16, bool)> {
        let wants_shared = visual && self.config.browser.visual_reuse;

        if wants_shared {
            let candidate = {
                let registry = self.lock();
                registry
                    .visual
                    .as_ref()
                    .filter(|v| v.holder.is_none())
                    .map(|v| v.browser.port)
            };

            if let Some(port) = candidate {
                if cdp::is_endpoint_alive(port, HEALTH_CHECK_TIMEOUT).await {
                    let mut registry = self.lock();
                    if let Some(instance) = registry.visual.as_mut() {
                        if instance.holder.is_none() && instance.browser.port == port {
                            instance.holder = Some(execution_id);
                            tracing::info!(
                                "Reusing visual browser on port {} for execution {}",
                                port,
                                execution_id
                            );
                            return Ok((port, true));
                        }
                    }
                } else {
                    tracing::warn!("Visual browser on port {} is stale, discarding", port);
                    let stale = self.lock().visual.take();
                    if let Some(instance) = stale {
                        self.lock().ports.remove(&instance.browser.port);
                        stop_process(instance.browser).await;
                    }
                }
            }
        }

        let port = {
            let mut registry = self.lock();
            registry.allocate_port(self.config.browser.port_start, self.config.browser.port_end)?
        };

        let launched = BrowserLauncher::from_config(&self.config)
            .map(|l| {
                l.cdp_port(port)
                    .headless(self.config.browser.headless && !visual)
                    .device(device)
                    .target_url(target_url)
            });
        let launched = match launched {
            Ok(launcher) => launcher.launch().await,
            Err(e) => Err(e),
        };
        let browser = match launched {
            Ok(browser) => browser,
            Err(e) => {
                self.lock().ports.remove(&port);
                return Err(e);
            }
        };

        let mut registry = self.lock();
        if wants_shared && registry.visual.is_none() {
            registry.visual = Some(VisualInstance {
                browser,
                holder: Some(execution_id),
            });
            Ok((port, true))
        } else {
            // The shared slot is taken; this one is private to the execution
            registry.processes.insert(execution_id, browser);
            Ok((port, false))
        }
    }

    async fn attach(&self, port: u16, device: &DeviceProfile, target_url: &str) -> Result<CdpPage> {
        // Never create a target; the launched window already has one
        let target = cdp::first_page_target(port, TARGET_LIST_TIMEOUT).await?;
        let ws_url = target
            .web_socket_debugger_url
            .clone()
            .ok_or(ReplayError::NoPageTarget(port))?;

        let conn = Arc::new(CdpConnection::connect(&ws_url).await?);
        conn.call("Page.enable", serde_json::json!({})).await?;
        let page = CdpPage::new(conn);

        page.emulate(device).await?;

        let current = page.current_url().await.unwrap_or_default();
        if urls_match(&current, target_url) {
            tracing::debug!("Page already at {}, skipping navigation", target_url);
        } else {
            page.navigate(target_url).await?;
            wait_for_dom_ready(&page, Duration::from_secs(10)).await;
        }

        stabilize(&page).await;
        Ok(page)
    }

    /// Detach the execution's page; stop its private process if it has one.
    /// The shared visual instance is kept alive.
    pub async fn release(&self, execution_id: u64) {
        let (conn, process) = {
            let mut registry = self.lock();
            let conn = registry.attached.remove(&execution_id);
            let process = registry.processes.remove(&execution_id);
            if let Some(process) = &process {
                registry.ports.remove(&process.port);
            }
            if let Some(instance) = registry.visual.as_mut() {
                if instance.holder == Some(execution_id) {
                    instance.holder = None;
                }
            }
            (conn, process)
        };

        if let Some(conn) = conn {
            conn.close();
        }
        if let Some(process) = process {
            stop_process(process).await;
        }
    }

    /// Close the execution's connection so any in-flight protocol call fails
    pub fn interrupt(&self, execution_id: u64) {
        if let Some(conn) = self.lock().attached.get(&execution_id) {
            conn.close();
        }
    }

    /// Hard reset for one execution: kill whatever process backs it,
    /// including the visual instance when this execution holds it.
    pub async fn force_kill(&self, execution_id: u64) {
        let (conn, mut processes) = {
            let mut registry = self.lock();
            let conn = registry.attached.remove(&execution_id);
            let mut processes: Vec<LaunchedBrowser> =
                registry.processes.remove(&execution_id).into_iter().collect();
            let holds_visual = registry
                .visual
                .as_ref()
                .is_some_and(|v| v.holder == Some(execution_id));
            if holds_visual {
                if let Some(instance) = registry.visual.take() {
                    processes.push(instance.browser);
                }
            }
            for p in &processes {
                registry.ports.remove(&p.port);
            }
            (conn, processes)
        };

        if let Some(conn) = conn {
            conn.close();
        }
        for process in processes.iter_mut() {
            tracing::warn!(
                "Force-killing browser pid {} for execution {}",
                process.pid(),
                execution_id
            );
            let _ = process.child.kill().await;
        }
    }

    /// Stop every process this manager started, the visual instance included
    pub async fn cleanup_all(&self) {
        let (conns, processes) = {
            let mut registry = self.lock();
            let conns: Vec<_> = registry.attached.drain().map(|(_, c)| c).collect();
            let mut processes: Vec<_> = registry.processes.drain().map(|(_, p)| p).collect();
            if let Some(instance) = registry.visual.take() {
                processes.push(instance.browser);
            }
            registry.ports.clear();
            (conns, processes)
        };

        for conn in conns {
            conn.close();
        }
        let count = processes.len();
        futures::future::join_all(processes.into_iter().map(stop_process)).await;
        if count > 0 {
            tracing::info!("Stopped {} browser process(es)", count);
        }
    }

    pub fn is_attached(&self, execution_id: u64) -> bool {
        self.lock().attached.contains_key(&execution_id)
    }

    pub fn status(&self) -> Vec<SessionStatus> {
        let registry = self.lock();
        let mut out: Vec<SessionStatus> = registry
            .visual
            .iter()
            .map(|v| SessionStatus::Visual {
                port: v.browser.port,
                pid: v.browser.pid(),
                holder: v.holder,
            })
            .collect();
        out.extend(
            registry
                .processes
                .iter()
                .map(|(id, p)| SessionStatus::Private {
                    execution_id: *id,
                    port: p.port,
                    pid: p.pid(),
                }),
        );
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        // A poisoned registry is still structurally valid
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SessionTeardown for SessionManager {
    async fn release(&self, execution_id: u64) {
        SessionManager::release(self, execution_id).await
    }

    async fn force_kill(&self, execution_id: u64) {
        SessionManager::force_kill(self, execution_id).await
    }
}

fn urls_match(current: &str, target: &str) -> bool {
    !current.is_empty() && current.trim_end_matches('/') == target.trim_end_matches('/')
}

/// SIGINT, then kill after a grace period. Dropping the handle removes the scratch profile.
async fn stop_process(mut process: LaunchedBrowser) {
    #[cfg(unix)]
    {
        if let Some(pid) = process.child.id() {
            // SAFETY: plain signal delivery to a child we spawned and have not reaped
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
            let deadline = Instant::now() + STOP_GRACE;
            while Instant::now() < deadline {
                if let Ok(Some(_)) = process.child.try_wait() {
                    return;
                }
                sleep(Duration::from_millis(100)).await;
            }
        }
    }

    let _ = process.child.kill().await;
}

/// Kill automation-flagged Chrome processes system-wide
pub async fn force_kill_automation_browsers() {
    #[cfg(windows)]
    {
        let _ = tokio::process::Command::new("taskkill")
            .args(["/F", "/IM", "chrome.exe"])
            .output()
            .await;
    }

    #[cfg(not(windows))]
    {
        for pattern in [
            "chrome.*automation",
            "chrome.*disable-blink-features.*AutomationControlled",
        ] {
            match tokio::process::Command::new("pkill")
                .args(["-f", pattern])
                .output()
                .await
            {
                Ok(out) if out.status.success() => {
                    tracing::info!("Killed processes matching {}", pattern)
                }
                Ok(_) => tracing::debug!("No processes matching {}", pattern),
                Err(e) => tracing::warn!("pkill failed: {}", e),
            }
        }
    }
}

/// Debug ports in the range that answer `/json/version`
pub async fn scan_debug_ports(start: u16, end: u16) -> Vec<u16> {
    let probes = (start..=end).map(|port| async move {
        cdp::is_endpoint_alive(port, Duration::from_millis(300))
            .await
            .then_some(port)
    });
    futures::future::join_all(probes)
        .await
        .into_iter()
        .flatten()
        .collect()
}

async fn wait_for_dom_ready(page: &dyn Page, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match page.ready_state().await.as_deref() {
            Ok("interactive") | Ok("complete") => return true,
            _ => sleep(Duration::from_millis(250)).await,
        }
    }
    tracing::debug!("DOM not ready after {}s, continuing", timeout.as_secs());
    false
}

/// Multi-stage settle after a page load. Every stage is best-effort.
pub async fn stabilize(page: &dyn Page) {
    wait_for_dom_ready(page, Duration::from_secs(10)).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        match page.element_state("body").await {
            Ok(state) if state.visible => break,
            _ => sleep(Duration::from_millis(250)).await,
        }
    }

    sleep(Duration::from_secs(1)).await;

    let spa = page
        .evaluate(
            "!!(window.Vue || window.__VUE__ || window.__REACT_DEVTOOLS_GLOBAL_HOOK__ \
             || window.React || window.angular || window.ng || window.uni || window.__NUXT__ \
             || window.__NEXT_DATA__)",
        )
        .await
        .ok()
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if spa {
        tracing::debug!("SPA framework detected, extra settle time");
        sleep(Duration::from_secs(2)).await;
    }

    for selector in LOADING_SELECTORS {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            match page.element_state(selector).await {
                Ok(state) if state.visible && Instant::now() < deadline => {
                    sleep(Duration::from_millis(200)).await;
                }
                Ok(state) if state.visible => {
                    tracing::debug!("Loading indicator {} still visible, continuing", selector);
                    break;
                }
                _ => break,
            }
        }
    }

    sleep(Duration::from_millis(500)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::page::mock::MockPage;

    #[test]
    fn url_match_ignores_trailing_slash() {
        assert!(urls_match("https://a.test/", "https://a.test"));
        assert!(!urls_match("", "https://a.test"));
        assert!(!urls_match("about:blank", "https://a.test"));
    }

    #[test]
    fn port_allocation_skips_reserved_ports() {
        let mut registry = Registry::default();
        let first = registry.allocate_port(39200, 39260).unwrap();
        let second = registry.allocate_port(39200, 39260).unwrap();
        assert_ne!(first, second);
        assert!(registry.ports.contains(&first));
    }

    #[test]
    fn exhausted_port_range_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = listener.local_addr().unwrap().port();
        let mut registry = Registry::default();

        let err = registry.allocate_port(busy, busy).unwrap_err();
        assert!(matches!(err, ReplayError::BrowserLaunchFailed(_)));
    }

    #[tokio::test]
    async fn release_of_unknown_execution_is_noop() {
        let manager = SessionManager::new(Config::default());
        manager.release(42).await;
        manager.force_kill(42).await;
        assert!(manager.status().is_empty());
        assert!(!manager.is_attached(42));
    }

    #[cfg(unix)]
    fn sleeper() -> LaunchedBrowser {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        LaunchedBrowser {
            child,
            port: 0,
            profile_dir: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_process_reaps_the_child() {
        let process = sleeper();
        let pid = process.pid() as libc::pid_t;
        assert!(pid > 0);

        stop_process(process).await;
        // SAFETY: signal 0 only checks for existence
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn force_kill_reaps_private_process() {
        let manager = SessionManager::new(Config::default());
        manager.lock().processes.insert(3, sleeper());
        assert_eq!(manager.status().len(), 1);

        manager.force_kill(3).await;
        assert!(manager.status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stabilize_tolerates_missing_body() {
        let page = MockPage::new();
        stabilize(&page).await;
        assert!(page.count("evaluate") >= 1);
    }
}
