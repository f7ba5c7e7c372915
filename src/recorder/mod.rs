//! Interactive recording sessions.
//!
//! A session opens a visible browser on the target URL, injects the capture
//! script, and harvests queued events on a fixed interval. Protocol-level
//! navigation events trigger re-injection so capture survives page changes.

pub mod codegen;
pub mod harvest;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::browser::{CdpEvent, Page, SessionManager};
use crate::config::Config;
use crate::error::{ReplayError, Result};
use crate::models::{DeviceProfile, Step};

use harvest::{ReinjectGate, ScriptFault};

/// Browser registry keys for recording sessions live above execution ids
const SESSION_KEY_BASE: u64 = 1 << 62;
const INJECT_ATTEMPTS: usize = 3;

/// One captured interaction, as pushed to observers
#[derive(Debug, Clone, Serialize)]
pub struct RecorderEvent {
    pub session_id: String,
    pub index: usize,
    pub step: Step,
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingInfo {
    pub session_id: String,
    pub target_url: String,
    pub device: String,
    pub steps: usize,
    pub started_at: DateTime<Utc>,
}

struct RecordingSession {
    key: u64,
    target_url: String,
    device: DeviceProfile,
    started_at: DateTime<Utc>,
    page: Arc<dyn Page>,
    steps: Arc<Mutex<Vec<Step>>>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Serializes re-injection between the poller and the navigation listener
struct Reinjector {
    page: Arc<dyn Page>,
    gate: ReinjectGate,
    busy: tokio::sync::Mutex<()>,
}

impl Reinjector {
    async fn recover(&self, fault: ScriptFault) {
        if fault == ScriptFault::Other || !self.gate.permit(fault) {
            return;
        }
        let _busy = self.busy.lock().await;
        let outcome = match fault {
            ScriptFault::Missing => harvest::reinject_same_document(&*self.page).await,
            _ => harvest::reinject_cross_domain(&*self.page).await,
        };
        if let Err(e) = outcome {
            tracing::warn!("Recorder re-injection failed: {}", e);
        }
    }

    /// Inject again unless the recorder is already live
    async fn ensure(&self, settle: Duration) {
        tokio::time::sleep(settle).await;
        let _busy = self.busy.lock().await;
        if harvest::is_injected(&*self.page).await.unwrap_or(false) {
            return;
        }
        match harvest::inject(&*self.page).await {
            Ok(true) => tracing::debug!("Recorder injected after document load"),
            Ok(false) => tracing::debug!("Recorder not live after document load"),
            Err(e) => tracing::debug!("Recorder inject after load failed: {}", e),
        }
    }
}

/// Owns every active recording session
pub struct RecorderManager {
    sessions: Arc<SessionManager>,
    poll_interval: Duration,
    active: Mutex<HashMap<String, RecordingSession>>,
    next_key: AtomicU64,
    events: broadcast::Sender<RecorderEvent>,
}

impl RecorderManager {
    pub fn new(config: &Config, sessions: Arc<SessionManager>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions,
            poll_interval: Duration::from_millis(config.recorder.poll_interval_ms.max(10)),
            active: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(SESSION_KEY_BASE),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RecordingSession>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Live stream of captured steps across all sessions
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    pub fn is_recording(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn sessions(&self) -> Vec<RecordingInfo> {
        let mut infos: Vec<RecordingInfo> = self
            .lock()
            .iter()
            .map(|(id, s)| RecordingInfo {
                session_id: id.clone(),
                target_url: s.target_url.clone(),
                device: s.device.name.clone(),
                steps: s.steps.lock().map(|v| v.len()).unwrap_or(0),
                started_at: s.started_at,
            })
            .collect();
        infos.sort_by_key(|i| i.started_at);
        infos
    }

    /// Open a headed browser on `target_url` and start capturing
    pub async fn start_session(
        &self,
        session_id: &str,
        target_url: &str,
        device: &DeviceProfile,
    ) -> Result<()> {
        if self.is_recording(session_id) {
            return Err(ReplayError::RecorderSession(format!(
                "session {} is already recording",
                session_id
            )));
        }

        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let session = self.sessions.acquire(key, device, target_url, true).await?;
        let navigation = session.connection().subscribe();
        let page: Arc<dyn Page> = session.page();

        tracing::info!(
            "Recording session {} on port {} ({})",
            session_id,
            session.port,
            device.name
        );

        if let Err(e) = self
            .attach(session_id, key, page, Some(navigation), target_url, device)
            .await
        {
            self.sessions.release(key).await;
            return Err(e);
        }
        Ok(())
    }

    async fn attach(
        &self,
        session_id: &str,
        key: u64,
        page: Arc<dyn Page>,
        navigation: Option<broadcast::Receiver<CdpEvent>>,
        target_url: &str,
        device: &DeviceProfile,
    ) -> Result<()> {
        let mut live = false;
        for attempt in 1..=INJECT_ATTEMPTS {
            match harvest::inject(&*page).await {
                Ok(true) => {
                    live = true;
                    break;
                }
                Ok(false) => tracing::debug!("Recorder not live after attempt {}", attempt),
                Err(e) => tracing::debug!("Recorder inject attempt {} failed: {}", attempt, e),
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        if !live {
            return Err(ReplayError::RecorderSession(format!(
                "could not inject the recorder into {}",
                target_url
            )));
        }

        let steps = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();
        let reinjector = Arc::new(Reinjector {
            page: page.clone(),
            gate: ReinjectGate::new(),
            busy: tokio::sync::Mutex::new(()),
        });

        let mut tasks = vec![tokio::spawn(poll(
            session_id.to_string(),
            page.clone(),
            reinjector.clone(),
            steps.clone(),
            self.events.clone(),
            self.poll_interval,
            stop.clone(),
        ))];
        if let Some(navigation) = navigation {
            tasks.push(tokio::spawn(follow_navigation(
                navigation,
                reinjector,
                stop.clone(),
            )));
        }

        let session = RecordingSession {
            key,
            target_url: target_url.to_string(),
            device: device.clone(),
            started_at: Utc::now(),
            page,
            steps,
            stop,
            tasks,
        };

        let rejected = {
            let mut active = self.lock();
            if active.contains_key(session_id) {
                Some(session)
            } else {
                active.insert(session_id.to_string(), session);
                None
            }
        };
        if let Some(session) = rejected {
            session.stop.cancel();
            for task in session.tasks {
                task.abort();
            }
            return Err(ReplayError::RecorderSession(format!(
                "session {} is already recording",
                session_id
            )));
        }
        Ok(())
    }

    /// Steps captured so far
    pub fn current_steps(&self, session_id: &str) -> Result<Vec<Step>> {
        let active = self.lock();
        let session = active.get(session_id).ok_or_else(|| {
            ReplayError::RecorderSession(format!("no recording session {}", session_id))
        })?;
        let steps = match session.steps.lock() {
            Ok(steps) => steps.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Ok(steps)
    }

    /// Stop capturing, close the browser, and return every captured step
    pub async fn stop_session(&self, session_id: &str) -> Result<Vec<Step>> {
        let session = self.lock().remove(session_id).ok_or_else(|| {
            ReplayError::RecorderSession(format!("no recording session {}", session_id))
        })?;

        session.stop.cancel();
        for task in session.tasks {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                tracing::debug!("Recorder task for {} did not stop in time", session_id);
            }
        }

        // Events queued after the last tick
        match harvest::drain(&*session.page).await {
            Ok(tail) if !tail.is_empty() => {
                if let Ok(mut steps) = session.steps.lock() {
                    steps.extend(tail);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Final harvest for {} failed: {}", session_id, e),
        }

        self.sessions.release(session.key).await;

        let steps = match Arc::try_unwrap(session.steps) {
            Ok(steps) => steps.into_inner().unwrap_or_else(|p| p.into_inner()),
            Err(shared) => match shared.lock() {
                Ok(steps) => steps.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
        };
        tracing::info!(
            "Recording session {} stopped with {} steps",
            session_id,
            steps.len()
        );
        Ok(steps)
    }

    /// Stop every session
    pub async fn cleanup(&self) {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_session(&id).await {
                tracing::debug!("Cleanup of {}: {}", id, e);
            }
        }
    }
}

async fn poll(
    session_id: String,
    page: Arc<dyn Page>,
    reinjector: Arc<Reinjector>,
    steps: Arc<Mutex<Vec<Step>>>,
    events: broadcast::Sender<RecorderEvent>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match harvest::drain(&*page).await {
            Ok(batch) => {
                for step in batch {
                    let index = match steps.lock() {
                        Ok(mut steps) => {
                            steps.push(step.clone());
                            steps.len() - 1
                        }
                        Err(_) => continue,
                    };
                    tracing::debug!("Captured {} {}", step.kind, step.selector);
                    let code = codegen::step_code(&step);
                    // No observers is fine
                    let _ = events.send(RecorderEvent {
                        session_id: session_id.clone(),
                        index,
                        step,
                        code,
                    });
                }
            }
            Err(e) => {
                let fault = ScriptFault::classify(&e.to_string());
                tracing::debug!("Harvest for {} failed ({:?}): {}", session_id, fault, e);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = reinjector.recover(fault) => {}
                }
            }
        }
    }
}

async fn follow_navigation(
    mut navigation: broadcast::Receiver<CdpEvent>,
    reinjector: Arc<Reinjector>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = navigation.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Navigation listener skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let work = async {
            match event.method.as_str() {
                // Subframe navigations leave the main document alone
                "Page.frameNavigated" if event.params["frame"]["parentId"].is_null() => {
                    reinjector.recover(ScriptFault::Navigation).await
                }
                "Page.navigatedWithinDocument" => reinjector.recover(ScriptFault::Missing).await,
                "Page.domContentEventFired" => {
                    reinjector.ensure(Duration::from_millis(300)).await
                }
                "Page.loadEventFired" => reinjector.ensure(Duration::from_millis(500)).await,
                _ => {}
            }
        };
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = work => {}
        }
    }
}
