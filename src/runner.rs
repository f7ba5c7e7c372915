//! One test case, end to end.
//!
//! acquire session -> initial screenshot -> steps -> final screenshot ->
//! metrics -> outcome. Panics are contained at this boundary and turned into
//! failed results. The browser behind a panicked or cancelled run is
//! force-killed shortly after as a safety net.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::browser::{Page, SessionManager, SessionTeardown};
use crate::config::Config;
use crate::engine::{metrics, CaptchaSolver, ShotKind, SmsCodeSource, StepContext, StepEngine};
use crate::error::{ReplayError, Result};
use crate::models::{Execution, ExecutionResult, LogEntry, TestCase};

/// Executes one test case for one execution record
#[async_trait]
pub trait CaseRunner: Send + Sync {
    async fn run(
        &self,
        execution: &Execution,
        case: &TestCase,
        cancel: CancellationToken,
    ) -> ExecutionResult;
}

/// Run `fut` on its own task so a panic inside it surfaces as `ReplayError::Fault`
pub async fn contain<T, F>(fut: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => Err(ReplayError::Fault(panic_message(e.into_panic()))),
        Err(e) => Err(ReplayError::Fault(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result for a run that was cancelled
pub fn cancelled_result(logs: Vec<LogEntry>) -> ExecutionResult {
    ExecutionResult {
        success: false,
        cancelled: true,
        error_message: ReplayError::Cancelled.to_string(),
        logs,
        ..Default::default()
    }
}

/// Drives real browser sessions
#[derive(Clone)]
pub struct TestCaseRunner {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    visual: bool,
    sms: Option<Arc<dyn SmsCodeSource>>,
}

impl TestCaseRunner {
    pub fn new(config: Arc<Config>, sessions: Arc<SessionManager>) -> Self {
        Self {
            config,
            sessions,
            visual: false,
            sms: None,
        }
    }

    /// Visual runs keep the browser window on screen and may share it
    pub fn visual(mut self, visual: bool) -> Self {
        self.visual = visual;
        self
    }

    pub fn with_sms_source(mut self, source: Arc<dyn SmsCodeSource>) -> Self {
        self.sms = Some(source);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    async fn execute(
        &self,
        execution_id: u64,
        case: TestCase,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let ctx = StepContext::new(cancel.clone(), self.config.engine.case_timeout());
        tracing::info!(
            "Execution {}: starting test case {} ({} steps)",
            execution_id,
            case.name,
            case.steps.len()
        );

        let session = match ctx
            .guard(self.sessions.acquire(
                execution_id,
                &case.device,
                &case.environment_base_url,
                self.visual,
            ))
            .await
        {
            Ok(session) => session,
            Err(ReplayError::Cancelled) => {
                self.sessions.release(execution_id).await;
                return cancelled_result(vec![LogEntry::warn("Cancelled before the browser was ready")]);
            }
            Err(e) => {
                self.sessions.release(execution_id).await;
                return ExecutionResult::failed(format!("Failed to start browser session: {}", e));
            }
        };

        // Cancellation tears the connection down so in-flight calls fail fast
        let interrupt = {
            let sessions = self.sessions.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                sessions.interrupt(execution_id);
            })
        };

        let page: Arc<dyn Page> = session.page();
        let mut captcha = CaptchaSolver::from_config(&self.config.captcha);
        if let Some(sms) = &self.sms {
            captcha = captcha.with_sms_source(sms.clone());
        }
        let mut engine =
            StepEngine::new(page.clone(), ctx.clone(), &self.config, case.name.clone())
                .with_captcha(captcha);

        engine.log(LogEntry::info(format!(
            "Browser session ready on port {} ({})",
            session.port, case.device.name
        )));
        engine.screenshot(ShotKind::Initial, 0).await;

        let outcome = engine.run_steps(&case.steps).await;

        let mut metrics = None;
        if !ctx.is_cancelled() {
            engine.screenshot(ShotKind::Final, case.steps.len()).await;
            metrics = metrics::collect(&*page).await;
        }

        interrupt.abort();
        self.sessions.release(execution_id).await;

        let cancelled = cancel.is_cancelled() || matches!(outcome, Err(ReplayError::Cancelled));
        let (mut logs, screenshots) = engine.into_parts();

        let (success, error_message) = match outcome {
            _ if cancelled => (false, ReplayError::Cancelled.to_string()),
            Ok(()) => (true, String::new()),
            Err(e) => (false, e.to_string()),
        };
        logs.push(if success {
            LogEntry::info("Test case passed")
        } else {
            LogEntry::error(format!("Test case did not pass: {}", error_message))
        });

        ExecutionResult {
            success,
            cancelled,
            error_message,
            screenshots,
            logs,
            metrics,
        }
    }
}

#[async_trait]
impl CaseRunner for TestCaseRunner {
    async fn run(
        &self,
        execution: &Execution,
        case: &TestCase,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let execution_id = execution.id;
        let runner = self.clone();
        let case = case.clone();

        let outcome =
            contain(async move { runner.execute(execution_id, case, cancel).await }).await;
        let delay = Duration::from_secs(self.config.engine.force_kill_delay_secs);
        settle(self.sessions.clone(), execution_id, delay, outcome).await
    }
}

/// Turn a contained run into its result and schedule browser cleanup.
///
/// A panicked run never reached its own release, so the session is released
/// here before anything else. Panicked and cancelled runs both get a forced
/// kill after `delay` for a process that ignored the graceful stop.
pub async fn settle(
    sessions: Arc<dyn SessionTeardown>,
    execution_id: u64,
    delay: Duration,
    outcome: Result<ExecutionResult>,
) -> ExecutionResult {
    let result = match outcome {
        Ok(result) if !result.cancelled => return result,
        Ok(result) => {
            tracing::info!(
                "Execution {} cancelled, force-kill scheduled in {}s",
                execution_id,
                delay.as_secs()
            );
            result
        }
        Err(e) => {
            tracing::error!("Execution {} panicked: {}", execution_id, e);
            sessions.release(execution_id).await;
            ExecutionResult::failed(format!("Execution panic: {}", e))
        }
    };

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        sessions.force_kill(execution_id).await;
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn contained_panic_becomes_fault() {
        let err = contain(async {
            panic!("boom");
        })
        .await
        .map(|_: ()| ())
        .unwrap_err();
        assert!(matches!(err, ReplayError::Fault(ref m) if m == "boom"));
    }

    #[tokio::test]
    async fn contained_value_passes_through() {
        assert_eq!(contain(async { 41 + 1 }).await.unwrap(), 42);
    }

    #[test]
    fn formatted_panic_payload_is_kept() {
        let payload: Box<dyn Any + Send> = Box::new(format!("index {} out of range", 3));
        assert_eq!(panic_message(payload), "index 3 out of range");
    }

    /// Records teardown calls in order
    #[derive(Default)]
    struct Recorded {
        calls: Mutex<Vec<String>>,
    }

    impl Recorded {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionTeardown for Recorded {
        async fn release(&self, execution_id: u64) {
            self.calls.lock().unwrap().push(format!("release {}", execution_id));
        }

        async fn force_kill(&self, execution_id: u64) {
            self.calls.lock().unwrap().push(format!("force_kill {}", execution_id));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_is_force_killed_after_the_delay() {
        let sessions = Arc::new(Recorded::default());
        let result = settle(
            sessions.clone(),
            5,
            Duration::from_secs(3),
            Ok(cancelled_result(Vec::new())),
        )
        .await;
        assert!(result.cancelled);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(sessions.calls().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sessions.calls(), vec!["force_kill 5".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_run_releases_at_once_and_kills_later() {
        let sessions = Arc::new(Recorded::default());
        let outcome = contain(async {
            panic!("step exploded");
        })
        .await
        .map(|_: ()| ExecutionResult::default());

        let result = settle(sessions.clone(), 6, Duration::from_secs(3), outcome).await;
        assert!(!result.success);
        assert!(result.error_message.contains("step exploded"));
        // The next case can claim the session before the kill backstop fires
        assert_eq!(sessions.calls(), vec!["release 6".to_string()]);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            sessions.calls(),
            vec!["release 6".to_string(), "force_kill 6".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finished_run_schedules_nothing() {
        let sessions = Arc::new(Recorded::default());
        let ok = ExecutionResult {
            success: true,
            ..Default::default()
        };
        let result = settle(sessions.clone(), 7, Duration::from_secs(1), Ok(ok)).await;
        assert!(result.success);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sessions.calls().is_empty());
    }

    #[tokio::test]
    async fn unreachable_browser_yields_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.browser.executable = Some(dir.path().join("no-chrome").display().to_string());
        let config = Arc::new(config);
        let runner = TestCaseRunner::new(config.clone(), Arc::new(SessionManager::new((*config).clone())));

        let mut execution = Execution::for_case(1);
        execution.id = 9;
        let case: TestCase = serde_json::from_value(serde_json::json!({
            "id": 1, "name": "smoke", "environment_base_url": "https://example.test", "steps": []
        }))
        .unwrap();

        let result = runner.run(&execution, &case, CancellationToken::new()).await;
        assert!(!result.success);
        assert!(!result.cancelled);
        assert!(result.error_message.contains("Failed to start browser session"));
    }
}
