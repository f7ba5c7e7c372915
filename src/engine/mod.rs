//! Step execution engine.
//!
//! Runs a test case's steps in recorded order against one attached page:
//! wait-before (fixed or smart), dispatch by step kind, screenshot policy,
//! and per-step log entries. The first failing step aborts the sequence.

pub mod actions;
pub mod captcha;
pub mod metrics;
pub mod navigation;
pub mod screenshot;
pub mod selector;
pub mod wait;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::browser::Page;
use crate::config::Config;
use crate::error::{ReplayError, Result};
use crate::models::{LogEntry, LogLevel, Step, StepStatus};

pub use captcha::{CaptchaSolver, SmsCodeSource};
pub use screenshot::{ScreenshotStore, ShotKind};

/// Ceiling for one early attempt made by the smart wait
const EARLY_ATTEMPT_CEILING: Duration = Duration::from_secs(8);
const SMART_POLL: Duration = Duration::from_secs(1);

/// Cancellation and deadline shared by every suspension point of one run
#[derive(Debug, Clone)]
pub struct StepContext {
    cancel: CancellationToken,
    deadline: Instant,
}

impl StepContext {
    pub fn new(cancel: CancellationToken, budget: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + budget,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ReplayError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(ReplayError::Timeout(
                "test case exceeded its time limit".to_string(),
            ));
        }
        Ok(())
    }

    /// Sleep unless cancelled first; never past the deadline
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        let wake = (Instant::now() + duration).min(self.deadline);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReplayError::Cancelled),
            _ = sleep_until(wake) => self.check(),
        }
    }

    /// Run `fut` until it finishes, the run is cancelled, or the deadline passes
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReplayError::Cancelled),
            _ = sleep_until(self.deadline) => Err(ReplayError::Timeout(
                "test case exceeded its time limit".to_string(),
            )),
            result = fut => result,
        }
    }
}

/// Append to a run log and mirror the entry to tracing
pub(crate) fn push_log(logs: &mut Vec<LogEntry>, entry: LogEntry) {
    match entry.level {
        LogLevel::Debug => tracing::debug!("{}", entry.message),
        LogLevel::Info => tracing::info!("{}", entry.message),
        LogLevel::Warn => tracing::warn!("{}", entry.message),
        LogLevel::Error => tracing::error!("{}", entry.message),
    }
    logs.push(entry);
}

pub struct StepEngine {
    page: Arc<dyn Page>,
    ctx: StepContext,
    shots: ScreenshotStore,
    captcha: CaptchaSolver,
    case_name: String,
    step_gap: Duration,
    logs: Vec<LogEntry>,
    screenshots: Vec<String>,
}

impl StepEngine {
    pub fn new(
        page: Arc<dyn Page>,
        ctx: StepContext,
        config: &Config,
        case_name: impl Into<String>,
    ) -> Self {
        Self {
            page,
            ctx,
            shots: ScreenshotStore::new(config.engine.screenshots_dir.clone()),
            captcha: CaptchaSolver::from_config(&config.captcha),
            case_name: case_name.into(),
            step_gap: config.engine.step_gap(),
            logs: Vec::new(),
            screenshots: Vec::new(),
        }
    }

    pub fn with_captcha(mut self, captcha: CaptchaSolver) -> Self {
        self.captcha = captcha;
        self
    }

    pub fn context(&self) -> &StepContext {
        &self.ctx
    }

    pub fn page(&self) -> &Arc<dyn Page> {
        &self.page
    }

    pub fn log(&mut self, entry: LogEntry) {
        push_log(&mut self.logs, entry);
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn screenshots(&self) -> &[String] {
        &self.screenshots
    }

    pub fn into_parts(self) -> (Vec<LogEntry>, Vec<String>) {
        (self.logs, self.screenshots)
    }

    /// Capture and record a screenshot; failures only cost the picture
    pub async fn screenshot(&mut self, kind: ShotKind, index: usize) -> Option<String> {
        let path = self
            .shots
            .capture(&*self.page, &self.case_name, kind, index)
            .await?;
        self.screenshots.push(path.clone());
        Some(path)
    }

    /// Run all steps in order, stopping at the first failure
    pub async fn run_steps(&mut self, steps: &[Step]) -> Result<()> {
        let total = steps.len();
        for (index, step) in steps.iter().enumerate() {
            if step.skip {
                self.log(
                    LogEntry::info(format!("Skipping step {}/{}: {}", index + 1, total, step.kind))
                        .for_step(index, step, StepStatus::Skipped),
                );
                continue;
            }

            let started = Instant::now();
            self.log(
                LogEntry::info(format!(
                    "Executing step {}/{}: {} {}",
                    index + 1,
                    total,
                    step.kind,
                    step.selector
                ))
                .for_step(index, step, StepStatus::Running),
            );

            match self.run_step(index, step).await {
                Ok(()) => {
                    let millis = started.elapsed().as_millis() as u64;
                    let mut entry = LogEntry::info(format!(
                        "Step {} ({}) succeeded",
                        index + 1,
                        step.kind
                    ))
                    .for_step(index, step, StepStatus::Success)
                    .with_duration(millis);
                    if step.kind.captures_screenshot() {
                        if let Some(path) = self.screenshot(ShotKind::Step, index).await {
                            entry = entry.with_screenshot(path);
                        }
                    }
                    self.log(entry);
                    if index + 1 < total {
                        self.ctx.sleep(self.step_gap).await?;
                    }
                }
                Err(ReplayError::Cancelled) => {
                    self.log(
                        LogEntry::warn(format!("Cancelled during step {}", index + 1))
                            .for_step(index, step, StepStatus::Failed),
                    );
                    return Err(ReplayError::Cancelled);
                }
                Err(e) => {
                    if matches!(
                        e,
                        ReplayError::ElementNotFound(_)
                            | ReplayError::SelectorExhausted { .. }
                            | ReplayError::Timeout(_)
                    ) && !step.selector.is_empty()
                    {
                        let entries = diagnose(&*self.page, &step.selector).await;
                        for entry in entries {
                            self.log(entry);
                        }
                    }

                    let mut entry = LogEntry::error(format!(
                        "Step {} ({}) failed: {}",
                        index + 1,
                        step.kind,
                        e
                    ))
                    .for_step(index, step, StepStatus::Failed)
                    .with_duration(started.elapsed().as_millis() as u64)
                    .with_error(e.to_string());
                    if let Some(path) = self.screenshot(ShotKind::Error, index).await {
                        entry = entry.with_screenshot(path);
                    }
                    self.log(entry);

                    return Err(ReplayError::StepFailed(format!(
                        "step {} ({}) failed: {}",
                        index + 1,
                        step.kind,
                        e
                    )));
                }
            }
        }
        Ok(())
    }

    async fn run_step(&mut self, index: usize, step: &Step) -> Result<()> {
        if self.wait_before(index, step).await? {
            return Ok(());
        }
        self.execute(step).await
    }

    /// Returns true when the smart wait already executed the step
    async fn wait_before(&mut self, index: usize, step: &Step) -> Result<bool> {
        if step.wait_before == 0 {
            return Ok(false);
        }
        let total = Duration::from_secs(step.wait_before);

        match step.wait_mode {
            crate::models::WaitMode::Fixed => {
                self.log(
                    LogEntry::info(format!(
                        "Waiting {}s before step {} (fixed)",
                        step.wait_before,
                        index + 1
                    ))
                    .for_step(index, step, StepStatus::Running),
                );
                self.fixed_wait(total).await?;
                Ok(false)
            }
            crate::models::WaitMode::Smart => self.smart_wait(index, step, total).await,
        }
    }

    async fn fixed_wait(&mut self, total: Duration) -> Result<()> {
        let logs = &mut self.logs;
        wait::fixed_wait(&self.ctx, total, |elapsed, total| {
            push_log(
                logs,
                LogEntry::debug(format!(
                    "Waited {}s of {}s",
                    elapsed.as_secs(),
                    total.as_secs()
                )),
            );
        })
        .await
    }

    /// Poll every second; attempt the step as soon as its target is ready.
    /// When the ceiling passes the step falls through to normal execution.
    async fn smart_wait(&mut self, index: usize, step: &Step, total: Duration) -> Result<bool> {
        let selector = step.selector.trim();
        if !step.kind.supports_early_attempt() || selector.is_empty() {
            self.fixed_wait(total).await?;
            return Ok(false);
        }

        self.log(
            LogEntry::info(format!(
                "Smart wait up to {}s for {}",
                step.wait_before, selector
            ))
            .for_step(index, step, StepStatus::Running),
        );

        let started = Instant::now();
        let until = started + total;
        let mut attempts = 0u32;

        loop {
            self.ctx.check()?;
            if wait::is_ready_now(&*self.page, selector).await {
                attempts += 1;
                match tokio::time::timeout(EARLY_ATTEMPT_CEILING, self.execute(step)).await {
                    Ok(Ok(())) => {
                        self.log(LogEntry::info(format!(
                            "Step {} executed early after {:.1}s (attempt {})",
                            index + 1,
                            started.elapsed().as_secs_f64(),
                            attempts
                        )));
                        return Ok(true);
                    }
                    Ok(Err(ReplayError::Cancelled)) => return Err(ReplayError::Cancelled),
                    Ok(Err(e)) => self.log(LogEntry::debug(format!(
                        "Early attempt {} failed: {}",
                        attempts, e
                    ))),
                    Err(_) => self.log(LogEntry::debug(format!(
                        "Early attempt {} exceeded {}s",
                        attempts,
                        EARLY_ATTEMPT_CEILING.as_secs()
                    ))),
                }
            }

            let now = Instant::now();
            if now >= until {
                break;
            }
            self.ctx.sleep(SMART_POLL.min(until - now)).await?;
        }

        self.log(LogEntry::info(format!(
            "Smart wait for step {} reached {}s, executing normally",
            index + 1,
            step.wait_before
        )));
        Ok(false)
    }

    async fn execute(&mut self, step: &Step) -> Result<()> {
        let page = self.page.clone();

        if step.is_captcha && step.captcha.captcha_type.is_some() {
            return self
                .captcha
                .solve(&*page, &self.ctx, step, &mut self.logs)
                .await;
        }

        if navigation::handles(step.kind) {
            navigation::perform(&*page, &self.ctx, step, &mut self.logs).await
        } else {
            actions::perform(&*page, &self.ctx, step, &mut self.logs).await
        }
    }
}

const DIAGNOSE_JS: &str = r#"(function(fragments) {
    const describe = el => {
        let s = el.tagName.toLowerCase();
        if (el.id) s += '#' + el.id;
        if (typeof el.className === 'string' && el.className.trim()) {
            s += '.' + el.className.trim().split(/\s+/).slice(0, 3).join('.');
        }
        const text = (el.textContent || '').trim().slice(0, 30);
        return text ? s + ' "' + text + '"' : s;
    };
    const similar = [];
    for (const f of fragments) {
        try {
            document.querySelectorAll('[class*="' + f + '"]').forEach((el, i) => {
                if (i < 5) similar.push(describe(el));
            });
        } catch (e) {}
    }
    const sample = Array.from(document.querySelectorAll(
        'a, button, input, select, textarea, [onclick], [role="button"]'
    )).slice(0, 20).map(describe);
    return { similar: similar.slice(0, 20), sample };
})"#;

/// Similar-element search and a DOM sample for a selector that did not resolve
async fn diagnose(page: &dyn Page, selector: &str) -> Vec<LogEntry> {
    let fragments = selector::class_fragments(selector);
    let Ok(arg) = serde_json::to_string(&fragments) else {
        return Vec::new();
    };
    let value = match page.evaluate(&format!("{}({})", DIAGNOSE_JS, arg)).await {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("Diagnostics unavailable: {}", e);
            return Vec::new();
        }
    };

    let list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut entries = Vec::new();
    let similar = list("similar");
    if !similar.is_empty() {
        entries.push(LogEntry::debug(format!(
            "Elements similar to {}: {}",
            selector,
            similar.join(" | ")
        )));
    }
    let sample = list("sample");
    if !sample.is_empty() {
        entries.push(LogEntry::debug(format!(
            "Interactive elements on page: {}",
            sample.join(" | ")
        )));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::page::mock::MockPage;
    use crate::models::{StepKind, WaitMode};

    fn engine(page: Arc<MockPage>, dir: &std::path::Path) -> StepEngine {
        let mut config = Config::default();
        config.engine.screenshots_dir = dir.to_path_buf();
        StepEngine::new(
            page,
            StepContext::new(CancellationToken::new(), Duration::from_secs(600)),
            &config,
            "case",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn failure_aborts_remaining_steps_with_one_error_shot() {
        let dir = tempfile::tempdir().unwrap();
        let page = Arc::new(MockPage::new().with_ready("#a").with_ready("#c"));
        let mut engine = engine(page.clone(), dir.path());

        let steps = vec![
            Step::new(StepKind::Click, "#a"),
            Step::new(StepKind::Click, "#missing"),
            Step::new(StepKind::Click, "#c"),
        ];
        let err = engine.run_steps(&steps).await.unwrap_err();

        assert!(matches!(err, ReplayError::StepFailed(_)));
        assert!(!page.calls().contains(&"click #c".to_string()));
        let errors: Vec<_> = engine
            .screenshots()
            .iter()
            .filter(|s| s.contains("_error_"))
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("_error_1_"));
    }

    #[tokio::test(start_paused = true)]
    async fn click_submit_change_capture_step_shots() {
        let dir = tempfile::tempdir().unwrap();
        let page = Arc::new(MockPage::new().with_ready("#a").with_ready("#in"));
        let mut engine = engine(page.clone(), dir.path());

        let steps = vec![
            Step::new(StepKind::Click, "#a"),
            Step::new(StepKind::Input, "#in").with_value("hello"),
        ];
        engine.run_steps(&steps).await.unwrap();

        assert_eq!(engine.screenshots().len(), 1);
        assert!(engine.screenshots()[0].contains("_step_0_"));
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_steps_are_logged_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let page = Arc::new(MockPage::new());
        let mut engine = engine(page.clone(), dir.path());

        let mut step = Step::new(StepKind::Click, "#nowhere");
        step.skip = true;
        engine.run_steps(&[step]).await.unwrap();

        assert_eq!(page.count("click"), 0);
        assert_eq!(engine.logs()[0].step_status, Some(StepStatus::Skipped));
    }

    #[tokio::test(start_paused = true)]
    async fn smart_wait_exits_early_when_target_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        let page = Arc::new(MockPage::new().ready_after("#late", Duration::from_secs(1)));
        let mut engine = engine(page.clone(), dir.path());

        let started = Instant::now();
        let step = Step::new(StepKind::Click, "#late").with_wait(5, WaitMode::Smart);
        engine.run_steps(&[step]).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(page.count("click"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_wait_never_attempts_early() {
        let dir = tempfile::tempdir().unwrap();
        let page = Arc::new(
            MockPage::new().ready_after("#soon", Duration::from_millis(500)),
        );
        let mut engine = engine(page.clone(), dir.path());

        let started = Instant::now();
        let step = Step::new(StepKind::Click, "#soon").with_wait(3, WaitMode::Fixed);
        engine.run_steps(&[step]).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(page.count("click"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn smart_wait_falls_through_to_normal_execution() {
        let dir = tempfile::tempdir().unwrap();
        // Ready only after the smart ceiling; normal execution still finds it
        let page = Arc::new(MockPage::new().ready_after("#slow", Duration::from_secs(3)));
        let mut engine = engine(page.clone(), dir.path());

        let step = Step::new(StepKind::Click, "#slow").with_wait(2, WaitMode::Smart);
        engine.run_steps(&[step]).await.unwrap();
        assert_eq!(page.count("click"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_step_kind_fails_the_case() {
        let dir = tempfile::tempdir().unwrap();
        let page = Arc::new(MockPage::new());
        let mut engine = engine(page, dir.path());

        let err = engine
            .run_steps(&[Step::new(StepKind::Unknown, "")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported step type"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_context_stops_sleeping() {
        let token = CancellationToken::new();
        let ctx = StepContext::new(token.clone(), Duration::from_secs(600));
        token.cancel();
        assert!(matches!(
            ctx.sleep(Duration::from_secs(5)).await,
            Err(ReplayError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_guarded_futures() {
        let ctx = StepContext::new(CancellationToken::new(), Duration::from_secs(1));
        let result: Result<()> = ctx
            .guard(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ReplayError::Timeout(_))));
    }
}
