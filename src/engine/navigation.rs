//! Navigation steps and the retry schedule of each navigation flavour.

use std::time::Duration;

use reqwest::Url;

use super::{push_log, StepContext};
use crate::browser::{stabilize, Page};
use crate::error::{ReplayError, Result};
use crate::models::{LogEntry, Step, StepKind};

/// Retry schedule for one navigation flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_timeout: Duration,
    pub timeout_step: Duration,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub const SAME_SITE: RetryPolicy = RetryPolicy {
        attempts: 3,
        base_timeout: Duration::from_secs(10),
        timeout_step: Duration::from_secs(5),
        backoff_step: Duration::from_secs(2),
    };

    pub const CROSS_DOMAIN: RetryPolicy = RetryPolicy {
        attempts: 5,
        base_timeout: Duration::from_secs(15),
        timeout_step: Duration::from_secs(10),
        backoff_step: Duration::from_secs(3),
    };

    /// Timeout of the zero-based `attempt`
    pub fn timeout(&self, attempt: u32) -> Duration {
        self.base_timeout + self.timeout_step * attempt
    }

    /// Pause after the failed zero-based `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * (attempt + 1)
    }
}

const BACK_SETTLE: Duration = Duration::from_secs(2);
const UNLOAD_SETTLE: Duration = Duration::from_millis(200);
const POPSTATE_SETTLE: Duration = Duration::from_secs(1);
const HASH_SETTLE: Duration = Duration::from_millis(500);

pub fn handles(kind: StepKind) -> bool {
    matches!(
        kind,
        StepKind::Navigate
            | StepKind::CrossDomainNavigation
            | StepKind::Back
            | StepKind::BeforeUnload
            | StepKind::PopState
            | StepKind::HashChange
    )
}

pub async fn perform(
    page: &dyn Page,
    ctx: &StepContext,
    step: &Step,
    logs: &mut Vec<LogEntry>,
) -> Result<()> {
    match step.kind {
        StepKind::Navigate => {
            let url = resolve_target(page, step).await?;
            navigate_with_retry(page, ctx, &url, RetryPolicy::SAME_SITE, logs).await
        }
        StepKind::CrossDomainNavigation => {
            let url = resolve_target(page, step).await?;
            navigate_with_retry(page, ctx, &url, RetryPolicy::CROSS_DOMAIN, logs).await?;
            check_domain(page, step, logs).await;
            Ok(())
        }
        StepKind::Back => {
            if !ctx.guard(page.history_back()).await? {
                push_log(logs, LogEntry::warn("No history entry to go back to"));
            }
            ctx.sleep(BACK_SETTLE).await
        }
        StepKind::BeforeUnload => ctx.sleep(UNLOAD_SETTLE).await,
        StepKind::PopState => ctx.sleep(POPSTATE_SETTLE).await,
        StepKind::HashChange => {
            if let Some(hash) = hash_of(step) {
                let hash_json = serde_json::to_string(&hash)?;
                ctx.guard(page.evaluate(&format!("window.location.hash = {}", hash_json)))
                    .await?;
            }
            ctx.sleep(HASH_SETTLE).await
        }
        other => Err(ReplayError::UnsupportedStep(other.to_string())),
    }
}

/// Destination of a navigation step: the value, else the recorder's options
fn raw_target(step: &Step) -> Option<String> {
    let from_options = |key: &str| {
        step.options
            .extra
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let value = step.value.trim();
    let candidates = if step.kind == StepKind::CrossDomainNavigation {
        vec![from_options("full_url"), Some(value.to_string()), from_options("toURL")]
    } else {
        vec![Some(value.to_string()), from_options("toURL"), from_options("full_url")]
    };
    candidates.into_iter().flatten().find(|s| !s.trim().is_empty())
}

/// Absolute URL, resolving relative targets against the current page
async fn resolve_target(page: &dyn Page, step: &Step) -> Result<String> {
    let raw = raw_target(step)
        .ok_or_else(|| ReplayError::StepFailed(format!("{} step has no URL", step.kind)))?;
    if Url::parse(&raw).is_ok() {
        return Ok(raw);
    }
    let current = page.current_url().await?;
    Url::parse(&current)
        .and_then(|base| base.join(&raw))
        .map(|u| u.to_string())
        .map_err(|e| ReplayError::NavigationFailed(format!("invalid URL {}: {}", raw, e)))
}

async fn navigate_with_retry(
    page: &dyn Page,
    ctx: &StepContext,
    url: &str,
    policy: RetryPolicy,
    logs: &mut Vec<LogEntry>,
) -> Result<()> {
    let mut last_error = String::new();

    for attempt in 0..policy.attempts {
        let timeout = policy.timeout(attempt);
        push_log(
            logs,
            LogEntry::info(format!(
                "Navigating to {} (attempt {}/{}, timeout {}s)",
                url,
                attempt + 1,
                policy.attempts,
                timeout.as_secs()
            )),
        );

        let outcome = ctx
            .guard(async {
                tokio::time::timeout(timeout, async {
                    page.navigate(url).await?;
                    stabilize(page).await;
                    Ok::<(), ReplayError>(())
                })
                .await
                .unwrap_or_else(|_| {
                    Err(ReplayError::Timeout(format!(
                        "navigation exceeded {}s",
                        timeout.as_secs()
                    )))
                })
            })
            .await;

        match outcome {
            Ok(()) => return Ok(()),
            Err(ReplayError::Cancelled) => return Err(ReplayError::Cancelled),
            Err(e) => {
                last_error = e.to_string();
                push_log(
                    logs,
                    LogEntry::warn(format!("Navigation attempt {} failed: {}", attempt + 1, e)),
                );
                if attempt + 1 < policy.attempts {
                    ctx.sleep(policy.backoff(attempt)).await?;
                }
            }
        }
    }

    Err(ReplayError::NavigationFailed(format!(
        "{} after {} attempts: {}",
        url, policy.attempts, last_error
    )))
}

/// Mismatches are worth a warning only; redirects are common
async fn check_domain(page: &dyn Page, step: &Step, logs: &mut Vec<LogEntry>) {
    let Some(expected) = step.options.to_domain.as_deref().filter(|d| !d.is_empty()) else {
        return;
    };
    let current = page.current_url().await.unwrap_or_default();
    let host = Url::parse(&current)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    if host != expected {
        push_log(
            logs,
            LogEntry::warn(format!(
                "Expected domain {} after navigation, landed on {}",
                expected,
                if host.is_empty() { current.as_str() } else { host.as_str() }
            )),
        );
    }
}

fn hash_of(step: &Step) -> Option<String> {
    let source = raw_target(step)?;
    let hash = source.split_once('#').map(|(_, h)| h).unwrap_or(&source);
    (!hash.is_empty()).then(|| hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::page::mock::MockPage;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> StepContext {
        StepContext::new(CancellationToken::new(), Duration::from_secs(600))
    }

    #[test]
    fn timeouts_grow_per_attempt() {
        let p = RetryPolicy::SAME_SITE;
        assert_eq!(p.timeout(0), Duration::from_secs(10));
        assert_eq!(p.timeout(2), Duration::from_secs(20));
        assert_eq!(p.backoff(1), Duration::from_secs(4));

        let c = RetryPolicy::CROSS_DOMAIN;
        assert_eq!(c.attempts, 5);
        assert_eq!(c.timeout(1), Duration::from_secs(25));
        assert_eq!(c.backoff(0), Duration::from_secs(3));
    }

    #[test]
    fn target_prefers_value_then_recorder_options() {
        let mut step = Step::new(StepKind::Navigate, "");
        step.options
            .extra
            .insert("toURL".into(), serde_json::json!("https://a.test/b"));
        assert_eq!(raw_target(&step).as_deref(), Some("https://a.test/b"));

        step.value = "https://a.test/c".into();
        assert_eq!(raw_target(&step).as_deref(), Some("https://a.test/c"));
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_retries_then_succeeds() {
        let page = MockPage::new();
        page.state.lock().unwrap().navigation_failures = 2;
        let step = Step::new(StepKind::Navigate, "").with_value("https://shop.test/cart");
        let mut logs = Vec::new();

        let started = Instant::now();
        perform(&page, &ctx(), &step, &mut logs).await.unwrap();

        assert_eq!(page.count("navigate"), 3);
        // 2s + 4s of backoff before the third attempt
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert_eq!(page.current_url().await.unwrap(), "https://shop.test/cart");
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_gives_up_after_policy_attempts() {
        let page = MockPage::new();
        page.state.lock().unwrap().navigation_failures = 10;
        let step = Step::new(StepKind::Navigate, "").with_value("https://shop.test/");
        let mut logs = Vec::new();

        let err = perform(&page, &ctx(), &step, &mut logs).await.unwrap_err();
        assert!(matches!(err, ReplayError::NavigationFailed(_)));
        assert_eq!(page.count("navigate"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn relative_target_is_joined_to_current_page() {
        let page = MockPage::new().with_url("https://shop.test/list/");
        let step = Step::new(StepKind::Navigate, "").with_value("item/7");
        let mut logs = Vec::new();

        perform(&page, &ctx(), &step, &mut logs).await.unwrap();
        assert_eq!(page.current_url().await.unwrap(), "https://shop.test/list/item/7");
    }

    #[tokio::test(start_paused = true)]
    async fn domain_mismatch_only_warns() {
        let page = MockPage::new();
        let mut step =
            Step::new(StepKind::CrossDomainNavigation, "").with_value("https://pay.test/checkout");
        step.options.to_domain = Some("bank.test".into());
        let mut logs = Vec::new();

        perform(&page, &ctx(), &step, &mut logs).await.unwrap();
        assert!(logs
            .iter()
            .any(|l| l.message.contains("Expected domain bank.test")));
    }

    #[tokio::test(start_paused = true)]
    async fn back_goes_through_history() {
        let page = MockPage::new();
        let mut logs = Vec::new();
        perform(&page, &ctx(), &Step::new(StepKind::Back, ""), &mut logs)
            .await
            .unwrap();
        assert_eq!(page.count("back"), 1);
    }
}
