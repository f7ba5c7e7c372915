//! Element readiness, stabilization, and wait-before-step primitives.

use std::time::Duration;

use tokio::time::Instant;

use super::StepContext;
use crate::browser::{ElementState, Page};
use crate::error::{ReplayError, Result};

/// Hard ceiling for one readiness wait
pub const READY_CEILING: Duration = Duration::from_secs(12);
const QUICK_PHASE: Duration = Duration::from_secs(3);
const QUICK_POLL: Duration = Duration::from_millis(250);
const EXISTENCE_PROBE: Duration = Duration::from_secs(2);
const PROGRESSIVE_ATTEMPTS: u32 = 14;
const PROGRESSIVE_POLL: Duration = Duration::from_millis(500);

const STABLE_SAMPLES: u32 = 10;
const STABLE_POLL: Duration = Duration::from_millis(300);

/// Progress is logged this often during a fixed wait
pub const FIXED_PROGRESS_EVERY: Duration = Duration::from_secs(3);

async fn probe(page: &dyn Page, selector: &str) -> ElementState {
    match page.element_state(selector).await {
        Ok(state) => state,
        Err(e) => {
            tracing::debug!("State probe for {} failed: {}", selector, e);
            ElementState::absent()
        }
    }
}

/// Wait until `selector` is visible and interactable.
///
/// Three escalating phases share one 12s ceiling: a short visible+enabled
/// wait, an existence probe that fails fast when the element is not in the
/// DOM at all, then progressive polling.
pub async fn wait_for_element_ready(
    page: &dyn Page,
    ctx: &StepContext,
    selector: &str,
) -> Result<ElementState> {
    let started = Instant::now();
    let ceiling = started + READY_CEILING;

    // Phase 1
    let quick_until = started + QUICK_PHASE;
    loop {
        ctx.check()?;
        let state = probe(page, selector).await;
        if state.visible && state.enabled {
            return Ok(state);
        }
        if Instant::now() >= quick_until {
            break;
        }
        ctx.sleep(QUICK_POLL).await?;
    }

    // Phase 2
    let probe_until = Instant::now() + EXISTENCE_PROBE;
    let mut last = probe(page, selector).await;
    while !last.exists {
        if Instant::now() >= probe_until {
            return Err(ReplayError::ElementNotFound(selector.to_string()));
        }
        ctx.sleep(QUICK_POLL).await?;
        last = probe(page, selector).await;
    }

    // Phase 3
    for attempt in 1..=PROGRESSIVE_ATTEMPTS {
        last = probe(page, selector).await;
        if last.is_ready() {
            tracing::debug!("{} ready after {} progressive attempt(s)", selector, attempt);
            return Ok(last);
        }
        if Instant::now() + PROGRESSIVE_POLL > ceiling {
            break;
        }
        ctx.sleep(PROGRESSIVE_POLL).await?;
    }

    Err(ReplayError::Timeout(format!(
        "element {} not ready after {}s (exists={}, visible={}, enabled={}, clickable={})",
        selector,
        started.elapsed().as_secs(),
        last.exists,
        last.visible,
        last.enabled,
        last.clickable
    )))
}

/// Poll geometry and animation style every 300ms until two consecutive samples match.
/// Returns false when the element never settled; callers proceed anyway.
pub async fn wait_for_stable(page: &dyn Page, ctx: &StepContext, selector: &str) -> Result<bool> {
    let mut previous = None;
    for sample in 0..STABLE_SAMPLES {
        let current = page.element_snapshot(selector).await.ok().flatten();
        if current.is_some() && current == previous {
            tracing::debug!("{} stable after {} sample(s)", selector, sample + 1);
            return Ok(true);
        }
        previous = current;
        ctx.sleep(STABLE_POLL).await?;
    }
    tracing::debug!("{} still moving after {} samples", selector, STABLE_SAMPLES);
    Ok(false)
}

/// Instant readiness check used by the smart wait
pub async fn is_ready_now(page: &dyn Page, selector: &str) -> bool {
    probe(page, selector).await.is_ready()
}

/// Sleep the full duration, reporting progress every few seconds
pub async fn fixed_wait<F>(ctx: &StepContext, total: Duration, mut progress: F) -> Result<()>
where
    F: FnMut(Duration, Duration),
{
    let started = Instant::now();
    let until = started + total;
    loop {
        let now = Instant::now();
        if now >= until {
            return Ok(());
        }
        let chunk = (until - now).min(FIXED_PROGRESS_EVERY);
        ctx.sleep(chunk).await?;
        let elapsed = started.elapsed();
        if elapsed < total {
            progress(elapsed, total);
        }
    }
}
