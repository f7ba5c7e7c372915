//! Interaction steps: click, input, keys, scrolling, gestures, submit.

use std::time::Duration;

use super::selector::{self, Candidate};
use super::{push_log, wait, StepContext};
use crate::browser::Page;
use crate::error::{ReplayError, Result};
use crate::models::{LogEntry, Step, StepKind};

const CLICK_ATTEMPTS: u32 = 3;
const CLICK_BACKOFF: Duration = Duration::from_millis(500);
/// Pause between a settled element and the click
const PRE_CLICK_SETTLE: Duration = Duration::from_millis(800);
/// Roots that mean "scroll the window"
const WINDOW_SCROLLERS: &[&str] = &["", "body", "html", "window", "document"];

pub async fn perform(
    page: &dyn Page,
    ctx: &StepContext,
    step: &Step,
    logs: &mut Vec<LogEntry>,
) -> Result<()> {
    match step.kind {
        StepKind::Click => click(page, ctx, step, logs).await,
        StepKind::Input | StepKind::Change => fill(page, ctx, step, logs).await,
        StepKind::Keydown => key(page, ctx, step).await,
        StepKind::Scroll => scroll(page, ctx, step, logs).await,
        StepKind::Swipe | StepKind::MouseDrag => swipe(page, ctx, step, logs).await,
        StepKind::TouchStart | StepKind::TouchMove | StepKind::TouchEnd => {
            touch(page, ctx, step).await
        }
        StepKind::Submit => submit(page, ctx, step).await,
        other => Err(ReplayError::UnsupportedStep(other.to_string())),
    }
}

/// Try each candidate in order. A candidate is taken once the DOM confirms it
/// exists; a taken candidate gets up to three clicks before the next one is tried.
async fn click(
    page: &dyn Page,
    ctx: &StepContext,
    step: &Step,
    logs: &mut Vec<LogEntry>,
) -> Result<()> {
    let candidates = selector::candidates(step);
    if candidates.is_empty() {
        return Err(ReplayError::StepFailed("click step has no selector".to_string()));
    }
    let modifiers = step.options.modifiers();

    for (position, candidate) in candidates.iter().enumerate() {
        ctx.check()?;
        let clicked = match candidate {
            Candidate::Css(css) => click_css(page, ctx, css, modifiers).await,
            Candidate::Text { text, tag } => {
                ctx.guard(page.click_by_text(text, tag.as_deref())).await
            }
        };

        match clicked {
            Ok(true) => {
                if position > 0 {
                    push_log(
                        logs,
                        LogEntry::warn(format!(
                            "Clicked fallback selector {} (candidate {} of {})",
                            candidate,
                            position + 1,
                            candidates.len()
                        )),
                    );
                }
                return Ok(());
            }
            Ok(false) => {
                tracing::debug!("Candidate {} not present", candidate);
            }
            Err(ReplayError::Cancelled) => return Err(ReplayError::Cancelled),
            Err(e) => push_log(
                logs,
                LogEntry::debug(format!("Candidate {} failed: {}", candidate, e)),
            ),
        }
    }

    Err(ReplayError::SelectorExhausted {
        tried: candidates.len(),
    })
}

/// Ok(false) when the selector matches nothing
async fn click_css(page: &dyn Page, ctx: &StepContext, css: &str, modifiers: i64) -> Result<bool> {
    let state = ctx.guard(page.element_state(css)).await?;
    if !state.exists {
        return Ok(false);
    }

    wait::wait_for_element_ready(page, ctx, css).await?;
    wait::wait_for_stable(page, ctx, css).await?;
    ctx.sleep(PRE_CLICK_SETTLE).await?;

    let mut last_error = None;
    for attempt in 1..=CLICK_ATTEMPTS {
        match ctx.guard(page.click(css, modifiers)).await {
            Ok(()) => return Ok(true),
            Err(ReplayError::Cancelled) => return Err(ReplayError::Cancelled),
            Err(e) => {
                tracing::debug!("Click attempt {} on {} failed: {}", attempt, css, e);
                last_error = Some(e);
                if attempt < CLICK_ATTEMPTS {
                    ctx.sleep(CLICK_BACKOFF * attempt).await?;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| ReplayError::ElementNotFound(css.to_string())))
}

/// First CSS candidate that exists, after a readiness wait on it
async fn resolve_field(page: &dyn Page, ctx: &StepContext, step: &Step) -> Result<String> {
    let candidates = selector::candidates(step);
    for candidate in candidates.iter().filter_map(Candidate::as_css) {
        if ctx.guard(page.element_state(candidate)).await?.exists {
            wait::wait_for_element_ready(page, ctx, candidate).await?;
            return Ok(candidate.to_string());
        }
    }
    // Nothing exists yet; let the readiness wait on the primary decide
    let primary = step.selector.trim();
    wait::wait_for_element_ready(page, ctx, primary).await?;
    Ok(primary.to_string())
}

/// Three tiers: keyboard fill, script focus+clear then keyboard fill, script assignment
async fn fill(
    page: &dyn Page,
    ctx: &StepContext,
    step: &Step,
    logs: &mut Vec<LogEntry>,
) -> Result<()> {
    if step.selector.trim().is_empty() {
        return Err(ReplayError::StepFailed(format!("{} step has no selector", step.kind)));
    }
    let field = resolve_field(page, ctx, step).await?;
    let value = step.value.as_str();

    match ctx.guard(page.clear_and_type(&field, value)).await {
        Ok(()) => return Ok(()),
        Err(ReplayError::Cancelled) => return Err(ReplayError::Cancelled),
        Err(e) => push_log(
            logs,
            LogEntry::debug(format!("Native fill of {} failed: {}", field, e)),
        ),
    }

    match ctx.guard(page.focus_clear_and_type(&field, value)).await {
        Ok(()) => return Ok(()),
        Err(ReplayError::Cancelled) => return Err(ReplayError::Cancelled),
        Err(e) => push_log(
            logs,
            LogEntry::debug(format!("Focused fill of {} failed: {}", field, e)),
        ),
    }

    match ctx.guard(page.set_value_script(&field, value)).await {
        Ok(()) => {
            push_log(
                logs,
                LogEntry::warn(format!("Value of {} set through script", field)),
            );
            Ok(())
        }
        Err(ReplayError::Cancelled) => Err(ReplayError::Cancelled),
        Err(e) => Err(ReplayError::StepFailed(format!(
            "all input strategies failed for {}: {}",
            field, e
        ))),
    }
}

async fn key(page: &dyn Page, ctx: &StepContext, step: &Step) -> Result<()> {
    let key = step
        .options
        .extra
        .get("key")
        .and_then(|v| v.as_str())
        .unwrap_or(step.value.as_str());
    if key.is_empty() {
        return Err(ReplayError::StepFailed("keydown step has no key".to_string()));
    }
    ctx.guard(page.press_key(step.selector.trim(), key, step.options.modifiers()))
        .await
}

fn scrolls_window(step: &Step) -> bool {
    step.options.is_window.unwrap_or(false)
        || WINDOW_SCROLLERS.contains(&step.selector.trim().to_lowercase().as_str())
}

async fn scroll(
    page: &dyn Page,
    ctx: &StepContext,
    step: &Step,
    logs: &mut Vec<LogEntry>,
) -> Result<()> {
    let c = &step.coordinates;
    let x = c.scroll_x.or(c.x).unwrap_or(0.0);
    let y = c.scroll_y.or(c.y).unwrap_or(0.0);

    if scrolls_window(step) {
        return ctx.guard(page.scroll_to(None, x, y)).await;
    }

    match ctx.guard(page.scroll_to(Some(step.selector.trim()), x, y)).await {
        Ok(()) => Ok(()),
        Err(ReplayError::Cancelled) => Err(ReplayError::Cancelled),
        Err(e) => {
            push_log(
                logs,
                LogEntry::warn(format!(
                    "Scrolling {} failed ({}), scrolling the window instead",
                    step.selector, e
                )),
            );
            ctx.guard(page.scroll_to(None, x, y)).await
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeDirection {
    Left,
    Right,
    Up,
    Down,
}

/// Horizontal when |dx| > |dy|; the sign picks the side
pub fn swipe_direction(from: (f64, f64), to: (f64, f64)) -> SwipeDirection {
    let dx = to.0 - from.0;
    let dy = to.1 - from.1;
    if dx.abs() > dy.abs() {
        if dx < 0.0 {
            SwipeDirection::Left
        } else {
            SwipeDirection::Right
        }
    } else if dy < 0.0 {
        SwipeDirection::Up
    } else {
        SwipeDirection::Down
    }
}

async fn swipe(
    page: &dyn Page,
    ctx: &StepContext,
    step: &Step,
    logs: &mut Vec<LogEntry>,
) -> Result<()> {
    if let Some((from, to)) = step.coordinates.swipe_span() {
        let direction = swipe_direction(from, to);
        let distance = ((to.0 - from.0).powi(2) + (to.1 - from.1).powi(2)).sqrt();
        push_log(
            logs,
            LogEntry::debug(format!("Swipe {:?} over {:.0}px", direction, distance)),
        );
        return ctx.guard(page.swipe(from, to)).await;
    }

    // Wheel-derived swipes may only carry a vertical delta
    let delta_y = step
        .coordinates
        .extra
        .get("deltaY")
        .and_then(|v| v.as_f64())
        .or(step.coordinates.distance);
    match delta_y {
        Some(dy) => ctx.guard(page.scroll_by(0.0, dy)).await,
        None => Err(ReplayError::StepFailed(format!(
            "{} step has no coordinates",
            step.kind
        ))),
    }
}

/// Raw touch points are replayed as pointer moves; whole gestures arrive as swipes
async fn touch(page: &dyn Page, ctx: &StepContext, step: &Step) -> Result<()> {
    match step.coordinates.point() {
        Some((x, y)) if step.kind == StepKind::TouchStart => {
            ctx.guard(page.mouse_move(x, y)).await
        }
        _ => {
            tracing::debug!("{} acknowledged", step.kind);
            Ok(())
        }
    }
}

async fn submit(page: &dyn Page, ctx: &StepContext, step: &Step) -> Result<()> {
    let selector = step.selector.trim();
    let target = if selector.is_empty() { "form" } else { selector };
    wait::wait_for_element_ready(page, ctx, target).await?;
    ctx.guard(page.submit(target)).await
}
