//! Host side of the in-page recorder: script delivery, event harvesting and
//! re-injection after navigations.

use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::browser::Page;
use crate::error::{ReplayError, Result};
use crate::models::{Step, StepKind};

/// Capture script evaluated in the page
pub const RECORDER_SCRIPT: &str = include_str!("recorder.js");

const IS_INJECTED: &str =
    "!!(window.replaybookRecorder && window.replaybookRecorder.isRecording)";
const DRAIN: &str =
    "window.replaybookRecorder ? JSON.stringify(window.replaybookRecorder.drain()) : null";
const COLLECT_ALL: &str =
    "window.replaybookRecorder ? JSON.stringify(window.replaybookRecorder.all()) : null";
const HAS_BODY: &str = "!!document.body";
const RESET_STATE: &str =
    "(function(){ if (window.replaybookRecorder) { window.replaybookRecorder.reset(); } return true; })()";
const TEAR_DOWN: &str = r#"(function(){
  (window.__replaybookListeners || []).forEach(function(l){ try { l.target.removeEventListener(l.type, l.handler, true); } catch (e) {} });
  (window.__replaybookIntervals || []).forEach(function(i){ clearInterval(i); });
  window.__replaybookListeners = [];
  window.__replaybookIntervals = [];
  delete window.replaybookRecorder;
  return true;
})()"#;

/// Substrings of protocol-debug artifacts that leak into captured events
const TOXIC_MARKERS: &[&str] = &[
    "cookiepart",
    "navigationreason",
    "clientnavigationreason",
    "initialframenavigation",
    "framenavigation",
    "clientnavigation",
];
const MAX_EVENT_CHARS: usize = 10_000;
const MAX_KIND_CHARS: usize = 50;

const COORDINATE_KEYS: &[&str] = &[
    "x", "y", "pageX", "pageY", "startX", "startY", "endX", "endY", "deltaX", "deltaY",
    "distance", "scrollX", "scrollY",
];
const OPTION_KEYS: &[&str] = &[
    "button",
    "detail",
    "tagName",
    "elementText",
    "inputType",
    "keyCode",
    "key",
    "ctrlKey",
    "shiftKey",
    "altKey",
    "metaKey",
    "touchCount",
    "duration",
    "direction",
    "moves",
    "type",
    "isWindow",
    "scrollHeight",
    "clientHeight",
    "deltaY",
    "trigger",
    "fromURL",
    "toURL",
    "fallbackSelectors",
    "classHints",
    "buttons",
    "url",
    "from_domain",
    "to_domain",
    "full_url",
];

fn has_toxic_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    TOXIC_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn capped(text: &str, limit: usize) -> String {
    text.chars().filter(|c| !c.is_control()).take(limit).collect()
}

fn finite(value: &Value) -> Option<Value> {
    value
        .as_f64()
        .filter(|n| n.is_finite())
        .map(|_| value.clone())
}

fn clean_option(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) => {
            let s = capped(s, 500);
            (!s.is_empty()).then_some(Value::String(s))
        }
        Value::Bool(_) => Some(value.clone()),
        Value::Number(_) => finite(value),
        Value::Array(items) => {
            let items: Vec<Value> = items
                .iter()
                .take(5)
                .filter_map(|item| match item {
                    Value::String(s) => {
                        let s = capped(s, 100);
                        (!s.is_empty()).then_some(Value::String(s))
                    }
                    Value::Number(_) => finite(item),
                    _ => None,
                })
                .collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        _ => None,
    }
}

/// Turn one raw page event into a step, or drop it.
///
/// Only allow-listed fields survive; strings are length-capped and numbers
/// must be finite. Oversized events and events carrying protocol-debug
/// artifacts are rejected outright.
pub fn sanitize(raw: &Value) -> Option<Step> {
    let serialized = raw.to_string();
    if serialized.len() > MAX_EVENT_CHARS || has_toxic_marker(&serialized) {
        return None;
    }

    let event = raw.as_object()?;
    let kind = event.get("type")?.as_str()?;
    if kind.is_empty() || kind.chars().count() > MAX_KIND_CHARS {
        return None;
    }

    let mut clean = Map::new();
    clean.insert("type".into(), Value::String(kind.to_string()));
    if let Some(selector) = event.get("selector").and_then(Value::as_str) {
        clean.insert("selector".into(), Value::String(capped(selector, 500)));
    }
    if let Some(value) = event.get("value").and_then(Value::as_str) {
        clean.insert("value".into(), Value::String(capped(value, 1000)));
    }
    if let Some(ts) = event
        .get("timestamp")
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite())
    {
        clean.insert("timestamp".into(), Value::from(ts as i64));
    }

    if let Some(coordinates) = event.get("coordinates").and_then(Value::as_object) {
        let kept: Map<String, Value> = COORDINATE_KEYS
            .iter()
            .filter_map(|key| Some((key.to_string(), finite(coordinates.get(*key)?)?)))
            .collect();
        clean.insert("coordinates".into(), Value::Object(kept));
    }

    if let Some(options) = event.get("options").and_then(Value::as_object) {
        let kept: Map<String, Value> = OPTION_KEYS
            .iter()
            .filter_map(|key| Some((key.to_string(), clean_option(options.get(*key)?)?)))
            .collect();
        clean.insert("options".into(), Value::Object(kept));
    }

    let step: Step = match serde_json::from_value(Value::Object(clean)) {
        Ok(step) => step,
        Err(e) => {
            tracing::debug!("Dropping malformed {} event: {}", kind, e);
            return None;
        }
    };
    if step.kind == StepKind::Unknown {
        tracing::debug!("Dropping unknown event type {}", kind);
        return None;
    }
    Some(step)
}

/// Sanitize a batch as returned by the page (a JSON array, or its string form)
pub fn harvest(batch: &Value) -> Vec<Step> {
    let parsed;
    let events = match batch {
        Value::Array(events) => events,
        Value::String(text) => {
            parsed = match serde_json::from_str::<Value>(text) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Recorder returned unparseable events: {}", e);
                    return Vec::new();
                }
            };
            match parsed.as_array() {
                Some(events) => events,
                None => return Vec::new(),
            }
        }
        _ => return Vec::new(),
    };

    let steps: Vec<Step> = events.iter().filter_map(sanitize).collect();
    if steps.len() < events.len() {
        tracing::debug!("Dropped {} of {} events", events.len() - steps.len(), events.len());
    }
    steps
}

/// Why a page interaction with the recorder failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFault {
    /// The recorder object is gone, usually after a reload
    Missing,
    CrossDomain,
    Navigation,
    Other,
}

impl ScriptFault {
    pub fn classify(message: &str) -> Self {
        const MISSING: &[&str] = &[
            "replaybookRecorder",
            "undefined",
            "Cannot read properties",
            "ReferenceError",
        ];
        const CROSS_DOMAIN: &[&str] = &["Cannot access", "cross-origin", "SecurityError"];
        const NAVIGATION: &[&str] = &[
            "target navigated",
            "Execution context was destroyed",
            "Cannot find context",
            "connection closed",
        ];

        if CROSS_DOMAIN.iter().any(|m| message.contains(m)) {
            ScriptFault::CrossDomain
        } else if NAVIGATION.iter().any(|m| message.contains(m)) {
            ScriptFault::Navigation
        } else if MISSING.iter().any(|m| message.contains(m)) {
            ScriptFault::Missing
        } else {
            ScriptFault::Other
        }
    }

    /// Minimum spacing between re-injection attempts for this fault
    pub fn backoff(&self) -> Duration {
        match self {
            ScriptFault::Other => Duration::from_secs(3),
            _ => Duration::from_millis(500),
        }
    }
}

/// Rate limiter for re-injection
#[derive(Default)]
pub struct ReinjectGate {
    last: Mutex<Option<Instant>>,
}

impl ReinjectGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an attempt for `fault`; false while still inside its backoff
    pub fn permit(&self, fault: ScriptFault) -> bool {
        let now = Instant::now();
        let mut last = match self.last.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *last {
            Some(at) if now.duration_since(at) < fault.backoff() => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

fn as_flag(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}

pub async fn is_injected(page: &dyn Page) -> Result<bool> {
    Ok(as_flag(&page.evaluate(IS_INJECTED).await?))
}

/// Evaluate the capture script; true once the recorder is live
pub async fn inject(page: &dyn Page) -> Result<bool> {
    page.evaluate(RECORDER_SCRIPT).await?;
    is_injected(page).await
}

/// Pull events queued since the last drain
pub async fn drain(page: &dyn Page) -> Result<Vec<Step>> {
    let batch = page.evaluate(DRAIN).await?;
    if batch.is_null() {
        return Err(ReplayError::JavaScriptError(
            "replaybookRecorder is undefined".to_string(),
        ));
    }
    Ok(harvest(&batch))
}

/// Every event the current document has captured
pub async fn collect_all(page: &dyn Page) -> Result<Vec<Step>> {
    let batch = page.evaluate(COLLECT_ALL).await?;
    Ok(harvest(&batch))
}

async fn wait_for_body(page: &dyn Page) {
    for _ in 0..20 {
        if matches!(page.evaluate(HAS_BODY).await, Ok(ref v) if as_flag(v)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn is_syntax_error(err: &ReplayError) -> bool {
    matches!(err, ReplayError::JavaScriptError(msg) if msg.contains("SyntaxError"))
}

/// Fast path after a same-document navigation (history API, hash change)
pub async fn reinject_same_document(page: &dyn Page) -> Result<()> {
    tokio::time::sleep(Duration::from_millis(500)).await;

    for attempt in 1..=3 {
        if is_injected(page).await.unwrap_or(false) {
            return Ok(());
        }

        wait_for_body(page).await;
        let _ = page.evaluate(RESET_STATE).await;
        match page.evaluate(RECORDER_SCRIPT).await {
            Ok(_) => {}
            Err(e) if is_syntax_error(&e) => return Err(e),
            Err(e) => tracing::debug!("Same-document inject attempt {} failed: {}", attempt, e),
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        if is_injected(page).await.unwrap_or(false) {
            tracing::info!("Recorder re-injected after same-document navigation");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    Err(ReplayError::RecorderSession(
        "recorder could not be restored after same-document navigation".to_string(),
    ))
}

/// Slow path after a full or cross-domain navigation
pub async fn reinject_cross_domain(page: &dyn Page) -> Result<()> {
    tokio::time::sleep(Duration::from_secs(1)).await;

    for attempt in 1..=5u64 {
        if attempt > 1 {
            tokio::time::sleep(Duration::from_secs(attempt)).await;
        }

        let url = match page.current_url().await {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!("Cross-domain reinject attempt {}: {}", attempt, e);
                continue;
            }
        };
        if page.ready_state().await.unwrap_or_default() != "complete" {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let _ = page.evaluate(TEAR_DOWN).await;
        match page.evaluate(RECORDER_SCRIPT).await {
            Ok(_) => {}
            Err(e) if is_syntax_error(&e) => return Err(e),
            Err(e) => {
                tracing::debug!("Cross-domain inject attempt {} failed: {}", attempt, e);
                continue;
            }
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        if is_injected(page).await.unwrap_or(false) {
            tracing::info!("Recorder re-injected on {}", url);
            return Ok(());
        }
    }

    Err(ReplayError::RecorderSession(
        "recorder could not be restored after navigation".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::page::mock::MockPage;
    use serde_json::json;

    #[test]
    fn sanitize_keeps_allow_listed_fields() {
        let raw = json!({
            "type": "click",
            "selector": "#submit",
            "coordinates": {"x": 10.5, "y": 4, "bogus": 1},
            "timestamp": 1700000000000i64,
            "options": {
                "tagName": "button",
                "fallbackSelectors": ["button[name=\"go\"]", "", 3, {"a": 1}],
                "ctrlKey": true,
                "onclick": "alert(1)"
            }
        });

        let step = sanitize(&raw).unwrap();
        assert_eq!(step.kind, StepKind::Click);
        assert_eq!(step.selector, "#submit");
        assert_eq!(step.coordinates.point(), Some((10.5, 4.0)));
        assert!(step.coordinates.extra.is_empty());
        assert_eq!(step.options.tag_name.as_deref(), Some("button"));
        assert_eq!(step.options.fallback_selectors, vec!["button[name=\"go\"]"]);
        assert!(step.options.ctrl_key);
        assert!(!step.options.extra.contains_key("onclick"));
        assert_eq!(step.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn sanitize_rejects_toxic_and_oversized_events() {
        let toxic = json!({"type": "click", "selector": "#a", "value": "ClientNavigationReason"});
        assert!(sanitize(&toxic).is_none());

        let cookie = json!({"type": "input", "options": {"elementText": "cookiePart=1"}});
        assert!(sanitize(&cookie).is_none());

        let huge = json!({"type": "input", "value": "x".repeat(MAX_EVENT_CHARS)});
        assert!(sanitize(&huge).is_none());

        assert!(sanitize(&json!({"type": "telepathy"})).is_none());
        assert!(sanitize(&json!({"selector": "#a"})).is_none());
    }

    #[test]
    fn sanitize_caps_strings() {
        let raw = json!({"type": "input", "selector": "#q", "value": "a".repeat(2000)});
        let step = sanitize(&raw).unwrap();
        assert_eq!(step.value.len(), 1000);
    }

    #[test]
    fn harvest_accepts_stringified_batches() {
        let batch = Value::String(
            json!([
                {"type": "click", "selector": "#a"},
                {"type": "navigate", "value": "https://example.com/next", "options": {"trigger": "pushState"}},
                {"type": "click", "selector": "#b", "value": "frameNavigation"}
            ])
            .to_string(),
        );
        let steps = harvest(&batch);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].kind, StepKind::Navigate);
        assert!(harvest(&Value::String("not json".into())).is_empty());
    }

    #[test]
    fn faults_are_classified() {
        assert_eq!(
            ScriptFault::classify("TypeError: Cannot read properties of undefined"),
            ScriptFault::Missing
        );
        assert_eq!(
            ScriptFault::classify("SecurityError: Blocked a frame"),
            ScriptFault::CrossDomain
        );
        assert_eq!(
            ScriptFault::classify("Execution context was destroyed"),
            ScriptFault::Navigation
        );
        assert_eq!(ScriptFault::classify("boom"), ScriptFault::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_spaces_attempts_by_fault_class() {
        let gate = ReinjectGate::new();
        assert!(gate.permit(ScriptFault::Missing));
        assert!(!gate.permit(ScriptFault::Missing));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(gate.permit(ScriptFault::Missing));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!gate.permit(ScriptFault::Other));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(gate.permit(ScriptFault::Other));
    }

    #[tokio::test]
    async fn drain_reports_missing_recorder() {
        let page = MockPage::new().on_evaluate("drain()", Value::Null);
        let err = drain(&page).await.unwrap_err();
        assert_eq!(ScriptFault::classify(&err.to_string()), ScriptFault::Missing);
    }

    #[tokio::test]
    async fn drain_returns_sanitized_steps() {
        let batch = json!([{"type": "input", "selector": "#q", "value": "rust"}]).to_string();
        let page = MockPage::new().on_evaluate("drain()", Value::String(batch));
        let steps = drain(&page).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].value, "rust");
    }

    #[tokio::test(start_paused = true)]
    async fn same_document_reinject_retries_until_live() {
        let page = MockPage::new()
            .on_evaluate("!!(window.replaybookRecorder", json!(false))
            .on_evaluate("!!(window.replaybookRecorder", json!(false))
            .on_evaluate("!!(window.replaybookRecorder", json!(true))
            .on_evaluate("!!document.body", json!(true));

        reinject_same_document(&page).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn same_document_reinject_stops_on_syntax_error() {
        let page = MockPage::new()
            .on_evaluate("!!(window.replaybookRecorder", json!(false))
            .on_evaluate("!!document.body", json!(true))
            .on_evaluate_error("addEventListener", "SyntaxError: Unexpected token");

        let err = reinject_same_document(&page).await.unwrap_err();
        assert!(err.to_string().contains("SyntaxError"));
    }

    #[tokio::test(start_paused = true)]
    async fn cross_domain_reinject_gives_up_after_five_attempts() {
        let page = MockPage::new()
            .with_url("https://other.example.com/")
            .on_evaluate("!!(window.replaybookRecorder", json!(false));

        let err = reinject_cross_domain(&page).await.unwrap_err();
        assert!(matches!(err, ReplayError::RecorderSession(_)));
    }
}
