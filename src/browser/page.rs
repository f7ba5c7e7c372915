use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};

use tokio::sync::broadcast;

use super::cdp::{CdpConnection, CdpEvent};
use crate::error::{ReplayError, Result};
use crate::models::DeviceProfile;

const COMMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait until `frame_id` reports a `Page.frameNavigated` for the new document.
///
/// Until that event the old document still answers `readyState`, so readiness
/// checks made earlier would see the page being left.
pub async fn wait_for_commit(
    events: &mut broadcast::Receiver<CdpEvent>,
    frame_id: &str,
    loader_id: &str,
    timeout: Duration,
) -> bool {
    let committed = async {
        loop {
            match events.recv().await {
                Ok(event) if event.method == "Page.frameNavigated" => {
                    let frame = &event.params["frame"];
                    if frame["id"] == frame_id && frame["loaderId"] == loader_id {
                        return true;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} protocol events waiting for commit", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(timeout, committed).await.unwrap_or(false)
}

/// Readiness of one element as seen by the live DOM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ElementState {
    pub exists: bool,
    pub visible: bool,
    pub enabled: bool,
    pub clickable: bool,
}

impl ElementState {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn ready() -> Self {
        Self {
            exists: true,
            visible: true,
            enabled: true,
            clickable: true,
        }
    }

    /// Visible and interactable
    pub fn is_ready(&self) -> bool {
        self.exists && self.visible && self.clickable
    }
}

/// Geometry and animation-relevant style of an element at one instant.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSnapshot {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub opacity: String,
    pub display: String,
    pub visibility: String,
    pub transform: String,
    pub animation_name: String,
    pub transition_property: String,
}

/// DOM-level operations the step engine drives a page through.
#[async_trait]
pub trait Page: Send + Sync {
    async fn evaluate(&self, expression: &str) -> Result<Value>;

    async fn current_url(&self) -> Result<String>;

    async fn navigate(&self, url: &str) -> Result<()>;

    async fn ready_state(&self) -> Result<String>;

    async fn element_state(&self, selector: &str) -> Result<ElementState>;

    async fn element_snapshot(&self, selector: &str) -> Result<Option<ElementSnapshot>>;

    async fn click(&self, selector: &str, modifiers: i64) -> Result<()>;

    /// Click the element whose own text matches `text`. Returns false when nothing matched.
    async fn click_by_text(&self, text: &str, tag: Option<&str>) -> Result<bool>;

    /// Click to focus, select-all + delete through the keyboard, then type.
    async fn clear_and_type(&self, selector: &str, text: &str) -> Result<()>;

    /// Focus and clear through script, then type.
    async fn focus_clear_and_type(&self, selector: &str, text: &str) -> Result<()>;

    /// Assign the value through script and fire `input` and `change`.
    async fn set_value_script(&self, selector: &str, value: &str) -> Result<()>;

    async fn press_key(&self, selector: &str, key: &str, modifiers: i64) -> Result<()>;

    /// Scroll the window (`selector == None`) or an element to an absolute offset
    async fn scroll_to(&self, selector: Option<&str>, x: f64, y: f64) -> Result<()>;

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()>;

    async fn swipe(&self, from: (f64, f64), to: (f64, f64)) -> Result<()>;

    async fn mouse_move(&self, x: f64, y: f64) -> Result<()>;

    async fn submit(&self, selector: &str) -> Result<()>;

    /// Returns false when there is no earlier history entry.
    async fn history_back(&self) -> Result<bool>;

    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>>;

    async fn emulate(&self, device: &DeviceProfile) -> Result<()>;
}

/// `Page` over a live CDP connection.
pub struct CdpPage {
    conn: Arc<CdpConnection>,
}

impl CdpPage {
    pub fn new(conn: Arc<CdpConnection>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<CdpConnection> {
        &self.conn
    }

    async fn mouse(&self, kind: &str, x: f64, y: f64, modifiers: i64) -> Result<()> {
        let mut params = json!({ "type": kind, "x": x, "y": y, "modifiers": modifiers });
        if kind != "mouseMoved" {
            params["button"] = json!("left");
            params["clickCount"] = json!(1);
        }
        self.conn.call("Input.dispatchMouseEvent", params).await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        for c in text.chars() {
            let ch = c.to_string();
            self.conn
                .call(
                    "Input.dispatchKeyEvent",
                    json!({ "type": "keyDown", "text": ch }),
                )
                .await?;
            self.conn
                .call("Input.dispatchKeyEvent", json!({ "type": "keyUp", "text": ch }))
                .await?;
        }
        Ok(())
    }

    async fn key(&self, key: &str, modifiers: i64) -> Result<()> {
        let (key_value, code, text, vk) = key_definition(key);
        let mut down = json!({
            "type": "keyDown",
            "key": key_value,
            "code": code,
            "windowsVirtualKeyCode": vk,
            "modifiers": modifiers,
        });
        if !text.is_empty() && modifiers & 0b0111 == 0 {
            down["text"] = json!(text);
        }
        self.conn.call("Input.dispatchKeyEvent", down).await?;
        self.conn
            .call(
                "Input.dispatchKeyEvent",
                json!({
                    "type": "keyUp",
                    "key": key_value,
                    "code": code,
                    "windowsVirtualKeyCode": vk,
                    "modifiers": modifiers,
                }),
            )
            .await?;
        Ok(())
    }

    async fn run_on_element(&self, selector: &str, body: &str) -> Result<Value> {
        let js = element_script(selector, body)?;
        self.conn.evaluate(&js).await
    }

    async fn capture(&self, params: Value) -> Result<Vec<u8>> {
        let result = self.conn.call("Page.captureScreenshot", params).await?;
        let data = result
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ReplayError::Other("No screenshot data".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| ReplayError::Other(format!("Failed to decode screenshot: {}", e)))
    }
}

/// Wrap `body` in a function that has `el` bound to the first match of `selector`.
/// The body runs only when the element exists; otherwise the script yields `null`.
fn element_script(selector: &str, body: &str) -> Result<String> {
    let selector_json = serde_json::to_string(selector)?;
    Ok(format!(
        "(function() {{ const el = document.querySelector({selector_json}); if (!el) return null; {body} }})()"
    ))
}

/// Map key names to (key, code, text, windowsVirtualKeyCode)
fn key_definition(key: &str) -> (&str, &str, &str, i64) {
    match key.to_lowercase().as_str() {
        "enter" | "return" => ("Enter", "Enter", "\r", 13),
        "tab" => ("Tab", "Tab", "\t", 9),
        "escape" | "esc" => ("Escape", "Escape", "", 27),
        "backspace" => ("Backspace", "Backspace", "", 8),
        "delete" => ("Delete", "Delete", "", 46),
        "arrowup" | "up" => ("ArrowUp", "ArrowUp", "", 38),
        "arrowdown" | "down" => ("ArrowDown", "ArrowDown", "", 40),
        "arrowleft" | "left" => ("ArrowLeft", "ArrowLeft", "", 37),
        "arrowright" | "right" => ("ArrowRight", "ArrowRight", "", 39),
        "home" => ("Home", "Home", "", 36),
        "end" => ("End", "End", "", 35),
        "pageup" => ("PageUp", "PageUp", "", 33),
        "pagedown" => ("PageDown", "PageDown", "", 34),
        " " | "space" => (" ", "Space", " ", 32),
        _ => (key, key, key, 0),
    }
}

const STATE_BODY: &str = r#"
    const r = el.getBoundingClientRect();
    const s = window.getComputedStyle(el);
    const visible = r.width > 0 && r.height > 0 && s.visibility !== 'hidden'
        && s.display !== 'none' && s.opacity !== '0';
    const enabled = !el.disabled;
    return { exists: true, visible, enabled, clickable: enabled && s.pointerEvents !== 'none' };
"#;

const SNAPSHOT_BODY: &str = r#"
    const r = el.getBoundingClientRect();
    const s = window.getComputedStyle(el);
    return {
        x: Math.round(r.left), y: Math.round(r.top),
        width: Math.round(r.width), height: Math.round(r.height),
        opacity: s.opacity, display: s.display, visibility: s.visibility,
        transform: s.transform, animationName: s.animationName,
        transitionProperty: s.transitionProperty
    };
"#;

const CENTER_BODY: &str = r#"
    el.scrollIntoView({ behavior: 'instant', block: 'center', inline: 'center' });
    const r = el.getBoundingClientRect();
    return { x: r.left + r.width / 2, y: r.top + r.height / 2 };
"#;

#[async_trait]
impl Page for CdpPage {
    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.conn.evaluate(expression).await
    }

    async fn current_url(&self) -> Result<String> {
        let url = self.conn.evaluate("window.location.href").await?;
        Ok(url.as_str().unwrap_or_default().to_string())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        // Subscribe first so a commit racing the response is not missed
        let mut events = self.conn.subscribe();
        let result = self
            .conn
            .call("Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(err) = result
            .get("errorText")
            .and_then(|v| v.as_str())
            .filter(|e| !e.is_empty())
        {
            return Err(ReplayError::NavigationFailed(format!("{}: {}", url, err)));
        }

        // Same-document navigations carry no loader and commit nothing
        let frame_id = result.get("frameId").and_then(|v| v.as_str());
        let loader_id = result.get("loaderId").and_then(|v| v.as_str());
        if let (Some(frame_id), Some(loader_id)) = (frame_id, loader_id) {
            if !wait_for_commit(&mut events, frame_id, loader_id, COMMIT_TIMEOUT).await {
                tracing::debug!("No commit seen for {} within {}s", url, COMMIT_TIMEOUT.as_secs());
            }
        }
        Ok(())
    }

    async fn ready_state(&self) -> Result<String> {
        let state = self.conn.evaluate("document.readyState").await?;
        Ok(state.as_str().unwrap_or("loading").to_string())
    }

    async fn element_state(&self, selector: &str) -> Result<ElementState> {
        match self.run_on_element(selector, STATE_BODY).await {
            Ok(Value::Null) => Ok(ElementState::absent()),
            Ok(value) => Ok(serde_json::from_value(value)?),
            // An invalid selector cannot match anything
            Err(ReplayError::JavaScriptError(_)) => Ok(ElementState::absent()),
            Err(e) => Err(e),
        }
    }

    async fn element_snapshot(&self, selector: &str) -> Result<Option<ElementSnapshot>> {
        match self.run_on_element(selector, SNAPSHOT_BODY).await? {
            Value::Null => Ok(None),
            value => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    async fn click(&self, selector: &str, modifiers: i64) -> Result<()> {
        let center = self.run_on_element(selector, CENTER_BODY).await?;
        if center.is_null() {
            return Err(ReplayError::ElementNotFound(selector.to_string()));
        }
        let x = center.get("x").and_then(|v| v.as_f64());
        let y = center.get("y").and_then(|v| v.as_f64());
        let (Some(x), Some(y)) = (x, y) else {
            return Err(ReplayError::Other("Invalid coordinates".to_string()));
        };

        // mouseMoved first so the browser updates its hit-test target
        self.mouse("mouseMoved", x, y, modifiers).await?;
        self.mouse("mousePressed", x, y, modifiers).await?;
        self.mouse("mouseReleased", x, y, modifiers).await
    }

    async fn click_by_text(&self, text: &str, tag: Option<&str>) -> Result<bool> {
        let text_json = serde_json::to_string(text.trim())?;
        let tag_json = serde_json::to_string(&tag.map(|t| t.to_uppercase()))?;
        let js = format!(
            r#"(function() {{
                const wanted = {text_json};
                const tag = {tag_json};
                const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
                let node;
                while ((node = walker.nextNode())) {{
                    if (node.textContent.trim() !== wanted) continue;
                    const el = node.parentElement;
                    if (!el) continue;
                    if (tag && el.tagName !== tag) continue;
                    el.scrollIntoView({{ block: 'center' }});
                    el.click();
                    return true;
                }}
                return false;
            }})()"#
        );
        Ok(self.conn.evaluate(&js).await?.as_bool().unwrap_or(false))
    }

    async fn clear_and_type(&self, selector: &str, text: &str) -> Result<()> {
        self.click(selector, 0).await?;
        // Ctrl+A then Backspace
        self.key("a", 2).await?;
        self.key("Backspace", 0).await?;
        self.type_text(text).await
    }

    async fn focus_clear_and_type(&self, selector: &str, text: &str) -> Result<()> {
        let cleared = self
            .run_on_element(
                selector,
                "el.focus(); el.value = ''; el.dispatchEvent(new Event('input', { bubbles: true })); return true;",
            )
            .await?;
        if cleared.is_null() {
            return Err(ReplayError::ElementNotFound(selector.to_string()));
        }
        self.type_text(text).await
    }

    async fn set_value_script(&self, selector: &str, value: &str) -> Result<()> {
        let value_json = serde_json::to_string(value)?;
        let body = format!(
            "el.focus(); el.value = {value_json};
             el.dispatchEvent(new Event('input', {{ bubbles: true }}));
             el.dispatchEvent(new Event('change', {{ bubbles: true }}));
             return el.value === {value_json};"
        );
        match self.run_on_element(selector, &body).await? {
            Value::Null => Err(ReplayError::ElementNotFound(selector.to_string())),
            Value::Bool(true) => Ok(()),
            _ => Err(ReplayError::StepFailed(format!(
                "value of {} did not stick",
                selector
            ))),
        }
    }

    async fn press_key(&self, selector: &str, key: &str, modifiers: i64) -> Result<()> {
        if !selector.is_empty() {
            // Focus is best-effort; keys still go to the active element
            let _ = self.run_on_element(selector, "el.focus(); return true;").await;
        }
        self.key(key, modifiers).await
    }

    async fn scroll_to(&self, selector: Option<&str>, x: f64, y: f64) -> Result<()> {
        match selector {
            Some(sel) => {
                let body = format!("el.scrollLeft = {x}; el.scrollTop = {y}; return true;");
                if self.run_on_element(sel, &body).await?.is_null() {
                    return Err(ReplayError::ElementNotFound(sel.to_string()));
                }
            }
            None => {
                self.conn
                    .evaluate(&format!("window.scrollTo({x}, {y})"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()> {
        self.conn
            .evaluate(&format!("window.scrollBy({dx}, {dy})"))
            .await?;
        Ok(())
    }

    async fn swipe(&self, from: (f64, f64), to: (f64, f64)) -> Result<()> {
        const MOVES: usize = 5;
        self.conn
            .call(
                "Input.dispatchTouchEvent",
                json!({ "type": "touchStart", "touchPoints": [{ "x": from.0, "y": from.1 }] }),
            )
            .await?;
        for i in 1..=MOVES {
            let t = i as f64 / MOVES as f64;
            let x = from.0 + (to.0 - from.0) * t;
            let y = from.1 + (to.1 - from.1) * t;
            self.conn
                .call(
                    "Input.dispatchTouchEvent",
                    json!({ "type": "touchMove", "touchPoints": [{ "x": x, "y": y }] }),
                )
                .await?;
        }
        self.conn
            .call(
                "Input.dispatchTouchEvent",
                json!({ "type": "touchEnd", "touchPoints": [] }),
            )
            .await?;
        Ok(())
    }

    async fn mouse_move(&self, x: f64, y: f64) -> Result<()> {
        self.mouse("mouseMoved", x, y, 0).await
    }

    async fn submit(&self, selector: &str) -> Result<()> {
        let body = "const form = el.tagName === 'FORM' ? el : el.closest('form');
            if (!form) return false;
            if (form.requestSubmit) { form.requestSubmit(); } else { form.submit(); }
            return true;";
        match self.run_on_element(selector, body).await? {
            Value::Null => Err(ReplayError::ElementNotFound(selector.to_string())),
            Value::Bool(true) => Ok(()),
            _ => Err(ReplayError::StepFailed(format!(
                "{} is not inside a form",
                selector
            ))),
        }
    }

    async fn history_back(&self) -> Result<bool> {
        let history = self
            .conn
            .call("Page.getNavigationHistory", json!({}))
            .await?;
        let current = history
            .get("currentIndex")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if current <= 0 {
            return Ok(false);
        }
        let entry_id = history
            .get("entries")
            .and_then(|v| v.as_array())
            .and_then(|entries| entries.get((current - 1) as usize))
            .and_then(|entry| entry.get("id"))
            .and_then(|v| v.as_i64());
        match entry_id {
            Some(id) => {
                self.conn
                    .call("Page.navigateToHistoryEntry", json!({ "entryId": id }))
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.capture(json!({ "format": "png" })).await
    }

    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>> {
        let rect = self
            .run_on_element(
                selector,
                "el.scrollIntoView({ block: 'center' });
                 const r = el.getBoundingClientRect();
                 return { x: r.left + window.scrollX, y: r.top + window.scrollY, width: r.width, height: r.height };",
            )
            .await?;
        if rect.is_null() {
            return Err(ReplayError::ElementNotFound(selector.to_string()));
        }
        self.capture(json!({
            "format": "png",
            "clip": {
                "x": rect["x"], "y": rect["y"],
                "width": rect["width"], "height": rect["height"],
                "scale": 1
            },
            "captureBeyondViewport": true
        }))
        .await
    }

    async fn emulate(&self, device: &DeviceProfile) -> Result<()> {
        self.conn
            .call(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": device.width,
                    "height": device.height,
                    "deviceScaleFactor": 1,
                    "mobile": device.touch,
                }),
            )
            .await?;
        if !device.user_agent.is_empty() {
            self.conn
                .call(
                    "Emulation.setUserAgentOverride",
                    json!({ "userAgent": device.user_agent }),
                )
                .await?;
        }
        self.conn
            .call(
                "Emulation.setTouchEmulationEnabled",
                json!({ "enabled": device.touch, "maxTouchPoints": if device.touch { 5 } else { 0 } }),
            )
            .await?;
        Ok(())
    }
}
