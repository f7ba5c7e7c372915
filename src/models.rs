use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a recorded interaction.
///
/// Wire names match what the in-page recorder emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    #[serde(rename = "click")]
    Click,
    #[serde(rename = "input")]
    Input,
    #[serde(rename = "keydown")]
    Keydown,
    #[serde(rename = "scroll")]
    Scroll,
    #[serde(rename = "swipe")]
    Swipe,
    #[serde(rename = "touchstart")]
    TouchStart,
    #[serde(rename = "touchmove")]
    TouchMove,
    #[serde(rename = "touchend")]
    TouchEnd,
    #[serde(rename = "mousedrag")]
    MouseDrag,
    #[serde(rename = "change")]
    Change,
    #[serde(rename = "submit")]
    Submit,
    #[serde(rename = "navigate")]
    Navigate,
    #[serde(rename = "cross_domain_navigation")]
    CrossDomainNavigation,
    #[serde(rename = "back")]
    Back,
    #[serde(rename = "beforeunload")]
    BeforeUnload,
    #[serde(rename = "popstate")]
    PopState,
    #[serde(rename = "hashchange")]
    HashChange,
    /// Anything a newer recorder emits that this engine does not know.
    #[serde(other)]
    Unknown,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Click => "click",
            StepKind::Input => "input",
            StepKind::Keydown => "keydown",
            StepKind::Scroll => "scroll",
            StepKind::Swipe => "swipe",
            StepKind::TouchStart => "touchstart",
            StepKind::TouchMove => "touchmove",
            StepKind::TouchEnd => "touchend",
            StepKind::MouseDrag => "mousedrag",
            StepKind::Change => "change",
            StepKind::Submit => "submit",
            StepKind::Navigate => "navigate",
            StepKind::CrossDomainNavigation => "cross_domain_navigation",
            StepKind::Back => "back",
            StepKind::BeforeUnload => "beforeunload",
            StepKind::PopState => "popstate",
            StepKind::HashChange => "hashchange",
            StepKind::Unknown => "unknown",
        }
    }

    /// Steps after which a `step` screenshot is captured.
    pub fn captures_screenshot(&self) -> bool {
        matches!(self, StepKind::Click | StepKind::Submit | StepKind::Change)
    }

    /// Steps that can be attempted early by the smart wait.
    pub fn supports_early_attempt(&self) -> bool {
        matches!(
            self,
            StepKind::Click
                | StepKind::Input
                | StepKind::Keydown
                | StepKind::Scroll
                | StepKind::Swipe
                | StepKind::TouchStart
                | StepKind::TouchMove
                | StepKind::TouchEnd
                | StepKind::MouseDrag
                | StepKind::Change
                | StepKind::Submit
        )
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitMode {
    #[default]
    #[serde(rename = "smart", alias = "")]
    Smart,
    #[serde(rename = "fixed")]
    Fixed,
}

/// Numeric positions recorded with a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Coordinates {
    pub fn point(&self) -> Option<(f64, f64)> {
        Some((self.x?, self.y?))
    }

    pub fn swipe_span(&self) -> Option<((f64, f64), (f64, f64))> {
        Some((
            (self.start_x?, self.start_y?),
            (self.end_x?, self.end_y?),
        ))
    }
}

/// Free-form options with the commonly used fields lifted out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_selectors: Vec<String>,
    /// Stable class fragments of the target element, used for `[class*=..]` fallbacks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ctrl_key: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shift_key: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub alt_key: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub meta_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_window: Option<bool>,
    #[serde(default, rename = "to_domain", skip_serializing_if = "Option::is_none")]
    pub to_domain: Option<String>,
    #[serde(default, rename = "from_domain", skip_serializing_if = "Option::is_none")]
    pub from_domain: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StepOptions {
    /// CDP modifier bit mask (Alt=1, Ctrl=2, Meta=4, Shift=8).
    pub fn modifiers(&self) -> i64 {
        let mut mask = 0;
        if self.alt_key {
            mask |= 1;
        }
        if self.ctrl_key {
            mask |= 2;
        }
        if self.meta_key {
            mask |= 4;
        }
        if self.shift_key {
            mask |= 8;
        }
        mask
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaKind {
    ImageOcr,
    Sms,
    Sliding,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptchaSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captcha_type: Option<CaptchaKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub captcha_selector: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub captcha_input_selector: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub captcha_phone: String,
    /// Seconds; zero means the handler default.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub captcha_timeout: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// One recorded interaction. Produced by the recorder, read-only for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub coordinates: Coordinates,
    #[serde(default)]
    pub options: StepOptions,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Seconds to wait before the step; zero disables the wait.
    #[serde(default)]
    pub wait_before: u64,
    #[serde(default, rename = "wait_type")]
    pub wait_mode: WaitMode,
    #[serde(default, rename = "skip_step")]
    pub skip: bool,
    #[serde(default)]
    pub is_captcha: bool,
    #[serde(default, flatten)]
    pub captcha: CaptchaSpec,
}

impl Step {
    pub fn new(kind: StepKind, selector: impl Into<String>) -> Self {
        Self {
            kind,
            selector: selector.into(),
            value: String::new(),
            coordinates: Coordinates::default(),
            options: StepOptions::default(),
            timestamp: 0,
            description: String::new(),
            wait_before: 0,
            wait_mode: WaitMode::Smart,
            skip: false,
            is_captcha: false,
            captcha: CaptchaSpec::default(),
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_wait(mut self, seconds: u64, mode: WaitMode) -> Self {
        self.wait_before = seconds;
        self.wait_mode = mode;
        self
    }
}

/// Viewport and identity a test case is emulated with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default = "default_touch")]
    pub touch: bool,
}

fn default_touch() -> bool {
    true
}

impl Default for DeviceProfile {
    fn default() -> Self {
        crate::config::device::default_device()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub device: DeviceProfile,
    #[serde(alias = "environmentBaseURL", alias = "target_url")]
    pub environment_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_parallel: bool,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    TestCase,
    TestSuite,
    TestCaseInternal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Passed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Passed => "passed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub screenshot: String,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_detail: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            step_index: None,
            step_type: None,
            step_status: None,
            selector: String::new(),
            value: String::new(),
            screenshot: String::new(),
            duration: None,
            error_detail: String::new(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, message)
    }

    pub fn for_step(mut self, index: usize, step: &Step, status: StepStatus) -> Self {
        self.step_index = Some(index);
        self.step_type = Some(step.kind);
        self.step_status = Some(status);
        self.selector = step.selector.clone();
        self.value = step.value.clone();
        self
    }

    pub fn with_screenshot(mut self, path: impl Into<String>) -> Self {
        self.screenshot = path.into();
        self
    }

    pub fn with_duration(mut self, millis: u64) -> Self {
        self.duration = Some(millis);
        self
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = detail.into();
        self
    }
}

/// Page timing snapshot, all times in milliseconds and memory in megabytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub page_load_time: f64,
    pub dom_content_loaded: f64,
    pub first_paint: f64,
    pub first_contentful_paint: f64,
    pub memory_usage: f64,
    pub network_requests: u64,
    pub network_time: f64,
    pub js_heap_size: f64,
}

/// In-memory outcome of one test case run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PerformanceMetrics>,
}

impl ExecutionResult {
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            logs: vec![LogEntry::error(message.clone())],
            error_message: message,
            ..Default::default()
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        if self.cancelled {
            ExecutionStatus::Cancelled
        } else if self.success {
            ExecutionStatus::Passed
        } else {
            ExecutionStatus::Failed
        }
    }
}

/// Persisted record of one run. Owned by the store; the engine writes fields the caller persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_suite_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<u64>,
    pub execution_type: ExecutionKind,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default)]
    pub passed_count: usize,
    #[serde(default)]
    pub failed_count: usize,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub execution_logs: Vec<LogEntry>,
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PerformanceMetrics>,
}

impl Execution {
    fn blank(kind: ExecutionKind) -> Self {
        Self {
            id: 0,
            test_case_id: None,
            test_suite_id: None,
            parent_execution_id: None,
            execution_type: kind,
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            duration: 0,
            total_count: 0,
            passed_count: 0,
            failed_count: 0,
            error_message: String::new(),
            execution_logs: Vec::new(),
            screenshots: Vec::new(),
            metrics: None,
        }
    }

    pub fn for_case(test_case_id: u64) -> Self {
        Self {
            test_case_id: Some(test_case_id),
            total_count: 1,
            ..Self::blank(ExecutionKind::TestCase)
        }
    }

    pub fn for_suite(test_suite_id: u64, total: usize) -> Self {
        Self {
            test_suite_id: Some(test_suite_id),
            total_count: total,
            ..Self::blank(ExecutionKind::TestSuite)
        }
    }

    pub fn for_suite_case(test_case_id: u64, test_suite_id: u64, parent_id: u64) -> Self {
        Self {
            test_case_id: Some(test_case_id),
            test_suite_id: Some(test_suite_id),
            parent_execution_id: Some(parent_id),
            total_count: 1,
            ..Self::blank(ExecutionKind::TestCaseInternal)
        }
    }

    pub fn mark_running(&mut self) {
        self.status = ExecutionStatus::Running;
        self.start_time = Utc::now();
    }

    /// Move to a terminal status and stamp end time and duration.
    pub fn finish(&mut self, status: ExecutionStatus, error_message: impl Into<String>) {
        let now = Utc::now();
        self.status = status;
        self.error_message = error_message.into();
        self.end_time = Some(now);
        self.duration = (now - self.start_time).num_milliseconds();
    }

    /// Fold a runner result into this record.
    pub fn apply_result(&mut self, result: &ExecutionResult) {
        let status = result.status();
        let message = if status == ExecutionStatus::Passed {
            String::new()
        } else {
            result.error_message.clone()
        };
        self.finish(status, message);
        if self.execution_type != ExecutionKind::TestSuite {
            self.passed_count = usize::from(status == ExecutionStatus::Passed);
            self.failed_count = usize::from(status == ExecutionStatus::Failed);
        }
        self.execution_logs = result.logs.clone();
        self.screenshots = result.screenshots.clone();
        self.metrics = result.metrics.clone();
    }

    /// Copy the outcome of a prior passing record, keeping this record's identity.
    pub fn copy_outcome_from(&mut self, previous: &Execution) {
        self.status = previous.status;
        self.start_time = previous.start_time;
        self.end_time = previous.end_time;
        self.duration = previous.duration;
        self.total_count = previous.total_count;
        self.passed_count = previous.passed_count;
        self.failed_count = previous.failed_count;
        self.error_message = previous.error_message.clone();
        self.execution_logs = previous.execution_logs.clone();
        self.screenshots = previous.screenshots.clone();
        self.metrics = previous.metrics.clone();
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_click_event_parses_into_step() {
        let raw = serde_json::json!({
            "type": "click",
            "selector": "div.list > span.item:nth-of-type(2)",
            "coordinates": {"x": 12.5, "y": 40.0, "pageX": 100},
            "timestamp": 1700000000000i64,
            "options": {
                "fallbackSelectors": ["*[text-content=\"Buy\"]"],
                "elementText": "Buy",
                "tagName": "span",
                "detail": 1
            }
        });
        let step: Step = serde_json::from_value(raw).unwrap();
        assert_eq!(step.kind, StepKind::Click);
        assert_eq!(step.wait_mode, WaitMode::Smart);
        assert_eq!(step.coordinates.point(), Some((12.5, 40.0)));
        assert_eq!(step.coordinates.extra.get("pageX"), Some(&serde_json::json!(100)));
        assert_eq!(step.options.fallback_selectors.len(), 1);
        assert_eq!(step.options.element_text.as_deref(), Some("Buy"));
        assert_eq!(step.options.extra.get("detail"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn empty_wait_type_means_smart() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "type": "input", "selector": "#name", "value": "x",
            "wait_before": 3, "wait_type": ""
        }))
        .unwrap();
        assert_eq!(step.wait_mode, WaitMode::Smart);
        assert_eq!(step.wait_before, 3);
    }

    #[test]
    fn unknown_kind_is_preserved_as_unknown() {
        let step: Step =
            serde_json::from_value(serde_json::json!({"type": "pinch", "selector": "x"})).unwrap();
        assert_eq!(step.kind, StepKind::Unknown);
    }

    #[test]
    fn captcha_fields_are_flattened() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "type": "input", "selector": "#code", "is_captcha": true,
            "captcha_type": "image_ocr", "captcha_selector": "img.captcha"
        }))
        .unwrap();
        assert!(step.is_captcha);
        assert_eq!(step.captcha.captcha_type, Some(CaptchaKind::ImageOcr));
        assert_eq!(step.captcha.captcha_selector, "img.captcha");
    }

    #[test]
    fn modifiers_follow_cdp_bit_layout() {
        let options = StepOptions {
            ctrl_key: true,
            shift_key: true,
            ..Default::default()
        };
        assert_eq!(options.modifiers(), 10);
    }

    #[test]
    fn cancelled_result_maps_to_cancelled_status() {
        let result = ExecutionResult {
            success: false,
            cancelled: true,
            error_message: "Execution was cancelled".into(),
            ..Default::default()
        };
        let mut execution = Execution::for_case(7);
        execution.mark_running();
        execution.apply_result(&result);
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.failed_count, 0);
        assert!(execution.end_time.is_some());
    }

    #[test]
    fn copy_outcome_keeps_identity() {
        let mut previous = Execution::for_suite_case(1, 2, 3);
        previous.id = 10;
        previous.apply_result(&ExecutionResult {
            success: true,
            screenshots: vec!["2024-01-01/a_final_3_10:00:00.png".into()],
            logs: vec![LogEntry::info("done")],
            ..Default::default()
        });

        let mut copy = Execution::for_suite_case(1, 2, 4);
        copy.id = 11;
        copy.copy_outcome_from(&previous);
        assert_eq!(copy.id, 11);
        assert_eq!(copy.parent_execution_id, Some(4));
        assert_eq!(copy.status, ExecutionStatus::Passed);
        assert_eq!(copy.execution_logs, previous.execution_logs);
        assert_eq!(copy.screenshots, previous.screenshots);
    }
}
