//! Captcha steps: OCR of an image captcha and SMS codes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{push_log, wait, StepContext};
use crate::browser::Page;
use crate::config::CaptchaConfig;
use crate::error::{ReplayError, Result};
use crate::models::{CaptchaKind, LogEntry, Step};

const SCREENSHOT_ATTEMPTS: u32 = 3;
/// Element screenshots smaller than this are blank or half-rendered
const MIN_CAPTURE_BYTES: usize = 1000;
const DEFAULT_SMS_TIMEOUT: Duration = Duration::from_secs(60);
const SEND_BUTTON_SETTLE: Duration = Duration::from_secs(2);

/// Tried in order when the step names no input field
const COMMON_INPUTS: &[&str] = &[
    "input[name*='captcha']",
    "input[id*='captcha']",
    "input[placeholder*='验证码']",
    "input[name*='code']",
    "input[placeholder*='code' i]",
];

/// Supplies SMS verification codes sent to a phone number
#[async_trait]
pub trait SmsCodeSource: Send + Sync {
    async fn fetch_code(&self, phone: &str, timeout: Duration) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct OcrAnswer {
    code: String,
}

#[derive(Clone)]
pub struct CaptchaSolver {
    ocr_service_url: Option<String>,
    image_load_attempts: u32,
    http: reqwest::Client,
    sms: Option<Arc<dyn SmsCodeSource>>,
}

impl CaptchaSolver {
    pub fn from_config(config: &CaptchaConfig) -> Self {
        Self {
            ocr_service_url: config.ocr_service_url.clone(),
            image_load_attempts: config.image_load_attempts.max(1),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            sms: None,
        }
    }

    pub fn with_sms_source(mut self, source: Arc<dyn SmsCodeSource>) -> Self {
        self.sms = Some(source);
        self
    }

    pub async fn solve(
        &self,
        page: &dyn Page,
        ctx: &StepContext,
        step: &Step,
        logs: &mut Vec<LogEntry>,
    ) -> Result<()> {
        match step.captcha.captcha_type {
            Some(CaptchaKind::ImageOcr) => self.solve_image(page, ctx, step, logs).await,
            Some(CaptchaKind::Sms) => self.solve_sms(page, ctx, step, logs).await,
            Some(CaptchaKind::Sliding) => Err(ReplayError::Captcha(
                "sliding captchas are not supported".to_string(),
            )),
            None => Err(ReplayError::Captcha("captcha type missing".to_string())),
        }
    }

    async fn solve_image(
        &self,
        page: &dyn Page,
        ctx: &StepContext,
        step: &Step,
        logs: &mut Vec<LogEntry>,
    ) -> Result<()> {
        let image = step.captcha.captcha_selector.trim();
        if image.is_empty() {
            return Err(ReplayError::Captcha("image captcha needs captcha_selector".to_string()));
        }
        let Some(url) = self.ocr_service_url.as_deref() else {
            return Err(ReplayError::Captcha("no OCR service configured".to_string()));
        };

        wait::wait_for_element_ready(page, ctx, image).await?;
        self.wait_for_image_loaded(page, ctx, image).await?;

        let png = capture_element(page, ctx, image).await?;
        push_log(
            logs,
            LogEntry::debug(format!("Captured captcha image ({} bytes)", png.len())),
        );

        let code = ctx.guard(self.recognize(url, png)).await?;
        push_log(logs, LogEntry::info(format!("Captcha recognized: {}", code)));

        let input = resolve_input(page, ctx, step).await?;
        ctx.guard(page.clear_and_type(&input, &code)).await
    }

    /// Poll until the image has pixels and a real source
    async fn wait_for_image_loaded(
        &self,
        page: &dyn Page,
        ctx: &StepContext,
        selector: &str,
    ) -> Result<()> {
        let selector_json = serde_json::to_string(selector)?;
        let js = format!(
            "(function() {{ const img = document.querySelector({}); \
             if (!img) return false; \
             const src = img.currentSrc || img.src || ''; \
             return !!(img.complete && img.naturalWidth > 0 && src && !src.startsWith('data:image/gif')); }})()",
            selector_json
        );
        for attempt in 1..=self.image_load_attempts {
            if ctx.guard(page.evaluate(&js)).await?.as_bool() == Some(true) {
                return Ok(());
            }
            tracing::debug!("Captcha image not loaded yet (attempt {})", attempt);
            ctx.sleep(Duration::from_secs(1)).await?;
        }
        Err(ReplayError::Captcha(format!(
            "captcha image {} did not load",
            selector
        )))
    }

    async fn recognize(&self, url: &str, png: Vec<u8>) -> Result<String> {
        let response = self
            .http
            .post(url)
            .header("Content-Type", "image/png")
            .body(png)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ReplayError::Captcha(format!(
                "OCR service answered {}",
                response.status()
            )));
        }
        let answer: OcrAnswer = response.json().await?;
        let code = answer.code.trim().to_string();
        if code.is_empty() {
            return Err(ReplayError::Captcha("OCR returned an empty code".to_string()));
        }
        Ok(code)
    }

    async fn solve_sms(
        &self,
        page: &dyn Page,
        ctx: &StepContext,
        step: &Step,
        logs: &mut Vec<LogEntry>,
    ) -> Result<()> {
        let Some(source) = self.sms.as_ref() else {
            return Err(ReplayError::Captcha("no SMS code source configured".to_string()));
        };

        let send_button = step.captcha.captcha_selector.trim();
        if !send_button.is_empty() {
            wait::wait_for_element_ready(page, ctx, send_button).await?;
            ctx.guard(page.click(send_button, 0)).await?;
            push_log(logs, LogEntry::info("Requested SMS code"));
            ctx.sleep(SEND_BUTTON_SETTLE).await?;
        }

        let timeout = match step.captcha.captcha_timeout {
            0 => DEFAULT_SMS_TIMEOUT,
            secs => Duration::from_secs(secs),
        };
        let code = ctx
            .guard(source.fetch_code(&step.captcha.captcha_phone, timeout))
            .await?;
        push_log(logs, LogEntry::info("SMS code received"));

        let input = resolve_input(page, ctx, step).await?;
        ctx.guard(page.clear_and_type(&input, &code)).await
    }
}

/// Element screenshot, retried while the capture looks empty
async fn capture_element(page: &dyn Page, ctx: &StepContext, selector: &str) -> Result<Vec<u8>> {
    let mut last = String::from("no attempt made");
    for attempt in 1..=SCREENSHOT_ATTEMPTS {
        match ctx.guard(page.screenshot_element(selector)).await {
            Ok(png) if png.len() >= MIN_CAPTURE_BYTES => return Ok(png),
            Ok(png) => last = format!("capture too small ({} bytes)", png.len()),
            Err(ReplayError::Cancelled) => return Err(ReplayError::Cancelled),
            Err(e) => last = e.to_string(),
        }
        tracing::debug!("Captcha capture attempt {} failed: {}", attempt, last);
        ctx.sleep(Duration::from_millis(500)).await?;
    }
    Err(ReplayError::Captcha(format!("could not capture captcha: {}", last)))
}

/// Explicit input selector, else the step selector, else a common captcha field
async fn resolve_input(page: &dyn Page, ctx: &StepContext, step: &Step) -> Result<String> {
    let explicit = step.captcha.captcha_input_selector.trim();
    if !explicit.is_empty() {
        wait::wait_for_element_ready(page, ctx, explicit).await?;
        return Ok(explicit.to_string());
    }
    let own = step.selector.trim();
    if !own.is_empty() {
        wait::wait_for_element_ready(page, ctx, own).await?;
        return Ok(own.to_string());
    }
    for candidate in COMMON_INPUTS {
        if ctx.guard(page.element_state(candidate)).await?.exists {
            return Ok(candidate.to_string());
        }
    }
    Err(ReplayError::Captcha("no captcha input field found".to_string()))
}
