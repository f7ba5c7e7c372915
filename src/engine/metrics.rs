use serde::Deserialize;

use crate::browser::Page;
use crate::models::PerformanceMetrics;

const METRICS_JS: &str = r#"(function() {
    if (!window.performance) return null;
    const nav = performance.getEntriesByType('navigation')[0];
    const timing = performance.timing || {};
    const paint = performance.getEntriesByType('paint');
    const fp = paint.find(p => p.name === 'first-paint');
    const fcp = paint.find(p => p.name === 'first-contentful-paint');
    const resources = performance.getEntriesByType('resource');
    const memory = performance.memory || {};
    const start = timing.navigationStart || 0;
    return {
        pageLoadTime: nav ? nav.loadEventEnd - nav.startTime : (timing.loadEventEnd || start) - start,
        domContentLoaded: nav ? nav.domContentLoadedEventEnd - nav.startTime
            : (timing.domContentLoadedEventEnd || start) - start,
        firstPaint: fp ? fp.startTime : 0,
        firstContentfulPaint: fcp ? fcp.startTime : 0,
        usedJSHeapSize: memory.usedJSHeapSize || 0,
        totalJSHeapSize: memory.totalJSHeapSize || 0,
        networkRequests: resources.length,
        networkTime: resources.reduce((sum, r) => sum + r.duration, 0)
    };
})()"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetrics {
    #[serde(default)]
    page_load_time: f64,
    #[serde(default)]
    dom_content_loaded: f64,
    #[serde(default)]
    first_paint: f64,
    #[serde(default)]
    first_contentful_paint: f64,
    #[serde(default, rename = "usedJSHeapSize")]
    used_js_heap_size: f64,
    #[serde(default, rename = "totalJSHeapSize")]
    total_js_heap_size: f64,
    #[serde(default)]
    network_requests: u64,
    #[serde(default)]
    network_time: f64,
}

const MB: f64 = 1024.0 * 1024.0;

impl From<RawMetrics> for PerformanceMetrics {
    fn from(raw: RawMetrics) -> Self {
        Self {
            page_load_time: raw.page_load_time.max(0.0),
            dom_content_loaded: raw.dom_content_loaded.max(0.0),
            first_paint: raw.first_paint,
            first_contentful_paint: raw.first_contentful_paint,
            memory_usage: raw.used_js_heap_size / MB,
            network_requests: raw.network_requests,
            network_time: raw.network_time,
            js_heap_size: raw.total_js_heap_size / MB,
        }
    }
}

/// Best-effort performance snapshot; `None` when the page cannot provide one
pub async fn collect(page: &dyn Page) -> Option<PerformanceMetrics> {
    match page.evaluate(METRICS_JS).await {
        Ok(value) if !value.is_null() => match serde_json::from_value::<RawMetrics>(value) {
            Ok(raw) => Some(raw.into()),
            Err(e) => {
                tracing::debug!("Unexpected metrics shape: {}", e);
                None
            }
        },
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Metrics unavailable: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::page::mock::MockPage;
    use serde_json::json;

    #[tokio::test]
    async fn snapshot_converts_heap_to_megabytes() {
        let page = MockPage::new();
        page.state.lock().unwrap().metrics = Some(json!({
            "pageLoadTime": 812.5,
            "domContentLoaded": 400.0,
            "usedJSHeapSize": 10485760.0,
            "totalJSHeapSize": 20971520.0,
            "networkRequests": 17,
            "networkTime": 950.0
        }));

        let metrics = collect(&page).await.unwrap();
        assert_eq!(metrics.page_load_time, 812.5);
        assert_eq!(metrics.memory_usage, 10.0);
        assert_eq!(metrics.js_heap_size, 20.0);
        assert_eq!(metrics.network_requests, 17);
    }

    #[tokio::test]
    async fn missing_performance_api_is_none() {
        let page = MockPage::new();
        assert!(collect(&page).await.is_none());
    }
}
