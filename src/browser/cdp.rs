//! Persistent Chrome DevTools Protocol connection.
//!
//! One WebSocket per attached page target. Commands are correlated with their
//! responses by id through a table of pending oneshot senders; everything that
//! arrives without an id is a protocol event and is fanned out on a broadcast
//! channel so the recorder can watch navigations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{ReplayError, Result};

/// Default ceiling for a single protocol round trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Target entry from the `/json/list` endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub web_socket_debugger_url: Option<String>,
}

impl TargetInfo {
    pub fn is_page(&self) -> bool {
        self.target_type == "page"
    }
}

/// A protocol event (message without an id)
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

type Pending = HashMap<u64, oneshot::Sender<Result<Value>>>;

pub struct CdpConnection {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    events: broadcast::Sender<CdpEvent>,
    closed: CancellationToken,
    command_timeout: Duration,
}

impl CdpConnection {
    /// Connect to a page's `webSocketDebuggerUrl`
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(ws_url).await.map_err(|e| {
            ReplayError::CdpConnectionFailed(format!("WebSocket connection failed: {}", e))
        })?;
        let (mut write, mut read) = ws.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let pending: Arc<Mutex<Pending>> = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outgoing_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if write.send(Message::Text(msg.into())).await.is_err() {
                            writer_closed.cancel();
                            break;
                        }
                    }
                    _ = writer_closed.cancelled() => break,
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        let reader_pending = pending.clone();
        let reader_events = events.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = read.next() => frame,
                    _ = reader_closed.cancelled() => break,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        route_message(text.as_str(), &reader_pending, &reader_events).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("CDP socket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            reader_closed.cancel();
            let mut pending = reader_pending.lock().await;
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err(ReplayError::CdpConnectionFailed(
                    "connection closed".to_string(),
                )));
            }
        });

        Ok(Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            events,
            closed,
            command_timeout: COMMAND_TIMEOUT,
        })
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Send a command and wait for its result object
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.is_cancelled() {
            return Err(ReplayError::CdpConnectionFailed(
                "connection closed".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let cmd = serde_json::json!({ "id": id, "method": method, "params": params });
        if self.outgoing.send(cmd.to_string()).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ReplayError::CdpConnectionFailed(
                "connection closed".to_string(),
            ));
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ReplayError::CdpConnectionFailed(
                "connection lost".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ReplayError::Timeout(format!(
                    "{} did not answer within {}s",
                    method,
                    self.command_timeout.as_secs()
                )))
            }
        }
    }

    /// `Runtime.evaluate` with `returnByValue`, returning the plain value
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let response = self
            .call(
                "Runtime.evaluate",
                serde_json::json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true
                }),
            )
            .await?;

        if let Some(details) = response.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .or_else(|| details.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or("uncaught exception");
            return Err(ReplayError::JavaScriptError(text.to_string()));
        }

        Ok(response
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Tear the socket down; in-flight calls fail with a connection error
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn route_message(
    text: &str,
    pending: &Arc<Mutex<Pending>>,
    events: &broadcast::Sender<CdpEvent>,
) {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Invalid JSON from CDP: {}", e);
            return;
        }
    };

    if let Some(id) = msg.get("id").and_then(|v| v.as_u64()) {
        let sender = pending.lock().await.remove(&id);
        let Some(sender) = sender else {
            tracing::debug!("Response for unknown request id: {}", id);
            return;
        };
        let outcome = match msg.get("error") {
            Some(error) => Err(ReplayError::CdpConnectionFailed(format!(
                "CDP error: {}",
                error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string())
            ))),
            None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = sender.send(outcome);
    } else if let Some(method) = msg.get("method").and_then(|m| m.as_str()) {
        // No receivers is fine; events are only consumed while recording.
        let _ = events.send(CdpEvent {
            method: method.to_string(),
            params: msg.get("params").cloned().unwrap_or(Value::Null),
        });
    }
}

fn local_client(timeout: Duration) -> reqwest::Client {
    // Bypass proxies for the local debug port
    reqwest::Client::builder()
        .no_proxy()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// List targets exposed on a debug port
pub async fn list_targets(port: u16, timeout: Duration) -> Result<Vec<TargetInfo>> {
    let url = format!("http://127.0.0.1:{}/json/list", port);
    let response = local_client(timeout).get(&url).send().await.map_err(|e| {
        ReplayError::CdpConnectionFailed(format!("Failed to list targets on {}: {}", port, e))
    })?;
    Ok(response.json().await?)
}

/// First page-type target on a debug port
pub async fn first_page_target(port: u16, timeout: Duration) -> Result<TargetInfo> {
    list_targets(port, timeout)
        .await?
        .into_iter()
        .find(|t| t.is_page() && t.web_socket_debugger_url.is_some())
        .ok_or(ReplayError::NoPageTarget(port))
}

/// Whether something answers `/json/version` on the port within `timeout`
pub async fn is_endpoint_alive(port: u16, timeout: Duration) -> bool {
    let url = format!("http://127.0.0.1:{}/json/version", port);
    matches!(
        local_client(timeout).get(&url).send().await,
        Ok(resp) if resp.status().is_success()
    )
}
