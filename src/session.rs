//! The DevTools session driver (§4.2): a long-running WebSocket client that
//! drives one page-visit through the protocol state machine described in
//! `SPEC_FULL.md` §4.2 and reports outlinks back to the caller.
//!
//! Internally a visit's reader task owns the WebSocket receive half and
//! forwards every decoded message to an `mpsc` channel; `browse_page`'s
//! poll loop is the sole mutator of visit state (see `DESIGN.md`, "reader
//! worker vs visit fields"). This sidesteps the shared-field/publication
//! fence the original implementation relied on.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::behavior::{Behavior, ChromeSender};
use crate::config::DriverConfig;
use crate::connection::{Connection, Incoming};
use crate::supervisor::Supervisor;
use crate::{Error, Result};

const OUTLINKS_EXPRESSION: &str =
    "Array.prototype.slice.call(document.querySelectorAll('a[href]')).map(a => a.href)";

type RequestCallback = Arc<dyn Fn(&Value) + Send + Sync>;
type ScreenshotCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
type UrlChangeCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The three optional callback slots a caller may supply to `browse_page`.
#[derive(Clone, Default)]
pub struct BrowseCallbacks {
    pub on_request: Option<RequestCallback>,
    pub on_screenshot: Option<ScreenshotCallback>,
    pub on_url_change: Option<UrlChangeCallback>,
}

/// Scoped to one `browse_page` call; reset (dropped) before returning.
struct VisitContext {
    url: String,
    callbacks: BrowseCallbacks,
    screenshot_pending: Option<u32>,
    outlinks_pending: Option<u32>,
    document_url_pending: Option<u32>,
    outlinks: Option<HashSet<String>>,
    start: Instant,
    behavior: Option<Box<dyn Behavior>>,
}

impl VisitContext {
    fn new(url: String, callbacks: BrowseCallbacks) -> Self {
        Self {
            url,
            callbacks,
            screenshot_pending: None,
            outlinks_pending: None,
            document_url_pending: None,
            outlinks: None,
            start: Instant::now(),
            behavior: None,
        }
    }
}

/// A long-lived handle owning a debug port, its `Supervisor`, and the
/// command-id counter shared across every visit made on this driver. §3.
pub struct SessionDriver {
    port: u16,
    config: DriverConfig,
    supervisor: Mutex<Option<Supervisor>>,
    ws_url: Mutex<Option<String>>,
    next_id: Arc<AtomicU32>,
    pub(crate) abort: Arc<AtomicBool>,
    active_connection: Mutex<Option<Arc<Connection>>>,
}

impl SessionDriver {
    pub fn new(port: u16, config: DriverConfig) -> Self {
        Self {
            port,
            config,
            supervisor: Mutex::new(None),
            ws_url: Mutex::new(None),
            next_id: Arc::new(AtomicU32::new(1)),
            abort: Arc::new(AtomicBool::new(false)),
            active_connection: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Lazily brings up the Supervisor with the optional proxy override.
    /// Idempotent once a websocket URL has been obtained.
    pub async fn start(&self, proxy_override: Option<String>) -> Result<()> {
        let mut ws_url = self.ws_url.lock().await;
        if ws_url.is_some() {
            return Ok(());
        }
        let mut supervisor_guard = self.supervisor.lock().await;
        let mut supervisor = Supervisor::new(self.port, self.config.clone(), proxy_override);
        let url = supervisor.start().await?;
        *supervisor_guard = Some(supervisor);
        *ws_url = Some(url);
        Ok(())
    }

    /// Tears down the Supervisor and any temp resources. Idempotent.
    pub async fn stop(&self) {
        let mut ws_url = self.ws_url.lock().await;
        let mut supervisor_guard = self.supervisor.lock().await;
        if let Some(mut supervisor) = supervisor_guard.take() {
            supervisor.stop().await;
        }
        *ws_url = None;
    }

    /// Sets the abort flag; safe to call from any thread while a visit is
    /// in progress. §4.2, P7.
    pub fn abort_browse_page(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Allocates the next command id on this driver and sends it over the
    /// currently active visit's connection, if any.
    pub async fn send_to_chrome(&self, method: &str, params: Value) -> Result<u32> {
        let guard = self.active_connection.lock().await;
        match guard.as_ref() {
            Some(connection) => connection.send(method, params),
            None => Err(Error::BrowsingException(
                "send_to_chrome called with no active visit".to_string(),
            )),
        }
    }

    /// The core blocking call (§4.2): loads `url`, captures a screenshot,
    /// runs the configured `Behavior`, and returns the outlinks discovered
    /// in the final DOM.
    pub async fn browse_page(&self, url: &str, callbacks: BrowseCallbacks) -> Result<HashSet<String>> {
        self.start(None).await?;
        let ws_url = self
            .ws_url
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::BrowsingException("driver has no websocket url".to_string()))?;

        let (connection, mut incoming_rx) = Connection::connect(&ws_url, self.next_id.clone()).await?;
        let connection = Arc::new(connection);
        *self.active_connection.lock().await = Some(connection.clone());

        let result = self.run_visit(&connection, &mut incoming_rx, url, callbacks).await;

        self.teardown_visit(&connection, &mut incoming_rx).await;
        *self.active_connection.lock().await = None;

        result
    }

    async fn run_visit(
        &self,
        connection: &Arc<Connection>,
        incoming_rx: &mut mpsc::UnboundedReceiver<Incoming>,
        url: &str,
        callbacks: BrowseCallbacks,
    ) -> Result<HashSet<String>> {
        let mut ctx = VisitContext::new(url.to_string(), callbacks);

        connection.send("Network.enable", json!({}))?;
        connection.send("Page.enable", json!({}))?;
        connection.send("Console.enable", json!({}))?;
        connection.send("Debugger.enable", json!({}))?;
        connection.send("Runtime.enable", json!({}))?;
        connection.send(
            "Debugger.setBreakpointByUrl",
            json!({ "lineNumber": 1, "urlRegex": self.config.analytics_breakpoint_url_regex }),
        )?;
        connection.send("Page.navigate", json!({ "url": url }))?;

        loop {
            sleep(self.config.visit_poll_interval).await;

            let mut transport_dead = false;
            loop {
                match incoming_rx.try_recv() {
                    Ok(incoming) => self.handle_incoming(connection, &mut ctx, incoming),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        transport_dead = true;
                        break;
                    }
                }
            }
            if transport_dead {
                return Err(Error::BrowsingException(format!(
                    "websocket closed, did chrome die? {}",
                    connection.ws_url()
                )));
            }

            if let Some(behavior) = &ctx.behavior {
                if behavior.is_finished() {
                    if let Some(outlinks) = &ctx.outlinks {
                        tracing::info!(url = %ctx.url, "got outlinks, finished");
                        return Ok(outlinks.clone());
                    } else if ctx.outlinks_pending.is_none() {
                        tracing::info!(url = %ctx.url, "finished browsing page according to behavior, retrieving outlinks");
                        let id = connection.send("Runtime.evaluate", json!({ "expression": OUTLINKS_EXPRESSION, "returnByValue": true }))?;
                        ctx.outlinks_pending = Some(id);
                    }
                }
            }

            if ctx.start.elapsed() > self.config.visit_hard_timeout {
                tracing::info!(url = %ctx.url, timeout = ?self.config.visit_hard_timeout, "finished browsing page, reached hard timeout");
                return Ok(ctx.outlinks.clone().unwrap_or_default());
            }

            if self.abort.load(Ordering::SeqCst) {
                return Err(Error::BrowsingAborted("browsing page aborted".to_string()));
            }
        }
    }

    fn handle_incoming(&self, connection: &Arc<Connection>, ctx: &mut VisitContext, incoming: Incoming) {
        match incoming {
            Incoming::Event { method, params } => self.handle_event(connection, ctx, &method, &params),
            Incoming::Reply { id, result, error } => self.handle_reply(connection, ctx, id, result, error),
        }
    }

    fn handle_event(&self, connection: &Arc<Connection>, ctx: &mut VisitContext, method: &str, params: &Value) {
        match method {
            "Network.requestWillBeSent" => {
                if let Some(behavior) = &ctx.behavior {
                    behavior.notify_of_activity();
                }
                let request_url = params
                    .get("request")
                    .and_then(|r| r.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if request_url.to_lowercase().starts_with("data:") {
                    tracing::debug!(url = %ctx.url, "ignoring data url request");
                } else if let Some(on_request) = &ctx.callbacks.on_request {
                    on_request(params);
                }
            }
            "Page.loadEventFired" => {
                tracing::info!(url = %ctx.url, "Page.loadEventFired, requesting screenshot");
                match connection.send("Page.captureScreenshot", json!({})) {
                    Ok(id) => ctx.screenshot_pending = Some(id),
                    Err(e) => tracing::warn!(error = %e, "failed to request screenshot"),
                }
                match connection.send("Runtime.evaluate", json!({ "expression": "document.URL", "returnByValue": true })) {
                    Ok(id) => ctx.document_url_pending = Some(id),
                    Err(e) => tracing::warn!(error = %e, "failed to request document.URL"),
                }
            }
            "Console.messageAdded" => {
                let level = params.get("message").and_then(|m| m.get("level")).and_then(Value::as_str).unwrap_or("?");
                let text = params.get("message").and_then(|m| m.get("text")).and_then(Value::as_str).unwrap_or("");
                tracing::debug!(url = %ctx.url, %level, %text, "console message");
            }
            "Debugger.paused" => {
                let script_id = params
                    .get("callFrames")
                    .and_then(|f| f.get(0))
                    .and_then(|f| f.get("location"))
                    .and_then(|l| l.get("scriptId"))
                    .cloned();
                if let Some(script_id) = script_id {
                    if let Err(e) = connection.send(
                        "Debugger.setScriptSource",
                        json!({ "scriptId": script_id, "scriptSource": "console.log('google analytics is no more!');" }),
                    ) {
                        tracing::warn!(error = %e, "failed to neutralize analytics script");
                    }
                    if let Err(e) = connection.send("Debugger.resume", json!({})) {
                        tracing::warn!(error = %e, "failed to resume debugger");
                    }
                } else {
                    tracing::warn!("Debugger.paused with no callFrames/scriptId, resuming anyway");
                    let _ = connection.send("Debugger.resume", json!({}));
                }
            }
            other => {
                tracing::debug!(method = %other, "unhandled devtools event");
            }
        }
    }

    fn handle_reply(&self, connection: &Arc<Connection>, ctx: &mut VisitContext, id: u32, result: Option<Value>, error: Option<String>) {
        if let Some(message) = &error {
            tracing::warn!(%id, error = %message, "devtools command returned an error");
        }

        if Some(id) == ctx.screenshot_pending {
            ctx.screenshot_pending = None;
            if let Some(data) = result.as_ref().and_then(|r| r.get("data")).and_then(Value::as_str) {
                match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data) {
                    Ok(bytes) => {
                        if let Some(on_screenshot) = &ctx.callbacks.on_screenshot {
                            on_screenshot(&bytes);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to decode screenshot base64"),
                }
            }
            tracing::info!(url = %ctx.url, "got screenshot, moving on to starting behaviors");
            let behavior = (self.config.behavior_factory)(&ctx.url);
            let sender = ChromeSender { connection: connection.clone() };
            if let Err(e) = behavior.start(&sender) {
                tracing::warn!(error = %e, "behavior failed to start");
            }
            ctx.behavior = Some(behavior);
        } else if Some(id) == ctx.outlinks_pending {
            ctx.outlinks_pending = None;
            let values = result
                .as_ref()
                .and_then(|r| r.get("result"))
                .and_then(|r| r.get("value"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let outlinks: HashSet<String> = values
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.is_empty())
                .collect();
            tracing::debug!(url = %ctx.url, count = outlinks.len(), "got outlinks");
            ctx.outlinks = Some(outlinks);
        } else if Some(id) == ctx.document_url_pending {
            ctx.document_url_pending = None;
            if let Some(value) = result.as_ref().and_then(|r| r.get("result")).and_then(|r| r.get("value")).and_then(Value::as_str) {
                if value != ctx.url {
                    if let Some(on_url_change) = &ctx.callbacks.on_url_change {
                        on_url_change(value);
                    }
                }
            }
        } else if let Some(behavior) = &ctx.behavior {
            if behavior.is_waiting_on_result(id) {
                let sender = ChromeSender { connection: connection.clone() };
                let message = json!({ "id": id, "result": result, "error": error });
                behavior.notify_of_result(&sender, &message);
            }
        }
    }

    /// Always runs, on every exit path from `browse_page`. §4.2 "Teardown
    /// of a visit". There is no OS-thread "reader worker" to join in this
    /// task-based design; waiting for `incoming_rx` to disconnect after
    /// requesting a close is the equivalent signal that the reader task has
    /// exited.
    async fn teardown_visit(&self, connection: &Arc<Connection>, incoming_rx: &mut mpsc::UnboundedReceiver<Incoming>) {
        connection.close();

        let drain_deadline = tokio::time::Duration::from_secs(30);
        if tokio::time::timeout(drain_deadline, drain_until_closed(incoming_rx)).await.is_ok() {
            return;
        }
        tracing::error!("devtools reader still alive 30 seconds after closing, will wait again");
        if tokio::time::timeout(drain_deadline, drain_until_closed(incoming_rx)).await.is_ok() {
            return;
        }
        tracing::error!("devtools reader still alive 60 seconds after closing");
    }
}

async fn drain_until_closed(incoming_rx: &mut mpsc::UnboundedReceiver<Incoming>) {
    while incoming_rx.recv().await.is_some() {}
}
