//! Page-level capability surface over the CDP transport.
//!
//! The driver owns exactly one current page. Recovery paths replace it
//! wholesale with [`Driver::fresh_page`] instead of trying to repair a wedged
//! tab, which mirrors how the upstream service behaves best: a fresh target,
//! domains re-enabled, old target closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use artifact_watch::ResponseSighting;

use crate::config::DriverConfig;
use crate::error::{DriverError, DriverErrorKind};
use crate::ids::PageId;
use crate::locator::Locator;
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};
use crate::DriverMode;

/// Cookie in CDP `Network.setCookies` shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieParam {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// Outcome of resolving a locator chain in the live page.
#[derive(Clone, Debug, Deserialize)]
pub struct ResolvedElement {
    /// Which strategy in the chain matched.
    pub strategy: String,
    /// Center-point viewport coordinates.
    pub x: f64,
    pub y: f64,
}

/// Everything the pipeline needs from a browser.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn start(&self) -> Result<(), DriverError>;
    async fn shutdown(&self) -> Result<(), DriverError>;

    async fn navigate(&self, url: &str) -> Result<(), DriverError>;
    /// Replace the current page with a brand-new target at `url`, closing the
    /// old one. The recovery primitive for a wedged page.
    async fn fresh_page(&self, url: &str) -> Result<(), DriverError>;
    async fn current_url(&self) -> Result<String, DriverError>;

    async fn resolve(&self, locator: &Locator) -> Result<Option<ResolvedElement>, DriverError>;
    async fn click(&self, locator: &Locator) -> Result<ResolvedElement, DriverError>;
    /// Set an input's value through the native setter and fire `input` and
    /// `change`, so framework-managed fields observe the edit.
    async fn set_value(&self, locator: &Locator, value: &str) -> Result<(), DriverError>;
    async fn upload_file(&self, locator: &Locator, path: &str) -> Result<(), DriverError>;

    async fn evaluate(&self, expression: &str) -> Result<Value, DriverError>;
    async fn page_content(&self) -> Result<String, DriverError>;
    async fn screenshot(&self, path: &str) -> Result<(), DriverError>;

    /// Click `locator` and report the URL of the file transfer the click
    /// starts, if any. The transfer itself is cancelled at the browser; only
    /// the URL is wanted. `None` when the element is absent or nothing
    /// begins within the capture window.
    async fn capture_download(&self, locator: &Locator) -> Result<Option<String>, DriverError>;


    async fn set_cookies(&self, cookies: &[CookieParam]) -> Result<(), DriverError>;
    fn subscribe_responses(&self) -> broadcast::Receiver<ResponseSighting>;

    fn mode(&self) -> DriverMode;
}

#[derive(Clone, Debug)]
struct PageHandle {
    id: PageId,
    target_id: String,
    session_id: String,
}

/// CDP-backed driver. Holds one current page; auto-attached targets get their
/// domains enabled so network sightings flow from them too.
pub struct CdpDriver {
    cfg: DriverConfig,
    transport: Arc<dyn CdpTransport>,
    current: RwLock<Option<PageHandle>>,
    /// target id -> session id for every attached target.
    sessions: Arc<DashMap<String, String>>,
    sightings: broadcast::Sender<ResponseSighting>,
    /// URLs of transfers the browser began (and denied); appended by the
    /// event loop, read by [`Driver::capture_download`].
    downloads: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
}

/// How long a clicked download control gets to actually start a transfer.
const DOWNLOAD_CAPTURE_WINDOW: Duration = Duration::from_secs(3);
const DOWNLOAD_CAPTURE_STEP: Duration = Duration::from_millis(100);

impl CdpDriver {
    pub fn new(cfg: DriverConfig, transport: Arc<dyn CdpTransport>) -> Self {
        let (sightings, _) = broadcast::channel(256);
        Self {
            cfg,
            transport,
            current: RwLock::new(None),
            sessions: Arc::new(DashMap::new()),
            sightings,
            downloads: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn session(&self) -> Result<String, DriverError> {
        let guard = self.current.read().await;
        guard
            .as_ref()
            .map(|page| page.session_id.clone())
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::NoBrowser).with_hint("no current page")
            })
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, DriverError> {
        let session = self.session().await?;
        self.transport
            .send_command(CommandTarget::Session(session), method, params)
            .await
    }

    async fn send_browser(&self, method: &str, params: Value) -> Result<Value, DriverError> {
        self.transport
            .send_command(CommandTarget::Browser, method, params)
            .await
    }

    async fn enable_domains(&self, session_id: &str) -> Result<(), DriverError> {
        for method in ["Page.enable", "Runtime.enable", "DOM.enable", "Network.enable"] {
            self.transport
                .send_command(
                    CommandTarget::Session(session_id.to_string()),
                    method,
                    json!({}),
                )
                .await?;
        }
        if let Some(ua) = &self.cfg.user_agent {
            self.transport
                .send_command(
                    CommandTarget::Session(session_id.to_string()),
                    "Network.setUserAgentOverride",
                    json!({ "userAgent": ua }),
                )
                .await?;
        }
        Ok(())
    }

    async fn open_page(&self, url: &str) -> Result<PageHandle, DriverError> {
        let created = self
            .send_browser("Target.createTarget", json!({ "url": url }))
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal)
                    .with_hint("Target.createTarget returned no targetId")
            })?
            .to_string();

        let attached = self
            .send_browser(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal)
                    .with_hint("Target.attachToTarget returned no sessionId")
            })?
            .to_string();

        self.sessions.insert(target_id.clone(), session_id.clone());
        self.enable_domains(&session_id).await?;

        Ok(PageHandle {
            id: PageId::new(),
            target_id,
            session_id,
        })
    }

    async fn close_target(&self, target_id: &str) {
        self.sessions.remove(target_id);
        if let Err(err) = self
            .send_browser("Target.closeTarget", json!({ "targetId": target_id }))
            .await
        {
            warn!(target: "cdp-driver", ?err, target_id, "failed to close old target");
        }
    }

    async fn dispatch_click(&self, x: f64, y: f64) -> Result<(), DriverError> {
        for event_type in ["mousePressed", "mouseReleased"] {
            self.send(
                "Input.dispatchMouseEvent",
                json!({
                    "type": event_type,
                    "x": x,
                    "y": y,
                    "button": "left",
                    "clickCount": 1,
                }),
            )
            .await?;
        }
        Ok(())
    }

    /// Evaluate and return the raw `Runtime.evaluate` result object, after
    /// surfacing in-page exceptions as errors.
    async fn evaluate_raw(
        &self,
        expression: &str,
        return_by_value: bool,
    ) -> Result<Value, DriverError> {
        let reply = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": return_by_value,
                    "userGesture": true,
                }),
            )
            .await?;

        if let Some(exception) = reply.get("exceptionDetails") {
            let text = exception
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| exception.get("text").and_then(Value::as_str))
                .unwrap_or("script threw");
            return Err(
                DriverError::new(DriverErrorKind::Internal).with_hint(format!("page script: {text}"))
            );
        }

        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn event_loop(
        transport: Arc<dyn CdpTransport>,
        sessions: Arc<DashMap<String, String>>,
        sightings: broadcast::Sender<ResponseSighting>,
        downloads: Arc<Mutex<Vec<String>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = transport.next_event() => match event {
                    Some(event) => event,
                    None => {
                        debug!(target: "cdp-driver", "event stream ended");
                        break;
                    }
                },
            };

            match event.method.as_str() {
                "Network.responseReceived" => {
                    Self::publish_sighting(&sightings, &event);
                }
                "Browser.downloadWillBegin" => {
                    if let Some(url) = event.params.get("url").and_then(Value::as_str) {
                        debug!(target: "cdp-driver", url, "download intercepted");
                        downloads.lock().await.push(url.to_string());
                        // Surface it on the response stream too; a denied
                        // transfer still names the artifact.
                        let _ = sightings.send(ResponseSighting {
                            url: url.to_string(),
                            mime_type: None,
                            status: 200,
                        });
                    }
                }
                "Target.attachedToTarget" => {
                    Self::record_attachment(&transport, &sessions, &event).await;
                }
                "Target.detachedFromTarget" => {
                    if let Some(session_id) =
                        event.params.get("sessionId").and_then(Value::as_str)
                    {
                        sessions.retain(|_, v| v != session_id);
                    }
                }
                "Target.targetDestroyed" => {
                    if let Some(target_id) = event.params.get("targetId").and_then(Value::as_str) {
                        sessions.remove(target_id);
                    }
                }
                _ => {}
            }
        }
    }

    fn publish_sighting(sightings: &broadcast::Sender<ResponseSighting>, event: &TransportEvent) {
        let Some(response) = event.params.get("response") else {
            return;
        };
        let Some(url) = response.get("url").and_then(Value::as_str) else {
            return;
        };
        let sighting = ResponseSighting {
            url: url.to_string(),
            mime_type: response
                .get("mimeType")
                .and_then(Value::as_str)
                .map(str::to_string),
            status: response.get("status").and_then(Value::as_i64).unwrap_or(0),
        };
        // No receivers is fine; a wait may not be in flight.
        let _ = sightings.send(sighting);
    }

    async fn record_attachment(
        transport: &Arc<dyn CdpTransport>,
        sessions: &Arc<DashMap<String, String>>,
        event: &TransportEvent,
    ) {
        let Some(session_id) = event.params.get("sessionId").and_then(Value::as_str) else {
            return;
        };
        let info = event.params.get("targetInfo");
        let target_id = info
            .and_then(|i| i.get("targetId"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let target_type = info
            .and_then(|i| i.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if target_type != "page" || target_id.is_empty() {
            return;
        }

        if sessions
            .insert(target_id.to_string(), session_id.to_string())
            .is_some()
        {
            return;
        }

        // Auto-attached pages need Network enabled too, or their responses
        // never reach the sighting stream.
        if let Err(err) = transport
            .send_command(
                CommandTarget::Session(session_id.to_string()),
                "Network.enable",
                json!({}),
            )
            .await
        {
            warn!(target: "cdp-driver", ?err, target_id, "failed to enable network on attached target");
        }
    }
}

#[async_trait]
impl Driver for CdpDriver {
    async fn start(&self) -> Result<(), DriverError> {
        self.transport.start().await?;

        // Deny transfers browser-wide but keep the begin events; that is what
        // lets a clicked download control reveal its URL without ever writing
        // a file.
        self.send_browser(
            "Browser.setDownloadBehavior",
            json!({ "behavior": "deny", "eventsEnabled": true }),
        )
        .await?;

        tokio::spawn(Self::event_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.sessions),
            self.sightings.clone(),
            Arc::clone(&self.downloads),
            self.cancel.clone(),
        ));

        let page = self.open_page("about:blank").await?;
        info!(target: "cdp-driver", page = %page.id, target_id = %page.target_id, "initial page ready");
        *self.current.write().await = Some(page);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.cancel.cancel();
        if let Some(page) = self.current.write().await.take() {
            self.close_target(&page.target_id).await;
        }
        if let Err(err) = self.send_browser("Browser.close", json!({})).await {
            debug!(target: "cdp-driver", ?err, "browser close failed (may already be gone)");
        }
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let reply = tokio::time::timeout(
            Duration::from_millis(self.cfg.navigation_deadline_ms),
            self.send("Page.navigate", json!({ "url": url })),
        )
        .await
        .map_err(|_| {
            DriverError::new(DriverErrorKind::NavTimeout)
                .with_hint(format!("navigation to {url} timed out"))
                .retriable(true)
        })??;

        if let Some(error_text) = reply.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(DriverError::new(DriverErrorKind::NavTimeout)
                    .with_hint(format!("navigation failed: {error_text}"))
                    .retriable(true));
            }
        }

        // The service keeps hydrating after DOM-ready; give it a beat.
        sleep(Duration::from_millis(self.cfg.post_navigation_settle_ms)).await;
        Ok(())
    }

    async fn fresh_page(&self, url: &str) -> Result<(), DriverError> {
        let fresh = self.open_page(url).await?;
        debug!(target: "cdp-driver", page = %fresh.id, target_id = %fresh.target_id, "fresh page opened");

        let old = self.current.write().await.replace(fresh);
        if let Some(old) = old {
            self.close_target(&old.target_id).await;
        }
        sleep(Duration::from_millis(self.cfg.post_navigation_settle_ms)).await;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let result = self.evaluate_raw("window.location.href", true).await?;
        result
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal).with_hint("location.href not a string")
            })
    }

    async fn resolve(&self, locator: &Locator) -> Result<Option<ResolvedElement>, DriverError> {
        let result = self.evaluate_raw(&locator.probe_expression(), true).await?;
        let value = result.get("value").cloned().unwrap_or(Value::Null);
        if value.is_null() {
            return Ok(None);
        }
        let resolved: ResolvedElement = serde_json::from_value(value).map_err(|err| {
            DriverError::new(DriverErrorKind::Internal)
                .with_hint(format!("malformed probe result: {err}"))
        })?;
        Ok(Some(resolved))
    }

    async fn click(&self, locator: &Locator) -> Result<ResolvedElement, DriverError> {
        let resolved = self.resolve(locator).await?.ok_or_else(|| {
            DriverError::new(DriverErrorKind::TargetNotFound)
                .with_hint(format!("no visible match for {}", locator.target))
                .retriable(true)
        })?;

        debug!(
            target: "cdp-driver",
            element = %locator.target,
            strategy = %resolved.strategy,
            "clicking"
        );

        self.dispatch_click(resolved.x, resolved.y).await?;
        Ok(resolved)
    }

    async fn set_value(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        let element = locator.element_expression();
        let literal = serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string());
        // Go through the prototype setter so controlled inputs pick up the
        // change, then fire the events frameworks listen for.
        let script = format!(
            "(() => {{ \
             const el = {element}; \
             if (!el) return false; \
             el.focus(); \
             const proto = el instanceof HTMLTextAreaElement \
             ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype; \
             const setter = Object.getOwnPropertyDescriptor(proto, 'value'); \
             if (setter && setter.set) {{ setter.set.call(el, {literal}); }} \
             else {{ el.value = {literal}; }} \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return true; }})()"
        );

        let result = self.evaluate_raw(&script, true).await?;
        let applied = result.get("value").and_then(Value::as_bool).unwrap_or(false);
        if !applied {
            return Err(DriverError::new(DriverErrorKind::TargetNotFound)
                .with_hint(format!("no visible match for {}", locator.target))
                .retriable(true));
        }
        Ok(())
    }

    async fn upload_file(&self, locator: &Locator, path: &str) -> Result<(), DriverError> {
        let result = self
            .evaluate_raw(&locator.element_expression(), false)
            .await?;
        let object_id = result
            .get("objectId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::TargetNotFound)
                    .with_hint(format!("no file input match for {}", locator.target))
                    .retriable(true)
            })?;

        self.send(
            "DOM.setFileInputFiles",
            json!({ "files": [path], "objectId": object_id }),
        )
        .await?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, DriverError> {
        let result = self.evaluate_raw(expression, true).await?;
        Ok(result.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn capture_download(&self, locator: &Locator) -> Result<Option<String>, DriverError> {
        let Some(resolved) = self.resolve(locator).await? else {
            return Ok(None);
        };
        let baseline = self.downloads.lock().await.len();
        self.dispatch_click(resolved.x, resolved.y).await?;

        let deadline = tokio::time::Instant::now() + DOWNLOAD_CAPTURE_WINDOW;
        loop {
            {
                let downloads = self.downloads.lock().await;
                if downloads.len() > baseline {
                    return Ok(downloads.last().cloned());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(target: "cdp-driver", element = %locator.target, "click started no transfer");
                return Ok(None);
            }
            sleep(DOWNLOAD_CAPTURE_STEP).await;
        }
    }

    async fn page_content(&self) -> Result<String, DriverError> {
        let result = self
            .evaluate_raw("document.documentElement.outerHTML", true)
            .await?;
        result
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal).with_hint("outerHTML not a string")
            })
    }

    async fn screenshot(&self, path: &str) -> Result<(), DriverError> {
        let reply = self
            .send("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = reply.get("data").and_then(Value::as_str).ok_or_else(|| {
            DriverError::new(DriverErrorKind::Internal).with_hint("screenshot returned no data")
        })?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|err| {
                DriverError::new(DriverErrorKind::Internal)
                    .with_hint(format!("screenshot payload not base64: {err}"))
            })?;
        tokio::fs::write(path, bytes).await.map_err(|err| {
            DriverError::new(DriverErrorKind::Internal)
                .with_hint(format!("failed writing screenshot {path}: {err}"))
        })?;
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[CookieParam]) -> Result<(), DriverError> {
        if cookies.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_value(cookies).map_err(|err| {
            DriverError::new(DriverErrorKind::Internal)
                .with_hint(format!("cookie serialization: {err}"))
        })?;
        self.send("Network.setCookies", json!({ "cookies": payload }))
            .await?;
        Ok(())
    }

    fn subscribe_responses(&self) -> broadcast::Receiver<ResponseSighting> {
        self.sightings.subscribe()
    }

    fn mode(&self) -> DriverMode {
        self.transport.mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted transport: records every command, answers from a queue keyed
    /// by method name, and replays canned events.
    struct ScriptedTransport {
        sent: Mutex<Vec<(String, Value)>>,
        replies: Mutex<Vec<(String, Value)>>,
        events: Mutex<Vec<TransportEvent>>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                replies: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
            }
        }

        fn reply(&self, method: &str, value: Value) {
            self.replies.lock().unwrap().push((method.to_string(), value));
        }

        fn sent_methods(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(m, _)| m.clone())
                .collect()
        }

        fn sent_params(&self, method: &str) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == method)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CdpTransport for ScriptedTransport {
        async fn start(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn next_event(&self) -> Option<TransportEvent> {
            // Lock scope stays synchronous; events queued later are still
            // picked up on the next poll tick.
            loop {
                let next = {
                    let mut events = self.events.lock().unwrap();
                    if events.is_empty() {
                        None
                    } else {
                        Some(events.remove(0))
                    }
                };
                if next.is_some() {
                    return next;
                }
                sleep(Duration::from_millis(5)).await;
            }
        }

        async fn send_command(
            &self,
            _target: CommandTarget,
            method: &str,
            params: Value,
        ) -> Result<Value, DriverError> {
            self.sent
                .lock()
                .unwrap()
                .push((method.to_string(), params));
            let mut replies = self.replies.lock().unwrap();
            if let Some(pos) = replies.iter().position(|(m, _)| m == method) {
                Ok(replies.remove(pos).1)
            } else {
                Ok(json!({}))
            }
        }
    }

    fn driver_with_page(transport: Arc<ScriptedTransport>) -> CdpDriver {
        let driver = CdpDriver::new(DriverConfig::default(), transport);
        driver
    }

    async fn install_page(driver: &CdpDriver) {
        *driver.current.write().await = Some(PageHandle {
            id: PageId::new(),
            target_id: "T1".into(),
            session_id: "S1".into(),
        });
    }

    #[tokio::test]
    async fn click_resolves_then_dispatches_press_and_release() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            "Runtime.evaluate",
            json!({ "result": { "value": { "strategy": "css", "x": 40.0, "y": 60.0 } } }),
        );

        let driver = driver_with_page(Arc::clone(&transport));
        install_page(&driver).await;

        let locator = Locator::new("generate button").css("button.generate");
        let resolved = driver.click(&locator).await.expect("click");
        assert_eq!(resolved.strategy, "css");

        let methods = transport.sent_methods();
        assert_eq!(
            methods,
            vec![
                "Runtime.evaluate",
                "Input.dispatchMouseEvent",
                "Input.dispatchMouseEvent",
            ]
        );
        let mouse = transport.sent_params("Input.dispatchMouseEvent");
        assert_eq!(mouse[0]["type"], "mousePressed");
        assert_eq!(mouse[1]["type"], "mouseReleased");
        assert_eq!(mouse[0]["x"], 40.0);
    }

    #[tokio::test]
    async fn click_fails_retriably_when_nothing_matches() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply("Runtime.evaluate", json!({ "result": { "value": null } }));

        let driver = driver_with_page(Arc::clone(&transport));
        install_page(&driver).await;

        let err = driver
            .click(&Locator::new("missing").css("#missing"))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, DriverErrorKind::TargetNotFound));
        assert!(err.retriable);
    }

    #[tokio::test]
    async fn page_script_exception_surfaces_as_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            "Runtime.evaluate",
            json!({
                "result": { "value": null },
                "exceptionDetails": { "text": "ReferenceError: nope" }
            }),
        );

        let driver = driver_with_page(Arc::clone(&transport));
        install_page(&driver).await;

        let err = driver.evaluate("nope()").await.unwrap_err();
        assert!(err.hint.unwrap().contains("ReferenceError"));
    }

    #[tokio::test]
    async fn cookies_go_out_in_one_setcookies_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let driver = driver_with_page(Arc::clone(&transport));
        install_page(&driver).await;

        let cookies = vec![
            CookieParam {
                name: "sso".into(),
                value: "abc".into(),
                domain: ".grok.com".into(),
                path: "/".into(),
                secure: true,
                http_only: true,
                same_site: None,
            },
            CookieParam {
                name: "sso-rw".into(),
                value: "def".into(),
                domain: ".grok.com".into(),
                path: "/".into(),
                secure: true,
                http_only: false,
                same_site: None,
            },
        ];
        driver.set_cookies(&cookies).await.expect("set cookies");

        let calls = transport.sent_params("Network.setCookies");
        assert_eq!(calls.len(), 1);
        let sent = calls[0]["cookies"].as_array().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["name"], "sso");
        assert_eq!(sent[0]["httpOnly"], true);
        assert_eq!(sent[1]["name"], "sso-rw");
    }

    #[tokio::test]
    async fn response_events_become_sightings() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.events.lock().unwrap().push(TransportEvent {
            method: "Network.responseReceived".into(),
            params: json!({
                "response": {
                    "url": "https://assets.grok.com/generated_video.mp4",
                    "mimeType": "video/mp4",
                    "status": 200,
                }
            }),
            session_id: Some("S1".into()),
        });

        let driver = driver_with_page(Arc::clone(&transport));
        let mut rx = driver.subscribe_responses();

        tokio::spawn(CdpDriver::event_loop(
            Arc::clone(&driver.transport),
            Arc::clone(&driver.sessions),
            driver.sightings.clone(),
            Arc::clone(&driver.downloads),
            driver.cancel.clone(),
        ));

        let sighting = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event loop delivered nothing")
            .expect("stream closed");
        assert_eq!(sighting.url, "https://assets.grok.com/generated_video.mp4");
        assert_eq!(sighting.mime_type.as_deref(), Some("video/mp4"));
        assert_eq!(sighting.status, 200);
    }

    #[tokio::test]
    async fn clicked_download_control_reveals_the_transfer_url() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            "Runtime.evaluate",
            json!({ "result": { "value": { "strategy": "aria", "x": 12.0, "y": 24.0 } } }),
        );

        let driver = driver_with_page(Arc::clone(&transport));
        install_page(&driver).await;

        tokio::spawn(CdpDriver::event_loop(
            Arc::clone(&driver.transport),
            Arc::clone(&driver.sessions),
            driver.sightings.clone(),
            Arc::clone(&driver.downloads),
            driver.cancel.clone(),
        ));

        // The transfer begins shortly after the click lands.
        let injector = Arc::clone(&transport);
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            injector.events.lock().unwrap().push(TransportEvent {
                method: "Browser.downloadWillBegin".into(),
                params: json!({ "url": "blob:https://grok.com/d41d8cd9" }),
                session_id: None,
            });
        });

        let url = driver
            .capture_download(&Locator::new("download button").aria_label("download"))
            .await
            .expect("capture");
        assert_eq!(url.as_deref(), Some("blob:https://grok.com/d41d8cd9"));

        let mouse = transport.sent_params("Input.dispatchMouseEvent");
        assert_eq!(mouse.len(), 2, "the control must actually be clicked");
    }

    #[tokio::test]
    async fn capture_download_is_a_no_op_without_the_control() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply("Runtime.evaluate", json!({ "result": { "value": null } }));

        let driver = driver_with_page(Arc::clone(&transport));
        install_page(&driver).await;

        let url = driver
            .capture_download(&Locator::new("download button").aria_label("download"))
            .await
            .expect("capture");
        assert!(url.is_none());
        assert!(transport.sent_params("Input.dispatchMouseEvent").is_empty());
    }

    #[tokio::test]
    async fn set_value_reports_missing_element() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply("Runtime.evaluate", json!({ "result": { "value": false } }));

        let driver = driver_with_page(Arc::clone(&transport));
        install_page(&driver).await;

        let err = driver
            .set_value(&Locator::new("prompt").css("textarea"), "a dog")
            .await
            .unwrap_err();
        assert!(matches!(err.kind, DriverErrorKind::TargetNotFound));
    }
}
