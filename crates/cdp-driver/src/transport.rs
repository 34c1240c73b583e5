//! Pluggable CDP transport.
//!
//! `ChromiumTransport` owns the websocket connection to a launched (or
//! attached) Chromium, pumping commands in and events out through one select
//! loop. `NoopTransport` stands in when no browser is available so the rest of
//! the stack stays constructible.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::error::{DriverError, DriverErrorKind};
use crate::DriverMode;

/// One decoded CDP event as it leaves the wire.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Where a command is addressed.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), DriverError>;
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError>;
    fn mode(&self) -> DriverMode {
        DriverMode::Real
    }
}

/// Stub used when no Chrome executable can be found.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl CdpTransport for NoopTransport {
    async fn start(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        None
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        _params: Value,
    ) -> Result<Value, DriverError> {
        Err(DriverError::new(DriverErrorKind::NoBrowser)
            .with_hint(format!("no browser transport for method {method}")))
    }

    fn mode(&self) -> DriverMode {
        DriverMode::Stub
    }
}

type ConnFactory =
    Arc<dyn Fn(DriverConfig) -> BoxFuture<'static, Result<Arc<ConnState>, DriverError>> + Send + Sync>;

/// Transport over a live chromiumoxide connection. The connection state is
/// created lazily and recreated if the pump loop dies, so a browser crash
/// mid-batch does not strand the pipeline.
#[derive(Clone)]
pub struct ChromiumTransport {
    cfg: DriverConfig,
    state: Arc<OnceCell<Mutex<Option<Arc<ConnState>>>>>,
    factory: ConnFactory,
}

impl ChromiumTransport {
    pub fn new(cfg: DriverConfig) -> Self {
        let factory: ConnFactory = Arc::new(|cfg: DriverConfig| {
            Box::pin(async move {
                let state = ConnState::start(cfg).await?;
                Ok(Arc::new(state))
            })
        });

        Self {
            cfg,
            state: Arc::new(OnceCell::new()),
            factory,
        }
    }

    async fn conn(&self) -> Result<Arc<ConnState>, DriverError> {
        let cell = self.state.get_or_init(|| async { Mutex::new(None) }).await;
        let mut guard = cell.lock().await;

        if let Some(state) = guard.as_ref() {
            if state.is_alive() {
                return Ok(state.clone());
            }
        }

        let state = (self.factory)(self.cfg.clone()).await?;
        *guard = Some(state.clone());
        Ok(state)
    }

    #[cfg(test)]
    fn with_factory(cfg: DriverConfig, factory: ConnFactory) -> Self {
        Self {
            cfg,
            state: Arc::new(OnceCell::new()),
            factory,
        }
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), DriverError> {
        let conn = self.conn().await?;
        let deadline = Duration::from_millis(self.cfg.command_deadline_ms);

        conn.send(
            CommandTarget::Browser,
            "Target.setDiscoverTargets",
            serde_json::json!({ "discover": true }),
            deadline,
        )
        .await?;

        conn.send(
            CommandTarget::Browser,
            "Target.setAutoAttach",
            serde_json::json!({
                "autoAttach": true,
                "waitForDebuggerOnStart": false,
                "flatten": true,
            }),
            deadline,
        )
        .await?;

        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        match self.conn().await {
            Ok(conn) => conn.next_event().await,
            Err(err) => {
                warn!(target: "cdp-driver", ?err, "transport not ready");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError> {
        let conn = self.conn().await?;
        conn.send(
            target,
            method,
            params,
            Duration::from_millis(self.cfg.command_deadline_ms),
        )
        .await
    }
}

struct PendingCommand {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, DriverError>>,
}

struct ConnState {
    command_tx: mpsc::Sender<PendingCommand>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    pump_task: JoinHandle<()>,
    child: Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
}

impl ConnState {
    async fn start(cfg: DriverConfig) -> Result<Self, DriverError> {
        let (child, ws_url) = if let Some(url) = cfg.websocket_url.clone() {
            (None, url)
        } else {
            let browser_cfg = Self::browser_config(&cfg)?;
            Self::launch_browser(browser_cfg).await?
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| DriverError::new(DriverErrorKind::CdpIo).with_hint(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(512);

        let alive = Arc::new(AtomicBool::new(true));
        let pump_alive = alive.clone();

        let pump_task = tokio::spawn(async move {
            let pump = Pump {
                conn,
                inflight: HashMap::new(),
                events_tx,
            };
            let result = pump.run(command_rx).await;
            pump_alive.store(false, Ordering::Relaxed);
            if let Err(err) = result {
                error!(target: "cdp-driver", ?err, "transport pump terminated with error");
            }
        });

        info!(target: "cdp-driver", url = %ws_url, "chromium connection established");

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            pump_task,
            child: Mutex::new(child),
            alive,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn send(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, DriverError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let pending = PendingCommand {
            target,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(pending)
            .await
            .map_err(|err| DriverError::new(DriverErrorKind::CdpIo).with_hint(err.to_string()))?;

        match timeout(deadline, resp_rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(DriverError::new(DriverErrorKind::CdpIo)
                .with_hint("command response channel closed")),
            Err(_) => Err(DriverError::new(DriverErrorKind::NavTimeout)
                .with_hint(format!("command {method} timed out"))),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    fn browser_config(cfg: &DriverConfig) -> Result<BrowserConfig, DriverError> {
        if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
            return Err(DriverError::new(DriverErrorKind::NoBrowser).with_hint(format!(
                "chrome executable not found at {} (set REELFORGE_CHROME)",
                cfg.executable.display()
            )));
        }

        let profile_dir = if cfg.user_data_dir.is_absolute() {
            cfg.user_data_dir.clone()
        } else {
            let cwd = std::env::current_dir().map_err(|err| {
                DriverError::new(DriverErrorKind::Internal)
                    .with_hint(format!("failed to resolve cwd for profile dir: {err}"))
            })?;
            cwd.join(&cfg.user_data_dir)
        };
        fs::create_dir_all(&profile_dir).map_err(|err| {
            DriverError::new(DriverErrorKind::Internal)
                .with_hint(format!("failed to ensure profile dir: {err}"))
        })?;

        let mut builder = BrowserConfig::builder()
            .request_timeout(Duration::from_millis(cfg.command_deadline_ms))
            .launch_timeout(Duration::from_secs(20));

        if !cfg.headless {
            builder = builder.with_head();
        }

        if std::env::var("REELFORGE_DISABLE_SANDBOX")
            .map(|v| v != "0" && v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
        {
            builder = builder.no_sandbox();
        }

        // The service fingerprints automation; keep the launch profile close
        // to a stock desktop browser.
        let mut args = vec![
            "--disable-blink-features=AutomationControlled",
            "--disable-background-networking",
            "--disable-background-timer-throttling",
            "--disable-breakpad",
            "--disable-component-update",
            "--disable-default-apps",
            "--disable-dev-shm-usage",
            "--disable-extensions",
            "--disable-hang-monitor",
            "--disable-popup-blocking",
            "--disable-sync",
            "--no-first-run",
            "--no-default-browser-check",
            "--password-store=basic",
            "--remote-allow-origins=*",
        ];
        if cfg.headless {
            args.push("--headless=new");
            args.push("--hide-scrollbars");
            args.push("--mute-audio");
        }
        builder = builder.args(args);

        if !cfg.executable.as_os_str().is_empty() {
            builder = builder.chrome_executable(cfg.executable.clone());
        }
        builder = builder.user_data_dir(profile_dir);

        builder.build().map_err(|err| {
            DriverError::new(DriverErrorKind::Internal)
                .with_hint(format!("browser config error: {err}"))
        })
    }

    async fn launch_browser(config: BrowserConfig) -> Result<(Option<Child>, String), DriverError> {
        let mut child = config.launch().map_err(|err| {
            DriverError::new(DriverErrorKind::NoBrowser)
                .with_hint(format!("failed to launch chromium: {err}"))
        })?;

        let ws_url = extract_ws_url(&mut child)
            .await
            .map_err(|err| DriverError::new(DriverErrorKind::CdpIo).with_hint(err.to_string()))?;

        Ok((Some(child), ws_url))
    }

}

type Waiter = oneshot::Sender<Result<Value, DriverError>>;

/// The single task that owns the wire: commands go out, responses resolve
/// their waiters, events fan out to the consumer channel. When the wire dies
/// every waiter is failed with the same error so callers never hang.
struct Pump {
    conn: Connection<CdpEventMessage>,
    inflight: HashMap<CallId, Waiter>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl Pump {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<PendingCommand>,
    ) -> Result<(), DriverError> {
        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => self.submit(cmd)?,
                message = self.conn.next() => match message {
                    Some(Ok(message)) => {
                        if !self.relay(message).await {
                            debug!(target: "cdp-driver", "event consumer gone; pump exiting");
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => return Err(self.fail_inflight(map_cdp_error(err))),
                    None => {
                        self.fail_inflight(
                            DriverError::new(DriverErrorKind::CdpIo)
                                .with_hint("cdp connection closed"),
                        );
                        return Ok(());
                    }
                },
            }
        }
    }

    fn submit(&mut self, cmd: PendingCommand) -> Result<(), DriverError> {
        let session = match cmd.target {
            CommandTarget::Browser => None,
            CommandTarget::Session(session_id) => Some(CdpSessionId::from(session_id)),
        };
        let method: MethodId = cmd.method.into();

        match self.conn.submit_command(method, session, cmd.params) {
            Ok(call_id) => {
                self.inflight.insert(call_id, cmd.responder);
                Ok(())
            }
            Err(err) => {
                let mapped = DriverError::new(DriverErrorKind::CdpIo).with_hint(err.to_string());
                let _ = cmd.responder.send(Err(mapped.clone()));
                Err(mapped)
            }
        }
    }

    /// Returns false once the event consumer is gone and pumping is pointless.
    async fn relay(&mut self, message: Message<CdpEventMessage>) -> bool {
        match message {
            Message::Response(resp) => {
                if let Some(waiter) = self.inflight.remove(&resp.id) {
                    let _ = waiter.send(unpack_response(resp));
                }
                true
            }
            Message::Event(event) => match decode_event(event) {
                Ok(payload) => self.events_tx.send(payload).await.is_ok(),
                Err(err) => {
                    warn!(target: "cdp-driver", ?err, "undecodable cdp event dropped");
                    true
                }
            },
        }
    }

    fn fail_inflight(&mut self, err: DriverError) -> DriverError {
        for (_, waiter) in self.inflight.drain() {
            let _ = waiter.send(Err(err.clone()));
        }
        err
    }
}

fn decode_event(event: CdpEventMessage) -> Result<TransportEvent, DriverError> {
    let raw: CdpJsonEventMessage = event.try_into().map_err(|err| {
        DriverError::new(DriverErrorKind::Internal)
            .with_hint(format!("cdp event decode failed: {err}"))
    })?;

    Ok(TransportEvent {
        method: raw.method.into_owned(),
        params: raw.params,
        session_id: raw.session_id,
    })
}

fn unpack_response(resp: Response) -> Result<Value, DriverError> {
    match (resp.result, resp.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(DriverError::new(DriverErrorKind::CdpIo)
            .with_hint(format!("cdp error {}: {}", error.code, error.message))
            .retriable(error.code >= 500)),
        (None, None) => {
            Err(DriverError::new(DriverErrorKind::Internal).with_hint("empty cdp response"))
        }
    }
}

fn map_cdp_error(err: CdpError) -> DriverError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => DriverError::new(DriverErrorKind::NavTimeout)
            .with_hint(hint)
            .retriable(true),
        CdpError::JavascriptException(_) | CdpError::Serde(_) | CdpError::FrameNotFound(_) => {
            DriverError::new(DriverErrorKind::Internal).with_hint(hint)
        }
        _ => DriverError::new(DriverErrorKind::CdpIo)
            .with_hint(hint)
            .retriable(true),
    }
}

impl Drop for ConnState {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.pump_task.abort();

        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(err) = child.kill().await {
                            warn!(target: "cdp-driver", ?err, "failed to kill chromium child");
                        }
                    });
                } else {
                    debug!(target: "cdp-driver", "no runtime available to kill chromium child");
                }
            }
        }
    }
}

/// Extract the DevTools websocket URL from Chromium's stderr banner.
async fn extract_ws_url(child: &mut Child) -> anyhow::Result<String> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("chromium stderr was not captured"))?;
    let mut lines = BufReader::new(stderr).lines();

    let scan = async {
        let mut preview = String::new();
        while let Some(line) = lines.next().await {
            let line = line?;
            if let Some(ws) = devtools_url_in(&line) {
                return Ok(ws.to_string());
            }
            if preview.len() < 512 {
                preview.push_str(&line);
                preview.push('\n');
            }
        }
        Err(anyhow!(
            "chromium exited before announcing its devtools endpoint; stderr began:\n{preview}"
        ))
    };

    timeout(Duration::from_secs(20), scan)
        .await
        .map_err(|_| anyhow!("timed out waiting for the devtools endpoint"))?
}

fn devtools_url_in(line: &str) -> Option<&str> {
    let (_, rest) = line.rsplit_once("listening on ")?;
    let ws = rest.trim();
    (ws.starts_with("ws") && ws.contains("devtools/browser")).then_some(ws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tokio::sync::Mutex as TokioMutex;

    impl ConnState {
        fn test_stub() -> (Arc<Self>, Arc<AtomicBool>) {
            let (command_tx, _command_rx) = mpsc::channel(8);
            let (_events_tx, events_rx) = mpsc::channel(8);
            let alive = Arc::new(AtomicBool::new(true));
            let pump_alive = alive.clone();
            let pump_task = tokio::spawn(async move {
                futures::future::pending::<()>().await;
                pump_alive.store(false, Ordering::Relaxed);
            });

            (
                Arc::new(Self {
                    command_tx,
                    events_rx: Mutex::new(events_rx),
                    pump_task,
                    child: Mutex::new(None),
                    alive: alive.clone(),
                }),
                alive,
            )
        }
    }

    #[tokio::test]
    async fn recreates_connection_when_dead() {
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let alive_flags = Arc::new(TokioMutex::new(Vec::<Arc<AtomicBool>>::new()));

        let factory: ConnFactory = {
            let spawn_count = spawn_count.clone();
            let alive_flags = alive_flags.clone();
            Arc::new(move |cfg: DriverConfig| {
                let spawn_count = spawn_count.clone();
                let alive_flags = alive_flags.clone();
                Box::pin(async move {
                    let _ = cfg;
                    spawn_count.fetch_add(1, AtomicOrdering::SeqCst);
                    let (state, alive) = ConnState::test_stub();
                    alive_flags.lock().await.push(alive);
                    Ok(state)
                })
            })
        };

        let transport = ChromiumTransport::with_factory(DriverConfig::default(), factory);

        let first = transport.conn().await.expect("first connection");
        assert_eq!(spawn_count.load(AtomicOrdering::SeqCst), 1);

        {
            let guard = alive_flags.lock().await;
            guard[0].store(false, AtomicOrdering::SeqCst);
        }

        let first_again = first.clone();
        drop(first);

        let second = transport.conn().await.expect("second connection");
        assert_eq!(spawn_count.load(AtomicOrdering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first_again, &second));
    }

    #[tokio::test]
    async fn noop_transport_rejects_commands() {
        let transport = NoopTransport;
        let err = transport
            .send_command(CommandTarget::Browser, "Page.navigate", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, DriverErrorKind::NoBrowser));
        assert!(transport.mode().is_stub());
    }
}
