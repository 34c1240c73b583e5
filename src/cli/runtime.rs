//! Process wiring: logging, configuration layering, driver construction.

use std::sync::Arc;

use anyhow::Context;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cdp_driver::{
    transport::{CdpTransport, ChromiumTransport, NoopTransport},
    CdpDriver, Driver,
};

use crate::config::ForgeConfig;
use crate::progress::{ProgressEvent, ProgressSink};

use super::Cli;

/// `RUST_LOG` wins; otherwise the CLI flags pick the default level. Output
/// goes to stderr so stdout stays parseable JSON.
pub fn init_logging(cli: &Cli) {
    let default_level = if cli.debug {
        "debug"
    } else {
        cli.log_level.as_deref().unwrap_or("info")
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn load_config(cli: &Cli) -> anyhow::Result<ForgeConfig> {
    let mut cfg = ForgeConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if cli.headful {
        cfg.driver.headless = false;
    }
    if let Some(timeout) = cli.timeout {
        cfg.watch.timeout_ms = timeout.as_millis() as u64;
    }
    Ok(cfg)
}

/// Real transport when a browser is reachable, stub otherwise. The stub keeps
/// commands like `validate` honest about why nothing works.
pub fn build_driver(cfg: &ForgeConfig) -> Arc<dyn Driver> {
    let launchable = cfg.driver.websocket_url.is_some()
        || (!cfg.driver.executable.as_os_str().is_empty() && cfg.driver.executable.exists());

    let transport: Arc<dyn CdpTransport> = if launchable {
        Arc::new(ChromiumTransport::new(cfg.driver.clone()))
    } else {
        warn!(
            target: "reelforge",
            "no chrome executable found; running with the stub transport (set REELFORGE_CHROME)"
        );
        Arc::new(NoopTransport)
    };

    Arc::new(CdpDriver::new(cfg.driver.clone(), transport))
}

/// Renders progress to stderr, one line per stage.
pub struct StderrSink;

impl ProgressSink for StderrSink {
    fn emit(&self, event: ProgressEvent) {
        if event.is_terminal_failure() {
            eprintln!("[ -- ] {}", event.stage);
        } else {
            eprintln!("[{:>3}%] {}", event.percent, event.stage);
        }
    }
}
