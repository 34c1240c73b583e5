//! Configuration layering.
//!
//! Defaults in code, overridden by a YAML file (`./config/reelforge.yaml`,
//! then the platform config dir), overridden by `REELFORGE_*` environment
//! variables. Every section has a `Default` so a missing file is never an
//! error; a missing session cookie is surfaced later, at session start.

use std::path::{Path, PathBuf};
use std::time::Duration;

use artifact_watch::WatchBudget;
use cdp_driver::config::DriverConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid service url: {0}")]
    ServiceUrl(String),
}

/// Top-level configuration for the pipeline.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub service: ServiceConfig,
    pub driver: DriverConfig,
    pub watch: WatchConfig,
    pub retry: RetryConfig,
    pub download: DownloadConfig,
    pub output: OutputConfig,
}

impl ForgeConfig {
    /// Load with file precedence: explicit path (required when given), then
    /// `./config/reelforge.yaml`, then `<config_dir>/reelforge/config.yaml`,
    /// with `REELFORGE_*` env vars layered on top
    /// (e.g. `REELFORGE_SERVICE__BASE_URL`).
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path.to_path_buf()));
        } else {
            builder = builder.add_source(File::from(Path::new("config/reelforge.yaml")).required(false));
            if let Some(dir) = dirs::config_dir() {
                builder = builder
                    .add_source(File::from(dir.join("reelforge/config.yaml")).required(false));
            }
        }

        builder = builder.add_source(Environment::with_prefix("REELFORGE").separator("__"));

        let cfg: ForgeConfig = builder.build()?.try_deserialize()?;
        cfg.service.entry_url()?;
        Ok(cfg)
    }
}

/// The external service being driven.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    /// Path of the generation surface under `base_url`.
    pub entry_path: String,
    /// Substring identifying the service's asset URLs, used by the artifact
    /// matcher to tell generated media from unrelated mp4s.
    pub marker: String,
    pub cookies: CookieConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://grok.com".to_string(),
            entry_path: "/imagine".to_string(),
            marker: "grok".to_string(),
            cookies: CookieConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn entry_url(&self) -> Result<Url, ConfigError> {
        let base = Url::parse(&self.base_url)
            .map_err(|err| ConfigError::ServiceUrl(format!("{}: {err}", self.base_url)))?;
        base.join(&self.entry_path)
            .map_err(|err| ConfigError::ServiceUrl(format!("{}: {err}", self.entry_path)))
    }
}

/// Session cookies restoring an authenticated state. The primary cookie is
/// mandatory at session start; the read-write variant is applied when present.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    pub sso: String,
    pub sso_rw: Option<String>,
    pub domain: String,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            sso: String::new(),
            sso_rw: None,
            domain: ".grok.com".to_string(),
        }
    }
}

/// Artifact-wait budget, in milliseconds for easy test scaling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub timeout_ms: u64,
    /// Floor below which no candidate is surfaced; early hits are the
    /// service echoing the input, not the result.
    pub min_wait_ms: u64,
    /// Separate, longer floor for in-context `blob:` candidates.
    pub blob_accept_after_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 180_000,
            min_wait_ms: 15_000,
            blob_accept_after_ms: 35_000,
            poll_interval_ms: 2_000,
        }
    }
}

impl WatchConfig {
    pub fn budget(&self) -> WatchBudget {
        WatchBudget {
            timeout: Duration::from_millis(self.timeout_ms),
            min_wait: Duration::from_millis(self.min_wait_ms),
            blob_accept_after: Duration::from_millis(self.blob_accept_after_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Retry policy. Generation retries and download retries are independent
/// knobs; downloads are never retried at the orchestrator level.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum generation attempts per conversion.
    pub retry_limit: u32,
    /// Fetch attempts inside the download manager.
    pub download_retries: u32,
    pub download_retry_delay_ms: u64,
    /// Pause before recovering the page after a failed attempt.
    pub attempt_pause_ms: u64,
    /// Pause between batch items.
    pub batch_item_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            download_retries: 3,
            download_retry_delay_ms: 2_000,
            attempt_pause_ms: 2_000,
            batch_item_delay_ms: 3_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Payloads below this are treated as corrupt and removed from disk.
    pub min_artifact_bytes: u64,
    /// Scratch area cleared when the session stops.
    pub scratch_dir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            min_artifact_bytes: 500_000,
            scratch_dir: PathBuf::from("./.reelforge-scratch"),
        }
    }
}

/// Output file naming for prompt-driven conversions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Supports `{prompt}` and `{timestamp}` placeholders.
    pub naming_pattern: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            naming_pattern: "{prompt}_{timestamp}.mp4".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = ForgeConfig::default();
        assert_eq!(cfg.retry.retry_limit, 3);
        assert_eq!(cfg.download.min_artifact_bytes, 500_000);
        let budget = cfg.watch.budget();
        assert_eq!(budget.min_wait, Duration::from_secs(15));
        assert_eq!(budget.blob_accept_after, Duration::from_secs(35));
        assert!(budget.blob_accept_after > budget.min_wait);
    }

    #[test]
    fn entry_url_joins_base_and_path() {
        let service = ServiceConfig::default();
        assert_eq!(service.entry_url().unwrap().as_str(), "https://grok.com/imagine");
    }

    #[test]
    fn bad_base_url_is_rejected() {
        let service = ServiceConfig {
            base_url: "not a url".into(),
            ..ServiceConfig::default()
        };
        assert!(service.entry_url().is_err());
    }
}
