//! Conversion orchestration.
//!
//! The pipeline owns the attempt loop and is the only place errors are mapped
//! to continue/terminal decisions. Generation failures consume attempts and
//! recover the page; a download failure after a successful generation is
//! terminal and keeps the artifact reference, because regenerating cannot fix
//! a transfer problem and would burn quota.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use artifact_watch::{ArtifactMatcher, ArtifactRef, ArtifactWatcher, WatchBudget};
use cdp_driver::Driver;

use crate::config::{ForgeConfig, WatchConfig};
use crate::download::DownloadManager;
use crate::errors::ConvertError;
use crate::progress::{stages, ProgressEvent, ProgressSink, PERCENT_FAILED};
use crate::session::{media_kind, SessionManager};
use crate::{submit, ConversionRequest, ConversionResult, GenerationMode, InputSource};

/// Orchestrator state, for logs. Transitions are linear within an attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Idle,
    Starting,
    Submitting,
    AwaitingGeneration,
    Downloading,
    Complete,
    Failed,
}

pub struct Pipeline {
    cfg: Arc<ForgeConfig>,
    session: SessionManager,
    downloads: DownloadManager,
}

impl Pipeline {
    pub fn new(cfg: ForgeConfig, driver: Arc<dyn Driver>) -> Self {
        let cfg = Arc::new(cfg);
        let downloads = DownloadManager::new(
            Arc::clone(&driver),
            cfg.download.min_artifact_bytes,
            Duration::from_millis(cfg.retry.download_retry_delay_ms),
        );
        let session = SessionManager::new(Arc::clone(&cfg), driver);
        Self {
            cfg,
            session,
            downloads,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub async fn shutdown(&self) {
        self.session.stop().await;
    }

    /// Run one conversion end to end.
    pub async fn convert(
        &self,
        request: &ConversionRequest,
        sink: &dyn ProgressSink,
    ) -> ConversionResult {
        self.trace(Stage::Idle);
        let retry_limit = self.cfg.retry.retry_limit.max(1);
        let mut attempts = 0u32;
        let mut last_error: Option<ConvertError> = None;

        while attempts < retry_limit {
            // A session that died mid-conversion is not silently restarted;
            // only the first attempt may cold-start.
            if attempts > 0 && !self.session.is_running() {
                warn!(target: "reelforge", attempts, "session no longer live; aborting conversion");
                self.trace(Stage::Failed);
                sink.emit(ProgressEvent::new("failed", PERCENT_FAILED));
                // The failure that killed the session (a rejected cookie, a
                // dead browser) is the real diagnosis, not the abort itself.
                let message = last_error.take().map(|err| err.to_string()).unwrap_or_else(|| {
                    "session stopped before the conversion could continue".to_string()
                });
                return ConversionResult::failed(request.output_path.clone(), attempts, message);
            }

            attempts += 1;
            debug!(target: "reelforge", attempt = attempts, retry_limit, "starting attempt");

            match self.run_attempt(request, sink, attempts).await {
                Ok(artifact) => {
                    self.trace(Stage::Downloading);
                    sink.emit(ProgressEvent::new(stages::DOWNLOADING.0, stages::DOWNLOADING.1));

                    let transferred = self
                        .downloads
                        .fetch_with_retry(
                            &artifact,
                            &request.output_path,
                            self.cfg.retry.download_retries,
                        )
                        .await;

                    if transferred {
                        self.trace(Stage::Complete);
                        sink.emit(ProgressEvent::new(stages::COMPLETE.0, stages::COMPLETE.1));
                        return ConversionResult {
                            success: true,
                            artifact: Some(artifact),
                            output_path: request.output_path.clone(),
                            error: None,
                            attempts,
                            download_failed: false,
                        };
                    }

                    // Terminal: the artifact exists on the service side, so
                    // the reference is preserved for a standalone re-download.
                    self.trace(Stage::Failed);
                    sink.emit(ProgressEvent::new("download failed", PERCENT_FAILED));
                    return ConversionResult {
                        success: false,
                        artifact: Some(artifact),
                        output_path: request.output_path.clone(),
                        error: Some("artifact generated but download failed".to_string()),
                        attempts,
                        download_failed: true,
                    };
                }
                Err(err) => {
                    let retry = err.consumes_attempt() && attempts < retry_limit;
                    warn!(
                        target: "reelforge",
                        attempt = attempts,
                        %err,
                        retry,
                        "attempt failed"
                    );
                    last_error = Some(err);
                    if !retry {
                        break;
                    }
                    sleep(Duration::from_millis(self.cfg.retry.attempt_pause_ms)).await;
                }
            }
        }

        self.trace(Stage::Failed);
        sink.emit(ProgressEvent::new("failed", PERCENT_FAILED));
        let message = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "conversion failed".to_string());
        ConversionResult::failed(request.output_path.clone(), attempts, message)
    }

    /// Sequential batch over one shared session. Liveness is checked before
    /// each item; a stopped session truncates the batch rather than erroring
    /// the remaining items.
    pub async fn convert_batch(
        &self,
        items: &[ConversionRequest],
        sink: &dyn ProgressSink,
    ) -> Vec<ConversionResult> {
        let total = items.len();
        let mut results = Vec::with_capacity(total);

        for (index, item) in items.iter().enumerate() {
            if index > 0 && !self.session.is_running() {
                warn!(
                    target: "reelforge",
                    completed = results.len(),
                    total,
                    "session no longer live; truncating batch"
                );
                break;
            }

            info!(target: "reelforge", item = index + 1, total, "batch item starting");
            let item_sink = BatchItemSink { inner: sink, index, total };
            results.push(self.convert(item, &item_sink).await);

            if index + 1 < total {
                sleep(Duration::from_millis(self.cfg.retry.batch_item_delay_ms)).await;
            }
        }

        results
    }

    /// Prompt-only convenience: derive the output name from the configured
    /// pattern and run a regular conversion.
    pub async fn text_to_video(
        &self,
        prompt: &str,
        out_dir: &Path,
        params: crate::GenerationParams,
        sink: &dyn ProgressSink,
    ) -> ConversionResult {
        let filename = render_output_name(&self.cfg.output.naming_pattern, prompt);
        let request = ConversionRequest {
            input: InputSource::Prompt(prompt.to_string()),
            output_path: out_dir.join(filename),
            params,
        };
        self.convert(&request, sink).await
    }

    async fn run_attempt(
        &self,
        request: &ConversionRequest,
        sink: &dyn ProgressSink,
        attempt: u32,
    ) -> Result<ArtifactRef, ConvertError> {
        if !self.session.is_running() {
            // Cold start.
            self.trace(Stage::Starting);
            sink.emit(ProgressEvent::new(stages::STARTING.0, stages::STARTING.1));
            self.session.start().await?;
        } else {
            // Warm path: shed whatever UI state the previous attempt or item
            // left behind before submitting again.
            self.session.recover_to_entry().await;
        }
        sink.emit(ProgressEvent::new(stages::SESSION_READY.0, stages::SESSION_READY.1));

        // Captured before submission so the new artifact is the only novelty.
        let exclusions = self.session.snapshot_exclusions(request.params.mode).await;

        self.trace(Stage::Submitting);
        sink.emit(ProgressEvent::new(stages::SUBMITTING.0, stages::SUBMITTING.1));
        let driver: &dyn Driver = self.session.driver().as_ref();

        // The surface comes up in image mode; an unselected mode generates
        // the wrong artifact kind and the wait never matches it.
        submit::select_mode(driver, request.params.mode == GenerationMode::Video).await?;

        match &request.input {
            InputSource::Image(path) => {
                submit::upload_image(driver, path).await?;
                if let Some(prompt) = &request.params.prompt {
                    submit::enter_prompt(driver, prompt).await?;
                }
            }
            InputSource::Prompt(prompt) => {
                if let Some(ratio) = &request.params.aspect_ratio {
                    submit::select_aspect_ratio(driver, ratio).await?;
                }
                submit::enter_prompt(driver, prompt).await?;
            }
        }

        submit::trigger_generation(driver).await?;
        sink.emit(ProgressEvent::new(stages::SUBMITTED.0, stages::SUBMITTED.1));

        self.trace(Stage::AwaitingGeneration);
        sink.emit(ProgressEvent::new(stages::AWAITING.0, stages::AWAITING.1));

        let budget = wait_budget(&self.cfg.watch, request.params.mode);
        let matcher = ArtifactMatcher::new(
            media_kind(request.params.mode),
            self.cfg.service.marker.clone(),
        );
        let watcher = ArtifactWatcher::new(matcher, self.session.cancel_token());
        let events = driver.subscribe_responses();
        let probe = self.session.probe(request.params.mode);

        match watcher
            .wait_for_artifact(events, &probe, budget, &exclusions)
            .await
        {
            Some(artifact) => {
                info!(target: "reelforge", %artifact, "artifact detected");
                Ok(artifact)
            }
            None => {
                self.session
                    .capture_diagnostic(&format!("timeout_attempt_{attempt}"))
                    .await;
                Err(ConvertError::GenerationTimeout {
                    waited_s: budget.timeout.as_secs(),
                })
            }
        }
    }

    fn trace(&self, stage: Stage) {
        debug!(target: "reelforge", ?stage, "stage");
    }
}

/// Maps a single item's progress into the batch-wide scale; the terminal
/// sentinel passes through untouched.
struct BatchItemSink<'a> {
    inner: &'a dyn ProgressSink,
    index: usize,
    total: usize,
}

impl ProgressSink for BatchItemSink<'_> {
    fn emit(&self, event: ProgressEvent) {
        let stage = format!("item {}/{}: {}", self.index + 1, self.total, event.stage);
        let percent = if event.percent < 0 {
            event.percent
        } else {
            ((self.index * 100 + event.percent as usize) / self.total.max(1)) as i8
        };
        self.inner.emit(ProgressEvent::new(stage, percent));
    }
}

/// Still images surface faster than video and never produce a blob handle
/// worth waiting out, so their wait gets the tighter envelope.
fn wait_budget(watch: &WatchConfig, mode: GenerationMode) -> WatchBudget {
    match mode {
        GenerationMode::Video => watch.budget(),
        GenerationMode::Image => WatchBudget::for_images(),
    }
}

/// `{prompt}` becomes a filesystem-safe slug, capped at 50 bytes, with runs
/// of separators collapsed to one underscore and no trailing underscore;
/// `{timestamp}` is UTC `YYYYmmdd_HHMMSS`. The `.mp4` extension is enforced.
fn render_output_name(pattern: &str, prompt: &str) -> String {
    let mut slug = String::new();
    for c in prompt.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
        if slug.len() >= 50 {
            break;
        }
    }
    let slug = slug.trim_end_matches('_');
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

    let mut name = pattern
        .replace("{prompt}", slug)
        .replace("{timestamp}", &timestamp);
    if !name.to_ascii_lowercase().ends_with(".mp4") {
        name.push_str(".mp4");
    }
    name
}
