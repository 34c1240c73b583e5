//! End-to-end orchestrator tests over a scripted driver.
//!
//! The mock driver answers every capability call without a browser: locator
//! resolution always succeeds, the generate click can be scripted to fail N
//! times, page scans surface the artifact URL once generation "happened", and
//! the in-page fetch returns a configurable payload.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use artifact_watch::{ArtifactRef, ResponseSighting};
use cdp_driver::{
    driver::CookieParam, Driver, DriverError, DriverErrorKind, DriverMode, Locator,
    ResolvedElement,
};
use reelforge_cli::progress::{NullSink, ProgressEvent};
use reelforge_cli::{
    ConversionRequest, ForgeConfig, GenerationParams, InputSource, Pipeline,
};

/// Each successful generate click surfaces a distinct artifact URL, so a
/// later wait's exclusion snapshot only hides the earlier artifacts.
fn artifact_url(n: u32) -> String {
    format!("https://assets.grok.com/jobs/{n}/generated_video.mp4?sig=t")
}

struct MockDriver {
    sightings: broadcast::Sender<ResponseSighting>,
    /// Generate clicks that fail before one succeeds.
    fail_generate: AtomicU32,
    /// In-page fetches that fail before one succeeds.
    fail_fetch: AtomicU32,
    generate_count: AtomicU32,
    fetch_calls: AtomicU32,
    fetch_payload: Vec<u8>,
    fresh_pages: AtomicU32,
    /// Every click target, in order.
    clicks: parking_lot::Mutex<Vec<String>>,
}

impl MockDriver {
    fn new(fail_generate: u32, fetch_payload: Vec<u8>) -> Arc<Self> {
        let (sightings, _) = broadcast::channel(16);
        Arc::new(Self {
            sightings,
            fail_generate: AtomicU32::new(fail_generate),
            fail_fetch: AtomicU32::new(0),
            generate_count: AtomicU32::new(0),
            fetch_calls: AtomicU32::new(0),
            fetch_payload,
            fresh_pages: AtomicU32::new(0),
            clicks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn fresh_pages(&self) -> u32 {
        self.fresh_pages.load(Ordering::SeqCst)
    }

    fn clicks(&self) -> Vec<String> {
        self.clicks.lock().clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn start(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn navigate(&self, _url: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn fresh_page(&self, _url: &str) -> Result<(), DriverError> {
        self.fresh_pages.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok("https://grok.com/imagine".to_string())
    }

    async fn resolve(&self, _locator: &Locator) -> Result<Option<ResolvedElement>, DriverError> {
        Ok(Some(ResolvedElement {
            strategy: "css".to_string(),
            x: 10.0,
            y: 10.0,
        }))
    }

    async fn click(&self, locator: &Locator) -> Result<ResolvedElement, DriverError> {
        self.clicks.lock().push(locator.target.clone());
        if locator.target == "generate button" {
            let remaining = self.fail_generate.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_generate.store(remaining - 1, Ordering::SeqCst);
                return Err(DriverError::new(DriverErrorKind::TargetNotFound)
                    .with_hint("scripted generate failure")
                    .retriable(true));
            }
            self.generate_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(ResolvedElement {
            strategy: "css".to_string(),
            x: 10.0,
            y: 10.0,
        })
    }

    async fn set_value(&self, _locator: &Locator, _value: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn upload_file(&self, _locator: &Locator, _path: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, DriverError> {
        if expression.contains("fetch(") {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.fail_fetch.load(Ordering::SeqCst);
            if failing > 0 {
                self.fail_fetch.store(failing - 1, Ordering::SeqCst);
                return Ok(json!({ "error": "scripted transfer failure" }));
            }
            let data = base64::engine::general_purpose::STANDARD.encode(&self.fetch_payload);
            return Ok(json!({ "data": data }));
        }
        if expression.contains("data-video-url") {
            // The poll-channel page scan: every artifact produced so far.
            let count = self.generate_count.load(Ordering::SeqCst);
            let urls: Vec<String> = (1..=count).map(artifact_url).collect();
            return Ok(json!(urls));
        }
        Ok(Value::Null)
    }

    async fn page_content(&self) -> Result<String, DriverError> {
        Ok(String::new())
    }

    async fn capture_download(&self, _locator: &Locator) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    async fn screenshot(&self, _path: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn set_cookies(&self, _cookies: &[CookieParam]) -> Result<(), DriverError> {
        Ok(())
    }

    fn subscribe_responses(&self) -> broadcast::Receiver<ResponseSighting> {
        self.sightings.subscribe()
    }

    fn mode(&self) -> DriverMode {
        DriverMode::Stub
    }
}

fn test_config(scratch: &std::path::Path, min_artifact_bytes: u64) -> ForgeConfig {
    let mut cfg = ForgeConfig::default();
    cfg.service.cookies.sso = "test-token".to_string();
    cfg.watch.timeout_ms = 2_000;
    cfg.watch.min_wait_ms = 0;
    cfg.watch.blob_accept_after_ms = 0;
    cfg.watch.poll_interval_ms = 20;
    cfg.retry.download_retry_delay_ms = 10;
    cfg.retry.attempt_pause_ms = 10;
    cfg.retry.batch_item_delay_ms = 10;
    cfg.download.min_artifact_bytes = min_artifact_bytes;
    cfg.download.scratch_dir = scratch.join("scratch");
    cfg
}

fn prompt_request(dest: PathBuf) -> ConversionRequest {
    ConversionRequest {
        input: InputSource::Prompt("a lighthouse in a storm".to_string()),
        output_path: dest,
        params: GenerationParams::default(),
    }
}

#[tokio::test]
async fn successful_conversion_saves_a_plausible_file() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.mp4");
    let driver = MockDriver::new(0, vec![7u8; 200]);
    let pipeline = Pipeline::new(test_config(dir.path(), 100), driver.clone());

    let result = pipeline.convert(&prompt_request(dest.clone()), &NullSink).await;
    pipeline.shutdown().await;

    assert!(result.success);
    assert_eq!(result.attempts, 1);
    assert!(!result.download_failed);
    assert_eq!(result.artifact, Some(ArtifactRef::Url(artifact_url(1))));
    let written = std::fs::metadata(&dest).unwrap().len();
    assert!(written >= 100);
}

#[tokio::test]
async fn candidate_is_held_until_the_minimum_wait_floor() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.mp4");
    let driver = MockDriver::new(0, vec![7u8; 200]);
    let mut cfg = test_config(dir.path(), 100);
    cfg.watch.min_wait_ms = 300;
    let pipeline = Pipeline::new(cfg, driver.clone());

    // The artifact is visible to the page scan almost immediately after the
    // generate click; the floor must still gate it.
    let started = Instant::now();
    let result = pipeline.convert(&prompt_request(dest), &NullSink).await;
    pipeline.shutdown().await;

    assert!(result.success);
    assert!(
        started.elapsed() >= Duration::from_millis(300),
        "artifact surfaced before the floor elapsed"
    );
}

#[tokio::test]
async fn image_inputs_select_video_mode_before_generating() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("frame.png");
    std::fs::write(&input, vec![0u8; 64]).unwrap();

    let driver = MockDriver::new(0, vec![7u8; 200]);
    let pipeline = Pipeline::new(test_config(dir.path(), 100), driver.clone());

    let request = ConversionRequest {
        input: InputSource::Image(input),
        output_path: dir.path().join("out.mp4"),
        params: GenerationParams::default(),
    };
    let result = pipeline.convert(&request, &NullSink).await;
    pipeline.shutdown().await;

    assert!(result.success);
    // The surface defaults to image mode; skipping the toggle would generate
    // a still and the video wait would never match it.
    let clicks = driver.clicks();
    let toggle_at = clicks.iter().position(|c| c == "video mode toggle");
    let generate_at = clicks.iter().position(|c| c == "generate button");
    assert!(
        toggle_at.is_some() && toggle_at < generate_at,
        "video mode must be selected before generating; clicks were: {clicks:?}"
    );
}

#[tokio::test]
async fn failed_cold_start_surfaces_the_authentication_error() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::new(0, vec![7u8; 200]);
    let mut cfg = test_config(dir.path(), 100);
    cfg.service.cookies.sso = String::new();
    let pipeline = Pipeline::new(cfg, driver.clone());

    let result = pipeline
        .convert(&prompt_request(dir.path().join("out.mp4")), &NullSink)
        .await;
    pipeline.shutdown().await;

    assert!(!result.success);
    let error = result.error.expect("a failed conversion carries its error");
    assert!(
        error.contains("cookie"),
        "the credential failure must survive the abort, got: {error}"
    );
}

#[tokio::test]
async fn undersized_payload_is_download_failure_with_preserved_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.mp4");
    // 10-byte payload against a 1000-byte plausibility threshold.
    let driver = MockDriver::new(0, vec![7u8; 10]);
    let pipeline = Pipeline::new(test_config(dir.path(), 1_000), driver.clone());

    let result = pipeline.convert(&prompt_request(dest.clone()), &NullSink).await;
    pipeline.shutdown().await;

    assert!(!result.success);
    assert!(result.download_failed);
    assert!(result.artifact.is_some(), "artifact reference must survive");
    assert_eq!(result.attempts, 1, "download failure must not re-generate");
    assert_eq!(driver.fetch_calls(), 3, "download manager retries exactly 3 times");
    assert!(!dest.exists(), "undersized file must be removed from disk");
}

#[tokio::test]
async fn transfer_retries_recover_within_the_download_cap() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.mp4");
    let driver = MockDriver::new(0, vec![7u8; 200]);
    driver.fail_fetch.store(2, Ordering::SeqCst);
    let pipeline = Pipeline::new(test_config(dir.path(), 100), driver.clone());

    let result = pipeline.convert(&prompt_request(dest.clone()), &NullSink).await;
    pipeline.shutdown().await;

    assert!(result.success, "third fetch succeeds within the cap of 3");
    assert!(!result.download_failed);
    assert_eq!(result.attempts, 1, "transfer failures never re-generate");
    assert_eq!(driver.fetch_calls(), 3, "two failures then the success");
    assert!(dest.exists());
}

#[tokio::test]
async fn recoverable_submission_failures_consume_attempts_then_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.mp4");
    let driver = MockDriver::new(2, vec![7u8; 200]);
    let pipeline = Pipeline::new(test_config(dir.path(), 100), driver.clone());

    let result = pipeline.convert(&prompt_request(dest), &NullSink).await;
    pipeline.shutdown().await;

    assert!(result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(driver.fresh_pages(), 2, "each failed attempt recovers the page");
}

#[tokio::test]
async fn exhausted_attempts_yield_a_terminal_failure() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.mp4");
    let driver = MockDriver::new(10, vec![7u8; 200]);
    let pipeline = Pipeline::new(test_config(dir.path(), 100), driver.clone());

    let terminal_seen = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&terminal_seen);
    let sink = move |event: ProgressEvent| {
        if event.is_terminal_failure() {
            flag.store(true, Ordering::SeqCst);
        }
    };

    let result = pipeline.convert(&prompt_request(dest.clone()), &sink).await;
    pipeline.shutdown().await;

    assert!(!result.success);
    assert!(!result.download_failed);
    assert_eq!(result.attempts, 3, "attempts stop at the retry limit");
    assert!(result.error.is_some());
    assert!(terminal_seen.load(Ordering::SeqCst), "terminal -1 must be emitted");
    assert!(!dest.exists());
}

#[tokio::test]
async fn batch_truncates_when_the_session_stops_mid_run() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::new(0, vec![7u8; 200]);
    let pipeline = Arc::new(Pipeline::new(test_config(dir.path(), 100), driver.clone()));

    let input = dir.path().join("frame.png");
    std::fs::write(&input, vec![0u8; 64]).unwrap();

    let items: Vec<ConversionRequest> = (0..3)
        .map(|i| ConversionRequest {
            input: InputSource::Image(input.clone()),
            output_path: dir.path().join(format!("out_{i}.mp4")),
            params: GenerationParams::default(),
        })
        .collect();

    // Stop the session the moment the second item completes.
    let completed = Arc::new(AtomicU32::new(0));
    let canceller = {
        let pipeline = Arc::clone(&pipeline);
        let completed = Arc::clone(&completed);
        move |event: ProgressEvent| {
            if event.stage.ends_with("complete") {
                let n = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 2 {
                    pipeline.session().cancel_token().cancel();
                }
            }
        }
    };

    let results = pipeline.convert_batch(&items, &canceller).await;
    pipeline.shutdown().await;

    assert_eq!(results.len(), 2, "third item must never be attempted");
    assert!(results.iter().all(|r| r.success));
}

#[tokio::test]
async fn batch_progress_maps_items_into_the_overall_scale() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::new(0, vec![7u8; 200]);
    let pipeline = Pipeline::new(test_config(dir.path(), 100), driver.clone());

    let input = dir.path().join("frame.png");
    std::fs::write(&input, vec![0u8; 64]).unwrap();

    let items: Vec<ConversionRequest> = (0..2)
        .map(|i| ConversionRequest {
            input: InputSource::Image(input.clone()),
            output_path: dir.path().join(format!("out_{i}.mp4")),
            params: GenerationParams::default(),
        })
        .collect();

    let percents = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = {
        let percents = Arc::clone(&percents);
        move |event: ProgressEvent| {
            percents.lock().push(event.percent);
        }
    };

    let results = pipeline.convert_batch(&items, &sink).await;
    pipeline.shutdown().await;

    assert_eq!(results.len(), 2);
    let seen = percents.lock();
    // Non-terminal percents never regress across the batch.
    let forward: Vec<i8> = seen.iter().copied().filter(|p| *p >= 0).collect();
    assert!(forward.windows(2).all(|w| w[0] <= w[1]), "overall percent regressed: {forward:?}");
    assert_eq!(*forward.last().unwrap(), 100);
}
