//! Session lifecycle against the service.
//!
//! A session is an authenticated browser sitting on the generation surface.
//! Cookies restore authentication; navigation that lands on a login page
//! means the cookies are dead, and that is reported before any submission is
//! attempted. `stop` is best-effort and always completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use artifact_watch::{ArtifactMatcher, ExclusionSet, MediaKind, PageProbe, ProbeError};
use cdp_driver::{driver::CookieParam, Driver, Locator};

use crate::config::ForgeConfig;
use crate::errors::ConvertError;
use crate::submit;
use crate::GenerationMode;

const INPUT_SURFACE_DEADLINE: Duration = Duration::from_secs(10);
const INPUT_SURFACE_STEP: Duration = Duration::from_millis(500);

/// Snapshot returned by [`SessionManager::validate`].
#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub running: bool,
    pub url: String,
    pub driver_mode: String,
}

pub struct SessionManager {
    cfg: Arc<ForgeConfig>,
    driver: Arc<dyn Driver>,
    running: AtomicBool,
    cancel: RwLock<CancellationToken>,
}

impl SessionManager {
    pub fn new(cfg: Arc<ForgeConfig>, driver: Arc<dyn Driver>) -> Self {
        Self {
            cfg,
            driver,
            running: AtomicBool::new(false),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Liveness token for the current session epoch. Cancelled by [`stop`];
    /// waits in flight observe it at their next iteration boundary.
    ///
    /// [`stop`]: SessionManager::stop
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.cancel.read().is_cancelled()
    }

    /// Establish the session. Idempotent while running.
    pub async fn start(&self) -> Result<(), ConvertError> {
        if self.is_running() {
            return Ok(());
        }

        let cookies = &self.cfg.service.cookies;
        if cookies.sso.trim().is_empty() {
            return Err(ConvertError::Authentication(
                "no session cookie configured; set service.cookies.sso".to_string(),
            ));
        }

        *self.cancel.write() = CancellationToken::new();

        self.driver.start().await?;
        self.driver.set_cookies(&self.cookie_params()).await?;

        let entry = self
            .cfg
            .service
            .entry_url()
            .map_err(|err| ConvertError::Authentication(err.to_string()))?;
        info!(target: "reelforge", url = %entry, "opening generation surface");
        self.driver.navigate(entry.as_str()).await?;

        let landed = self.driver.current_url().await?;
        if looks_like_login(&landed) {
            self.capture_diagnostic("auth_failure").await;
            return Err(ConvertError::Authentication(format!(
                "redirected to login at {landed}; session cookies expired"
            )));
        }

        self.verify_input_surface().await?;

        self.running.store(true, Ordering::SeqCst);
        info!(target: "reelforge", "session established");
        Ok(())
    }

    /// Tear the session down. Never errors; close failures are logged and the
    /// scratch directory is cleared regardless.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!(target: "reelforge", "stop on idle session");
        }
        self.cancel.read().cancel();

        if let Err(err) = self.driver.shutdown().await {
            warn!(target: "reelforge", %err, "driver shutdown failed; continuing");
        }

        let scratch = &self.cfg.download.scratch_dir;
        match tokio::fs::remove_dir_all(scratch).await {
            Ok(()) => debug!(target: "reelforge", dir = %scratch.display(), "scratch cleared"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(target: "reelforge", %err, "failed to clear scratch dir"),
        }
    }

    /// Put the session back on the entry surface after a failed attempt. A
    /// fresh page is preferred over repairing the current one; falls back to
    /// plain navigation. Never errors.
    pub async fn recover_to_entry(&self) {
        let entry = match self.cfg.service.entry_url() {
            Ok(url) => url,
            Err(err) => {
                warn!(target: "reelforge", %err, "cannot recover: bad entry url");
                return;
            }
        };

        if let Err(err) = self.driver.fresh_page(entry.as_str()).await {
            warn!(target: "reelforge", %err, "fresh page failed; reloading in place");
            if let Err(err) = self.driver.navigate(entry.as_str()).await {
                warn!(target: "reelforge", %err, "recovery navigation failed too");
            }
        }
    }

    /// Start, report, stop. A connectivity/credential check for the CLI.
    pub async fn validate(&self) -> Result<SessionReport, ConvertError> {
        match self.start().await {
            Ok(()) => {
                let url = self.driver.current_url().await.unwrap_or_default();
                let report = SessionReport {
                    running: true,
                    url,
                    driver_mode: self.driver.mode().as_str().to_string(),
                };
                self.stop().await;
                Ok(report)
            }
            Err(err) => {
                self.stop().await;
                Err(err)
            }
        }
    }

    /// Artifact references already on the page before a wait begins.
    pub async fn snapshot_exclusions(&self, mode: GenerationMode) -> ExclusionSet {
        let probe = self.probe(mode);
        match probe.scan().await {
            Ok(urls) => {
                let set: ExclusionSet = urls.into_iter().collect();
                debug!(target: "reelforge", count = set.len(), "pre-existing artifacts excluded");
                set
            }
            Err(err) => {
                warn!(target: "reelforge", %err, "exclusion snapshot failed; using empty set");
                ExclusionSet::new()
            }
        }
    }

    pub fn probe(&self, mode: GenerationMode) -> DriverProbe {
        let video = mode == GenerationMode::Video;
        DriverProbe {
            driver: Arc::clone(&self.driver),
            script: scan_script(media_kind(mode)),
            markup: video
                .then(|| ArtifactMatcher::new(MediaKind::Video, self.cfg.service.marker.clone())),
            download_fallback: video.then(submit::download_button),
        }
    }

    /// Best-effort screenshot into the scratch dir for post-mortems.
    pub async fn capture_diagnostic(&self, label: &str) {
        let dir = &self.cfg.download.scratch_dir;
        if tokio::fs::create_dir_all(dir).await.is_err() {
            return;
        }
        let path = dir.join(format!("{label}.png"));
        if let Err(err) = self.driver.screenshot(&path.to_string_lossy()).await {
            debug!(target: "reelforge", %err, "diagnostic screenshot failed");
        }
    }

    fn cookie_params(&self) -> Vec<CookieParam> {
        let cookies = &self.cfg.service.cookies;
        let mut params = vec![CookieParam {
            name: "sso".to_string(),
            value: cookies.sso.clone(),
            domain: cookies.domain.clone(),
            path: "/".to_string(),
            secure: true,
            http_only: true,
            same_site: None,
        }];
        if let Some(rw) = &cookies.sso_rw {
            if !rw.trim().is_empty() {
                params.push(CookieParam {
                    name: "sso-rw".to_string(),
                    value: rw.clone(),
                    domain: cookies.domain.clone(),
                    path: "/".to_string(),
                    secure: true,
                    http_only: false,
                    same_site: None,
                });
            }
        }
        params
    }

    /// The page counts as ready once the prompt field resolves. Bounded wait;
    /// markup may still be hydrating right after navigation.
    async fn verify_input_surface(&self) -> Result<(), ConvertError> {
        let locator = submit::prompt_field();
        let deadline = Instant::now() + INPUT_SURFACE_DEADLINE;
        loop {
            if self.driver.resolve(&locator).await?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.capture_diagnostic("missing_input_surface").await;
                return Err(ConvertError::Authentication(
                    "generation surface did not expose an input field".to_string(),
                ));
            }
            sleep(INPUT_SURFACE_STEP).await;
        }
    }
}

pub(crate) fn media_kind(mode: GenerationMode) -> MediaKind {
    match mode {
        GenerationMode::Video => MediaKind::Video,
        GenerationMode::Image => MediaKind::Image,
    }
}

fn looks_like_login(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    ["/login", "/signin", "/sign-in", "/auth", "accounts."]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Poll-channel page scan over the live driver: collect every URL-ish string
/// on the page that could name an artifact. Matching happens in the watcher.
///
/// Three layers, cheapest first: a DOM script over player elements and
/// anchors, a markup trawl for serialized URLs the DOM never exposes, and as
/// a last resort a click on the download control with the triggered transfer
/// captured and cancelled by the driver.
pub struct DriverProbe {
    driver: Arc<dyn Driver>,
    script: String,
    markup: Option<ArtifactMatcher>,
    download_fallback: Option<Locator>,
}

#[async_trait]
impl PageProbe for DriverProbe {
    async fn scan(&self) -> Result<Vec<String>, ProbeError> {
        let value = self
            .driver
            .evaluate(&self.script)
            .await
            .map_err(|err| ProbeError::Scan(err.to_string()))?;
        let mut urls: Vec<String> = value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(matcher) = &self.markup {
            match self.driver.page_content().await {
                Ok(markup) => urls.extend(matcher.scan_markup(&markup)),
                Err(err) => debug!(target: "reelforge", %err, "markup scan skipped"),
            }
        }

        if urls.is_empty() {
            if let Some(button) = &self.download_fallback {
                match self.driver.capture_download(button).await {
                    Ok(Some(url)) => {
                        debug!(target: "reelforge", %url, "url learned from captured download");
                        urls.push(url);
                    }
                    Ok(None) => {}
                    Err(err) => debug!(target: "reelforge", %err, "download capture failed"),
                }
            }
        }

        Ok(urls)
    }
}

fn scan_script(kind: MediaKind) -> String {
    match kind {
        MediaKind::Video => VIDEO_SCAN.to_string(),
        MediaKind::Image => IMAGE_SCAN.to_string(),
    }
}

/// Video surfaces in several places depending on the service build: the
/// player element, a `<source>` child, data attributes on cards, and download
/// anchors. URLs living only in serialized markup are found by the probe's
/// markup layer, not here.
const VIDEO_SCAN: &str = r#"(() => {
  const urls = new Set();
  const add = (u) => { if (u) urls.add(String(u).replace(/&amp;/g, '&')); };
  for (const v of document.querySelectorAll('video')) add(v.src || v.currentSrc);
  for (const s of document.querySelectorAll('video source[src]')) add(s.src);
  for (const el of document.querySelectorAll('[data-video-url]')) add(el.getAttribute('data-video-url'));
  for (const a of document.querySelectorAll("a[href*='.mp4'], a[download]")) add(a.href);
  return Array.from(urls);
})()"#;

/// Generated stills are full-size content images; small chrome (avatars,
/// icons, logos) is filtered here by render size before the matcher sees it.
const IMAGE_SCAN: &str = r#"(() => {
  const urls = new Set();
  for (const img of document.querySelectorAll('img[src]')) {
    const r = img.getBoundingClientRect();
    if (r.width <= 150 || r.height <= 150) continue;
    if (/avatar|profile|icon|emoji|logo/i.test(img.src)) continue;
    urls.add(img.src);
  }
  return Array.from(urls);
})()"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_redirects_are_detected() {
        assert!(looks_like_login("https://grok.com/login?next=%2Fimagine"));
        assert!(looks_like_login("https://accounts.google.com/o/oauth2"));
        assert!(looks_like_login("https://grok.com/sign-in"));
        assert!(!looks_like_login("https://grok.com/imagine"));
    }

    #[test]
    fn video_scan_script_covers_player_surfaces() {
        assert!(VIDEO_SCAN.contains("data-video-url"));
        assert!(VIDEO_SCAN.contains("video source[src]"));
        assert!(VIDEO_SCAN.contains("a[href*='.mp4']"));
        assert!(VIDEO_SCAN.contains("&amp;"));
    }
}
