//! Artifact-ready detection for generative media sessions.
//!
//! The external service never signals completion directly; the only evidence a
//! generation finished is a new artifact URL surfacing somewhere — in a network
//! response, in a freshly inserted DOM node, or behind a download control. The
//! watcher races two observation channels against one wait budget: a push
//! listener on the driver's response stream (fast when the stream catches the
//! signal) and a periodic page scan (robust when it does not). Both consult the
//! same exclusion set and liveness token, and the listener is torn down on
//! every exit path so a later event can never be attributed to an earlier wait.

pub mod config;
pub mod matcher;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use crate::config::WatchBudget;
pub use crate::matcher::{ArtifactMatcher, MediaKind};

/// Reference to a produced artifact.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ArtifactRef {
    /// Externally addressable URL (may still require session cookies).
    Url(String),
    /// Handle only resolvable inside the page's execution context (`blob:`).
    InContext(String),
}

impl ArtifactRef {
    pub fn as_str(&self) -> &str {
        match self {
            ArtifactRef::Url(url) | ArtifactRef::InContext(url) => url,
        }
    }

    pub fn is_in_context(&self) -> bool {
        matches!(self, ArtifactRef::InContext(_))
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network response observed by the driver, reduced to what artifact
/// detection needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseSighting {
    pub url: String,
    pub mime_type: Option<String>,
    pub status: i64,
}

/// Artifact references known to exist before a wait began. Captured fresh at
/// the start of every wait; never reused across attempts.
#[derive(Clone, Debug, Default)]
pub struct ExclusionSet {
    urls: HashSet<String>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, url: impl Into<String>) {
        self.urls.insert(url.into());
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

impl FromIterator<String> for ExclusionSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            urls: iter.into_iter().collect(),
        }
    }
}

/// Errors surfaced by the page probe. Probe failures never abort a wait; the
/// poll loop logs and keeps going.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("page scan failed: {0}")]
    Scan(String),
}

/// One page scan from the poll channel's point of view: every raw URL string
/// currently visible on the page that might name an artifact. The watcher does
/// the shape matching and exclusion filtering.
#[async_trait]
pub trait PageProbe: Send + Sync {
    async fn scan(&self) -> Result<Vec<String>, ProbeError>;
}

/// Dual-channel artifact watcher. One instance per session; each call to
/// [`ArtifactWatcher::wait_for_artifact`] is an independent wait with its own
/// exclusion set and listener registration.
pub struct ArtifactWatcher {
    matcher: ArtifactMatcher,
    cancel: CancellationToken,
}

impl ArtifactWatcher {
    /// `cancel` is the session liveness token: once cancelled, every wait
    /// returns `None` at its next iteration boundary.
    pub fn new(matcher: ArtifactMatcher, cancel: CancellationToken) -> Self {
        Self { matcher, cancel }
    }

    pub fn matcher(&self) -> &ArtifactMatcher {
        &self.matcher
    }

    /// Wait for a newly produced artifact, racing the push listener against
    /// the poll loop under one budget.
    ///
    /// Returns `None` on timeout or cancellation. Never returns a reference
    /// present in `exclusions`, and never returns anything before the
    /// minimum-wait floor has elapsed.
    pub async fn wait_for_artifact<P: PageProbe + ?Sized>(
        &self,
        events: broadcast::Receiver<ResponseSighting>,
        probe: &P,
        budget: WatchBudget,
        exclusions: &ExclusionSet,
    ) -> Option<ArtifactRef> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let started = Instant::now();
        let captured: Arc<Mutex<Option<ArtifactRef>>> = Arc::new(Mutex::new(None));
        let listener_token = self.cancel.child_token();
        let listener = tokio::spawn(push_listener(
            events,
            self.matcher.clone(),
            exclusions.clone(),
            Arc::clone(&captured),
            listener_token.clone(),
        ));

        let found = self
            .poll_until_found(probe, budget, exclusions, started, &captured)
            .await;

        // Listener teardown happens on every exit path; a leaked listener
        // would attribute a later response to this wait.
        listener_token.cancel();
        let _ = listener.await;

        found
    }

    async fn poll_until_found<P: PageProbe + ?Sized>(
        &self,
        probe: &P,
        budget: WatchBudget,
        exclusions: &ExclusionSet,
        started: Instant,
        captured: &Mutex<Option<ArtifactRef>>,
    ) -> Option<ArtifactRef> {
        let mut last_logged = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                debug!(target: "artifact-watch", "wait cancelled");
                return None;
            }
            let elapsed = started.elapsed();
            if elapsed >= budget.timeout {
                debug!(target: "artifact-watch", elapsed_s = elapsed.as_secs(), "wait timed out");
                return None;
            }

            let secs = elapsed.as_secs();
            if secs >= last_logged + 15 {
                debug!(target: "artifact-watch", elapsed_s = secs, "still waiting");
                last_logged = secs;
            }

            // Push source has priority when a captured candidate is eligible.
            if let Some(candidate) = self.eligible(captured.lock().ok()?.clone(), elapsed, budget) {
                debug!(target: "artifact-watch", artifact = %candidate, elapsed_s = secs, "candidate from response stream");
                return Some(candidate);
            }

            if elapsed >= budget.min_wait {
                match probe.scan().await {
                    Ok(urls) => {
                        for url in urls {
                            let Some(candidate) = self.matcher.classify(&url) else {
                                continue;
                            };
                            if exclusions.contains(candidate.as_str()) {
                                continue;
                            }
                            if let Some(found) = self.eligible(Some(candidate), elapsed, budget) {
                                debug!(target: "artifact-watch", artifact = %found, elapsed_s = secs, "candidate from page scan");
                                return Some(found);
                            }
                        }
                    }
                    Err(err) => {
                        warn!(target: "artifact-watch", %err, "page scan failed; continuing");
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = sleep(budget.poll_interval) => {}
            }
        }
    }

    /// A candidate may only be surfaced once the floor for its reference kind
    /// has elapsed.
    fn eligible(
        &self,
        candidate: Option<ArtifactRef>,
        elapsed: std::time::Duration,
        budget: WatchBudget,
    ) -> Option<ArtifactRef> {
        let candidate = candidate?;
        if elapsed < budget.min_wait {
            return None;
        }
        if candidate.is_in_context() && elapsed < budget.blob_accept_after {
            return None;
        }
        Some(candidate)
    }
}

/// Push channel: record the first plausible sighting, preferring a direct URL
/// over an in-context handle if both turn up. Floors are enforced at read
/// time, so an early capture is held rather than dropped.
async fn push_listener(
    mut events: broadcast::Receiver<ResponseSighting>,
    matcher: ArtifactMatcher,
    exclusions: ExclusionSet,
    captured: Arc<Mutex<Option<ArtifactRef>>>,
    cancel: CancellationToken,
) {
    loop {
        let sighting = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(sighting) => sighting,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "artifact-watch", skipped, "response stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let Some(candidate) = matcher.classify(&sighting.url) else {
            continue;
        };
        if exclusions.contains(candidate.as_str()) {
            continue;
        }

        if let Ok(mut slot) = captured.lock() {
            let replace = match slot.as_ref() {
                None => true,
                Some(existing) => existing.is_in_context() && !candidate.is_in_context(),
            };
            if replace {
                debug!(target: "artifact-watch", url = %candidate, "response sighting captured");
                *slot = Some(candidate);
            }
        }
    }
}
