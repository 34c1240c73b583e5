//! Artifact retrieval.
//!
//! Both reference kinds are fetched from inside the page: a `blob:` handle is
//! only resolvable there, and a direct URL fetched in-page rides the session
//! cookies without re-plumbing authentication. The payload comes back base64
//! and is validated for plausibility before the file is kept; an implausibly
//! small body is the service's error placeholder, not a video.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{info, warn};

use artifact_watch::ArtifactRef;
use cdp_driver::Driver;

use crate::errors::ConvertError;

pub struct DownloadManager {
    driver: Arc<dyn Driver>,
    min_artifact_bytes: u64,
    retry_delay: Duration,
}

impl DownloadManager {
    pub fn new(driver: Arc<dyn Driver>, min_artifact_bytes: u64, retry_delay: Duration) -> Self {
        Self {
            driver,
            min_artifact_bytes,
            retry_delay,
        }
    }

    /// Fetch one artifact to `dest`. On a failed plausibility check the
    /// partial file is removed before the error is returned; a dest that
    /// exists afterwards is always a plausible artifact.
    pub async fn fetch(&self, artifact: &ArtifactRef, dest: &Path) -> Result<(), ConvertError> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| ConvertError::Transport(format!("create output dir: {err}")))?;
            }
        }

        let payload = self.fetch_bytes(artifact.as_str()).await?;

        tokio::fs::write(dest, &payload)
            .await
            .map_err(|err| ConvertError::Transport(format!("write {}: {err}", dest.display())))?;

        let size = payload.len() as u64;
        if size < self.min_artifact_bytes {
            if let Err(err) = tokio::fs::remove_file(dest).await {
                warn!(target: "reelforge", %err, "failed to remove undersized artifact");
            }
            return Err(ConvertError::CorruptArtifact {
                got: size,
                min: self.min_artifact_bytes,
            });
        }

        info!(target: "reelforge", bytes = size, dest = %dest.display(), "artifact saved");
        Ok(())
    }

    /// Retry wrapper around [`fetch`]; never errors upward. Fixed delay
    /// between attempts, none after the last.
    ///
    /// [`fetch`]: DownloadManager::fetch
    pub async fn fetch_with_retry(
        &self,
        artifact: &ArtifactRef,
        dest: &Path,
        max_retries: u32,
    ) -> bool {
        for attempt in 1..=max_retries.max(1) {
            match self.fetch(artifact, dest).await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(
                        target: "reelforge",
                        attempt,
                        max_retries,
                        %err,
                        "download attempt failed"
                    );
                    if attempt < max_retries {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }
        false
    }

    /// Standalone re-download of a previously reported artifact reference.
    pub async fn retry_download(&self, artifact: &ArtifactRef, dest: &Path) -> bool {
        self.fetch_with_retry(artifact, dest, 3).await
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ConvertError> {
        let script = fetch_script(url);
        let value = self.driver.evaluate(&script).await?;

        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return Err(ConvertError::Transport(error.to_string()));
        }
        let data = value.get("data").and_then(Value::as_str).ok_or_else(|| {
            ConvertError::Transport("in-page fetch returned no payload".to_string())
        })?;

        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|err| ConvertError::Transport(format!("payload not base64: {err}")))
    }
}

/// In-page fetch returning `{data}` (base64) or `{error}`. Chunked
/// `String.fromCharCode` keeps the argument list under engine limits for
/// multi-megabyte payloads.
fn fetch_script(url: &str) -> String {
    let literal = serde_json::to_string(url).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "(async () => {{ \
         try {{ \
         const res = await fetch({literal}, {{ credentials: 'include' }}); \
         if (!res.ok) return {{ error: 'fetch status ' + res.status }}; \
         const bytes = new Uint8Array(await res.arrayBuffer()); \
         let bin = ''; \
         for (let i = 0; i < bytes.length; i += 0x8000) {{ \
         bin += String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000)); \
         }} \
         return {{ data: btoa(bin) }}; \
         }} catch (err) {{ return {{ error: String(err) }}; }} \
         }})()"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_script_embeds_url_as_literal_with_credentials() {
        let js = fetch_script("https://assets.grok.com/generated_video.mp4?a=1&b=2");
        assert!(js.contains(r#""https://assets.grok.com/generated_video.mp4?a=1&b=2""#));
        assert!(js.contains("credentials: 'include'"));
    }

    #[test]
    fn fetch_script_escapes_hostile_urls() {
        let js = fetch_script("blob:https://grok.com/x\"); alert(1); //");
        assert!(!js.contains(r#"x"); alert"#));
    }
}
