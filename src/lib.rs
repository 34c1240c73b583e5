//! Generation pipeline over an automated browser session.
//!
//! The crate drives a generative media web service through Chromium: restore a
//! cookie-authenticated session, submit an image or a text description, wait
//! for the service to surface the finished artifact, and pull the file down
//! with plausibility checks. Everything brittle about the live page sits
//! behind the `Driver` trait in `cdp-driver` and the locator chains in
//! [`submit`]; this crate owns orchestration, retries, and progress.

pub mod cli;
pub mod config;
pub mod download;
pub mod errors;
pub mod pipeline;
pub mod progress;
pub mod session;
pub mod submit;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use crate::config::ForgeConfig;
pub use crate::errors::ConvertError;
pub use crate::pipeline::Pipeline;
pub use crate::progress::{ProgressEvent, ProgressSink};

pub use artifact_watch::ArtifactRef;

/// What the caller wants turned into a video.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum InputSource {
    /// Local image animated by the service.
    Image(PathBuf),
    /// Text description generated from scratch.
    Prompt(String),
}

/// Kind of artifact the service is asked to produce.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum GenerationMode {
    Video,
    Image,
}

impl Default for GenerationMode {
    fn default() -> Self {
        GenerationMode::Video
    }
}

/// Knobs applied at submission time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub mode: GenerationMode,
    /// Requested aspect ratio, e.g. `"9:16"`. `None` keeps whatever the
    /// service defaults to.
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    /// Optional guidance text accompanying an image input.
    #[serde(default)]
    pub prompt: Option<String>,
}

/// One unit of work for the pipeline. Immutable once built; every retry
/// attempt sees the same request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub input: InputSource,
    pub output_path: PathBuf,
    #[serde(default)]
    pub params: GenerationParams,
}

/// Outcome of a conversion, including partial success: `download_failed`
/// means the service produced an artifact but the transfer never landed, and
/// the reference is preserved so the caller can retry the download alone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversionResult {
    pub success: bool,
    pub artifact: Option<ArtifactRef>,
    pub output_path: PathBuf,
    pub error: Option<String>,
    pub attempts: u32,
    pub download_failed: bool,
}

impl ConversionResult {
    pub(crate) fn failed(output_path: PathBuf, attempts: u32, error: String) -> Self {
        Self {
            success: false,
            artifact: None,
            output_path,
            error: Some(error),
            attempts,
            download_failed: false,
        }
    }
}
