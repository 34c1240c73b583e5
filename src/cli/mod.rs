//! Command-line surface.

pub mod runtime;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "reelforge",
    version,
    about = "Drive a generative media service through an automated browser and reel in the videos"
)]
pub struct Cli {
    /// Explicit configuration file (YAML). Defaults are searched in
    /// ./config/reelforge.yaml and the platform config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (trace|debug|info|warn|error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Shorthand for --log-level debug.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Run the browser with a visible window.
    #[arg(long, global = true)]
    pub headful: bool,

    /// Override the generation wait budget, e.g. "240s" or "5m".
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Animate a local image into a video.
    Convert {
        /// Input image file.
        image: PathBuf,
        /// Output video path.
        #[arg(short, long)]
        output: PathBuf,
        /// Optional guidance text accompanying the image.
        #[arg(long)]
        prompt: Option<String>,
        /// Aspect ratio, e.g. 9:16 (the service default) or 16:9.
        #[arg(long)]
        aspect_ratio: Option<String>,
    },

    /// Generate a video from a text description alone.
    Text {
        /// The description to generate from.
        prompt: String,
        /// Directory for the output file; the name comes from the naming
        /// pattern.
        #[arg(short = 'd', long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long)]
        aspect_ratio: Option<String>,
        /// Override the configured naming pattern ({prompt}, {timestamp}).
        #[arg(long)]
        pattern: Option<String>,
    },

    /// Convert several images sequentially over one shared session.
    Batch {
        /// Input image files, converted in order.
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(short = 'd', long, default_value = ".")]
        out_dir: PathBuf,
        /// Guidance text applied to every item.
        #[arg(long)]
        prompt: Option<String>,
    },

    /// Re-download a previously generated artifact by its reference.
    RetryDownload {
        /// Artifact URL (https:// or blob:) from an earlier run's result.
        url: String,
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Establish a session, report its state, and tear it down.
    Validate,
}
