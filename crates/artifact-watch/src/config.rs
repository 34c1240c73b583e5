use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing envelope for one artifact wait.
///
/// The floor exists because the service is known to spend tens of seconds of
/// real work per generation; any apparent match before it is spurious and must
/// be suppressed rather than trusted. Blob handles get a separate, longer
/// floor: an early `blob:` reference is the placeholder player, not the
/// finished artifact.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WatchBudget {
    /// Hard ceiling on the whole wait.
    pub timeout: Duration,
    /// Minimum elapsed time before any candidate may be returned.
    pub min_wait: Duration,
    /// Minimum elapsed time before an in-context (`blob:`) candidate may be
    /// returned. Must be >= `min_wait` to have any effect.
    pub blob_accept_after: Duration,
    /// Period of the page-scan poll loop.
    pub poll_interval: Duration,
}

impl Default for WatchBudget {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            min_wait: Duration::from_secs(15),
            blob_accept_after: Duration::from_secs(35),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl WatchBudget {
    /// Budget shaped for still-image generation, which completes faster than
    /// video and never produces blob handles worth waiting for.
    pub fn for_images() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            min_wait: Duration::from_secs(5),
            blob_accept_after: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
        }
    }
}
