//! Chromium DevTools Protocol driver for the generation pipeline.
//!
//! The pipeline never touches selectors or CDP methods directly; it consumes
//! the [`Driver`](crate::driver::Driver) capability trait, and every brittle
//! page-targeting decision lives behind a prioritized
//! [`Locator`](crate::locator::Locator) chain. The transport is pluggable:
//! a real chromiumoxide-backed connection when Chrome is available, a noop
//! stub otherwise.

pub mod driver;
pub mod locator;
pub mod transport;

use std::{env, path::PathBuf};

pub use crate::driver::{CdpDriver, CookieParam, Driver, ResolvedElement};
pub use crate::error::{DriverError, DriverErrorKind};
pub use crate::locator::{Locator, LocatorStrategy};

pub mod ids {
    use std::fmt;

    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Stable identifier for a page epoch owned by the driver. CDP target ids
    /// are reused by the browser; these are not.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct PageId(pub Uuid);

    impl PageId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for PageId {
        fn default() -> Self {
            Self::new()
        }
    }

    impl fmt::Display for PageId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }
}

pub mod error {
    use std::fmt;

    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    /// High-level failure categories surfaced by the driver.
    #[derive(Clone, Debug, Error, Serialize, Deserialize)]
    pub enum DriverErrorKind {
        #[error("navigation timed out")]
        NavTimeout,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("target element not found")]
        TargetNotFound,
        #[error("browser not launchable")]
        NoBrowser,
        #[error("internal error")]
        Internal,
    }

    /// Driver error with an optional hint for diagnostics.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DriverError {
        pub kind: DriverErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
    }

    impl fmt::Display for DriverError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for DriverError {}

    impl DriverError {
        pub fn new(kind: DriverErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }
    }
}

pub mod config {
    use std::{
        env,
        path::{Path, PathBuf},
    };

    use serde::{Deserialize, Serialize};

    use crate::detect_chrome_executable;

    /// Launch and tuning knobs for the driver.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(default)]
    pub struct DriverConfig {
        pub executable: PathBuf,
        pub user_data_dir: PathBuf,
        pub headless: bool,
        /// Deadline for individual CDP commands.
        pub command_deadline_ms: u64,
        /// Deadline for full page navigations.
        pub navigation_deadline_ms: u64,
        /// Settle pause after navigation reports DOM-ready; the service keeps
        /// hydrating its surface for a moment after that.
        pub post_navigation_settle_ms: u64,
        pub websocket_url: Option<String>,
        pub user_agent: Option<String>,
    }

    impl Default for DriverConfig {
        fn default() -> Self {
            Self {
                executable: default_chrome_path(),
                user_data_dir: default_profile_dir(),
                headless: resolve_headless_default(),
                command_deadline_ms: 30_000,
                navigation_deadline_ms: 60_000,
                post_navigation_settle_ms: 2_000,
                websocket_url: None,
                user_agent: Some(default_user_agent()),
            }
        }
    }

    fn resolve_headless_default() -> bool {
        match env::var("REELFORGE_HEADLESS") {
            Ok(value) => {
                let lower = value.to_ascii_lowercase();
                !matches!(lower.as_str(), "0" | "false" | "no" | "off")
            }
            Err(_) => true,
        }
    }

    fn default_chrome_path() -> PathBuf {
        detect_chrome_executable().unwrap_or_default()
    }

    fn default_profile_dir() -> PathBuf {
        if let Ok(path) = env::var("REELFORGE_CHROME_PROFILE") {
            return PathBuf::from(path);
        }
        Path::new("./.reelforge-profile").into()
    }

    fn default_user_agent() -> String {
        // A stock desktop UA; the automation-controlled blink feature is
        // disabled at launch so the service sees an ordinary client.
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            .to_string()
    }
}

/// Whether the driver is wired to a real browser or running against the stub
/// transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriverMode {
    Real,
    Stub,
}

impl DriverMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverMode::Real => "real",
            DriverMode::Stub => "stub",
        }
    }

    pub fn is_stub(&self) -> bool {
        matches!(self, DriverMode::Stub)
    }
}

/// Locate a Chrome/Chromium executable: explicit env override first, then
/// PATH, then the usual install locations for the platform.
pub fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("REELFORGE_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    let skip_defaults = env::var("REELFORGE_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);

    if !skip_defaults {
        for candidate in os_specific_chrome_paths() {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        &["chrome"]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Ok(value) = env::var(key) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    let root = PathBuf::from(trimmed);
                    paths.push(root.join("Google/Chrome/Application/chrome.exe"));
                    paths.push(root.join("Chromium/Application/chrome.exe"));
                }
            }
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{chrome_executable_names, detect_chrome_executable};
    use std::{env, fs};
    use tempfile::tempdir;

    #[test]
    fn detects_from_env_var() {
        let dir = tempdir().unwrap();
        let exe_path = dir.path().join("my-chrome");
        fs::write(&exe_path, b"").unwrap();
        let original = env::var("REELFORGE_CHROME").ok();
        env::set_var("REELFORGE_CHROME", exe_path.to_string_lossy().to_string());
        let detected = detect_chrome_executable();
        if let Some(value) = original {
            env::set_var("REELFORGE_CHROME", value);
        } else {
            env::remove_var("REELFORGE_CHROME");
        }
        assert_eq!(detected, Some(exe_path));
    }

    #[test]
    fn executable_name_table_is_nonempty() {
        assert!(!chrome_executable_names().is_empty());
    }
}
