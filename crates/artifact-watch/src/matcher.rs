use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ArtifactRef;

/// Absolute URLs naming a finished generated video, as they appear in raw
/// page markup (entity-escaped ampersands included).
static VIDEO_URL_IN_MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^\s"'<>]+generated_video\.mp4[^\s"'<>]*"#)
        .expect("video url pattern is valid")
});

/// Which family of artifact a wait is expecting. The service produces both
/// from the same surface; the URL shapes differ.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Image,
}

/// Classifies raw URL strings into plausible artifact references.
///
/// `service_marker` is a substring of the service's asset hostnames (for
/// example `"grok"`); it keeps third-party `.mp4` responses (ads, players)
/// from being taken for the artifact.
#[derive(Clone, Debug)]
pub struct ArtifactMatcher {
    kind: MediaKind,
    service_marker: String,
}

impl ArtifactMatcher {
    pub fn new(kind: MediaKind, service_marker: impl Into<String>) -> Self {
        Self {
            kind,
            service_marker: service_marker.into(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Classify a raw URL. Returns `None` when the URL does not plausibly
    /// name a newly produced artifact of the expected kind.
    pub fn classify(&self, url: &str) -> Option<ArtifactRef> {
        let url = url.trim();
        if url.is_empty() {
            return None;
        }
        if url.starts_with("blob:") {
            // Shape cannot be inspected further; kind is decided by context.
            return match self.kind {
                MediaKind::Video => Some(ArtifactRef::InContext(url.to_string())),
                MediaKind::Image => None,
            };
        }
        match self.kind {
            MediaKind::Video => {
                let named = url.contains("generated_video.mp4");
                let marked = url.contains(".mp4") && url.contains(&self.service_marker);
                (named || marked).then(|| ArtifactRef::Url(unescape_markup_url(url)))
            }
            MediaKind::Image => {
                let generated = url.contains("/generated/") && !url.contains("video");
                let image_ext = [".png", ".jpg", ".jpeg", ".webp"]
                    .iter()
                    .any(|ext| url_path_has_ext(url, ext));
                (generated && image_ext).then(|| ArtifactRef::Url(unescape_markup_url(url)))
            }
        }
    }

    /// Pull every plausible artifact URL out of raw page markup.
    pub fn scan_markup(&self, markup: &str) -> Vec<String> {
        match self.kind {
            MediaKind::Video => VIDEO_URL_IN_MARKUP
                .find_iter(markup)
                .map(|m| unescape_markup_url(m.as_str()))
                .collect(),
            // Image URLs are too loosely shaped to trawl markup for; the DOM
            // probe covers them.
            MediaKind::Image => Vec::new(),
        }
    }
}

fn unescape_markup_url(url: &str) -> String {
    url.replace("&amp;", "&")
}

fn url_path_has_ext(url: &str, ext: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video() -> ArtifactMatcher {
        ArtifactMatcher::new(MediaKind::Video, "grok")
    }

    #[test]
    fn classifies_named_video_urls() {
        let m = video();
        let got = m.classify("https://assets.grok.com/x/generated_video.mp4?sig=abc");
        assert!(matches!(got, Some(ArtifactRef::Url(_))));
    }

    #[test]
    fn rejects_foreign_mp4() {
        let m = video();
        assert!(m.classify("https://cdn.example.com/ad.mp4").is_none());
    }

    #[test]
    fn blob_is_in_context_for_video_only() {
        assert!(matches!(
            video().classify("blob:https://grok.com/1234"),
            Some(ArtifactRef::InContext(_))
        ));
        let images = ArtifactMatcher::new(MediaKind::Image, "grok");
        assert!(images.classify("blob:https://grok.com/1234").is_none());
    }

    #[test]
    fn markup_scan_unescapes_entities() {
        let m = video();
        let markup = r#"<video src="https://a.grok.com/generated_video.mp4?a=1&amp;b=2">"#;
        let found = m.scan_markup(markup);
        assert_eq!(found, vec!["https://a.grok.com/generated_video.mp4?a=1&b=2"]);
    }

    #[test]
    fn image_matcher_wants_generated_path_and_extension() {
        let m = ArtifactMatcher::new(MediaKind::Image, "grok");
        assert!(m
            .classify("https://assets.grok.com/generated/abc.png?sig=1")
            .is_some());
        assert!(m.classify("https://assets.grok.com/generated/abc.mp4").is_none());
        assert!(m.classify("https://assets.grok.com/avatars/abc.png").is_none());
    }
}
