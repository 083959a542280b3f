//! Content classification
//!
//! Assigns a semantic media kind to an upstream resource from its URL
//! suffix first, then the declared content type as a fallback. Suffix wins
//! because streaming origins frequently misreport content types for
//! playlist formats, while the suffix is under the publisher's control.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// HLS playlist (.m3u8)
    Manifest,
    /// DASH manifest (.mpd)
    ContainerManifest,
    /// Subtitle/caption track (.vtt, .srt)
    Caption,
    /// Binary media chunk (.ts, .m4s, .mp4, ...)
    Segment,
    Image,
    Json,
    Other,
}

impl MediaKind {
    /// Whether the body should be decoded as text (enables rewriting)
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            MediaKind::Manifest | MediaKind::ContainerManifest | MediaKind::Caption | MediaKind::Json
        )
    }

    /// Whether this kind goes through the HLS rewriter
    pub fn is_rewritable(&self) -> bool {
        matches!(self, MediaKind::Manifest)
    }

    /// Whether downstream CDNs may cache this aggressively. Segments and
    /// images are immutable once published; manifests churn.
    pub fn edge_cacheable(&self) -> bool {
        matches!(self, MediaKind::Segment | MediaKind::Image)
    }

    /// Cache-Control header the gateway sends for this kind
    pub fn cache_control(&self) -> &'static str {
        match self {
            MediaKind::Manifest | MediaKind::ContainerManifest => "public, max-age=10",
            MediaKind::Caption => "public, max-age=300",
            MediaKind::Segment => "public, max-age=31536000, immutable",
            MediaKind::Image => "public, max-age=86400",
            MediaKind::Json => "no-cache",
            MediaKind::Other => "public, max-age=60",
        }
    }

    /// Content type to declare when the origin omitted one
    pub fn fallback_content_type(&self) -> &'static str {
        match self {
            MediaKind::Manifest => "application/vnd.apple.mpegurl",
            MediaKind::ContainerManifest => "application/dash+xml",
            MediaKind::Caption => "text/vtt",
            MediaKind::Segment => "video/mp2t",
            MediaKind::Image => "image/jpeg",
            MediaKind::Json => "application/json",
            MediaKind::Other => "application/octet-stream",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Manifest => "manifest",
            MediaKind::ContainerManifest => "container_manifest",
            MediaKind::Caption => "caption",
            MediaKind::Segment => "segment",
            MediaKind::Image => "image",
            MediaKind::Json => "json",
            MediaKind::Other => "other",
        }
    }
}

/// Lowercased extension of a URL path, ignoring any query/fragment
fn path_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last_segment = path.rsplit('/').next()?;
    let (_, ext) = last_segment.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn kind_from_extension(ext: &str) -> Option<MediaKind> {
    match ext {
        "m3u8" | "m3u" => Some(MediaKind::Manifest),
        "mpd" => Some(MediaKind::ContainerManifest),
        "vtt" | "srt" => Some(MediaKind::Caption),
        "ts" | "m4s" | "mp4" | "m4a" | "m4v" | "webm" | "mp3" | "aac" | "ogg" | "wav" | "flac"
        | "key" => Some(MediaKind::Segment),
        "jpg" | "jpeg" | "png" | "webp" | "gif" | "svg" | "avif" => Some(MediaKind::Image),
        "json" => Some(MediaKind::Json),
        _ => None,
    }
}

fn kind_from_content_type(content_type: &str) -> Option<MediaKind> {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("mpegurl") {
        Some(MediaKind::Manifest)
    } else if ct.contains("dash+xml") {
        Some(MediaKind::ContainerManifest)
    } else if ct.contains("text/vtt") || ct.contains("subrip") {
        Some(MediaKind::Caption)
    } else if ct.contains("json") {
        Some(MediaKind::Json)
    } else if ct.starts_with("image/") {
        Some(MediaKind::Image)
    } else if ct.starts_with("video/") || ct.starts_with("audio/") || ct.contains("octet-stream") {
        Some(MediaKind::Segment)
    } else {
        None
    }
}

/// Classify an upstream resource. Path suffix takes precedence over the
/// declared content type.
pub fn classify(url: &str, declared_content_type: Option<&str>) -> MediaKind {
    if let Some(kind) = path_extension(url).and_then(|ext| kind_from_extension(&ext)) {
        return kind;
    }

    declared_content_type
        .and_then(kind_from_content_type)
        .unwrap_or(MediaKind::Other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://cdn.example/a/master.m3u8", MediaKind::Manifest)]
    #[case("https://cdn.example/a/stream.mpd", MediaKind::ContainerManifest)]
    #[case("https://cdn.example/a/subs.vtt", MediaKind::Caption)]
    #[case("https://cdn.example/a/subs.srt", MediaKind::Caption)]
    #[case("https://cdn.example/a/seg0001.ts", MediaKind::Segment)]
    #[case("https://cdn.example/a/init.m4s", MediaKind::Segment)]
    #[case("https://cdn.example/a/movie.mp4", MediaKind::Segment)]
    #[case("https://cdn.example/a/poster.jpg", MediaKind::Image)]
    #[case("https://cdn.example/a/meta.json", MediaKind::Json)]
    #[case("https://cdn.example/a/readme.txt", MediaKind::Other)]
    fn test_classifies_by_suffix(#[case] url: &str, #[case] expected: MediaKind) {
        assert_eq!(classify(url, None), expected);
    }

    #[test]
    fn test_suffix_ignores_query_string() {
        assert_eq!(
            classify("https://cdn.example/master.m3u8?token=abc.def", None),
            MediaKind::Manifest
        );
    }

    #[test]
    fn test_suffix_beats_declared_content_type() {
        // Origin misreports the playlist as plain text; suffix wins
        assert_eq!(
            classify("https://cdn.example/master.m3u8", Some("text/plain")),
            MediaKind::Manifest
        );
    }

    #[rstest]
    #[case("application/vnd.apple.mpegurl", MediaKind::Manifest)]
    #[case("audio/mpegurl", MediaKind::Manifest)]
    #[case("application/dash+xml", MediaKind::ContainerManifest)]
    #[case("text/vtt; charset=utf-8", MediaKind::Caption)]
    #[case("video/mp2t", MediaKind::Segment)]
    #[case("application/octet-stream", MediaKind::Segment)]
    #[case("image/png", MediaKind::Image)]
    #[case("application/json", MediaKind::Json)]
    #[case("text/html", MediaKind::Other)]
    fn test_falls_back_to_content_type_without_suffix(
        #[case] content_type: &str,
        #[case] expected: MediaKind,
    ) {
        assert_eq!(
            classify("https://cdn.example/stream/playlist", Some(content_type)),
            expected
        );
    }

    #[test]
    fn test_no_suffix_no_content_type_is_other() {
        assert_eq!(classify("https://cdn.example/stream", None), MediaKind::Other);
    }

    #[test]
    fn test_text_kinds() {
        assert!(MediaKind::Manifest.is_text());
        assert!(MediaKind::Caption.is_text());
        assert!(!MediaKind::Segment.is_text());
        assert!(!MediaKind::Image.is_text());
    }

    #[test]
    fn test_only_hls_manifests_are_rewritable() {
        assert!(MediaKind::Manifest.is_rewritable());
        assert!(!MediaKind::ContainerManifest.is_rewritable());
        assert!(!MediaKind::Caption.is_rewritable());
    }

    #[test]
    fn test_segments_are_edge_cacheable_manifests_are_not() {
        assert!(MediaKind::Segment.edge_cacheable());
        assert!(MediaKind::Image.edge_cacheable());
        assert!(!MediaKind::Manifest.edge_cacheable());
    }
}
