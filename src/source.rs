use anyhow::Result;
use async_trait::async_trait;

/// Provider of raw audio for a video URL.
///
/// Download and decode are external concerns; the core only asks for mono
/// float PCM covering a time range. Implementations must be thread-safe
/// (`Send + Sync`) since chunk fetches run on background tasks.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Fetch mono PCM samples covering `[start, end)` seconds of the video's
    /// audio track, at the session's configured sample rate. A range past the
    /// end of the media returns the samples that exist (possibly empty).
    async fn fetch_samples(&self, url: &str, start: f64, end: f64) -> Result<Vec<f32>>;

    /// Total media duration in seconds.
    async fn duration_secs(&self, url: &str) -> Result<f64>;
}

/// Physical haptic output device. Asynchronous and best-effort: transport
/// errors are reported but the caller is expected to swallow them.
#[async_trait]
pub trait HapticSink: Send + Sync {
    /// Set the instantaneous power level, 0.0-1.0.
    async fn set_intensity(&self, intensity: f32) -> Result<()>;

    /// Stop all output immediately.
    async fn stop(&self) -> Result<()>;
}

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".webm", ".mkv", ".mov", ".m4v", ".m3u8", ".mpd"];
const VIDEO_PATH_HINTS: &[&str] = &["/watch", "/video/", "/videos/", "/embed/"];

/// Heuristic check that a URL points at playable video content rather than a
/// navigation or account page.
pub fn looks_like_video_url(url: &str) -> bool {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return false;
    }
    let lower = url.to_ascii_lowercase();
    // Strip query and fragment before extension matching
    let path = lower
        .split(['?', '#'])
        .next()
        .unwrap_or(&lower);
    VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        || VIDEO_PATH_HINTS.iter().any(|hint| lower.contains(hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_direct_media_urls() {
        assert!(looks_like_video_url("https://cdn.example.com/clip.mp4"));
        assert!(looks_like_video_url("http://example.com/stream/master.m3u8?token=abc"));
        assert!(looks_like_video_url("https://example.com/a/b/movie.WEBM"));
    }

    #[test]
    fn test_accepts_player_page_urls() {
        assert!(looks_like_video_url("https://site.example/watch?v=xyz"));
        assert!(looks_like_video_url("https://site.example/embed/12345"));
    }

    #[test]
    fn test_rejects_non_video_urls() {
        assert!(!looks_like_video_url("https://site.example/account/settings"));
        assert!(!looks_like_video_url("ftp://site.example/clip.mp4"));
        assert!(!looks_like_video_url("not a url"));
    }
}
