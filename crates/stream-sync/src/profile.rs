//! Per-protocol source profiles and format auto-detection.

use std::time::Duration;

use stream_sync_types::StreamKind;

/// Transport and buffering parameters for one kind of live source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceProfile {
    pub kind: StreamKind,
    /// Capacity of the video frame queue.
    pub video_queue_capacity: usize,
    /// Buffered media required before playback starts.
    pub min_initial_buffer: Duration,
    /// How long an audio enqueue waits for room before its one retry.
    pub audio_offer_timeout: Duration,
    /// Socket read/connect timeout.
    pub read_timeout: Duration,
    /// Transport I/O buffer size, bytes.
    pub io_buffer_bytes: usize,
    /// Bytes the demuxer may read while probing.
    pub probe_bytes: usize,
    /// Segments fetched ahead (segmented playlists only).
    pub read_ahead_segments: usize,
    /// Longest wait for a live playlist to grow.
    pub playlist_timeout: Duration,
}

impl SourceProfile {
    pub fn for_kind(kind: StreamKind) -> Self {
        let base = Self {
            kind,
            video_queue_capacity: 8,
            min_initial_buffer: Duration::from_millis(1000),
            audio_offer_timeout: Duration::from_millis(100),
            read_timeout: Duration::from_secs(10),
            io_buffer_bytes: 1024 * 1024,
            probe_bytes: 2_000_000,
            read_ahead_segments: 0,
            playlist_timeout: Duration::ZERO,
        };
        match kind {
            StreamKind::Segmented => Self {
                video_queue_capacity: 15,
                min_initial_buffer: Duration::from_millis(3000),
                audio_offer_timeout: Duration::from_millis(500),
                io_buffer_bytes: 16 * 1024 * 1024,
                read_ahead_segments: 8,
                playlist_timeout: Duration::from_millis(5000),
                ..base
            },
            StreamKind::Continuous => Self {
                video_queue_capacity: 5,
                io_buffer_bytes: 2_048_000,
                ..base
            },
            StreamKind::Auto => base,
        }
    }
}

/// Resolve `Auto` from the URL; explicit kinds pass through.
///
/// `Auto` stays `Auto` when the URL names neither protocol, which selects the generic
/// profile.
pub fn resolve_kind(requested: StreamKind, url: &str) -> StreamKind {
    if requested != StreamKind::Auto {
        return requested;
    }
    let lower = url.to_ascii_lowercase();
    let has = |ext: &str| lower.ends_with(ext) || lower.contains(&format!("{ext}?"));
    let hls = has(".m3u8");
    let flv = has(".flv");
    match (hls, flv) {
        (true, false) => StreamKind::Segmented,
        (false, true) => StreamKind::Continuous,
        _ => StreamKind::Auto,
    }
}

/// Parse a command-channel format hint, falling back to `Auto` with a warning.
pub fn kind_from_hint(hint: Option<&str>) -> StreamKind {
    let Some(hint) = hint else {
        return StreamKind::Auto;
    };
    StreamKind::from_hint(hint).unwrap_or_else(|| {
        tracing::warn!(hint, "unrecognized stream format; using auto");
        StreamKind::Auto
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_queue_depths() {
        assert_eq!(SourceProfile::for_kind(StreamKind::Segmented).video_queue_capacity, 15);
        assert_eq!(SourceProfile::for_kind(StreamKind::Continuous).video_queue_capacity, 5);
        assert_eq!(SourceProfile::for_kind(StreamKind::Auto).video_queue_capacity, 8);
    }

    #[test]
    fn segmented_profile_buffers_longer() {
        let p = SourceProfile::for_kind(StreamKind::Segmented);
        assert_eq!(p.min_initial_buffer, Duration::from_millis(3000));
        assert_eq!(p.audio_offer_timeout, Duration::from_millis(500));
        assert_eq!(p.read_ahead_segments, 8);
        let c = SourceProfile::for_kind(StreamKind::Continuous);
        assert_eq!(c.min_initial_buffer, Duration::from_millis(1000));
        assert_eq!(c.audio_offer_timeout, Duration::from_millis(100));
    }

    #[test]
    fn resolve_kind_detects_from_url() {
        let auto = StreamKind::Auto;
        assert_eq!(resolve_kind(auto, "http://h/live/index.m3u8"), StreamKind::Segmented);
        assert_eq!(resolve_kind(auto, "http://h/live.M3U8?token=1"), StreamKind::Segmented);
        assert_eq!(resolve_kind(auto, "http://h/room/123.flv"), StreamKind::Continuous);
        assert_eq!(resolve_kind(auto, "http://h/a.flv?x=.m3u8?"), StreamKind::Auto);
        assert_eq!(resolve_kind(auto, "http://h/stream.mp3"), StreamKind::Auto);
    }

    #[test]
    fn explicit_kind_wins_over_url() {
        assert_eq!(
            resolve_kind(StreamKind::Continuous, "http://h/index.m3u8"),
            StreamKind::Continuous
        );
    }

    #[test]
    fn unknown_hint_falls_back_to_auto() {
        assert_eq!(kind_from_hint(Some("rtsp")), StreamKind::Auto);
        assert_eq!(kind_from_hint(Some("FLV")), StreamKind::Continuous);
        assert_eq!(kind_from_hint(None), StreamKind::Auto);
    }
}
