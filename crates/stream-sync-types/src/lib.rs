use serde::{Deserialize, Serialize};

/// Transport family of a live source.
///
/// Picks the protocol profile (queue depth, buffering threshold, I/O sizing) used for
/// a session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Segmented playlist delivery (HLS `.m3u8`).
    Segmented,
    /// Continuous push delivery (FLV over HTTP).
    Continuous,
    /// Unknown; decided from the URL at session start.
    #[default]
    Auto,
}

impl StreamKind {
    /// Parse a user-supplied format hint (case-insensitive).
    ///
    /// Returns `None` for unrecognized hints so callers can warn before falling back.
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_lowercase().as_str() {
            "m3u8" | "hls" | "segmented" => Some(Self::Segmented),
            "flv" | "continuous" => Some(Self::Continuous),
            "" | "auto" | "default" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Segmented => "segmented",
            Self::Continuous => "continuous",
            Self::Auto => "auto",
        }
    }
}

/// Per-iteration fetch directive chosen by the decode loop.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Fetch audio and video units as they come.
    #[default]
    Mixed,
    /// Fetch audio only while the video queue is saturated.
    AudioPriority,
}

/// Reason a stream session ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    /// Stopped by an explicit command.
    Stopped,
    /// Reconnect budget exhausted.
    ConnectionLost,
    /// Audio output or another local resource failed.
    Error,
}

/// World placement of the presentation quad, as sent by the command channel.
///
/// The engine only records it; geometry belongs to the presentation layer.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Placement {
    pub start: [f64; 3],
    pub end: [f64; 3],
    #[serde(default)]
    pub yaw: f32,
}

/// Request body for `POST /play`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlayRequest {
    pub url: String,
    /// Format hint: `m3u8`, `flv`, `auto` (default).
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub placement: Option<Placement>,
}

/// Stream parameters after degradation defaults were applied.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamInfoSnapshot {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub title: Option<String>,
}

/// Point-in-time view of the active stream session.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    /// Source URL of the current (or last) session.
    pub url: Option<String>,
    pub kind: Option<StreamKind>,
    /// `true` while the decode loop is running.
    pub active: bool,
    /// `true` until the initial buffering threshold is reached.
    pub buffering: bool,
    /// Audio clock position in seconds.
    pub playback_seconds: f64,
    /// Video + audio buffered ahead of the clock, in milliseconds.
    pub buffered_ms: u64,
    pub video_queue_len: usize,
    pub video_queue_capacity: usize,
    pub audio_queue_len: usize,
    pub audio_queue_capacity: usize,
    /// Frames evicted from the video queue on overflow.
    pub dropped_video_frames: u64,
    /// Audio buffers dropped after the enqueue retry failed.
    pub dropped_audio_buffers: u64,
    /// Units rejected by validation or conversion.
    pub format_errors: u64,
    /// Single-unit fetch failures.
    pub transient_errors: u64,
    pub reconnects: u64,
    pub frames_presented: u64,
    pub fetch_mode: FetchMode,
    pub stream: Option<StreamInfoSnapshot>,
    /// Sample rate or channel count was missing and a default was substituted.
    pub degraded_audio_params: bool,
    pub placement: Option<Placement>,
    pub end_reason: Option<SessionEndReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_hint_accepts_aliases() {
        assert_eq!(StreamKind::from_hint("M3U8"), Some(StreamKind::Segmented));
        assert_eq!(StreamKind::from_hint(" hls "), Some(StreamKind::Segmented));
        assert_eq!(StreamKind::from_hint("flv"), Some(StreamKind::Continuous));
        assert_eq!(StreamKind::from_hint(""), Some(StreamKind::Auto));
        assert_eq!(StreamKind::from_hint("default"), Some(StreamKind::Auto));
        assert_eq!(StreamKind::from_hint("rtmp"), None);
    }

    #[test]
    fn play_request_defaults_optional_fields() {
        let req: PlayRequest = serde_json::from_str(r#"{"url":"http://x/live.flv"}"#).unwrap();
        assert_eq!(req.url, "http://x/live.flv");
        assert!(req.format.is_none());
        assert!(req.placement.is_none());
    }

    #[test]
    fn enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&FetchMode::AudioPriority).unwrap(),
            "\"audio_priority\""
        );
        assert_eq!(
            serde_json::to_string(&SessionEndReason::ConnectionLost).unwrap(),
            "\"connection_lost\""
        );
    }
}
