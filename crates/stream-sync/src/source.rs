//! Live source seam.
//!
//! A source is opened once per (re)connect and then pulled one unit at a time by the
//! decode loop. Demuxing and codec work happen behind this trait.

use stream_sync_types::{FetchMode, StreamInfoSnapshot};

use std::sync::Arc;

use crate::decode_loop::StopSignal;
use crate::error::SourceError;
use crate::profile::SourceProfile;
use crate::unit::ElementaryUnit;

/// Fallback when a source does not report its sample rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// What the decode loop asks the source for on one iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchDirective {
    /// Skip video; return the next audio unit.
    AudioOnly,
    /// Return the next unit of either kind.
    AudioAndVideo,
}

impl From<FetchMode> for FetchDirective {
    fn from(mode: FetchMode) -> Self {
        match mode {
            FetchMode::Mixed => Self::AudioAndVideo,
            FetchMode::AudioPriority => Self::AudioOnly,
        }
    }
}

/// Parameters a source reports after opening.
///
/// Values of `0` mean "unknown"; see [`StreamInfo::sanitized`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub title: Option<String>,
}

impl StreamInfo {
    /// Replace missing or nonsensical parameters with usable defaults.
    ///
    /// Returns the cleaned info and whether audio parameters had to be substituted.
    pub fn sanitized(&self) -> (Self, bool) {
        let mut degraded = false;
        let sample_rate = if self.sample_rate <= 1 {
            tracing::warn!(
                reported = self.sample_rate,
                fallback = DEFAULT_SAMPLE_RATE,
                "source sample rate unknown; assuming default"
            );
            degraded = true;
            DEFAULT_SAMPLE_RATE
        } else {
            self.sample_rate
        };
        let channels = if self.channels == 0 {
            tracing::warn!("source channel count unknown; assuming mono");
            degraded = true;
            1
        } else {
            self.channels
        };
        let frame_rate = if self.frame_rate.is_finite() && self.frame_rate >= 1.0 {
            self.frame_rate
        } else {
            1.0
        };
        let info = Self {
            width: self.width.max(1),
            height: self.height.max(1),
            frame_rate,
            sample_rate,
            channels,
            title: self.title.clone(),
        };
        (info, degraded)
    }

    pub fn snapshot(&self) -> StreamInfoSnapshot {
        StreamInfoSnapshot {
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            sample_rate: self.sample_rate,
            channels: self.channels,
            title: self.title.clone(),
        }
    }
}

/// An open live connection.
pub trait LiveSource: Send {
    fn info(&self) -> &StreamInfo;

    /// Pull the next unit.
    ///
    /// `Ok(None)` means nothing was available this time; the caller just tries again.
    fn next_unit(&mut self, directive: FetchDirective) -> Result<Option<ElementaryUnit>, SourceError>;
}

/// Opens live sources. Called again from scratch on every reconnect.
pub trait SourceOpener: Send + Sync {
    /// Open `url`. Blocking waits inside the source should end early once `stop` is raised.
    fn open(
        &self,
        url: &str,
        profile: &SourceProfile,
        stop: &Arc<StopSignal>,
    ) -> Result<Box<dyn LiveSource>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_substitutes_missing_audio_params() {
        let info = StreamInfo {
            frame_rate: 0.0,
            sample_rate: 1,
            channels: 0,
            ..StreamInfo::default()
        };
        let (clean, degraded) = info.sanitized();
        assert!(degraded);
        assert_eq!(clean.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(clean.channels, 1);
        assert_eq!(clean.frame_rate, 1.0);
        assert_eq!((clean.width, clean.height), (1, 1));
    }

    #[test]
    fn sanitized_keeps_valid_params() {
        let info = StreamInfo {
            width: 1280,
            height: 720,
            frame_rate: 29.97,
            sample_rate: 48_000,
            channels: 2,
            title: Some("live".to_string()),
        };
        let (clean, degraded) = info.sanitized();
        assert!(!degraded);
        assert_eq!(clean, info);
    }

    #[test]
    fn directive_follows_mode() {
        assert_eq!(FetchDirective::from(FetchMode::Mixed), FetchDirective::AudioAndVideo);
        assert_eq!(FetchDirective::from(FetchMode::AudioPriority), FetchDirective::AudioOnly);
    }
}
