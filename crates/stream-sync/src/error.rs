//! Error taxonomy for the engine.
//!
//! - [`SourceError`]: live source failures, split into reconnect-worthy and per-unit.
//! - [`FormatError`]: a unit that cannot be normalized; it is dropped and decoding goes on.
//! - [`SessionError`]: failures surfaced from `StreamPlayer::start`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    /// Connection-level failure. Triggers the reconnect budget.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A single unit could not be fetched or decoded. The loop skips it.
    #[error("decode failed: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("audio unit carries no samples")]
    EmptyAudio,

    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(usize),

    #[error("planar audio has uneven planes ({0} vs {1} samples)")]
    UnevenPlanes(usize, usize),

    #[error("interleaved audio length {len} is not a multiple of {channels} channels")]
    RaggedInterleave { len: usize, channels: usize },

    #[error("video bitmap too small: need {need} bytes, have {have}")]
    ShortBitmap { need: usize, have: usize },

    #[error("video bitmap has zero dimension ({width}x{height})")]
    EmptyBitmap { width: u32, height: u32 },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect after {attempts} attempts: {last}")]
    Connect { attempts: u32, last: SourceError },

    #[error("audio output unavailable: {0}")]
    Audio(String),

    #[error("could not start decode thread: {0}")]
    Spawn(String),

    #[error("session start cancelled")]
    Cancelled,
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
