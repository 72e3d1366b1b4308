//! Live audio/video stream synchronization engine.
//!
//! The decode loop fills two bounded queues, the audio clock drains one at the hardware
//! rate, and the frame pacer drains the other at the rate the audio clock advances.

pub mod clock;
pub mod config;
pub mod cpal_voice;
pub mod decode_loop;
pub mod device;
pub mod error;
pub mod fetch_mode;
pub mod pacer;
pub mod pcm;
pub mod playlist;
pub mod presentation;
pub mod profile;
pub mod queue;
pub mod session;
pub mod sim;
pub mod source;
pub mod symphonia_source;
pub mod unit;
pub mod voice;

pub use stream_sync_types::{FetchMode, SessionEndReason, SessionStatus, StreamKind};
