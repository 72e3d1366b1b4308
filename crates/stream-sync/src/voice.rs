//! Hardware audio voice abstraction.
//!
//! A voice is a streaming output with a queue of submitted buffers. The owner hands it
//! normalized PCM, reclaims the buffers it has finished with, and reads back the sample
//! position it has reached. Voices are created and used on a single owning thread, so
//! implementations need not be `Send`.

use anyhow::Result;

use crate::pcm::PcmBuffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

pub trait AudioVoice {
    /// Submit one buffer for playback after those already queued.
    fn queue_buffer(&mut self, pcm: PcmBuffer) -> Result<()>;

    /// Buffers fully played and not yet reclaimed.
    fn processed_buffers(&mut self) -> Result<usize>;

    /// Reclaim up to `count` processed buffers. Returns how many were reclaimed.
    fn unqueue_processed(&mut self, count: usize) -> Result<usize>;

    /// Buffers submitted and not yet reclaimed (processed ones included).
    fn queued_buffers(&mut self) -> Result<usize>;

    /// Frames played since the voice was created.
    fn sample_offset(&mut self) -> Result<u64>;

    fn state(&self) -> VoiceState;

    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    /// Stop output and discard every queued buffer.
    fn stop(&mut self) -> Result<()>;
}

/// Creates voices on the audio owner thread.
pub trait VoiceFactory: Send + Sync {
    fn create(&self, sample_rate: u32, channels: u16) -> Result<Box<dyn AudioVoice>>;
}
