//! Audio normalization to 16-bit interleaved PCM.
//!
//! Every audio unit is validated and converted to the single layout the hardware voice
//! accepts: signed 16-bit, interleaved, mono or stereo.

use std::time::Duration;

use crate::error::FormatError;
use crate::unit::{AudioSamples, AudioUnit};

/// Largest channel layout a source may deliver (7.1).
pub const MAX_SOURCE_CHANNELS: usize = 8;

/// Normalized audio buffer, ready for the voice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcmBuffer {
    channels: u16,
    sample_rate: u32,
    samples: Vec<i16>,
}

impl PcmBuffer {
    pub fn new(channels: u16, sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            channels: channels.max(1),
            sample_rate: sample_rate.max(1),
            samples,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames() as u64, self.sample_rate)
    }
}

/// Exact playback time of `frames` at `sample_rate`, rounded down to the nanosecond.
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    let nanos = frames as u128 * 1_000_000_000 / sample_rate.max(1) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// Validate `unit` and convert it to `out_channels` (1 or 2) at `sample_rate`.
///
/// Float samples are clamped to `[-1, 1]` and scaled by 32767. Mono sources are duplicated
/// for stereo output, stereo sources are averaged for mono output, and channels past the
/// first two are ignored. No resampling happens here: `sample_rate` is the session rate.
pub fn normalize(unit: &AudioUnit, out_channels: u16, sample_rate: u32) -> Result<PcmBuffer, FormatError> {
    let out_channels = out_channels.clamp(1, 2);
    let in_channels = unit.samples.channels();
    if in_channels == 0 || in_channels > MAX_SOURCE_CHANNELS {
        return Err(FormatError::UnsupportedChannels(in_channels));
    }

    let samples = match &unit.samples {
        AudioSamples::F32Planar(planes) => {
            let frames = plane_frames(planes)?;
            interleave(in_channels, frames, out_channels, |ch, i| f32_to_i16(planes[ch][i]))
        }
        AudioSamples::S16Planar(planes) => {
            let frames = plane_frames(planes)?;
            interleave(in_channels, frames, out_channels, |ch, i| planes[ch][i])
        }
        AudioSamples::F32Interleaved { channels, data } => {
            let frames = interleaved_frames(data.len(), *channels)?;
            interleave(in_channels, frames, out_channels, |ch, i| {
                f32_to_i16(data[i * channels + ch])
            })
        }
        AudioSamples::S16Interleaved { channels, data } => {
            let frames = interleaved_frames(data.len(), *channels)?;
            if *channels == out_channels as usize {
                data.clone()
            } else {
                interleave(in_channels, frames, out_channels, |ch, i| data[i * channels + ch])
            }
        }
    };

    Ok(PcmBuffer::new(out_channels, sample_rate, samples))
}

fn plane_frames<T>(planes: &[Vec<T>]) -> Result<usize, FormatError> {
    let frames = planes.first().map(Vec::len).unwrap_or(0);
    if let Some(other) = planes.iter().find(|p| p.len() != frames) {
        return Err(FormatError::UnevenPlanes(frames, other.len()));
    }
    if frames == 0 {
        return Err(FormatError::EmptyAudio);
    }
    Ok(frames)
}

fn interleaved_frames(len: usize, channels: usize) -> Result<usize, FormatError> {
    if len == 0 {
        return Err(FormatError::EmptyAudio);
    }
    if len % channels != 0 {
        return Err(FormatError::RaggedInterleave { len, channels });
    }
    Ok(len / channels)
}

fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * 32767.0) as i16
}

fn interleave<F>(in_channels: usize, frames: usize, out_channels: u16, get: F) -> Vec<i16>
where
    F: Fn(usize, usize) -> i16,
{
    let mut out = Vec::with_capacity(frames * out_channels as usize);
    for i in 0..frames {
        match (in_channels, out_channels) {
            (1, 1) => out.push(get(0, i)),
            (_, 1) => out.push(((get(0, i) as i32 + get(1, i) as i32) / 2) as i16),
            (1, _) => {
                let s = get(0, i);
                out.push(s);
                out.push(s);
            }
            _ => {
                out.push(get(0, i));
                out.push(get(1, i));
            }
        }
    }
    out
}
