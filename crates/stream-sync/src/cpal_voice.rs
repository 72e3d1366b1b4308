//! Hardware voice on a cpal output stream.
//!
//! Submitted PCM is converted to `f32` (and resampled to the device rate when the two
//! differ) on the owner thread. The real-time callback only walks the queued buffers:
//! - mono↔stereo channel mapping to the device layout
//! - `f32` → device sample format
//! - silence on underrun or while paused
//!
//! The sample offset is reported in source-rate frames so the clock never sees the
//! device rate.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use cpal::traits::{DeviceTrait, StreamTrait};
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::device;
use crate::pcm::PcmBuffer;
use crate::voice::{AudioVoice, VoiceFactory, VoiceState};

const RESAMPLE_CHUNK_FRAMES: usize = 1024;

/// Creates [`CpalVoice`]s on the default or a named output device.
#[derive(Clone, Debug, Default)]
pub struct CpalVoiceFactory {
    /// Case-insensitive substring of the device name.
    pub device: Option<String>,
}

impl VoiceFactory for CpalVoiceFactory {
    fn create(&self, sample_rate: u32, channels: u16) -> Result<Box<dyn AudioVoice>> {
        let voice = CpalVoice::open(self.device.as_deref(), sample_rate, channels)?;
        Ok(Box::new(voice))
    }
}

/// One submitted buffer, already in device rate.
struct QueuedBuffer {
    samples: Vec<f32>,
    source_frames: u64,
}

struct VoiceShared {
    src_channels: usize,
    queue: VecDeque<QueuedBuffer>,
    /// Sample index into the front buffer.
    pos: usize,
    processed: usize,
    completed_frames: u64,
    playing: bool,
}

impl VoiceShared {
    /// Source frames played, counting the front buffer proportionally.
    fn sample_offset(&self) -> u64 {
        let partial = self.queue.front().map_or(0, |b| {
            if b.samples.is_empty() {
                0
            } else {
                b.source_frames * self.pos as u64 / b.samples.len() as u64
            }
        });
        self.completed_frames + partial
    }

    fn finish_front(&mut self) {
        if let Some(done) = self.queue.pop_front() {
            self.completed_frames += done.source_frames;
            self.processed += 1;
        }
        self.pos = 0;
    }
}

pub struct CpalVoice {
    stream: cpal::Stream,
    shared: Arc<Mutex<VoiceShared>>,
    channels: u16,
    resampler: Option<StreamResampler>,
    device_name: String,
}

impl CpalVoice {
    pub fn open(needle: Option<&str>, sample_rate: u32, channels: u16) -> Result<Self> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, needle)?;
        let device_name = device
            .description()
            .map(|d| d.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let supported = device::pick_output_config(&device, sample_rate)?;
        let sample_format = supported.sample_format();
        let mut config: cpal::StreamConfig = supported.config();
        if let Some(size) = device::pick_buffer_size(&supported) {
            config.buffer_size = size;
        }
        let device_rate = config.sample_rate;

        let src_channels = usize::from(channels.max(1));
        let shared = Arc::new(Mutex::new(VoiceShared {
            src_channels,
            queue: VecDeque::new(),
            pos: 0,
            processed: 0,
            completed_frames: 0,
            playing: false,
        }));

        let stream = build_output_stream(&device, &config, sample_format, &shared)?;
        stream.play().context("start output stream")?;

        let resampler = if device_rate != sample_rate {
            Some(StreamResampler::new(sample_rate, device_rate, src_channels)?)
        } else {
            None
        };

        tracing::info!(
            device = %device_name,
            source_rate_hz = sample_rate,
            device_rate_hz = device_rate,
            device_channels = config.channels,
            format = ?sample_format,
            resampling = resampler.is_some(),
            "cpal voice opened"
        );

        Ok(Self {
            stream,
            shared,
            channels,
            resampler,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VoiceShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioVoice for CpalVoice {
    fn queue_buffer(&mut self, pcm: PcmBuffer) -> Result<()> {
        if pcm.channels() != self.channels {
            return Err(anyhow!(
                "buffer has {} channels, voice expects {}",
                pcm.channels(),
                self.channels
            ));
        }
        let buffer = convert(self.resampler.as_mut(), &pcm)?;
        self.lock().queue.push_back(buffer);
        Ok(())
    }

    fn processed_buffers(&mut self) -> Result<usize> {
        Ok(self.lock().processed)
    }

    fn unqueue_processed(&mut self, count: usize) -> Result<usize> {
        let mut st = self.lock();
        let n = count.min(st.processed);
        st.processed -= n;
        Ok(n)
    }

    fn queued_buffers(&mut self) -> Result<usize> {
        let st = self.lock();
        Ok(st.queue.len() + st.processed)
    }

    fn sample_offset(&mut self) -> Result<u64> {
        Ok(self.lock().sample_offset())
    }

    fn state(&self) -> VoiceState {
        let st = self.lock();
        if st.playing {
            VoiceState::Playing
        } else if st.queue.is_empty() {
            VoiceState::Stopped
        } else {
            VoiceState::Paused
        }
    }

    fn play(&mut self) -> Result<()> {
        self.stream.play().context("resume output stream")?;
        self.lock().playing = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.lock().playing = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        {
            let mut st = self.lock();
            st.playing = false;
            st.queue.clear();
            st.pos = 0;
            st.processed = 0;
        }
        if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
        self.stream.pause().context("pause output stream")?;
        Ok(())
    }
}

/// Convert `pcm` to device-rate floats.
///
/// With a resampler, the buffer stands for the source frames actually consumed this call;
/// frames still held for the next chunk are counted by the buffer that plays them.
fn convert(resampler: Option<&mut StreamResampler>, pcm: &PcmBuffer) -> Result<QueuedBuffer> {
    let floats: Vec<f32> = pcm
        .samples()
        .iter()
        .map(|&s| f32::from(s) / 32768.0)
        .collect();
    let (samples, source_frames) = match resampler {
        Some(r) => r.process(&floats)?,
        None => (floats, pcm.frames() as u64),
    };
    Ok(QueuedBuffer {
        samples,
        source_frames,
    })
}

/// Fixed-chunk rubato resampler fed with arbitrary-length buffers.
struct StreamResampler {
    resampler: Box<dyn Resampler<f32>>,
    channels: usize,
    pending: Vec<f32>,
    out: Vec<f32>,
}

impl StreamResampler {
    fn new(src_rate: u32, dst_rate: u32, channels: usize) -> Result<Self> {
        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let ratio = dst_rate as f64 / src_rate as f64;
        let resampler = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            RESAMPLE_CHUNK_FRAMES,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init: {e}"))?;
        let out_frames = (RESAMPLE_CHUNK_FRAMES as f64 * ratio * 1.2).ceil() as usize + 64;
        Ok(Self {
            resampler: Box::new(resampler),
            channels,
            pending: Vec::new(),
            out: vec![0.0; out_frames * channels],
        })
    }

    /// Resample every whole chunk available; the remainder waits for the next call.
    ///
    /// Returns the output samples and the number of input frames consumed.
    fn process(&mut self, input: &[f32]) -> Result<(Vec<f32>, u64)> {
        self.pending.extend_from_slice(input);
        let chunk = RESAMPLE_CHUNK_FRAMES * self.channels;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        };
        let mut produced = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk {
            let input_adapter = InterleavedSlice::new(
                &self.pending[consumed..consumed + chunk],
                self.channels,
                RESAMPLE_CHUNK_FRAMES,
            )
            .map_err(|e| anyhow!("interleaved slice (input): {e}"))?;
            let out_frames = self.out.len() / self.channels;
            let mut output_adapter = InterleavedSlice::new_mut(&mut self.out, self.channels, out_frames)
                .map_err(|e| anyhow!("interleaved slice (output): {e}"))?;
            let (_nbr_in, nbr_out) = self
                .resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
                .map_err(|e| anyhow!("resample: {e}"))?;
            produced.extend_from_slice(&self.out[..nbr_out * self.channels]);
            consumed += chunk;
        }
        self.pending.drain(..consumed);
        Ok((produced, (consumed / self.channels) as u64))
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: &Arc<Mutex<VoiceShared>>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, shared),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, shared),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<Mutex<VoiceShared>>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = usize::from(config.channels.max(1));
    let shared_cb = shared.clone();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            let mut st = shared_cb.lock().unwrap_or_else(PoisonError::into_inner);
            if !st.playing {
                data.fill(silence);
                return;
            }
            let mut underrun_at = None;
            for (i, frame) in data.chunks_mut(channels_out).enumerate() {
                if !fill_frame(&mut st, frame) {
                    underrun_at = Some(i * channels_out);
                    break;
                }
            }
            if let Some(start) = underrun_at {
                data[start..].fill(silence);
            }
        },
        |err| tracing::warn!("output stream error: {err}"),
        None,
    )?;
    Ok(stream)
}

/// Write one device frame from the front buffer. Returns `false` on underrun.
fn fill_frame<T>(st: &mut VoiceShared, frame: &mut [T]) -> bool
where
    T: cpal::Sample + cpal::FromSample<f32>,
{
    let src_channels = st.src_channels;
    loop {
        let exhausted = st
            .queue
            .front()
            .map(|b| st.pos + src_channels > b.samples.len());
        match exhausted {
            None => return false,
            Some(true) => st.finish_front(),
            Some(false) => break,
        }
    }
    let Some(front) = st.queue.front() else {
        return false;
    };
    let src = &front.samples[st.pos..st.pos + src_channels];
    let dst_channels = frame.len();
    for (ch, out) in frame.iter_mut().enumerate() {
        *out = <T as cpal::Sample>::from_sample::<f32>(map_channel(src, dst_channels, ch));
    }
    st.pos += src_channels;
    true
}

/// One output sample for `dst_ch`: mono is duplicated, stereo is averaged down to mono,
/// and extra device channels reuse the last source channel.
fn map_channel(src: &[f32], dst_channels: usize, dst_ch: usize) -> f32 {
    match (src.len(), dst_channels) {
        (0, _) => 0.0,
        (2, 1) => 0.5 * (src[0] + src[1]),
        (n, _) => src[dst_ch.min(n - 1)],
    }
}
