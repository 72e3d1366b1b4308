//! Simulated collaborators: voices without hardware and a synthetic live source.
//!
//! Used by tests, and by the player binary for headless runs (`--audio null`,
//! `--source synthetic`).

use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{Result, anyhow};

use crate::decode_loop::StopSignal;
use crate::error::SourceError;
use crate::pcm::PcmBuffer;
use crate::profile::SourceProfile;
use crate::source::{FetchDirective, LiveSource, SourceOpener, StreamInfo};
use crate::unit::{AudioSamples, AudioUnit, ElementaryUnit, PixelLayout, VideoUnit};
use crate::voice::{AudioVoice, VoiceFactory, VoiceState};

/// Buffer bookkeeping shared by the simulated voices.
struct SimQueue {
    buffers: VecDeque<PcmBuffer>,
    /// Leading buffers that have been fully played.
    processed: usize,
    /// Frames consumed from the first unprocessed buffer.
    partial: usize,
    played: u64,
    state: VoiceState,
}

impl SimQueue {
    fn new() -> Self {
        Self {
            buffers: VecDeque::new(),
            processed: 0,
            partial: 0,
            played: 0,
            state: VoiceState::Initial,
        }
    }

    /// Play up to `frames`; returns how many were actually available.
    fn consume(&mut self, mut frames: u64) -> u64 {
        if self.state != VoiceState::Playing {
            return 0;
        }
        let mut consumed = 0;
        while frames > 0 {
            let Some(buf) = self.buffers.get(self.processed) else {
                break;
            };
            let remaining = (buf.frames() - self.partial) as u64;
            let take = remaining.min(frames);
            self.partial += take as usize;
            frames -= take;
            consumed += take;
            if self.partial == buf.frames() {
                self.processed += 1;
                self.partial = 0;
            }
        }
        self.played += consumed;
        consumed
    }

    fn unqueue(&mut self, count: usize) -> usize {
        let n = count.min(self.processed);
        self.buffers.drain(..n);
        self.processed -= n;
        n
    }

    fn stop(&mut self) {
        self.buffers.clear();
        self.processed = 0;
        self.partial = 0;
        self.state = VoiceState::Stopped;
    }
}

struct ManualInner {
    queue: SimQueue,
    fail_offset: bool,
    offset_override: Option<u64>,
}

/// Test-side controls for a [`ManualVoice`]: time only moves when `advance` is called.
#[derive(Clone)]
pub struct ManualVoiceHandle {
    inner: Arc<Mutex<ManualInner>>,
}

impl ManualVoiceHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualInner {
                queue: SimQueue::new(),
                fail_offset: false,
                offset_override: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Play `frames` of queued audio. Returns the frames actually played.
    pub fn advance(&self, frames: u64) -> u64 {
        self.lock().queue.consume(frames)
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.buffers.len()
    }

    pub fn played_frames(&self) -> u64 {
        self.lock().queue.played
    }

    pub fn state(&self) -> VoiceState {
        self.lock().queue.state
    }

    /// Make `sample_offset` fail until cleared.
    pub fn fail_offset(&self, fail: bool) {
        self.lock().fail_offset = fail;
    }

    /// Report this offset instead of the real one.
    pub fn override_offset(&self, offset: Option<u64>) {
        self.lock().offset_override = offset;
    }
}

pub struct ManualVoice {
    handle: ManualVoiceHandle,
}

impl AudioVoice for ManualVoice {
    fn queue_buffer(&mut self, pcm: PcmBuffer) -> Result<()> {
        self.handle.lock().queue.buffers.push_back(pcm);
        Ok(())
    }

    fn processed_buffers(&mut self) -> Result<usize> {
        Ok(self.handle.lock().queue.processed)
    }

    fn unqueue_processed(&mut self, count: usize) -> Result<usize> {
        Ok(self.handle.lock().queue.unqueue(count))
    }

    fn queued_buffers(&mut self) -> Result<usize> {
        Ok(self.handle.lock().queue.buffers.len())
    }

    fn sample_offset(&mut self) -> Result<u64> {
        let g = self.handle.lock();
        if g.fail_offset {
            return Err(anyhow!("simulated offset read failure"));
        }
        Ok(g.offset_override.unwrap_or(g.queue.played))
    }

    fn state(&self) -> VoiceState {
        self.handle.lock().queue.state
    }

    fn play(&mut self) -> Result<()> {
        self.handle.lock().queue.state = VoiceState::Playing;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.handle.lock().queue.state = VoiceState::Paused;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.handle.lock().queue.stop();
        Ok(())
    }
}

/// Hands out [`ManualVoice`]s that all share one handle.
pub struct ManualVoiceFactory {
    handle: ManualVoiceHandle,
    fail: bool,
}

impl Default for ManualVoiceFactory {
    fn default() -> Self {
        Self {
            handle: ManualVoiceHandle::new(),
            fail: false,
        }
    }
}

impl ManualVoiceFactory {
    /// A factory whose `create` always fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn handle(&self) -> ManualVoiceHandle {
        self.handle.clone()
    }
}

impl VoiceFactory for ManualVoiceFactory {
    fn create(&self, _sample_rate: u32, _channels: u16) -> Result<Box<dyn AudioVoice>> {
        if self.fail {
            return Err(anyhow!("no audio device"));
        }
        Ok(Box::new(ManualVoice {
            handle: self.handle.clone(),
        }))
    }
}

/// Voice that plays into nothing at real-time speed.
pub struct WallClockVoice {
    queue: SimQueue,
    sample_rate: u32,
    since: Option<Instant>,
    carry: f64,
}

impl WallClockVoice {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            queue: SimQueue::new(),
            sample_rate: sample_rate.max(1),
            since: None,
            carry: 0.0,
        }
    }

    fn catch_up(&mut self) {
        let Some(since) = self.since else {
            return;
        };
        let now = Instant::now();
        self.since = Some(now);
        let due = now.duration_since(since).as_secs_f64() * self.sample_rate as f64 + self.carry;
        let whole = due.floor();
        self.carry = due - whole;
        self.queue.consume(whole as u64);
    }
}

impl AudioVoice for WallClockVoice {
    fn queue_buffer(&mut self, pcm: PcmBuffer) -> Result<()> {
        self.catch_up();
        self.queue.buffers.push_back(pcm);
        Ok(())
    }

    fn processed_buffers(&mut self) -> Result<usize> {
        self.catch_up();
        Ok(self.queue.processed)
    }

    fn unqueue_processed(&mut self, count: usize) -> Result<usize> {
        Ok(self.queue.unqueue(count))
    }

    fn queued_buffers(&mut self) -> Result<usize> {
        self.catch_up();
        Ok(self.queue.buffers.len())
    }

    fn sample_offset(&mut self) -> Result<u64> {
        self.catch_up();
        Ok(self.queue.played)
    }

    fn state(&self) -> VoiceState {
        self.queue.state
    }

    fn play(&mut self) -> Result<()> {
        self.queue.state = VoiceState::Playing;
        self.since = Some(Instant::now());
        self.carry = 0.0;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.catch_up();
        self.queue.state = VoiceState::Paused;
        self.since = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.queue.stop();
        self.since = None;
        Ok(())
    }
}

pub struct WallClockVoiceFactory;

impl VoiceFactory for WallClockVoiceFactory {
    fn create(&self, sample_rate: u32, _channels: u16) -> Result<Box<dyn AudioVoice>> {
        Ok(Box::new(WallClockVoice::new(sample_rate)))
    }
}

/// Failure injection for [`SyntheticOpener`].
#[derive(Clone, Debug, Default)]
pub struct SyntheticScript {
    /// Opens that fail before one succeeds (`u32::MAX` fails forever).
    pub fail_opens: u32,
    /// Each opened source drops its connection after this many units.
    pub disconnect_after: Option<u64>,
    /// Every n-th pull fails with a transient decode error.
    pub decode_error_every: Option<u64>,
    /// Every n-th audio unit carries uneven planes.
    pub malformed_audio_every: Option<u64>,
    /// Opens after this many attempts are refused.
    pub max_opens: Option<u32>,
}

/// Opens [`SyntheticSource`]s: a sine tone and a moving colour-bar pattern.
pub struct SyntheticOpener {
    info: StreamInfo,
    audio_frames: usize,
    script: SyntheticScript,
    opens: AtomicU32,
    units: Arc<AtomicU64>,
}

impl SyntheticOpener {
    pub fn new(info: StreamInfo) -> Self {
        Self {
            info,
            audio_frames: 1024,
            script: SyntheticScript::default(),
            opens: AtomicU32::new(0),
            units: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 64x36 at 30 fps with 48 kHz stereo audio.
    pub fn test_pattern() -> Self {
        Self::new(StreamInfo {
            width: 64,
            height: 36,
            frame_rate: 30.0,
            sample_rate: 48_000,
            channels: 2,
            title: Some("test pattern".to_string()),
        })
    }

    pub fn with_script(mut self, script: SyntheticScript) -> Self {
        self.script = script;
        self
    }

    /// Frames per audio unit.
    pub fn with_audio_frames(mut self, frames: usize) -> Self {
        self.audio_frames = frames.max(1);
        self
    }

    /// Open attempts so far, failed ones included.
    pub fn open_attempts(&self) -> u32 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Units delivered across all opened sources.
    pub fn units_delivered(&self) -> u64 {
        self.units.load(Ordering::Relaxed)
    }
}

impl SourceOpener for SyntheticOpener {
    fn open(
        &self,
        url: &str,
        _profile: &SourceProfile,
        _stop: &Arc<StopSignal>,
    ) -> Result<Box<dyn LiveSource>, SourceError> {
        let attempt = self.opens.fetch_add(1, Ordering::Relaxed);
        let exhausted = self.script.max_opens.is_some_and(|max| attempt >= max);
        if attempt < self.script.fail_opens || exhausted {
            return Err(SourceError::Connection(format!("synthetic refusal for {url}")));
        }
        Ok(Box::new(SyntheticSource {
            info: self.info.clone(),
            audio_frames: self.audio_frames,
            script: self.script.clone(),
            pulls: 0,
            audio_units: 0,
            audio_time: 0.0,
            video_time: 0.0,
            phase: 0.0,
            frame_index: 0,
            units: self.units.clone(),
        }))
    }
}

pub struct SyntheticSource {
    info: StreamInfo,
    audio_frames: usize,
    script: SyntheticScript,
    pulls: u64,
    audio_units: u64,
    /// Media time emitted so far, seconds.
    audio_time: f64,
    video_time: f64,
    phase: f32,
    frame_index: u32,
    units: Arc<AtomicU64>,
}

impl SyntheticSource {
    fn audio_unit(&mut self) -> AudioUnit {
        let rate = self.info.sample_rate.max(1);
        let channels = self.info.channels.max(1) as usize;
        let step = TAU * 440.0 / rate as f32;
        let mut tone = Vec::with_capacity(self.audio_frames);
        for _ in 0..self.audio_frames {
            tone.push(0.25 * self.phase.sin());
            self.phase = (self.phase + step) % TAU;
        }
        self.audio_units += 1;
        self.audio_time += self.audio_frames as f64 / rate as f64;

        let mut planes = vec![tone; channels];
        let malformed = self
            .script
            .malformed_audio_every
            .is_some_and(|n| n > 0 && self.audio_units % n == 0);
        if malformed {
            if let Some(last) = planes.last_mut() {
                last.pop();
            }
        }
        AudioUnit {
            sample_rate: rate,
            samples: AudioSamples::F32Planar(planes),
        }
    }

    fn video_unit(&mut self) -> VideoUnit {
        const BARS: [[u8; 3]; 7] = [
            [192, 192, 192],
            [192, 192, 0],
            [0, 192, 192],
            [0, 192, 0],
            [192, 0, 192],
            [192, 0, 0],
            [0, 0, 192],
        ];
        let width = self.info.width.max(1);
        let height = self.info.height.max(1);
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..height {
            for x in 0..width {
                let bar = ((x + self.frame_index) * 7 / width) as usize % BARS.len();
                data.extend_from_slice(&BARS[bar]);
            }
        }
        self.frame_index = self.frame_index.wrapping_add(1);
        self.video_time += 1.0 / self.info.frame_rate.max(1.0);
        VideoUnit {
            width,
            height,
            stride: 0,
            layout: PixelLayout::Rgb8,
            bottom_up: false,
            data,
        }
    }
}

impl LiveSource for SyntheticSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_unit(&mut self, directive: FetchDirective) -> Result<Option<ElementaryUnit>, SourceError> {
        self.pulls += 1;
        if self.script.disconnect_after.is_some_and(|limit| self.pulls > limit) {
            return Err(SourceError::Connection("synthetic disconnect".to_string()));
        }
        if self
            .script
            .decode_error_every
            .is_some_and(|n| n > 0 && self.pulls % n == 0)
        {
            return Err(SourceError::Decode("synthetic corrupt packet".to_string()));
        }

        let has_video = self.info.width > 0 && self.info.height > 0;
        let unit = match directive {
            FetchDirective::AudioAndVideo if has_video && self.video_time <= self.audio_time => {
                ElementaryUnit::Video(self.video_unit())
            }
            _ => ElementaryUnit::Audio(self.audio_unit()),
        };
        self.units.fetch_add(1, Ordering::Relaxed);
        Ok(Some(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_voice_tracks_processed_buffers() {
        let factory = ManualVoiceFactory::default();
        let handle = factory.handle();
        let mut voice = factory.create(1000, 2).unwrap();
        voice.queue_buffer(PcmBuffer::new(2, 1000, vec![0; 200])).unwrap();
        voice.queue_buffer(PcmBuffer::new(2, 1000, vec![0; 200])).unwrap();

        assert_eq!(handle.advance(50), 0);
        voice.play().unwrap();
        assert_eq!(handle.advance(150), 150);
        assert_eq!(voice.processed_buffers().unwrap(), 1);
        assert_eq!(voice.unqueue_processed(5).unwrap(), 1);
        assert_eq!(voice.queued_buffers().unwrap(), 1);
        assert_eq!(handle.advance(500), 50);
        assert_eq!(voice.sample_offset().unwrap(), 200);
    }

    #[test]
    fn synthetic_source_interleaves_by_media_time() {
        let opener = SyntheticOpener::test_pattern();
        let profile = SourceProfile::for_kind(stream_sync_types::StreamKind::Auto);
        let mut source = opener.open("synthetic://", &profile, &StopSignal::new()).unwrap();
        let mut audio = 0;
        let mut video = 0;
        for _ in 0..100 {
            match source.next_unit(FetchDirective::AudioAndVideo).unwrap() {
                Some(ElementaryUnit::Audio(_)) => audio += 1,
                Some(ElementaryUnit::Video(_)) => video += 1,
                None => {}
            }
        }
        // 1024 frames at 48 kHz is ~21 ms; a frame at 30 fps is ~33 ms
        assert!(audio > video);
        assert!(video > 30);
    }

    #[test]
    fn synthetic_source_honors_audio_only() {
        let opener = SyntheticOpener::test_pattern();
        let profile = SourceProfile::for_kind(stream_sync_types::StreamKind::Auto);
        let mut source = opener.open("synthetic://", &profile, &StopSignal::new()).unwrap();
        for _ in 0..10 {
            let unit = source.next_unit(FetchDirective::AudioOnly).unwrap().unwrap();
            assert!(unit.is_audio());
        }
    }

    #[test]
    fn scripted_failures() {
        let opener = SyntheticOpener::test_pattern().with_script(SyntheticScript {
            fail_opens: 2,
            disconnect_after: Some(3),
            decode_error_every: Some(2),
            malformed_audio_every: None,
            ..SyntheticScript::default()
        });
        let profile = SourceProfile::for_kind(stream_sync_types::StreamKind::Auto);
        assert!(opener.open("x", &profile, &StopSignal::new()).is_err());
        assert!(opener.open("x", &profile, &StopSignal::new()).is_err());
        let mut source = opener.open("x", &profile, &StopSignal::new()).unwrap();
        assert_eq!(opener.open_attempts(), 3);

        assert!(source.next_unit(FetchDirective::AudioOnly).is_ok());
        assert!(matches!(
            source.next_unit(FetchDirective::AudioOnly),
            Err(SourceError::Decode(_))
        ));
        assert!(source.next_unit(FetchDirective::AudioOnly).is_ok());
        assert!(matches!(
            source.next_unit(FetchDirective::AudioOnly),
            Err(SourceError::Connection(_))
        ));
    }
}
