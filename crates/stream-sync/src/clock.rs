//! Audio playback clock.
//!
//! Owns the hardware voice on a dedicated thread and answers one question for the rest
//! of the engine: how much audio has actually been played. Everything that touches the
//! voice runs on the owner thread; other threads submit closures over a channel and wait
//! on a one-shot reply with a timeout.
//!
//! The owner thread also runs the servicing tick: reclaim played buffers, refill the voice
//! up to a fixed buffer ceiling from the [`AudioSampleQueue`], restart output if it went
//! idle while data is queued.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::SyncConfig;
use crate::error::SessionError;
use crate::pcm::PcmBuffer;
use crate::queue::AudioSampleQueue;
use crate::voice::{AudioVoice, VoiceFactory, VoiceState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ClockState {
    /// Voice acquired; waiting for `play`.
    Ready = 0,
    Playing = 1,
    Paused = 2,
    /// Cleaned up; the clock reads 0 and accepts nothing.
    Stopped = 3,
}

impl ClockState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Playing,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

struct ClockShared {
    state: AtomicU8,
    /// Last known-good position in seconds (`f64` bits).
    progress: AtomicU64,
}

impl ClockShared {
    fn state(&self) -> ClockState {
        ClockState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClockState) -> ClockState {
        ClockState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Acquire))
    }

    /// Raise the stored position to `secs` if it is ahead; return the stored value.
    fn advance(&self, secs: f64) -> f64 {
        let mut current = self.progress.load(Ordering::Acquire);
        loop {
            let cur = f64::from_bits(current);
            if !(secs > cur) {
                return cur;
            }
            match self.progress.compare_exchange_weak(
                current,
                secs.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return secs,
                Err(actual) => current = actual,
            }
        }
    }

    fn reset(&self) {
        self.progress.store(0f64.to_bits(), Ordering::Release);
    }
}

type OwnerTask = Box<dyn FnOnce(&mut VoiceOwner) + Send>;

/// Commands that may wait for a stalled owner thread; later submissions are refused.
const OWNER_BACKLOG: usize = 16;

enum OwnerCommand {
    Run(OwnerTask),
    Shutdown,
}

struct OwnerHandle {
    join: thread::JoinHandle<()>,
    /// Disconnects when the owner thread returns.
    exited: Receiver<()>,
}

/// Tuning the clock takes from [`SyncConfig`].
#[derive(Clone, Copy, Debug)]
struct ClockTiming {
    tick: Duration,
    ceiling: usize,
    throttle_target: Duration,
    throttle_max_sleep: Duration,
    marshal_timeout: Duration,
    cleanup_timeout: Duration,
}

/// Hardware-backed playback clock and audio sink for one session.
pub struct AudioPlaybackClock {
    queue: Arc<AudioSampleQueue>,
    sample_rate: u32,
    channels: u16,
    timing: ClockTiming,
    shared: Arc<ClockShared>,
    cmd_tx: Sender<OwnerCommand>,
    owner: Mutex<Option<OwnerHandle>>,
}

impl AudioPlaybackClock {
    /// Start the owner thread and acquire a voice on it.
    ///
    /// Waits at most `config.init_timeout` for the voice.
    pub fn spawn(
        factory: Arc<dyn VoiceFactory>,
        sample_rate: u32,
        channels: u16,
        config: &SyncConfig,
    ) -> Result<Self, SessionError> {
        let timing = ClockTiming {
            tick: config.audio_tick.max(Duration::from_millis(1)),
            ceiling: config.hardware_buffers.max(1),
            throttle_target: config.throttle_target,
            throttle_max_sleep: config.throttle_max_sleep,
            marshal_timeout: config.marshal_timeout,
            cleanup_timeout: config.cleanup_timeout,
        };
        let queue = Arc::new(AudioSampleQueue::new(config.audio_queue_capacity));
        let shared = Arc::new(ClockShared {
            state: AtomicU8::new(ClockState::Ready as u8),
            progress: AtomicU64::new(0f64.to_bits()),
        });

        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(OWNER_BACKLOG);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        let (exit_tx, exited) = crossbeam_channel::bounded::<()>(0);

        let owner_queue = queue.clone();
        let owner_shared = shared.clone();
        let join = thread::Builder::new()
            .name("audio-owner".to_string())
            .spawn(move || {
                let _exit = exit_tx;
                let voice = match factory.create(sample_rate, channels) {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("{e:#}")));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let mut owner = VoiceOwner {
                    voice,
                    queue: owner_queue,
                    shared: owner_shared,
                    sample_rate,
                    ceiling: timing.ceiling,
                    released: false,
                    restarts: 0,
                };
                owner.run(&cmd_rx, timing.tick);
            })
            .map_err(|e| SessionError::Audio(format!("spawn audio owner: {e}")))?;

        match ready_rx.recv_timeout(config.init_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => {
                let _ = join.join();
                return Err(SessionError::Audio(msg));
            }
            Err(_) => {
                let _ = cmd_tx.try_send(OwnerCommand::Shutdown);
                tracing::error!(
                    timeout_ms = config.init_timeout.as_millis() as u64,
                    "audio voice did not initialize in time"
                );
                return Err(SessionError::Audio("voice initialization timed out".to_string()));
            }
        }

        tracing::info!(rate_hz = sample_rate, channels, "audio clock ready");
        Ok(Self {
            queue,
            sample_rate,
            channels,
            timing,
            shared,
            cmd_tx,
            owner: Mutex::new(Some(OwnerHandle { join, exited })),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn state(&self) -> ClockState {
        self.shared.state()
    }

    pub fn queue(&self) -> &Arc<AudioSampleQueue> {
        &self.queue
    }

    /// Run `f` on the owner thread and wait up to `timeout` for its result.
    ///
    /// Gives up at once when the owner's backlog is full.
    fn marshal<R, F>(&self, timeout: Duration, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut VoiceOwner) -> R + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let task: OwnerTask = Box::new(move |owner| {
            let _ = tx.send(f(owner));
        });
        if let Err(e) = self.cmd_tx.try_send(OwnerCommand::Run(task)) {
            if e.is_full() {
                tracing::trace!("audio owner backlog full");
            }
            return None;
        }
        rx.recv_timeout(timeout).ok()
    }

    /// Queue a buffer, waiting up to `timeout` for room. Hands it back on failure.
    pub fn offer(&self, pcm: PcmBuffer, timeout: Duration) -> Result<(), PcmBuffer> {
        if self.state() == ClockState::Stopped {
            return Err(pcm);
        }
        self.queue.offer(pcm, timeout)
    }

    /// Queue a buffer; `false` when the queue stayed full for `timeout`.
    pub fn enqueue(&self, pcm: PcmBuffer, timeout: Duration) -> bool {
        self.offer(pcm, timeout).is_ok()
    }

    /// Audio waiting in the sample queue, not yet handed to the voice.
    pub fn buffered_duration(&self) -> Duration {
        self.queue.buffered_duration(self.sample_rate)
    }

    /// Slow the calling producer while too much audio is queued.
    ///
    /// Sleeps for the excess over the target, capped per call. Returns the time slept.
    pub fn throttle_producer(&self) -> Duration {
        let buffered = self.buffered_duration();
        if buffered <= self.timing.throttle_target {
            return Duration::ZERO;
        }
        let sleep = (buffered - self.timing.throttle_target).min(self.timing.throttle_max_sleep);
        thread::sleep(sleep);
        sleep
    }

    /// Seconds of audio the hardware has played.
    ///
    /// Reads the voice's sample offset on the owner thread. A failed or late read, or a
    /// reading behind the previous one, yields the last known-good value.
    pub fn current_playback_seconds(&self) -> f64 {
        let last = self.shared.progress();
        if self.state() != ClockState::Playing {
            return last;
        }
        let rate = self.sample_rate as f64;
        match self.marshal(self.timing.marshal_timeout, |owner| owner.voice.sample_offset()) {
            Some(Ok(offset)) => self.shared.advance(offset as f64 / rate),
            Some(Err(e)) => {
                tracing::debug!("sample offset read failed: {e:#}");
                last
            }
            None => last,
        }
    }

    /// Start (or resume) output. Buffers reach the voice on the next tick.
    pub fn play(&self) {
        let prev = self.shared.state();
        if prev == ClockState::Stopped || prev == ClockState::Playing {
            return;
        }
        self.shared.set_state(ClockState::Playing);
        // a full backlog is fine, the next tick services the voice
        let _ = self
            .cmd_tx
            .try_send(OwnerCommand::Run(Box::new(|owner: &mut VoiceOwner| owner.service())));
        tracing::debug!(from = ?prev, "audio clock playing");
    }

    pub fn pause(&self) {
        if self.shared.state() != ClockState::Playing {
            return;
        }
        self.shared.set_state(ClockState::Paused);
        let paused = self.marshal(self.timing.marshal_timeout, |owner| owner.voice.pause());
        if let Some(Err(e)) = paused {
            tracing::warn!("voice pause failed: {e:#}");
        }
    }

    /// Stop the voice, release its buffers, clear the queue, and reset the clock to 0.
    ///
    /// Idempotent. Returns `false` when the owner thread did not confirm in time; the
    /// clock is considered released regardless.
    pub fn cleanup(&self) -> bool {
        self.shared.set_state(ClockState::Stopped);
        self.queue.clear();

        let Some(owner) = self
            .owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return true;
        };

        let released = self
            .marshal(self.timing.cleanup_timeout, |owner| owner.release())
            .is_some();
        let _ = self
            .cmd_tx
            .send_timeout(OwnerCommand::Shutdown, self.timing.cleanup_timeout);

        let exited = matches!(
            owner.exited.recv_timeout(self.timing.cleanup_timeout),
            Err(RecvTimeoutError::Disconnected)
        );
        if exited {
            let _ = owner.join.join();
        } else {
            tracing::error!("audio owner did not exit; logical state leak");
        }
        if !released {
            tracing::warn!("audio owner did not acknowledge release");
        }

        self.queue.clear();
        self.shared.reset();
        released && exited
    }
}

impl Drop for AudioPlaybackClock {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// State living on the owner thread.
struct VoiceOwner {
    voice: Box<dyn AudioVoice>,
    queue: Arc<AudioSampleQueue>,
    shared: Arc<ClockShared>,
    sample_rate: u32,
    ceiling: usize,
    released: bool,
    restarts: u64,
}

impl VoiceOwner {
    fn run(&mut self, cmd_rx: &Receiver<OwnerCommand>, tick: Duration) {
        let mut next_tick = Instant::now() + tick;
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match cmd_rx.recv_timeout(wait) {
                Ok(OwnerCommand::Run(task)) => task(self),
                Ok(OwnerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let now = Instant::now();
            if now >= next_tick {
                self.service();
                next_tick += tick;
                if next_tick < now {
                    next_tick = now + tick;
                }
            }
        }
        self.release();
    }

    /// One servicing step. No-op unless the clock is playing.
    fn service(&mut self) {
        if self.released || self.shared.state() != ClockState::Playing {
            return;
        }

        match self.voice.processed_buffers() {
            Ok(0) => {}
            Ok(n) => {
                if let Err(e) = self.voice.unqueue_processed(n) {
                    tracing::warn!("reclaim processed buffers failed: {e:#}");
                }
            }
            Err(e) => tracing::warn!("processed buffer query failed: {e:#}"),
        }

        let mut queued = match self.voice.queued_buffers() {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("queued buffer query failed: {e:#}");
                return;
            }
        };
        while queued < self.ceiling {
            let Some(pcm) = self.queue.poll() else {
                break;
            };
            match self.voice.queue_buffer(pcm) {
                Ok(()) => queued += 1,
                Err(e) => tracing::warn!("voice rejected buffer: {e:#}"),
            }
        }

        if queued > 0 && self.voice.state() != VoiceState::Playing {
            if self.voice.state() == VoiceState::Stopped {
                self.restarts += 1;
                tracing::debug!(restarts = self.restarts, "restarting voice after underrun");
            }
            if let Err(e) = self.voice.play() {
                tracing::warn!("voice play failed: {e:#}");
            }
        }

        if let Ok(offset) = self.voice.sample_offset() {
            self.shared.advance(offset as f64 / self.sample_rate as f64);
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.voice.stop() {
            tracing::warn!("voice stop failed: {e:#}");
        }
        tracing::debug!("audio voice released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ManualVoiceFactory;

    fn config() -> SyncConfig {
        SyncConfig {
            audio_tick: Duration::from_millis(5),
            audio_queue_capacity: 8,
            hardware_buffers: 3,
            ..SyncConfig::default()
        }
    }

    fn pcm(frames: usize) -> PcmBuffer {
        PcmBuffer::new(2, 1000, vec![0; frames * 2])
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn refills_voice_up_to_ceiling() {
        let factory = ManualVoiceFactory::default();
        let voice = factory.handle();
        let clock = AudioPlaybackClock::spawn(Arc::new(factory), 1000, 2, &config()).unwrap();
        for _ in 0..5 {
            assert!(clock.enqueue(pcm(100), Duration::ZERO));
        }
        assert_eq!(voice.queued(), 0);

        clock.play();
        assert!(wait_until(|| voice.queued() == 3));
        assert_eq!(clock.queue().len(), 2);
        assert_eq!(voice.state(), VoiceState::Playing);

        voice.advance(250);
        assert!(wait_until(|| voice.queued() == 3 && clock.queue().len() == 0));
    }

    #[test]
    fn playback_seconds_follow_sample_offset() {
        let factory = ManualVoiceFactory::default();
        let voice = factory.handle();
        let clock = AudioPlaybackClock::spawn(Arc::new(factory), 1000, 2, &config()).unwrap();
        clock.enqueue(pcm(1000), Duration::ZERO);
        clock.play();
        assert!(wait_until(|| voice.queued() == 1));

        voice.advance(500);
        assert_eq!(clock.current_playback_seconds(), 0.5);
    }

    #[test]
    fn playback_seconds_ignore_regression_and_failures() {
        let factory = ManualVoiceFactory::default();
        let voice = factory.handle();
        let clock = AudioPlaybackClock::spawn(Arc::new(factory), 1000, 2, &config()).unwrap();
        clock.enqueue(pcm(1000), Duration::ZERO);
        clock.play();
        assert!(wait_until(|| voice.queued() == 1));
        voice.advance(800);
        assert_eq!(clock.current_playback_seconds(), 0.8);

        voice.override_offset(Some(300));
        assert_eq!(clock.current_playback_seconds(), 0.8);

        voice.override_offset(None);
        voice.fail_offset(true);
        assert_eq!(clock.current_playback_seconds(), 0.8);

        voice.fail_offset(false);
        voice.advance(100);
        assert_eq!(clock.current_playback_seconds(), 0.9);
    }

    #[test]
    fn stalled_owner_keeps_backlog_bounded() {
        let config = SyncConfig {
            marshal_timeout: Duration::from_millis(1),
            ..config()
        };
        let factory = ManualVoiceFactory::default();
        let voice = factory.handle();
        let clock = AudioPlaybackClock::spawn(Arc::new(factory), 1000, 2, &config).unwrap();
        clock.enqueue(pcm(1000), Duration::ZERO);
        clock.play();
        assert!(wait_until(|| voice.queued() == 1));
        voice.advance(400);
        assert_eq!(clock.current_playback_seconds(), 0.4);

        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(1);
        let _ = clock.marshal(Duration::ZERO, move |_| {
            let _ = entered_tx.send(());
            let _ = gate_rx.recv();
        });
        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        voice.advance(100);
        for _ in 0..200 {
            assert_eq!(clock.current_playback_seconds(), 0.4);
        }
        assert!(clock.cmd_tx.len() <= OWNER_BACKLOG);

        drop(gate_tx);
        assert!(wait_until(|| clock.current_playback_seconds() == 0.5));
        assert!(clock.cleanup());
    }

    #[test]
    fn throttle_sleeps_only_past_target() {
        let factory = ManualVoiceFactory::default();
        let clock = AudioPlaybackClock::spawn(Arc::new(factory), 1000, 2, &config()).unwrap();
        clock.enqueue(pcm(150), Duration::ZERO);
        assert_eq!(clock.throttle_producer(), Duration::ZERO);

        clock.enqueue(pcm(60), Duration::ZERO);
        assert_eq!(clock.throttle_producer(), Duration::from_millis(10));

        clock.enqueue(pcm(500), Duration::ZERO);
        assert_eq!(clock.throttle_producer(), Duration::from_millis(50));
    }

    #[test]
    fn enqueue_fails_when_queue_stays_full() {
        let factory = ManualVoiceFactory::default();
        let clock = AudioPlaybackClock::spawn(Arc::new(factory), 1000, 2, &config()).unwrap();
        for _ in 0..8 {
            assert!(clock.enqueue(pcm(10), Duration::ZERO));
        }
        assert!(!clock.enqueue(pcm(10), Duration::from_millis(10)));
    }

    #[test]
    fn paused_clock_holds_position() {
        let factory = ManualVoiceFactory::default();
        let voice = factory.handle();
        let clock = AudioPlaybackClock::spawn(Arc::new(factory), 1000, 2, &config()).unwrap();
        clock.enqueue(pcm(1000), Duration::ZERO);
        clock.play();
        assert!(wait_until(|| voice.queued() == 1));
        voice.advance(400);
        assert_eq!(clock.current_playback_seconds(), 0.4);

        clock.pause();
        assert_eq!(clock.state(), ClockState::Paused);
        assert_eq!(voice.state(), VoiceState::Paused);
        assert_eq!(clock.current_playback_seconds(), 0.4);
    }

    #[test]
    fn cleanup_resets_and_is_idempotent() {
        let factory = ManualVoiceFactory::default();
        let voice = factory.handle();
        let clock = AudioPlaybackClock::spawn(Arc::new(factory), 1000, 2, &config()).unwrap();
        clock.enqueue(pcm(1000), Duration::ZERO);
        clock.enqueue(pcm(1000), Duration::ZERO);
        clock.play();
        assert!(wait_until(|| voice.queued() == 2));
        voice.advance(200);
        assert_eq!(clock.current_playback_seconds(), 0.2);

        assert!(clock.cleanup());
        assert_eq!(clock.state(), ClockState::Stopped);
        assert_eq!(clock.current_playback_seconds(), 0.0);
        assert_eq!(voice.state(), VoiceState::Stopped);
        assert_eq!(voice.queued(), 0);
        assert!(!clock.enqueue(pcm(10), Duration::ZERO));
        assert!(clock.cleanup());
    }

    #[test]
    fn failed_voice_creation_is_reported() {
        let factory = ManualVoiceFactory::failing();
        let err = AudioPlaybackClock::spawn(Arc::new(factory), 1000, 2, &config())
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, SessionError::Audio(_)));
    }
}
