//! Stream decode loop.
//!
//! One thread per session pulls units from the live source, as directed by the
//! fetch-mode controller, and feeds the transport queues:
//! - video → [`VideoFrameQueue`] (drop-oldest, never blocks)
//! - audio → normalized PCM → [`AudioPlaybackClock`] (bounded offer, one retry, then drop)
//!
//! After every audio push the clock throttles the loop, which is what keeps decode speed
//! tied to playback speed. Connection loss re-opens the source from scratch with a fixed
//! retry budget; when the budget runs out the session is torn down.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use stream_sync_types::{FetchMode, SessionEndReason};

use crate::clock::AudioPlaybackClock;
use crate::config::SyncConfig;
use crate::error::SourceError;
use crate::fetch_mode::{FetchModeController, QueueOccupancy};
use crate::pcm::{self, PcmBuffer};
use crate::profile::SourceProfile;
use crate::queue::VideoFrameQueue;
use crate::session::SessionEvent;
use crate::source::{LiveSource, SourceOpener, StreamInfo};
use crate::unit::{ElementaryUnit, RgbaFrame};

const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Cooperative stop flag whose waits wake as soon as it is raised.
pub struct StopSignal {
    stopped: AtomicBool,
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Arc::new(Self {
            stopped: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            rx,
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Sleep up to `timeout`; returns `true` if stopped meanwhile.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_stopped(),
        }
    }
}

/// Counters published by the decode thread.
#[derive(Default)]
pub struct DecodeStats {
    pub audio_units: AtomicU64,
    pub video_units: AtomicU64,
    pub dropped_audio: AtomicU64,
    pub format_errors: AtomicU64,
    pub transient_errors: AtomicU64,
    pub reconnects: AtomicU64,
    buffering: AtomicBool,
    /// Completed buffering phases, one per connection.
    buffer_rounds: AtomicU64,
    mode: AtomicU8,
    end_reason: Mutex<Option<SessionEndReason>>,
}

impl DecodeStats {
    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::Relaxed)
    }

    pub fn buffer_rounds(&self) -> u64 {
        self.buffer_rounds.load(Ordering::Acquire)
    }

    pub fn fetch_mode(&self) -> FetchMode {
        match self.mode.load(Ordering::Relaxed) {
            1 => FetchMode::AudioPriority,
            _ => FetchMode::Mixed,
        }
    }

    pub fn end_reason(&self) -> Option<SessionEndReason> {
        *self.end_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record why the session ended. The first reason wins; returns `false` if one was set.
    pub(crate) fn set_end_reason(&self, reason: SessionEndReason) -> bool {
        let mut g = self.end_reason.lock().unwrap_or_else(PoisonError::into_inner);
        if g.is_some() {
            return false;
        }
        *g = Some(reason);
        true
    }

    fn set_mode(&self, mode: FetchMode) {
        let v = match mode {
            FetchMode::Mixed => 0,
            FetchMode::AudioPriority => 1,
        };
        self.mode.store(v, Ordering::Relaxed);
    }
}

/// Video frames expressed as time at `frame_rate`, plus queued audio.
pub fn combined_buffered(video_frames: usize, frame_rate: f64, audio: Duration) -> Duration {
    let video = Duration::from_secs_f64(video_frames as f64 / frame_rate.max(1.0));
    video + audio
}

/// Open `url`, retrying connection failures up to `attempts` times with `delay` between
/// attempts. The wait is skipped before the first attempt unless `delay_first` is set.
///
/// Returns the last error when every attempt failed, or `None` if stopped while waiting.
#[allow(clippy::too_many_arguments)]
pub fn open_with_retry(
    opener: &dyn SourceOpener,
    url: &str,
    profile: &SourceProfile,
    attempts: u32,
    delay: Duration,
    delay_first: bool,
    stop: &Arc<StopSignal>,
    mut on_attempt: impl FnMut(u32),
) -> Result<Box<dyn LiveSource>, Option<SourceError>> {
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        if (attempt > 1 || delay_first) && stop.wait(delay) {
            return Err(None);
        }
        if stop.is_stopped() {
            return Err(None);
        }
        on_attempt(attempt);
        match opener.open(url, profile, stop) {
            Ok(source) => {
                tracing::info!(url, attempt, "live source opened");
                return Ok(source);
            }
            Err(e) => {
                tracing::warn!(url, attempt, attempts, "open failed: {e}");
                last = Some(e);
            }
        }
    }
    Err(last)
}

enum Drive {
    Stopped,
    Lost { error: SourceError, delivered: bool },
}

/// Everything the decode thread owns or shares.
pub struct DecodeLoop {
    pub opener: Arc<dyn SourceOpener>,
    pub url: String,
    pub profile: SourceProfile,
    /// Sanitized stream parameters fixed at session start.
    pub info: StreamInfo,
    pub video: Arc<VideoFrameQueue>,
    pub clock: Arc<AudioPlaybackClock>,
    pub stop: Arc<StopSignal>,
    pub stats: Arc<DecodeStats>,
    pub events: Sender<SessionEvent>,
    pub config: SyncConfig,
}

/// Handle to a running decode thread.
pub struct DecodeThread {
    join: thread::JoinHandle<SessionEndReason>,
    exited: Receiver<()>,
}

impl DecodeThread {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait up to `timeout` for the thread to end.
    ///
    /// On timeout the thread is detached and `None` is returned.
    pub fn join_timeout(self, timeout: Duration) -> Option<SessionEndReason> {
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => self.join.join().ok(),
            _ => None,
        }
    }
}

struct LoopState {
    controller: FetchModeController,
    last_drop_warn: Option<Instant>,
    last_error_warn: Option<Instant>,
    rate_mismatch_warned: bool,
}

fn warn_due(last: &mut Option<Instant>) -> bool {
    let now = Instant::now();
    match last {
        Some(t) if now.duration_since(*t) < WARN_INTERVAL => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

impl DecodeLoop {
    pub fn spawn(self, source: Box<dyn LiveSource>) -> std::io::Result<DecodeThread> {
        let (exit_tx, exited) = crossbeam_channel::bounded::<()>(0);
        let join = thread::Builder::new()
            .name("stream-decode".to_string())
            .spawn(move || {
                let _exit = exit_tx;
                self.run(source)
            })?;
        Ok(DecodeThread { join, exited })
    }

    fn run(self, mut source: Box<dyn LiveSource>) -> SessionEndReason {
        let mut state = LoopState {
            controller: FetchModeController::new(self.config.fetch),
            last_drop_warn: None,
            last_error_warn: None,
            rate_mismatch_warned: false,
        };
        // reconnect attempts across the whole session
        let mut spent = 0u32;

        let reason = loop {
            match self.drive(source.as_mut(), &mut state) {
                Drive::Stopped => break SessionEndReason::Stopped,
                Drive::Lost { error, delivered } => {
                    tracing::warn!(url = %self.url, delivered, spent, "live source lost: {error}");
                    drop(source);

                    let remaining = self.config.reconnect_attempts.saturating_sub(spent);
                    if remaining == 0 {
                        break SessionEndReason::ConnectionLost;
                    }
                    let reopened = open_with_retry(
                        self.opener.as_ref(),
                        &self.url,
                        &self.profile,
                        remaining,
                        self.config.reconnect_delay,
                        true,
                        &self.stop,
                        |attempt| {
                            spent += 1;
                            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                            let _ = self.events.try_send(SessionEvent::Reconnecting { attempt: spent });
                            tracing::info!(attempt, total = spent, "reconnecting");
                        },
                    );
                    match reopened {
                        Ok(s) => {
                            let _ = self.events.try_send(SessionEvent::Reconnected);
                            source = s;
                        }
                        Err(None) => break SessionEndReason::Stopped,
                        Err(Some(e)) => {
                            tracing::error!(
                                url = %self.url,
                                attempts = spent,
                                "reconnect budget exhausted: {e}"
                            );
                            break SessionEndReason::ConnectionLost;
                        }
                    }
                }
            }
        };

        if reason != SessionEndReason::Stopped {
            self.teardown(reason);
        }
        reason
    }

    /// Release everything after a fatal end. Explicit stops are torn down by the session.
    fn teardown(&self, reason: SessionEndReason) {
        self.stop.stop();
        self.stats.buffering.store(false, Ordering::Relaxed);
        self.stats.set_end_reason(reason);
        self.video.clear();
        self.clock.cleanup();
        tracing::error!(url = %self.url, reason = ?reason, "stream session ended");
        let _ = self.events.try_send(SessionEvent::Ended { reason });
    }

    fn buffered(&self) -> Duration {
        combined_buffered(self.video.len(), self.info.frame_rate, self.clock.buffered_duration())
    }

    fn drive(&self, source: &mut dyn LiveSource, state: &mut LoopState) -> Drive {
        state.controller.reset();
        let mut buffering_since = Some(Instant::now());
        self.stats.buffering.store(true, Ordering::Relaxed);
        let mut delivered = false;
        let audio_capacity = self.clock.queue().capacity();

        while !self.stop.is_stopped() {
            if let Some(since) = buffering_since {
                let buffered = self.buffered();
                let timed_out = since.elapsed() >= self.config.initial_buffer_timeout;
                if buffered >= self.profile.min_initial_buffer || timed_out {
                    buffering_since = None;
                    self.stats.buffer_rounds.fetch_add(1, Ordering::AcqRel);
                    self.stats.buffering.store(false, Ordering::Release);
                    let buffered_ms = buffered.as_millis() as u64;
                    if timed_out {
                        tracing::warn!(buffered_ms, "initial buffering timed out; starting anyway");
                    } else {
                        tracing::info!(buffered_ms, "initial buffering complete");
                    }
                    self.clock.play();
                    let _ = self.events.try_send(SessionEvent::Buffered { buffered_ms });
                }
            }

            let controller = &mut state.controller;
            let audio = self.clock.queue();
            let mode = self.video.with_len(|video_len| {
                let occupancy = QueueOccupancy {
                    video_len,
                    audio_len: audio.len(),
                    audio_capacity,
                };
                controller.decide(occupancy, Instant::now())
            });
            self.stats.set_mode(mode);

            match source.next_unit(mode.into()) {
                Ok(Some(unit)) => {
                    delivered = true;
                    self.handle_unit(unit, state);
                }
                Ok(None) => {
                    if self.stop.wait(self.config.idle_wait) {
                        break;
                    }
                }
                Err(SourceError::Decode(msg)) => {
                    self.stats.transient_errors.fetch_add(1, Ordering::Relaxed);
                    if warn_due(&mut state.last_error_warn) {
                        tracing::warn!("skipping undecodable unit: {msg}");
                    }
                }
                Err(error) => return Drive::Lost { error, delivered },
            }

            self.video_backlog_pause();
        }
        Drive::Stopped
    }

    fn handle_unit(&self, unit: ElementaryUnit, state: &mut LoopState) {
        match unit {
            ElementaryUnit::Video(video) => match RgbaFrame::from_unit(video) {
                Ok(frame) => {
                    self.stats.video_units.fetch_add(1, Ordering::Relaxed);
                    if self.video.push(frame).is_some() {
                        tracing::trace!("video queue full; evicted oldest frame");
                    }
                }
                Err(e) => self.format_error(&e, state),
            },
            ElementaryUnit::Audio(audio) => {
                if audio.sample_rate != self.clock.sample_rate() && !state.rate_mismatch_warned {
                    state.rate_mismatch_warned = true;
                    tracing::warn!(
                        unit_rate_hz = audio.sample_rate,
                        session_rate_hz = self.clock.sample_rate(),
                        "audio unit rate differs from session rate"
                    );
                }
                match pcm::normalize(&audio, self.clock.channels(), self.clock.sample_rate()) {
                    Ok(pcm) => self.push_audio(pcm, state),
                    Err(e) => self.format_error(&e, state),
                }
            }
        }
    }

    fn format_error(&self, e: &crate::error::FormatError, state: &mut LoopState) {
        self.stats.format_errors.fetch_add(1, Ordering::Relaxed);
        if warn_due(&mut state.last_error_warn) {
            tracing::warn!("dropping malformed unit: {e}");
        }
    }

    /// Offer with one retry; drop on the second failure.
    fn push_audio(&self, pcm: PcmBuffer, state: &mut LoopState) {
        let timeout = self.profile.audio_offer_timeout;
        let accepted = match self.clock.offer(pcm, timeout) {
            Ok(()) => true,
            Err(pcm) => {
                thread::yield_now();
                self.clock.offer(pcm, timeout).is_ok()
            }
        };
        if accepted {
            self.stats.audio_units.fetch_add(1, Ordering::Relaxed);
        } else if self.stop.is_stopped() {
            return;
        } else {
            let dropped = self.stats.dropped_audio.fetch_add(1, Ordering::Relaxed) + 1;
            if warn_due(&mut state.last_drop_warn) {
                tracing::warn!(dropped, "audio queue full; dropping buffer");
            }
        }
        self.clock.throttle_producer();
    }

    /// Short pause while the video queue is more than half full.
    fn video_backlog_pause(&self) {
        let len = self.video.len();
        let half = self.video.capacity() / 2;
        if len > half {
            let ms = (len - half).min(10) as u64;
            self.stop.wait(Duration::from_millis(ms));
        }
    }
}
