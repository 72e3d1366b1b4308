//! Session orchestration.
//!
//! [`StreamPlayer`] owns at most one live session at a time. Starting a session opens the
//! source (with the reconnect budget), acquires the audio clock, and spawns the decode
//! thread. The host drives presentation by calling [`StreamPlayer::present_tick`] from its
//! own thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crossbeam_channel::{Receiver, Sender};
use stream_sync_types::{Placement, SessionEndReason, SessionStatus, StreamKind};

use crate::clock::AudioPlaybackClock;
use crate::config::SyncConfig;
use crate::decode_loop::{DecodeLoop, DecodeStats, DecodeThread, StopSignal, combined_buffered, open_with_retry};
use crate::error::{SessionError, SessionResult};
use crate::pacer::{FramePacer, PaceOutcome};
use crate::presentation::PresentationSurface;
use crate::profile::{self, SourceProfile};
use crate::queue::VideoFrameQueue;
use crate::source::{SourceOpener, StreamInfo};
use crate::voice::VoiceFactory;

const EVENT_BACKLOG: usize = 64;

/// Lifecycle notifications. Delivered best effort; a full backlog drops new events.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Started { url: String, kind: StreamKind },
    /// Initial buffering finished and audio output started.
    Buffered { buffered_ms: u64 },
    Reconnecting { attempt: u32 },
    Reconnected,
    Ended { reason: SessionEndReason },
}

/// Immutable description of a started session.
#[derive(Clone, Debug)]
pub struct StreamSession {
    pub url: String,
    pub kind: StreamKind,
    pub profile: SourceProfile,
    pub info: StreamInfo,
    pub degraded_audio_params: bool,
    pub placement: Option<Placement>,
}

/// What a stop managed to release in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StopReport {
    /// A session (running or ended) was present.
    pub had_session: bool,
    pub decode_joined: bool,
    pub audio_released: bool,
}

struct ActiveSession {
    session: StreamSession,
    stop: Arc<StopSignal>,
    stats: Arc<DecodeStats>,
    video: Arc<VideoFrameQueue>,
    clock: Arc<AudioPlaybackClock>,
    decode: Mutex<Option<DecodeThread>>,
    pacer: Mutex<FramePacer>,
    /// Buffering round the pacer baseline belongs to.
    paced_round: AtomicU64,
    frames_presented: AtomicU64,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        !self.stop.is_stopped()
    }

    fn buffered_ms(&self) -> u64 {
        let d = combined_buffered(
            self.video.len(),
            self.session.info.frame_rate,
            self.clock.buffered_duration(),
        );
        d.as_millis() as u64
    }
}

pub struct StreamPlayer {
    opener: Arc<dyn SourceOpener>,
    voices: Arc<dyn VoiceFactory>,
    config: SyncConfig,
    active: RwLock<Option<Arc<ActiveSession>>>,
    /// Stop signal of a start still connecting, so `stop` can cancel it.
    pending: Mutex<Option<Arc<StopSignal>>>,
    start_lock: Mutex<()>,
    /// Final status of the last stopped session.
    last_status: Mutex<Option<SessionStatus>>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl StreamPlayer {
    pub fn new(opener: Arc<dyn SourceOpener>, voices: Arc<dyn VoiceFactory>, config: SyncConfig) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_BACKLOG);
        Self {
            opener,
            voices,
            config,
            active: RwLock::new(None),
            pending: Mutex::new(None),
            start_lock: Mutex::new(()),
            last_status: Mutex::new(None),
            events_tx,
            events_rx,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Lifecycle events of every session this player runs.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    pub fn start(&self, url: &str, kind: StreamKind) -> SessionResult<StreamSession> {
        self.start_with_placement(url, kind, None)
    }

    /// Stop any current session and start a new one on `url`.
    ///
    /// Blocks while connecting; a concurrent [`stop`](Self::stop) cancels the attempt.
    pub fn start_with_placement(
        &self,
        url: &str,
        kind: StreamKind,
        placement: Option<Placement>,
    ) -> SessionResult<StreamSession> {
        let _starting = self.start_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.stop();

        let kind = profile::resolve_kind(kind, url);
        let profile = SourceProfile::for_kind(kind);
        let stop = StopSignal::new();
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop.clone());
        tracing::info!(url, kind = kind.label(), "starting stream session");

        let mut attempts = 0u32;
        let opened = open_with_retry(
            self.opener.as_ref(),
            url,
            &profile,
            self.config.reconnect_attempts,
            self.config.reconnect_delay,
            false,
            &stop,
            |attempt| attempts = attempt,
        );
        let source = match opened {
            Ok(source) => source,
            Err(None) => {
                self.clear_pending();
                tracing::info!(url, "session start cancelled");
                return Err(SessionError::Cancelled);
            }
            Err(Some(last)) => {
                self.clear_pending();
                tracing::error!(url, attempts, "could not open live source: {last}");
                return Err(SessionError::Connect { attempts, last });
            }
        };

        let (info, degraded_audio_params) = source.info().sanitized();
        let channels = info.channels.min(2);
        let clock = match AudioPlaybackClock::spawn(self.voices.clone(), info.sample_rate, channels, &self.config) {
            Ok(clock) => Arc::new(clock),
            Err(e) => {
                self.clear_pending();
                tracing::error!(url, "audio output unavailable: {e}");
                return Err(e);
            }
        };
        let video = Arc::new(VideoFrameQueue::new(profile.video_queue_capacity));
        let stats = Arc::new(DecodeStats::default());

        let session = StreamSession {
            url: url.to_string(),
            kind,
            profile: profile.clone(),
            info: info.clone(),
            degraded_audio_params,
            placement,
        };
        if let Some(p) = placement {
            tracing::info!(start = ?p.start, end = ?p.end, yaw = p.yaw, "presentation placement");
        }

        let decode = DecodeLoop {
            opener: self.opener.clone(),
            url: url.to_string(),
            profile,
            info: info.clone(),
            video: video.clone(),
            clock: clock.clone(),
            stop: stop.clone(),
            stats: stats.clone(),
            events: self.events_tx.clone(),
            config: self.config.clone(),
        }
        .spawn(source);
        let decode = match decode {
            Ok(thread) => thread,
            Err(e) => {
                self.clear_pending();
                clock.cleanup();
                return Err(SessionError::Spawn(e.to_string()));
            }
        };

        let active = Arc::new(ActiveSession {
            session: session.clone(),
            stop,
            stats,
            video,
            clock,
            decode: Mutex::new(Some(decode)),
            pacer: Mutex::new(FramePacer::new(info.frame_rate)),
            paced_round: AtomicU64::new(0),
            frames_presented: AtomicU64::new(0),
        });

        {
            let mut slot = self.active.write().unwrap_or_else(PoisonError::into_inner);
            self.clear_pending();
            if active.stop.is_stopped() {
                drop(slot);
                self.shutdown(&active);
                return Err(SessionError::Cancelled);
            }
            *slot = Some(active);
        }

        tracing::info!(
            url,
            kind = kind.label(),
            width = info.width,
            height = info.height,
            fps = info.frame_rate,
            rate_hz = info.sample_rate,
            channels,
            "stream session started"
        );
        let _ = self.events_tx.try_send(SessionEvent::Started {
            url: url.to_string(),
            kind,
        });
        Ok(session)
    }

    fn clear_pending(&self) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn current(&self) -> Option<Arc<ActiveSession>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stop and release the current session, if any. Also cancels a connecting start.
    pub fn stop(&self) -> StopReport {
        if let Some(pending) = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pending.stop();
        }
        let prev = self.active.write().unwrap_or_else(PoisonError::into_inner).take();
        let Some(active) = prev else {
            return StopReport::default();
        };
        let report = self.shutdown(&active);
        *self.last_status.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot(&active));
        report
    }

    fn shutdown(&self, active: &ActiveSession) -> StopReport {
        active.stop.stop();
        // releasing audio first also wakes a decode thread blocked on a full queue
        let audio_released = active.clock.cleanup();

        let decode = active.decode.lock().unwrap_or_else(PoisonError::into_inner).take();
        let decode_joined = match decode {
            Some(thread) => match thread.join_timeout(self.config.join_timeout) {
                Some(_) => true,
                None => {
                    tracing::error!(
                        url = %active.session.url,
                        timeout_ms = self.config.join_timeout.as_millis() as u64,
                        "decode thread did not exit; native leak possible"
                    );
                    false
                }
            },
            None => true,
        };

        active.video.clear();
        if active.stats.set_end_reason(SessionEndReason::Stopped) {
            let _ = self.events_tx.try_send(SessionEvent::Ended {
                reason: SessionEndReason::Stopped,
            });
        }
        tracing::info!(
            url = %active.session.url,
            decode_joined,
            audio_released,
            "stream session stopped"
        );
        StopReport {
            had_session: true,
            decode_joined,
            audio_released,
        }
    }

    /// `true` while a session's decode loop is running.
    pub fn is_active(&self) -> bool {
        self.current().is_some_and(|a| a.is_running())
    }

    /// Audio clock position in seconds; `0.0` without a session.
    pub fn current_playback_seconds(&self) -> f64 {
        self.current().map_or(0.0, |a| a.clock.current_playback_seconds())
    }

    /// Video queue time plus queued audio, in milliseconds.
    pub fn buffered_duration_ms(&self) -> u64 {
        self.current().map_or(0, |a| a.buffered_ms())
    }

    /// Release the frames due at the current clock position to `surface`.
    ///
    /// Does nothing while the session is still buffering. After a re-buffer the pacer
    /// resumes from the current position instead of catching up.
    pub fn present_tick(&self, surface: &mut dyn PresentationSurface) -> PaceOutcome {
        let Some(active) = self.current() else {
            return PaceOutcome::default();
        };
        if !active.is_running() || active.stats.is_buffering() {
            return PaceOutcome::default();
        }
        let progress = active.clock.current_playback_seconds();
        let mut pacer = active.pacer.lock().unwrap_or_else(PoisonError::into_inner);
        let round = active.stats.buffer_rounds();
        if active.paced_round.swap(round, Ordering::AcqRel) != round && round > 1 {
            tracing::debug!(
                round,
                from = pacer.last_audio_progress(),
                to = progress,
                "pacer rebased after re-buffering"
            );
            pacer.rebase(progress);
        }
        let outcome = pacer.tick(progress, &active.video, |frame| surface.upload(&frame));
        active
            .frames_presented
            .fetch_add(outcome.released as u64, Ordering::Relaxed);
        if outcome.underflow > 0 {
            tracing::trace!(underflow = outcome.underflow, "video queue ran dry");
        }
        outcome
    }

    /// Snapshot of the current session, or of the last stopped one.
    pub fn status(&self) -> SessionStatus {
        match self.current() {
            Some(active) => snapshot(&active),
            None => self
                .last_status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_default(),
        }
    }
}

fn snapshot(a: &ActiveSession) -> SessionStatus {
    let running = a.is_running();
    let audio = a.clock.queue();
    SessionStatus {
        url: Some(a.session.url.clone()),
        kind: Some(a.session.kind),
        active: running,
        buffering: running && a.stats.is_buffering(),
        playback_seconds: a.clock.current_playback_seconds(),
        buffered_ms: a.buffered_ms(),
        video_queue_len: a.video.len(),
        video_queue_capacity: a.video.capacity(),
        audio_queue_len: audio.len(),
        audio_queue_capacity: audio.capacity(),
        dropped_video_frames: a.video.dropped_frames(),
        dropped_audio_buffers: a.stats.dropped_audio.load(Ordering::Relaxed),
        format_errors: a.stats.format_errors.load(Ordering::Relaxed),
        transient_errors: a.stats.transient_errors.load(Ordering::Relaxed),
        reconnects: a.stats.reconnects.load(Ordering::Relaxed),
        frames_presented: a.frames_presented.load(Ordering::Relaxed),
        fetch_mode: a.stats.fetch_mode(),
        stream: Some(a.session.info.snapshot()),
        degraded_audio_params: a.session.degraded_audio_params,
        placement: a.session.placement,
        end_reason: a.stats.end_reason(),
    }
}

impl Drop for StreamPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
