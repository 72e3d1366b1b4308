//! Fetch-mode hysteresis.
//!
//! Decides, once per decode iteration, whether the decode loop may pull video or should
//! pull audio only. Audio priority is entered when the video queue is saturated, audio
//! has room and no mixed iteration ran within the debounce; it is left when video drains, audio fills, or the dwell limit forces a
//! return to mixed fetching so the two streams cannot drift apart for long.

use std::time::{Duration, Instant};

use stream_sync_types::FetchMode;

use crate::config::FetchModeConfig;

/// Queue sizes observed under the video queue lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueOccupancy {
    pub video_len: usize,
    pub audio_len: usize,
    pub audio_capacity: usize,
}

/// Two-state controller owned by the decode thread.
///
/// Audio priority needs a debounce of quiet since the last mixed iteration; leaving it
/// needs a debounce since it was entered, or the max dwell.
///
/// Time is passed in so transitions are deterministic under test.
#[derive(Debug)]
pub struct FetchModeController {
    config: FetchModeConfig,
    mode: FetchMode,
    /// When the current mode was entered; `None` until the first transition.
    entered_at: Option<Instant>,
    /// Last iteration that fetched in mixed mode; `None` until the first one.
    last_mixed_at: Option<Instant>,
    switches: u64,
}

impl FetchModeController {
    pub fn new(config: FetchModeConfig) -> Self {
        Self {
            config,
            mode: FetchMode::Mixed,
            entered_at: None,
            last_mixed_at: None,
            switches: 0,
        }
    }

    pub fn mode(&self) -> FetchMode {
        self.mode
    }

    /// Number of transitions so far.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Forget dwell history, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.mode = FetchMode::Mixed;
        self.entered_at = None;
        self.last_mixed_at = None;
    }

    /// Evaluate transitions against `occupancy` and return the mode for this iteration.
    pub fn decide(&mut self, occupancy: QueueOccupancy, now: Instant) -> FetchMode {
        let since = |t: Option<Instant>| {
            t.map_or(Duration::MAX, |t| now.saturating_duration_since(t))
        };
        let dwell = since(self.entered_at);
        let audio_full = occupancy.audio_len as f32
            >= occupancy.audio_capacity as f32 * self.config.audio_full_ratio;

        let next = match self.mode {
            FetchMode::Mixed => {
                if occupancy.video_len >= self.config.video_high_watermark
                    && !audio_full
                    && since(self.last_mixed_at) >= self.config.debounce
                {
                    FetchMode::AudioPriority
                } else {
                    FetchMode::Mixed
                }
            }
            FetchMode::AudioPriority => {
                let drained = occupancy.video_len <= self.config.video_low_watermark;
                if dwell >= self.config.max_audio_priority_dwell
                    || (dwell >= self.config.debounce && (drained || audio_full))
                {
                    FetchMode::Mixed
                } else {
                    FetchMode::AudioPriority
                }
            }
        };

        if next != self.mode {
            tracing::debug!(
                from = ?self.mode,
                to = ?next,
                video = occupancy.video_len,
                audio = occupancy.audio_len,
                dwell_ms = dwell.as_millis().min(u64::MAX as u128) as u64,
                "fetch mode switch"
            );
            self.mode = next;
            self.entered_at = Some(now);
            self.switches += 1;
        }
        if self.mode == FetchMode::Mixed {
            self.last_mixed_at = Some(now);
        }
        self.mode
    }
}
