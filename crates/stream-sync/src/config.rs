use std::time::Duration;

/// Hysteresis tuning for the fetch-mode controller.
#[derive(Clone, Copy, Debug)]
pub struct FetchModeConfig {
    /// Video occupancy that allows switching to audio priority.
    pub video_high_watermark: usize,
    /// Video occupancy at or below which mixed fetching resumes.
    pub video_low_watermark: usize,
    /// Fraction of audio queue capacity treated as "full".
    pub audio_full_ratio: f32,
    /// Minimum dwell in a mode before a watermark-driven switch.
    pub debounce: Duration,
    /// Longest uninterrupted stay in audio priority.
    pub max_audio_priority_dwell: Duration,
}

impl Default for FetchModeConfig {
    fn default() -> Self {
        Self {
            video_high_watermark: 8,
            video_low_watermark: 6,
            audio_full_ratio: 0.6,
            debounce: Duration::from_millis(500),
            max_audio_priority_dwell: Duration::from_millis(2000),
        }
    }
}

/// Engine tuning shared by the decode loop, the audio clock, and session teardown.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Consecutive failed (re)connect attempts before a session is given up.
    pub reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Audio servicing tick.
    pub audio_tick: Duration,
    /// Hardware buffers kept queued on the voice.
    pub hardware_buffers: usize,
    /// Capacity of the audio sample queue, in buffers.
    pub audio_queue_capacity: usize,
    /// Audio buffered beyond this is throttled on the decode thread.
    pub throttle_target: Duration,
    /// Longest single throttle sleep.
    pub throttle_max_sleep: Duration,
    /// Wait for a marshalled hardware read.
    pub marshal_timeout: Duration,
    /// Wait for the audio owner to acquire its voice.
    pub init_timeout: Duration,
    /// Wait for the audio owner to acknowledge cleanup.
    pub cleanup_timeout: Duration,
    /// Bounded join of the decode thread on stop.
    pub join_timeout: Duration,
    /// Initial buffering gives up after this long.
    pub initial_buffer_timeout: Duration,
    /// Pause after the source reports no unit available.
    pub idle_wait: Duration,
    pub fetch: FetchModeConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let hardware_buffers = 12;
        Self {
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(2000),
            audio_tick: Duration::from_millis(50),
            hardware_buffers,
            audio_queue_capacity: hardware_buffers * 2,
            throttle_target: Duration::from_millis(200),
            throttle_max_sleep: Duration::from_millis(50),
            marshal_timeout: Duration::from_millis(50),
            init_timeout: Duration::from_secs(1),
            cleanup_timeout: Duration::from_millis(500),
            join_timeout: Duration::from_millis(1500),
            initial_buffer_timeout: Duration::from_millis(5000),
            idle_wait: Duration::from_millis(5),
            fetch: FetchModeConfig::default(),
        }
    }
}
