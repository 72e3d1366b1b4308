use std::time::{Duration, Instant};

use stream_sync::presentation::PresentationSurface;
use stream_sync::unit::RgbaFrame;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Presentation surface with no display: counts frames and logs the presented rate.
#[derive(Debug)]
pub(crate) struct HeadlessSurface {
    total: u64,
    window_start: Instant,
    window_frames: u64,
    last_size: (u32, u32),
}

impl HeadlessSurface {
    pub(crate) fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(now: Instant) -> Self {
        Self {
            total: 0,
            window_start: now,
            window_frames: 0,
            last_size: (0, 0),
        }
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    /// Count one frame; returns the rate of the window it closed, if any.
    fn record(&mut self, frame: &RgbaFrame, now: Instant) -> Option<f64> {
        self.total += 1;
        self.window_frames += 1;
        self.last_size = (frame.width, frame.height);
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < REPORT_INTERVAL {
            return None;
        }
        let fps = self.window_frames as f64 / elapsed.as_secs_f64();
        self.window_start = now;
        self.window_frames = 0;
        Some(fps)
    }
}

impl PresentationSurface for HeadlessSurface {
    fn upload(&mut self, frame: &RgbaFrame) {
        if let Some(fps) = self.record(frame, Instant::now()) {
            tracing::info!(
                fps = (fps * 10.0).round() / 10.0,
                width = self.last_size.0,
                height = self.last_size.1,
                total = self.total,
                "presenting"
            );
        }
    }
}
