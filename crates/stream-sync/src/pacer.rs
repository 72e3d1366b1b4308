//! Audio-clock-driven frame pacing.
//!
//! Each presentation tick releases exactly as many frames as the audio clock advanced
//! across frame boundaries since the previous tick. Video never waits on wall-clock time,
//! so it cannot drift from what is audible.

use crate::queue::VideoFrameQueue;

/// Result of one pacing tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PaceOutcome {
    /// Frames handed to the surface.
    pub released: usize,
    /// Frames owed but missing from the queue.
    pub underflow: usize,
    /// The clock reading was behind the previous one and was ignored.
    pub stale: bool,
}

#[derive(Debug)]
pub struct FramePacer {
    frame_rate: f64,
    last_audio_progress: f64,
    released_total: u64,
}

impl FramePacer {
    pub fn new(frame_rate: f64) -> Self {
        let frame_rate = if frame_rate.is_finite() && frame_rate >= 1.0 {
            frame_rate
        } else {
            1.0
        };
        Self {
            frame_rate,
            last_audio_progress: 0.0,
            released_total: 0,
        }
    }

    pub fn seconds_per_frame(&self) -> f64 {
        1.0 / self.frame_rate
    }

    pub fn last_audio_progress(&self) -> f64 {
        self.last_audio_progress
    }

    /// Frames released since creation.
    pub fn released_total(&self) -> u64 {
        self.released_total
    }

    /// Move the baseline to `progress` without releasing anything.
    ///
    /// Frames that fell due while presentation was held back are not owed afterwards.
    pub fn rebase(&mut self, progress: f64) {
        if progress.is_finite() && progress > self.last_audio_progress {
            self.last_audio_progress = progress;
        }
    }

    /// Release the frames due at clock position `progress` (seconds) to `present`.
    pub fn tick<T>(
        &mut self,
        progress: f64,
        queue: &VideoFrameQueue<T>,
        mut present: impl FnMut(T),
    ) -> PaceOutcome {
        if !progress.is_finite() || progress < self.last_audio_progress {
            return PaceOutcome {
                stale: true,
                ..PaceOutcome::default()
            };
        }

        let expected = (progress * self.frame_rate).floor();
        let last = (self.last_audio_progress * self.frame_rate).floor();
        let due = (expected - last).max(0.0) as usize;
        self.last_audio_progress = progress;

        let mut outcome = PaceOutcome::default();
        for _ in 0..due {
            match queue.pop() {
                Some(frame) => {
                    present(frame);
                    outcome.released += 1;
                }
                None => {
                    outcome.underflow = due - outcome.released;
                    break;
                }
            }
        }
        self.released_total += outcome.released as u64;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> VideoFrameQueue<usize> {
        let q = VideoFrameQueue::new(n.max(1));
        for i in 0..n {
            q.push(i);
        }
        q
    }

    #[test]
    fn one_second_at_30fps_releases_30() {
        let q = filled(40);
        let mut pacer = FramePacer::new(30.0);
        let mut seen = Vec::new();
        let out = pacer.tick(1.0, &q, |f| seen.push(f));
        assert_eq!(out.released, 30);
        assert_eq!(seen, (0..30).collect::<Vec<_>>());
        assert_eq!(q.len(), 10);
    }

    #[test]
    fn rebase_skips_frames_due_while_held() {
        let q = filled(40);
        let mut pacer = FramePacer::new(30.0);
        assert_eq!(pacer.tick(0.5, &q, |_| {}).released, 15);

        pacer.rebase(1.5);
        assert_eq!(pacer.tick(1.5, &q, |_| {}).released, 0);
        assert_eq!(pacer.tick(1.6, &q, |_| {}).released, 3);
        // never moves backwards
        pacer.rebase(1.0);
        assert_eq!(pacer.last_audio_progress(), 1.6);
    }

    #[test]
    fn unchanged_clock_releases_nothing() {
        let q = filled(40);
        let mut pacer = FramePacer::new(30.0);
        pacer.tick(0.5, &q, |_| {});
        let out = pacer.tick(0.5, &q, |_| {});
        assert_eq!(out, PaceOutcome::default());
    }

    #[test]
    fn regressive_clock_is_skipped_without_rewind() {
        let q = filled(40);
        let mut pacer = FramePacer::new(25.0);
        pacer.tick(1.0, &q, |_| {});
        let out = pacer.tick(0.9, &q, |_| {});
        assert!(out.stale);
        assert_eq!(out.released, 0);
        assert_eq!(pacer.last_audio_progress(), 1.0);
        // 1.0 -> 1.08 crosses two frame boundaries at 25 fps
        assert_eq!(pacer.tick(1.08, &q, |_| {}).released, 2);
    }

    #[test]
    fn sub_frame_advances_accumulate() {
        let q = filled(10);
        let mut pacer = FramePacer::new(10.0);
        let mut total = 0;
        for step in 1..=10 {
            total += pacer.tick(step as f64 * 0.05, &q, |_| {}).released;
        }
        assert_eq!(total, 5);
        assert_eq!(pacer.released_total(), 5);
    }

    #[test]
    fn underflow_stops_early_and_does_not_owe_frames() {
        let q = filled(3);
        let mut pacer = FramePacer::new(10.0);
        let out = pacer.tick(0.5, &q, |_| {});
        assert_eq!(out.released, 3);
        assert_eq!(out.underflow, 2);

        q.push(99);
        let out = pacer.tick(0.5, &q, |_| {});
        assert_eq!(out.released, 0);
        assert_eq!(q.len(), 1);
    }
}
