//! Bounded transport queues between the decode thread and its consumers.
//!
//! - [`VideoFrameQueue`]: decode thread → presentation thread. Never blocks the producer;
//!   overflow evicts the oldest frame.
//! - [`AudioSampleQueue`]: decode thread → audio owner thread. The producer waits a
//!   bounded time for space and gets the buffer back if none frees up.
//!
//! Both keep their state under one mutex so size checks and mutations cannot race.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::pcm::{PcmBuffer, frames_to_duration};
use crate::unit::RgbaFrame;

/// Bounded drop-oldest queue of decoded video frames.
///
/// Generic over the frame type so pacing logic can be exercised without bitmaps.
pub struct VideoFrameQueue<T = RgbaFrame> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> VideoFrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a frame, evicting the oldest one when full.
    ///
    /// Returns the evicted frame, if any.
    pub fn push(&self, frame: T) -> Option<T> {
        let mut q = self.lock();
        let evicted = if q.len() >= self.capacity {
            q.pop_front()
        } else {
            None
        };
        q.push_back(frame);
        drop(q);
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run `f` with the current length while the queue lock is held.
    ///
    /// Producers and consumers are excluded for the duration of `f`.
    pub fn with_len<R>(&self, f: impl FnOnce(usize) -> R) -> R {
        let q = self.lock();
        f(q.len())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Frames evicted by overflow since creation.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Bounded queue of normalized PCM buffers.
pub struct AudioSampleQueue {
    inner: Mutex<AudioInner>,
    space: Condvar,
    capacity: usize,
}

struct AudioInner {
    queue: VecDeque<PcmBuffer>,
    frames: u64,
}

impl AudioSampleQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(AudioInner {
                queue: VecDeque::with_capacity(capacity),
                frames: 0,
            }),
            space: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AudioInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offer a buffer, waiting up to `timeout` for space.
    ///
    /// Hands the buffer back when the queue stays full for the whole wait.
    pub fn offer(&self, pcm: PcmBuffer, timeout: Duration) -> Result<(), PcmBuffer> {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        while g.queue.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(pcm);
            }
            let (next, _timeout) = self
                .space
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            g = next;
        }
        g.frames += pcm.frames() as u64;
        g.queue.push_back(pcm);
        Ok(())
    }

    /// Take the oldest buffer without blocking.
    pub fn poll(&self) -> Option<PcmBuffer> {
        let mut g = self.lock();
        let pcm = g.queue.pop_front()?;
        g.frames = g.frames.saturating_sub(pcm.frames() as u64);
        drop(g);
        self.space.notify_all();
        Some(pcm)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Frames currently queued across all buffers.
    pub fn buffered_frames(&self) -> u64 {
        self.lock().frames
    }

    /// Queued audio expressed as playback time at `sample_rate`.
    pub fn buffered_duration(&self, sample_rate: u32) -> Duration {
        frames_to_duration(self.buffered_frames(), sample_rate)
    }

    /// Drop everything and wake blocked producers.
    pub fn clear(&self) {
        let mut g = self.lock();
        g.queue.clear();
        g.frames = 0;
        drop(g);
        self.space.notify_all();
    }
}
