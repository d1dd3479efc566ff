//! Engine frame pacing.
//!
//! The [`FrameClock`] numbers frames, measures the time between them, and
//! warns when a frame runs past its budget. It does not sleep on its own
//! unless asked to: the binary paces frames with a tokio interval, while
//! [`Engine::run_for`](crate::Engine::run_for) uses
//! [`FrameClock::sleep_remaining`].

use std::time::{Duration, Instant};

use tracing::warn;

/// Frame rate used when the configured one is unusable.
pub const FALLBACK_FRAME_RATE: f64 = 60.0;

/// Timing of a frame in progress.
#[derive(Debug, Clone, Copy)]
pub struct FrameTiming {
    /// Frame counter, starting at 1.
    pub frame_number: u64,
    /// Time since the previous frame began. Zero for the first frame.
    pub delta: Duration,
    /// When this frame began.
    pub began: Instant,
}

fn frame_period(frame_rate: f64) -> Option<Duration> {
    if !(frame_rate.is_finite() && frame_rate > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / frame_rate).ok()
}

/// Fixed-rate frame counter and budget tracker.
#[derive(Debug)]
pub struct FrameClock {
    frame_rate: f64,
    period: Duration,
    frame_number: u64,
    last_began: Option<Instant>,
}

impl FrameClock {
    /// Create a clock targeting `frame_rate` frames per second.
    ///
    /// Rates without a representable period (non-positive, non-finite, or
    /// small enough to overflow) fall back to [`FALLBACK_FRAME_RATE`].
    #[must_use]
    pub fn new(frame_rate: f64) -> Self {
        let (frame_rate, period) = match frame_period(frame_rate) {
            Some(period) => (frame_rate, period),
            None => {
                warn!(frame_rate, fallback = FALLBACK_FRAME_RATE, "unusable frame rate");
                (
                    FALLBACK_FRAME_RATE,
                    Duration::from_secs(1).div_f64(FALLBACK_FRAME_RATE),
                )
            }
        };
        Self {
            frame_rate,
            period,
            frame_number: 0,
            last_began: None,
        }
    }

    /// The effective frame rate.
    #[must_use]
    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    /// Time budget of one frame.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of frames begun so far.
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Start the next frame.
    pub fn begin(&mut self) -> FrameTiming {
        let now = Instant::now();
        let delta = self
            .last_began
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        self.last_began = Some(now);
        self.frame_number += 1;
        FrameTiming {
            frame_number: self.frame_number,
            delta,
            began: now,
        }
    }

    /// Close `timing`'s frame and return how long it took. Logs a warning if
    /// the frame overran its budget.
    pub fn finish(&self, timing: &FrameTiming) -> Duration {
        let elapsed = timing.began.elapsed();
        if elapsed > self.period {
            warn!(
                frame = timing.frame_number,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.period.as_millis() as u64,
                "frame exceeded time budget"
            );
        }
        elapsed
    }

    /// Block the calling thread until `timing`'s frame budget is used up.
    pub fn sleep_remaining(&self, timing: &FrameTiming) {
        let elapsed = timing.began.elapsed();
        if elapsed < self.period {
            std::thread::sleep(self.period - elapsed);
        }
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new(FALLBACK_FRAME_RATE)
    }
}
