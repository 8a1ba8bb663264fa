//! Adaptive frame throttle.
//!
//! The pacer schedules one frame per period, where the period comes from the base tick rate
//! and a speed multiplier. Time-sync events stretch or compress the period for a while so the
//! local clock drifts back towards the other peers, then the speed returns to 1.0.
//!
//! Waits are split into short slices so the transport keeps being polled while a frame is
//! pending.

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::Frame;

/// Share of the reported drift corrected per time-sync event.
const DRIFT_CORRECTION_DIVISOR: f64 = 4.0;
/// Share of the time-sync period over which the correction is spread.
const RECOVERY_WINDOW_FRACTION: f64 = 0.75;
/// Bounds of the corrected speed. Large drifts over short periods would otherwise stop the
/// clock or run it backwards.
const MIN_SPEED: f64 = 0.5;
const MAX_SPEED: f64 = 2.0;

/// What the caller does before running the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// The frame is already late. The schedule skipped `periods` whole periods; run now.
    Snap {
        /// Whole periods skipped.
        periods: u32,
    },
    /// Wait until the deadline, polling in between.
    WaitUntil(Instant),
}

/// Frame scheduler with time-sync speed correction.
///
/// ```
/// use rollback_netplay::{FramePacer, Frame};
/// use web_time::{Duration, Instant};
///
/// let start = Instant::now();
/// let mut pacer = FramePacer::new(50.0, Duration::from_millis(2), start);
/// assert_eq!(pacer.period(), Duration::from_millis(20));
///
/// // Two frames ahead: slow down for 0.75 * 60 frames.
/// pacer.handle_time_sync(2.0, 60, Frame::new(100));
/// assert!(pacer.target_speed() < 1.0);
/// assert_eq!(pacer.recovery_frame(), Frame::new(145));
/// ```
#[derive(Debug, Clone)]
pub struct FramePacer {
    base_hz: f64,
    target_speed: f64,
    period: Duration,
    next_frame_time: Instant,
    recovery_frame: Frame,
    slice: Duration,
}

impl FramePacer {
    /// Creates a pacer at full speed whose first frame is due one period after `now`.
    #[must_use]
    pub fn new(base_hz: f64, slice: Duration, now: Instant) -> Self {
        let mut pacer = Self {
            base_hz: if base_hz > 0.0 { base_hz } else { 60.0 },
            target_speed: 1.0,
            period: Duration::ZERO,
            next_frame_time: now,
            recovery_frame: Frame::NULL,
            slice: slice.max(Duration::from_micros(100)),
        };
        pacer.reset(now);
        pacer
    }

    /// Back to full speed, with the next frame due one period after `now`.
    pub fn reset(&mut self, now: Instant) {
        self.target_speed = 1.0;
        self.recovery_frame = Frame::NULL;
        self.update_period();
        self.next_frame_time = now + self.period;
    }

    /// Adjusts the speed to absorb `frame_delta` frames of drift (positive when ahead).
    ///
    /// A quarter of the drift is spread over three quarters of `update_interval` frames, after
    /// which the speed returns to 1.0. Drift under one frame is ignored.
    pub fn handle_time_sync(&mut self, frame_delta: f32, update_interval: u32, current_frame: Frame) {
        if frame_delta.abs() < 1.0 || update_interval == 0 {
            return;
        }
        let period = self.period.as_secs_f64();
        let total_time = f64::from(frame_delta) * period / DRIFT_CORRECTION_DIVISOR;
        let correction_frames = f64::from(update_interval) * RECOVERY_WINDOW_FRACTION;
        let added_time_per_frame = -(total_time / correction_frames);

        self.target_speed = ((period + added_time_per_frame) / period).clamp(MIN_SPEED, MAX_SPEED);
        self.recovery_frame = current_frame.saturating_add(correction_frames.ceil() as i32);
        self.update_period();

        debug!(
            "Time sync: {:.2} frames {}, target speed {:.4}%",
            frame_delta.abs(),
            if frame_delta >= 0.0 { "ahead" } else { "behind" },
            self.target_speed * 100.0
        );
    }

    /// Advances the schedule by one period and tells the caller how to wait for it.
    ///
    /// Returns to full speed first once `current_frame` reached the recovery frame. When
    /// `now` is already past the deadline, the deadline moves forward by whole periods instead
    /// of running the missed frames back to back.
    pub fn schedule(&mut self, now: Instant, current_frame: Frame) -> Throttle {
        if self.target_speed != 1.0 && current_frame >= self.recovery_frame {
            self.target_speed = 1.0;
            self.recovery_frame = Frame::NULL;
            self.update_period();
            debug!(
                "Time sync recovery at frame {}, target speed {:.4}%",
                current_frame,
                self.target_speed * 100.0
            );
        }

        self.next_frame_time += self.period;
        if now > self.next_frame_time {
            let behind = now - self.next_frame_time;
            let periods = (behind.as_nanos() / self.period.as_nanos().max(1)).min(u128::from(u32::MAX)) as u32;
            self.next_frame_time += self.period * periods;
            trace!("Frame late by {:?}, skipped {} periods", behind, periods);
            return Throttle::Snap { periods };
        }
        Throttle::WaitUntil(self.next_frame_time)
    }

    /// Length of the next wait slice before `deadline`, or `None` once it passed.
    #[must_use]
    pub fn slice_until(&self, deadline: Instant, now: Instant) -> Option<Duration> {
        (now < deadline).then(|| (deadline - now).min(self.slice))
    }

    /// Schedules the next frame and waits for it, calling `poll` with each slice.
    ///
    /// A late frame gets a single non-blocking `poll(Duration::ZERO)`. `poll` returns `false`
    /// to stop waiting early.
    pub fn throttle<F>(&mut self, current_frame: Frame, mut poll: F)
    where
        F: FnMut(Duration) -> bool,
    {
        match self.schedule(Instant::now(), current_frame) {
            Throttle::Snap { .. } => {
                poll(Duration::ZERO);
            },
            Throttle::WaitUntil(deadline) => {
                while let Some(slice) = self.slice_until(deadline, Instant::now()) {
                    if !poll(slice) {
                        break;
                    }
                }
            },
        }
    }

    /// Current speed multiplier. 1.0 is the base tick rate.
    #[must_use]
    pub fn target_speed(&self) -> f64 {
        self.target_speed
    }

    /// Current frame period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// When the frame scheduled last is due.
    #[must_use]
    pub fn next_frame_time(&self) -> Instant {
        self.next_frame_time
    }

    /// Frame at which the speed returns to 1.0, or [`Frame::NULL`] at full speed.
    #[must_use]
    pub fn recovery_frame(&self) -> Frame {
        self.recovery_frame
    }

    fn update_period(&mut self) {
        self.period = Duration::from_secs_f64(1.0 / (self.base_hz * self.target_speed));
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pacer(now: Instant) -> FramePacer {
        FramePacer::new(60.0, Duration::from_millis(2), now)
    }

    #[test]
    fn without_time_sync_every_tick_adds_exactly_one_period() {
        let start = Instant::now();
        let mut pacer = pacer(start);
        let period = pacer.period();
        for tick in 1..=600u32 {
            let throttle = pacer.schedule(start, Frame::new(tick as i32));
            assert_eq!(throttle, Throttle::WaitUntil(start + period * (tick + 1)));
            assert_eq!(pacer.target_speed(), 1.0);
            assert_eq!(pacer.period(), period);
        }
    }

    #[test]
    fn small_drift_is_ignored() {
        let start = Instant::now();
        let mut pacer = pacer(start);
        pacer.handle_time_sync(0.9, 60, Frame::new(10));
        pacer.handle_time_sync(-0.5, 60, Frame::new(10));
        assert_eq!(pacer.target_speed(), 1.0);
        assert_eq!(pacer.recovery_frame(), Frame::NULL);
    }

    #[test]
    fn being_ahead_slows_down_and_behind_speeds_up() {
        let start = Instant::now();
        let mut ahead = pacer(start);
        ahead.handle_time_sync(3.0, 60, Frame::new(0));
        assert!(ahead.target_speed() < 1.0);
        assert!(ahead.period() > Duration::from_secs_f64(1.0 / 60.0));

        let mut behind = pacer(start);
        behind.handle_time_sync(-3.0, 60, Frame::new(0));
        assert!(behind.target_speed() > 1.0);
        assert!(behind.period() < Duration::from_secs_f64(1.0 / 60.0));
    }

    #[test]
    fn correction_uses_a_quarter_of_the_drift() {
        let start = Instant::now();
        let mut pacer = pacer(start);
        pacer.handle_time_sync(4.0, 60, Frame::new(0));
        // One period of drift spread over 45 frames.
        let expected = 1.0 - 1.0 / 45.0;
        assert!((pacer.target_speed() - expected).abs() < 1e-9);
        assert_eq!(pacer.recovery_frame(), Frame::new(45));
    }

    #[test]
    fn speed_recovers_at_the_recovery_frame() {
        let start = Instant::now();
        let mut pacer = pacer(start);
        pacer.handle_time_sync(2.0, 60, Frame::new(100));
        pacer.schedule(start, Frame::new(144));
        assert!(pacer.target_speed() < 1.0);
        pacer.schedule(start, Frame::new(145));
        assert_eq!(pacer.target_speed(), 1.0);
        assert_eq!(pacer.recovery_frame(), Frame::NULL);
    }

    #[test]
    fn late_frames_snap_by_whole_periods() {
        let start = Instant::now();
        let mut pacer = pacer(start);
        let period = pacer.period();
        let late = start + period * 10 + period / 2;
        let throttle = pacer.schedule(late, Frame::new(1));
        assert_eq!(throttle, Throttle::Snap { periods: 8 });
        assert!(pacer.next_frame_time() <= late);
        assert!(late - pacer.next_frame_time() < period);
        assert!(matches!(
            pacer.schedule(late, Frame::new(2)),
            Throttle::WaitUntil(_)
        ));
    }

    #[test]
    fn slices_never_exceed_the_configured_length() {
        let start = Instant::now();
        let pacer = pacer(start);
        let deadline = start + Duration::from_millis(5);
        assert_eq!(
            pacer.slice_until(deadline, start),
            Some(Duration::from_millis(2))
        );
        assert_eq!(
            pacer.slice_until(deadline, start + Duration::from_millis(4)),
            Some(Duration::from_millis(1))
        );
        assert_eq!(pacer.slice_until(deadline, deadline), None);
    }

    #[test]
    fn throttle_polls_until_the_deadline() {
        let mut pacer = pacer(Instant::now());
        let mut slices = Vec::new();
        pacer.throttle(Frame::new(0), |slice| {
            slices.push(slice);
            std::thread::sleep(slice);
            true
        });
        assert!(!slices.is_empty());
        assert!(slices.iter().all(|s| *s <= Duration::from_millis(2)));
    }

    #[test]
    fn throttle_stops_when_poll_says_so() {
        let mut pacer = pacer(Instant::now());
        let mut calls = 0;
        pacer.throttle(Frame::new(0), |_| {
            calls += 1;
            false
        });
        assert_eq!(calls, 1);
    }

    proptest! {
        /// The corrected speed always moves against the drift and recovery lies ahead.
        #[test]
        fn correction_opposes_drift(delta in -20.0f32..20.0, interval in 1u32..600, frame in 0i32..100_000) {
            let mut pacer = pacer(Instant::now());
            pacer.handle_time_sync(delta, interval, Frame::new(frame));
            if delta.abs() < 1.0 {
                prop_assert_eq!(pacer.target_speed(), 1.0);
            } else {
                prop_assert!((MIN_SPEED..=MAX_SPEED).contains(&pacer.target_speed()));
                prop_assert_eq!(pacer.target_speed() < 1.0, delta > 0.0);
                prop_assert!(pacer.recovery_frame() > Frame::new(frame));
            }
        }
    }
}
