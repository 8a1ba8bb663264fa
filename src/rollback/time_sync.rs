//! Sliding-window estimate of how far the local simulation runs ahead of a peer.

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Frame;

/// Frame advantages over the last `window_size` frames.
///
/// A local advantage is `remote_frame - local_frame` as seen locally: positive means the peer is
/// ahead of us. The remote advantage is the same value measured by the peer.
#[derive(Debug)]
pub struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new(30)
    }
}

impl TimeSync {
    /// Creates a window of `window_size` frames (at least one).
    #[must_use]
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            local: vec![0; window_size],
            remote: vec![0; window_size],
        }
    }

    /// Records the advantages measured at `frame`.
    pub fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32) {
        if !frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "time sync sample for invalid frame {}",
                frame
            );
            return;
        }
        let index = frame.as_i32() as usize % self.local.len();
        self.local[index] = local_adv;
        self.remote[index] = remote_adv;
    }

    /// Frames we are ahead of the peer, meeting in the middle. Negative when behind.
    #[must_use]
    pub fn frames_ahead(&self) -> f32 {
        let local_avg = self.local.iter().sum::<i32>() as f32 / self.local.len() as f32;
        let remote_avg = self.remote.iter().sum::<i32>() as f32 / self.remote.len() as f32;
        (remote_avg - local_avg) / 2.0
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

    fn fill(sync: &mut TimeSync, frames: std::ops::Range<i32>, local: i32, remote: i32) {
        for frame in frames {
            sync.advance_frame(Frame::new(frame), local, remote);
        }
    }

    #[test]
    fn balanced_peers_have_no_advantage() {
        let mut sync = TimeSync::default();
        fill(&mut sync, 0..60, 0, 0);
        assert!(sync.frames_ahead().abs() < f32::EPSILON);
    }

    #[test]
    fn running_behind_is_negative() {
        let mut sync = TimeSync::default();
        fill(&mut sync, 0..60, 4, -4);
        assert!((sync.frames_ahead() + 4.0).abs() < 1e-6);
    }

    #[test]
    fn running_ahead_is_positive() {
        let mut sync = TimeSync::default();
        fill(&mut sync, 0..60, -1, 1);
        assert!((sync.frames_ahead() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn window_slides() {
        let mut sync = TimeSync::new(10);
        fill(&mut sync, 0..10, 10, -10);
        assert!(sync.frames_ahead() < 0.0);
        fill(&mut sync, 10..20, -10, 10);
        assert!((sync.frames_ahead() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn invalid_frames_are_ignored() {
        let mut sync = TimeSync::new(4);
        sync.advance_frame(Frame::NULL, 100, -100);
        assert!(sync.frames_ahead().abs() < f32::EPSILON);
    }
}
