//! Per-endpoint connection statistics reported by the rollback engine.

use crate::Frame;

/// Connection statistics for one remote player of the rollback session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Number of local inputs sent to this peer that it has not acknowledged yet.
    ///
    /// A growing queue means a slow or lossy link.
    pub pending_inputs: usize,
    /// Round-trip time measured with quality reports, in milliseconds.
    pub ping_ms: u64,
    /// Estimated bandwidth sent to this peer on the rollback channel, in kilobits per second.
    pub kbps_sent: usize,
    /// How many frames the local simulation is behind the remote one right now.
    pub local_frames_behind: i32,
    /// The same as [`local_frames_behind`], as reported by the remote peer.
    ///
    /// [`local_frames_behind`]: #structfield.local_frames_behind
    pub remote_frames_behind: i32,
    /// Most recent frame for which checksums were compared, if any.
    pub last_compared_frame: Option<Frame>,
    /// Local checksum at [`last_compared_frame`](#structfield.last_compared_frame).
    pub local_checksum: Option<u32>,
    /// Remote checksum at [`last_compared_frame`](#structfield.last_compared_frame).
    pub remote_checksum: Option<u32>,
}

impl NetworkStats {
    /// Creates an empty `NetworkStats`.
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(false)` means the two simulations diverged at `last_compared_frame`.
    #[must_use]
    pub fn checksums_match(&self) -> Option<bool> {
        match (self.local_checksum, self.remote_checksum) {
            (Some(local), Some(remote)) => Some(local == remote),
            _ => None,
        }
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ping: {}ms, pending: {}, kbps: {}, behind: {}/{}",
            self.ping_ms,
            self.pending_inputs,
            self.kbps_sent,
            self.local_frames_behind,
            self.remote_frames_behind
        )?;
        if let (Some(frame), Some(local), Some(remote)) = (
            self.last_compared_frame,
            self.local_checksum,
            self.remote_checksum,
        ) {
            write!(
                f,
                ", checksum@{}: {:08x}/{:08x}",
                frame.as_i32(),
                local,
                remote
            )?;
        }
        Ok(())
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

    #[test]
    fn checksums_match_needs_both_sides() {
        let mut stats = NetworkStats::new();
        assert_eq!(stats.checksums_match(), None);
        stats.local_checksum = Some(7);
        assert_eq!(stats.checksums_match(), None);
        stats.remote_checksum = Some(8);
        assert_eq!(stats.checksums_match(), Some(false));
        stats.remote_checksum = Some(7);
        assert_eq!(stats.checksums_match(), Some(true));
    }

    #[test]
    fn display_omits_checksums_until_compared() {
        let stats = NetworkStats {
            ping_ms: 40,
            pending_inputs: 2,
            ..NetworkStats::default()
        };
        let text = stats.to_string();
        assert!(text.contains("ping: 40ms"));
        assert!(!text.contains("checksum"));

        let stats = NetworkStats {
            last_compared_frame: Some(Frame::new(32)),
            local_checksum: Some(0xdead_beef),
            remote_checksum: Some(0xdead_beef),
            ..stats
        };
        assert!(stats.to_string().contains("checksum@32: deadbeef/deadbeef"));
    }
}
