//! Windowed state checksums for desync detection.
//!
//! Hashing a whole machine state every frame costs too much, so each frame hashes one
//! 16 KiB window of the saved buffer. The window rotates with the frame number: over
//! `len / 16 KiB` frames every byte of the state is covered once. Peers that hold
//! bit-identical state for the same frame always pick the same window and seed, so their
//! checksums agree.
//!
//! ```
//! use rollback_netplay::checksum::{frame_checksum, CHECKSUM_WINDOW};
//! use rollback_netplay::Frame;
//!
//! let state = vec![7u8; CHECKSUM_WINDOW * 4];
//! let a = frame_checksum(Frame::new(10), &state);
//! assert_eq!(a, frame_checksum(Frame::new(10), &state));
//! assert_ne!(a, frame_checksum(Frame::new(11), &state));
//! ```

use crate::Frame;
use xxhash_rust::xxh32::xxh32;

/// Size of the window hashed per frame.
pub const CHECKSUM_WINDOW: usize = 16 * 1024;

/// Byte range of `len` hashed for `frame`.
///
/// Buffers shorter than one window are hashed whole.
#[must_use]
pub fn checksum_window(frame: Frame, len: usize) -> std::ops::Range<usize> {
    let groups = len / CHECKSUM_WINDOW;
    if groups == 0 {
        return 0..len;
    }
    let group = frame.as_i32().rem_euclid(groups as i32) as usize;
    let start = group * CHECKSUM_WINDOW;
    start..start + CHECKSUM_WINDOW
}

/// XXH32 of the frame's window, seeded with the frame number.
#[must_use]
pub fn frame_checksum(frame: Frame, state: &[u8]) -> u32 {
    let window = checksum_window(frame, state.len());
    xxh32(&state[window], frame.as_i32() as u32)
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

    #[test]
    fn window_rotates_with_frame() {
        let len = CHECKSUM_WINDOW * 3 + 100;
        assert_eq!(checksum_window(Frame::new(0), len), 0..CHECKSUM_WINDOW);
        assert_eq!(
            checksum_window(Frame::new(1), len),
            CHECKSUM_WINDOW..CHECKSUM_WINDOW * 2
        );
        assert_eq!(checksum_window(Frame::new(3), len), 0..CHECKSUM_WINDOW);
    }

    #[test]
    fn small_buffers_are_hashed_whole() {
        assert_eq!(checksum_window(Frame::new(9), 100), 0..100);
        assert_eq!(checksum_window(Frame::new(9), 0), 0..0);
        let _ = frame_checksum(Frame::new(9), &[]);
    }

    #[test]
    fn changes_outside_the_window_are_not_seen() {
        let mut state = vec![0u8; CHECKSUM_WINDOW * 2];
        let before = frame_checksum(Frame::new(0), &state);
        state[CHECKSUM_WINDOW + 5] = 1;
        assert_eq!(before, frame_checksum(Frame::new(0), &state));
        assert_ne!(
            frame_checksum(Frame::new(1), &vec![0u8; CHECKSUM_WINDOW * 2]),
            frame_checksum(Frame::new(1), &state)
        );
    }

    #[test]
    fn changes_inside_the_window_are_seen() {
        let mut state = vec![0u8; CHECKSUM_WINDOW * 2];
        let before = frame_checksum(Frame::new(2), &state);
        state[17] = 0xFF;
        assert_ne!(before, frame_checksum(Frame::new(2), &state));
    }

    proptest! {
        #[test]
        fn checksum_is_deterministic(frame in 0i32..100_000, bytes in proptest::collection::vec(any::<u8>(), 0..(CHECKSUM_WINDOW * 3))) {
            let copy = bytes.clone();
            prop_assert_eq!(frame_checksum(Frame::new(frame), &bytes), frame_checksum(Frame::new(frame), &copy));
        }

        #[test]
        fn window_is_in_bounds(frame in 0i32..i32::MAX, len in 0usize..(CHECKSUM_WINDOW * 8)) {
            let window = checksum_window(Frame::new(frame), len);
            prop_assert!(window.end <= len);
            prop_assert!(window.start <= window.end);
        }
    }
}
