//! Per-player circular input queue with frame delay and prediction.

use std::cmp;

use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{report_violation, Frame, InputStatus, NetInput, NetplayError};

/// An input tagged with the frame it applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlayerInput<I> {
    /// Frame the input applies to.
    pub frame: Frame,
    /// The input itself.
    pub input: I,
}

impl<I: NetInput> PlayerInput<I> {
    /// Creates a new input for `frame`.
    pub fn new(frame: Frame, input: I) -> Self {
        Self { frame, input }
    }

    /// The "no input" value for `frame`.
    #[must_use]
    pub fn blank_input(frame: Frame) -> Self {
        Self {
            frame,
            input: I::default(),
        }
    }
}

/// Inputs of one player, confirmed or predicted.
///
/// Predictions repeat the last confirmed input. Every input added here is confirmed (local
/// or received), so all peers predict the same value for the same player.
#[derive(Debug, Clone)]
pub struct InputQueue<I> {
    /// The newest input is written here.
    head: usize,
    /// The oldest input still valid.
    tail: usize,
    length: usize,
    first_frame: bool,

    last_added_frame: Frame,
    first_incorrect_frame: Frame,
    /// Nothing at or after this frame may be discarded.
    last_requested_frame: Frame,

    frame_delay: usize,
    queue_length: usize,

    inputs: Vec<PlayerInput<I>>,
    prediction: PlayerInput<I>,
    last_confirmed_input: Option<I>,
}

impl<I: NetInput> InputQueue<I> {
    /// Creates an empty queue holding at most `queue_length` frames.
    ///
    /// Returns `None` if `queue_length < 2`.
    #[must_use]
    pub fn with_queue_length(queue_length: usize) -> Option<Self> {
        if queue_length < 2 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Queue length must be at least 2, got {}",
                queue_length
            );
            return None;
        }
        Some(Self {
            head: 0,
            tail: 0,
            length: 0,
            first_frame: true,
            last_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            frame_delay: 0,
            queue_length,
            inputs: vec![PlayerInput::blank_input(Frame::NULL); queue_length],
            prediction: PlayerInput::blank_input(Frame::NULL),
            last_confirmed_input: None,
        })
    }

    /// The first frame whose prediction turned out wrong, or [`Frame::NULL`].
    pub fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    /// Sets the delay applied to inputs added from now on.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if `delay >= queue_length`.
    pub fn set_frame_delay(&mut self, delay: usize) -> Result<(), NetplayError> {
        if delay >= self.queue_length {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "frame delay {} must be below the input queue length {}",
                    delay, self.queue_length
                ),
            });
        }
        self.frame_delay = delay;
        Ok(())
    }

    /// Leaves prediction mode after a rollback.
    pub fn reset_prediction(&mut self) {
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Drops inputs before `frame`. Inputs that were requested but not yet confirmed stay.
    pub fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        if !self.last_requested_frame.is_null() {
            frame = cmp::min(frame, self.last_requested_frame);
        }

        if self.length == 0 {
            return;
        }
        if frame >= self.last_added_frame {
            // keep only the newest input
            self.tail = if self.head == 0 {
                self.queue_length - 1
            } else {
                self.head - 1
            };
            self.length = 1;
        } else if frame > self.inputs[self.tail].frame {
            let offset = (frame - self.inputs[self.tail].frame) as usize;
            self.tail = (self.tail + offset) % self.queue_length;
            self.length -= offset;
        }
    }

    /// The input for `requested_frame`, or a prediction if it has not arrived yet.
    ///
    /// Returns `None` while a misprediction is pending (the engine must roll back first) or
    /// when the frame was already discarded.
    pub fn input(&mut self, requested_frame: Frame) -> Option<(I, InputStatus)> {
        if !self.first_incorrect_frame.is_null() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "input for frame {} requested while misprediction at {} is pending",
                requested_frame,
                self.first_incorrect_frame
            );
            return None;
        }

        self.last_requested_frame = requested_frame;

        if self.length > 0 && requested_frame < self.inputs[self.tail].frame {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "requested frame {} is before oldest queued frame {}",
                requested_frame,
                self.inputs[self.tail].frame
            );
            return None;
        }

        if self.prediction.frame.is_null() {
            if self.length > 0 {
                let offset = (requested_frame - self.inputs[self.tail].frame) as usize;
                if offset < self.length {
                    let index = (offset + self.tail) % self.queue_length;
                    let stored = self.inputs[index];
                    if stored.frame != requested_frame {
                        report_violation!(
                            ViolationSeverity::Critical,
                            ViolationKind::InputQueue,
                            "queue index {} holds frame {} instead of {}",
                            index,
                            stored.frame,
                            requested_frame
                        );
                        return None;
                    }
                    return Some((stored.input, InputStatus::Confirmed));
                }
            }

            self.prediction = PlayerInput {
                frame: requested_frame,
                input: self.last_confirmed_input.unwrap_or_default(),
            };
        }

        Some((self.prediction.input, InputStatus::Predicted))
    }

    /// Adds the next input, shifted by the frame delay. Returns the frame it was stored at, or
    /// [`Frame::NULL`] if it was dropped for being out of sequence.
    pub fn add_input(&mut self, input: PlayerInput<I>) -> Frame {
        if !self.last_added_frame.is_null()
            && input.frame + self.frame_delay as i32 != self.last_added_frame + 1
        {
            return Frame::NULL;
        }

        let new_frame = self.advance_queue_head(input.frame);
        if !new_frame.is_null() && !self.add_input_by_frame(input, new_frame) {
            return Frame::NULL;
        }
        new_frame
    }

    fn previous_position(&self) -> usize {
        match self.head {
            0 => self.queue_length - 1,
            _ => self.head - 1,
        }
    }

    fn add_input_by_frame(&mut self, input: PlayerInput<I>, frame_number: Frame) -> bool {
        if !self.last_added_frame.is_null() && frame_number != self.last_added_frame + 1 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "input frame {} does not follow {}",
                frame_number,
                self.last_added_frame
            );
            return false;
        }
        if self.length >= self.queue_length {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::InputQueue,
                "input queue full ({} frames) at frame {}",
                self.queue_length,
                frame_number
            );
            return false;
        }

        self.inputs[self.head] = PlayerInput::new(frame_number, input.input);
        self.head = (self.head + 1) % self.queue_length;
        self.length += 1;
        self.first_frame = false;
        self.last_added_frame = frame_number;
        self.last_confirmed_input = Some(input.input);

        if !self.prediction.frame.is_null() {
            if frame_number != self.prediction.frame {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InputQueue,
                    "frame {} does not match prediction frame {}",
                    frame_number,
                    self.prediction.frame
                );
                return false;
            }

            if self.first_incorrect_frame.is_null() && self.prediction.input != input.input {
                self.first_incorrect_frame = frame_number;
            }

            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame += 1;
            }
        }

        true
    }

    /// Fills the gap created by the frame delay by repeating the previous input.
    fn advance_queue_head(&mut self, input_frame: Frame) -> Frame {
        let mut expected_frame = if self.first_frame {
            Frame::new(0)
        } else {
            self.inputs[self.previous_position()].frame + 1
        };

        let input_frame = input_frame + self.frame_delay as i32;
        if expected_frame > input_frame {
            return Frame::NULL;
        }

        while expected_frame < input_frame {
            let replicated = self.inputs[self.previous_position()];
            if !self.add_input_by_frame(replicated, expected_frame) {
                return Frame::NULL;
            }
            expected_frame += 1;
        }
        input_frame
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

    fn queue() -> InputQueue<u8> {
        InputQueue::with_queue_length(128).expect("valid length")
    }

    #[test]
    fn rejects_tiny_queue() {
        assert!(InputQueue::<u8>::with_queue_length(1).is_none());
    }

    #[test]
    fn out_of_sequence_inputs_are_dropped() {
        let mut queue = queue();
        assert_eq!(queue.add_input(PlayerInput::new(Frame::new(0), 0)), Frame::new(0));
        assert_eq!(queue.add_input(PlayerInput::new(Frame::new(3), 0)), Frame::NULL);
        assert_eq!(queue.add_input(PlayerInput::new(Frame::new(0), 0)), Frame::NULL);
    }

    #[test]
    fn delayed_inputs_repeat_the_first_input() {
        let mut queue = queue();
        queue.set_frame_delay(2).unwrap();
        for i in 0..10i32 {
            queue.add_input(PlayerInput::new(Frame::new(i), i as u8));
            let (input, status) = queue.input(Frame::new(i)).unwrap();
            assert_eq!(status, InputStatus::Confirmed);
            assert_eq!(input, cmp::max(0, i - 2) as u8);
        }
    }

    #[test]
    fn frame_delay_is_bounded_by_queue_length() {
        let mut queue = InputQueue::<u8>::with_queue_length(8).unwrap();
        assert!(queue.set_frame_delay(7).is_ok());
        assert!(queue.set_frame_delay(8).is_err());
    }

    #[test]
    fn prediction_repeats_last_confirmed_input() {
        let mut queue = queue();
        for i in 0..3 {
            queue.add_input(PlayerInput::new(Frame::new(i), 42));
        }
        assert_eq!(
            queue.input(Frame::new(5)),
            Some((42, InputStatus::Predicted))
        );
    }

    #[test]
    fn prediction_before_any_input_is_default() {
        let mut queue = queue();
        assert_eq!(queue.input(Frame::new(0)), Some((0, InputStatus::Predicted)));
    }

    #[test]
    fn misprediction_is_recorded_at_first_wrong_frame() {
        let mut queue = queue();
        queue.add_input(PlayerInput::new(Frame::new(0), 10));
        let _ = queue.input(Frame::new(1));
        let _ = queue.input(Frame::new(2));
        queue.add_input(PlayerInput::new(Frame::new(1), 10));
        assert!(queue.first_incorrect_frame().is_null());
        queue.add_input(PlayerInput::new(Frame::new(2), 99));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(2));
        // no inputs are handed out until the engine rolls back
        assert_eq!(queue.input(Frame::new(3)), None);
        queue.reset_prediction();
        assert_eq!(
            queue.input(Frame::new(2)),
            Some((99, InputStatus::Confirmed))
        );
    }

    #[test]
    fn correct_prediction_leaves_prediction_mode() {
        let mut queue = queue();
        queue.add_input(PlayerInput::new(Frame::new(0), 42));
        let _ = queue.input(Frame::new(1));
        queue.add_input(PlayerInput::new(Frame::new(1), 42));
        assert!(queue.first_incorrect_frame().is_null());
        assert_eq!(
            queue.input(Frame::new(1)),
            Some((42, InputStatus::Confirmed))
        );
    }

    #[test]
    fn discard_keeps_requested_frames() {
        let mut queue = queue();
        for i in 0..10 {
            queue.add_input(PlayerInput::new(Frame::new(i), i as u8));
        }
        let _ = queue.input(Frame::new(4));
        queue.discard_confirmed_frames(Frame::new(8));
        assert_eq!(queue.input(Frame::new(4)), Some((4, InputStatus::Confirmed)));
    }

    #[test]
    fn wraps_around_after_discard() {
        let mut queue = InputQueue::<u8>::with_queue_length(16).unwrap();
        for i in 0..100 {
            queue.add_input(PlayerInput::new(Frame::new(i), i as u8));
            queue.discard_confirmed_frames(Frame::new(i - 4));
        }
        assert_eq!(
            queue.input(Frame::new(99)),
            Some((99, InputStatus::Confirmed))
        );
    }

    #[test]
    fn full_queue_refuses_more_input() {
        let mut queue = InputQueue::<u8>::with_queue_length(4).unwrap();
        for i in 0..4 {
            assert_eq!(queue.add_input(PlayerInput::new(Frame::new(i), 0)), Frame::new(i));
        }
        assert_eq!(queue.add_input(PlayerInput::new(Frame::new(4), 0)), Frame::NULL);
    }
}
