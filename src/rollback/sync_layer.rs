//! Frame bookkeeping of the rollback engine: the current frame, the ring of saved frames and
//! the input queue of every player.

use super::input_queue::{InputQueue, PlayerInput};
use super::{RollbackHandler, SavedFrame};
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{report_violation, Frame, InputStatus, InputVec, NetInput, NetplayError, PlayerHandle};

/// What the engine knows about a player's connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// The player stopped sending inputs.
    pub disconnected: bool,
    /// Last frame for which an input from the player is known.
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

struct SavedCell {
    frame: Frame,
    saved: SavedFrame,
}

/// Frame counter, saved frames and input queues.
pub struct SyncLayer<I> {
    max_prediction: usize,
    /// `max_prediction + 1` cells so the oldest frame inside the window can still be loaded.
    saved_states: Vec<Option<SavedCell>>,
    last_confirmed_frame: Frame,
    last_saved_frame: Frame,
    current_frame: Frame,
    input_queues: Vec<InputQueue<I>>,
}

impl<I: NetInput> SyncLayer<I> {
    /// Creates a sync layer for `num_players` starting at frame 0.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if `queue_length` is below 2.
    pub fn new(
        num_players: usize,
        max_prediction: usize,
        queue_length: usize,
    ) -> Result<Self, NetplayError> {
        let input_queues = (0..num_players)
            .map(|_| InputQueue::with_queue_length(queue_length))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| NetplayError::InvalidRequest {
                info: format!("input queue length {queue_length} is too small"),
            })?;
        Ok(Self {
            max_prediction,
            saved_states: (0..=max_prediction).map(|_| None).collect(),
            last_confirmed_frame: Frame::NULL,
            last_saved_frame: Frame::NULL,
            current_frame: Frame::new(0),
            input_queues,
        })
    }

    /// The frame about to be simulated.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// Most recent frame known to be correct for every player.
    #[must_use]
    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    /// Most recently saved frame.
    #[must_use]
    pub fn last_saved_frame(&self) -> Frame {
        self.last_saved_frame
    }

    /// Moves to the next frame.
    pub fn advance_frame(&mut self) {
        self.current_frame = self.current_frame.saturating_add(1);
    }

    /// Saves the current frame through the handler. A buffer evicted from the ring goes back to
    /// the handler.
    ///
    /// # Errors
    /// Propagates the handler's save failure.
    pub fn save_current_state<H: RollbackHandler<I> + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), NetplayError> {
        let frame = self.current_frame;
        let saved = handler.save_frame(frame)?;
        let index = frame.as_i32() as usize % self.saved_states.len();
        if let Some(evicted) = self.saved_states[index].replace(SavedCell { frame, saved }) {
            handler.free_frame(evicted.saved.buffer);
        }
        self.last_saved_frame = frame;
        Ok(())
    }

    /// Rewinds the simulation to `frame_to_load`.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidFrame`] when the frame is null, not in the past, outside
    /// the prediction window or not saved; propagates the handler's load failure.
    pub fn load_frame<H: RollbackHandler<I> + ?Sized>(
        &mut self,
        frame_to_load: Frame,
        handler: &mut H,
    ) -> Result<(), NetplayError> {
        let invalid = |reason: &str| NetplayError::InvalidFrame {
            frame: frame_to_load,
            reason: reason.to_owned(),
        };
        if frame_to_load.is_null() {
            return Err(invalid("cannot load the null frame"));
        }
        if frame_to_load >= self.current_frame {
            return Err(invalid("frame to load must be in the past"));
        }
        if frame_to_load.as_i32() < self.current_frame.as_i32() - self.max_prediction as i32 {
            return Err(invalid("frame to load is outside the prediction window"));
        }

        let index = frame_to_load.as_i32() as usize % self.saved_states.len();
        let cell = self.saved_states[index]
            .as_ref()
            .filter(|cell| cell.frame == frame_to_load)
            .ok_or_else(|| invalid("no saved state for frame"))?;
        handler.load_frame(&cell.saved, frame_to_load)?;

        self.current_frame = frame_to_load;
        self.last_saved_frame = frame_to_load;
        Ok(())
    }

    /// Checksum recorded when `frame` was saved, if it is still in the ring.
    #[must_use]
    pub fn saved_checksum(&self, frame: Frame) -> Option<u32> {
        if !frame.is_valid() {
            return None;
        }
        let index = frame.as_i32() as usize % self.saved_states.len();
        self.saved_states[index]
            .as_ref()
            .filter(|cell| cell.frame == frame)
            .map(|cell| cell.saved.checksum)
    }

    /// Sets the input delay of one player.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidPlayer`] for an unknown handle.
    pub fn set_frame_delay(&mut self, player: PlayerHandle, delay: usize) -> Result<(), NetplayError> {
        self.input_queues
            .get_mut(player.as_usize())
            .ok_or(NetplayError::InvalidPlayer { player })?
            .set_frame_delay(delay)
    }

    /// Leaves prediction mode in every queue.
    pub fn reset_prediction(&mut self) {
        for queue in &mut self.input_queues {
            queue.reset_prediction();
        }
    }

    /// Adds the local input for the current frame. Returns the frame it was stored at after
    /// delay, or [`Frame::NULL`] if it was rejected.
    pub fn add_local_input(&mut self, player: PlayerHandle, input: PlayerInput<I>) -> Frame {
        if input.frame != self.current_frame {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::FrameSync,
                "local input for frame {} does not match current frame {}",
                input.frame,
                self.current_frame
            );
            return Frame::NULL;
        }
        self.input_queues
            .get_mut(player.as_usize())
            .map_or(Frame::NULL, |queue| queue.add_input(input))
    }

    /// Adds a confirmed remote input.
    pub fn add_remote_input(&mut self, player: PlayerHandle, input: PlayerInput<I>) -> Frame {
        self.input_queues
            .get_mut(player.as_usize())
            .map_or(Frame::NULL, |queue| queue.add_input(input))
    }

    /// Inputs of every player for the current frame, predicted where missing.
    ///
    /// Returns `None` if a queue refuses (misprediction pending or frame discarded).
    pub fn synchronized_inputs(&mut self, connect_status: &[ConnectionStatus]) -> Option<InputVec<I>> {
        let mut inputs = InputVec::new();
        for (queue, status) in self.input_queues.iter_mut().zip(connect_status) {
            if status.disconnected && status.last_frame < self.current_frame {
                inputs.push((I::default(), InputStatus::Disconnected));
            } else {
                inputs.push(queue.input(self.current_frame)?);
            }
        }
        Some(inputs)
    }

    /// Raises the confirmed frame and discards inputs nobody needs anymore.
    pub fn set_last_confirmed_frame(&mut self, frame: Frame) {
        let mut frame = std::cmp::min(frame, self.current_frame);

        let first_incorrect = self.check_simulation_consistency(Frame::NULL);
        if !first_incorrect.is_null() && first_incorrect < frame {
            frame = first_incorrect;
        }

        self.last_confirmed_frame = frame;
        if frame.as_i32() > 0 {
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(frame - 1);
            }
        }
    }

    /// Earliest mispredicted frame over all queues, starting from `first_incorrect`.
    #[must_use]
    pub fn check_simulation_consistency(&self, mut first_incorrect: Frame) -> Frame {
        for queue in &self.input_queues {
            let incorrect = queue.first_incorrect_frame();
            if !incorrect.is_null() && (first_incorrect.is_null() || incorrect < first_incorrect) {
                first_incorrect = incorrect;
            }
        }
        first_incorrect
    }

    /// Hands every saved buffer back to the handler.
    pub fn release_saved_states<H: RollbackHandler<I> + ?Sized>(&mut self, handler: &mut H) {
        for cell in self.saved_states.iter_mut().filter_map(Option::take) {
            handler.free_frame(cell.saved.buffer);
        }
        self.last_saved_frame = Frame::NULL;
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
    use crate::rollback::SaveBuffer;

    /// Records calls; the "state" is just the frame number.
    #[derive(Default)]
    struct Recorder {
        loaded: Vec<Frame>,
        freed: usize,
    }

    impl RollbackHandler<u8> for Recorder {
        fn save_frame(&mut self, frame: Frame) -> Result<SavedFrame, NetplayError> {
            Ok(SavedFrame {
                buffer: SaveBuffer::from_vec(frame.as_i32().to_le_bytes().to_vec()),
                checksum: frame.as_i32() as u32 * 7,
            })
        }

        fn load_frame(&mut self, saved: &SavedFrame, frame: Frame) -> Result<(), NetplayError> {
            assert_eq!(saved.buffer.as_slice(), frame.as_i32().to_le_bytes());
            self.loaded.push(frame);
            Ok(())
        }

        fn free_frame(&mut self, _buffer: SaveBuffer) {
            self.freed += 1;
        }

        fn advance_frame(&mut self, _inputs: &[u8], _disconnect_flags: u32) -> Result<(), NetplayError> {
            Ok(())
        }
    }

    fn layer() -> SyncLayer<u8> {
        SyncLayer::new(2, 4, 32).unwrap()
    }

    fn run_to(layer: &mut SyncLayer<u8>, handler: &mut Recorder, frame: i32) {
        while layer.current_frame() < frame {
            layer.save_current_state(handler).unwrap();
            layer.advance_frame();
        }
        layer.save_current_state(handler).unwrap();
    }

    #[test]
    fn ring_evicts_and_frees_old_saves() {
        let mut layer = layer();
        let mut handler = Recorder::default();
        run_to(&mut layer, &mut handler, 9);
        // 10 saves into 5 cells
        assert_eq!(handler.freed, 5);
        assert_eq!(layer.saved_checksum(Frame::new(9)), Some(63));
        assert_eq!(layer.saved_checksum(Frame::new(4)), None);
    }

    #[test]
    fn load_frame_validates_window() {
        let mut layer = layer();
        let mut handler = Recorder::default();
        run_to(&mut layer, &mut handler, 8);

        assert!(layer.load_frame(Frame::NULL, &mut handler).is_err());
        assert!(layer.load_frame(Frame::new(8), &mut handler).is_err());
        assert!(layer.load_frame(Frame::new(3), &mut handler).is_err());

        layer.load_frame(Frame::new(5), &mut handler).unwrap();
        assert_eq!(layer.current_frame(), Frame::new(5));
        assert_eq!(layer.last_saved_frame(), Frame::new(5));
        assert_eq!(handler.loaded, vec![Frame::new(5)]);
    }

    #[test]
    fn local_input_must_match_current_frame() {
        let mut layer = layer();
        let input = PlayerInput::new(Frame::new(3), 1u8);
        assert!(layer.add_local_input(PlayerHandle::new(0), input).is_null());
        let input = PlayerInput::new(Frame::new(0), 1u8);
        assert_eq!(layer.add_local_input(PlayerHandle::new(0), input), Frame::new(0));
    }

    #[test]
    fn disconnected_players_get_default_input() {
        let mut layer = layer();
        layer.add_local_input(PlayerHandle::new(0), PlayerInput::new(Frame::new(0), 5));
        let status = [
            ConnectionStatus::default(),
            ConnectionStatus {
                disconnected: true,
                last_frame: Frame::NULL,
            },
        ];
        let inputs = layer.synchronized_inputs(&status).unwrap();
        assert_eq!(inputs[0], (5, InputStatus::Confirmed));
        assert_eq!(inputs[1], (0, InputStatus::Disconnected));
    }

    #[test]
    fn confirmed_frame_never_passes_current_frame() {
        let mut layer = layer();
        layer.set_last_confirmed_frame(Frame::new(10));
        assert_eq!(layer.last_confirmed_frame(), Frame::new(0));
    }

    #[test]
    fn release_returns_all_buffers() {
        let mut layer = layer();
        let mut handler = Recorder::default();
        run_to(&mut layer, &mut handler, 2);
        layer.release_saved_states(&mut handler);
        assert_eq!(handler.freed, 3);
        assert_eq!(layer.saved_checksum(Frame::new(2)), None);
    }

    #[test]
    fn set_frame_delay_rejects_unknown_player() {
        let mut layer = layer();
        assert!(matches!(
            layer.set_frame_delay(PlayerHandle::new(2), 1),
            Err(NetplayError::InvalidPlayer { .. })
        ));
    }
}
