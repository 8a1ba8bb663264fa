use std::marker::PhantomData;

use tracing::trace;

use crate::checksum::frame_checksum;
use crate::driver::SimulationDriver;
use crate::rollback::save_pool::{SaveBuffer, SaveBufferPool};
use crate::rollback::{RollbackHandler, SavedFrame};
use crate::{Frame, NetplayError};

/// Bridges the rollback engine's callbacks to the simulation driver and the save pool.
pub(crate) struct FrameHandler<'a, I, D> {
    driver: &'a mut D,
    pool: &'a mut SaveBufferPool,
    _input: PhantomData<fn(&I)>,
}

impl<'a, I, D: SimulationDriver<I>> FrameHandler<'a, I, D> {
    pub(crate) fn new(driver: &'a mut D, pool: &'a mut SaveBufferPool) -> Self {
        Self {
            driver,
            pool,
            _input: PhantomData,
        }
    }

    pub(crate) fn driver(&mut self) -> &mut D {
        self.driver
    }
}

impl<I, D: SimulationDriver<I>> RollbackHandler<I> for FrameHandler<'_, I, D> {
    fn save_frame(&mut self, frame: Frame) -> Result<SavedFrame, NetplayError> {
        let mut buffer = self.pool.checkout();
        if let Err(e) = self.driver.save_memory_state(&mut buffer) {
            self.pool.checkin(buffer);
            return Err(e);
        }
        let checksum = frame_checksum(frame, buffer.as_slice());
        trace!(
            "Saved machine frame {} as rollback frame {} (checksum {:08x})",
            self.driver.frame_number(),
            frame,
            checksum
        );
        Ok(SavedFrame { buffer, checksum })
    }

    fn load_frame(&mut self, saved: &SavedFrame, frame: Frame) -> Result<(), NetplayError> {
        // Unmuted again once the next real frame runs.
        self.driver.set_audio_muted(true);
        let previous = self.driver.frame_number();
        self.driver.load_memory_state(&saved.buffer)?;
        trace!(
            "Loaded machine frame {} from rollback frame {} [prev {}]",
            self.driver.frame_number(),
            frame,
            previous
        );
        Ok(())
    }

    fn free_frame(&mut self, buffer: SaveBuffer) {
        self.pool.checkin(buffer);
    }

    fn advance_frame(&mut self, inputs: &[I], _disconnect_flags: u32) -> Result<(), NetplayError> {
        self.driver.set_inputs(inputs);
        self.driver.run_frame()
    }
}
