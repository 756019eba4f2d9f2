//! Hardware collaborators of a device.

use log::error;
use pipemgr_hw::{
    EncodeTarget, EntryData, EntryEncoder, InstrTarget, Instruction, InstructionTransport,
    PipeError, PipeResult,
};
use std::fmt;
use std::sync::Arc;

/// Encoder and instruction stream shared by every table of a device.
///
/// Post and flush failures are environmental: they come back as
/// [`PipeError::Unexpected`] so the caller treats the device as needing
/// recovery instead of retrying one operation.
pub struct Hardware {
    encoder: Arc<dyn EntryEncoder>,
    transport: Box<dyn InstructionTransport>,
    posted: u64,
}

impl fmt::Debug for Hardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hardware")
            .field("capacity", &self.transport.capacity())
            .field("posted", &self.posted)
            .finish()
    }
}

impl Hardware {
    pub fn new(encoder: Arc<dyn EntryEncoder>, transport: Box<dyn InstructionTransport>) -> Self {
        Self {
            encoder,
            transport,
            posted: 0,
        }
    }

    pub fn encoder(&self) -> &dyn EntryEncoder {
        self.encoder.as_ref()
    }

    pub fn encode(&self, target: &EncodeTarget, data: &EntryData) -> PipeResult<Vec<u8>> {
        self.encoder.encode(target, data)
    }

    pub fn post(&mut self, target: &InstrTarget, instr: &Instruction) -> PipeResult<()> {
        self.transport.post(target, instr).map_err(|e| {
            error!("Failed to post {} to {}: {}", instr, target, e);
            PipeError::unexpected(format!("instruction post failed: {}", e))
        })?;
        self.posted += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> PipeResult<()> {
        self.transport.flush().map_err(|e| {
            error!("Failed to flush instruction buffer: {}", e);
            PipeError::unexpected(format!("instruction flush failed: {}", e))
        })
    }

    /// Drops everything posted since the last flush.
    pub fn discard(&mut self) {
        self.transport.discard();
    }

    pub fn capacity(&self) -> usize {
        self.transport.capacity()
    }

    /// Instructions accepted by the transport so far.
    pub fn posted(&self) -> u64 {
        self.posted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipemgr_test::{target, FakeEncoder, RecordingTransport};

    #[test]
    fn test_post_failure_is_unexpected() {
        let transport = RecordingTransport::new().fail_after(1);
        let log = transport.log();
        let mut hw = Hardware::new(Arc::new(FakeEncoder), Box::new(transport));

        hw.post(&target(1, 0), &Instruction::Noop).unwrap();
        let err = hw.post(&target(1, 0), &Instruction::Noop).unwrap_err();
        assert!(matches!(err, PipeError::Unexpected { .. }));
        assert_eq!(hw.posted(), 1);
        assert_eq!(log.posted().len(), 1);
    }

    #[test]
    fn test_discard_drops_pending() {
        let transport = RecordingTransport::new();
        let log = transport.log();
        let mut hw = Hardware::new(Arc::new(FakeEncoder), Box::new(transport));

        hw.post(&target(1, 0), &Instruction::Noop).unwrap();
        hw.flush().unwrap();
        hw.post(&target(1, 0), &Instruction::Unlatch).unwrap();
        hw.discard();
        assert_eq!(log.instructions(), vec![Instruction::Noop]);
        assert_eq!(log.discarded_count(), 1);
    }
}
