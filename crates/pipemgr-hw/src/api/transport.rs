//! Instruction transport collaborator.

use crate::error::PipeResult;
use crate::instr::{InstrTarget, Instruction};

/// Accepts instructions for the hardware instruction stream.
///
/// Instructions posted through one transport reach hardware in posting
/// order. Implementations may buffer until [`flush`](Self::flush). A failed
/// post is fatal to the operation in progress.
pub trait InstructionTransport: Send {
    /// Queues one instruction.
    fn post(&mut self, target: &InstrTarget, instr: &Instruction) -> PipeResult<()>;

    /// Pushes everything queued so far to hardware.
    fn flush(&mut self) -> PipeResult<()>;

    /// Drops everything queued since the last flush.
    fn discard(&mut self) {}

    /// Capacity of one outbound instruction buffer, in bytes.
    fn capacity(&self) -> usize;
}
