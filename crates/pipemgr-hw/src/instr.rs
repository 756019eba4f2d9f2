//! Instruction set posted to the hardware instruction stream.
//!
//! The move-register instructions (`LatchSource`, `LatchDest`,
//! `CopyLatched`, `Unlatch`) implement atomic relocation: while a pair is
//! latched, lookups that were dispatched against the source keep seeing the
//! source until the pair is unlatched.

use crate::types::PhysAddr;
use pipemgr_types::{DevId, LockId, PipeBitmap, StageId};
use std::fmt;

/// Size of one instruction word in the outbound buffer.
pub const INSTR_WORD_BYTES: usize = 4;

/// Where an instruction is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrTarget {
    pub dev: DevId,
    pub pipes: PipeBitmap,
    pub stage: StageId,
}

impl InstrTarget {
    /// Creates a target.
    pub fn new(dev: DevId, pipes: PipeBitmap, stage: StageId) -> Self {
        Self { dev, pipes, stage }
    }

    /// Same device and pipes, another stage.
    pub fn with_stage(&self, stage: StageId) -> Self {
        Self { stage, ..*self }
    }
}

impl fmt::Display for InstrTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{} pipes{} {}", self.dev.get(), self.pipes, self.stage)
    }
}

/// One hardware instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Write encoded entry words at an address.
    WriteWord { addr: PhysAddr, data: Vec<u8> },
    /// Remember the relocation source address.
    LatchSource { addr: PhysAddr },
    /// Remember the relocation destination; source and destination now form an atomic pair.
    LatchDest { addr: PhysAddr },
    /// Copy the latched source payload to the latched destination.
    CopyLatched,
    /// Mark a ternary entry as never-matching.
    InvalidateTcam { addr: PhysAddr },
    /// Resolve the latched pair.
    Unlatch,
    /// Pipeline bubble.
    Noop,
    /// Freeze the resource view of a stage.
    StageLock { lock_id: LockId },
    /// Release a stage lock.
    StageUnlock { lock_id: LockId },
}

/// Discriminant of [`Instruction`], handy for sequence assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrKind {
    WriteWord,
    LatchSource,
    LatchDest,
    CopyLatched,
    InvalidateTcam,
    Unlatch,
    Noop,
    StageLock,
    StageUnlock,
}

impl Instruction {
    /// Returns the instruction kind.
    pub fn kind(&self) -> InstrKind {
        match self {
            Instruction::WriteWord { .. } => InstrKind::WriteWord,
            Instruction::LatchSource { .. } => InstrKind::LatchSource,
            Instruction::LatchDest { .. } => InstrKind::LatchDest,
            Instruction::CopyLatched => InstrKind::CopyLatched,
            Instruction::InvalidateTcam { .. } => InstrKind::InvalidateTcam,
            Instruction::Unlatch => InstrKind::Unlatch,
            Instruction::Noop => InstrKind::Noop,
            Instruction::StageLock { .. } => InstrKind::StageLock,
            Instruction::StageUnlock { .. } => InstrKind::StageUnlock,
        }
    }

    /// Number of bytes the instruction occupies in the outbound buffer.
    pub fn encoded_len(&self) -> usize {
        match self {
            // opcode + 64-bit address + payload
            Instruction::WriteWord { data, .. } => INSTR_WORD_BYTES * 3 + data.len(),
            Instruction::LatchSource { .. }
            | Instruction::LatchDest { .. }
            | Instruction::InvalidateTcam { .. } => INSTR_WORD_BYTES * 3,
            Instruction::StageLock { .. } | Instruction::StageUnlock { .. } => {
                INSTR_WORD_BYTES * 2
            }
            Instruction::CopyLatched | Instruction::Unlatch | Instruction::Noop => INSTR_WORD_BYTES,
        }
    }

    /// Returns the address the instruction refers to, if any.
    pub fn addr(&self) -> Option<&PhysAddr> {
        match self {
            Instruction::WriteWord { addr, .. }
            | Instruction::LatchSource { addr }
            | Instruction::LatchDest { addr }
            | Instruction::InvalidateTcam { addr } => Some(addr),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::WriteWord { addr, data } => write!(f, "write {} ({}B)", addr, data.len()),
            Instruction::LatchSource { addr } => write!(f, "latch-src {}", addr),
            Instruction::LatchDest { addr } => write!(f, "latch-dst {}", addr),
            Instruction::CopyLatched => write!(f, "copy"),
            Instruction::InvalidateTcam { addr } => write!(f, "invalidate {}", addr),
            Instruction::Unlatch => write!(f, "unlatch"),
            Instruction::Noop => write!(f, "noop"),
            Instruction::StageLock { lock_id } => write!(f, "lock {}", lock_id),
            Instruction::StageUnlock { lock_id } => write!(f, "unlock {}", lock_id),
        }
    }
}
