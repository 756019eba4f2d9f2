//! Hardware boundary of the pipeline table-entry manager.
//!
//! The entry manager never touches registers itself. It describes what it
//! wants done as [`Instruction`]s aimed at an [`InstrTarget`], hands payloads
//! to an [`EntryEncoder`] for bit-level packing, and posts the result through
//! an [`InstructionTransport`].
//!
//! # Architecture
//!
//! - [`error`]: driver status codes and the error taxonomy shared by all layers
//! - [`types`]: memory types and physical addresses
//! - [`payload`]: the decoded entry payload (action + attached resources)
//! - [`instr`]: the instruction set, including the move-register protocol
//! - [`api`]: collaborator traits implemented outside this workspace
//!
//! # Example
//!
//! ```ignore
//! use pipemgr_hw::{Instruction, InstrTarget, InstructionTransport, PipeResult};
//!
//! fn invalidate(t: &mut dyn InstructionTransport, target: InstrTarget, addr: PhysAddr) -> PipeResult<()> {
//!     t.post(&target, &Instruction::InvalidateTcam { addr })?;
//!     t.flush()
//! }
//! ```

pub mod api;
pub mod error;
pub mod instr;
pub mod payload;
pub mod types;

pub use api::{EncodeTarget, EntryEncoder, InstructionTransport};
pub use error::{PipeError, PipeResult, PipeStatus};
pub use instr::{InstrKind, InstrTarget, Instruction};
pub use payload::{EntryData, ResourceKind, ResourceSpec};
pub use types::{MemType, PhysAddr};
