//! Typed identifiers for the pipeline table-entry manager.
//!
//! Every layer of the entry manager passes device, pipe, stage and handle
//! numbers around. Keeping each one a distinct type stops a stage index from
//! being used where an entry handle is expected:
//!
//! - [`DevId`], [`StageId`], [`StageIndex`], [`TableHandle`], [`MemberId`], [`LockId`]
//! - [`PipeId`] and [`PipeBitmap`]: pipe selection for instruction targets
//! - [`EntryHandle`]: opaque entry id, optionally pinned to a pipe

mod handle;
mod ids;
mod pipe;

pub use handle::EntryHandle;
pub use ids::{DevId, LockId, MemberId, StageId, StageIndex, TableHandle};
pub use pipe::{PipeBitmap, PipeId};

/// Common error type for parsing and range failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid pipe id: {0} (must be < {max})", max = PipeId::MAX_PIPES)]
    InvalidPipeId(u8),

    #[error("invalid entry handle id: {0:#x} (exceeds {max:#x})", max = EntryHandle::MAX_ID)]
    InvalidHandleId(u32),

    #[error("invalid pipe list: {0}")]
    InvalidPipeList(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}
