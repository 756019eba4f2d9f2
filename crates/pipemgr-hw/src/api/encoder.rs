//! Entry encoding collaborator.

use crate::error::PipeResult;
use crate::payload::EntryData;
use crate::types::PhysAddr;
use pipemgr_types::{StageIndex, TableHandle};

/// Location an entry is being encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeTarget {
    pub table: TableHandle,
    pub index: StageIndex,
    pub addr: PhysAddr,
}

/// Packs payloads into memory words and unpacks them again.
///
/// Calls are synchronous and are not retried by the entry manager.
pub trait EntryEncoder: Send + Sync {
    /// Encodes `data` into the word buffer written at `target`.
    fn encode(&self, target: &EncodeTarget, data: &EntryData) -> PipeResult<Vec<u8>>;

    /// Decodes a word buffer read back from `addr`.
    fn decode(&self, addr: &PhysAddr, words: &[u8]) -> PipeResult<EntryData>;
}
