//! Persisted state of table instances.
//!
//! These are the documents the warm-restart collaborator stores. They only
//! describe what the entry manager holds; the on-disk format is the
//! collaborator's business. Every list is in ascending order (entries by
//! handle, stages by id, tables by handle), so two walks of the same state
//! compare equal.

use crate::entry::{LogicalEntry, PhysicalEntry};
use crate::stage::Occupancy;
use pipemgr_types::{DevId, EntryHandle, PipeId, StageId, TableHandle};
use serde::{Deserialize, Serialize};

/// Both records of one entry. At least one is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    pub handle: EntryHandle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical: Option<LogicalEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical: Option<PhysicalEntry>,
}

/// Counters of one stage, kept to cross-check a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    pub stage: StageId,
    pub occupancy: Occupancy,
    /// Stage indices held by the allocator.
    pub indices_used: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub table: TableHandle,
    pub pipe: Option<PipeId>,
    pub entries: Vec<EntryState>,
    pub stages: Vec<StageState>,
}

impl InstanceState {
    pub fn entry(&self, handle: EntryHandle) -> Option<&EntryState> {
        self.entries.iter().find(|e| e.handle == handle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub dev_id: DevId,
    pub instances: Vec<InstanceState>,
}

impl DeviceState {
    pub fn instance(&self, table: TableHandle, pipe: Option<PipeId>) -> Option<&InstanceState> {
        self.instances
            .iter()
            .find(|i| i.table == table && i.pipe == pipe)
    }

    pub fn entry_count(&self) -> usize {
        self.instances.iter().map(|i| i.entries.len()).sum()
    }
}
