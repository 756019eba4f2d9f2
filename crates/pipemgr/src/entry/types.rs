//! Logical and physical entry records.

use pipemgr_common::HasRefCount;
use pipemgr_hw::EntryData;
use pipemgr_types::{EntryHandle, MemberId, PipeId, StageId, StageIndex};
use serde::{Deserialize, Serialize};

/// One placement of an entry in one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLocation {
    pub stage: StageId,
    pub index: StageIndex,
    pub ref_count: u32,
}

impl StageLocation {
    pub fn new(stage: StageId, index: StageIndex) -> Self {
        Self {
            stage,
            index,
            ref_count: 1,
        }
    }
}

/// Keeps `locations` sorted by (stage, index).
fn insert_sorted(locations: &mut Vec<StageLocation>, loc: StageLocation) {
    let pos = locations
        .iter()
        .position(|l| (l.stage, l.index) > (loc.stage, loc.index))
        .unwrap_or(locations.len());
    locations.insert(pos, loc);
}

/// Software (HLP) view of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalEntry {
    pub handle: EntryHandle,
    pub pipe: Option<PipeId>,
    pub member: MemberId,
    pub data: EntryData,
    /// Total references across all shared locations.
    pub ref_count: u32,
    /// At most one location per stage, ascending by stage.
    pub shared: Vec<StageLocation>,
}

impl LogicalEntry {
    pub fn new(handle: EntryHandle, pipe: Option<PipeId>, member: MemberId, data: EntryData) -> Self {
        Self {
            handle,
            pipe,
            member,
            data,
            ref_count: 0,
            shared: Vec::new(),
        }
    }

    pub fn shared_at(&self, stage: StageId) -> Option<&StageLocation> {
        self.shared.iter().find(|l| l.stage == stage)
    }

    pub fn shared_at_mut(&mut self, stage: StageId) -> Option<&mut StageLocation> {
        self.shared.iter_mut().find(|l| l.stage == stage)
    }

    pub fn insert_shared(&mut self, loc: StageLocation) {
        insert_sorted(&mut self.shared, loc);
    }

    pub fn remove_shared_at(&mut self, stage: StageId) -> Option<StageLocation> {
        let pos = self.shared.iter().position(|l| l.stage == stage)?;
        Some(self.shared.remove(pos))
    }

    pub fn is_referenced(&self) -> bool {
        self.ref_count > 0
    }
}

impl HasRefCount for LogicalEntry {
    fn ref_count(&self) -> u32 {
        self.ref_count
    }

    fn increment_ref(&mut self) -> u32 {
        self.ref_count = self.ref_count.saturating_add(1);
        self.ref_count
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        self.ref_count = self.ref_count.checked_sub(1)?;
        Some(self.ref_count)
    }
}

/// Hardware-shadow (LLP) view of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalEntry {
    pub handle: EntryHandle,
    pub data: EntryData,
    pub shared: Vec<StageLocation>,
    /// Private duplicates installed at caller-owned indices.
    pub non_shared: Vec<StageLocation>,
}

impl PhysicalEntry {
    pub fn new(handle: EntryHandle, data: EntryData) -> Self {
        Self {
            handle,
            data,
            shared: Vec::new(),
            non_shared: Vec::new(),
        }
    }

    pub fn shared_at(&self, stage: StageId) -> Option<&StageLocation> {
        self.shared.iter().find(|l| l.stage == stage)
    }

    pub fn shared_at_mut(&mut self, stage: StageId) -> Option<&mut StageLocation> {
        self.shared.iter_mut().find(|l| l.stage == stage)
    }

    pub fn insert_shared(&mut self, loc: StageLocation) {
        insert_sorted(&mut self.shared, loc);
    }

    pub fn remove_shared_at(&mut self, stage: StageId) -> Option<StageLocation> {
        let pos = self.shared.iter().position(|l| l.stage == stage)?;
        Some(self.shared.remove(pos))
    }

    pub fn non_shared_at(&self, stage: StageId, index: StageIndex) -> Option<&StageLocation> {
        self.non_shared
            .iter()
            .find(|l| l.stage == stage && l.index == index)
    }

    pub fn insert_non_shared(&mut self, loc: StageLocation) {
        insert_sorted(&mut self.non_shared, loc);
    }

    pub fn remove_non_shared(&mut self, stage: StageId, index: StageIndex) -> Option<StageLocation> {
        let pos = self
            .non_shared
            .iter()
            .position(|l| l.stage == stage && l.index == index)?;
        Some(self.non_shared.remove(pos))
    }

    /// Any location in `stage`, shared first.
    pub fn location_in(&self, stage: StageId) -> Option<&StageLocation> {
        self.shared_at(stage)
            .or_else(|| self.non_shared.iter().find(|l| l.stage == stage))
    }

    pub fn has_locations(&self) -> bool {
        !self.shared.is_empty() || !self.non_shared.is_empty()
    }
}
