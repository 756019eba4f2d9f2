//! Borrowed view of one table instance and the device hardware.

use super::hw::Hardware;
use super::instance::TableInstance;
use crate::move_list::{MoveList, MoveListError};
use crate::reloc::{LockIdPool, RelocateRequest, RelocationSummary};
use crate::stage::Occupancy;
use crate::state::InstanceState;
use pipemgr_hw::{EntryData, PipeResult};
use pipemgr_types::{EntryHandle, MemberId, PipeId, StageId, StageIndex, TableHandle};

/// Operations on one table instance, obtained from
/// [`TableRegistry::session`](super::TableRegistry::session).
///
/// The session borrows the registry, so a caller holds at most one at a
/// time.
#[derive(Debug)]
pub struct TableSession<'a> {
    pub(super) instance: &'a mut TableInstance,
    pub(super) hw: &'a mut Hardware,
    pub(super) locks: &'a mut LockIdPool,
}

impl TableSession<'_> {
    pub fn table(&self) -> TableHandle {
        self.instance.table()
    }

    pub fn pipe(&self) -> Option<PipeId> {
        self.instance.pipe()
    }

    pub fn instance(&self) -> &TableInstance {
        self.instance
    }

    pub fn hardware(&self) -> &Hardware {
        self.hw
    }

    pub fn stage_occupancy(&self, stage: StageId) -> PipeResult<Occupancy> {
        self.instance.stage_occupancy(stage)
    }

    pub fn add(&mut self, member: MemberId, data: EntryData) -> PipeResult<(EntryHandle, MoveList)> {
        self.instance.add(member, data)
    }

    pub fn modify(&mut self, handle: EntryHandle, data: EntryData) -> PipeResult<MoveList> {
        self.instance.modify(handle, data)
    }

    pub fn delete(&mut self, handle: EntryHandle) -> PipeResult<MoveList> {
        self.instance.delete(handle)
    }

    pub fn place_shared(&mut self, handle: EntryHandle, stage: StageId) -> PipeResult<StageIndex> {
        self.instance.place_shared(self.hw, handle, stage)
    }

    pub fn place_shared_at(
        &mut self,
        handle: EntryHandle,
        stage: StageId,
        index: StageIndex,
    ) -> PipeResult<StageIndex> {
        self.instance.place_shared_at(self.hw, handle, stage, index)
    }

    pub fn remove_shared(&mut self, handle: EntryHandle, stage: StageId) -> PipeResult<u32> {
        self.instance.remove_shared(self.hw, handle, stage)
    }

    pub fn activate_non_shared(
        &mut self,
        handle: EntryHandle,
        stage: StageId,
        index: StageIndex,
    ) -> PipeResult<()> {
        self.instance.activate_non_shared(self.hw, handle, stage, index)
    }

    pub fn deactivate_non_shared(
        &mut self,
        handle: EntryHandle,
        stage: StageId,
        index: StageIndex,
    ) -> PipeResult<()> {
        self.instance.deactivate_non_shared(self.hw, handle, stage, index)
    }

    pub fn process_move_list(&mut self, list: MoveList) -> Result<usize, MoveListError> {
        self.instance.process_move_list(self.hw, list)
    }

    pub fn process_move_list_shadow(&mut self, list: MoveList) -> Result<usize, MoveListError> {
        self.instance.process_move_list_shadow(list)
    }

    pub fn replay_move_list(&mut self, list: MoveList) -> Result<usize, MoveListError> {
        self.instance.replay_move_list(list)
    }

    pub fn sync_from_hw(
        &mut self,
        handle: EntryHandle,
        stage: StageId,
        words: &[u8],
    ) -> PipeResult<EntryData> {
        self.instance.sync_from_hw(self.hw, handle, stage, words)
    }

    pub fn diverged_entries(&self) -> Vec<EntryHandle> {
        self.instance.diverged_entries()
    }

    /// Relocates entries, taking the table's stage lock id when the chain
    /// must be locked.
    pub fn relocate(&mut self, requests: &[RelocateRequest]) -> PipeResult<RelocationSummary> {
        let lock = if self.instance.needs_stage_lock(requests) {
            Some(self.locks.acquire(self.instance.table())?)
        } else {
            None
        };
        self.instance.relocate(self.hw, requests, lock)
    }

    pub fn log_state(&self) -> InstanceState {
        self.instance.log_state()
    }
}
