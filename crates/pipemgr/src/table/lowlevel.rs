//! Low-level (hardware shadow) processing of move-lists, plus the
//! warm-restart helpers that rebuild either layer on its own.

use super::hw::Hardware;
use super::instance::TableInstance;
use crate::entry::{LogicalEntry, PhysicalEntry, StageLocation};
use crate::move_list::{MoveList, MoveListError, MoveNode, MoveOp};
use log::{debug, warn};
use pipemgr_hw::{EntryData, PipeError, PipeResult};
use pipemgr_types::{EntryHandle, StageId};

impl TableInstance {
    /// Applies a move-list to the hardware shadow and programs the device.
    ///
    /// Nodes are applied in order and processing stops at the first failure.
    /// Outside a transaction a failure rolls every node back; inside one the
    /// caller resolves it with abort.
    pub fn process_move_list(
        &mut self,
        hw: &mut Hardware,
        list: MoveList,
    ) -> Result<usize, MoveListError> {
        let mut processed = 0;
        let result = self.transact_hw(hw, |inst, hw| {
            for node in list {
                inst.apply_llp(Some(&mut *hw), &node)?;
                processed += 1;
            }
            Ok(processed)
        });
        result.map_err(|source| {
            warn!(
                "Table {}: move-list failed after {} node(s): {}",
                self.table, processed, source
            );
            MoveListError { processed, source }
        })
    }

    /// Like [`process_move_list`](Self::process_move_list) without posting
    /// anything, for rebuilding the shadow during warm restart.
    pub fn process_move_list_shadow(&mut self, list: MoveList) -> Result<usize, MoveListError> {
        let mut processed = 0;
        let result = self.transact(|inst| {
            for node in list {
                inst.apply_llp(None, &node)?;
                processed += 1;
            }
            Ok(processed)
        });
        result.map_err(|source| MoveListError { processed, source })
    }

    /// Rebuilds logical records from a move-list, reserving the handles it
    /// names. Touches neither the shadow nor the device.
    pub fn replay_move_list(&mut self, list: MoveList) -> Result<usize, MoveListError> {
        let mut processed = 0;
        let result = self.transact(|inst| {
            for node in list {
                inst.apply_hlp(&node)?;
                processed += 1;
            }
            Ok(processed)
        });
        result.map_err(|source| MoveListError { processed, source })
    }

    fn check_node(&self, node: &MoveNode) -> PipeResult<()> {
        if node.pipe != self.pipe || node.handle.pipe() != self.pipe {
            return Err(PipeError::invalid_argument(format!(
                "move node '{}' is for another pipe than table {} {}",
                node,
                self.table,
                self.scope()
            )));
        }
        Ok(())
    }

    fn apply_llp(&mut self, mut hw: Option<&mut Hardware>, node: &MoveNode) -> PipeResult<()> {
        self.check_node(node)?;
        let handle = node.handle;
        match &node.op {
            MoveOp::Add { data, .. } => {
                if self.store.get_physical(handle).is_some() {
                    return Err(PipeError::already_exists(format!("programmed entry {}", handle)));
                }
                self.mark_dirty(handle);
                if self.handles.is_pending(handle) {
                    self.mark_handles_dirty();
                    self.handles.settle(handle);
                }
                self.store.insert_physical(PhysicalEntry::new(handle, data.clone()))?;
                let stages: Vec<StageId> = self
                    .store
                    .get_logical(handle)
                    .map(|e| e.shared.iter().map(|l| l.stage).collect())
                    .unwrap_or_default();
                for stage in stages {
                    self.mirror_shared(hw.as_deref_mut(), handle, stage)?;
                }
            }
            MoveOp::Modify { data, .. } => {
                let phys = self.store.physical(handle)?;
                let shared = phys.shared.clone();
                let non_shared = phys.non_shared.clone();
                self.mark_dirty(handle);
                // canonical copies first so no duplicate is ever newer
                for loc in shared.iter().chain(non_shared.iter()) {
                    self.program(hw.as_deref_mut(), loc.stage, loc.index, data)?;
                }
                self.store.physical_mut(handle)?.data = data.clone();
            }
            MoveOp::Delete => {
                let phys = self.store.physical(handle)?;
                if phys.has_locations() {
                    let count = phys.shared.len() + phys.non_shared.len();
                    return Err(PipeError::references_exist(
                        format!("programmed entry {}", handle),
                        u32::try_from(count).unwrap_or(u32::MAX),
                    ));
                }
                self.mark_dirty(handle);
                self.store.remove_physical(handle);
                if self.store.get_logical(handle).is_none() && self.handles.is_allocated(handle) {
                    self.mark_handles_dirty();
                    self.handles.release(handle)?;
                }
            }
        }
        debug!("Table {}: applied {}", self.table, node);
        Ok(())
    }

    fn apply_hlp(&mut self, node: &MoveNode) -> PipeResult<()> {
        self.check_node(node)?;
        let handle = node.handle;
        match &node.op {
            MoveOp::Add { member, data } => {
                if !self.handles.is_allocated(handle) {
                    self.mark_handles_dirty();
                    self.handles.reserve(handle)?;
                }
                self.mark_dirty(handle);
                self.store
                    .insert_logical(LogicalEntry::new(handle, self.pipe, *member, data.clone()))?;
                if self.store.get_physical(handle).is_none() {
                    self.mark_handles_dirty();
                    self.handles.mark_pending(handle);
                }
            }
            MoveOp::Modify { data, .. } => {
                self.store.logical(handle)?;
                self.mark_dirty(handle);
                self.store.logical_mut(handle)?.data = data.clone();
            }
            MoveOp::Delete => self.remove_logical(handle)?,
        }
        Ok(())
    }

    /// Decodes words read back from the device at the entry's location in
    /// `stage` and takes them as the programmed payload.
    pub fn sync_from_hw(
        &mut self,
        hw: &Hardware,
        handle: EntryHandle,
        stage: StageId,
        words: &[u8],
    ) -> PipeResult<EntryData> {
        self.check_handle(handle)?;
        self.transact(|inst| {
            let loc: StageLocation = inst
                .store
                .physical(handle)?
                .location_in(stage)
                .copied()
                .ok_or_else(|| {
                    PipeError::not_found(format!("programmed location of entry {} in {}", handle, stage))
                })?;
            let addr = inst.stage_info(stage)?.layout.addr(inst.addr_pipe(), loc.index)?;
            let data = hw.encoder().decode(&addr, words)?;
            inst.mark_dirty(handle);
            inst.store.physical_mut(handle)?.data = data.clone();
            debug!("Table {}: entry {} synced from {}", inst.table, handle, addr);
            Ok(data)
        })
    }

    /// Handles whose logical and physical records disagree, ascending.
    pub fn diverged_entries(&self) -> Vec<EntryHandle> {
        self.store.diverged()
    }
}

#[cfg(test)]
mod tests {
    use super::super::instance::InstanceConfig;
    use super::super::recording_hw;
    use super::*;
    use crate::config::{StageProfile, TableKind, TableProfile};
    use pipemgr_hw::{EncodeTarget, EntryEncoder, InstrKind, ResourceKind, ResourceSpec};
    use pipemgr_test::{assert_kinds, FakeEncoder};
    use pipemgr_types::{MemberId, PipeId, StageIndex, TableHandle};
    use pretty_assertions::assert_eq;

    fn profile() -> TableProfile {
        TableProfile {
            handle: TableHandle::new(9),
            name: "tcam".to_string(),
            kind: TableKind::Tcam,
            max_entries: 8,
            stages: vec![
                StageProfile {
                    stage: StageId::new(1),
                    mem_type: TableKind::Tcam.mem_type(),
                    ram_depth: 16,
                    ..Default::default()
                },
                StageProfile {
                    stage: StageId::new(2),
                    mem_type: TableKind::Tcam.mem_type(),
                    ram_depth: 16,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn instance() -> TableInstance {
        TableInstance::new(&profile(), None, InstanceConfig::default())
    }

    fn data(n: u8) -> EntryData {
        EntryData::new(u32::from(n), vec![n; 3])
    }

    #[test]
    fn test_move_list_replay_reproduces_logical_records() {
        let mut live = instance();
        let mut journal = MoveList::new();
        let (a, list) = live.add(MemberId::new(1), data(1)).unwrap();
        journal.append(list);
        let (b, list) = live.add(MemberId::new(2), data(2)).unwrap();
        journal.append(list);
        journal.append(live.modify(a, data(3)).unwrap());
        journal.append(live.delete(b).unwrap());
        let (c, list) = live.add(MemberId::new(3), data(4)).unwrap();
        journal.append(list);

        let mut replayed = instance();
        assert_eq!(replayed.replay_move_list(journal.clone()).unwrap(), journal.len());

        let live_entries: Vec<&LogicalEntry> = live.entries().collect();
        let replayed_entries: Vec<&LogicalEntry> = replayed.entries().collect();
        assert_eq!(replayed_entries, live_entries);
        assert_eq!(replayed.handles(), live.handles());
        assert_eq!(replayed.member_owner(MemberId::new(3)), Some(c));
        assert_eq!(replayed.member_owner(MemberId::new(2)), None);
    }

    #[test]
    fn test_replay_failure_is_all_or_nothing() {
        let mut inst = instance();
        let (a, _) = inst.add(MemberId::new(1), data(1)).unwrap();
        let mut list = MoveList::new();
        list.push(MoveNode::modify(a, None, data(5), data(1)));
        list.push(MoveNode::delete(EntryHandle::new(None, 7).unwrap(), None));

        let err = inst.replay_move_list(list).unwrap_err();
        assert_eq!(err.processed, 1);
        assert!(matches!(err.source, PipeError::NotFound { .. }));
        assert_eq!(inst.entry(a).unwrap().data, data(1));
    }

    #[test]
    fn test_shadow_processing_posts_nothing() {
        let (mut hw, log) = recording_hw();
        let mut inst = instance();
        let (h, list) = inst.add(MemberId::new(1), data(1)).unwrap();
        inst.place_shared(&mut hw, h, StageId::new(1)).unwrap();

        assert_eq!(inst.process_move_list_shadow(list).unwrap(), 1);
        assert!(log.instructions().is_empty());
        let phys = inst.physical_entry(h).unwrap();
        assert_eq!(phys.shared, inst.entry(h).unwrap().shared);
        assert_eq!(inst.stage_occupancy(StageId::new(1)).unwrap().programmed, 1);
        assert!(inst.diverged_entries().is_empty());
    }

    #[test]
    fn test_modify_writes_shared_before_duplicates() {
        let (mut hw, log) = recording_hw();
        let mut inst = instance();
        let (h, list) = inst.add(MemberId::new(1), data(1)).unwrap();
        inst.place_shared_at(&mut hw, h, StageId::new(2), StageIndex::new(4)).unwrap();
        inst.process_move_list(&mut hw, list).unwrap();
        inst.activate_non_shared(&mut hw, h, StageId::new(1), StageIndex::new(9)).unwrap();
        log.clear();

        let new = data(2).with_resource(ResourceSpec::direct(ResourceKind::Counter));
        let list = inst.modify(h, new.clone()).unwrap();
        assert_eq!(inst.diverged_entries(), vec![h]);
        inst.process_move_list(&mut hw, list).unwrap();

        let posted = log.posted();
        assert_kinds(&log.instructions(), &[InstrKind::WriteWord, InstrKind::WriteWord]);
        // shared copy in stage 2 goes out before the duplicate in stage 1
        assert_eq!(posted[0].target.stage, StageId::new(2));
        assert_eq!(posted[1].target.stage, StageId::new(1));
        assert_eq!(inst.physical_entry(h).unwrap().data, new);
        assert!(inst.diverged_entries().is_empty());
    }

    #[test]
    fn test_llp_delete_releases_deferred_handle() {
        let (mut hw, _log) = recording_hw();
        let mut inst = instance();
        let (h, list) = inst.add(MemberId::new(1), data(1)).unwrap();
        inst.process_move_list(&mut hw, list).unwrap();

        let list = inst.delete(h).unwrap();
        // the shadow still holds the entry, so the handle stays taken
        assert!(inst.handles().is_allocated(h));
        assert_eq!(inst.diverged_entries(), vec![h]);

        inst.process_move_list(&mut hw, list).unwrap();
        assert!(!inst.handles().is_allocated(h));
        assert!(inst.physical_entry(h).is_err());
        assert!(inst.diverged_entries().is_empty());
    }

    #[test]
    fn test_handle_held_while_add_is_outstanding() {
        let (mut hw, log) = recording_hw();
        let mut inst = instance();
        let (a, add_a) = inst.add(MemberId::new(1), data(1)).unwrap();
        let delete_a = inst.delete(a).unwrap();
        assert!(inst.handles().is_pending(a));

        let (b, add_b) = inst.add(MemberId::new(2), data(2)).unwrap();
        assert_ne!(a, b);
        inst.place_shared(&mut hw, b, StageId::new(1)).unwrap();
        log.clear();

        inst.process_move_list(&mut hw, add_a).unwrap();
        let orphan = inst.physical_entry(a).unwrap();
        assert!(!orphan.has_locations());
        assert!(log.instructions().is_empty());

        inst.process_move_list(&mut hw, delete_a).unwrap();
        assert!(!inst.handles().is_allocated(a));

        inst.process_move_list(&mut hw, add_b).unwrap();
        let phys = inst.physical_entry(b).unwrap();
        assert_eq!(phys.data, data(2));
        assert_eq!(phys.shared, inst.entry(b).unwrap().shared);
        assert_kinds(&log.instructions(), &[InstrKind::WriteWord]);
        assert!(!inst.handles().is_pending(b));
        assert!(inst.diverged_entries().is_empty());
    }

    #[test]
    fn test_failure_reports_processed_and_rolls_back() {
        let (mut hw, log) = recording_hw();
        let mut inst = instance();
        let (a, list_a) = inst.add(MemberId::new(1), data(1)).unwrap();
        let mut list = list_a.clone();
        list.append(list_a);

        let err = inst.process_move_list(&mut hw, list).unwrap_err();
        assert_eq!(err.processed, 1);
        assert!(matches!(err.source, PipeError::AlreadyExists { .. }));
        assert!(inst.physical_entry(a).is_err());
        assert_eq!(log.flushes(), 0);
        assert_eq!(log.discards(), 1);
    }

    #[test]
    fn test_node_for_other_pipe() {
        let pipe = PipeId::new(2).unwrap();
        let mut inst = TableInstance::new(&profile(), Some(pipe), InstanceConfig::default());
        let stray = MoveNode::delete(EntryHandle::new(None, 1).unwrap(), None);
        let err = inst.process_move_list_shadow(MoveList::from(stray)).unwrap_err();
        assert_eq!(err.processed, 0);
        assert!(matches!(err.source, PipeError::InvalidArgument { .. }));
    }

    #[test]
    fn test_sync_from_hw() {
        let (mut hw, _log) = recording_hw();
        let mut inst = instance();
        let (h, list) = inst.add(MemberId::new(1), data(1)).unwrap();
        inst.place_shared(&mut hw, h, StageId::new(1)).unwrap();
        inst.process_move_list(&mut hw, list).unwrap();

        let index = inst.entry(h).unwrap().shared[0].index;
        let addr = inst.stage_info(StageId::new(1)).unwrap().layout.addr(0, index).unwrap();
        let words = FakeEncoder
            .encode(
                &EncodeTarget {
                    table: inst.table(),
                    index,
                    addr,
                },
                &data(7),
            )
            .unwrap();

        assert_eq!(inst.sync_from_hw(&hw, h, StageId::new(1), &words).unwrap(), data(7));
        assert_eq!(inst.physical_entry(h).unwrap().data, data(7));
        assert_eq!(inst.diverged_entries(), vec![h]);

        assert!(matches!(
            inst.sync_from_hw(&hw, h, StageId::new(2), &words),
            Err(PipeError::NotFound { .. })
        ));
        // garbage words leave the record alone
        assert!(inst.sync_from_hw(&hw, h, StageId::new(1), &[0xff]).is_err());
        assert_eq!(inst.physical_entry(h).unwrap().data, data(7));
    }
}
