//! Shared and non-shared placement of entries in stages.
//!
//! Shared locations belong to the logical record and are reference counted:
//! one allocator index per (entry, stage) no matter how many match entries
//! point at it. Whenever the hardware shadow holds the entry, a change to a
//! shared location is mirrored into it and programmed. Non-shared locations
//! are private duplicates at indices the caller already owns; they live only
//! in the physical record.

use super::hw::Hardware;
use super::instance::TableInstance;
use crate::entry::StageLocation;
use crate::fault::consistency_fault;
use log::{debug, warn};
use pipemgr_common::HasRefCount;
use pipemgr_hw::{EncodeTarget, EntryData, Instruction, PipeError, PipeResult};
use pipemgr_types::{EntryHandle, StageId, StageIndex};

impl TableInstance {
    /// Places the entry in `stage`, sharing the existing location if there
    /// is one. Returns the stage index.
    pub fn place_shared(
        &mut self,
        hw: &mut Hardware,
        handle: EntryHandle,
        stage: StageId,
    ) -> PipeResult<StageIndex> {
        self.place(hw, handle, stage, None)
    }

    /// Places the entry in `stage` at a caller-chosen index.
    ///
    /// Sharing an existing location at the same index is allowed; any other
    /// index, or one already held by another entry, is `AlreadyExists`.
    pub fn place_shared_at(
        &mut self,
        hw: &mut Hardware,
        handle: EntryHandle,
        stage: StageId,
        index: StageIndex,
    ) -> PipeResult<StageIndex> {
        self.place(hw, handle, stage, Some(index))
    }

    fn place(
        &mut self,
        hw: &mut Hardware,
        handle: EntryHandle,
        stage: StageId,
        want: Option<StageIndex>,
    ) -> PipeResult<StageIndex> {
        self.check_handle(handle)?;
        self.transact_hw(hw, |inst, hw| {
            inst.stage_info(stage)?;
            let existing = inst.store.logical(handle)?.shared_at(stage).copied();
            inst.mark_dirty(handle);

            let index = match (existing, want) {
                (Some(loc), None) => loc.index,
                (Some(loc), Some(index)) if loc.index == index => index,
                (Some(loc), Some(index)) => {
                    return Err(PipeError::already_exists(format!(
                        "entry {} in {} (placed at {}, requested {})",
                        handle, stage, loc.index, index
                    )));
                }
                (None, want) => {
                    inst.mark_stage_dirty(stage);
                    let info = inst.stage_mut(stage)?;
                    let index = match want {
                        Some(index) => {
                            info.reserve_entry(index)?;
                            index
                        }
                        None => info.alloc_entry().inspect_err(|e| {
                            warn!("Cannot place entry {} in {}: {}", handle, stage, e);
                        })?,
                    };
                    info.occupancy.occupied += 1;
                    inst.store.logical_mut(handle)?.insert_shared(StageLocation {
                        stage,
                        index,
                        ref_count: 0,
                    });
                    index
                }
            };

            let entry = inst.store.logical_mut(handle)?;
            let refs = match entry.shared_at_mut(stage) {
                Some(loc) => {
                    loc.ref_count += 1;
                    loc.ref_count
                }
                None => return Err(consistency_fault(format!("entry {} lost its {} location", handle, stage))),
            };
            entry.increment_ref();
            inst.mirror_shared(Some(hw), handle, stage)?;
            inst.stats.placements += 1;
            debug!(
                "Table {}: entry {} placed in {} at {} (refs {})",
                inst.table, handle, stage, index, refs
            );
            Ok(index)
        })
    }

    /// Drops one reference to the entry's location in `stage` and returns
    /// the references left. The index is released when none remain.
    pub fn remove_shared(
        &mut self,
        hw: &mut Hardware,
        handle: EntryHandle,
        stage: StageId,
    ) -> PipeResult<u32> {
        self.check_handle(handle)?;
        self.transact_hw(hw, |inst, hw| {
            let loc = inst
                .store
                .logical(handle)?
                .shared_at(stage)
                .copied()
                .ok_or_else(|| PipeError::not_found(format!("location of entry {} in {}", handle, stage)))?;
            if loc.ref_count == 0 {
                return Err(consistency_fault(format!(
                    "entry {} has an unreferenced location in {}",
                    handle, stage
                )));
            }
            inst.mark_dirty(handle);

            let entry = inst.store.logical_mut(handle)?;
            if entry.decrement_ref().is_none() {
                return Err(consistency_fault(format!(
                    "entry {} reference count underflow",
                    handle
                )));
            }
            let remaining = loc.ref_count - 1;
            if remaining == 0 {
                entry.remove_shared_at(stage);
            } else if let Some(live) = entry.shared_at_mut(stage) {
                live.ref_count = remaining;
            }

            // unprogramming drains the pipeline before the index is reused
            inst.mirror_shared(Some(hw), handle, stage)?;

            if remaining == 0 {
                inst.mark_stage_dirty(stage);
                let info = inst.stage_mut(stage)?;
                info.release_entry(loc.index)
                    .map_err(|e| consistency_fault(format!("releasing {} in {}: {}", loc.index, stage, e)))?;
                info.occupancy.occupied = info.occupancy.occupied.checked_sub(1).ok_or_else(|| {
                    consistency_fault(format!("occupancy underflow in {}", stage))
                })?;
            }
            inst.stats.removals += 1;
            debug!(
                "Table {}: entry {} removed from {} ({} reference(s) left)",
                inst.table, handle, stage, remaining
            );
            Ok(remaining)
        })
    }

    /// Records and programs a private duplicate at a caller-owned index.
    pub fn activate_non_shared(
        &mut self,
        hw: &mut Hardware,
        handle: EntryHandle,
        stage: StageId,
        index: StageIndex,
    ) -> PipeResult<()> {
        self.check_handle(handle)?;
        self.transact_hw(hw, |inst, hw| {
            inst.stage_info(stage)?;
            let phys = inst.store.physical(handle)?;
            if phys.non_shared_at(stage, index).is_some() {
                return Err(PipeError::already_exists(format!(
                    "duplicate of entry {} at {} in {}",
                    handle, index, stage
                )));
            }
            let data = phys.data.clone();
            inst.mark_dirty(handle);
            inst.mark_stage_dirty(stage);

            inst.program(Some(hw), stage, index, &data)?;
            inst.store
                .physical_mut(handle)?
                .insert_non_shared(StageLocation::new(stage, index));
            inst.stage_mut(stage)?.occupancy.llp_occupied += 1;
            debug!(
                "Table {}: duplicate of entry {} activated at {} in {}",
                inst.table, handle, index, stage
            );
            Ok(())
        })
    }

    /// Forgets a private duplicate.
    pub fn deactivate_non_shared(
        &mut self,
        hw: &mut Hardware,
        handle: EntryHandle,
        stage: StageId,
        index: StageIndex,
    ) -> PipeResult<()> {
        self.check_handle(handle)?;
        self.transact_hw(hw, |inst, hw| {
            if inst.store.physical(handle)?.non_shared_at(stage, index).is_none() {
                return Err(PipeError::not_found(format!(
                    "duplicate of entry {} at {} in {}",
                    handle, index, stage
                )));
            }
            inst.mark_dirty(handle);
            inst.mark_stage_dirty(stage);

            inst.unprogram(Some(hw), stage, index)?;
            inst.store.physical_mut(handle)?.remove_non_shared(stage, index);
            let occ = &mut inst.stage_mut(stage)?.occupancy;
            occ.llp_occupied = occ.llp_occupied.checked_sub(1).ok_or_else(|| {
                consistency_fault(format!("duplicate occupancy underflow in {}", stage))
            })?;
            debug!(
                "Table {}: duplicate of entry {} deactivated at {} in {}",
                inst.table, handle, index, stage
            );
            Ok(())
        })
    }

    /// Brings the physical record's location in `stage` in line with the
    /// logical one, programming or unprogramming as needed. No-op while the
    /// hardware shadow does not hold the entry.
    pub(super) fn mirror_shared(
        &mut self,
        hw: Option<&mut Hardware>,
        handle: EntryHandle,
        stage: StageId,
    ) -> PipeResult<()> {
        let logical = self
            .store
            .get_logical(handle)
            .and_then(|e| e.shared_at(stage))
            .copied();
        let Some(phys) = self.store.get_physical(handle) else {
            return Ok(());
        };
        let physical = phys.shared_at(stage).copied();
        let data = phys.data.clone();

        match (logical, physical) {
            (Some(want), Some(have)) if want.index == have.index => {
                if let Some(loc) = self.store.physical_mut(handle)?.shared_at_mut(stage) {
                    loc.ref_count = want.ref_count;
                }
            }
            (Some(want), Some(have)) => {
                return Err(consistency_fault(format!(
                    "entry {} placed at {} in {} but programmed at {}",
                    handle, want.index, stage, have.index
                )));
            }
            (Some(want), None) => {
                self.mark_stage_dirty(stage);
                self.program(hw, stage, want.index, &data)?;
                self.store.physical_mut(handle)?.insert_shared(want);
                self.stage_mut(stage)?.occupancy.programmed += 1;
            }
            (None, Some(have)) => {
                self.mark_stage_dirty(stage);
                self.unprogram(hw, stage, have.index)?;
                self.store.physical_mut(handle)?.remove_shared_at(stage);
                let occ = &mut self.stage_mut(stage)?.occupancy;
                occ.programmed = occ.programmed.checked_sub(1).ok_or_else(|| {
                    consistency_fault(format!("programmed count underflow in {}", stage))
                })?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Encodes `data` for `index` and writes it.
    pub(super) fn program(
        &self,
        hw: Option<&mut Hardware>,
        stage: StageId,
        index: StageIndex,
        data: &EntryData,
    ) -> PipeResult<()> {
        let Some(hw) = hw else {
            return Ok(());
        };
        let addr = self.stage_info(stage)?.layout.addr(self.addr_pipe(), index)?;
        let words = hw.encode(
            &EncodeTarget {
                table: self.table,
                index,
                addr,
            },
            data,
        )?;
        hw.post(&self.target.with_stage(stage), &Instruction::WriteWord { addr, data: words })
    }

    /// Stops `index` from matching. Direct-indexed memories need nothing;
    /// ternary memories get an invalidation and the drain no-ops.
    pub(super) fn unprogram(
        &self,
        hw: Option<&mut Hardware>,
        stage: StageId,
        index: StageIndex,
    ) -> PipeResult<()> {
        let Some(hw) = hw else {
            return Ok(());
        };
        let layout = &self.stage_info(stage)?.layout;
        if !layout.mem_type.needs_invalidate() {
            return Ok(());
        }
        let addr = layout.addr(self.addr_pipe(), index)?;
        let target = self.target.with_stage(stage);
        hw.post(&target, &Instruction::InvalidateTcam { addr })?;
        for _ in 0..self.config.drain_noops {
            hw.post(&target, &Instruction::Noop)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::instance::InstanceConfig;
    use super::super::recording_hw;
    use super::*;
    use crate::config::{StageProfile, TableKind, TableProfile};
    use crate::move_list::MoveList;
    use pipemgr_hw::{InstrKind, MemType};
    use pipemgr_test::{assert_kinds, count_kind};
    use pipemgr_types::{MemberId, TableHandle};
    use pretty_assertions::assert_eq;

    fn profile(kind: TableKind, span: u32) -> TableProfile {
        let mem_type = kind.mem_type();
        TableProfile {
            handle: TableHandle::new(2),
            name: "placement".to_string(),
            kind,
            max_entries: 16,
            stages: vec![
                StageProfile {
                    stage: StageId::new(1),
                    mem_type,
                    ram_depth: 8,
                    entry_span: span,
                    ..Default::default()
                },
                StageProfile {
                    stage: StageId::new(2),
                    mem_type,
                    ram_depth: 8,
                    entry_span: span,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn config() -> InstanceConfig {
        InstanceConfig {
            drain_noops: 2,
            ..Default::default()
        }
    }

    fn data(n: u8) -> EntryData {
        EntryData::new(u32::from(n), vec![n; 2])
    }

    fn stage(n: u8) -> StageId {
        StageId::new(n)
    }

    #[test]
    fn test_shared_ref_counting() {
        let (mut hw, _log) = recording_hw();
        let mut inst = TableInstance::new(&profile(TableKind::ActionData, 1), None, config());
        let (h, _) = inst.add(MemberId::new(1), data(1)).unwrap();

        let first = inst.place_shared(&mut hw, h, stage(1)).unwrap();
        let second = inst.place_shared(&mut hw, h, stage(1)).unwrap();
        assert_eq!(first, second);
        let entry = inst.entry(h).unwrap();
        assert_eq!(entry.ref_count, 2);
        assert_eq!(entry.shared_at(stage(1)).map(|l| l.ref_count), Some(2));
        let info = inst.stage_info(stage(1)).unwrap();
        assert_eq!(info.allocator.used(), 1);
        assert_eq!(info.occupancy.occupied, 1);

        assert_eq!(inst.remove_shared(&mut hw, h, stage(1)).unwrap(), 1);
        assert!(inst.stage_info(stage(1)).unwrap().allocator.is_allocated(first.get()));

        assert_eq!(inst.remove_shared(&mut hw, h, stage(1)).unwrap(), 0);
        let info = inst.stage_info(stage(1)).unwrap();
        assert!(!info.allocator.is_allocated(first.get()));
        assert_eq!(info.occupancy.occupied, 0);
        assert!(inst.entry(h).unwrap().shared.is_empty());
        assert_eq!(inst.entry(h).unwrap().ref_count, 0);
    }

    #[test]
    fn test_place_in_two_stages() {
        let (mut hw, _log) = recording_hw();
        let mut inst = TableInstance::new(&profile(TableKind::ActionData, 1), None, config());
        let (h, _) = inst.add(MemberId::new(1), data(1)).unwrap();
        inst.place_shared(&mut hw, h, stage(2)).unwrap();
        inst.place_shared(&mut hw, h, stage(1)).unwrap();
        let stages: Vec<StageId> = inst.entry(h).unwrap().shared.iter().map(|l| l.stage).collect();
        assert_eq!(stages, vec![stage(1), stage(2)]);
        assert_eq!(inst.entry(h).unwrap().ref_count, 2);
    }

    #[test]
    fn test_remove_missing_location() {
        let (mut hw, _log) = recording_hw();
        let mut inst = TableInstance::new(&profile(TableKind::ActionData, 1), None, config());
        let (h, _) = inst.add(MemberId::new(1), data(1)).unwrap();
        assert!(matches!(
            inst.remove_shared(&mut hw, h, stage(1)),
            Err(PipeError::NotFound { .. })
        ));
        assert!(matches!(
            inst.place_shared(&mut hw, h, stage(9)),
            Err(PipeError::NotFound { .. })
        ));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "consistency fault")]
    fn test_zero_ref_location_is_fault() {
        let (mut hw, _log) = recording_hw();
        let mut inst = TableInstance::new(&profile(TableKind::ActionData, 1), None, config());
        let (h, _) = inst.add(MemberId::new(1), data(1)).unwrap();
        inst.place_shared(&mut hw, h, stage(1)).unwrap();
        if let Some(loc) = inst.store.logical_mut(h).unwrap().shared_at_mut(stage(1)) {
            loc.ref_count = 0;
        }
        let _ = inst.remove_shared(&mut hw, h, stage(1));
    }

    #[test]
    fn test_place_at_explicit_index() {
        let (mut hw, _log) = recording_hw();
        let mut inst = TableInstance::new(&profile(TableKind::Tcam, 1), None, config());
        let (a, _) = inst.add(MemberId::new(1), data(1)).unwrap();
        let (b, _) = inst.add(MemberId::new(2), data(2)).unwrap();

        let idx = StageIndex::new(5);
        assert_eq!(inst.place_shared_at(&mut hw, a, stage(1), idx).unwrap(), idx);
        // sharing at the same index is fine
        assert_eq!(inst.place_shared_at(&mut hw, a, stage(1), idx).unwrap(), idx);
        assert_eq!(inst.entry(a).unwrap().ref_count, 2);

        // another index for the same entry, or the same index for another
        let before = inst.store.clone();
        assert!(matches!(
            inst.place_shared_at(&mut hw, a, stage(1), StageIndex::new(6)),
            Err(PipeError::AlreadyExists { .. })
        ));
        assert!(matches!(
            inst.place_shared_at(&mut hw, b, stage(1), idx),
            Err(PipeError::AlreadyExists { .. })
        ));
        assert_eq!(inst.store, before);
        assert_eq!(inst.stage_occupancy(stage(1)).unwrap().occupied, 1);
    }

    #[test]
    fn test_spanning_entries() {
        let (mut hw, _log) = recording_hw();
        let mut inst = TableInstance::new(&profile(TableKind::ActionData, 2), None, config());
        let (a, _) = inst.add(MemberId::new(1), data(1)).unwrap();
        let (b, _) = inst.add(MemberId::new(2), data(2)).unwrap();
        assert_eq!(inst.place_shared(&mut hw, a, stage(1)).unwrap(), StageIndex::new(0));
        assert_eq!(inst.place_shared(&mut hw, b, stage(1)).unwrap(), StageIndex::new(2));
        assert_eq!(inst.stage_info(stage(1)).unwrap().allocator.used(), 4);

        inst.remove_shared(&mut hw, a, stage(1)).unwrap();
        assert_eq!(inst.stage_info(stage(1)).unwrap().allocator.used(), 2);
    }

    #[test]
    fn test_stage_exhausted_is_clean() {
        let (mut hw, _log) = recording_hw();
        let mut small = profile(TableKind::ActionData, 1);
        small.stages[0].ram_depth = 1;
        let mut inst = TableInstance::new(&small, None, config());
        let (a, _) = inst.add(MemberId::new(1), data(1)).unwrap();
        let (b, _) = inst.add(MemberId::new(2), data(2)).unwrap();
        inst.place_shared(&mut hw, a, stage(1)).unwrap();

        let before = inst.store.clone();
        let err = inst.place_shared(&mut hw, b, stage(1)).unwrap_err();
        assert!(matches!(err, PipeError::Exhausted { .. }));
        assert_eq!(inst.store, before);
        assert_eq!(inst.stage_occupancy(stage(1)).unwrap().occupied, 1);
    }

    #[test]
    fn test_placement_programs_once_shadow_holds_entry() {
        let (mut hw, log) = recording_hw();
        let mut inst = TableInstance::new(&profile(TableKind::Tcam, 1), None, config());
        let (h, list): (EntryHandle, MoveList) = inst.add(MemberId::new(1), data(1)).unwrap();

        // logical only: nothing to program yet
        inst.place_shared(&mut hw, h, stage(1)).unwrap();
        assert!(log.instructions().is_empty());

        inst.process_move_list(&mut hw, list).unwrap();
        assert_kinds(&log.instructions(), &[InstrKind::WriteWord]);
        assert_eq!(inst.stage_occupancy(stage(1)).unwrap().programmed, 1);
        log.clear();

        // a second reference reuses the programmed location
        inst.place_shared(&mut hw, h, stage(1)).unwrap();
        assert!(log.instructions().is_empty());
        assert_eq!(
            inst.physical_entry(h).unwrap().shared_at(stage(1)).map(|l| l.ref_count),
            Some(2)
        );

        inst.remove_shared(&mut hw, h, stage(1)).unwrap();
        assert!(log.instructions().is_empty());

        // the last reference invalidates and drains
        inst.remove_shared(&mut hw, h, stage(1)).unwrap();
        assert_kinds(
            &log.instructions(),
            &[InstrKind::InvalidateTcam, InstrKind::Noop, InstrKind::Noop],
        );
        let occ = inst.stage_occupancy(stage(1)).unwrap();
        assert_eq!((occ.occupied, occ.programmed), (0, 0));
        assert!(inst.physical_entry(h).unwrap().shared.is_empty());
    }

    #[test]
    fn test_sram_removal_posts_nothing() {
        let (mut hw, log) = recording_hw();
        let mut inst = TableInstance::new(&profile(TableKind::ActionData, 1), None, config());
        let (h, list) = inst.add(MemberId::new(1), data(1)).unwrap();
        inst.process_move_list(&mut hw, list).unwrap();
        inst.place_shared(&mut hw, h, stage(1)).unwrap();
        assert_eq!(count_kind(&log.instructions(), InstrKind::WriteWord), 1);
        log.clear();

        inst.remove_shared(&mut hw, h, stage(1)).unwrap();
        assert!(log.instructions().is_empty());
        assert_eq!(log.flushes(), 1);
    }

    #[test]
    fn test_non_shared_duplicates() {
        let (mut hw, log) = recording_hw();
        let mut inst = TableInstance::new(&profile(TableKind::Tcam, 1), None, config());
        let (h, list) = inst.add(MemberId::new(1), data(1)).unwrap();

        // needs the hardware shadow
        assert!(matches!(
            inst.activate_non_shared(&mut hw, h, stage(2), StageIndex::new(3)),
            Err(PipeError::NotFound { .. })
        ));
        inst.process_move_list(&mut hw, list).unwrap();

        inst.activate_non_shared(&mut hw, h, stage(2), StageIndex::new(3)).unwrap();
        assert!(matches!(
            inst.activate_non_shared(&mut hw, h, stage(2), StageIndex::new(3)),
            Err(PipeError::AlreadyExists { .. })
        ));
        let occ = inst.stage_occupancy(stage(2)).unwrap();
        assert_eq!(occ.llp_occupied, 1);
        // the allocator is not involved
        assert_eq!(inst.stage_info(stage(2)).unwrap().allocator.used(), 0);
        assert_eq!(count_kind(&log.instructions(), InstrKind::WriteWord), 1);

        // private duplicates block deletion
        assert!(matches!(inst.delete(h), Err(PipeError::ReferencesExist { .. })));

        inst.deactivate_non_shared(&mut hw, h, stage(2), StageIndex::new(3)).unwrap();
        assert_eq!(inst.stage_occupancy(stage(2)).unwrap().llp_occupied, 0);
        assert_eq!(count_kind(&log.instructions(), InstrKind::InvalidateTcam), 1);
        assert!(matches!(
            inst.deactivate_non_shared(&mut hw, h, stage(2), StageIndex::new(3)),
            Err(PipeError::NotFound { .. })
        ));
    }

    #[test]
    fn test_addresses_follow_layout() {
        let (mut hw, log) = recording_hw();
        let mut inst = TableInstance::new(&profile(TableKind::Tcam, 1), None, config());
        let (h, list) = inst.add(MemberId::new(1), data(1)).unwrap();
        inst.process_move_list(&mut hw, list).unwrap();
        inst.place_shared_at(&mut hw, h, stage(2), StageIndex::new(6)).unwrap();

        let posted = log.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].target.stage, stage(2));
        match &posted[0].instr {
            Instruction::WriteWord { addr, .. } => {
                assert_eq!(addr.stage, stage(2));
                assert_eq!(addr.mem_type, MemType::Tcam);
                assert_eq!(addr.line, 6);
            }
            other => panic!("unexpected instruction {}", other),
        }
    }
}
