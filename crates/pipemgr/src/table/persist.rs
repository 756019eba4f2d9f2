//! State walk and restore of a table instance.

use super::instance::{TableInstance, TxnMode};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::state::{EntryState, InstanceState, StageState};
use log::{debug, info};
use pipemgr_hw::{PipeError, PipeResult};
use std::collections::BTreeSet;

impl TableInstance {
    /// Walks records and stages in ascending order.
    pub fn log_state(&self) -> InstanceState {
        let handles: BTreeSet<_> = self
            .store
            .logical_entries()
            .map(|e| e.handle)
            .chain(self.store.physical_entries().map(|e| e.handle))
            .collect();
        let entries = handles
            .into_iter()
            .map(|handle| EntryState {
                handle,
                logical: self.store.get_logical(handle).cloned(),
                physical: self.store.get_physical(handle).cloned(),
            })
            .collect();
        let stages = self
            .stages
            .values()
            .map(|info| StageState {
                stage: info.stage(),
                occupancy: info.occupancy,
                indices_used: info.allocator.used(),
            })
            .collect();
        InstanceState {
            table: self.table,
            pipe: self.pipe,
            entries,
            stages,
        }
    }

    /// Replaces the instance's records with `state`.
    ///
    /// The state is replayed into an empty instance, reserving every handle
    /// and index explicitly. A conflict or a counter that disagrees with the
    /// saved one fails with `Unexpected` and leaves the instance untouched.
    pub fn restore_state(&mut self, state: &InstanceState) -> PipeResult<()> {
        if state.table != self.table || state.pipe != self.pipe {
            return Err(PipeError::invalid_argument(format!(
                "state of table {} {:?} cannot restore table {} {}",
                state.table,
                state.pipe,
                self.table,
                self.scope()
            )));
        }
        if self.txn_mode != TxnMode::None {
            return Err(PipeError::invalid_argument(format!(
                "table {} {} has a transaction in progress",
                self.table,
                self.scope()
            )));
        }

        let result = self.replay_state(state);
        let record = AuditRecord::new(AuditCategory::StateRestore, "TableInstance", "restore_state")
            .with_object_id(self.table.to_string())
            .with_object_type("table");
        match result {
            Ok(fresh) => {
                *self = fresh;
                info!(
                    "Table {} {}: restored {} entr(y/ies)",
                    self.table,
                    self.scope(),
                    state.entries.len()
                );
                crate::audit_log!(record
                    .with_outcome(AuditOutcome::Success)
                    .with_details(serde_json::json!({ "entries": state.entries.len() })));
                Ok(())
            }
            Err(e) => {
                crate::audit_log!(record.with_error(e.to_string()));
                Err(e)
            }
        }
    }

    pub(super) fn replay_state(&self, state: &InstanceState) -> PipeResult<TableInstance> {
        let mut fresh = self.fresh();
        for entry in &state.entries {
            fresh.replay_entry(entry)?;
        }
        for saved in &state.stages {
            let info = fresh.stage_info(saved.stage).map_err(|e| fresh.replay_error(e.to_string()))?;
            if info.occupancy != saved.occupancy || info.allocator.used() != saved.indices_used {
                return Err(fresh.replay_error(format!(
                    "{} replays to {:?} with {} indices, saved {:?} with {}",
                    saved.stage,
                    info.occupancy,
                    info.allocator.used(),
                    saved.occupancy,
                    saved.indices_used
                )));
            }
        }
        Ok(fresh)
    }

    fn replay_entry(&mut self, saved: &EntryState) -> PipeResult<()> {
        let handle = saved.handle;
        if saved.logical.as_ref().is_some_and(|l| l.handle != handle)
            || saved.physical.as_ref().is_some_and(|p| p.handle != handle)
        {
            return Err(self.replay_error(format!("records filed under the wrong handle {}", handle)));
        }
        if saved.logical.is_none() && saved.physical.is_none() {
            return Err(self.replay_error(format!("entry {} has no records", handle)));
        }
        self.check_handle(handle)
            .and_then(|()| self.handles.reserve(handle))
            .map_err(|e| self.replay_error(e.to_string()))?;

        if let Some(logical) = &saved.logical {
            let refs: u32 = logical.shared.iter().map(|l| l.ref_count).sum();
            if refs != logical.ref_count {
                return Err(self.replay_error(format!(
                    "entry {} counts {} references but its locations hold {}",
                    handle, logical.ref_count, refs
                )));
            }
            for loc in &logical.shared {
                let reserved = self.stage_mut(loc.stage).and_then(|info| {
                    info.reserve_entry(loc.index)?;
                    info.occupancy.occupied += 1;
                    Ok(())
                });
                reserved.map_err(|e| self.replay_error(format!("entry {}: {}", handle, e)))?;
            }
            let inserted = self.store.insert_logical(logical.clone());
            inserted.map_err(|e| self.replay_error(e.to_string()))?;
        }

        if let Some(physical) = &saved.physical {
            for loc in &physical.shared {
                let placed = saved
                    .logical
                    .as_ref()
                    .and_then(|l| l.shared_at(loc.stage))
                    .is_some_and(|l| l.index == loc.index);
                if !placed {
                    return Err(self.replay_error(format!(
                        "entry {} is programmed at {} in {} without being placed there",
                        handle, loc.index, loc.stage
                    )));
                }
                self.stage_mut(loc.stage)?.occupancy.programmed += 1;
            }
            for loc in &physical.non_shared {
                let counted = self
                    .stage_mut(loc.stage)
                    .map(|info| info.occupancy.llp_occupied += 1);
                counted.map_err(|e| self.replay_error(format!("entry {}: {}", handle, e)))?;
            }
            let inserted = self.store.insert_physical(physical.clone());
            inserted.map_err(|e| self.replay_error(e.to_string()))?;
        } else if saved.logical.is_some() {
            // added but never processed into the shadow
            self.handles.mark_pending(handle);
        }
        debug!("Table {}: replayed entry {}", self.table, handle);
        Ok(())
    }

    fn replay_error(&self, what: String) -> PipeError {
        PipeError::unexpected(format!("state replay of table {} {}: {}", self.table, self.scope(), what))
    }
}

#[cfg(test)]
mod tests {
    use super::super::instance::InstanceConfig;
    use super::super::recording_hw;
    use super::*;
    use crate::config::{StageProfile, TableKind, TableProfile};
    use pipemgr_hw::{EntryData, ResourceKind, ResourceSpec};
    use pipemgr_types::{EntryHandle, MemberId, PipeId, StageId, StageIndex, TableHandle};
    use pretty_assertions::assert_eq;

    fn profile() -> TableProfile {
        TableProfile {
            handle: TableHandle::new(4),
            name: "persist".to_string(),
            kind: TableKind::Tcam,
            symmetric: false,
            max_entries: 16,
            stages: vec![
                StageProfile {
                    stage: StageId::new(0),
                    mem_type: TableKind::Tcam.mem_type(),
                    ram_depth: 16,
                    ..Default::default()
                },
                StageProfile {
                    stage: StageId::new(3),
                    mem_type: TableKind::Tcam.mem_type(),
                    ram_depth: 16,
                    entry_span: 2,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn pipe() -> Option<PipeId> {
        PipeId::new(1).ok()
    }

    fn instance() -> TableInstance {
        TableInstance::new(&profile(), pipe(), InstanceConfig::default())
    }

    fn populated() -> TableInstance {
        let (mut hw, _log) = recording_hw();
        let mut inst = instance();
        let payload = EntryData::new(1, vec![1, 2]).with_resource(ResourceSpec::direct(ResourceKind::Counter));
        let (a, list_a) = inst.add(MemberId::new(10), payload).unwrap();
        let (b, list_b) = inst.add(MemberId::new(11), EntryData::new(2, vec![3])).unwrap();
        let (c, _) = inst.add(MemberId::new(12), EntryData::new(3, vec![4])).unwrap();
        inst.place_shared(&mut hw, a, StageId::new(0)).unwrap();
        inst.place_shared(&mut hw, a, StageId::new(0)).unwrap();
        inst.place_shared(&mut hw, a, StageId::new(3)).unwrap();
        inst.process_move_list(&mut hw, list_a).unwrap();
        inst.process_move_list(&mut hw, list_b).unwrap();
        inst.activate_non_shared(&mut hw, b, StageId::new(3), StageIndex::new(8)).unwrap();
        inst.place_shared_at(&mut hw, c, StageId::new(3), StageIndex::new(6)).unwrap();
        // b leaves the logical layer before its shadow catches up
        inst.deactivate_non_shared(&mut hw, b, StageId::new(3), StageIndex::new(8)).unwrap();
        inst.delete(b).unwrap();
        inst
    }

    #[test]
    fn test_walk_is_ordered() {
        let inst = populated();
        let state = inst.log_state();
        let handles: Vec<u32> = state.entries.iter().map(|e| e.handle.id()).collect();
        assert_eq!(handles, vec![1, 2, 3]);
        let stages: Vec<StageId> = state.stages.iter().map(|s| s.stage).collect();
        assert_eq!(stages, vec![StageId::new(0), StageId::new(3)]);

        let b = state.entry(EntryHandle::new(pipe(), 2).unwrap()).unwrap();
        assert!(b.logical.is_none());
        assert!(b.physical.is_some());
        assert_eq!(state.stages[1].indices_used, 4);
    }

    #[test]
    fn test_round_trip_through_json() {
        let inst = populated();
        let state = inst.log_state();
        let text = serde_json::to_string(&state).unwrap();
        let loaded: InstanceState = serde_json::from_str(&text).unwrap();
        assert_eq!(loaded, state);

        let mut restored = instance();
        restored.restore_state(&loaded).unwrap();
        assert_eq!(restored.log_state(), state);
        assert_eq!(restored.store, inst.store);
        assert_eq!(restored.handles(), inst.handles());
        for id in [StageId::new(0), StageId::new(3)] {
            assert_eq!(
                restored.stage_info(id).unwrap().allocator,
                inst.stage_info(id).unwrap().allocator
            );
        }
        assert_eq!(restored.member_owner(MemberId::new(12)), inst.member_owner(MemberId::new(12)));
    }

    #[test]
    fn test_conflicting_index_is_unexpected() {
        let inst = populated();
        let mut state = inst.log_state();
        // give c the index a already holds in stage 3
        let a_index = state.entries[0].logical.as_ref().unwrap().shared_at(StageId::new(3)).unwrap().index;
        if let Some(c) = state.entries[2].logical.as_mut() {
            c.shared[0].index = a_index;
        }

        let mut target = populated();
        let before = target.log_state();
        let err = target.restore_state(&state).unwrap_err();
        assert!(matches!(err, PipeError::Unexpected { .. }), "{err}");
        assert_eq!(target.log_state(), before);
    }

    #[test]
    fn test_ref_count_mismatch_is_unexpected() {
        let mut state = populated().log_state();
        if let Some(a) = state.entries[0].logical.as_mut() {
            a.ref_count += 1;
        }
        let mut target = instance();
        assert!(matches!(target.restore_state(&state), Err(PipeError::Unexpected { .. })));
        assert_eq!(target.entry_count(), 0);
    }

    #[test]
    fn test_counter_mismatch_is_unexpected() {
        let mut state = populated().log_state();
        state.stages[0].occupancy.programmed += 1;
        let mut target = instance();
        assert!(matches!(target.restore_state(&state), Err(PipeError::Unexpected { .. })));
    }

    #[test]
    fn test_wrong_instance_or_open_txn() {
        let state = populated().log_state();
        let mut other_pipe = TableInstance::new(&profile(), PipeId::new(0).ok(), InstanceConfig::default());
        assert!(matches!(
            other_pipe.restore_state(&state),
            Err(PipeError::InvalidArgument { .. })
        ));

        let mut target = instance();
        target.begin_txn().unwrap();
        assert!(matches!(target.restore_state(&state), Err(PipeError::InvalidArgument { .. })));
    }
}
