//! Relocation chains over a table instance.

use super::hw::Hardware;
use super::instance::TableInstance;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::entry::StageLocation;
use crate::fault::consistency_fault;
use crate::reloc::{
    ChainBudget, MoveMethod, MovePlan, MoveSpec, MovedResource, RelocateRequest,
    RelocationSummary,
};
use log::{debug, info, warn};
use pipemgr_hw::{EncodeTarget, Instruction, PipeError, PipeResult};
use pipemgr_types::{LockId, StageId, StageIndex};
use std::collections::BTreeSet;

/// A relocation whose destination is claimed and whose plan is built.
struct PreparedMove {
    src: StageLocation,
    dst: StageIndex,
    method: MoveMethod,
    plan: MovePlan,
}

impl TableInstance {
    /// True if `requests` must be bracketed by stage locks: some move
    /// crosses stages and a directly-addressed resource table shares them.
    pub fn needs_stage_lock(&self, requests: &[RelocateRequest]) -> bool {
        self.direct_resources && requests.iter().any(|r| r.is_cross_stage())
    }

    /// Relocates entries as one chain, split into several when the
    /// instruction buffer would overflow.
    ///
    /// `lock` is the table's stage lock id; required when
    /// [`needs_stage_lock`](Self::needs_stage_lock) holds.
    pub fn relocate(
        &mut self,
        hw: &mut Hardware,
        requests: &[RelocateRequest],
        lock: Option<LockId>,
    ) -> PipeResult<RelocationSummary> {
        for req in requests {
            self.check_handle(req.handle)?;
        }
        let lock = if self.needs_stage_lock(requests) {
            Some(lock.ok_or_else(|| {
                PipeError::invalid_argument(format!(
                    "moving entries of table {} across stages needs a stage lock id",
                    self.table
                ))
            })?)
        } else {
            None
        };
        let locked: BTreeSet<StageId> = match lock {
            Some(_) => requests
                .iter()
                .filter(|r| r.is_cross_stage())
                .flat_map(|r| [r.from_stage, r.to_stage])
                .collect(),
            None => BTreeSet::new(),
        };
        let bracket = lock.map_or(0, |lock_id| {
            let pair = Instruction::StageLock { lock_id }.encoded_len()
                + Instruction::StageUnlock { lock_id }.encoded_len();
            pair * locked.len()
        });
        let capacity = self.config.instr_buffer_bytes.min(hw.capacity());
        let deferred_flush = self.in_txn();

        let result = self.transact_hw(hw, |inst, hw| {
            let mut summary = RelocationSummary {
                chains: 1,
                ..Default::default()
            };
            let mut budget = ChainBudget::new(capacity, bracket);
            inst.post_locks(hw, &locked, lock, true)?;

            for req in requests {
                let prepared = inst.prepare_move(hw, req)?;
                let cost = prepared.plan.encoded_len();
                if !budget.fits(cost) && !budget.is_fresh() {
                    inst.post_locks(hw, &locked, lock, false)?;
                    if !deferred_flush {
                        hw.flush()?;
                    }
                    budget.restart();
                    summary.chains += 1;
                    info!(
                        "Table {}: relocation chain {} started after {} move(s)",
                        inst.table, summary.chains, summary.relocated
                    );
                    inst.post_locks(hw, &locked, lock, true)?;
                }
                if !budget.fits(cost) {
                    warn!(
                        "Table {}: moving entry {} needs {} bytes, chain budget is {}",
                        inst.table,
                        req.handle,
                        cost,
                        budget.capacity()
                    );
                }
                budget.charge(cost);
                prepared.plan.execute(hw, &inst.target)?;
                inst.finish_move(req, prepared, &mut summary)?;
            }

            inst.post_locks(hw, &locked, lock, false)?;
            Ok(summary)
        });

        let record = AuditRecord::new(AuditCategory::Relocation, "TableInstance", "relocate")
            .with_object_id(self.table.to_string())
            .with_object_type("table");
        match &result {
            Ok(summary) => {
                self.stats.chains += summary.chains as u64;
                info!(
                    "Table {} {}: relocated {} entr(y/ies) in {} chain(s)",
                    self.table,
                    self.scope(),
                    summary.relocated,
                    summary.chains
                );
                crate::audit_log!(record
                    .with_outcome(AuditOutcome::Success)
                    .with_details(serde_json::json!({
                        "relocated": summary.relocated,
                        "copies": summary.copies,
                        "rewrites": summary.rewrites,
                        "chains": summary.chains,
                        "moved_resources": summary.moved.len(),
                    })));
            }
            Err(e) => {
                crate::audit_log!(record.with_error(e.to_string()));
            }
        }
        result
    }

    fn post_locks(
        &self,
        hw: &mut Hardware,
        stages: &BTreeSet<StageId>,
        lock: Option<LockId>,
        locking: bool,
    ) -> PipeResult<()> {
        let Some(lock_id) = lock else {
            return Ok(());
        };
        for stage in stages {
            let instr = if locking {
                Instruction::StageLock { lock_id }
            } else {
                Instruction::StageUnlock { lock_id }
            };
            hw.post(&self.target.with_stage(*stage), &instr)?;
        }
        Ok(())
    }

    /// Validates a request, claims its destination and plans the moves.
    fn prepare_move(&mut self, hw: &Hardware, req: &RelocateRequest) -> PipeResult<PreparedMove> {
        let handle = req.handle;
        let entry = self.store.logical(handle)?;
        let src = entry.shared_at(req.from_stage).copied().ok_or_else(|| {
            PipeError::not_found(format!("location of entry {} in {}", handle, req.from_stage))
        })?;
        if req.is_cross_stage() && entry.shared_at(req.to_stage).is_some() {
            return Err(PipeError::already_exists(format!(
                "entry {} in {}",
                handle, req.to_stage
            )));
        }
        let logical_data = entry.data.clone();

        let phys = self.store.physical(handle)?;
        match phys.shared_at(req.from_stage) {
            Some(loc) if loc.index == src.index => {}
            Some(loc) => {
                return Err(consistency_fault(format!(
                    "entry {} placed at {} in {} but programmed at {}",
                    handle, src.index, req.from_stage, loc.index
                )));
            }
            None => {
                return Err(PipeError::not_found(format!(
                    "programmed location of entry {} in {}",
                    handle, req.from_stage
                )));
            }
        }
        let payload_current = phys.data == logical_data;

        let from = self.stage_info(req.from_stage)?.layout.clone();
        let to = self.stage_info(req.to_stage)?.layout.clone();
        let method = if !req.is_cross_stage()
            && from.mem_type == to.mem_type
            && from.entries_per_word == 1
            && payload_current
        {
            MoveMethod::Copy
        } else {
            MoveMethod::Rewrite
        };

        self.mark_dirty(handle);
        self.mark_stage_dirty(req.from_stage);
        self.mark_stage_dirty(req.to_stage);
        let info = self.stage_mut(req.to_stage)?;
        let dst = match req.to_index {
            Some(index) => {
                info.reserve_entry(index)?;
                index
            }
            None => info.alloc_entry().inspect_err(|e| {
                warn!("Cannot relocate entry {} into {}: {}", handle, req.to_stage, e);
            })?,
        };

        let pipe = self.addr_pipe();
        let src_addr = from.addr(pipe, src.index)?;
        let dst_addr = to.addr(pipe, dst)?;
        let words = match method {
            MoveMethod::Copy => None,
            MoveMethod::Rewrite => Some(hw.encode(
                &EncodeTarget {
                    table: self.table,
                    index: dst,
                    addr: dst_addr,
                },
                &logical_data,
            )?),
        };
        let plan = MovePlan::build(&MoveSpec {
            src: src_addr,
            dst: dst_addr,
            mem_type: from.mem_type,
            method,
            words,
            drain_noops: self.config.drain_noops,
        })?;
        debug!(
            "Table {}: entry {} {} {} -> {} {} ({:?})",
            self.table, handle, req.from_stage, src.index, req.to_stage, dst, method
        );
        Ok(PreparedMove {
            src,
            dst,
            method,
            plan,
        })
    }

    /// Moves the records to the destination once the plan is posted, then
    /// releases the source index.
    fn finish_move(
        &mut self,
        req: &RelocateRequest,
        prepared: PreparedMove,
        summary: &mut RelocationSummary,
    ) -> PipeResult<()> {
        let handle = req.handle;
        let PreparedMove { src, dst, method, .. } = prepared;
        let moved = StageLocation {
            stage: req.to_stage,
            index: dst,
            ref_count: src.ref_count,
        };

        let entry = self.store.logical_mut(handle)?;
        entry.remove_shared_at(req.from_stage);
        entry.insert_shared(moved);
        let data = entry.data.clone();
        let phys = self.store.physical_mut(handle)?;
        phys.remove_shared_at(req.from_stage);
        phys.insert_shared(moved);
        phys.data = data.clone();

        let to = &mut self.stage_mut(req.to_stage)?.occupancy;
        to.occupied += 1;
        to.programmed += 1;
        let from = self.stage_mut(req.from_stage)?;
        from.release_entry(src.index).map_err(|e| {
            consistency_fault(format!("releasing {} in {}: {}", src.index, req.from_stage, e))
        })?;
        let occ = &mut from.occupancy;
        match (occ.occupied.checked_sub(1), occ.programmed.checked_sub(1)) {
            (Some(occupied), Some(programmed)) => {
                occ.occupied = occupied;
                occ.programmed = programmed;
            }
            _ => {
                return Err(consistency_fault(format!(
                    "occupancy underflow in {}",
                    req.from_stage
                )))
            }
        }

        for resource in data.direct_resources() {
            summary.moved.push(MovedResource {
                kind: resource.kind,
                handle,
                from: (req.from_stage, src.index),
                to: (req.to_stage, dst),
            });
        }
        match method {
            MoveMethod::Copy => summary.copies += 1,
            MoveMethod::Rewrite => summary.rewrites += 1,
        }
        summary.relocated += 1;
        self.stats.relocations += 1;
        Ok(())
    }
}
