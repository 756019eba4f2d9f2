//! Table instance: records, stages and transactions of one pipe scope.

use super::hw::Hardware;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::config::{TableKind, TableProfile};
use crate::entry::{EntryStore, LogicalEntry, PhysicalEntry};
use crate::fault::report_fault;
use crate::handle::HandleRegistry;
use crate::move_list::{MoveList, MoveNode};
use crate::stage::{Occupancy, StageInfo};
use crate::txn::TxnLog;
use log::{debug, info, warn};
use pipemgr_hw::{EntryData, InstrTarget, PipeError, PipeResult};
use pipemgr_types::{DevId, EntryHandle, MemberId, PipeBitmap, PipeId, StageId, TableHandle};
use std::collections::BTreeMap;

/// Device-level settings every instance needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceConfig {
    pub dev_id: DevId,
    pub num_pipes: u8,
    pub drain_noops: u32,
    pub instr_buffer_bytes: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            dev_id: DevId::new(0),
            num_pipes: 4,
            drain_noops: 4,
            instr_buffer_bytes: 16 * 1024,
        }
    }
}

/// Instance statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceStats {
    pub entries_added: u64,
    pub entries_modified: u64,
    pub entries_deleted: u64,
    pub placements: u64,
    pub removals: u64,
    pub relocations: u64,
    pub chains: u64,
    pub txns_committed: u64,
    pub txns_aborted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TxnMode {
    None,
    /// Scoped to a single call; rolled back by the call itself on failure.
    Implicit,
    /// Opened by the caller; ends only with commit or abort.
    Explicit,
}

/// One table's state for one pipe scope.
///
/// Symmetric tables have a single instance (`pipe() == None`) whose
/// instructions target every pipe; asymmetric tables have one instance per
/// pipe with handles pinned to it.
#[derive(Debug)]
pub struct TableInstance {
    pub(super) table: TableHandle,
    pub(super) name: String,
    pub(super) kind: TableKind,
    pub(super) direct_resources: bool,
    pub(super) pipe: Option<PipeId>,
    pub(super) target: InstrTarget,
    pub(super) config: InstanceConfig,
    pub(super) max_entries: u32,
    pub(super) handles: HandleRegistry,
    pub(super) store: EntryStore,
    pub(super) stages: BTreeMap<StageId, StageInfo>,
    pub(super) txn_mode: TxnMode,
    pub(super) txn: Option<TxnLog>,
    pub(super) stats: InstanceStats,
}

impl TableInstance {
    pub fn new(profile: &TableProfile, pipe: Option<PipeId>, config: InstanceConfig) -> Self {
        let pipes = match pipe {
            Some(p) => PipeBitmap::single(p),
            None => PipeBitmap::all(config.num_pipes),
        };
        let first_stage = profile
            .stages
            .first()
            .map(|s| s.stage)
            .unwrap_or_default();
        let stages = profile
            .stages
            .iter()
            .map(|s| (s.stage, StageInfo::new(s)))
            .collect();
        Self {
            table: profile.handle,
            name: profile.name.clone(),
            kind: profile.kind,
            direct_resources: profile.direct_resources,
            pipe,
            target: InstrTarget::new(config.dev_id, pipes, first_stage),
            config,
            max_entries: profile.max_entries,
            handles: HandleRegistry::new(pipe, profile.max_entries),
            store: EntryStore::new(),
            stages,
            txn_mode: TxnMode::None,
            txn: None,
            stats: InstanceStats::default(),
        }
    }

    /// An empty instance with the same table, scope and layout.
    pub(super) fn fresh(&self) -> Self {
        Self {
            table: self.table,
            name: self.name.clone(),
            kind: self.kind,
            direct_resources: self.direct_resources,
            pipe: self.pipe,
            target: self.target,
            config: self.config,
            max_entries: self.max_entries,
            handles: HandleRegistry::new(self.pipe, self.max_entries),
            store: EntryStore::new(),
            stages: self
                .stages
                .iter()
                .map(|(id, info)| (*id, StageInfo::from_layout(info.layout.clone())))
                .collect(),
            txn_mode: TxnMode::None,
            txn: None,
            stats: self.stats.clone(),
        }
    }

    // ---- accessors ----

    pub fn table(&self) -> TableHandle {
        self.table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn pipe(&self) -> Option<PipeId> {
        self.pipe
    }

    /// Pipes this instance's instructions target.
    pub fn pipes(&self) -> PipeBitmap {
        self.target.pipes
    }

    pub fn stats(&self) -> &InstanceStats {
        &self.stats
    }

    pub fn handles(&self) -> &HandleRegistry {
        &self.handles
    }

    pub fn entry_count(&self) -> usize {
        self.store.len()
    }

    pub fn entry(&self, handle: EntryHandle) -> PipeResult<&LogicalEntry> {
        self.store.logical(handle)
    }

    pub fn physical_entry(&self, handle: EntryHandle) -> PipeResult<&PhysicalEntry> {
        self.store.physical(handle)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogicalEntry> {
        self.store.logical_entries()
    }

    pub fn member_owner(&self, member: MemberId) -> Option<EntryHandle> {
        self.store.member_owner(member)
    }

    pub fn stage_ids(&self) -> impl Iterator<Item = StageId> + '_ {
        self.stages.keys().copied()
    }

    pub fn stage_info(&self, stage: StageId) -> PipeResult<&StageInfo> {
        self.stages
            .get(&stage)
            .ok_or_else(|| PipeError::not_found(format!("{} of table {}", stage, self.table)))
    }

    pub fn stage_occupancy(&self, stage: StageId) -> PipeResult<Occupancy> {
        Ok(self.stage_info(stage)?.occupancy)
    }

    pub(super) fn stage_mut(&mut self, stage: StageId) -> PipeResult<&mut StageInfo> {
        let table = self.table;
        self.stages
            .get_mut(&stage)
            .ok_or_else(|| PipeError::not_found(format!("{} of table {}", stage, table)))
    }

    /// Pipe field of physical addresses.
    pub(super) fn addr_pipe(&self) -> u8 {
        self.pipe.map(|p| p.as_u8()).unwrap_or(0)
    }

    pub(super) fn check_handle(&self, handle: EntryHandle) -> PipeResult<()> {
        if handle.pipe() != self.pipe {
            return Err(PipeError::invalid_argument(format!(
                "entry handle {} does not belong to table {} {}",
                handle,
                self.table,
                self.scope()
            )));
        }
        Ok(())
    }

    pub(super) fn scope(&self) -> String {
        match self.pipe {
            Some(p) => p.to_string(),
            None => "all pipes".to_string(),
        }
    }

    // ---- transaction log ----

    pub fn in_txn(&self) -> bool {
        self.txn_mode == TxnMode::Explicit
    }

    /// True if an open transaction has backed anything up.
    pub fn has_dirty_state(&self) -> bool {
        self.txn.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub(super) fn mark_dirty(&mut self, handle: EntryHandle) {
        if self.txn_mode == TxnMode::None {
            return;
        }
        let txn = self.txn.get_or_insert_with(TxnLog::new);
        txn.mark_dirty(
            handle,
            self.store.get_logical(handle),
            self.store.get_physical(handle),
        );
    }

    pub(super) fn mark_stage_dirty(&mut self, stage: StageId) {
        if self.txn_mode == TxnMode::None {
            return;
        }
        if let Some(info) = self.stages.get(&stage) {
            self.txn
                .get_or_insert_with(TxnLog::new)
                .mark_allocator_dirty(info);
        }
    }

    pub(super) fn mark_handles_dirty(&mut self) {
        if self.txn_mode == TxnMode::None {
            return;
        }
        self.txn
            .get_or_insert_with(TxnLog::new)
            .mark_handles_dirty(&self.handles);
    }

    /// Restores every backup and drops the log.
    ///
    /// Entries go first; allocators and the handle registry are swapped in
    /// afterwards, so dropping a live location never touches an allocator.
    pub(super) fn rollback(&mut self) {
        let Some(txn) = self.txn.take() else {
            return;
        };
        let parts = txn.into_parts();
        let restored = parts.entries.len();
        for (handle, backup) in parts.entries {
            self.store.restore(handle, backup.logical, backup.physical);
        }
        for (stage, backup) in parts.stages {
            match self.stages.get_mut(&stage) {
                Some(info) => {
                    info.allocator.restore(backup.allocator);
                    info.occupancy = backup.occupancy;
                }
                None => {
                    report_fault(&format!("backup for unknown {} of table {}", stage, self.table));
                }
            }
        }
        if let Some(handles) = parts.handles {
            self.handles.restore(handles);
        }
        debug!(
            "Table {} {}: rolled back {} entr(y/ies)",
            self.table,
            self.scope(),
            restored
        );
    }

    /// Runs a software-only operation atomically.
    ///
    /// Outside a caller transaction the operation gets its own log and is
    /// rolled back on failure. Inside one, backups accumulate in the
    /// caller's log.
    pub(super) fn transact<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> PipeResult<T>,
    ) -> PipeResult<T> {
        if self.txn_mode == TxnMode::Explicit {
            return op(self);
        }
        self.txn_mode = TxnMode::Implicit;
        let result = op(self);
        self.txn_mode = TxnMode::None;
        match result {
            Ok(value) => {
                self.txn = None;
                Ok(value)
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Like [`transact`](Self::transact) for operations that post
    /// instructions. Outside a caller transaction the transport is flushed
    /// on success and discarded on failure.
    pub(super) fn transact_hw<T>(
        &mut self,
        hw: &mut Hardware,
        op: impl FnOnce(&mut Self, &mut Hardware) -> PipeResult<T>,
    ) -> PipeResult<T> {
        if self.txn_mode == TxnMode::Explicit {
            return op(self, hw);
        }
        self.txn_mode = TxnMode::Implicit;
        let result = op(self, hw).and_then(|value| hw.flush().map(|()| value));
        self.txn_mode = TxnMode::None;
        match result {
            Ok(value) => {
                self.txn = None;
                Ok(value)
            }
            Err(e) => {
                self.rollback();
                hw.discard();
                Err(e)
            }
        }
    }

    pub fn begin_txn(&mut self) -> PipeResult<()> {
        if self.txn_mode != TxnMode::None {
            return Err(PipeError::already_exists(format!(
                "transaction on table {} {}",
                self.table,
                self.scope()
            )));
        }
        self.txn_mode = TxnMode::Explicit;
        self.txn = None;
        debug!("Table {} {}: transaction started", self.table, self.scope());
        Ok(())
    }

    /// Discards all backups and ends the transaction.
    pub(super) fn end_commit(&mut self) -> PipeResult<()> {
        if self.txn_mode != TxnMode::Explicit {
            return Err(PipeError::invalid_argument(format!(
                "no transaction in progress on table {} {}",
                self.table,
                self.scope()
            )));
        }
        let dirty = self.txn.as_ref().map_or(0, |t| t.dirty_entries());
        self.txn = None;
        self.txn_mode = TxnMode::None;
        self.stats.txns_committed += 1;
        debug!(
            "Table {} {}: committed {} dirty entr(y/ies)",
            self.table,
            self.scope(),
            dirty
        );
        Ok(())
    }

    /// Restores all backups and ends the transaction.
    pub(super) fn end_abort(&mut self) -> PipeResult<()> {
        if self.txn_mode != TxnMode::Explicit {
            return Err(PipeError::invalid_argument(format!(
                "no transaction in progress on table {} {}",
                self.table,
                self.scope()
            )));
        }
        self.rollback();
        self.txn_mode = TxnMode::None;
        self.stats.txns_aborted += 1;
        Ok(())
    }

    /// Commits the open transaction and flushes the instructions it posted.
    pub fn commit_txn(&mut self, hw: &mut Hardware) -> PipeResult<()> {
        self.end_commit()?;
        info!("Table {} {}: transaction committed", self.table, self.scope());
        crate::audit_log!(AuditRecord::new(AuditCategory::Transaction, "TableInstance", "commit_txn")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(self.table.to_string())
            .with_object_type("table"));
        hw.flush()
    }

    /// Aborts the open transaction and discards the instructions it posted.
    pub fn abort_txn(&mut self, hw: &mut Hardware) -> PipeResult<()> {
        self.end_abort()?;
        hw.discard();
        info!("Table {} {}: transaction aborted", self.table, self.scope());
        crate::audit_log!(AuditRecord::new(AuditCategory::Transaction, "TableInstance", "abort_txn")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(self.table.to_string())
            .with_object_type("table"));
        Ok(())
    }

    // ---- HLP entry operations ----

    /// Creates a logical entry and returns its handle with the move-list
    /// describing the change.
    pub fn add(&mut self, member: MemberId, data: EntryData) -> PipeResult<(EntryHandle, MoveList)> {
        let result = self.transact(|inst| {
            if let Some(owner) = inst.store.member_owner(member) {
                warn!(
                    "Table {}: {} already held by entry {}",
                    inst.table, member, owner
                );
                return Err(PipeError::already_exists(format!(
                    "{} (held by entry {})",
                    member, owner
                )));
            }
            inst.mark_handles_dirty();
            let handle = inst.handles.allocate().inspect_err(|e| {
                warn!("Table {} {}: cannot add {}: {}", inst.table, inst.scope(), member, e);
            })?;
            inst.handles.mark_pending(handle);
            inst.mark_dirty(handle);
            inst.store
                .insert_logical(LogicalEntry::new(handle, inst.pipe, member, data.clone()))?;
            inst.stats.entries_added += 1;
            debug!("Table {}: added entry {} for {}", inst.table, handle, member);
            Ok((handle, MoveList::from(MoveNode::add(handle, inst.pipe, member, data))))
        });

        let record = AuditRecord::new(AuditCategory::EntryCreate, "TableInstance", "add_entry")
            .with_object_type("entry");
        match &result {
            Ok((handle, _)) => {
                crate::audit_log!(record
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(handle.to_string())
                    .with_details(serde_json::json!({
                        "table": self.table.get(),
                        "member": member.get(),
                    })));
            }
            Err(e) => {
                crate::audit_log!(record
                    .with_object_id(member.to_string())
                    .with_error(e.to_string()));
            }
        }
        result
    }

    /// Replaces an entry's payload.
    pub fn modify(&mut self, handle: EntryHandle, data: EntryData) -> PipeResult<MoveList> {
        self.check_handle(handle)?;
        self.transact(|inst| {
            let prior = inst.store.logical(handle)?.data.clone();
            inst.mark_dirty(handle);
            inst.store.logical_mut(handle)?.data = data.clone();
            inst.stats.entries_modified += 1;
            debug!("Table {}: modified entry {}", inst.table, handle);
            Ok(MoveList::from(MoveNode::modify(handle, inst.pipe, data, prior)))
        })
    }

    /// Removes a logical record after the reference guard.
    pub(super) fn remove_logical(&mut self, handle: EntryHandle) -> PipeResult<()> {
        let entry = self.store.logical(handle)?;
        if entry.is_referenced() {
            warn!(
                "Table {}: entry {} still has {} reference(s)",
                self.table, handle, entry.ref_count
            );
            return Err(PipeError::references_exist(
                format!("entry {}", handle),
                entry.ref_count,
            ));
        }
        let duplicates = self
            .store
            .get_physical(handle)
            .map_or(0, |p| p.non_shared.len());
        if duplicates > 0 {
            warn!(
                "Table {}: entry {} still has {} private duplicate(s)",
                self.table, handle, duplicates
            );
            return Err(PipeError::references_exist(
                format!("entry {}", handle),
                u32::try_from(duplicates).unwrap_or(u32::MAX),
            ));
        }

        self.mark_dirty(handle);
        self.store.remove_logical(handle);
        if self.store.get_physical(handle).is_none() && !self.handles.is_pending(handle) {
            self.mark_handles_dirty();
            self.handles.release(handle)?;
        }
        Ok(())
    }

    /// Deletes an entry.
    ///
    /// Refused with `ReferencesExist` while any shared reference or private
    /// duplicate remains; the check runs before anything is touched. The
    /// handle is released here unless the hardware shadow holds the entry or
    /// its Add has not been processed yet; then the move-list's delete
    /// releases it.
    pub fn delete(&mut self, handle: EntryHandle) -> PipeResult<MoveList> {
        self.check_handle(handle)?;
        let result = self.transact(|inst| {
            inst.remove_logical(handle)?;
            inst.stats.entries_deleted += 1;
            debug!("Table {}: deleted entry {}", inst.table, handle);
            Ok(MoveList::from(MoveNode::delete(handle, inst.pipe)))
        });

        crate::audit_log!(delete_record(handle, &result));
        result
    }
}

fn delete_record(handle: EntryHandle, result: &PipeResult<MoveList>) -> AuditRecord {
    let record = AuditRecord::new(AuditCategory::EntryDelete, "TableInstance", "delete_entry")
        .with_object_id(handle.to_string())
        .with_object_type("entry");
    match result {
        Ok(_) => record.with_outcome(AuditOutcome::Success),
        Err(e @ PipeError::ReferencesExist { .. }) => record.with_denial(e.to_string()),
        Err(e) => record.with_error(e.to_string()),
    }
}
