//! Per-device registry of table instances.

use super::hw::Hardware;
use super::instance::{InstanceConfig, TableInstance};
use super::session::TableSession;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::config::{DeviceProfile, TableProfile};
use crate::reloc::LockIdPool;
use crate::state::DeviceState;
use log::{debug, info, warn};
use pipemgr_hw::{PipeError, PipeResult};
use pipemgr_types::{DevId, LockId, PipeBitmap, PipeId, TableHandle};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub tables_added: u64,
    pub sessions: u64,
    pub txns_committed: u64,
    pub txns_aborted: u64,
    pub state_restores: u64,
}

#[derive(Debug)]
struct Table {
    profile: TableProfile,
    /// One instance for symmetric tables, one per pipe otherwise.
    instances: Vec<TableInstance>,
}

/// Every table of one device, the hardware they share, and the
/// device-wide transaction.
pub struct TableRegistry {
    dev_id: DevId,
    config: InstanceConfig,
    hw: Hardware,
    tables: BTreeMap<TableHandle, Table>,
    locks: LockIdPool,
    txn_active: bool,
    stats: RegistryStats,
}

impl fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRegistry")
            .field("dev_id", &self.dev_id)
            .field("tables", &self.tables.len())
            .field("txn_active", &self.txn_active)
            .field("hw", &self.hw)
            .finish()
    }
}

impl TableRegistry {
    pub fn new(profile: &DeviceProfile, hw: Hardware) -> PipeResult<Self> {
        profile.validate()?;
        let mut registry = Self {
            dev_id: profile.dev_id,
            config: InstanceConfig {
                dev_id: profile.dev_id,
                num_pipes: profile.num_pipes,
                drain_noops: profile.drain_noops,
                instr_buffer_bytes: profile.instr_buffer_bytes,
            },
            hw,
            tables: BTreeMap::new(),
            locks: LockIdPool::new(),
            txn_active: false,
            stats: RegistryStats::default(),
        };
        for table in &profile.tables {
            registry.add_table(table.clone())?;
        }
        info!(
            "Device {}: entry manager ready with {} table(s) on {} pipe(s)",
            registry.dev_id.get(),
            registry.tables.len(),
            registry.config.num_pipes
        );
        Ok(registry)
    }

    pub fn dev_id(&self) -> DevId {
        self.dev_id
    }

    pub fn num_pipes(&self) -> u8 {
        self.config.num_pipes
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    pub fn hardware(&self) -> &Hardware {
        &self.hw
    }

    pub fn in_txn(&self) -> bool {
        self.txn_active
    }

    pub fn table_handles(&self) -> impl Iterator<Item = TableHandle> + '_ {
        self.tables.keys().copied()
    }

    /// Registers a table. Its instances join a transaction in progress.
    pub fn add_table(&mut self, profile: TableProfile) -> PipeResult<()> {
        profile.validate()?;
        let handle = profile.handle;
        if self.tables.contains_key(&handle) {
            return Err(PipeError::already_exists(format!("table {}", handle)));
        }
        let mut instances = if profile.symmetric {
            vec![TableInstance::new(&profile, None, self.config)]
        } else {
            (0..self.config.num_pipes)
                .map(|p| -> PipeResult<TableInstance> {
                    let pipe = PipeId::new(p).map_err(|e| PipeError::invalid_argument(e.to_string()))?;
                    Ok(TableInstance::new(&profile, Some(pipe), self.config))
                })
                .collect::<PipeResult<Vec<_>>>()?
        };
        if self.txn_active {
            for instance in &mut instances {
                instance.begin_txn()?;
            }
        }

        info!(
            "Device {}: added table {} ({}, {}, {} instance(s))",
            self.dev_id.get(),
            handle,
            profile.name,
            profile.kind,
            instances.len()
        );
        crate::audit_log!(AuditRecord::new(AuditCategory::ConfigurationChange, "TableRegistry", "add_table")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(handle.to_string())
            .with_object_type("table")
            .with_details(serde_json::json!({
                "name": profile.name,
                "symmetric": profile.symmetric,
                "stages": profile.stages.len(),
            })));
        self.tables.insert(handle, Table { profile, instances });
        self.stats.tables_added += 1;
        Ok(())
    }

    pub fn table_profile(&self, table: TableHandle) -> PipeResult<&TableProfile> {
        self.tables
            .get(&table)
            .map(|t| &t.profile)
            .ok_or_else(|| PipeError::not_found(format!("table {}", table)))
    }

    /// Position of the instance serving `pipe`.
    ///
    /// Symmetric tables take no pipe; per-pipe tables need one on the device.
    fn instance_index(&self, table: TableHandle, pipe: Option<PipeId>) -> PipeResult<usize> {
        let profile = self.table_profile(table)?;
        match (profile.symmetric, pipe) {
            (true, None) => Ok(0),
            (true, Some(p)) => Err(PipeError::invalid_argument(format!(
                "table {} is symmetric, {} given",
                table, p
            ))),
            (false, None) => Err(PipeError::invalid_argument(format!(
                "table {} is per-pipe, no pipe given",
                table
            ))),
            (false, Some(p)) if p.as_u8() >= self.config.num_pipes => {
                Err(PipeError::invalid_argument(format!(
                    "{} out of range for device {} with {} pipe(s)",
                    p,
                    self.dev_id.get(),
                    self.config.num_pipes
                )))
            }
            (false, Some(p)) => Ok(usize::from(p.as_u8())),
        }
    }

    pub fn instance(&self, table: TableHandle, pipe: Option<PipeId>) -> PipeResult<&TableInstance> {
        let index = self.instance_index(table, pipe)?;
        self.tables
            .get(&table)
            .and_then(|t| t.instances.get(index))
            .ok_or_else(|| PipeError::not_found(format!("instance {} of table {}", index, table)))
    }

    pub fn session(&mut self, table: TableHandle, pipe: Option<PipeId>) -> PipeResult<TableSession<'_>> {
        let index = self.instance_index(table, pipe)?;
        let Self {
            tables, hw, locks, stats, ..
        } = self;
        let instance = tables
            .get_mut(&table)
            .and_then(|t| t.instances.get_mut(index))
            .ok_or_else(|| PipeError::not_found(format!("instance {} of table {}", index, table)))?;
        stats.sessions += 1;
        Ok(TableSession {
            instance,
            hw,
            locks,
        })
    }

    fn instances(&self) -> impl Iterator<Item = &TableInstance> {
        self.tables.values().flat_map(|t| t.instances.iter())
    }

    fn instances_mut(&mut self) -> impl Iterator<Item = &mut TableInstance> {
        self.tables.values_mut().flat_map(|t| t.instances.iter_mut())
    }

    // ---- transactions ----

    /// Opens a device-wide transaction. Nothing posted until commit reaches
    /// the device.
    pub fn begin_txn(&mut self) -> PipeResult<()> {
        if self.txn_active {
            return Err(PipeError::already_exists(format!(
                "transaction on device {}",
                self.dev_id.get()
            )));
        }
        for instance in self.instances_mut() {
            instance.begin_txn()?;
        }
        self.txn_active = true;
        info!("Device {}: transaction started", self.dev_id.get());
        Ok(())
    }

    /// Checks `pipes` and that no per-pipe instance outside it holds
    /// uncommitted changes.
    fn check_txn_scope(&self, pipes: PipeBitmap, action: &str) -> PipeResult<()> {
        if !self.txn_active {
            return Err(PipeError::invalid_argument(format!(
                "{} without a transaction on device {}",
                action,
                self.dev_id.get()
            )));
        }
        let device = PipeBitmap::all(self.config.num_pipes);
        if pipes.bits() & !device.bits() != 0 {
            return Err(PipeError::invalid_argument(format!(
                "{} for pipes {} on a device with {} pipe(s)",
                action, pipes, self.config.num_pipes
            )));
        }
        let stranded: Vec<String> = self
            .instances()
            .filter(|i| i.pipe().is_some_and(|p| !pipes.contains(p)) && i.has_dirty_state())
            .map(|i| format!("table {} {}", i.table(), i.scope()))
            .collect();
        if !stranded.is_empty() {
            warn!(
                "Device {}: {} refused, unselected instances have changes: {}",
                self.dev_id.get(),
                action,
                stranded.join(", ")
            );
            return Err(PipeError::invalid_argument(format!(
                "{} for pipes {} would strand changes on {}",
                action,
                pipes,
                stranded.join(", ")
            )));
        }
        Ok(())
    }

    /// Commits the transaction for `pipes` and flushes the instructions it
    /// posted. Symmetric tables are always included.
    pub fn commit_txn(&mut self, pipes: PipeBitmap) -> PipeResult<()> {
        self.check_txn_scope(pipes, "commit")?;
        let mut dirty = 0usize;
        for instance in self.instances_mut() {
            if instance.has_dirty_state() {
                dirty += 1;
            }
            instance.end_commit()?;
        }
        self.txn_active = false;
        let flushed = self.hw.flush();
        let record = AuditRecord::new(AuditCategory::Transaction, "TableRegistry", "commit_txn")
            .with_object_id(self.dev_id.get().to_string())
            .with_object_type("device")
            .with_details(serde_json::json!({ "pipes": pipes.to_string(), "dirty_instances": dirty }));
        match &flushed {
            Ok(()) => {
                self.stats.txns_committed += 1;
                info!(
                    "Device {}: transaction committed for pipes {} ({} instance(s) changed)",
                    self.dev_id.get(),
                    pipes,
                    dirty
                );
                crate::audit_log!(record.with_outcome(AuditOutcome::Success));
            }
            Err(e) => {
                crate::audit_log!(record.with_error(e.to_string()));
            }
        }
        flushed
    }

    /// Rolls every instance back to the state at `begin_txn` and discards
    /// the buffered instructions.
    pub fn abort_txn(&mut self, pipes: PipeBitmap) -> PipeResult<()> {
        self.check_txn_scope(pipes, "abort")?;
        for instance in self.instances_mut() {
            instance.end_abort()?;
        }
        self.hw.discard();
        self.txn_active = false;
        self.stats.txns_aborted += 1;
        info!(
            "Device {}: transaction aborted for pipes {}",
            self.dev_id.get(),
            pipes
        );
        crate::audit_log!(AuditRecord::new(AuditCategory::Transaction, "TableRegistry", "abort_txn")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(self.dev_id.get().to_string())
            .with_object_type("device")
            .with_details(serde_json::json!({ "pipes": pipes.to_string() })));
        Ok(())
    }

    // ---- stage lock ids ----

    pub fn lock_id(&self, table: TableHandle) -> Option<LockId> {
        self.locks.get(table)
    }

    /// Returns the table's lock id to the pool.
    pub fn release_lock_id(&mut self, table: TableHandle) -> PipeResult<LockId> {
        let id = self.locks.release(table)?;
        debug!("Device {}: released {} of table {}", self.dev_id.get(), id, table);
        Ok(id)
    }

    // ---- persisted state ----

    /// Walks every instance, tables ascending and pipes ascending.
    pub fn log_state(&self) -> DeviceState {
        DeviceState {
            dev_id: self.dev_id,
            instances: self.instances().map(|i| i.log_state()).collect(),
        }
    }

    /// Restores every instance from `state`, all or nothing. Instances the
    /// state does not mention come back empty.
    pub fn restore_state(&mut self, state: &DeviceState) -> PipeResult<()> {
        if state.dev_id != self.dev_id {
            return Err(PipeError::invalid_argument(format!(
                "state of device {} cannot restore device {}",
                state.dev_id.get(),
                self.dev_id.get()
            )));
        }
        if self.txn_active {
            return Err(PipeError::invalid_argument(format!(
                "device {} has a transaction in progress",
                self.dev_id.get()
            )));
        }

        let mut seen = BTreeSet::new();
        for saved in &state.instances {
            if !seen.insert((saved.table, saved.pipe)) {
                return Err(PipeError::invalid_argument(format!(
                    "table {} {:?} appears twice in the device state",
                    saved.table, saved.pipe
                )));
            }
            self.instance(saved.table, saved.pipe)?;
        }

        let mut replayed: Vec<TableInstance> = Vec::new();
        for instance in self.instances() {
            let saved = state
                .instances
                .iter()
                .find(|s| s.table == instance.table() && s.pipe == instance.pipe());
            let fresh = match saved {
                Some(saved) => instance.replay_state(saved),
                None => Ok(instance.fresh()),
            };
            match fresh {
                Ok(fresh) => replayed.push(fresh),
                Err(e) => {
                    crate::audit_log!(AuditRecord::new(AuditCategory::StateRestore, "TableRegistry", "restore_state")
                        .with_object_id(instance.table().to_string())
                        .with_object_type("table")
                        .with_error(e.to_string()));
                    return Err(e);
                }
            }
        }

        for (live, fresh) in self.instances_mut().zip(replayed) {
            *live = fresh;
        }
        self.stats.state_restores += 1;
        info!(
            "Device {}: restored {} entr(y/ies) across {} instance(s)",
            self.dev_id.get(),
            state.entry_count(),
            state.instances.len()
        );
        crate::audit_log!(AuditRecord::new(AuditCategory::StateRestore, "TableRegistry", "restore_state")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(self.dev_id.get().to_string())
            .with_object_type("device")
            .with_details(serde_json::json!({
                "instances": state.instances.len(),
                "entries": state.entry_count(),
            })));
        Ok(())
    }
}
