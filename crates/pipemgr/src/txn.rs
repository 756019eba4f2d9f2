//! Transaction log.
//!
//! Backups are taken on first touch. An entry backup holds the tagged
//! pre-image of both records; a stage backup holds a copy-on-write snapshot
//! of the allocator together with the occupancy counters; the handle
//! registry is backed up the same way. Commit drops the log. Abort hands
//! its parts back to the owning instance, which restores entries first and
//! swaps allocators in afterwards.

use crate::entry::{LogicalEntry, PhysicalEntry};
use crate::handle::HandleRegistry;
use crate::alloc::IndexAllocator;
use crate::stage::{Occupancy, StageInfo};
use pipemgr_common::Snapshot;
use pipemgr_types::{EntryHandle, StageId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryBackup {
    pub logical: Snapshot<LogicalEntry>,
    pub physical: Snapshot<PhysicalEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBackup {
    pub allocator: IndexAllocator,
    pub occupancy: Occupancy,
}

#[derive(Debug, Default)]
pub struct TxnLog {
    entries: BTreeMap<EntryHandle, EntryBackup>,
    stages: BTreeMap<StageId, StageBackup>,
    handles: Option<HandleRegistry>,
}

/// Backups handed back by [`TxnLog::into_parts`].
pub struct TxnParts {
    pub entries: BTreeMap<EntryHandle, EntryBackup>,
    pub stages: BTreeMap<StageId, StageBackup>,
    pub handles: Option<HandleRegistry>,
}

impl TxnLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the pre-image of `handle` unless it is already recorded.
    /// Returns true on the first call for the handle.
    pub fn mark_dirty(
        &mut self,
        handle: EntryHandle,
        logical: Option<&LogicalEntry>,
        physical: Option<&PhysicalEntry>,
    ) -> bool {
        if self.entries.contains_key(&handle) {
            return false;
        }
        self.entries.insert(
            handle,
            EntryBackup {
                logical: Snapshot::capture(logical),
                physical: Snapshot::capture(physical),
            },
        );
        true
    }

    /// Snapshots the stage's allocator and counters on first touch.
    pub fn mark_allocator_dirty(&mut self, info: &StageInfo) -> bool {
        if self.stages.contains_key(&info.stage()) {
            return false;
        }
        self.stages.insert(
            info.stage(),
            StageBackup {
                allocator: info.allocator.snapshot(),
                occupancy: info.occupancy,
            },
        );
        true
    }

    pub fn mark_handles_dirty(&mut self, registry: &HandleRegistry) -> bool {
        if self.handles.is_some() {
            return false;
        }
        self.handles = Some(registry.snapshot());
        true
    }

    pub fn dirty_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.stages.is_empty() && self.handles.is_none()
    }

    pub fn into_parts(self) -> TxnParts {
        TxnParts {
            entries: self.entries,
            stages: self.stages,
            handles: self.handles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageProfile;
    use pipemgr_hw::EntryData;
    use pipemgr_types::MemberId;

    fn hdl(id: u32) -> EntryHandle {
        EntryHandle::new(None, id).unwrap()
    }

    #[test]
    fn test_first_touch_wins() {
        let mut log = TxnLog::new();
        let mut entry = LogicalEntry::new(hdl(1), None, MemberId::new(1), EntryData::new(1, vec![1]));
        assert!(log.mark_dirty(hdl(1), Some(&entry), None));

        entry.data = EntryData::new(2, vec![2]);
        assert!(!log.mark_dirty(hdl(1), Some(&entry), None));

        let parts = log.into_parts();
        let backup = &parts.entries[&hdl(1)];
        assert_eq!(backup.logical.value().map(|e| e.data.action_fn), Some(1));
        assert!(!backup.physical.existed());
    }

    #[test]
    fn test_absent_entry_is_tombstone() {
        let mut log = TxnLog::new();
        log.mark_dirty(hdl(4), None, None);
        assert_eq!(log.dirty_entries(), 1);
        let parts = log.into_parts();
        assert!(!parts.entries[&hdl(4)].logical.existed());
    }

    #[test]
    fn test_allocator_snapshot_is_pre_image() {
        let mut info = StageInfo::new(&StageProfile::default());
        let mut log = TxnLog::new();
        assert!(log.is_empty());
        assert!(log.mark_allocator_dirty(&info));

        info.alloc_entry().unwrap();
        info.occupancy.occupied += 1;
        assert!(!log.mark_allocator_dirty(&info));

        let parts = log.into_parts();
        let backup = &parts.stages[&info.stage()];
        assert_eq!(backup.allocator.used(), 0);
        assert_eq!(backup.occupancy.occupied, 0);
    }

    #[test]
    fn test_handle_snapshot_once() {
        let mut reg = HandleRegistry::new(None, 4);
        let mut log = TxnLog::new();
        assert!(log.mark_handles_dirty(&reg));
        reg.allocate().unwrap();
        assert!(!log.mark_handles_dirty(&reg));
        let parts = log.into_parts();
        assert_eq!(parts.handles.map(|h| h.len()), Some(0));
    }
}
