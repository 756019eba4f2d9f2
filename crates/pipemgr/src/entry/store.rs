//! Entry record store for one table instance.

use super::types::{LogicalEntry, PhysicalEntry};
use pipemgr_common::{Snapshot, SyncMap};
use pipemgr_hw::{PipeError, PipeResult};
use pipemgr_types::{EntryHandle, MemberId};

/// Logical records, physical records and the member-id index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryStore {
    logical: SyncMap<EntryHandle, LogicalEntry>,
    physical: SyncMap<EntryHandle, PhysicalEntry>,
    members: SyncMap<MemberId, EntryHandle>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.logical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logical.is_empty()
    }

    pub fn contains(&self, handle: EntryHandle) -> bool {
        self.logical.contains_key(&handle)
    }

    pub fn logical(&self, handle: EntryHandle) -> PipeResult<&LogicalEntry> {
        self.logical
            .get(&handle)
            .ok_or_else(|| PipeError::not_found(format!("entry {}", handle)))
    }

    pub fn logical_mut(&mut self, handle: EntryHandle) -> PipeResult<&mut LogicalEntry> {
        self.logical
            .get_mut(&handle)
            .ok_or_else(|| PipeError::not_found(format!("entry {}", handle)))
    }

    pub fn get_logical(&self, handle: EntryHandle) -> Option<&LogicalEntry> {
        self.logical.get(&handle)
    }

    pub fn physical(&self, handle: EntryHandle) -> PipeResult<&PhysicalEntry> {
        self.physical
            .get(&handle)
            .ok_or_else(|| PipeError::not_found(format!("programmed entry {}", handle)))
    }

    pub fn physical_mut(&mut self, handle: EntryHandle) -> PipeResult<&mut PhysicalEntry> {
        self.physical
            .get_mut(&handle)
            .ok_or_else(|| PipeError::not_found(format!("programmed entry {}", handle)))
    }

    pub fn get_physical(&self, handle: EntryHandle) -> Option<&PhysicalEntry> {
        self.physical.get(&handle)
    }

    /// Handle currently holding `member`.
    pub fn member_owner(&self, member: MemberId) -> Option<EntryHandle> {
        self.members.get(&member).copied()
    }

    /// Inserts a new logical record and indexes its member id.
    pub fn insert_logical(&mut self, entry: LogicalEntry) -> PipeResult<()> {
        if self.logical.contains_key(&entry.handle) {
            return Err(PipeError::already_exists(format!("entry {}", entry.handle)));
        }
        if let Some(owner) = self.member_owner(entry.member) {
            return Err(PipeError::already_exists(format!(
                "{} (held by entry {})",
                entry.member, owner
            )));
        }
        self.members.insert(entry.member, entry.handle);
        self.logical.insert(entry.handle, entry);
        Ok(())
    }

    /// Removes a logical record and its member index entry.
    pub fn remove_logical(&mut self, handle: EntryHandle) -> Option<LogicalEntry> {
        let entry = self.logical.remove(&handle)?;
        if self.members.get(&entry.member) == Some(&handle) {
            self.members.remove(&entry.member);
        }
        Some(entry)
    }

    pub fn insert_physical(&mut self, entry: PhysicalEntry) -> PipeResult<()> {
        if self.physical.contains_key(&entry.handle) {
            return Err(PipeError::already_exists(format!(
                "programmed entry {}",
                entry.handle
            )));
        }
        self.physical.insert(entry.handle, entry);
        Ok(())
    }

    pub fn remove_physical(&mut self, handle: EntryHandle) -> Option<PhysicalEntry> {
        self.physical.remove(&handle)
    }

    /// Puts both records of `handle` back to their pre-images.
    ///
    /// Live locations are dropped without touching any allocator; the caller
    /// restores allocators separately, after all entries.
    pub fn restore(
        &mut self,
        handle: EntryHandle,
        logical: Snapshot<LogicalEntry>,
        physical: Snapshot<PhysicalEntry>,
    ) {
        self.remove_logical(handle);
        if let Some(entry) = logical.into_option() {
            self.members.insert(entry.member, handle);
            self.logical.insert(handle, entry);
        }
        physical.restore_into(&mut self.physical, handle);
    }

    pub fn logical_entries(&self) -> impl Iterator<Item = &LogicalEntry> {
        self.logical.values()
    }

    pub fn physical_entries(&self) -> impl Iterator<Item = &PhysicalEntry> {
        self.physical.values()
    }

    /// Handles whose logical and physical records disagree, ascending.
    pub fn diverged(&self) -> Vec<EntryHandle> {
        let mut out: Vec<EntryHandle> = Vec::new();
        for (handle, logical) in self.logical.iter() {
            let same = self
                .physical
                .get(handle)
                .is_some_and(|p| p.data == logical.data && p.shared == logical.shared);
            if !same {
                out.push(*handle);
            }
        }
        for handle in self.physical.keys() {
            if !self.logical.contains_key(handle) {
                out.push(*handle);
            }
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::StageLocation;
    use pipemgr_hw::EntryData;
    use pipemgr_types::{StageId, StageIndex};
    use pretty_assertions::assert_eq;

    fn hdl(id: u32) -> EntryHandle {
        EntryHandle::new(None, id).unwrap()
    }

    fn logical(id: u32, member: u32) -> LogicalEntry {
        LogicalEntry::new(hdl(id), None, MemberId::new(member), EntryData::new(1, vec![id as u8]))
    }

    #[test]
    fn test_member_uniqueness() {
        let mut store = EntryStore::new();
        store.insert_logical(logical(1, 10)).unwrap();
        let err = store.insert_logical(logical(2, 10)).unwrap_err();
        assert!(matches!(err, PipeError::AlreadyExists { .. }));
        assert_eq!(store.member_owner(MemberId::new(10)), Some(hdl(1)));

        store.remove_logical(hdl(1));
        assert_eq!(store.member_owner(MemberId::new(10)), None);
        store.insert_logical(logical(2, 10)).unwrap();
    }

    #[test]
    fn test_missing_entry_is_not_found() {
        let store = EntryStore::new();
        assert!(matches!(store.logical(hdl(9)), Err(PipeError::NotFound { .. })));
        assert!(matches!(store.physical(hdl(9)), Err(PipeError::NotFound { .. })));
    }

    #[test]
    fn test_restore_absent_removes_live() {
        let mut store = EntryStore::new();
        store.insert_logical(logical(1, 10)).unwrap();
        store
            .insert_physical(PhysicalEntry::new(hdl(1), EntryData::default()))
            .unwrap();

        store.restore(hdl(1), Snapshot::Absent, Snapshot::Absent);
        assert!(!store.contains(hdl(1)));
        assert!(store.get_physical(hdl(1)).is_none());
        assert_eq!(store.member_owner(MemberId::new(10)), None);
    }

    #[test]
    fn test_restore_keeps_member_of_other_handle() {
        // member 10 moved from handle 1 (deleted) to handle 2 (added)
        let mut store = EntryStore::new();
        let old = logical(1, 10);
        store.insert_logical(logical(2, 10)).unwrap();

        store.restore(hdl(1), Snapshot::Present(old), Snapshot::Absent);
        store.restore(hdl(2), Snapshot::Absent, Snapshot::Absent);
        assert_eq!(store.member_owner(MemberId::new(10)), Some(hdl(1)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_diverged() {
        let mut store = EntryStore::new();
        let mut e = logical(1, 1);
        e.insert_shared(StageLocation::new(StageId::new(0), StageIndex::new(0)));
        store.insert_logical(e.clone()).unwrap();
        store.insert_logical(logical(2, 2)).unwrap();

        let mut p = PhysicalEntry::new(hdl(1), e.data.clone());
        p.shared = e.shared.clone();
        store.insert_physical(p).unwrap();
        store
            .insert_physical(PhysicalEntry::new(hdl(3), EntryData::default()))
            .unwrap();

        // 2 has no physical record, 3 has no logical record
        assert_eq!(store.diverged(), vec![hdl(2), hdl(3)]);

        store.physical_mut(hdl(1)).unwrap().data = EntryData::new(9, vec![]);
        assert_eq!(store.diverged(), vec![hdl(1), hdl(2), hdl(3)]);
    }
}
