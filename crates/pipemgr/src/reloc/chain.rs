//! Relocation chains: requests, buffer budgeting, stage lock ids and the
//! moved-resource accumulator.

use pipemgr_hw::{PipeError, PipeResult, ResourceKind};
use pipemgr_types::{EntryHandle, LockId, StageId, StageIndex, TableHandle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Move the entry's location in `from_stage` to `to_stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocateRequest {
    pub handle: EntryHandle,
    pub from_stage: StageId,
    pub to_stage: StageId,
    /// Destination index; allocated when `None`.
    pub to_index: Option<StageIndex>,
}

impl RelocateRequest {
    pub fn new(handle: EntryHandle, from_stage: StageId, to_stage: StageId) -> Self {
        Self {
            handle,
            from_stage,
            to_stage,
            to_index: None,
        }
    }

    pub fn to_index(mut self, index: StageIndex) -> Self {
        self.to_index = Some(index);
        self
    }

    pub fn is_cross_stage(&self) -> bool {
        self.from_stage != self.to_stage
    }
}

/// A directly-attached resource that followed its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovedResource {
    pub kind: ResourceKind,
    pub handle: EntryHandle,
    pub from: (StageId, StageIndex),
    pub to: (StageId, StageIndex),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MovedResources {
    moved: Vec<MovedResource>,
}

impl MovedResources {
    pub fn push(&mut self, resource: MovedResource) {
        self.moved.push(resource);
    }

    pub fn len(&self) -> usize {
        self.moved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MovedResource> {
        self.moved.iter()
    }

    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &MovedResource> {
        self.moved.iter().filter(move |r| r.kind == kind)
    }
}

/// Outcome of a relocation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationSummary {
    pub moved: MovedResources,
    pub relocated: usize,
    pub copies: usize,
    pub rewrites: usize,
    /// Lock/flush-bounded chains the call was split into.
    pub chains: usize,
}

/// Instruction-buffer accounting for one chain.
///
/// Every chain pays for its lock and unlock bracket up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainBudget {
    capacity: usize,
    bracket: usize,
    used: usize,
}

impl ChainBudget {
    pub fn new(capacity: usize, bracket: usize) -> Self {
        Self {
            capacity,
            bracket,
            used: bracket,
        }
    }

    /// Starts a fresh chain.
    pub fn restart(&mut self) {
        self.used = self.bracket;
    }

    pub fn fits(&self, cost: usize) -> bool {
        self.used.saturating_add(cost) <= self.capacity
    }

    pub fn charge(&mut self, cost: usize) {
        self.used = self.used.saturating_add(cost);
    }

    /// True until something is charged to the current chain.
    pub fn is_fresh(&self) -> bool {
        self.used == self.bracket
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Stage lock ids, one per table, reused until released.
#[derive(Debug, Default)]
pub struct LockIdPool {
    assigned: BTreeMap<TableHandle, LockId>,
    free: BTreeSet<LockId>,
    next: u16,
}

impl LockIdPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table's lock id, assigning one on first use.
    pub fn acquire(&mut self, table: TableHandle) -> PipeResult<LockId> {
        if let Some(id) = self.assigned.get(&table) {
            return Ok(*id);
        }
        let id = match self.free.pop_first() {
            Some(id) => id,
            None => {
                let id = LockId::new(self.next);
                self.next = self
                    .next
                    .checked_add(1)
                    .ok_or_else(|| PipeError::exhausted("stage lock ids"))?;
                id
            }
        };
        self.assigned.insert(table, id);
        Ok(id)
    }

    pub fn release(&mut self, table: TableHandle) -> PipeResult<LockId> {
        let id = self
            .assigned
            .remove(&table)
            .ok_or_else(|| PipeError::not_found(format!("lock id of table {}", table)))?;
        self.free.insert(id);
        Ok(id)
    }

    pub fn get(&self, table: TableHandle) -> Option<LockId> {
        self.assigned.get(&table).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lock_ids_reused_until_released() {
        let mut pool = LockIdPool::new();
        let a = pool.acquire(TableHandle::new(1)).unwrap();
        let b = pool.acquire(TableHandle::new(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.acquire(TableHandle::new(1)).unwrap(), a);

        assert_eq!(pool.release(TableHandle::new(1)).unwrap(), a);
        assert_eq!(pool.get(TableHandle::new(1)), None);
        assert!(matches!(pool.release(TableHandle::new(1)), Err(PipeError::NotFound { .. })));

        // released ids are recycled before new ones are minted
        assert_eq!(pool.acquire(TableHandle::new(3)).unwrap(), a);
    }

    #[test]
    fn test_budget() {
        let mut budget = ChainBudget::new(100, 16);
        assert!(budget.is_fresh());
        assert!(budget.fits(84));
        assert!(!budget.fits(85));

        budget.charge(50);
        assert!(!budget.is_fresh());
        assert!(!budget.fits(40));

        budget.restart();
        assert_eq!(budget.used(), 16);
        assert!(budget.fits(40));
    }

    #[test]
    fn test_moved_resources_by_kind() {
        let handle = EntryHandle::new(None, 1).unwrap();
        let mut moved = MovedResources::default();
        for kind in [ResourceKind::Counter, ResourceKind::IdleTime, ResourceKind::Counter] {
            moved.push(MovedResource {
                kind,
                handle,
                from: (StageId::new(0), StageIndex::new(0)),
                to: (StageId::new(1), StageIndex::new(4)),
            });
        }
        assert_eq!(moved.len(), 3);
        assert_eq!(moved.of_kind(ResourceKind::Counter).count(), 2);
    }
}
