//! Dense per-instance handle space.
//!
//! Ids come from an [`IndexAllocator`] so allocation is lowest-free-first
//! and snapshots are copy-on-write, like the stage allocators. Id 0 is never
//! handed out.
//!
//! A handle whose Add move-list node has not reached the hardware shadow yet
//! is *pending*. A pending handle is never released by a logical delete: the
//! outstanding Add still names it, so only the matching shadow Delete may
//! hand it back.

use crate::alloc::{AllocError, IndexAllocator};
use log::debug;
use pipemgr_hw::{PipeError, PipeResult};
use pipemgr_types::{EntryHandle, PipeId};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRegistry {
    pipe: Option<PipeId>,
    ids: IndexAllocator,
    pending: BTreeSet<u32>,
}

impl HandleRegistry {
    /// Creates a registry for `max_entries` handles, pinned to `pipe` when
    /// the owning instance is per-pipe.
    pub fn new(pipe: Option<PipeId>, max_entries: u32) -> Self {
        let capacity = max_entries.min(EntryHandle::MAX_ID).saturating_add(1);
        let mut ids = IndexAllocator::new(capacity);
        // id 0 is reserved; the allocator is fresh so this cannot conflict
        let reserved = ids.reserve(0, 1);
        debug_assert!(reserved.is_ok(), "reserving id 0: {:?}", reserved);
        Self {
            pipe,
            ids,
            pending: BTreeSet::new(),
        }
    }

    pub fn pipe(&self) -> Option<PipeId> {
        self.pipe
    }

    /// Number of live handles.
    pub fn len(&self) -> u32 {
        self.ids.used().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn allocate(&mut self) -> PipeResult<EntryHandle> {
        let id = self.ids.alloc(1).map_err(|e| match e {
            AllocError::Exhausted { .. } => PipeError::exhausted("entry handles"),
            other => other.into(),
        })?;
        let handle = EntryHandle::new(self.pipe, id)
            .map_err(|e| PipeError::unexpected(e.to_string()))?;
        debug!("Allocated entry handle {}", handle);
        Ok(handle)
    }

    pub fn release(&mut self, handle: EntryHandle) -> PipeResult<()> {
        self.check_pipe(handle)?;
        if handle.id() == 0 {
            return Err(PipeError::not_found(format!("entry handle {}", handle)));
        }
        self.ids.release(handle.id(), 1).map_err(|e| match e {
            AllocError::NotAllocated { .. } | AllocError::OutOfRange { .. } => {
                PipeError::not_found(format!("entry handle {}", handle))
            }
            other => other.into(),
        })?;
        self.pending.remove(&handle.id());
        debug!("Released entry handle {}", handle);
        Ok(())
    }

    /// Marks `handle` as named by an Add node not yet applied to the shadow.
    pub fn mark_pending(&mut self, handle: EntryHandle) {
        if self.is_allocated(handle) {
            self.pending.insert(handle.id());
        }
    }

    /// Clears the pending mark once the shadow has applied the Add.
    /// Returns whether the handle was pending.
    pub fn settle(&mut self, handle: EntryHandle) -> bool {
        handle.pipe() == self.pipe && self.pending.remove(&handle.id())
    }

    pub fn is_pending(&self, handle: EntryHandle) -> bool {
        handle.pipe() == self.pipe && self.pending.contains(&handle.id())
    }

    /// Claims a specific handle. Used when replaying saved state.
    pub fn reserve(&mut self, handle: EntryHandle) -> PipeResult<()> {
        self.check_pipe(handle)?;
        if handle.id() == 0 {
            return Err(PipeError::invalid_argument(format!("entry handle {} is reserved", handle)));
        }
        self.ids.reserve(handle.id(), 1).map_err(|e| match e {
            AllocError::Conflict { .. } => {
                PipeError::already_exists(format!("entry handle {}", handle))
            }
            other => other.into(),
        })
    }

    pub fn is_allocated(&self, handle: EntryHandle) -> bool {
        handle.pipe() == self.pipe && handle.id() != 0 && self.ids.is_allocated(handle.id())
    }

    pub fn snapshot(&self) -> HandleRegistry {
        self.clone()
    }

    pub fn restore(&mut self, state: HandleRegistry) {
        *self = state;
    }

    fn check_pipe(&self, handle: EntryHandle) -> PipeResult<()> {
        if handle.pipe() != self.pipe {
            return Err(PipeError::invalid_argument(format!(
                "entry handle {} is pinned to {:?}, instance serves {:?}",
                handle,
                handle.pipe(),
                self.pipe
            )));
        }
        Ok(())
    }
}
