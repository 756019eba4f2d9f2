//! Per-stage state of a table instance.

use crate::alloc::{AllocError, IndexAllocator};
use crate::config::StageProfile;
use pipemgr_hw::{MemType, PhysAddr, PipeError, PipeResult};
use pipemgr_types::{StageId, StageIndex};
use serde::{Deserialize, Serialize};

/// RAM and word packing of a table in one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLayout {
    pub stage: StageId,
    pub mem_type: MemType,
    pub mem_ids: Vec<u16>,
    pub ram_depth: u32,
    pub entries_per_word: u32,
    pub entry_width: u32,
    pub entry_span: u32,
}

impl StageLayout {
    pub fn from_profile(profile: &StageProfile) -> Self {
        Self {
            stage: profile.stage,
            mem_type: profile.mem_type,
            mem_ids: profile.mem_ids.clone(),
            ram_depth: profile.ram_depth,
            entries_per_word: profile.entries_per_word,
            entry_width: profile.entry_width,
            entry_span: profile.entry_span,
        }
    }

    pub fn capacity(&self) -> u32 {
        let rams = self.mem_ids.len() as u32 / self.entry_width.max(1);
        rams.saturating_mul(self.ram_depth)
            .saturating_mul(self.entries_per_word)
    }

    /// Physical address of a stage index.
    ///
    /// ```text
    /// line    = index / entries_per_word      subword = index % entries_per_word
    /// ram     = line / ram_depth              row     = line % ram_depth
    /// mem_id  = mem_ids[ram * entry_width]
    /// ```
    pub fn addr(&self, pipe: u8, index: StageIndex) -> PipeResult<PhysAddr> {
        if index.get() >= self.capacity() {
            return Err(PipeError::invalid_argument(format!(
                "{} out of range for {} (capacity {})",
                index,
                self.stage,
                self.capacity()
            )));
        }
        let epw = self.entries_per_word.max(1);
        let line = index.get() / epw;
        let ram = (line / self.ram_depth) as usize;
        let mem_id = self
            .mem_ids
            .get(ram * self.entry_width as usize)
            .copied()
            .ok_or_else(|| PipeError::unexpected(format!("{} has no memory for {}", self.stage, index)))?;
        Ok(PhysAddr {
            pipe,
            stage: self.stage,
            mem_type: self.mem_type,
            mem_id,
            line: (line % self.ram_depth) as u16,
            subword: (index.get() % epw) as u8,
        })
    }
}

/// Occupancy counters of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupancy {
    /// Shared locations held by logical records.
    pub occupied: u32,
    /// Shared locations written to hardware.
    pub programmed: u32,
    /// Non-shared duplicates.
    pub llp_occupied: u32,
}

/// Allocator, layout and counters of one (table instance, stage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    pub layout: StageLayout,
    pub allocator: IndexAllocator,
    pub occupancy: Occupancy,
}

impl StageInfo {
    pub fn new(profile: &StageProfile) -> Self {
        Self::from_layout(StageLayout::from_profile(profile))
    }

    /// Empty stage with the given layout.
    pub fn from_layout(layout: StageLayout) -> Self {
        let allocator = IndexAllocator::new(layout.capacity());
        Self {
            layout,
            allocator,
            occupancy: Occupancy::default(),
        }
    }

    pub fn stage(&self) -> StageId {
        self.layout.stage
    }

    pub fn span(&self) -> u32 {
        self.layout.entry_span.max(1)
    }

    /// Allocates room for one entry.
    pub fn alloc_entry(&mut self) -> PipeResult<StageIndex> {
        let span = self.span();
        let result = if span == 1 {
            self.allocator.alloc(1)
        } else {
            self.allocator.alloc_aligned(span, 1)
        };
        let base = result.map_err(|e| match e {
            AllocError::Exhausted { .. } => {
                PipeError::exhausted(format!("{} indices", self.layout.stage))
            }
            other => other.into(),
        })?;
        Ok(StageIndex::new(base))
    }

    /// Claims room for one entry at `index`.
    pub fn reserve_entry(&mut self, index: StageIndex) -> PipeResult<()> {
        let span = self.span();
        if index.get() % span != 0 {
            return Err(PipeError::invalid_argument(format!(
                "{} is not aligned to the entry span {} of {}",
                index, span, self.layout.stage
            )));
        }
        self.allocator.reserve(index.get(), span).map_err(|e| match e {
            AllocError::Conflict { .. } => {
                PipeError::already_exists(format!("{} in {}", index, self.layout.stage))
            }
            other => other.into(),
        })
    }

    pub fn release_entry(&mut self, index: StageIndex) -> PipeResult<()> {
        let span = self.span();
        self.allocator
            .release(index.get(), span)
            .map_err(|e| PipeError::unexpected(format!("{}: {}", self.layout.stage, e)))
    }
}
