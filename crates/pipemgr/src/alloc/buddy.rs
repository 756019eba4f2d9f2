//! Power-of-two (buddy) index allocator.
//!
//! The index space is padded to a power of two and tracked by a complete
//! binary tree stored in an array (root at 1). Every node records the size
//! of the largest free, naturally aligned block inside its subtree:
//!
//! ```text
//!                 [8]              capacity 8, nothing allocated
//!           [4]         [4]
//!        [2]   [2]   [2]   [2]
//!       1  1  1  1  1  1  1  1
//! ```
//!
//! A node equal to its own size is entirely free; a node equal to zero is
//! entirely used. Range updates stop at fully covered nodes, so the children
//! of such a node may be stale and are rewritten from the parent before any
//! descent. Every operation touches O(log capacity) nodes.

use pipemgr_hw::PipeError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type for allocator operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("no free block for {requested} index(es)")]
    Exhausted { requested: u32 },

    #[error("index {index} is already allocated")]
    Conflict { index: u32 },

    #[error("index {index} is not allocated")]
    NotAllocated { index: u32 },

    #[error("range {index}+{count} exceeds capacity {capacity}")]
    OutOfRange { index: u32, count: u32, capacity: u32 },

    #[error("zero-sized request")]
    ZeroSized,
}

impl From<AllocError> for PipeError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::Exhausted { .. } => PipeError::exhausted(err.to_string()),
            AllocError::Conflict { .. } => PipeError::already_exists(err.to_string()),
            AllocError::NotAllocated { .. } => PipeError::unexpected(err.to_string()),
            AllocError::OutOfRange { .. } | AllocError::ZeroSized => {
                PipeError::invalid_argument(err.to_string())
            }
        }
    }
}

/// Power-of-two index allocator with copy-on-write snapshots.
#[derive(Clone)]
pub struct IndexAllocator {
    capacity: u32,
    size: u32,
    used: u32,
    tree: Arc<Vec<u32>>,
}

impl IndexAllocator {
    /// Creates an allocator over indices `0..capacity`, all free.
    pub fn new(capacity: u32) -> Self {
        let size = capacity.max(1).next_power_of_two();
        let mut tree = vec![0u32; 2 * size as usize];
        tree[1] = size;
        if capacity < size {
            assign(&mut tree, 1, 0, size, capacity, size, true);
        }
        Self {
            capacity,
            size,
            used: 0,
            tree: Arc::new(tree),
        }
    }

    /// Number of indices managed.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of indices currently allocated.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Number of indices currently free.
    pub fn free(&self) -> u32 {
        self.capacity - self.used
    }

    /// Size of the largest free aligned block.
    pub fn largest_free_block(&self) -> u32 {
        self.tree[1]
    }

    /// Allocates `n` consecutive indices starting at a multiple of
    /// `next_pow2(n)`. Returns the first index.
    pub fn alloc(&mut self, n: u32) -> Result<u32, AllocError> {
        if n == 0 {
            return Err(AllocError::ZeroSized);
        }
        let block = n.checked_next_power_of_two().ok_or(AllocError::Exhausted { requested: n })?;
        self.alloc_block(block, n)
    }

    /// Allocates `n_blocks` consecutive blocks of `block_size` indices each.
    /// The returned base is aligned to `next_pow2(block_size)`.
    pub fn alloc_aligned(&mut self, block_size: u32, n_blocks: u32) -> Result<u32, AllocError> {
        if block_size == 0 || n_blocks == 0 {
            return Err(AllocError::ZeroSized);
        }
        let requested = block_size.saturating_mul(n_blocks);
        let total = block_size
            .checked_next_power_of_two()
            .and_then(|b| b.checked_mul(n_blocks))
            .ok_or(AllocError::Exhausted { requested })?;
        let search = total
            .checked_next_power_of_two()
            .ok_or(AllocError::Exhausted { requested })?;
        self.alloc_block(search, total)
    }

    fn alloc_block(&mut self, block: u32, n: u32) -> Result<u32, AllocError> {
        if block > self.size || self.tree[1] < block {
            return Err(AllocError::Exhausted { requested: n });
        }
        let size = self.size;
        let tree = Arc::make_mut(&mut self.tree);
        let base = find(tree, block, size);
        assign(tree, 1, 0, size, base, base + n, true);
        self.used += n;
        Ok(base)
    }

    /// Marks `index..index + n` allocated. Used when replaying saved state.
    pub fn reserve(&mut self, index: u32, n: u32) -> Result<(), AllocError> {
        let end = self.check_range(index, n)?;
        if !all_free(&self.tree, 1, 0, self.size, index, end) {
            return Err(AllocError::Conflict { index });
        }
        let size = self.size;
        assign(Arc::<Vec<u32>>::make_mut(&mut self.tree), 1, 0, size, index, end, true);
        self.used += n;
        Ok(())
    }

    /// Returns `index..index + n` to the free pool.
    pub fn release(&mut self, index: u32, n: u32) -> Result<(), AllocError> {
        let end = self.check_range(index, n)?;
        if !all_used(&self.tree, 1, 0, self.size, index, end) {
            return Err(AllocError::NotAllocated { index });
        }
        let size = self.size;
        assign(Arc::<Vec<u32>>::make_mut(&mut self.tree), 1, 0, size, index, end, false);
        self.used -= n;
        Ok(())
    }

    /// Returns true if `index` is allocated.
    pub fn is_allocated(&self, index: u32) -> bool {
        index < self.capacity && all_used(&self.tree, 1, 0, self.size, index, index + 1)
    }

    /// Captures the allocator state. The copy shares storage with the live
    /// allocator until either side changes.
    pub fn snapshot(&self) -> IndexAllocator {
        self.clone()
    }

    /// Replaces the live state with a snapshot.
    pub fn restore(&mut self, state: IndexAllocator) {
        *self = state;
    }

    /// Allocated ranges as `(first, count)`, ascending and coalesced.
    pub fn allocated_ranges(&self) -> Vec<(u32, u32)> {
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        collect_used(&self.tree, 1, 0, self.size, self.capacity, &mut ranges);
        ranges
    }

    fn check_range(&self, index: u32, n: u32) -> Result<u32, AllocError> {
        if n == 0 {
            return Err(AllocError::ZeroSized);
        }
        match index.checked_add(n) {
            Some(end) if end <= self.capacity => Ok(end),
            _ => Err(AllocError::OutOfRange {
                index,
                count: n,
                capacity: self.capacity,
            }),
        }
    }
}

impl PartialEq for IndexAllocator {
    fn eq(&self, other: &Self) -> bool {
        self.capacity == other.capacity
            && self.used == other.used
            && (Arc::ptr_eq(&self.tree, &other.tree)
                || self.allocated_ranges() == other.allocated_ranges())
    }
}

impl Eq for IndexAllocator {}

impl fmt::Debug for IndexAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexAllocator")
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("allocated", &self.allocated_ranges())
            .finish()
    }
}

fn push_down(tree: &mut [u32], node: usize, size: u32) {
    let half = size / 2;
    if tree[node] == size {
        tree[2 * node] = half;
        tree[2 * node + 1] = half;
    } else if tree[node] == 0 {
        tree[2 * node] = 0;
        tree[2 * node + 1] = 0;
    }
}

fn pull_up(tree: &mut [u32], node: usize, size: u32) {
    let half = size / 2;
    let (left, right) = (tree[2 * node], tree[2 * node + 1]);
    tree[node] = if left == half && right == half {
        size
    } else {
        left.max(right)
    };
}

fn assign(tree: &mut [u32], node: usize, lo: u32, size: u32, start: u32, end: u32, used: bool) {
    if end <= lo || lo + size <= start {
        return;
    }
    if start <= lo && lo + size <= end {
        tree[node] = if used { 0 } else { size };
        return;
    }
    push_down(tree, node, size);
    let half = size / 2;
    assign(tree, 2 * node, lo, half, start, end, used);
    assign(tree, 2 * node + 1, lo + half, half, start, end, used);
    pull_up(tree, node, size);
}

fn find(tree: &mut [u32], block: u32, root_size: u32) -> u32 {
    let (mut node, mut lo, mut size) = (1usize, 0u32, root_size);
    while size > block {
        push_down(tree, node, size);
        let half = size / 2;
        if tree[2 * node] >= block {
            node *= 2;
        } else {
            node = 2 * node + 1;
            lo += half;
        }
        size = half;
    }
    lo
}

fn all_free(tree: &[u32], node: usize, lo: u32, size: u32, start: u32, end: u32) -> bool {
    if end <= lo || lo + size <= start || tree[node] == size {
        return true;
    }
    if tree[node] == 0 || (start <= lo && lo + size <= end) {
        return false;
    }
    let half = size / 2;
    all_free(tree, 2 * node, lo, half, start, end)
        && all_free(tree, 2 * node + 1, lo + half, half, start, end)
}

fn all_used(tree: &[u32], node: usize, lo: u32, size: u32, start: u32, end: u32) -> bool {
    if end <= lo || lo + size <= start || tree[node] == 0 {
        return true;
    }
    if tree[node] == size || (start <= lo && lo + size <= end) {
        return false;
    }
    let half = size / 2;
    all_used(tree, 2 * node, lo, half, start, end)
        && all_used(tree, 2 * node + 1, lo + half, half, start, end)
}

fn collect_used(tree: &[u32], node: usize, lo: u32, size: u32, cap: u32, out: &mut Vec<(u32, u32)>) {
    if lo >= cap || tree[node] == size {
        return;
    }
    if tree[node] == 0 {
        let end = (lo + size).min(cap);
        match out.last_mut() {
            Some((first, count)) if *first + *count == lo => *count = end - *first,
            _ => out.push((lo, end - lo)),
        }
        return;
    }
    let half = size / 2;
    collect_used(tree, 2 * node, lo, half, cap, out);
    collect_used(tree, 2 * node + 1, lo + half, half, cap, out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    #[test]
    fn test_aligned_then_single() {
        let mut alloc = IndexAllocator::new(8);
        assert_eq!(alloc.alloc_aligned(2, 2), Ok(0));
        let next = alloc.alloc(1).unwrap();
        assert!(next >= 4, "single index {} overlaps the aligned block", next);
        assert_eq!(alloc.used(), 5);
    }

    #[test]
    fn test_alloc_is_aligned() {
        let mut alloc = IndexAllocator::new(16);
        assert_eq!(alloc.alloc(1), Ok(0));
        assert_eq!(alloc.alloc(2), Ok(2));
        assert_eq!(alloc.alloc(4), Ok(4));
        assert_eq!(alloc.alloc(1), Ok(1));
        // 3 rounds its search up to a 4-block but only holds 3 indices
        assert_eq!(alloc.alloc(3), Ok(8));
        assert!(!alloc.is_allocated(11));
        assert_eq!(alloc.alloc(1), Ok(11));
    }

    #[test]
    fn test_non_power_of_two_capacity() {
        let mut alloc = IndexAllocator::new(6);
        assert_eq!(alloc.free(), 6);
        assert_eq!(alloc.alloc(4), Ok(0));
        assert_eq!(alloc.alloc(2), Ok(4));
        assert_eq!(alloc.alloc(1), Err(AllocError::Exhausted { requested: 1 }));
        assert_eq!(alloc.allocated_ranges(), vec![(0, 6)]);
    }

    #[test]
    fn test_exhausted_is_recoverable() {
        let mut alloc = IndexAllocator::new(2);
        alloc.alloc(2).unwrap();
        let err: PipeError = alloc.alloc(1).unwrap_err().into();
        assert!(matches!(err, PipeError::Exhausted { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_reserve_and_conflict() {
        let mut alloc = IndexAllocator::new(8);
        alloc.reserve(3, 2).unwrap();
        assert!(alloc.is_allocated(3));
        assert!(alloc.is_allocated(4));
        assert!(!alloc.is_allocated(5));
        assert_eq!(alloc.reserve(4, 1), Err(AllocError::Conflict { index: 4 }));
        assert_eq!(
            alloc.reserve(7, 2),
            Err(AllocError::OutOfRange {
                index: 7,
                count: 2,
                capacity: 8
            })
        );
        // 3..5 is taken, so the first free 2-block is 0
        assert_eq!(alloc.alloc(2), Ok(0));
        assert_eq!(alloc.alloc(2), Ok(6));
    }

    #[test]
    fn test_release_checks_ownership() {
        let mut alloc = IndexAllocator::new(8);
        let idx = alloc.alloc(2).unwrap();
        assert_eq!(alloc.release(idx + 2, 1), Err(AllocError::NotAllocated { index: idx + 2 }));
        alloc.release(idx, 2).unwrap();
        assert_eq!(alloc.release(idx, 1), Err(AllocError::NotAllocated { index: idx }));
        assert_eq!(alloc.used(), 0);
        assert_eq!(alloc.largest_free_block(), 8);
    }

    #[test]
    fn test_release_then_realloc_same_size() {
        let mut alloc = IndexAllocator::new(32);
        let a = alloc.alloc(4).unwrap();
        let b = alloc.alloc(4).unwrap();
        alloc.release(a, 4).unwrap();
        let c = alloc.alloc(4).unwrap();
        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn test_snapshot_is_copy_on_write() {
        let mut alloc = IndexAllocator::new(8);
        alloc.alloc(1).unwrap();
        let snap = alloc.snapshot();
        assert_eq!(snap, alloc);

        alloc.alloc(4).unwrap();
        assert_ne!(snap, alloc);
        assert_eq!(snap.used(), 1);

        alloc.restore(snap.clone());
        assert_eq!(alloc, snap);
        assert_eq!(alloc.alloc(4), Ok(4));
    }

    #[test]
    fn test_equality_ignores_tree_history() {
        let mut a = IndexAllocator::new(8);
        a.reserve(0, 8).unwrap();
        a.release(2, 2).unwrap();
        let mut b = IndexAllocator::new(8);
        b.reserve(0, 2).unwrap();
        b.reserve(4, 4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_sized() {
        let mut alloc = IndexAllocator::new(4);
        assert_eq!(alloc.alloc(0), Err(AllocError::ZeroSized));
        assert_eq!(alloc.alloc_aligned(0, 1), Err(AllocError::ZeroSized));
        assert_eq!(alloc.reserve(0, 0), Err(AllocError::ZeroSized));
    }

    #[test]
    fn test_empty_capacity() {
        let mut alloc = IndexAllocator::new(0);
        assert_eq!(alloc.alloc(1), Err(AllocError::Exhausted { requested: 1 }));
        assert!(alloc.allocated_ranges().is_empty());
    }

    #[test]
    fn test_random_against_bitmap_model() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let capacity = rng.gen_range(1..200u32);
            let mut alloc = IndexAllocator::new(capacity);
            let mut model = vec![false; capacity as usize];
            let mut live: Vec<(u32, u32)> = Vec::new();

            for _ in 0..300 {
                if live.is_empty() || rng.gen_bool(0.6) {
                    let n = rng.gen_range(1..=8u32);
                    match alloc.alloc(n) {
                        Ok(base) => {
                            assert_eq!(base % n.next_power_of_two(), 0);
                            for i in base..base + n {
                                assert!(!model[i as usize], "index {} handed out twice", i);
                                model[i as usize] = true;
                            }
                            live.push((base, n));
                        }
                        Err(AllocError::Exhausted { .. }) => {}
                        Err(e) => panic!("unexpected error {}", e),
                    }
                } else {
                    let (base, n) = live.swap_remove(rng.gen_range(0..live.len()));
                    alloc.release(base, n).unwrap();
                    for i in base..base + n {
                        model[i as usize] = false;
                    }
                }
                let used = model.iter().filter(|b| **b).count() as u32;
                assert_eq!(alloc.used(), used);
            }

            for (i, taken) in model.iter().enumerate() {
                assert_eq!(alloc.is_allocated(i as u32), *taken);
            }
        }
    }
}
