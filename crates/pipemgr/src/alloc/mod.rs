//! Stage index allocation.
//!
//! Each (table instance, stage) owns an [`IndexAllocator`] over the stage's
//! entry-index space. Allocations are power-of-two aligned, explicit
//! reservations support state replay, and snapshots are copy-on-write so
//! the transaction log can back an allocator up at no cost until it changes.

mod buddy;

pub use buddy::{AllocError, IndexAllocator};
