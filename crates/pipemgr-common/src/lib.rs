//! Shared containers for the pipeline table-entry manager.
//!
//! - [`SyncMap`]: ordered map that never creates entries implicitly
//! - [`HasRefCount`]: records that count the owners referencing them
//! - [`Snapshot`]: tagged pre-image of a value that may not have existed
//!
//! # Example
//!
//! ```
//! use pipemgr_common::{Snapshot, SyncMap};
//!
//! let mut live: SyncMap<u32, &str> = SyncMap::new();
//! let before = Snapshot::capture(live.get(&7));
//! live.insert(7, "new");
//!
//! // Rolling back a value that did not exist removes it.
//! before.restore_into(&mut live, 7);
//! assert!(live.get(&7).is_none());
//! ```

mod snapshot;
mod sync_map;

pub use snapshot::Snapshot;
pub use sync_map::{HasRefCount, SyncMap};
