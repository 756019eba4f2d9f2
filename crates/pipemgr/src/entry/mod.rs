//! Placement records.
//!
//! Every entry exists twice:
//!
//! ```text
//!   LogicalEntry  (HLP)  handle, member, payload, shared locations
//!        │  move-list
//!        ▼
//!   PhysicalEntry (LLP)  payload as programmed, shared + non-shared locations
//! ```
//!
//! The two records are kept apart so warm-restart replay can rebuild either
//! side independently and then compare them.

mod store;
mod types;

pub use store::EntryStore;
pub use types::{LogicalEntry, PhysicalEntry, StageLocation};
