//! Table-entry manager for programmable-pipeline ASICs.
//!
//! Tracks where every table entry lives across the stages of a pipeline,
//! keeps the driver's shadow of device memory in step with that placement,
//! and moves entries between stage indices without disturbing traffic.
//!
//! # Architecture
//!
//! ```text
//!   caller (table APIs)
//!        │  add / modify / delete              place / remove / relocate
//!        ↓                                             │
//! [logical records] ──move-list──> [physical records] ─┤
//!        │                                             ↓
//!  [TxnLog backups]                        [Hardware: encoder + transport]
//! ```
//!
//! Each entry has a logical record (what the caller asked for, and where
//! it is placed) and a physical record (what the shadow holds, and what was
//! programmed). The two layers synchronize through move-lists and may
//! diverge in between.
//!
//! # Key Components
//!
//! - [`table::TableRegistry`]: every table instance of one device and the
//!   device-wide transaction
//! - [`table::TableSession`]: operations on one instance
//! - [`reloc`]: instruction plans for moving an entry between indices
//! - [`state`]: persisted records for warm restart

pub mod alloc;
pub mod audit;
pub mod config;
pub mod entry;
pub mod fault;
pub mod handle;
pub mod move_list;
pub mod reloc;
pub mod stage;
pub mod state;
pub mod table;
pub mod txn;

pub use config::{DeviceProfile, StageProfile, TableKind, TableProfile};
pub use entry::{LogicalEntry, PhysicalEntry, StageLocation};
pub use move_list::{MoveList, MoveListError, MoveNode, MoveOp};
pub use reloc::{RelocateRequest, RelocationSummary};
pub use state::{DeviceState, EntryState, InstanceState};
pub use table::{Hardware, TableInstance, TableRegistry, TableSession};

pub use pipemgr_hw::{EntryData, PipeError, PipeResult, PipeStatus};
pub use pipemgr_types::{EntryHandle, MemberId, PipeBitmap, PipeId, StageId, StageIndex, TableHandle};
