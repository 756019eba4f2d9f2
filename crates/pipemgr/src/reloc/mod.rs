//! Relocation engine.
//!
//! Moving a live entry uses the move-register protocol. Each relocation is
//! first planned as a pure sequence of (state, instruction) steps and then
//! posted in exactly that order:
//!
//! ```text
//!   Idle ──latch src──> SourceLatched ──latch dst──> DestLatched ──copy──> Copied
//!     │                                                   │                 │
//!     │                                                   └─rewrite─> Rewritten
//!     └──────────────── rewrite (cross-stage) ──────────────────────────────┘
//!                                                                           │
//!           Copied/Rewritten ──invalidate src (TCAM)──> SourceInvalidated ──┤
//!                                                                           ▼
//!                                               Settled (unlatch, drain no-ops)
//! ```
//!
//! The destination is fully written before the source stops matching, so
//! there is never an instruction boundary at which neither address matches.
//! Several relocations run as a chain, bracketed by stage locks when a
//! directly-addressed resource table shares the stages, and split into
//! several chains when the instruction buffer would overflow.

mod chain;
mod engine;

pub use chain::{ChainBudget, LockIdPool, MovedResource, MovedResources, RelocateRequest, RelocationSummary};
pub use engine::{MoveMethod, MovePlan, MoveSpec, PlannedStep, SlotState};
