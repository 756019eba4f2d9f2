//! Test infrastructure for the pipeline table-entry manager
//!
//! Provides:
//! - A recording instruction transport with fault injection
//! - A reversible fake entry encoder
//! - Instruction-sequence verification helpers

pub mod fixtures;
mod verification;

pub use fixtures::*;
pub use verification::*;
