//! Entry handle registry.

mod registry;

pub use registry::HandleRegistry;
