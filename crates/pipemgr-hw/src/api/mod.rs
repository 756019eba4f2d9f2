//! Collaborator interfaces.
//!
//! Both traits are implemented outside the entry manager: the encoder by the
//! bit-level entry formatter, the transport by the instruction-list/DMA layer.

mod encoder;
mod transport;

pub use encoder::{EncodeTarget, EntryEncoder};
pub use transport::InstructionTransport;
