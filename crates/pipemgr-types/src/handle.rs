//! Entry handles.

use crate::{ParseError, PipeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque 32-bit entry handle, unique within a table instance.
///
/// The low 28 bits carry a dense id drawn from the instance's handle space.
/// The top 4 bits carry `pipe + 1` when the handle is pinned to a pipe
/// (asymmetric tables) and zero otherwise.
///
/// # Examples
///
/// ```
/// use pipemgr_types::{EntryHandle, PipeId};
///
/// let pipe = PipeId::new(1).unwrap();
/// let hdl = EntryHandle::new(Some(pipe), 17).unwrap();
/// assert_eq!(hdl.id(), 17);
/// assert_eq!(hdl.pipe(), Some(pipe));
///
/// let sym = EntryHandle::new(None, 17).unwrap();
/// assert_eq!(sym.pipe(), None);
/// assert_ne!(hdl, sym);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryHandle(u32);

impl EntryHandle {
    const PIPE_SHIFT: u32 = 28;

    /// Largest id that fits below the pipe bits.
    pub const MAX_ID: u32 = (1 << Self::PIPE_SHIFT) - 1;

    /// Builds a handle from an id and an optional owning pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not fit in 28 bits.
    pub const fn new(pipe: Option<PipeId>, id: u32) -> Result<Self, ParseError> {
        if id > Self::MAX_ID {
            return Err(ParseError::InvalidHandleId(id));
        }
        let pipe_bits = match pipe {
            Some(p) => (p.as_u8() as u32 + 1) << Self::PIPE_SHIFT,
            None => 0,
        };
        Ok(EntryHandle(pipe_bits | id))
    }

    /// Reinterprets a raw handle value.
    pub const fn from_raw(raw: u32) -> Self {
        EntryHandle(raw)
    }

    /// Returns the raw handle value.
    pub const fn as_raw(&self) -> u32 {
        self.0
    }

    /// Returns the dense id part of the handle.
    pub const fn id(&self) -> u32 {
        self.0 & Self::MAX_ID
    }

    /// Returns the pipe the handle is pinned to, if any.
    pub fn pipe(&self) -> Option<PipeId> {
        match self.0 >> Self::PIPE_SHIFT {
            0 => None,
            p => PipeId::new((p - 1) as u8).ok(),
        }
    }
}

impl fmt::Display for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pipe_bits() {
        let pipe = PipeId::new(0).unwrap();
        let hdl = EntryHandle::new(Some(pipe), 5).unwrap();
        assert_eq!(hdl.as_raw(), 0x1000_0005);
        assert_eq!(hdl.pipe(), Some(pipe));
        assert_eq!(hdl.id(), 5);
    }

    #[test]
    fn test_max_id() {
        assert!(EntryHandle::new(None, EntryHandle::MAX_ID).is_ok());
        assert_eq!(
            EntryHandle::new(None, EntryHandle::MAX_ID + 1),
            Err(ParseError::InvalidHandleId(EntryHandle::MAX_ID + 1))
        );
    }

    #[test]
    fn test_raw_round_trip() {
        let pipe = PipeId::new(7).unwrap();
        let hdl = EntryHandle::new(Some(pipe), 0x1234).unwrap();
        assert_eq!(EntryHandle::from_raw(hdl.as_raw()), hdl);
        assert_eq!(hdl.to_string(), "0x80001234");
    }
}
