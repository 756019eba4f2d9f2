//! Pipe identifiers and pipe bitmaps.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hardware pipe number (0-7).
///
/// # Examples
///
/// ```
/// use pipemgr_types::PipeId;
///
/// let pipe = PipeId::new(2).unwrap();
/// assert_eq!(pipe.as_u8(), 2);
/// assert!(PipeId::new(8).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PipeId(u8);

impl PipeId {
    /// Number of pipes a device can have.
    pub const MAX_PIPES: u8 = 8;

    /// Creates a pipe id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not below [`PipeId::MAX_PIPES`].
    pub const fn new(id: u8) -> Result<Self, ParseError> {
        if id < Self::MAX_PIPES {
            Ok(PipeId(id))
        } else {
            Err(ParseError::InvalidPipeId(id))
        }
    }

    /// Returns the pipe number.
    pub const fn as_u8(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe{}", self.0)
    }
}

impl FromStr for PipeId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("pipe").unwrap_or(s);
        let id: u8 = digits
            .parse()
            .map_err(|_| ParseError::InvalidId(s.to_string()))?;
        PipeId::new(id)
    }
}

impl TryFrom<u8> for PipeId {
    type Error = ParseError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        PipeId::new(id)
    }
}

impl From<PipeId> for u8 {
    fn from(pipe: PipeId) -> u8 {
        pipe.0
    }
}

/// Set of pipes an instruction is broadcast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipeBitmap(u8);

impl PipeBitmap {
    /// The empty set.
    pub const EMPTY: PipeBitmap = PipeBitmap(0);

    /// Bitmap with pipes `0..num_pipes` set.
    pub fn all(num_pipes: u8) -> Self {
        let n = num_pipes.min(PipeId::MAX_PIPES) as u32;
        PipeBitmap(((1u32 << n) - 1) as u8)
    }

    /// Bitmap containing a single pipe.
    pub const fn single(pipe: PipeId) -> Self {
        PipeBitmap(1 << pipe.0)
    }

    /// Returns the raw bits.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Adds a pipe to the set.
    pub fn insert(&mut self, pipe: PipeId) {
        self.0 |= 1 << pipe.0;
    }

    /// Returns true if the pipe is in the set.
    pub const fn contains(&self, pipe: PipeId) -> bool {
        self.0 & (1 << pipe.0) != 0
    }

    /// Returns true if no pipe is set.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of pipes in the set.
    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Iterates the pipes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = PipeId> + '_ {
        (0..PipeId::MAX_PIPES)
            .filter(move |p| self.0 & (1 << p) != 0)
            .map(PipeId)
    }
}

impl FromIterator<PipeId> for PipeBitmap {
    fn from_iter<I: IntoIterator<Item = PipeId>>(iter: I) -> Self {
        let mut bitmap = PipeBitmap::EMPTY;
        for pipe in iter {
            bitmap.insert(pipe);
        }
        bitmap
    }
}

impl fmt::Display for PipeBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pipes: Vec<String> = self.iter().map(|p| p.as_u8().to_string()).collect();
        write!(f, "[{}]", pipes.join(","))
    }
}

/// Parses a comma separated pipe list such as `"0,1,3"`.
impl FromStr for PipeBitmap {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('[').trim_end_matches(']');
        if trimmed.is_empty() {
            return Ok(PipeBitmap::EMPTY);
        }
        trimmed
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<PipeId>()
                    .map_err(|_| ParseError::InvalidPipeList(s.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pipe_range() {
        assert!(PipeId::new(0).is_ok());
        assert!(PipeId::new(7).is_ok());
        assert_eq!(PipeId::new(8), Err(ParseError::InvalidPipeId(8)));
    }

    #[test]
    fn test_parse_pipe() {
        assert_eq!("pipe3".parse::<PipeId>().unwrap().as_u8(), 3);
        assert_eq!("1".parse::<PipeId>().unwrap().as_u8(), 1);
        assert!("pipe9".parse::<PipeId>().is_err());
    }

    #[test]
    fn test_bitmap_all() {
        let all = PipeBitmap::all(4);
        assert_eq!(all.bits(), 0b1111);
        assert_eq!(all.count(), 4);
        assert_eq!(PipeBitmap::all(8).bits(), 0xff);
    }

    #[test]
    fn test_bitmap_iter_and_display() {
        let bitmap: PipeBitmap = "0,2,3".parse().unwrap();
        let pipes: Vec<u8> = bitmap.iter().map(|p| p.as_u8()).collect();
        assert_eq!(pipes, vec![0, 2, 3]);
        assert_eq!(bitmap.to_string(), "[0,2,3]");
        assert!(bitmap.contains(PipeId::new(2).unwrap()));
        assert!(!bitmap.contains(PipeId::new(1).unwrap()));
    }

    #[test]
    fn test_bitmap_parse_errors() {
        assert!("0,x".parse::<PipeBitmap>().is_err());
        assert!("9".parse::<PipeBitmap>().is_err());
        assert!("".parse::<PipeBitmap>().unwrap().is_empty());
    }
}
