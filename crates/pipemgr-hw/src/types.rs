//! Memory types and physical addresses.
//!
//! A physical address names one sub-word of one line of one memory unit in a
//! stage. It packs into the 64-bit virtual address carried by instructions:
//!
//! ```text
//!  47    44 43      36 35   32 31      20 19          4 3       0
//! +--------+----------+-------+----------+-------------+---------+
//! |  pipe  |  stage   | type  |  mem id  |    line     | subword |
//! +--------+----------+-------+----------+-------------+---------+
//! ```

use pipemgr_types::StageId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw virtual address carried by instructions.
pub type RawVirtAddr = u64;

/// Kind of on-chip memory backing a table slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemType {
    /// Direct-indexed SRAM (action data, selector words).
    Sram,
    /// Ternary match memory. Stale entries keep matching until invalidated.
    Tcam,
}

impl MemType {
    const fn code(self) -> u64 {
        match self {
            MemType::Sram => 1,
            MemType::Tcam => 2,
        }
    }

    const fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(MemType::Sram),
            2 => Some(MemType::Tcam),
            _ => None,
        }
    }

    /// Returns true if a stale entry in this memory can still produce a
    /// match and must be invalidated explicitly.
    pub const fn needs_invalidate(self) -> bool {
        matches!(self, MemType::Tcam)
    }
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemType::Sram => write!(f, "sram"),
            MemType::Tcam => write!(f, "tcam"),
        }
    }
}

/// Physical location of one entry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysAddr {
    /// Pipe the address is resolved in (the target bitmap may broadcast it).
    pub pipe: u8,
    pub stage: StageId,
    pub mem_type: MemType,
    pub mem_id: u16,
    pub line: u16,
    pub subword: u8,
}

impl PhysAddr {
    const SUBWORD_BITS: u32 = 4;
    const LINE_SHIFT: u32 = 4;
    const MEM_ID_SHIFT: u32 = 20;
    const TYPE_SHIFT: u32 = 32;
    const STAGE_SHIFT: u32 = 36;
    const PIPE_SHIFT: u32 = 44;

    /// Packs the address into its virtual-address form.
    pub fn to_virt(&self) -> RawVirtAddr {
        (u64::from(self.pipe & 0xf) << Self::PIPE_SHIFT)
            | (u64::from(self.stage.get()) << Self::STAGE_SHIFT)
            | (self.mem_type.code() << Self::TYPE_SHIFT)
            | (u64::from(self.mem_id & 0xfff) << Self::MEM_ID_SHIFT)
            | (u64::from(self.line) << Self::LINE_SHIFT)
            | u64::from(self.subword & ((1 << Self::SUBWORD_BITS) - 1))
    }

    /// Unpacks a virtual address. Returns `None` for an unknown memory type.
    pub fn from_virt(raw: RawVirtAddr) -> Option<Self> {
        Some(PhysAddr {
            pipe: ((raw >> Self::PIPE_SHIFT) & 0xf) as u8,
            stage: StageId::new(((raw >> Self::STAGE_SHIFT) & 0xff) as u8),
            mem_type: MemType::from_code((raw >> Self::TYPE_SHIFT) & 0xf)?,
            mem_id: ((raw >> Self::MEM_ID_SHIFT) & 0xfff) as u16,
            line: ((raw >> Self::LINE_SHIFT) & 0xffff) as u16,
            subword: (raw & 0xf) as u8,
        })
    }

    /// Returns true if both addresses sit on the same memory line.
    pub fn same_line(&self, other: &PhysAddr) -> bool {
        self.stage == other.stage
            && self.mem_type == other.mem_type
            && self.mem_id == other.mem_id
            && self.line == other.line
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "p{}/s{}/{}{}:{}.{}",
            self.pipe,
            self.stage.get(),
            self.mem_type,
            self.mem_id,
            self.line,
            self.subword
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr() -> PhysAddr {
        PhysAddr {
            pipe: 1,
            stage: StageId::new(5),
            mem_type: MemType::Tcam,
            mem_id: 0x12,
            line: 300,
            subword: 0,
        }
    }

    #[test]
    fn test_virt_round_trip() {
        let a = addr();
        assert_eq!(PhysAddr::from_virt(a.to_virt()), Some(a));
    }

    #[test]
    fn test_virt_layout() {
        let a = addr();
        let raw = a.to_virt();
        assert_eq!(raw >> 44, 1);
        assert_eq!((raw >> 36) & 0xff, 5);
        assert_eq!((raw >> 32) & 0xf, 2);
        assert_eq!((raw >> 4) & 0xffff, 300);
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(PhysAddr::from_virt(0), None);
    }

    #[test]
    fn test_same_line() {
        let a = addr();
        let mut b = a;
        b.subword = 1;
        assert!(a.same_line(&b));
        b.line += 1;
        assert!(!a.same_line(&b));
    }

    #[test]
    fn test_needs_invalidate() {
        assert!(MemType::Tcam.needs_invalidate());
        assert!(!MemType::Sram.needs_invalidate());
    }
}
