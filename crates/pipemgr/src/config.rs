//! Device profile.
//!
//! A profile describes the tables the entry manager serves and how each
//! table's memory is laid out per stage. Profiles are normally loaded from
//! YAML:
//!
//! ```yaml
//! dev_id: 0
//! num_pipes: 4
//! instr_buffer_bytes: 4096
//! drain_noops: 2
//! tables:
//!   - handle: 16
//!     name: acl_tcam
//!     kind: tcam
//!     symmetric: true
//!     max_entries: 512
//!     direct_resources: true
//!     stages:
//!       - stage: 2
//!         mem_type: tcam
//!         mem_ids: [0, 1]
//!         ram_depth: 512
//! ```

use pipemgr_hw::{MemType, PipeError, PipeResult};
use pipemgr_types::{DevId, PipeId, StageId, TableHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// Largest RAM depth a physical address line can express.
pub const MAX_RAM_DEPTH: u32 = 1 << 16;

/// Largest number of sub-words a physical address can express.
pub const MAX_ENTRIES_PER_WORD: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Action-data table (SRAM, direct-indexed).
    ActionData,
    /// Ternary match table.
    Tcam,
}

impl TableKind {
    pub fn mem_type(self) -> MemType {
        match self {
            TableKind::ActionData => MemType::Sram,
            TableKind::Tcam => MemType::Tcam,
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::ActionData => write!(f, "action_data"),
            TableKind::Tcam => write!(f, "tcam"),
        }
    }
}

/// Memory layout of a table in one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageProfile {
    pub stage: StageId,
    pub mem_type: MemType,
    pub mem_ids: Vec<u16>,
    pub ram_depth: u32,
    pub entries_per_word: u32,
    /// Memories per entry.
    pub entry_width: u32,
    /// Stage indices per entry; a power of two.
    pub entry_span: u32,
}

impl Default for StageProfile {
    fn default() -> Self {
        Self {
            stage: StageId::new(0),
            mem_type: MemType::Sram,
            mem_ids: vec![0],
            ram_depth: 1024,
            entries_per_word: 1,
            entry_width: 1,
            entry_span: 1,
        }
    }
}

impl StageProfile {
    /// Number of stage indices.
    pub fn capacity(&self) -> u32 {
        let rams = (self.mem_ids.len() as u32) / self.entry_width.max(1);
        rams.saturating_mul(self.ram_depth)
            .saturating_mul(self.entries_per_word)
    }

    pub fn validate(&self) -> PipeResult<()> {
        let err = |msg: String| Err(PipeError::invalid_argument(format!("{}: {}", self.stage, msg)));
        if self.mem_ids.is_empty() {
            return err("no memories".to_string());
        }
        if self.entry_width == 0 || self.mem_ids.len() as u32 % self.entry_width != 0 {
            return err(format!(
                "{} memories do not divide into entries of width {}",
                self.mem_ids.len(),
                self.entry_width
            ));
        }
        if self.ram_depth == 0 || self.ram_depth > MAX_RAM_DEPTH {
            return err(format!("ram_depth {} out of range", self.ram_depth));
        }
        if self.entries_per_word == 0 || self.entries_per_word > MAX_ENTRIES_PER_WORD {
            return err(format!("entries_per_word {} out of range", self.entries_per_word));
        }
        if !self.entry_span.is_power_of_two() {
            return err(format!("entry_span {} is not a power of two", self.entry_span));
        }
        if self.entry_span > self.capacity() {
            return err(format!(
                "entry_span {} exceeds capacity {}",
                self.entry_span,
                self.capacity()
            ));
        }
        Ok(())
    }
}

/// One match or action-data table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableProfile {
    pub handle: TableHandle,
    pub name: String,
    pub kind: TableKind,
    /// One instance for all pipes when true, one per pipe otherwise.
    pub symmetric: bool,
    /// Size of each instance's handle space.
    pub max_entries: u32,
    /// A directly-addressed resource table shares this table's stages.
    pub direct_resources: bool,
    pub stages: Vec<StageProfile>,
}

impl Default for TableProfile {
    fn default() -> Self {
        Self {
            handle: TableHandle::new(1),
            name: String::new(),
            kind: TableKind::ActionData,
            symmetric: true,
            max_entries: 1024,
            direct_resources: false,
            stages: Vec::new(),
        }
    }
}

impl TableProfile {
    pub fn stage(&self, stage: StageId) -> Option<&StageProfile> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn validate(&self) -> PipeResult<()> {
        let err = |msg: String| {
            Err(PipeError::invalid_argument(format!(
                "table {} ({}): {}",
                self.handle, self.name, msg
            )))
        };
        if self.max_entries == 0 {
            return err("max_entries is zero".to_string());
        }
        if self.stages.is_empty() {
            return err("no stages".to_string());
        }
        let mut seen = BTreeSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.stage) {
                return err(format!("{} listed twice", stage.stage));
            }
            if stage.mem_type != self.kind.mem_type() {
                return err(format!(
                    "{} uses {} memory for a {} table",
                    stage.stage, stage.mem_type, self.kind
                ));
            }
            stage.validate()?;
        }
        Ok(())
    }
}

/// Device-wide settings and table list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub dev_id: DevId,
    pub num_pipes: u8,
    /// Outbound instruction buffer size; relocation chains are split to fit.
    pub instr_buffer_bytes: usize,
    /// No-ops posted after a source invalidation before the index is reused.
    pub drain_noops: u32,
    pub tables: Vec<TableProfile>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            dev_id: DevId::new(0),
            num_pipes: 4,
            instr_buffer_bytes: 16 * 1024,
            drain_noops: 4,
            tables: Vec::new(),
        }
    }
}

impl DeviceProfile {
    pub fn from_yaml_str(text: &str) -> PipeResult<Self> {
        let profile: DeviceProfile = serde_yaml::from_str(text)
            .map_err(|e| PipeError::invalid_argument(format!("device profile: {}", e)))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PipeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipeError::invalid_argument(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn table(&self, handle: TableHandle) -> Option<&TableProfile> {
        self.tables.iter().find(|t| t.handle == handle)
    }

    pub fn validate(&self) -> PipeResult<()> {
        if self.num_pipes == 0 || self.num_pipes > PipeId::MAX_PIPES {
            return Err(PipeError::invalid_argument(format!(
                "num_pipes {} out of range 1..={}",
                self.num_pipes,
                PipeId::MAX_PIPES
            )));
        }
        if self.instr_buffer_bytes == 0 {
            return Err(PipeError::invalid_argument("instr_buffer_bytes is zero"));
        }
        let mut seen = BTreeSet::new();
        for table in &self.tables {
            if !seen.insert(table.handle) {
                return Err(PipeError::invalid_argument(format!(
                    "table {} listed twice",
                    table.handle
                )));
            }
            table.validate()?;
        }
        Ok(())
    }
}
