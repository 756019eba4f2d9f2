//! Plain numeric identifiers.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $repr:ty, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $repr);

        impl $name {
            /// Creates the identifier from its raw value.
            pub const fn new(raw: $repr) -> Self {
                Self(raw)
            }

            /// Returns the raw value.
            pub const fn get(&self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let digits = s.strip_prefix($prefix).unwrap_or(s);
                digits
                    .parse::<$repr>()
                    .map($name)
                    .map_err(|_| ParseError::InvalidId(s.to_string()))
            }
        }

        impl From<$repr> for $name {
            fn from(raw: $repr) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for $repr {
            fn from(id: $name) -> $repr {
                id.0
            }
        }
    };
}

define_id!(
    /// Device (ASIC) identifier.
    DevId, u16, "dev"
);
define_id!(
    /// Pipeline stage number.
    StageId, u8, "stage"
);
define_id!(
    /// Entry position inside one stage's slice of a table.
    StageIndex, u32, "idx"
);
define_id!(
    /// Table handle, unique per device.
    TableHandle, u32, "tbl"
);
define_id!(
    /// Caller-visible member id (action profile member, rule priority key).
    MemberId, u32, "mbr"
);
define_id!(
    /// Stage lock id used by lock/unlock instruction pairs.
    LockId, u16, "lock"
);

impl StageIndex {
    /// Returns the index `n` positions after this one.
    pub const fn offset(&self, n: u32) -> Self {
        Self(self.0 + n)
    }
}
