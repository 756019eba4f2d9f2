//! Decoded entry payload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of resource attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Counter,
    Meter,
    Stateful,
    Selector,
    IdleTime,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Counter => "counter",
            ResourceKind::Meter => "meter",
            ResourceKind::Stateful => "stateful",
            ResourceKind::Selector => "selector",
            ResourceKind::IdleTime => "idle_time",
        };
        write!(f, "{}", s)
    }
}

/// A resource reference carried in an entry payload.
///
/// Indirect resources carry their own index into the resource table. Direct
/// resources have no index: they live at the entry's own location and move
/// with it during a relocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub index: Option<u32>,
}

impl ResourceSpec {
    /// A directly addressed resource.
    pub fn direct(kind: ResourceKind) -> Self {
        Self { kind, index: None }
    }

    /// An indirectly addressed resource.
    pub fn indirect(kind: ResourceKind, index: u32) -> Self {
        Self {
            kind,
            index: Some(index),
        }
    }

    /// Returns true if the resource is addressed by the entry location.
    pub fn is_direct(&self) -> bool {
        self.index.is_none()
    }
}

/// Decoded action and resource payload of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntryData {
    /// Action function handle.
    pub action_fn: u32,
    /// Action parameters, already laid out by the caller.
    pub action_data: Vec<u8>,
    /// Attached resources.
    pub resources: Vec<ResourceSpec>,
}

impl EntryData {
    /// Creates a payload with no resources.
    pub fn new(action_fn: u32, action_data: impl Into<Vec<u8>>) -> Self {
        Self {
            action_fn,
            action_data: action_data.into(),
            resources: Vec::new(),
        }
    }

    /// Adds a resource reference.
    pub fn with_resource(mut self, resource: ResourceSpec) -> Self {
        self.resources.push(resource);
        self
    }

    /// Iterates the directly addressed resources.
    pub fn direct_resources(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.resources.iter().filter(|r| r.is_direct())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_resources() {
        let data = EntryData::new(3, vec![1, 2])
            .with_resource(ResourceSpec::direct(ResourceKind::Counter))
            .with_resource(ResourceSpec::indirect(ResourceKind::Meter, 9))
            .with_resource(ResourceSpec::direct(ResourceKind::IdleTime));

        let kinds: Vec<ResourceKind> = data.direct_resources().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ResourceKind::Counter, ResourceKind::IdleTime]);
    }

    #[test]
    fn test_equality_includes_resources() {
        let a = EntryData::new(1, vec![0xaa]);
        let b = a.clone().with_resource(ResourceSpec::indirect(ResourceKind::Stateful, 1));
        assert_ne!(a, b);
    }
}
