//! Move-lists.
//!
//! A move-list is the complete, ordered effect of one API call. The HLP
//! builds it before any hardware write; the LLP consumes it (by value) to
//! update the hardware shadow and program the device.

use pipemgr_hw::{EntryData, PipeError};
use pipemgr_types::{EntryHandle, MemberId, PipeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum MoveOp {
    Add { member: MemberId, data: EntryData },
    Modify { data: EntryData, prior: EntryData },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveNode {
    pub handle: EntryHandle,
    pub pipe: Option<PipeId>,
    #[serde(flatten)]
    pub op: MoveOp,
}

impl MoveNode {
    pub fn add(handle: EntryHandle, pipe: Option<PipeId>, member: MemberId, data: EntryData) -> Self {
        Self {
            handle,
            pipe,
            op: MoveOp::Add { member, data },
        }
    }

    pub fn modify(handle: EntryHandle, pipe: Option<PipeId>, data: EntryData, prior: EntryData) -> Self {
        Self {
            handle,
            pipe,
            op: MoveOp::Modify { data, prior },
        }
    }

    pub fn delete(handle: EntryHandle, pipe: Option<PipeId>) -> Self {
        Self {
            handle,
            pipe,
            op: MoveOp::Delete,
        }
    }
}

impl fmt::Display for MoveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            MoveOp::Add { .. } => "add",
            MoveOp::Modify { .. } => "modify",
            MoveOp::Delete => "delete",
        };
        write!(f, "{} {}", op, self.handle)
    }
}

/// Ordered list of move nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MoveList {
    nodes: Vec<MoveNode>,
}

impl MoveList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: MoveNode) {
        self.nodes.push(node);
    }

    /// Appends every node of `other`, keeping order.
    pub fn append(&mut self, other: MoveList) {
        self.nodes.extend(other.nodes);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MoveNode> {
        self.nodes.iter()
    }
}

impl From<MoveNode> for MoveList {
    fn from(node: MoveNode) -> Self {
        Self { nodes: vec![node] }
    }
}

impl FromIterator<MoveNode> for MoveList {
    fn from_iter<I: IntoIterator<Item = MoveNode>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for MoveList {
    type Item = MoveNode;
    type IntoIter = std::vec::IntoIter<MoveNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

/// A move-list stopped at its first failing node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("move-list stopped after {processed} node(s): {source}")]
pub struct MoveListError {
    /// Nodes applied before the failure.
    pub processed: usize,
    pub source: PipeError,
}

impl From<MoveListError> for PipeError {
    fn from(err: MoveListError) -> Self {
        err.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hdl(id: u32) -> EntryHandle {
        EntryHandle::new(None, id).unwrap()
    }

    #[test]
    fn test_order_is_kept() {
        let mut list = MoveList::new();
        list.push(MoveNode::add(hdl(1), None, MemberId::new(1), EntryData::default()));
        list.push(MoveNode::delete(hdl(2), None));
        list.append(MoveList::from(MoveNode::delete(hdl(3), None)));

        let handles: Vec<u32> = list.iter().map(|n| n.handle.id()).collect();
        assert_eq!(handles, vec![1, 2, 3]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_display() {
        let node = MoveNode::modify(hdl(0x10), None, EntryData::default(), EntryData::default());
        assert_eq!(node.to_string(), "modify 0x10");
    }

    #[test]
    fn test_json_shape() {
        let node = MoveNode::delete(hdl(7), None);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["op"], "delete");
        assert_eq!(json["handle"], 7);
    }

    #[test]
    fn test_error_converts_to_source() {
        let err = MoveListError {
            processed: 2,
            source: PipeError::not_found("entry 0x3"),
        };
        assert!(err.to_string().contains("after 2 node(s)"));
        assert_eq!(PipeError::from(err), PipeError::not_found("entry 0x3"));
    }
}
