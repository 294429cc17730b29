//! Edge keys and change descriptions for the road map.
//!
//! Edges are undirected, so a key always stores the smaller id first. Every
//! structural mutation of a road map reports what it did as a
//! [`GraphChange`], which is how live edit sessions and persistence learn
//! about it.

use serde::{Deserialize, Serialize};
use std::fmt;
use wayfinder_core::{Findable, Group, GroupId, NodeId};

/// An unordered pair of node ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey(NodeId, NodeId);

impl EdgeKey {
    /// Creates a key; argument order does not matter.
    pub fn new(a: NodeId, b: NodeId) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub fn first(&self) -> NodeId {
        self.0
    }

    pub fn second(&self) -> NodeId {
        self.1
    }

    pub fn touches(&self, node: NodeId) -> bool {
        self.0 == node || self.1 == node
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} <-> #{}", self.0, self.1)
    }
}

/// What a successful mutation changed.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphChange {
    NodeAdded(NodeId),
    /// Name, position, group, permission or tension changed.
    NodeUpdated(NodeId),
    /// The node and every edge that touched it are gone.
    NodeRemoved {
        node: Findable,
        edges: Vec<EdgeKey>,
    },
    EdgeAdded(EdgeKey),
    EdgeRemoved(EdgeKey),
    GroupAdded(GroupId),
    GroupUpdated(GroupId),
    /// The group is gone and its former members are ungrouped.
    GroupRemoved {
        group: Group,
        members: Vec<NodeId>,
    },
}

impl GraphChange {
    /// True when the set of nodes or edges changed.
    pub fn is_topological(&self) -> bool {
        matches!(
            self,
            Self::NodeAdded(_) | Self::NodeRemoved { .. } | Self::EdgeAdded(_) | Self::EdgeRemoved(_)
        )
    }
}
