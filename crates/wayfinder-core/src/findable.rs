//! Findable nodes and groups.
//!
//! A findable is anything a user can be routed to. Waypoints know their own
//! coordinates; NPC-linked nodes follow an entity owned by some other system
//! and resolve their position at query time.

use crate::geometry::Vec3;
use crate::ids::{GraphId, GroupId, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of NPC a linked node points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NpcRole {
    Quest,
    Trader,
}

impl fmt::Display for NpcRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quest => write!(f, "quest"),
            Self::Trader => write!(f, "trader"),
        }
    }
}

/// How a node's position is obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindableKind {
    /// Fixed coordinates stored with the node.
    Waypoint { position: Vec3 },
    /// Position of an external entity, looked up on demand.
    Npc { external_id: u32, role: NpcRole },
}

/// Answers "where is this external entity right now".
///
/// Implementations may fail for any reason (entity despawned, plugin not
/// loaded); `None` means the position is unavailable.
pub trait PositionSource {
    fn current_position(&self, external_id: u32) -> Option<Vec3>;
}

/// A position source that knows no external entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExternalPositions;

impl PositionSource for NoExternalPositions {
    fn current_position(&self, _external_id: u32) -> Option<Vec3> {
        None
    }
}

/// A node of a road map.
///
/// Adjacency is owned by the graph, not by the node, so it can never drift
/// from the edge set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Findable {
    pub id: NodeId,
    /// The graph this node belongs to. A plain id, not an owning reference.
    pub graph: GraphId,
    pub name: String,
    pub kind: FindableKind,
    pub group: Option<GroupId>,
    pub permission: Option<String>,
    /// Overrides the graph's default curve tension when set.
    pub curve_tension: Option<f64>,
}

impl Findable {
    /// Creates a waypoint node.
    pub fn waypoint(id: NodeId, graph: GraphId, name: impl Into<String>, position: Vec3) -> Self {
        Self {
            id,
            graph,
            name: name.into(),
            kind: FindableKind::Waypoint { position },
            group: None,
            permission: None,
            curve_tension: None,
        }
    }

    /// Creates a node linked to an external NPC.
    pub fn npc(
        id: NodeId,
        graph: GraphId,
        name: impl Into<String>,
        external_id: u32,
        role: NpcRole,
    ) -> Self {
        Self {
            id,
            graph,
            name: name.into(),
            kind: FindableKind::Npc { external_id, role },
            group: None,
            permission: None,
            curve_tension: None,
        }
    }

    /// Current position of this node, if it can be determined.
    pub fn resolve_position(&self, positions: &dyn PositionSource) -> Option<Vec3> {
        match &self.kind {
            FindableKind::Waypoint { position } => Some(*position),
            FindableKind::Npc { external_id, .. } => positions.current_position(*external_id),
        }
    }

    pub fn is_waypoint(&self) -> bool {
        matches!(self.kind, FindableKind::Waypoint { .. })
    }

    pub fn npc_role(&self) -> Option<NpcRole> {
        match &self.kind {
            FindableKind::Npc { role, .. } => Some(*role),
            FindableKind::Waypoint { .. } => None,
        }
    }

    /// The node's curve tension, falling back to `default`.
    pub fn tension_or(&self, default: f64) -> f64 {
        self.curve_tension.unwrap_or(default)
    }
}

/// A named set of nodes sharing discovery rules.
///
/// Membership is not stored here: a node belongs to a group when its `group`
/// field points at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub graph: GraphId,
    pub name: String,
    pub discoverable: bool,
}

/// Something a user can discover on a discovery-gated graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Marker {
    Node(GraphId, NodeId),
    Group(GraphId, GroupId),
}

impl Marker {
    pub fn graph(&self) -> GraphId {
        match self {
            Self::Node(graph, _) | Self::Group(graph, _) => *graph,
        }
    }
}
