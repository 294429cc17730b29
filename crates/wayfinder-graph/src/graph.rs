//! The road map: nodes, undirected edges and groups of one navigable area.
//!
//! Nodes and groups live in ordered maps so that iteration order, and with
//! it route search tie-breaking, is stable. Edges live in a petgraph
//! `UnGraphMap`, which makes the edge set symmetric by construction and
//! makes a node's adjacency exactly the set of edges touching it.

use crate::edge::{EdgeKey, GraphChange};
use crate::search::GraphSnapshot;
use petgraph::graphmap::UnGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use wayfinder_core::{
    Findable, FindableKind, GraphId, Group, GroupId, Marker, NodeId, NpcRole, PositionSource,
    StyleId, Vec3,
};

/// Rejected road map operations. The graph is unchanged when one is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("a node named \"{0}\" already exists")]
    DuplicateNodeName(String),
    #[error("a group named \"{0}\" already exists")]
    DuplicateGroupName(String),
    #[error("cannot connect node #{0} to itself")]
    SelfLoop(NodeId),
    #[error("unknown node #{0}")]
    UnknownNode(NodeId),
    #[error("unknown group #{0}")]
    UnknownGroup(GroupId),
    #[error("node #{0} follows an external entity and cannot be moved")]
    NotAWaypoint(NodeId),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: f64 },
}

/// Mutable properties of a road map, persisted as one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadMapSettings {
    pub name: String,
    /// The world or zone the road map lies in.
    pub zone: String,
    /// When set, users only see nodes they have discovered.
    pub discovery_gated: bool,
    /// How close a user must get to a node for it to count as reached.
    pub arrival_distance: f64,
    /// Curve tension for nodes without an override.
    pub default_tension: f64,
    pub path_style: StyleId,
    pub edit_style: StyleId,
}

/// A named navigable graph.
#[derive(Debug, Clone)]
pub struct RoadMap {
    id: GraphId,
    settings: RoadMapSettings,
    nodes: BTreeMap<NodeId, Findable>,
    edges: UnGraphMap<NodeId, ()>,
    groups: BTreeMap<GroupId, Group>,
    next_node: u32,
    next_group: u32,
}

impl RoadMap {
    /// Creates an empty road map.
    pub fn new(id: GraphId, settings: RoadMapSettings) -> Self {
        Self {
            id,
            settings,
            nodes: BTreeMap::new(),
            edges: UnGraphMap::new(),
            groups: BTreeMap::new(),
            next_node: 1,
            next_group: 1,
        }
    }

    /// Rebuilds a road map from stored parts.
    ///
    /// Edges naming a missing node are dropped, as are node group
    /// references to missing groups.
    pub fn restore(
        id: GraphId,
        settings: RoadMapSettings,
        nodes: Vec<Findable>,
        groups: Vec<Group>,
        edges: Vec<EdgeKey>,
    ) -> Self {
        let mut map = Self::new(id, settings);
        for group in groups {
            map.next_group = map.next_group.max(group.id.0 + 1);
            map.groups.insert(group.id, group);
        }
        for mut node in nodes {
            if node.group.is_some_and(|g| !map.groups.contains_key(&g)) {
                node.group = None;
            }
            node.graph = id;
            map.next_node = map.next_node.max(node.id.0 + 1);
            map.edges.add_node(node.id);
            map.nodes.insert(node.id, node);
        }
        for edge in edges {
            let (a, b) = (edge.first(), edge.second());
            if a != b && map.nodes.contains_key(&a) && map.nodes.contains_key(&b) {
                map.edges.add_edge(a, b, ());
            }
        }
        map
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn settings(&self) -> &RoadMapSettings {
        &self.settings
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    // ─────────────────────────────────────────────────────────────────────
    // Settings
    // ─────────────────────────────────────────────────────────────────────

    /// Renames the road map. Uniqueness across road maps is the caller's
    /// business since a single map cannot see the others.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.settings.name = name.into();
    }

    pub fn set_zone(&mut self, zone: impl Into<String>) {
        self.settings.zone = zone.into();
    }

    pub fn set_discovery_gated(&mut self, gated: bool) {
        self.settings.discovery_gated = gated;
    }

    pub fn set_arrival_distance(&mut self, distance: f64) -> Result<(), GraphError> {
        if !distance.is_finite() || distance <= 0.0 {
            return Err(GraphError::InvalidValue {
                field: "arrival distance",
                value: distance,
            });
        }
        self.settings.arrival_distance = distance;
        Ok(())
    }

    pub fn set_default_tension(&mut self, tension: f64) -> Result<(), GraphError> {
        check_tension(tension)?;
        self.settings.default_tension = tension;
        Ok(())
    }

    pub fn set_path_style(&mut self, style: StyleId) {
        self.settings.path_style = style;
    }

    pub fn set_edit_style(&mut self, style: StyleId) {
        self.settings.edit_style = style;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lookups
    // ─────────────────────────────────────────────────────────────────────

    pub fn node(&self, id: NodeId) -> Option<&Findable> {
        self.nodes.get(&id)
    }

    /// Finds a node by name, ignoring case.
    pub fn node_by_name(&self, name: &str) -> Option<&Findable> {
        self.nodes.values().find(|n| n.name.eq_ignore_ascii_case(name))
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    /// Finds a group by name, ignoring case.
    pub fn group_by_name(&self, name: &str) -> Option<&Group> {
        self.groups.values().find(|g| g.name.eq_ignore_ascii_case(name))
    }

    /// The group a node belongs to, if any.
    pub fn group_of(&self, node: &Findable) -> Option<&Group> {
        node.group.and_then(|g| self.groups.get(&g))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Findable> {
        self.nodes.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// All unique edges in ascending key order.
    pub fn edges(&self) -> Vec<EdgeKey> {
        let mut keys: Vec<EdgeKey> = self
            .edges
            .all_edges()
            .map(|(a, b, _)| EdgeKey::new(a, b))
            .collect();
        keys.sort();
        keys
    }

    /// Ids of the nodes connected to `id`, ascending.
    pub fn neighbors(&self, id: NodeId) -> Vec<NodeId> {
        if !self.edges.contains_node(id) {
            return Vec::new();
        }
        let mut ids: Vec<NodeId> = self.edges.neighbors(id).collect();
        ids.sort();
        ids
    }

    /// Edges touching `id`, ascending.
    pub fn edges_of(&self, id: NodeId) -> Vec<EdgeKey> {
        self.neighbors(id)
            .into_iter()
            .map(|other| EdgeKey::new(id, other))
            .collect()
    }

    pub fn has_edge(&self, a: NodeId, b: NodeId) -> bool {
        self.edges.contains_edge(a, b)
    }

    /// Nodes pointing at `group`.
    pub fn members(&self, group: GroupId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.group == Some(group))
            .map(|n| n.id)
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.edge_count()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn is_node_name_unique(&self, name: &str) -> bool {
        self.node_by_name(name).is_none()
    }

    pub fn is_group_name_unique(&self, name: &str) -> bool {
        self.group_by_name(name).is_none()
    }

    /// Whether some node already follows the given external entity.
    pub fn is_npc_linked(&self, external_id: u32) -> bool {
        self.nodes.values().any(|n| {
            matches!(n.kind, FindableKind::Npc { external_id: linked, .. } if linked == external_id)
        })
    }

    /// Finds an NPC-linked node of the given role by name, ignoring case.
    pub fn find_by_role(&self, role: NpcRole, name: &str) -> Option<&Findable> {
        self.nodes
            .values()
            .find(|n| n.npc_role() == Some(role) && n.name.eq_ignore_ascii_case(name))
    }

    /// Whether every node of `route` exists and each consecutive pair is
    /// still connected.
    pub fn route_intact(&self, route: &[NodeId]) -> bool {
        route.iter().all(|id| self.nodes.contains_key(id))
            && route.windows(2).all(|w| self.has_edge(w[0], w[1]))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Discovery
    // ─────────────────────────────────────────────────────────────────────

    /// The marker that reaching `node` discovers: its group when the group
    /// is discoverable, otherwise the node itself.
    pub fn discovery_marker(&self, node: &Findable) -> Marker {
        match self.group_of(node) {
            Some(group) if group.discoverable => Marker::Group(self.id, group.id),
            _ => Marker::Node(self.id, node.id),
        }
    }

    /// Whether the discovered set covers `node`.
    pub fn has_discovered(&self, discovered: &BTreeSet<Marker>, node: &Findable) -> bool {
        discovered.contains(&Marker::Node(self.id, node.id))
            || discovered.contains(&self.discovery_marker(node))
    }

    /// Nodes a user may see and route to.
    ///
    /// On an ungated road map this is every node. On a gated one a node is
    /// listed when its group is not discoverable or the user discovered it,
    /// and the user must hold the node's permission tag if it has one.
    pub fn visible_nodes<F>(&self, discovered: &BTreeSet<Marker>, has_permission: F) -> Vec<&Findable>
    where
        F: Fn(&str) -> bool,
    {
        if !self.settings.discovery_gated {
            return self.nodes.values().collect();
        }
        self.nodes
            .values()
            .filter(|node| {
                let always_shown = self.group_of(node).is_some_and(|g| !g.discoverable);
                always_shown || self.has_discovered(discovered, node)
            })
            .filter(|node| node.permission.as_deref().map_or(true, &has_permission))
            .collect()
    }

    /// Upper bound for discovery progress: every member of a discoverable
    /// group plus every ungrouped node.
    ///
    /// Members of a discoverable group all count, even though reaching any
    /// one of them reveals the whole group.
    pub fn max_discoverable_count(&self) -> usize {
        let grouped: usize = self
            .groups
            .values()
            .filter(|g| g.discoverable)
            .map(|g| self.members(g.id).len())
            .sum();
        let ungrouped = self.nodes.values().filter(|n| n.group.is_none()).count();
        grouped + ungrouped
    }

    /// Names of the discoverable groups and ungrouped waypoints the user has
    /// found, in id order.
    pub fn discovered_locations(&self, discovered: &BTreeSet<Marker>) -> Vec<String> {
        let groups = self
            .groups
            .values()
            .filter(|g| g.discoverable && discovered.contains(&Marker::Group(self.id, g.id)))
            .map(|g| g.name.clone());
        let nodes = self
            .nodes
            .values()
            .filter(|n| n.group.is_none() && n.is_waypoint())
            .filter(|n| discovered.contains(&Marker::Node(self.id, n.id)))
            .map(|n| n.name.clone());
        groups.chain(nodes).collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Node mutations
    // ─────────────────────────────────────────────────────────────────────

    /// Adds a waypoint at fixed coordinates.
    pub fn add_waypoint(&mut self, name: &str, position: Vec3) -> Result<NodeId, GraphError> {
        let id = self.claim_node_name(name)?;
        self.insert_node(Findable::waypoint(id, self.id, name, position));
        Ok(id)
    }

    /// Adds a node following an external NPC.
    pub fn add_npc(
        &mut self,
        name: &str,
        external_id: u32,
        role: NpcRole,
    ) -> Result<NodeId, GraphError> {
        let id = self.claim_node_name(name)?;
        self.insert_node(Findable::npc(id, self.id, name, external_id, role));
        Ok(id)
    }

    fn claim_node_name(&mut self, name: &str) -> Result<NodeId, GraphError> {
        if !self.is_node_name_unique(name) {
            return Err(GraphError::DuplicateNodeName(name.to_string()));
        }
        let id = NodeId(self.next_node);
        self.next_node += 1;
        Ok(id)
    }

    fn insert_node(&mut self, node: Findable) {
        self.edges.add_node(node.id);
        self.nodes.insert(node.id, node);
    }

    /// Removes a node together with every edge touching it.
    pub fn remove_node(&mut self, id: NodeId) -> Result<GraphChange, GraphError> {
        let edges = self.edges_of(id);
        let node = self.nodes.remove(&id).ok_or(GraphError::UnknownNode(id))?;
        self.edges.remove_node(id);
        Ok(GraphChange::NodeRemoved { node, edges })
    }

    pub fn rename_node(&mut self, id: NodeId, name: &str) -> Result<GraphChange, GraphError> {
        if let Some(existing) = self.node_by_name(name) {
            if existing.id != id {
                return Err(GraphError::DuplicateNodeName(name.to_string()));
            }
        }
        self.node_mut(id)?.name = name.to_string();
        Ok(GraphChange::NodeUpdated(id))
    }

    /// Moves a waypoint. NPC-linked nodes have no stored position.
    pub fn move_node(&mut self, id: NodeId, to: Vec3) -> Result<GraphChange, GraphError> {
        let node = self.node_mut(id)?;
        match &mut node.kind {
            FindableKind::Waypoint { position } => *position = to,
            FindableKind::Npc { .. } => return Err(GraphError::NotAWaypoint(id)),
        }
        Ok(GraphChange::NodeUpdated(id))
    }

    pub fn set_node_group(
        &mut self,
        id: NodeId,
        group: Option<GroupId>,
    ) -> Result<GraphChange, GraphError> {
        if let Some(g) = group {
            if !self.groups.contains_key(&g) {
                return Err(GraphError::UnknownGroup(g));
            }
        }
        self.node_mut(id)?.group = group;
        Ok(GraphChange::NodeUpdated(id))
    }

    pub fn set_node_permission(
        &mut self,
        id: NodeId,
        permission: Option<String>,
    ) -> Result<GraphChange, GraphError> {
        self.node_mut(id)?.permission = permission;
        Ok(GraphChange::NodeUpdated(id))
    }

    pub fn set_node_tension(
        &mut self,
        id: NodeId,
        tension: Option<f64>,
    ) -> Result<GraphChange, GraphError> {
        if let Some(t) = tension {
            check_tension(t)?;
        }
        self.node_mut(id)?.curve_tension = tension;
        Ok(GraphChange::NodeUpdated(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Findable, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Edge mutations
    // ─────────────────────────────────────────────────────────────────────

    /// Connects two nodes. Returns `Ok(None)` when they already are.
    pub fn connect(&mut self, a: NodeId, b: NodeId) -> Result<Option<GraphChange>, GraphError> {
        self.check_pair(a, b)?;
        if self.edges.contains_edge(a, b) {
            return Ok(None);
        }
        self.edges.add_edge(a, b, ());
        Ok(Some(GraphChange::EdgeAdded(EdgeKey::new(a, b))))
    }

    /// Disconnects two nodes. Returns `Ok(None)` when there was no edge.
    pub fn disconnect(&mut self, a: NodeId, b: NodeId) -> Result<Option<GraphChange>, GraphError> {
        self.check_pair(a, b)?;
        if self.edges.remove_edge(a, b).is_none() {
            return Ok(None);
        }
        Ok(Some(GraphChange::EdgeRemoved(EdgeKey::new(a, b))))
    }

    fn check_pair(&self, a: NodeId, b: NodeId) -> Result<(), GraphError> {
        if a == b {
            return Err(GraphError::SelfLoop(a));
        }
        for id in [a, b] {
            if !self.nodes.contains_key(&id) {
                return Err(GraphError::UnknownNode(id));
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Group mutations
    // ─────────────────────────────────────────────────────────────────────

    pub fn add_group(&mut self, name: &str, discoverable: bool) -> Result<GroupId, GraphError> {
        if !self.is_group_name_unique(name) {
            return Err(GraphError::DuplicateGroupName(name.to_string()));
        }
        let id = GroupId(self.next_group);
        self.next_group += 1;
        self.groups.insert(
            id,
            Group {
                id,
                graph: self.id,
                name: name.to_string(),
                discoverable,
            },
        );
        Ok(id)
    }

    pub fn rename_group(&mut self, id: GroupId, name: &str) -> Result<GraphChange, GraphError> {
        if let Some(existing) = self.group_by_name(name) {
            if existing.id != id {
                return Err(GraphError::DuplicateGroupName(name.to_string()));
            }
        }
        self.group_mut(id)?.name = name.to_string();
        Ok(GraphChange::GroupUpdated(id))
    }

    pub fn set_group_discoverable(
        &mut self,
        id: GroupId,
        discoverable: bool,
    ) -> Result<GraphChange, GraphError> {
        self.group_mut(id)?.discoverable = discoverable;
        Ok(GraphChange::GroupUpdated(id))
    }

    /// Deletes a group. Its members stay in the graph, ungrouped.
    pub fn remove_group(&mut self, id: GroupId) -> Result<GraphChange, GraphError> {
        let group = self.groups.remove(&id).ok_or(GraphError::UnknownGroup(id))?;
        let mut members = Vec::new();
        for node in self.nodes.values_mut() {
            if node.group == Some(id) {
                node.group = None;
                members.push(node.id);
            }
        }
        Ok(GraphChange::GroupRemoved { group, members })
    }

    fn group_mut(&mut self, id: GroupId) -> Result<&mut Group, GraphError> {
        self.groups.get_mut(&id).ok_or(GraphError::UnknownGroup(id))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Search support
    // ─────────────────────────────────────────────────────────────────────

    /// Copies positions and adjacency for a search running elsewhere.
    ///
    /// Nodes whose position cannot be resolved right now are left out.
    pub fn snapshot(&self, positions: &dyn PositionSource) -> GraphSnapshot {
        let mut snapshot = GraphSnapshot::default();
        for node in self.nodes.values() {
            if let Some(pos) = node.resolve_position(positions) {
                snapshot.insert_node(node.id, pos);
            }
        }
        for key in self.edges() {
            snapshot.insert_edge(key.first(), key.second());
        }
        snapshot
    }

    /// The counter used for the next node id; stored so ids are never reused.
    pub fn next_ids(&self) -> (u32, u32) {
        (self.next_node, self.next_group)
    }

    /// Restores id counters after [`RoadMap::restore`].
    pub fn reserve_ids(&mut self, next_node: u32, next_group: u32) {
        self.next_node = self.next_node.max(next_node);
        self.next_group = self.next_group.max(next_group);
    }
}

fn check_tension(tension: f64) -> Result<(), GraphError> {
    if !tension.is_finite() || tension < 0.0 {
        return Err(GraphError::InvalidValue {
            field: "curve tension",
            value: tension,
        });
    }
    Ok(())
}
