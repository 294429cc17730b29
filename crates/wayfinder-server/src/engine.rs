//! The authoritative engine.
//!
//! One `Engine` owns every road map, user, style and session. All state
//! changes happen on the task that owns it, one tick at a time. Route
//! searches and storage writes run elsewhere: searches come back through
//! the [`Dispatcher`] and are applied at the next tick, writes are fire and
//! forget.

use crate::collab::{Collaborators, Notice};
use crate::config::{EditStyleDef, EngineConfig, PathStyleDef};
use crate::dispatch::{Dispatcher, Ticket};
use crate::edit::{EditContext, EditSessions};
use crate::follower::{FollowContext, FollowEvent, PathSession, SessionState};
use crate::persistence::{PersistOp, Persistence};
use crate::registry::GraphRegistry;
use crate::style::{
    EditField, EditStyle, EditStyleChange, PathStyle, PathStyleChange, StyleError, StyleEvent,
    StyleRegistry,
};
use crate::users::UserRegistry;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use wayfinder_core::{
    Findable, GraphId, GroupId, Marker, NodeId, NpcRole, StyleId, UserId, Vec3,
};
use wayfinder_graph::{
    find_route, GraphChange, GraphError, GraphRecord, RoadMap, RoadMapSettings, RouteOutcome,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Style(#[from] StyleError),
    #[error("unknown road map #{0}")]
    UnknownGraph(GraphId),
    #[error("a road map named \"{0}\" already exists")]
    DuplicateGraphName(String),
    #[error("unknown user {0}")]
    UnknownUser(UserId),
    #[error("user {0} is not online")]
    Offline(UserId),
    #[error("node #{0} is not visible to this user")]
    NotVisible(NodeId),
}

/// A finished route search, waiting to be applied.
#[derive(Debug)]
struct RouteJob {
    user: UserId,
    graph: GraphId,
    target: NodeId,
    outcome: RouteOutcome,
}

pub struct Engine {
    config: EngineConfig,
    graphs: GraphRegistry,
    users: UserRegistry,
    styles: StyleRegistry,
    edits: EditSessions,
    collab: Collaborators,
    routes: Dispatcher<RouteJob>,
    /// Latest search per (user, graph); older results are dropped.
    pending_routes: BTreeMap<(UserId, GraphId), Ticket>,
    persistence: Persistence,
    style_tx: UnboundedSender<StyleEvent>,
    style_rx: UnboundedReceiver<StyleEvent>,
    ticks: u64,
}

fn path_style_of<'a>(styles: &'a StyleRegistry, map: &RoadMap) -> Option<&'a PathStyle> {
    styles
        .path(map.settings().path_style)
        .or_else(|| styles.path(styles.default_path_style()))
}

fn edit_style_of<'a>(styles: &'a StyleRegistry, map: &RoadMap) -> Option<&'a EditStyle> {
    styles
        .edit(map.settings().edit_style)
        .or_else(|| styles.edit(styles.default_edit_style()))
}

fn edit_context<'a>(
    map: &'a RoadMap,
    style: &'a EditStyle,
    collab: &'a mut Collaborators,
    view_distance: f64,
) -> EditContext<'a> {
    EditContext {
        map,
        style,
        positions: &*collab.positions,
        presence: &*collab.presence,
        renderer: &mut *collab.renderer,
        view_distance,
    }
}

/// Storage writes that make `change` durable.
fn persist_ops(map: &RoadMap, change: &GraphChange) -> Vec<PersistOp> {
    let graph = map.id();
    let save_node = |id: NodeId| map.node(id).cloned().map(PersistOp::SaveNode);
    match change {
        GraphChange::NodeAdded(id) => save_node(*id)
            .into_iter()
            .chain([PersistOp::SaveGraph(GraphRecord::of(map))])
            .collect(),
        GraphChange::NodeUpdated(id) => save_node(*id).into_iter().collect(),
        GraphChange::NodeRemoved { node, edges } => edges
            .iter()
            .map(|e| PersistOp::DeleteEdge(graph, *e))
            .chain([PersistOp::DeleteNode(graph, node.id)])
            .collect(),
        GraphChange::EdgeAdded(edge) => vec![PersistOp::SaveEdge(graph, *edge)],
        GraphChange::EdgeRemoved(edge) => vec![PersistOp::DeleteEdge(graph, *edge)],
        GraphChange::GroupAdded(id) => map
            .group(*id)
            .cloned()
            .map(PersistOp::SaveGroup)
            .into_iter()
            .chain([PersistOp::SaveGraph(GraphRecord::of(map))])
            .collect(),
        GraphChange::GroupUpdated(id) => map
            .group(*id)
            .cloned()
            .map(PersistOp::SaveGroup)
            .into_iter()
            .collect(),
        GraphChange::GroupRemoved { group, members } => members
            .iter()
            .filter_map(|id| save_node(*id))
            .chain([PersistOp::DeleteGroup(graph, group.id)])
            .collect(),
    }
}

impl Engine {
    pub fn new(config: EngineConfig, collab: Collaborators, persistence: Persistence) -> Self {
        let styles = StyleRegistry::new(&config.path_styles, &config.edit_styles);
        let (style_tx, style_rx) = mpsc::unbounded_channel();
        Self {
            config,
            graphs: GraphRegistry::default(),
            users: UserRegistry::default(),
            styles,
            edits: EditSessions::default(),
            collab,
            routes: Dispatcher::new(),
            pending_routes: BTreeMap::new(),
            persistence,
            style_tx,
            style_rx,
            ticks: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Takes over road maps loaded from storage.
    ///
    /// Style references that no longer exist fall back to the defaults.
    pub fn load(&mut self, maps: impl IntoIterator<Item = RoadMap>) {
        for mut map in maps {
            let graph = map.id();
            if self.styles.path(map.settings().path_style).is_none() {
                warn!(graph = %graph, "path style missing, using default");
                map.set_path_style(self.styles.default_path_style());
            }
            if self.styles.edit(map.settings().edit_style).is_none() {
                warn!(graph = %graph, "edit style missing, using default");
                map.set_edit_style(self.styles.default_edit_style());
            }
            if !self.graphs.is_name_free(map.name(), None) {
                warn!(graph = %graph, name = map.name(), "duplicate road map name");
            }
            if let Some(style) = self.styles.path_mut(map.settings().path_style) {
                style.subscribe(graph, &self.style_tx);
            }
            info!(
                graph = %graph,
                name = map.name(),
                nodes = map.node_count(),
                edges = map.edge_count(),
                "road map loaded"
            );
            self.graphs.insert(map);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    pub fn graph(&self, id: GraphId) -> Option<&RoadMap> {
        self.graphs.get(id)
    }

    pub fn graph_by_name(&self, name: &str) -> Option<&RoadMap> {
        self.graphs.by_name(name)
    }

    pub fn graphs(&self) -> impl Iterator<Item = &RoadMap> {
        self.graphs.iter()
    }

    pub fn styles(&self) -> &StyleRegistry {
        &self.styles
    }

    fn map(&self, id: GraphId) -> Result<&RoadMap, EngineError> {
        self.graphs.get(id).ok_or(EngineError::UnknownGraph(id))
    }

    /// Nodes `user` may see and route to on `graph`.
    pub fn visible_nodes(&self, user: UserId, graph: GraphId) -> Result<Vec<&Findable>, EngineError> {
        let map = self.map(graph)?;
        let state = self.users.get(user).ok_or(EngineError::UnknownUser(user))?;
        let presence = &self.collab.presence;
        Ok(map.visible_nodes(&state.discovered, |tag| presence.has_permission(user, tag)))
    }

    pub fn discovered_locations(&self, user: UserId, graph: GraphId) -> Result<Vec<String>, EngineError> {
        let map = self.map(graph)?;
        let state = self.users.get(user).ok_or(EngineError::UnknownUser(user))?;
        Ok(map.discovered_locations(&state.discovered))
    }

    pub fn max_discoverable_count(&self, graph: GraphId) -> Result<usize, EngineError> {
        Ok(self.map(graph)?.max_discoverable_count())
    }

    pub fn is_npc_linked(&self, graph: GraphId, external_id: u32) -> Result<bool, EngineError> {
        Ok(self.map(graph)?.is_npc_linked(external_id))
    }

    pub fn find_npc(&self, graph: GraphId, role: NpcRole, name: &str) -> Result<Option<&Findable>, EngineError> {
        Ok(self.map(graph)?.find_by_role(role, name))
    }

    pub fn proxy_count(&self, graph: GraphId) -> usize {
        self.edits.proxy_count(graph)
    }

    pub fn editing(&self, user: UserId) -> Option<GraphId> {
        self.users.get(user).and_then(|u| u.editing)
    }

    pub fn selected_graph(&self, user: UserId) -> Option<GraphId> {
        self.users.get(user).and_then(|u| u.selected)
    }

    pub fn path_session(&self, user: UserId, graph: GraphId) -> Option<&PathSession> {
        self.users.get(user).and_then(|u| u.paths.get(&graph))
    }

    pub fn path_state(&self, user: UserId, graph: GraphId) -> Option<SessionState> {
        self.path_session(user, graph).map(PathSession::state)
    }

    pub fn discovered(&self, user: UserId) -> Option<&BTreeSet<Marker>> {
        self.users.get(user).map(|u| &u.discovered)
    }

    /// Searches a route right away, on the calling task.
    pub fn plan_route(&self, graph: GraphId, start: Vec3, target: NodeId) -> Result<RouteOutcome, EngineError> {
        let map = self.map(graph)?;
        map.node(target).ok_or(GraphError::UnknownNode(target))?;
        let snapshot = map.snapshot(&*self.collab.positions);
        Ok(find_route(&snapshot, start, target))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Road maps
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_graph(&mut self, name: &str, zone: &str) -> Result<GraphId, EngineError> {
        if !self.graphs.is_name_free(name, None) {
            return Err(EngineError::DuplicateGraphName(name.to_string()));
        }
        let settings = RoadMapSettings {
            name: name.to_string(),
            zone: zone.to_string(),
            discovery_gated: false,
            arrival_distance: self.config.default_arrival_distance,
            default_tension: self.config.default_curve_tension,
            path_style: self.styles.default_path_style(),
            edit_style: self.styles.default_edit_style(),
        };
        let default_style = settings.path_style;
        let map = self.graphs.create(settings);
        let graph = map.id();
        self.persistence.enqueue(PersistOp::SaveGraph(GraphRecord::of(map)));
        if let Some(style) = self.styles.path_mut(default_style) {
            style.subscribe(graph, &self.style_tx);
        }
        info!(graph = %graph, name, "road map created");
        Ok(graph)
    }

    /// Deletes a road map with everything that refers to it.
    pub fn delete_graph(&mut self, graph: GraphId) -> Result<(), EngineError> {
        let map = self.graphs.get(graph).ok_or(EngineError::UnknownGraph(graph))?;
        let name = map.name().to_string();
        let (path_style, edit_style) = (map.settings().path_style, map.settings().edit_style);

        let editors = self.edits.end(graph, &mut *self.collab.renderer);
        if let Some(style) = self.styles.edit_mut(edit_style) {
            style.unsubscribe(graph);
        }
        if let Some(style) = self.styles.path_mut(path_style) {
            style.unsubscribe(graph);
        }
        self.pending_routes.retain(|(_, g), _| *g != graph);

        for user in self.users.iter_mut() {
            let mut notices = Vec::new();
            if editors.contains(&user.id) {
                notices.push(Notice::EditModeEnded { graph: name.clone() });
            }
            if let Some(mut session) = user.paths.remove(&graph) {
                session.cancel(&mut *self.collab.renderer);
                notices.push(Notice::Cancelled { graph: name.clone() });
            }
            if user.selected == Some(graph) {
                notices.push(Notice::GraphDeleted { graph: name.clone() });
            }
            if user.forget_graph(graph) {
                self.persistence
                    .enqueue(PersistOp::SaveDiscoveries(user.id, user.discovered.clone()));
            }
            for notice in notices {
                self.collab.messenger.notify(user.id, notice);
            }
        }

        self.graphs.remove(graph);
        self.persistence.enqueue(PersistOp::DeleteGraph(graph));
        info!(graph = %graph, name = %name, "road map deleted");
        Ok(())
    }

    fn update_settings<F>(&mut self, graph: GraphId, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut RoadMap) -> Result<(), GraphError>,
    {
        let map = self.graphs.get_mut(graph).ok_or(EngineError::UnknownGraph(graph))?;
        f(map)?;
        self.persistence.enqueue(PersistOp::SaveGraph(GraphRecord::of(map)));
        Ok(())
    }

    pub fn rename_graph(&mut self, graph: GraphId, name: &str) -> Result<(), EngineError> {
        if !self.graphs.is_name_free(name, Some(graph)) {
            return Err(EngineError::DuplicateGraphName(name.to_string()));
        }
        self.update_settings(graph, |map| {
            map.set_name(name);
            Ok(())
        })
    }

    pub fn set_zone(&mut self, graph: GraphId, zone: &str) -> Result<(), EngineError> {
        self.update_settings(graph, |map| {
            map.set_zone(zone);
            Ok(())
        })
    }

    pub fn set_discovery_gated(&mut self, graph: GraphId, gated: bool) -> Result<(), EngineError> {
        self.update_settings(graph, |map| {
            map.set_discovery_gated(gated);
            Ok(())
        })
    }

    pub fn set_arrival_distance(&mut self, graph: GraphId, distance: f64) -> Result<(), EngineError> {
        self.update_settings(graph, |map| map.set_arrival_distance(distance))
    }

    pub fn set_default_tension(&mut self, graph: GraphId, tension: f64) -> Result<(), EngineError> {
        self.update_settings(graph, |map| map.set_default_tension(tension))
    }

    /// Points `graph` at another path style, moving its subscription.
    pub fn assign_path_style(&mut self, graph: GraphId, style: StyleId) -> Result<(), EngineError> {
        if self.styles.path(style).is_none() {
            return Err(StyleError::Unknown(style).into());
        }
        let old = self.map(graph)?.settings().path_style;
        if old == style {
            return Ok(());
        }
        if let Some(previous) = self.styles.path_mut(old) {
            previous.unsubscribe(graph);
        }
        if let Some(next) = self.styles.path_mut(style) {
            next.subscribe(graph, &self.style_tx);
        }
        self.update_settings(graph, |map| {
            map.set_path_style(style);
            Ok(())
        })
    }

    /// Points `graph` at another edit style. A running edit session moves
    /// its subscription and restyles right away.
    pub fn assign_edit_style(&mut self, graph: GraphId, style: StyleId) -> Result<(), EngineError> {
        if self.styles.edit(style).is_none() {
            return Err(StyleError::Unknown(style).into());
        }
        let old = self.map(graph)?.settings().edit_style;
        if old == style {
            return Ok(());
        }
        self.update_settings(graph, |map| {
            map.set_edit_style(style);
            Ok(())
        })?;

        if self.edits.is_active(graph) {
            if let Some(previous) = self.styles.edit_mut(old) {
                previous.unsubscribe(graph);
            }
            if let Some(next) = self.styles.edit_mut(style) {
                next.subscribe(graph, &self.style_tx);
            }
            self.restyle_edit(graph, EditField::NodeIcon);
            self.restyle_edit(graph, EditField::Spacing);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Structural changes
    // ─────────────────────────────────────────────────────────────────────

    fn mutate<F>(&mut self, graph: GraphId, f: F) -> Result<GraphChange, EngineError>
    where
        F: FnOnce(&mut RoadMap) -> Result<GraphChange, GraphError>,
    {
        let map = self.graphs.get_mut(graph).ok_or(EngineError::UnknownGraph(graph))?;
        let change = f(map)?;
        self.apply_change(graph, &change);
        Ok(change)
    }

    /// Makes a change visible everywhere: storage, live proxies and path
    /// sessions.
    fn apply_change(&mut self, graph: GraphId, change: &GraphChange) {
        let Some(map) = self.graphs.get(graph) else {
            return;
        };
        debug!(graph = %graph, ?change, "graph changed");
        for op in persist_ops(map, change) {
            self.persistence.enqueue(op);
        }
        if let Some(style) = edit_style_of(&self.styles, map) {
            let mut ctx = edit_context(map, style, &mut self.collab, self.config.proxy_view_distance);
            self.edits.apply(&mut ctx, change);
        }
        if matches!(change, GraphChange::NodeRemoved { .. } | GraphChange::EdgeRemoved(_)) {
            self.revalidate_paths(graph);
        }
    }

    /// Ends every session on `graph` whose remaining route is broken.
    fn revalidate_paths(&mut self, graph: GraphId) {
        let Some(map) = self.graphs.get(graph) else {
            return;
        };
        let mut invalidated = Vec::new();
        for user in self.users.iter_mut() {
            let Some(session) = user.paths.get_mut(&graph) else {
                continue;
            };
            if !session.route_valid(map) {
                session.invalidate(&mut *self.collab.renderer);
                user.paths.remove(&graph);
                invalidated.push(user.id);
            }
        }
        for user in invalidated {
            info!(%user, graph = %graph, "path session invalidated");
            self.collab.messenger.notify(
                user,
                Notice::Invalidated {
                    graph: map.name().to_string(),
                },
            );
        }
    }

    /// Runs an insertion and announces the new entity with `announce`.
    fn insert<T, F>(&mut self, graph: GraphId, f: F, announce: fn(T) -> GraphChange) -> Result<T, EngineError>
    where
        T: Copy,
        F: FnOnce(&mut RoadMap) -> Result<T, GraphError>,
    {
        let map = self.graphs.get_mut(graph).ok_or(EngineError::UnknownGraph(graph))?;
        let id = f(map)?;
        self.apply_change(graph, &announce(id));
        Ok(id)
    }

    pub fn add_waypoint(&mut self, graph: GraphId, name: &str, at: Vec3) -> Result<NodeId, EngineError> {
        self.insert(graph, |map| map.add_waypoint(name, at), GraphChange::NodeAdded)
    }

    pub fn add_npc(
        &mut self,
        graph: GraphId,
        name: &str,
        external_id: u32,
        role: NpcRole,
    ) -> Result<NodeId, EngineError> {
        self.insert(
            graph,
            |map| map.add_npc(name, external_id, role),
            GraphChange::NodeAdded,
        )
    }

    pub fn remove_node(&mut self, graph: GraphId, node: NodeId) -> Result<(), EngineError> {
        self.mutate(graph, |map| map.remove_node(node)).map(drop)
    }

    pub fn rename_node(&mut self, graph: GraphId, node: NodeId, name: &str) -> Result<(), EngineError> {
        self.mutate(graph, |map| map.rename_node(node, name)).map(drop)
    }

    pub fn move_node(&mut self, graph: GraphId, node: NodeId, to: Vec3) -> Result<(), EngineError> {
        self.mutate(graph, |map| map.move_node(node, to)).map(drop)
    }

    pub fn set_node_group(
        &mut self,
        graph: GraphId,
        node: NodeId,
        group: Option<GroupId>,
    ) -> Result<(), EngineError> {
        self.mutate(graph, |map| map.set_node_group(node, group)).map(drop)
    }

    pub fn set_node_permission(
        &mut self,
        graph: GraphId,
        node: NodeId,
        permission: Option<String>,
    ) -> Result<(), EngineError> {
        self.mutate(graph, |map| map.set_node_permission(node, permission))
            .map(drop)
    }

    pub fn set_node_tension(
        &mut self,
        graph: GraphId,
        node: NodeId,
        tension: Option<f64>,
    ) -> Result<(), EngineError> {
        self.mutate(graph, |map| map.set_node_tension(node, tension)).map(drop)
    }

    /// Connects two nodes. Returns false if they already were.
    pub fn connect(&mut self, graph: GraphId, a: NodeId, b: NodeId) -> Result<bool, EngineError> {
        self.connection(graph, |map| map.connect(a, b))
    }

    /// Disconnects two nodes. Returns false if they were not connected.
    pub fn disconnect(&mut self, graph: GraphId, a: NodeId, b: NodeId) -> Result<bool, EngineError> {
        self.connection(graph, |map| map.disconnect(a, b))
    }

    fn connection<F>(&mut self, graph: GraphId, f: F) -> Result<bool, EngineError>
    where
        F: FnOnce(&mut RoadMap) -> Result<Option<GraphChange>, GraphError>,
    {
        let map = self.graphs.get_mut(graph).ok_or(EngineError::UnknownGraph(graph))?;
        match f(map)? {
            Some(change) => {
                self.apply_change(graph, &change);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn create_group(&mut self, graph: GraphId, name: &str, discoverable: bool) -> Result<GroupId, EngineError> {
        self.insert(graph, |map| map.add_group(name, discoverable), GraphChange::GroupAdded)
    }

    pub fn rename_group(&mut self, graph: GraphId, group: GroupId, name: &str) -> Result<(), EngineError> {
        self.mutate(graph, |map| map.rename_group(group, name)).map(drop)
    }

    pub fn set_group_discoverable(
        &mut self,
        graph: GraphId,
        group: GroupId,
        discoverable: bool,
    ) -> Result<(), EngineError> {
        self.mutate(graph, |map| map.set_group_discoverable(group, discoverable))
            .map(drop)
    }

    /// Deletes a group. Its members stay, ungrouped.
    pub fn delete_group(&mut self, graph: GraphId, group: GroupId) -> Result<(), EngineError> {
        self.mutate(graph, |map| map.remove_group(group)).map(drop)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────

    /// Registers a user with the discoveries loaded for them.
    pub fn connect_user(&mut self, user: UserId, discovered: BTreeSet<Marker>) {
        self.users.connect(user, discovered);
        debug!(%user, "user connected");
    }

    /// Ends everything the user had running and forgets them.
    pub fn disconnect_user(&mut self, user: UserId) {
        self.leave_edit_mode(user);
        self.pending_routes.retain(|(u, _), _| *u != user);
        let Some(mut state) = self.users.disconnect(user) else {
            return;
        };
        for session in state.paths.values_mut() {
            session.cancel(&mut *self.collab.renderer);
        }
        self.persistence
            .enqueue(PersistOp::SaveDiscoveries(user, state.discovered));
        debug!(%user, "user disconnected");
    }

    pub fn select_graph(&mut self, user: UserId, graph: Option<GraphId>) -> Result<(), EngineError> {
        if let Some(graph) = graph {
            self.map(graph)?;
        }
        let state = self.users.get_mut(user).ok_or(EngineError::UnknownUser(user))?;
        state.selected = graph;
        Ok(())
    }

    fn discover(&mut self, user: UserId, graph: GraphId, node: NodeId) {
        let Some(map) = self.graphs.get(graph) else {
            return;
        };
        let Some(found) = map.node(node) else {
            return;
        };
        let Some(state) = self.users.get_mut(user) else {
            return;
        };
        let marker = map.discovery_marker(found);
        if !state.discover(marker) {
            return;
        }
        self.persistence
            .enqueue(PersistOp::SaveDiscoveries(user, state.discovered.clone()));
        if map.settings().discovery_gated {
            let location = match marker {
                Marker::Group(_, group) => map.group(group).map(|g| g.name.clone()),
                Marker::Node(..) => Some(found.name.clone()),
            };
            self.collab.messenger.notify(
                user,
                Notice::Discovered {
                    graph: map.name().to_string(),
                    location: location.unwrap_or_default(),
                },
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Path sessions
    // ─────────────────────────────────────────────────────────────────────

    /// Starts a background route search from the user's position to
    /// `target`. The session starts when the result is applied.
    pub fn request_route(&mut self, user: UserId, graph: GraphId, target: NodeId) -> Result<(), EngineError> {
        if self.users.get(user).is_none() {
            return Err(EngineError::UnknownUser(user));
        }
        let start = self
            .collab
            .presence
            .position(user)
            .ok_or(EngineError::Offline(user))?;
        let map = self.map(graph)?;
        map.node(target).ok_or(GraphError::UnknownNode(target))?;
        if !self.visible_nodes(user, graph)?.iter().any(|n| n.id == target) {
            return Err(EngineError::NotVisible(target));
        }

        let snapshot = map.snapshot(&*self.collab.positions);
        let ticket = self.routes.submit(move || RouteJob {
            user,
            graph,
            target,
            outcome: find_route(&snapshot, start, target),
        });
        self.pending_routes.insert((user, graph), ticket);
        debug!(%user, graph = %graph, target = %target, ticket, "route requested");
        Ok(())
    }

    fn apply_route(&mut self, ticket: Ticket, job: RouteJob) {
        let RouteJob {
            user,
            graph,
            target,
            outcome,
        } = job;
        if self.pending_routes.get(&(user, graph)) != Some(&ticket) {
            debug!(%user, graph = %graph, ticket, "stale route result dropped");
            return;
        }
        self.pending_routes.remove(&(user, graph));
        if self.users.get(user).is_none() {
            return;
        }
        // Whatever the outcome, the new request supersedes the old route.
        self.drop_path(user, graph);
        let Some(map) = self.graphs.get(graph) else {
            return;
        };
        let graph_name = map.name().to_string();
        let target_name = map.node(target).map(|n| n.name.clone());

        let route = match (outcome, target_name.as_ref()) {
            (_, None) => {
                self.collab
                    .messenger
                    .notify(user, Notice::Invalidated { graph: graph_name });
                return;
            }
            (RouteOutcome::NoRoute, Some(target)) => {
                self.collab.messenger.notify(
                    user,
                    Notice::NoRoute {
                        graph: graph_name,
                        target: target.clone(),
                    },
                );
                return;
            }
            (RouteOutcome::Found(route), Some(_)) => route,
        };

        if route.is_empty() {
            self.discover(user, graph, target);
            self.collab.messenger.notify(
                user,
                Notice::Arrived {
                    graph: graph_name,
                    target: target_name.unwrap_or_default(),
                },
            );
            return;
        }
        if !map.route_intact(&route.nodes) {
            info!(%user, graph = %graph, "route changed during search");
            self.collab
                .messenger
                .notify(user, Notice::Invalidated { graph: graph_name });
            return;
        }

        let Some(state) = self.users.get_mut(user) else {
            return;
        };
        state
            .paths
            .insert(graph, PathSession::new(user, graph, route.nodes));
        info!(%user, graph = %graph, target = %target, cost = route.cost, "path session created");
    }

    /// Removes the user's session on `graph` and clears its markers without
    /// telling the user.
    fn drop_path(&mut self, user: UserId, graph: GraphId) {
        let previous = self
            .users
            .get_mut(user)
            .and_then(|state| state.paths.remove(&graph));
        if let Some(mut previous) = previous {
            previous.cancel(&mut *self.collab.renderer);
            debug!(%user, graph = %graph, "previous path session replaced");
        }
    }

    /// Cancels the user's session on `graph`, or a search still running for
    /// it. Returns false if there was neither.
    pub fn cancel_path(&mut self, user: UserId, graph: GraphId) -> bool {
        let searching = self.pending_routes.remove(&(user, graph)).is_some();
        let Some(state) = self.users.get_mut(user) else {
            return searching;
        };
        let Some(mut session) = state.paths.remove(&graph) else {
            return searching;
        };
        session.cancel(&mut *self.collab.renderer);
        let name = self
            .graphs
            .get(graph)
            .map(|m| m.name().to_string())
            .unwrap_or_default();
        self.collab
            .messenger
            .notify(user, Notice::Cancelled { graph: name });
        true
    }

    /// Cancels every path of the user. Returns how many were running.
    pub fn cancel_all_paths(&mut self, user: UserId) -> usize {
        let mut graphs: BTreeSet<GraphId> = self
            .pending_routes
            .keys()
            .filter(|(u, _)| *u == user)
            .map(|(_, g)| *g)
            .collect();
        if let Some(state) = self.users.get(user) {
            graphs.extend(state.paths.keys().copied());
        }
        graphs
            .into_iter()
            .filter(|graph| self.cancel_path(user, *graph))
            .count()
    }

    fn advance_paths(&mut self) {
        let Self {
            users,
            graphs,
            styles,
            collab,
            ..
        } = self;
        let mut events = Vec::new();
        for user in users.iter_mut() {
            let Some(at) = collab.presence.position(user.id) else {
                continue;
            };
            for (graph, session) in user.paths.iter_mut() {
                let Some(map) = graphs.get(*graph) else {
                    continue;
                };
                let Some(style) = path_style_of(styles, map) else {
                    continue;
                };
                let mut ctx = FollowContext {
                    map,
                    style,
                    positions: &*collab.positions,
                    renderer: &mut *collab.renderer,
                };
                if let Some(event) = session.tick(&mut ctx, at) {
                    events.push((user.id, *graph, event));
                }
            }
            user.paths.retain(|_, s| !s.state().is_terminal());
        }

        for (user, graph, event) in events {
            self.on_follow_event(user, graph, event);
        }
    }

    fn on_follow_event(&mut self, user: UserId, graph: GraphId, event: FollowEvent) {
        let Some(map) = self.graphs.get(graph) else {
            return;
        };
        let graph_name = map.name().to_string();
        match event {
            FollowEvent::Reached(node) => {
                if map.settings().discovery_gated {
                    self.discover(user, graph, node);
                }
            }
            FollowEvent::Arrived(node) => {
                let target = map.node(node).map(|n| n.name.clone()).unwrap_or_default();
                self.discover(user, graph, node);
                info!(%user, graph = %graph, target = %target, "arrived");
                self.collab.messenger.notify(
                    user,
                    Notice::Arrived {
                        graph: graph_name,
                        target,
                    },
                );
            }
            FollowEvent::Invalidated => {
                self.collab
                    .messenger
                    .notify(user, Notice::Invalidated { graph: graph_name });
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Edit mode
    // ─────────────────────────────────────────────────────────────────────

    /// Puts `user` in edit mode on `graph`, leaving any other edit session
    /// first. Unknown or offline users and unknown graphs are ignored.
    /// Returns whether the user is now editing `graph`.
    pub fn enter_edit_mode(&mut self, user: UserId, graph: GraphId) -> bool {
        let Some(state) = self.users.get(user) else {
            return false;
        };
        if !self.collab.presence.is_online(user) || self.graphs.get(graph).is_none() {
            return false;
        }
        let editing = state.editing;
        match editing {
            Some(current) if current == graph => return true,
            Some(_) => {
                self.leave_edit_mode(user);
            }
            None => {}
        }

        let Some(map) = self.graphs.get(graph) else {
            return false;
        };
        let Some(style) = edit_style_of(&self.styles, map) else {
            return false;
        };
        let style_id = style.id;
        let mut ctx = edit_context(map, style, &mut self.collab, self.config.proxy_view_distance);
        let started = self.edits.join(&mut ctx, user);
        if started {
            if let Some(style) = self.styles.edit_mut(style_id) {
                style.subscribe(graph, &self.style_tx);
            }
        }
        if let Some(state) = self.users.get_mut(user) {
            state.editing = Some(graph);
        }
        info!(%user, graph = %graph, "edit mode entered");
        true
    }

    /// Takes `user` out of edit mode. Returns false if they were not
    /// editing.
    pub fn leave_edit_mode(&mut self, user: UserId) -> bool {
        let Some(graph) = self.users.get_mut(user).and_then(|u| u.editing.take()) else {
            return false;
        };
        if self.edits.leave(graph, user, &mut *self.collab.renderer) {
            let style = self.graphs.get(graph).map(|m| m.settings().edit_style);
            if let Some(style) = style.and_then(|id| self.styles.edit_mut(id)) {
                style.unsubscribe(graph);
            }
        }
        info!(%user, graph = %graph, "edit mode left");
        true
    }

    /// Flips edit mode. `None` when nothing happened.
    pub fn toggle_edit_mode(&mut self, user: UserId, graph: GraphId) -> Option<bool> {
        if self.editing(user) == Some(graph) {
            self.leave_edit_mode(user).then_some(false)
        } else {
            self.enter_edit_mode(user, graph).then_some(true)
        }
    }

    fn restyle_edit(&mut self, graph: GraphId, field: EditField) {
        let Some(map) = self.graphs.get(graph) else {
            return;
        };
        let Some(style) = edit_style_of(&self.styles, map) else {
            return;
        };
        let mut ctx = edit_context(map, style, &mut self.collab, self.config.proxy_view_distance);
        self.edits.restyle(&mut ctx, field);
    }

    fn maintain_edits(&mut self) {
        for graph in self.edits.active_graphs() {
            let Some(map) = self.graphs.get(graph) else {
                continue;
            };
            let Some(style) = edit_style_of(&self.styles, map) else {
                continue;
            };
            let mut ctx = edit_context(map, style, &mut self.collab, self.config.proxy_view_distance);
            self.edits.maintain(&mut ctx, self.config.proxy_refresh_ticks);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Styles
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_path_style(&mut self, def: &PathStyleDef) -> Result<StyleId, EngineError> {
        Ok(self.styles.create_path_style(def)?)
    }

    pub fn create_edit_style(&mut self, def: &EditStyleDef) -> Result<StyleId, EngineError> {
        Ok(self.styles.create_edit_style(def)?)
    }

    pub fn delete_path_style(&mut self, id: StyleId) -> Result<(), EngineError> {
        let in_use = self.graphs.iter().any(|m| m.settings().path_style == id);
        Ok(self.styles.remove_path_style(id, in_use)?)
    }

    pub fn delete_edit_style(&mut self, id: StyleId) -> Result<(), EngineError> {
        let in_use = self.graphs.iter().any(|m| m.settings().edit_style == id);
        Ok(self.styles.remove_edit_style(id, in_use)?)
    }

    /// Changes one field of a path style. Sessions keep the look of the
    /// segment they are drawing; the redraw cadence applies at once.
    pub fn update_path_style(&mut self, id: StyleId, change: PathStyleChange) -> Result<(), EngineError> {
        let style = self.styles.path_mut(id).ok_or(StyleError::Unknown(id))?;
        style.apply(change)?;
        self.drain_style_events();
        Ok(())
    }

    pub fn update_edit_style(&mut self, id: StyleId, change: EditStyleChange) -> Result<(), EngineError> {
        let style = self.styles.edit_mut(id).ok_or(StyleError::Unknown(id))?;
        style.apply(change)?;
        self.drain_style_events();
        Ok(())
    }

    fn drain_style_events(&mut self) {
        while let Ok(event) = self.style_rx.try_recv() {
            match event {
                StyleEvent::Path { graph, field } => {
                    debug!(graph = %graph, ?field, "path style changed");
                }
                StyleEvent::Edit { graph, field } => {
                    debug!(graph = %graph, ?field, "edit style changed");
                    self.restyle_edit(graph, field);
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ticking
    // ─────────────────────────────────────────────────────────────────────

    /// Runs one simulation step.
    pub fn tick(&mut self) {
        self.ticks += 1;
        for (ticket, job) in self.routes.drain() {
            self.apply_route(ticket, job);
        }
        self.drain_style_events();
        self.advance_paths();
        self.maintain_edits();
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Waits for every running route search and applies the results.
    pub async fn settle(&mut self) {
        for (ticket, job) in self.routes.settle().await {
            self.apply_route(ticket, job);
        }
    }

    /// Ends every edit and path session, stores discoveries and waits for
    /// pending writes.
    pub async fn shutdown(&mut self) {
        for user in self.users.ids() {
            self.leave_edit_mode(user);
        }
        for graph in self.edits.active_graphs() {
            self.edits.end(graph, &mut *self.collab.renderer);
        }
        self.pending_routes.clear();
        for user in self.users.iter_mut() {
            for session in user.paths.values_mut() {
                session.cancel(&mut *self.collab.renderer);
            }
            user.paths.clear();
            self.persistence
                .enqueue(PersistOp::SaveDiscoveries(user.id, user.discovered.clone()));
        }
        self.persistence.close().await;
        info!(ticks = self.ticks, "engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MarkerLayer;
    use crate::testing::{
        FakePositions, FakePresence, RecordingMessenger, RecordingRenderer, RecordingRepository,
    };

    struct Harness {
        engine: Engine,
        renderer: RecordingRenderer,
        messenger: RecordingMessenger,
        presence: FakePresence,
        positions: FakePositions,
        repo: RecordingRepository,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_repo(RecordingRepository::default())
        }

        fn with_repo(repo: RecordingRepository) -> Self {
            let renderer = RecordingRenderer::default();
            let messenger = RecordingMessenger::default();
            let presence = FakePresence::default();
            let positions = FakePositions::default();
            let collab = Collaborators {
                renderer: Box::new(renderer.clone()),
                messenger: Box::new(messenger.clone()),
                presence: Box::new(presence.clone()),
                positions: Box::new(positions.clone()),
            };
            let engine = Engine::new(
                EngineConfig::default(),
                collab,
                Persistence::spawn(repo.clone(), 256),
            );
            Self {
                engine,
                renderer,
                messenger,
                presence,
                positions,
                repo,
            }
        }

        /// The "Town" road map: A(0,0,0) - B(10,0,0) - C(10,10,0).
        fn town(&mut self) -> (GraphId, [NodeId; 3]) {
            let graph = self.engine.create_graph("Town", "overworld").unwrap();
            let a = self.engine.add_waypoint(graph, "A", Vec3::new(0.0, 0.0, 0.0)).unwrap();
            let b = self.engine.add_waypoint(graph, "B", Vec3::new(10.0, 0.0, 0.0)).unwrap();
            let c = self.engine.add_waypoint(graph, "C", Vec3::new(10.0, 10.0, 0.0)).unwrap();
            self.engine.connect(graph, a, b).unwrap();
            self.engine.connect(graph, b, c).unwrap();
            (graph, [a, b, c])
        }

        fn user_at(&mut self, at: Vec3) -> UserId {
            let user = UserId::new_v4();
            self.presence.place(user, at);
            self.engine.connect_user(user, BTreeSet::new());
            user
        }

        fn walk(&mut self, user: UserId, to: Vec3) {
            self.presence.place(user, to);
            self.engine.tick();
        }
    }

    #[tokio::test]
    async fn test_town_route() {
        let mut h = Harness::new();
        let (graph, [a, b, c]) = h.town();

        match h.engine.plan_route(graph, Vec3::ZERO, c).unwrap() {
            RouteOutcome::Found(route) => {
                assert_eq!(route.nodes, vec![a, b, c]);
                assert!((route.cost - 20.0).abs() < 1e-9);
            }
            RouteOutcome::NoRoute => panic!("expected a route"),
        }

        let user = h.user_at(Vec3::ZERO);
        h.engine.request_route(user, graph, c).unwrap();
        h.engine.settle().await;
        let session = h.engine.path_session(user, graph).unwrap();
        assert_eq!(session.route(), &[a, b, c]);
        assert_eq!(session.state(), SessionState::Created);
    }

    #[tokio::test]
    async fn test_edge_removed_before_first_render_invalidates() {
        let mut h = Harness::new();
        let (graph, [_, b, c]) = h.town();
        let user = h.user_at(Vec3::ZERO);

        h.engine.request_route(user, graph, c).unwrap();
        h.engine.settle().await;
        assert!(h.engine.disconnect(graph, b, c).unwrap());
        h.engine.tick();

        assert!(h.engine.path_session(user, graph).is_none());
        assert_eq!(
            h.messenger.notices_for(user),
            vec![Notice::Invalidated {
                graph: "Town".to_string()
            }]
        );
        assert_eq!(h.renderer.marker_draws(user), 0);
    }

    #[tokio::test]
    async fn test_edge_removed_during_search_invalidates() {
        let mut h = Harness::new();
        let (graph, [_, b, c]) = h.town();
        let user = h.user_at(Vec3::ZERO);

        h.engine.request_route(user, graph, c).unwrap();
        h.engine.disconnect(graph, b, c).unwrap();
        h.engine.settle().await;

        assert!(h.engine.path_session(user, graph).is_none());
        assert!(matches!(
            h.messenger.notices_for(user).as_slice(),
            [Notice::Invalidated { .. }]
        ));
    }

    #[tokio::test]
    async fn test_follow_route_to_arrival() {
        let mut h = Harness::new();
        let (graph, [_, _, c]) = h.town();
        let user = h.user_at(Vec3::new(0.0, 4.0, 0.0));

        h.engine.request_route(user, graph, c).unwrap();
        h.engine.settle().await;
        h.engine.tick();
        let layer = MarkerLayer::Path(graph);
        assert_eq!(h.engine.path_state(user, graph), Some(SessionState::Active));
        assert!(!h.renderer.markers(user, layer).is_empty());

        let mut last = 0;
        for to in [
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::new(9.5, 0.0, 0.0),
            Vec3::new(10.0, 5.0, 0.0),
            Vec3::new(10.0, 9.5, 0.0),
        ] {
            h.walk(user, to);
            if let Some(session) = h.engine.path_session(user, graph) {
                assert!(session.segment() >= last);
                last = session.segment();
            }
        }

        assert!(h.engine.path_session(user, graph).is_none());
        assert!(h.renderer.markers(user, layer).is_empty());
        assert_eq!(
            h.messenger.notices_for(user),
            vec![Notice::Arrived {
                graph: "Town".to_string(),
                target: "C".to_string()
            }]
        );
        assert!(h.engine.discovered(user).unwrap().contains(&Marker::Node(graph, c)));
    }

    #[tokio::test]
    async fn test_start_at_target_arrives_immediately() {
        let mut h = Harness::new();
        let (graph, [a, ..]) = h.town();
        let user = h.user_at(Vec3::new(0.2, 0.0, 0.0));

        h.engine.request_route(user, graph, a).unwrap();
        h.engine.settle().await;
        assert!(h.engine.path_session(user, graph).is_none());
        assert!(matches!(
            h.messenger.notices_for(user).as_slice(),
            [Notice::Arrived { .. }]
        ));
    }

    #[tokio::test]
    async fn test_unreachable_target_reports_no_route() {
        let mut h = Harness::new();
        let (graph, _) = h.town();
        let island = h.engine.add_waypoint(graph, "Island", Vec3::new(50.0, 0.0, 0.0)).unwrap();
        let user = h.user_at(Vec3::ZERO);

        h.engine.request_route(user, graph, island).unwrap();
        h.engine.settle().await;
        assert_eq!(
            h.messenger.notices_for(user),
            vec![Notice::NoRoute {
                graph: "Town".to_string(),
                target: "Island".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_rerequest_ends_previous_session() {
        let mut h = Harness::new();
        let (graph, [_, _, c]) = h.town();
        let island = h.engine.add_waypoint(graph, "Island", Vec3::new(50.0, 0.0, 0.0)).unwrap();
        let user = h.user_at(Vec3::new(0.0, 4.0, 0.0));

        h.engine.request_route(user, graph, c).unwrap();
        h.engine.settle().await;
        h.engine.tick();
        assert!(!h.renderer.markers(user, MarkerLayer::Path(graph)).is_empty());

        h.engine.request_route(user, graph, island).unwrap();
        h.engine.settle().await;
        assert!(h.engine.path_session(user, graph).is_none());
        assert!(h.renderer.markers(user, MarkerLayer::Path(graph)).is_empty());
        assert!(matches!(
            h.messenger.notices_for(user).as_slice(),
            [Notice::NoRoute { .. }]
        ));

        // Asking again while already standing on the target also ends it.
        h.engine.request_route(user, graph, c).unwrap();
        h.engine.settle().await;
        h.engine.tick();
        assert!(h.engine.path_session(user, graph).is_some());
        h.presence.place(user, Vec3::new(10.0, 10.2, 0.0));
        h.engine.request_route(user, graph, c).unwrap();
        h.engine.settle().await;
        assert!(h.engine.path_session(user, graph).is_none());
        assert!(h.renderer.markers(user, MarkerLayer::Path(graph)).is_empty());
        assert!(matches!(
            h.messenger.notices_for(user).last(),
            Some(Notice::Arrived { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_path() {
        let mut h = Harness::new();
        let (graph, [_, _, c]) = h.town();
        let user = h.user_at(Vec3::new(0.0, 4.0, 0.0));

        h.engine.request_route(user, graph, c).unwrap();
        h.engine.settle().await;
        h.engine.tick();
        assert!(h.engine.cancel_path(user, graph));
        assert!(!h.engine.cancel_path(user, graph));
        assert!(h.renderer.markers(user, MarkerLayer::Path(graph)).is_empty());

        // A search cancelled before it finishes never starts a session.
        h.engine.request_route(user, graph, c).unwrap();
        assert_eq!(h.engine.cancel_all_paths(user), 1);
        h.engine.settle().await;
        assert!(h.engine.path_session(user, graph).is_none());
    }

    #[tokio::test]
    async fn test_two_editors_see_new_node() {
        let mut h = Harness::new();
        let (graph, _) = h.town();
        let first = h.user_at(Vec3::ZERO);
        let second = h.user_at(Vec3::new(5.0, 0.0, 0.0));

        assert!(h.engine.enter_edit_mode(first, graph));
        assert!(h.engine.enter_edit_mode(second, graph));
        let d = h.engine.add_waypoint(graph, "D", Vec3::new(2.0, 2.0, 0.0)).unwrap();

        let proxy = h.renderer.label_of(&format!("D #{d}")).unwrap();
        assert!(h.renderer.visible_to(second).contains(&proxy));
        assert!(h.renderer.visible_to(first).contains(&proxy));
        assert_eq!(h.engine.proxy_count(graph), 4 + 2);
    }

    #[tokio::test]
    async fn test_proxy_count_follows_edit_state() {
        let mut h = Harness::new();
        let (graph, [a, ..]) = h.town();
        let user = h.user_at(Vec3::ZERO);
        let count = |h: &Harness| {
            let map = h.engine.graph(graph).unwrap();
            map.node_count() + map.edge_count()
        };

        assert_eq!(h.engine.toggle_edit_mode(user, graph), Some(true));
        assert_eq!(h.engine.proxy_count(graph), count(&h));
        h.engine.remove_node(graph, a).unwrap();
        assert_eq!(h.engine.proxy_count(graph), count(&h));
        assert_eq!(h.renderer.live_proxies().len(), count(&h));

        assert_eq!(h.engine.toggle_edit_mode(user, graph), Some(false));
        assert_eq!(h.engine.proxy_count(graph), 0);
        assert!(h.renderer.live_proxies().is_empty());

        // Unknown and offline users are ignored.
        assert_eq!(h.engine.toggle_edit_mode(UserId::new_v4(), graph), None);
        h.presence.remove(user);
        assert_eq!(h.engine.toggle_edit_mode(user, graph), None);
        assert_eq!(h.engine.proxy_count(graph), 0);
        h.engine.tick();
    }

    #[tokio::test]
    async fn test_group_delete_drops_label_suffix() {
        let mut h = Harness::new();
        let (graph, [x, y, _]) = h.town();
        let group = h.engine.create_group(graph, "market", true).unwrap();
        h.engine.set_node_group(graph, x, Some(group)).unwrap();
        h.engine.set_node_group(graph, y, Some(group)).unwrap();
        let user = h.user_at(Vec3::ZERO);
        h.engine.enter_edit_mode(user, graph);

        let x_proxy = h.renderer.label_of(&format!("A #{x} (market)")).unwrap();
        let y_proxy = h.renderer.label_of(&format!("B #{y} (market)")).unwrap();

        h.engine.delete_group(graph, group).unwrap();
        let map = h.engine.graph(graph).unwrap();
        assert_eq!(map.node(x).unwrap().group, None);
        assert_eq!(map.node(y).unwrap().group, None);
        assert_eq!(map.node_count(), 3);
        assert_eq!(
            h.renderer.spec(x_proxy).unwrap().label,
            Some(format!("A #{x}"))
        );
        assert_eq!(
            h.renderer.spec(y_proxy).unwrap().label,
            Some(format!("B #{y}"))
        );
    }

    #[tokio::test]
    async fn test_npc_proxy_without_position() {
        let mut h = Harness::new();
        let (graph, _) = h.town();
        let npc = h.engine.add_npc(graph, "Smith", 42, NpcRole::Trader).unwrap();
        let user = h.user_at(Vec3::ZERO);
        h.engine.enter_edit_mode(user, graph);

        let proxy = h.renderer.label_of(&format!("Smith #{npc}")).unwrap();
        assert_eq!(h.renderer.spec(proxy).unwrap().position, None);
        assert!(!h.renderer.visible_to(user).contains(&proxy));

        h.positions.set(42, Vec3::new(1.0, 1.0, 0.0));
        for _ in 0..h.engine.config().proxy_refresh_ticks {
            h.engine.tick();
        }
        assert_eq!(
            h.renderer.spec(proxy).unwrap().position,
            Some(Vec3::new(1.0, 1.0, 0.0))
        );
        assert!(h.renderer.visible_to(user).contains(&proxy));
        h.positions.remove(42);
        for _ in 0..h.engine.config().proxy_refresh_ticks {
            h.engine.tick();
        }
        assert!(!h.renderer.visible_to(user).contains(&proxy));
        assert!(h.engine.is_npc_linked(graph, 42).unwrap());
        assert_eq!(
            h.engine.find_npc(graph, NpcRole::Trader, "smith").unwrap().map(|n| n.id),
            Some(npc)
        );
    }

    #[tokio::test]
    async fn test_style_reassignment_moves_subscription() {
        let mut h = Harness::new();
        let (graph, _) = h.town();
        let default = h.engine.styles().default_path_style();
        let fine = h
            .engine
            .create_path_style(&PathStyleDef {
                name: "fine".to_string(),
                spacing: 0.1,
                ..PathStyleDef::default()
            })
            .unwrap();
        assert!(h.engine.styles().path(default).unwrap().is_subscribed(graph));

        h.engine.assign_path_style(graph, fine).unwrap();
        assert!(!h.engine.styles().path(default).unwrap().is_subscribed(graph));
        assert!(h.engine.styles().path(fine).unwrap().is_subscribed(graph));
        assert_eq!(
            h.engine.delete_path_style(fine),
            Err(EngineError::Style(StyleError::InUse(fine)))
        );

        h.engine.assign_path_style(graph, default).unwrap();
        assert_eq!(h.engine.delete_path_style(fine), Ok(()));
    }

    #[tokio::test]
    async fn test_edit_style_subscription_lives_with_session() {
        let mut h = Harness::new();
        let (graph, [a, ..]) = h.town();
        let style = h.engine.styles().default_edit_style();
        let user = h.user_at(Vec3::ZERO);
        let subscribed = |h: &Harness| h.engine.styles().edit(style).unwrap().is_subscribed(graph);

        assert!(!subscribed(&h));
        h.engine.enter_edit_mode(user, graph);
        assert!(subscribed(&h));

        h.engine
            .update_edit_style(style, EditStyleChange::NodeIcon("beacon".to_string()))
            .unwrap();
        let proxy = h.renderer.label_of(&format!("A #{a}")).unwrap();
        assert_eq!(h.renderer.spec(proxy).unwrap().icon, "beacon");

        h.engine.leave_edit_mode(user);
        assert!(!subscribed(&h));
    }

    #[tokio::test]
    async fn test_discovery_gating() {
        let mut h = Harness::new();
        let (graph, [a, b, c]) = h.town();
        let market = h.engine.create_group(graph, "market", true).unwrap();
        h.engine.set_node_group(graph, b, Some(market)).unwrap();
        h.engine.set_node_group(graph, c, Some(market)).unwrap();
        let user = h.user_at(Vec3::new(0.0, 0.5, 0.0));

        h.engine.request_route(user, graph, c).unwrap();
        h.engine.settle().await;
        for to in [Vec3::new(0.0, 0.5, 0.0), Vec3::new(10.0, 0.5, 0.0), Vec3::new(10.0, 10.0, 0.0)] {
            h.walk(user, to);
        }
        assert!(h.engine.path_session(user, graph).is_none());

        h.engine.set_discovery_gated(graph, true).unwrap();
        let visible: Vec<NodeId> = h
            .engine
            .visible_nodes(user, graph)
            .unwrap()
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(visible, vec![b, c]);
        assert_eq!(h.engine.discovered_locations(user, graph).unwrap(), vec!["market"]);
        assert_eq!(h.engine.max_discoverable_count(graph).unwrap(), 3);
        assert_eq!(
            h.engine.request_route(user, graph, a),
            Err(EngineError::NotVisible(a))
        );
    }

    #[tokio::test]
    async fn test_permission_hides_nodes_on_gated_maps() {
        let mut h = Harness::new();
        let (graph, [a, b, c]) = h.town();
        let gate = h.engine.create_group(graph, "gate", false).unwrap();
        for node in [a, b, c] {
            h.engine.set_node_group(graph, node, Some(gate)).unwrap();
        }
        h.engine
            .set_node_permission(graph, c, Some("vault".to_string()))
            .unwrap();
        h.engine.set_discovery_gated(graph, true).unwrap();
        let user = h.user_at(Vec3::ZERO);
        let visible = |h: &Harness| -> Vec<NodeId> {
            h.engine
                .visible_nodes(user, graph)
                .unwrap()
                .iter()
                .map(|n| n.id)
                .collect()
        };

        assert_eq!(visible(&h), vec![a, b]);
        h.presence.grant(user, "vault");
        assert_eq!(visible(&h), vec![a, b, c]);
    }

    #[tokio::test]
    async fn test_delete_graph_cascades() {
        let mut h = Harness::new();
        let (graph, [_, _, c]) = h.town();
        let walker = h.user_at(Vec3::new(0.0, 4.0, 0.0));
        let editor = h.user_at(Vec3::ZERO);

        h.engine.select_graph(walker, Some(graph)).unwrap();
        h.engine.request_route(walker, graph, c).unwrap();
        h.engine.settle().await;
        h.engine.tick();
        h.engine.enter_edit_mode(editor, graph);

        h.engine.delete_graph(graph).unwrap();
        assert!(h.engine.graph(graph).is_none());
        assert_eq!(h.engine.selected_graph(walker), None);
        assert_eq!(h.engine.editing(editor), None);
        assert!(h.engine.path_session(walker, graph).is_none());
        assert!(h.renderer.live_proxies().is_empty());
        assert!(h.renderer.markers(walker, MarkerLayer::Path(graph)).is_empty());
        assert!(h
            .messenger
            .notices_for(walker)
            .contains(&Notice::Cancelled {
                graph: "Town".to_string()
            }));
        assert_eq!(
            h.messenger.notices_for(editor),
            vec![Notice::EditModeEnded {
                graph: "Town".to_string()
            }]
        );

        h.engine.shutdown().await;
        assert!(h.repo.ops().contains(&PersistOp::DeleteGraph(graph)));
    }

    #[tokio::test]
    async fn test_graph_names_are_unique() {
        let mut h = Harness::new();
        let (graph, _) = h.town();
        let other = h.engine.create_graph("Harbor", "overworld").unwrap();

        assert_eq!(
            h.engine.create_graph("town", "nether"),
            Err(EngineError::DuplicateGraphName("town".to_string()))
        );
        assert_eq!(
            h.engine.rename_graph(other, "TOWN"),
            Err(EngineError::DuplicateGraphName("TOWN".to_string()))
        );
        h.engine.rename_graph(graph, "Old Town").unwrap();
        assert_eq!(h.engine.graph_by_name("old town").map(|m| m.id()), Some(graph));
    }

    #[tokio::test]
    async fn test_mutations_are_persisted() {
        let mut h = Harness::new();
        let (graph, [a, b, _]) = h.town();
        h.engine.disconnect(graph, a, b).unwrap();
        h.engine.remove_node(graph, a).unwrap();
        h.engine.shutdown().await;

        let ops = h.repo.ops();
        assert!(matches!(ops.first(), Some(PersistOp::SaveGraph(_))));
        assert!(ops.contains(&PersistOp::SaveEdge(graph, wayfinder_graph::EdgeKey::new(a, b))));
        assert!(ops.contains(&PersistOp::DeleteEdge(graph, wayfinder_graph::EdgeKey::new(a, b))));
        assert!(ops.contains(&PersistOp::DeleteNode(graph, a)));
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_state() {
        let mut h = Harness::with_repo(RecordingRepository::failing());
        let (graph, [a, b, c]) = h.town();
        h.engine.remove_node(graph, b).unwrap();
        h.engine.shutdown().await;

        let map = h.engine.graph(graph).unwrap();
        assert_eq!(map.node_count(), 2);
        assert!(map.node(a).is_some() && map.node(c).is_some());
        assert!(h.repo.ops().contains(&PersistOp::DeleteNode(graph, b)));
    }

    #[tokio::test]
    async fn test_disconnect_and_shutdown_leave_nothing_behind() {
        let mut h = Harness::new();
        let (graph, [_, _, c]) = h.town();
        let walker = h.user_at(Vec3::new(0.0, 4.0, 0.0));
        let editor = h.user_at(Vec3::ZERO);

        h.engine.request_route(walker, graph, c).unwrap();
        h.engine.settle().await;
        h.engine.tick();
        h.engine.enter_edit_mode(editor, graph);
        h.engine.enter_edit_mode(walker, graph);

        h.engine.disconnect_user(walker);
        assert!(h.renderer.markers(walker, MarkerLayer::Path(graph)).is_empty());
        assert!(h.renderer.visible_to(walker).is_empty());
        assert_eq!(h.engine.proxy_count(graph), 5);

        h.engine.shutdown().await;
        assert_eq!(h.engine.proxy_count(graph), 0);
        assert!(h.renderer.live_proxies().is_empty());
        assert!(h
            .repo
            .ops()
            .contains(&PersistOp::SaveDiscoveries(editor, BTreeSet::new())));
    }
}
