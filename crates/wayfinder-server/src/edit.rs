//! Live edit sessions.
//!
//! While at least one user edits a graph, every node and every edge has a
//! visual proxy. Graph changes are applied to the proxy set as they happen
//! through [`EditSessions::apply`]; the periodic [`EditSessions::maintain`]
//! only repositions proxies, adjusts per-editor visibility and redraws the
//! style preview.

use crate::collab::{MarkerLayer, Presence, ProxySpec, Renderer};
use crate::style::{EditField, EditStyle};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use wayfinder_core::{sample_line, Findable, GraphId, NodeId, PositionSource, ProxyId, UserId, Vec3};
use wayfinder_graph::{EdgeKey, GraphChange, RoadMap};

/// What an edit session reads and draws with.
pub struct EditContext<'a> {
    pub map: &'a RoadMap,
    pub style: &'a EditStyle,
    pub positions: &'a dyn PositionSource,
    pub presence: &'a dyn Presence,
    pub renderer: &'a mut dyn Renderer,
    /// Editors farther than this from a proxy do not see it.
    pub view_distance: f64,
}

impl EditContext<'_> {
    fn node_spec(&self, node: &Findable) -> ProxySpec {
        let group = self.map.group_of(node);
        let mut label = format!("{} #{}", node.name, node.id);
        if let Some(group) = group {
            label.push_str(&format!(" ({})", group.name));
        }
        ProxySpec {
            label: Some(label),
            icon: self.style.node_icon.get().clone(),
            position: node.resolve_position(self.positions),
            small: false,
            discoverable_group: group.is_some_and(|g| g.discoverable),
        }
    }

    fn edge_spec(&self, edge: EdgeKey) -> ProxySpec {
        ProxySpec {
            label: None,
            icon: self.style.edge_icon.get().clone(),
            position: self.edge_ends(edge).map(|(a, b)| a.midpoint(b)),
            small: true,
            discoverable_group: false,
        }
    }

    fn edge_ends(&self, edge: EdgeKey) -> Option<(Vec3, Vec3)> {
        let a = self.map.node(edge.first())?.resolve_position(self.positions)?;
        let b = self.map.node(edge.second())?.resolve_position(self.positions)?;
        Some((a, b))
    }
}

#[derive(Debug)]
struct Proxy {
    id: ProxyId,
    spec: ProxySpec,
}

/// The edit session of one graph.
#[derive(Debug)]
pub struct EditSession {
    graph: GraphId,
    editors: BTreeSet<UserId>,
    node_proxies: BTreeMap<NodeId, Proxy>,
    edge_proxies: BTreeMap<EdgeKey, Proxy>,
    /// Proxies each editor currently sees.
    shown: BTreeMap<UserId, BTreeSet<ProxyId>>,
    preview: Vec<Vec3>,
    preview_dirty: bool,
    ticks: u64,
}

impl EditSession {
    fn new(graph: GraphId) -> Self {
        Self {
            graph,
            editors: BTreeSet::new(),
            node_proxies: BTreeMap::new(),
            edge_proxies: BTreeMap::new(),
            shown: BTreeMap::new(),
            preview: Vec::new(),
            preview_dirty: true,
            ticks: 0,
        }
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn editors(&self) -> impl Iterator<Item = UserId> + '_ {
        self.editors.iter().copied()
    }

    pub fn proxy_count(&self) -> usize {
        self.node_proxies.len() + self.edge_proxies.len()
    }

    pub fn node_proxy(&self, node: NodeId) -> Option<(ProxyId, &ProxySpec)> {
        self.node_proxies.get(&node).map(|p| (p.id, &p.spec))
    }

    pub fn edge_proxy(&self, edge: EdgeKey) -> Option<(ProxyId, &ProxySpec)> {
        self.edge_proxies.get(&edge).map(|p| (p.id, &p.spec))
    }

    pub fn preview(&self) -> &[Vec3] {
        &self.preview
    }

    pub fn is_preview_dirty(&self) -> bool {
        self.preview_dirty
    }

    fn proxies(&self) -> impl Iterator<Item = &Proxy> {
        self.node_proxies.values().chain(self.edge_proxies.values())
    }

    fn destroy_all(&mut self, renderer: &mut dyn Renderer) {
        for proxy in self.proxies() {
            renderer.destroy_proxy(proxy.id);
        }
        self.node_proxies.clear();
        self.edge_proxies.clear();
        self.shown.clear();
    }

    fn forget_proxy(&mut self, id: ProxyId, renderer: &mut dyn Renderer) {
        renderer.destroy_proxy(id);
        for seen in self.shown.values_mut() {
            seen.remove(&id);
        }
    }

    fn hide_from(&mut self, user: UserId, renderer: &mut dyn Renderer) {
        for id in self.shown.remove(&user).unwrap_or_default() {
            renderer.set_proxy_visible(user, id, false);
        }
        renderer.clear_markers(user, MarkerLayer::Preview(self.graph));
    }

    /// Shows each editor the proxies within view distance and hides the
    /// rest. Editors that cannot be located keep what they see.
    fn update_visibility(&mut self, ctx: &mut EditContext<'_>) {
        for &editor in &self.editors {
            let Some(at) = ctx.presence.position(editor) else {
                continue;
            };
            let wanted: BTreeSet<ProxyId> = self
                .proxies()
                .filter(|p| p.spec.position.is_some_and(|pos| pos.distance(at) <= ctx.view_distance))
                .map(|p| p.id)
                .collect();
            let seen = self.shown.entry(editor).or_default();
            for &id in wanted.difference(seen) {
                ctx.renderer.set_proxy_visible(editor, id, true);
            }
            for &id in seen.difference(&wanted) {
                ctx.renderer.set_proxy_visible(editor, id, false);
            }
            *seen = wanted;
        }
    }

    fn regenerate_preview(&mut self, ctx: &EditContext<'_>) {
        let spacing = *ctx.style.spacing.get();
        let limit = *ctx.style.marker_limit.get();
        let mut points = Vec::new();
        for edge in self.edge_proxies.keys() {
            let room = limit.saturating_sub(points.len());
            if room == 0 {
                break;
            }
            if let Some((a, b)) = ctx.edge_ends(*edge) {
                points.extend(sample_line(a, b, spacing, room));
            }
        }
        self.preview = points;
        self.preview_dirty = false;
    }

    fn send_preview(&self, renderer: &mut dyn Renderer, icon: &str) {
        let layer = MarkerLayer::Preview(self.graph);
        for &editor in &self.editors {
            renderer.clear_markers(editor, layer);
            for &at in &self.preview {
                renderer.draw_marker(editor, layer, at, icon);
            }
        }
    }

    fn respec_node(&mut self, ctx: &mut EditContext<'_>, node: &Findable) {
        let spec = ctx.node_spec(node);
        if let Some(proxy) = self.node_proxies.get_mut(&node.id) {
            if proxy.spec != spec {
                ctx.renderer.update_proxy(proxy.id, &spec);
                proxy.spec = spec;
            }
        }
    }

    fn respec_edge(&mut self, ctx: &mut EditContext<'_>, edge: EdgeKey) {
        let spec = ctx.edge_spec(edge);
        if let Some(proxy) = self.edge_proxies.get_mut(&edge) {
            if proxy.spec != spec {
                ctx.renderer.update_proxy(proxy.id, &spec);
                proxy.spec = spec;
            }
        }
    }

    /// Brings every proxy in line with the graph and style.
    fn respec_all(&mut self, ctx: &mut EditContext<'_>) {
        let map = ctx.map;
        for node in map.nodes() {
            self.respec_node(ctx, node);
        }
        for edge in map.edges() {
            self.respec_edge(ctx, edge);
        }
    }
}

/// Every active edit session, keyed by graph.
///
/// A graph without an entry is Inactive and has no proxies.
#[derive(Debug, Default)]
pub struct EditSessions {
    sessions: BTreeMap<GraphId, EditSession>,
    next_proxy: u64,
}

impl EditSessions {
    pub fn get(&self, graph: GraphId) -> Option<&EditSession> {
        self.sessions.get(&graph)
    }

    pub fn is_active(&self, graph: GraphId) -> bool {
        self.sessions.contains_key(&graph)
    }

    pub fn proxy_count(&self, graph: GraphId) -> usize {
        self.sessions.get(&graph).map_or(0, EditSession::proxy_count)
    }

    pub fn active_graphs(&self) -> Vec<GraphId> {
        self.sessions.keys().copied().collect()
    }

    fn allocate(&mut self) -> ProxyId {
        self.next_proxy += 1;
        ProxyId(self.next_proxy)
    }

    fn spawn_node(&mut self, ctx: &mut EditContext<'_>, node: &Findable) -> Proxy {
        let id = self.allocate();
        let spec = ctx.node_spec(node);
        ctx.renderer.spawn_proxy(id, &spec);
        Proxy { id, spec }
    }

    fn spawn_edge(&mut self, ctx: &mut EditContext<'_>, edge: EdgeKey) -> Proxy {
        let id = self.allocate();
        let spec = ctx.edge_spec(edge);
        ctx.renderer.spawn_proxy(id, &spec);
        Proxy { id, spec }
    }

    /// Adds `user` as an editor of the map in `ctx`. The first editor
    /// builds the proxy set. Returns true if the session was just started.
    pub fn join(&mut self, ctx: &mut EditContext<'_>, user: UserId) -> bool {
        let map = ctx.map;
        let graph = map.id();
        let started = !self.sessions.contains_key(&graph);
        if started {
            let mut session = EditSession::new(graph);
            for node in map.nodes() {
                let proxy = self.spawn_node(ctx, node);
                session.node_proxies.insert(node.id, proxy);
            }
            for edge in map.edges() {
                let proxy = self.spawn_edge(ctx, edge);
                session.edge_proxies.insert(edge, proxy);
            }
            info!(graph = %graph, proxies = session.proxy_count(), "edit session started");
            self.sessions.insert(graph, session);
        }

        if let Some(session) = self.sessions.get_mut(&graph) {
            session.editors.insert(user);
            session.update_visibility(ctx);
            if !session.preview_dirty {
                let icon = ctx.style.edge_icon.get().clone();
                session.send_preview(ctx.renderer, &icon);
            }
        }
        debug!(graph = %graph, %user, "editor joined");
        started
    }

    /// Removes `user` from the session of `graph`. The last editor leaving
    /// destroys every proxy. Returns true if the session ended.
    pub fn leave(&mut self, graph: GraphId, user: UserId, renderer: &mut dyn Renderer) -> bool {
        let Some(session) = self.sessions.get_mut(&graph) else {
            return false;
        };
        if !session.editors.remove(&user) {
            return false;
        }
        session.hide_from(user, renderer);
        debug!(graph = %graph, %user, "editor left");
        if !session.editors.is_empty() {
            return false;
        }
        session.destroy_all(renderer);
        self.sessions.remove(&graph);
        info!(graph = %graph, "edit session ended");
        true
    }

    /// Ends the session of `graph` for everyone. Returns the former editors.
    pub fn end(&mut self, graph: GraphId, renderer: &mut dyn Renderer) -> Vec<UserId> {
        let Some(mut session) = self.sessions.remove(&graph) else {
            return Vec::new();
        };
        let editors: Vec<UserId> = session.editors.iter().copied().collect();
        for &user in &editors {
            session.hide_from(user, renderer);
        }
        session.destroy_all(renderer);
        info!(graph = %graph, "edit session ended");
        editors
    }

    /// Mirrors one graph change into the proxy set.
    pub fn apply(&mut self, ctx: &mut EditContext<'_>, change: &GraphChange) {
        let map = ctx.map;
        let graph = map.id();
        let Some(mut session) = self.sessions.remove(&graph) else {
            return;
        };

        match change {
            GraphChange::NodeAdded(id) => {
                if let Some(node) = map.node(*id) {
                    let proxy = self.spawn_node(ctx, node);
                    session.node_proxies.insert(*id, proxy);
                }
            }
            GraphChange::NodeUpdated(id) => {
                if let Some(node) = map.node(*id) {
                    session.respec_node(ctx, node);
                }
                for edge in map.edges_of(*id) {
                    session.respec_edge(ctx, edge);
                }
            }
            GraphChange::NodeRemoved { node, edges } => {
                for edge in edges {
                    if let Some(proxy) = session.edge_proxies.remove(edge) {
                        session.forget_proxy(proxy.id, ctx.renderer);
                    }
                }
                if let Some(proxy) = session.node_proxies.remove(&node.id) {
                    session.forget_proxy(proxy.id, ctx.renderer);
                }
            }
            GraphChange::EdgeAdded(edge) => {
                let proxy = self.spawn_edge(ctx, *edge);
                session.edge_proxies.insert(*edge, proxy);
            }
            GraphChange::EdgeRemoved(edge) => {
                if let Some(proxy) = session.edge_proxies.remove(edge) {
                    session.forget_proxy(proxy.id, ctx.renderer);
                }
            }
            GraphChange::GroupAdded(_) => {}
            GraphChange::GroupUpdated(group) => {
                for id in map.members(*group) {
                    if let Some(node) = map.node(id) {
                        session.respec_node(ctx, node);
                    }
                }
            }
            GraphChange::GroupRemoved { members, .. } => {
                for id in members {
                    if let Some(node) = map.node(*id) {
                        session.respec_node(ctx, node);
                    }
                }
            }
        }

        if change.is_topological() || matches!(change, GraphChange::NodeUpdated(_)) {
            session.preview_dirty = true;
            session.update_visibility(ctx);
        }
        self.sessions.insert(graph, session);
    }

    /// Reacts to a change of the graph's edit style.
    pub fn restyle(&mut self, ctx: &mut EditContext<'_>, field: EditField) {
        let Some(session) = self.sessions.get_mut(&ctx.map.id()) else {
            return;
        };
        match field {
            EditField::NodeIcon | EditField::EdgeIcon => session.respec_all(ctx),
            EditField::Spacing | EditField::MarkerLimit => session.preview_dirty = true,
            EditField::RefreshTicks => {}
        }
    }

    /// The periodic task of the session of the map in `ctx`. A call for a
    /// graph without editors does nothing.
    pub fn maintain(&mut self, ctx: &mut EditContext<'_>, proxy_refresh_ticks: u32) {
        let Some(session) = self.sessions.get_mut(&ctx.map.id()) else {
            return;
        };
        if session.editors.is_empty() {
            return;
        }
        session.ticks += 1;

        if session.ticks % u64::from(proxy_refresh_ticks.max(1)) == 0 {
            session.respec_all(ctx);
            session.update_visibility(ctx);
        }

        let icon = ctx.style.edge_icon.get().clone();
        if session.preview_dirty {
            session.regenerate_preview(ctx);
            session.send_preview(ctx.renderer, &icon);
        } else if session.ticks % u64::from((*ctx.style.refresh_ticks.get()).max(1)) == 0 {
            session.send_preview(ctx.renderer, &icon);
        }
    }

    /// Proxy ids currently shown to `user` on `graph`.
    pub fn shown_to(&self, graph: GraphId, user: UserId) -> Vec<ProxyId> {
        self.sessions
            .get(&graph)
            .and_then(|s| s.shown.get(&user))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn proxy_ids(&self, graph: GraphId) -> Vec<ProxyId> {
        self.sessions
            .get(&graph)
            .map(|s| s.proxies().map(|p| p.id).collect())
            .unwrap_or_default()
    }
}
