//! Path sessions: following a route one segment at a time.
//!
//! A session heads for `route[segment]`. The first segment starts at the
//! user, later ones at the previous route node. Each segment is drawn as a
//! cubic Bézier sampled once, with the path style captured at that moment;
//! afterwards the same markers are only redrawn at the style's cadence.

use crate::collab::{MarkerLayer, Renderer};
use crate::style::{PathStyle, SegmentStyle};
use tracing::debug;
use wayfinder_core::{sample_curve, GraphId, NodeId, PositionSource, UserId, Vec3};
use wayfinder_graph::RoadMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Arrived,
    Cancelled,
    Invalidated,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Arrived | Self::Cancelled | Self::Invalidated)
    }
}

/// Something the engine must act on after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowEvent {
    /// An intermediate node was reached.
    Reached(NodeId),
    /// The final node was reached; the session is over.
    Arrived(NodeId),
    /// Part of the route no longer exists; the session is over.
    Invalidated,
}

/// What a session reads and draws with during a tick.
pub struct FollowContext<'a> {
    pub map: &'a RoadMap,
    pub style: &'a PathStyle,
    pub positions: &'a dyn PositionSource,
    pub renderer: &'a mut dyn Renderer,
}

#[derive(Debug)]
struct RenderedSegment {
    index: usize,
    style: SegmentStyle,
    markers: Vec<Vec3>,
    since_draw: u32,
}

#[derive(Debug)]
pub struct PathSession {
    user: UserId,
    graph: GraphId,
    route: Vec<NodeId>,
    segment: usize,
    state: SessionState,
    rendered: Option<RenderedSegment>,
}

impl PathSession {
    /// Accepts a non-empty route.
    pub fn new(user: UserId, graph: GraphId, route: Vec<NodeId>) -> Self {
        Self {
            user,
            graph,
            route,
            segment: 0,
            state: SessionState::Created,
            rendered: None,
        }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn route(&self) -> &[NodeId] {
        &self.route
    }

    pub fn target(&self) -> Option<NodeId> {
        self.route.last().copied()
    }

    pub fn segment(&self) -> usize {
        self.segment
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Markers of the current segment, if it has been drawn.
    pub fn markers(&self) -> &[Vec3] {
        self.rendered.as_ref().map(|r| r.markers.as_slice()).unwrap_or(&[])
    }

    /// Whether the part of the route still ahead, including the edge being
    /// walked, exists in `map`.
    pub fn route_valid(&self, map: &RoadMap) -> bool {
        map.route_intact(&self.route[self.segment.saturating_sub(1)..])
    }

    /// Ends the session without arriving. Clears what it drew.
    pub fn cancel(&mut self, renderer: &mut dyn Renderer) {
        self.finish(SessionState::Cancelled, renderer);
    }

    pub fn invalidate(&mut self, renderer: &mut dyn Renderer) {
        self.finish(SessionState::Invalidated, renderer);
    }

    fn finish(&mut self, state: SessionState, renderer: &mut dyn Renderer) {
        if self.state.is_terminal() {
            return;
        }
        if self.rendered.take().is_some() {
            renderer.clear_markers(self.user, MarkerLayer::Path(self.graph));
        }
        debug!(user = %self.user, graph = %self.graph, segment = self.segment, ?state, "path session ended");
        self.state = state;
    }

    /// Advances one simulation step for a user standing at `user_pos`.
    pub fn tick(&mut self, ctx: &mut FollowContext<'_>, user_pos: Vec3) -> Option<FollowEvent> {
        if self.state.is_terminal() {
            return None;
        }
        if !self.route_valid(ctx.map) {
            self.invalidate(ctx.renderer);
            return Some(FollowEvent::Invalidated);
        }

        let mut event = None;
        let next = self.route[self.segment];
        // An NPC that cannot be located right now neither counts as reached
        // nor blocks the session.
        if let Some(next_pos) = self.node_position(ctx, next) {
            if user_pos.distance(next_pos) <= ctx.map.settings().arrival_distance {
                self.segment += 1;
                if self.segment == self.route.len() {
                    self.finish(SessionState::Arrived, ctx.renderer);
                    return Some(FollowEvent::Arrived(next));
                }
                event = Some(FollowEvent::Reached(next));
            }
        }

        self.render(ctx, user_pos);
        event
    }

    fn render(&mut self, ctx: &mut FollowContext<'_>, user_pos: Vec3) {
        let layer = MarkerLayer::Path(self.graph);
        let cadence = *ctx.style.refresh_ticks.get();

        if let Some(rendered) = self.rendered.as_mut().filter(|r| r.index == self.segment) {
            rendered.since_draw += 1;
            if rendered.since_draw >= cadence {
                rendered.since_draw = 0;
                draw(ctx.renderer, self.user, layer, rendered);
            }
            return;
        }

        let style = ctx.style.capture();
        let Some(markers) = self.segment_markers(ctx, user_pos, &style) else {
            return;
        };
        if self.rendered.is_some() {
            ctx.renderer.clear_markers(self.user, layer);
        }
        let rendered = RenderedSegment {
            index: self.segment,
            style,
            markers,
            since_draw: 0,
        };
        draw(ctx.renderer, self.user, layer, &rendered);
        self.rendered = Some(rendered);
        self.state = SessionState::Active;
    }

    fn node_position(&self, ctx: &FollowContext<'_>, id: NodeId) -> Option<Vec3> {
        ctx.map.node(id)?.resolve_position(ctx.positions)
    }

    fn segment_markers(
        &self,
        ctx: &FollowContext<'_>,
        user_pos: Vec3,
        style: &SegmentStyle,
    ) -> Option<Vec<Vec3>> {
        let default_tension = ctx.map.settings().default_tension;
        let tension_of = |id: NodeId| {
            ctx.map
                .node(id)
                .map_or(default_tension, |n| n.tension_or(default_tension))
        };

        let to_id = self.route[self.segment];
        let to = self.node_position(ctx, to_id)?;
        let (from, from_tension, before) = match self.segment {
            0 => (user_pos, default_tension, None),
            i => {
                let prev = self.route[i - 1];
                let before = i.checked_sub(2).and_then(|j| self.node_position(ctx, self.route[j]));
                (self.node_position(ctx, prev)?, tension_of(prev), before)
            }
        };
        let after = self
            .route
            .get(self.segment + 1)
            .and_then(|&id| self.node_position(ctx, id));

        let chord = to - from;
        let reach = chord.length() / 3.0;
        let out_dir = before.map_or(chord, |b| to - b).normalized();
        let in_dir = after.map_or(chord, |a| a - from).normalized();
        let c1 = from + out_dir * from_tension.min(reach);
        let c2 = to - in_dir * tension_of(to_id).min(reach);

        Some(sample_curve(
            from,
            c1,
            c2,
            to,
            style.spacing,
            style.marker_limit,
        ))
    }
}

fn draw(renderer: &mut dyn Renderer, user: UserId, layer: MarkerLayer, segment: &RenderedSegment) {
    for &at in &segment.markers {
        renderer.draw_marker(user, layer, at, &segment.style.icon);
    }
}
