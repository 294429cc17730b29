//! Interfaces to the systems the engine drives but does not own.
//!
//! The engine only hands out coordinates, labels, icon identifiers and
//! visibility instructions. Drawing, delivering chat and knowing where a
//! user stands are somebody else's job.

use serde::Serialize;
use std::fmt;
use wayfinder_core::{GraphId, PositionSource, ProxyId, UserId, Vec3};

/// What a visual proxy should look like.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxySpec {
    /// Floating name tag; edge proxies have none.
    pub label: Option<String>,
    pub icon: String,
    /// `None` when the represented node cannot be located right now.
    pub position: Option<Vec3>,
    pub small: bool,
    /// The node belongs to a discoverable group.
    pub discoverable_group: bool,
}

/// A named set of guide markers shown to one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MarkerLayer {
    /// Markers of a path session on the graph.
    Path(GraphId),
    /// The edit-mode style preview of the graph.
    Preview(GraphId),
}

/// Creates, moves and removes proxies and draws guide markers.
pub trait Renderer: Send {
    fn spawn_proxy(&mut self, id: ProxyId, spec: &ProxySpec);
    fn update_proxy(&mut self, id: ProxyId, spec: &ProxySpec);
    fn destroy_proxy(&mut self, id: ProxyId);
    fn set_proxy_visible(&mut self, viewer: UserId, id: ProxyId, visible: bool);
    fn draw_marker(&mut self, viewer: UserId, layer: MarkerLayer, at: Vec3, icon: &str);
    fn clear_markers(&mut self, viewer: UserId, layer: MarkerLayer);
}

/// A notification for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Arrived { graph: String, target: String },
    NoRoute { graph: String, target: String },
    Cancelled { graph: String },
    Invalidated { graph: String },
    GraphDeleted { graph: String },
    EditModeEnded { graph: String },
    Discovered { graph: String, location: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arrived { target, .. } => write!(f, "You reached {target}."),
            Self::NoRoute { target, .. } => write!(f, "No route to {target}."),
            Self::Cancelled { graph } => write!(f, "Navigation on {graph} cancelled."),
            Self::Invalidated { graph } => {
                write!(f, "Your route on {graph} changed and is no longer valid.")
            }
            Self::GraphDeleted { graph } => write!(f, "Road map {graph} was deleted."),
            Self::EditModeEnded { graph } => write!(f, "Edit mode on {graph} ended."),
            Self::Discovered { location, .. } => write!(f, "Discovered {location}."),
        }
    }
}

/// Delivers notices.
pub trait Messenger: Send {
    fn notify(&mut self, user: UserId, notice: Notice);
}

/// Where users are and what they may do.
pub trait Presence: Send {
    fn is_online(&self, user: UserId) -> bool;
    /// `None` when the user is offline or not in a world.
    fn position(&self, user: UserId) -> Option<Vec3>;
    fn has_permission(&self, user: UserId, tag: &str) -> bool;
}

/// Everything the engine talks to.
pub struct Collaborators {
    pub renderer: Box<dyn Renderer>,
    pub messenger: Box<dyn Messenger>,
    pub presence: Box<dyn Presence>,
    pub positions: Box<dyn PositionSource + Send>,
}

/// A renderer with no output, for headless runs.
#[derive(Debug, Default)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn spawn_proxy(&mut self, _id: ProxyId, _spec: &ProxySpec) {}
    fn update_proxy(&mut self, _id: ProxyId, _spec: &ProxySpec) {}
    fn destroy_proxy(&mut self, _id: ProxyId) {}
    fn set_proxy_visible(&mut self, _viewer: UserId, _id: ProxyId, _visible: bool) {}
    fn draw_marker(&mut self, _viewer: UserId, _layer: MarkerLayer, _at: Vec3, _icon: &str) {}
    fn clear_markers(&mut self, _viewer: UserId, _layer: MarkerLayer) {}
}

/// Writes notices to the log.
#[derive(Debug, Default)]
pub struct LogMessenger;

impl Messenger for LogMessenger {
    fn notify(&mut self, user: UserId, notice: Notice) {
        tracing::info!(%user, "{}", notice);
    }
}
