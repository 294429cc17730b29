//! Wayfinder Server - the authoritative pathfinding engine
//!
//! This crate owns every road map at runtime and drives what users see of
//! them:
//!
//! - Path sessions that guide a user along a route with markers
//! - Live edit sessions that mirror a graph as visual proxies
//! - Visualization styles whose changes reach the graphs using them
//! - Background route searches and fire-and-forget storage writes
//!
//! Rendering, messaging and player presence are supplied by the host
//! through the traits in [`collab`].

pub mod collab;
mod config;
mod dispatch;
mod edit;
mod engine;
mod follower;
mod persistence;
mod registry;
mod style;
mod users;

#[cfg(test)]
mod testing;

pub use collab::{
    Collaborators, LogMessenger, MarkerLayer, Messenger, Notice, NullRenderer, Presence, ProxySpec,
    Renderer,
};
pub use config::{ConfigError, EditStyleDef, EngineConfig, PathStyleDef, DEFAULT_STYLE};
pub use dispatch::{Dispatcher, Ticket};
pub use edit::{EditSession, EditSessions};
pub use engine::{Engine, EngineError};
pub use follower::{FollowEvent, PathSession, SessionState};
pub use persistence::{PersistOp, Persistence, Repository};
pub use style::{
    EditField, EditStyle, EditStyleChange, PathField, PathStyle, PathStyleChange, SegmentStyle,
    StyleError, StyleEvent, StyleField, StyleRegistry, MIN_SPACING,
};
