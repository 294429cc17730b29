//! Wayfinder Core - the vocabulary shared by every other crate
//!
//! This crate defines what a road map is made of: findable nodes, groups,
//! identifiers, and the small amount of 3-D geometry needed to route between
//! them and draw guide curves.
//!
//! Nodes come in two flavours. A waypoint stores its coordinates; an
//! NPC-linked node asks a [`PositionSource`] where its entity currently is.
//! Everything else treats both the same way through
//! [`Findable::resolve_position`].
//!
//! # Example
//!
//! ```
//! use wayfinder_core::{Findable, GraphId, NodeId, NoExternalPositions, Vec3};
//!
//! let node = Findable::waypoint(NodeId(1), GraphId(1), "fountain", Vec3::new(4.0, 64.0, 2.0));
//! assert_eq!(node.resolve_position(&NoExternalPositions), Some(Vec3::new(4.0, 64.0, 2.0)));
//! ```

mod findable;
mod geometry;
mod ids;

pub use findable::{Findable, FindableKind, Group, Marker, NoExternalPositions, NpcRole, PositionSource};
pub use geometry::{sample_curve, sample_line, ParseVec3Error, Vec3};
pub use ids::{GraphId, GroupId, NodeId, ProxyId, StyleId, UserId};
