//! Wayfinder Graph - Road maps and route search
//!
//! This crate owns the road map data model: named nodes, undirected edges
//! and discovery groups. It also provides the A* route search used by path
//! sessions and sled-backed persistence for road maps and discoveries.
//!
//! # Architecture
//!
//! A [`RoadMap`] keeps its edges in a petgraph `UnGraphMap`, so adjacency
//! is always symmetric. Every mutation returns a [`GraphChange`] telling
//! callers what to sync and persist. Searches never touch a live road map:
//! they run on a [`GraphSnapshot`] taken at request time.
//!
//! # Example
//!
//! ```
//! use wayfinder_graph::{find_route, RoadMap, RoadMapSettings, RouteOutcome};
//! use wayfinder_core::{GraphId, NoExternalPositions, StyleId, Vec3};
//!
//! let mut map = RoadMap::new(GraphId(1), RoadMapSettings {
//!     name: "Town".into(),
//!     zone: "overworld".into(),
//!     discovery_gated: false,
//!     arrival_distance: 1.5,
//!     default_tension: 3.0,
//!     path_style: StyleId(1),
//!     edit_style: StyleId(1),
//! });
//!
//! let ids: Vec<_> = ["A", "B"]
//!     .iter()
//!     .enumerate()
//!     .map(|(i, name)| map.add_waypoint(name, Vec3::new(i as f64 * 10.0, 0.0, 0.0)))
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! map.connect(ids[0], ids[1]).unwrap();
//!
//! let snapshot = map.snapshot(&NoExternalPositions);
//! match find_route(&snapshot, Vec3::ZERO, ids[1]) {
//!     RouteOutcome::Found(route) => assert_eq!(route.nodes, ids),
//!     RouteOutcome::NoRoute => unreachable!(),
//! }
//! ```

mod edge;
mod graph;
mod search;
mod store;

pub use edge::{EdgeKey, GraphChange};
pub use graph::{GraphError, RoadMap, RoadMapSettings};
pub use search::{find_route, shortest_path, GraphSnapshot, Route, RouteOutcome};
pub use store::{GraphRecord, GraphStore, StoreError};
