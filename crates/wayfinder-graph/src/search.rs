//! Shortest route search over an immutable snapshot of a road map.
//!
//! The snapshot is a plain value (positions plus adjacency), so a search can
//! run on a worker thread while the live road map keeps changing. Callers
//! must check that a returned route still exists before using it.
//!
//! Search is A* with Euclidean edge costs and a Euclidean heuristic. The
//! heuristic never overestimates the remaining cost, so the first time the
//! goal is popped its cost is minimal. Equal priorities pop in insertion
//! order, which keeps results stable across repeated queries.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};
use wayfinder_core::{NodeId, Vec3};

/// Positions and adjacency captured at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    positions: BTreeMap<NodeId, Vec3>,
    adjacency: BTreeMap<NodeId, Vec<NodeId>>,
}

impl GraphSnapshot {
    pub fn insert_node(&mut self, id: NodeId, position: Vec3) {
        self.positions.insert(id, position);
        self.adjacency.entry(id).or_default();
    }

    /// Adds an undirected edge. Ignored unless both ends are present.
    pub fn insert_edge(&mut self, a: NodeId, b: NodeId) {
        if a == b || !self.positions.contains_key(&a) || !self.positions.contains_key(&b) {
            return;
        }
        for (from, to) in [(a, b), (b, a)] {
            let list = self.adjacency.entry(from).or_default();
            if let Err(at) = list.binary_search(&to) {
                list.insert(at, to);
            }
        }
    }

    pub fn position(&self, id: NodeId) -> Option<Vec3> {
        self.positions.get(&id).copied()
    }

    pub fn neighbors(&self, id: NodeId) -> &[NodeId] {
        self.adjacency.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.positions.len()
    }

    /// Every node connected to `from`, including itself.
    fn component(&self, from: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            for &next in self.neighbors(current) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}

/// An ordered node sequence and its total edge cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub nodes: Vec<NodeId>,
    pub cost: f64,
}

impl Route {
    /// The route of a user already standing at the target.
    pub fn arrived() -> Self {
        Self {
            nodes: Vec::new(),
            cost: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Result of a route request.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Found(Route),
    /// The target cannot be reached. An expected outcome, not an error.
    NoRoute,
}

/// Routes from the node nearest to `start` that can reach `target`.
///
/// When the node nearest to `start` is the target itself the route is
/// empty, meaning the user has already arrived.
pub fn find_route(snapshot: &GraphSnapshot, start: Vec3, target: NodeId) -> RouteOutcome {
    if snapshot.position(target).is_none() {
        return RouteOutcome::NoRoute;
    }

    let closest = |ids: &mut dyn Iterator<Item = NodeId>| {
        ids.filter_map(|id| snapshot.position(id).map(|p| (id, p.distance(start))))
            .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
            .map(|(id, _)| id)
    };

    if closest(&mut snapshot.positions.keys().copied()) == Some(target) {
        return RouteOutcome::Found(Route::arrived());
    }

    let mut candidates = snapshot.component(target).into_iter().filter(|&id| id != target);
    let Some(from) = closest(&mut candidates) else {
        return RouteOutcome::NoRoute;
    };
    match shortest_path(snapshot, from, target) {
        Some(route) => RouteOutcome::Found(route),
        None => RouteOutcome::NoRoute,
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenNode {
    f: f64,
    g: f64,
    node: NodeId,
    tie: u64,
}

impl PartialEq for OpenNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenNode {}

impl Ord for OpenNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the lowest f, then the oldest entry.
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.tie.cmp(&self.tie))
    }
}

impl PartialOrd for OpenNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A* between two nodes of the snapshot.
///
/// Returns the full node sequence `from..=to`, or `None` when `to` is not
/// reachable.
pub fn shortest_path(snapshot: &GraphSnapshot, from: NodeId, to: NodeId) -> Option<Route> {
    let goal = snapshot.position(to)?;
    let origin = snapshot.position(from)?;
    if from == to {
        return Some(Route {
            nodes: vec![from],
            cost: 0.0,
        });
    }

    let mut g_score: BTreeMap<NodeId, f64> = BTreeMap::new();
    let mut came_from: BTreeMap<NodeId, NodeId> = BTreeMap::new();
    let mut open = BinaryHeap::new();

    g_score.insert(from, 0.0);
    open.push(OpenNode {
        f: origin.distance(goal),
        g: 0.0,
        node: from,
        tie: 0,
    });
    let mut tie: u64 = 1;

    while let Some(current) = open.pop() {
        if current.node == to {
            let mut nodes = vec![to];
            let mut cursor = to;
            while let Some(&prev) = came_from.get(&cursor) {
                nodes.push(prev);
                cursor = prev;
            }
            nodes.reverse();
            return Some(Route {
                nodes,
                cost: current.g,
            });
        }

        // Stale entry superseded by a cheaper one.
        if g_score.get(&current.node).is_some_and(|&g| current.g > g) {
            continue;
        }

        let Some(here) = snapshot.position(current.node) else {
            continue;
        };
        for &next in snapshot.neighbors(current.node) {
            let Some(there) = snapshot.position(next) else {
                continue;
            };
            let tentative = current.g + here.distance(there);
            if g_score.get(&next).is_some_and(|&g| tentative >= g) {
                continue;
            }
            g_score.insert(next, tentative);
            came_from.insert(next, current.node);
            open.push(OpenNode {
                f: tentative + there.distance(goal),
                g: tentative,
                node: next,
                tie,
            });
            tie += 1;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::town;
    use wayfinder_core::NoExternalPositions;

    fn grid_snapshot() -> GraphSnapshot {
        // 0 - 1 - 2
        // |   |   |
        // 3 - 4 - 5   plus a long detour 0 - 6 - 5
        let mut s = GraphSnapshot::default();
        let coords = [
            (0.0, 0.0),
            (4.0, 0.0),
            (8.0, 0.0),
            (0.0, 3.0),
            (4.0, 3.0),
            (8.0, 3.0),
            (4.0, -20.0),
        ];
        for (i, (x, y)) in coords.iter().enumerate() {
            s.insert_node(NodeId(i as u32), Vec3::new(*x, *y, 0.0));
        }
        for (a, b) in [(0, 1), (1, 2), (0, 3), (3, 4), (4, 5), (1, 4), (2, 5), (0, 6), (6, 5)] {
            s.insert_edge(NodeId(a), NodeId(b));
        }
        s
    }

    fn path_cost(s: &GraphSnapshot, nodes: &[NodeId]) -> f64 {
        nodes
            .windows(2)
            .map(|w| s.position(w[0]).unwrap().distance(s.position(w[1]).unwrap()))
            .sum()
    }

    fn brute_force_min(s: &GraphSnapshot, from: NodeId, to: NodeId) -> Option<f64> {
        fn walk(
            s: &GraphSnapshot,
            at: NodeId,
            to: NodeId,
            path: &mut Vec<NodeId>,
            best: &mut Option<f64>,
        ) {
            if at == to {
                let cost = path_cost(s, path);
                if best.map_or(true, |b| cost < b) {
                    *best = Some(cost);
                }
                return;
            }
            for &next in s.neighbors(at) {
                if !path.contains(&next) {
                    path.push(next);
                    walk(s, next, to, path, best);
                    path.pop();
                }
            }
        }
        let mut best = None;
        walk(s, from, to, &mut vec![from], &mut best);
        best
    }

    #[test]
    fn test_town_route() {
        let (map, [a, b, c]) = town();
        let snapshot = map.snapshot(&NoExternalPositions);
        let outcome = find_route(&snapshot, Vec3::new(0.0, 0.0, 0.0), c);
        match outcome {
            RouteOutcome::Found(route) => {
                assert_eq!(route.nodes, vec![a, b, c]);
                assert!((route.cost - 20.0).abs() < 1e-9);
            }
            RouteOutcome::NoRoute => panic!("expected a route"),
        }
    }

    #[test]
    fn test_routes_are_minimal() {
        let s = grid_snapshot();
        for from in 0..7 {
            for to in 0..7 {
                let (from, to) = (NodeId(from), NodeId(to));
                let route = shortest_path(&s, from, to).expect("grid is connected");
                let expected = brute_force_min(&s, from, to).unwrap();
                assert!(
                    (route.cost - expected).abs() < 1e-9,
                    "{from}->{to}: got {} expected {expected}",
                    route.cost
                );
                assert!((path_cost(&s, &route.nodes) - route.cost).abs() < 1e-9);
                assert_eq!(route.nodes.first(), Some(&from));
                assert_eq!(route.nodes.last(), Some(&to));
            }
        }
    }

    #[test]
    fn test_equal_cost_routes_are_deterministic() {
        // Two equally long ways round a square.
        let mut s = GraphSnapshot::default();
        s.insert_node(NodeId(1), Vec3::new(0.0, 0.0, 0.0));
        s.insert_node(NodeId(2), Vec3::new(5.0, 0.0, 0.0));
        s.insert_node(NodeId(3), Vec3::new(0.0, 5.0, 0.0));
        s.insert_node(NodeId(4), Vec3::new(5.0, 5.0, 0.0));
        s.insert_edge(NodeId(1), NodeId(2));
        s.insert_edge(NodeId(1), NodeId(3));
        s.insert_edge(NodeId(2), NodeId(4));
        s.insert_edge(NodeId(3), NodeId(4));

        let first = shortest_path(&s, NodeId(1), NodeId(4)).unwrap();
        for _ in 0..10 {
            assert_eq!(shortest_path(&s, NodeId(1), NodeId(4)).unwrap(), first);
        }
        assert_eq!(first.nodes, vec![NodeId(1), NodeId(2), NodeId(4)]);
    }

    #[test]
    fn test_unreachable_target() {
        let mut s = grid_snapshot();
        s.insert_node(NodeId(99), Vec3::new(100.0, 0.0, 0.0));
        assert_eq!(find_route(&s, Vec3::ZERO, NodeId(99)), RouteOutcome::NoRoute);
        assert!(shortest_path(&s, NodeId(0), NodeId(99)).is_none());
        assert_eq!(find_route(&s, Vec3::ZERO, NodeId(1234)), RouteOutcome::NoRoute);
    }

    #[test]
    fn test_start_at_target_is_empty_route() {
        let (map, [.., c]) = town();
        let snapshot = map.snapshot(&NoExternalPositions);
        let outcome = find_route(&snapshot, Vec3::new(10.0, 10.5, 0.0), c);
        assert_eq!(outcome, RouteOutcome::Found(Route::arrived()));
    }

    #[test]
    fn test_start_snaps_to_reachable_node() {
        // An isolated node sits right next to the start; the route must
        // begin at the nearest node that can actually reach the target.
        let (mut map, [a, b, c]) = town();
        map.add_waypoint("island", Vec3::new(-1.0, 0.0, 0.0)).unwrap();
        let snapshot = map.snapshot(&NoExternalPositions);
        match find_route(&snapshot, Vec3::new(-1.0, 0.0, 0.0), c) {
            RouteOutcome::Found(route) => assert_eq!(route.nodes, vec![a, b, c]),
            RouteOutcome::NoRoute => panic!("expected a route"),
        }
    }

    #[test]
    fn test_long_chain_component() {
        let mut s = GraphSnapshot::default();
        for i in 0..5_000u32 {
            s.insert_node(NodeId(i), Vec3::new(f64::from(i), 0.0, 0.0));
            if i > 0 {
                s.insert_edge(NodeId(i - 1), NodeId(i));
            }
        }
        s.insert_node(NodeId(9_999), Vec3::new(-50.0, 0.0, 0.0));

        let component = s.component(NodeId(0));
        assert_eq!(component.len(), 5_000);
        assert!(!component.contains(&NodeId(9_999)));

        match find_route(&s, Vec3::new(-1.0, 0.0, 0.0), NodeId(4_999)) {
            RouteOutcome::Found(route) => {
                assert_eq!(route.nodes.len(), 5_000);
                assert!((route.cost - 4_999.0).abs() < 1e-6);
            }
            RouteOutcome::NoRoute => panic!("expected a route"),
        }
    }
}
