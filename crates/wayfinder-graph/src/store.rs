use crate::edge::EdgeKey;
use crate::graph::{RoadMap, RoadMapSettings};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use wayfinder_core::{Findable, GraphId, Group, GroupId, Marker, NodeId, UserId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Corrupt record for road map #{graph}: {reason}")]
    Corrupt { graph: GraphId, reason: String },
}

/// The stored form of a road map's own properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    pub id: GraphId,
    pub settings: RoadMapSettings,
    pub next_node: u32,
    pub next_group: u32,
}

impl GraphRecord {
    pub fn of(map: &RoadMap) -> Self {
        let (next_node, next_group) = map.next_ids();
        Self {
            id: map.id(),
            settings: map.settings().clone(),
            next_node,
            next_group,
        }
    }
}

/// Sled-backed storage for road maps and discovered markers.
///
/// Each kind of record lives in its own tree, keyed by big-endian ids
/// prefixed with the owning graph id so a whole graph can be scanned or
/// dropped by prefix.
pub struct GraphStore {
    db: Db,
    graphs: Tree,
    nodes: Tree,
    edges: Tree,
    groups: Tree,
    discoveries: Tree,
}

impl GraphStore {
    /// Opens or creates a graph store at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            graphs: db.open_tree("graphs")?,
            nodes: db.open_tree("nodes")?,
            edges: db.open_tree("edges")?,
            groups: db.open_tree("groups")?,
            discoveries: db.open_tree("discoveries")?,
            db,
        })
    }

    /// Loads every stored road map.
    ///
    /// Each graph loads independently: a corrupt graph yields an `Err` in
    /// its slot and the others still load.
    pub fn load_all(&self) -> Result<Vec<Result<RoadMap, StoreError>>, StoreError> {
        let mut maps = Vec::new();
        for entry in self.graphs.iter() {
            let (key, bytes) = entry?;
            maps.push(self.load_one(&key, &bytes));
        }
        Ok(maps)
    }

    fn load_one(&self, key: &[u8], bytes: &[u8]) -> Result<RoadMap, StoreError> {
        let record: GraphRecord = bincode::deserialize(bytes).map_err(|e| StoreError::Corrupt {
            graph: GraphId(read_u32(key, 0).unwrap_or_default()),
            reason: e.to_string(),
        })?;
        let prefix = record.id.0.to_be_bytes();
        let corrupt = |e: bincode::Error| StoreError::Corrupt {
            graph: record.id,
            reason: e.to_string(),
        };

        let mut nodes = Vec::new();
        for entry in self.nodes.scan_prefix(prefix) {
            let (_, value) = entry?;
            nodes.push(bincode::deserialize::<Findable>(&value).map_err(corrupt)?);
        }
        let mut groups = Vec::new();
        for entry in self.groups.scan_prefix(prefix) {
            let (_, value) = entry?;
            groups.push(bincode::deserialize::<Group>(&value).map_err(corrupt)?);
        }
        let mut edges = Vec::new();
        for entry in self.edges.scan_prefix(prefix) {
            let (key, _) = entry?;
            match (read_u32(&key, 4), read_u32(&key, 8)) {
                (Some(a), Some(b)) => edges.push(EdgeKey::new(NodeId(a), NodeId(b))),
                _ => {
                    return Err(StoreError::Corrupt {
                        graph: record.id,
                        reason: "malformed edge key".to_string(),
                    })
                }
            }
        }

        debug!(
            graph = %record.id,
            nodes = nodes.len(),
            edges = edges.len(),
            groups = groups.len(),
            "loaded road map"
        );
        let mut map = RoadMap::restore(record.id, record.settings, nodes, groups, edges);
        map.reserve_ids(record.next_node, record.next_group);
        Ok(map)
    }

    /// Saves a road map's own properties. Nodes, edges and groups are saved
    /// individually.
    pub fn save_graph(&self, record: &GraphRecord) -> Result<(), StoreError> {
        self.graphs
            .insert(record.id.0.to_be_bytes(), bincode::serialize(record)?)?;
        Ok(())
    }

    /// Saves a road map with everything in it.
    pub fn save_full(&self, map: &RoadMap) -> Result<(), StoreError> {
        self.save_graph(&GraphRecord::of(map))?;
        for node in map.nodes() {
            self.save_node(node)?;
        }
        for group in map.groups() {
            self.save_group(group)?;
        }
        for edge in map.edges() {
            self.save_edge(map.id(), edge)?;
        }
        Ok(())
    }

    /// Removes a road map and everything in it.
    pub fn delete_graph(&self, graph: GraphId) -> Result<(), StoreError> {
        let prefix = graph.0.to_be_bytes();
        self.graphs.remove(prefix)?;
        for tree in [&self.nodes, &self.edges, &self.groups] {
            for key in tree.scan_prefix(prefix).keys() {
                tree.remove(key?)?;
            }
        }
        Ok(())
    }

    pub fn save_node(&self, node: &Findable) -> Result<(), StoreError> {
        self.nodes
            .insert(pair_key(node.graph.0, node.id.0), bincode::serialize(node)?)?;
        Ok(())
    }

    pub fn delete_node(&self, graph: GraphId, node: NodeId) -> Result<(), StoreError> {
        self.nodes.remove(pair_key(graph.0, node.0))?;
        Ok(())
    }

    pub fn save_edge(&self, graph: GraphId, edge: EdgeKey) -> Result<(), StoreError> {
        self.edges.insert(edge_key(graph, edge), Vec::new())?;
        Ok(())
    }

    pub fn delete_edge(&self, graph: GraphId, edge: EdgeKey) -> Result<(), StoreError> {
        self.edges.remove(edge_key(graph, edge))?;
        Ok(())
    }

    pub fn save_group(&self, group: &Group) -> Result<(), StoreError> {
        self.groups
            .insert(pair_key(group.graph.0, group.id.0), bincode::serialize(group)?)?;
        Ok(())
    }

    pub fn delete_group(&self, graph: GraphId, group: GroupId) -> Result<(), StoreError> {
        self.groups.remove(pair_key(graph.0, group.0))?;
        Ok(())
    }

    /// Replaces a user's discovered markers.
    pub fn save_discoveries(&self, user: UserId, markers: &BTreeSet<Marker>) -> Result<(), StoreError> {
        self.discoveries
            .insert(user.0.as_bytes(), bincode::serialize(markers)?)?;
        Ok(())
    }

    pub fn load_discoveries(&self, user: UserId) -> Result<BTreeSet<Marker>, StoreError> {
        match self.discoveries.get(user.0.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(BTreeSet::new()),
        }
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn pair_key(graph: u32, id: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&graph.to_be_bytes());
    key[4..].copy_from_slice(&id.to_be_bytes());
    key
}

fn edge_key(graph: GraphId, edge: EdgeKey) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&graph.0.to_be_bytes());
    key[4..8].copy_from_slice(&edge.first().0.to_be_bytes());
    key[8..].copy_from_slice(&edge.second().0.to_be_bytes());
    key
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let slice = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes(slice.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{settings, town};
    use tempfile::tempdir;
    use wayfinder_core::{NpcRole, Vec3};

    #[test]
    fn test_save_load_graph() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();

        let (mut map, [a, b, c]) = town();
        map.add_npc("Smith", 42, NpcRole::Trader).unwrap();
        map.add_group("market", true).unwrap();
        store.save_full(&map).unwrap();

        let loaded: Vec<RoadMap> = store
            .load_all()
            .unwrap()
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(loaded.len(), 1);
        let restored = &loaded[0];
        assert_eq!(restored.name(), "Town");
        assert_eq!(restored.node_count(), 4);
        assert_eq!(restored.group_count(), 1);
        assert!(restored.has_edge(a, b));
        assert!(restored.has_edge(c, b));
        assert_eq!(restored.next_ids(), map.next_ids());
    }

    #[test]
    fn test_incremental_updates() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();
        let (map, [a, b, _]) = town();
        store.save_full(&map).unwrap();

        store.delete_edge(map.id(), EdgeKey::new(b, a)).unwrap();
        store.delete_node(map.id(), a).unwrap();

        let restored = store.load_all().unwrap().pop().unwrap().unwrap();
        assert_eq!(restored.node_count(), 2);
        assert_eq!(restored.edge_count(), 1);
    }

    #[test]
    fn test_corrupt_graph_does_not_block_others() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();

        let (map, _) = town();
        store.save_full(&map).unwrap();

        let other = RoadMap::new(GraphId(2), settings("Harbor"));
        store.save_full(&other).unwrap();
        store
            .nodes
            .insert(pair_key(2, 1), b"not a findable".to_vec())
            .unwrap();

        let results = store.load_all().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(StoreError::Corrupt { graph: GraphId(2), .. })
        ));
    }

    #[test]
    fn test_delete_graph_and_discoveries() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path()).unwrap();
        let (mut map, [a, ..]) = town();
        map.add_waypoint("D", Vec3::new(1.0, 1.0, 1.0)).unwrap();
        store.save_full(&map).unwrap();

        let user = UserId::new_v4();
        let markers: BTreeSet<_> = [Marker::Node(map.id(), a)].into_iter().collect();
        store.save_discoveries(user, &markers).unwrap();
        assert_eq!(store.load_discoveries(user).unwrap(), markers);
        assert!(store.load_discoveries(UserId::new_v4()).unwrap().is_empty());

        store.delete_graph(map.id()).unwrap();
        assert!(store.load_all().unwrap().is_empty());
        assert_eq!(store.nodes.len(), 0);
    }
}
