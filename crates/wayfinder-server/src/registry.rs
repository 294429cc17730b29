//! Every loaded road map, addressable by id or by name.

use std::collections::BTreeMap;
use wayfinder_core::GraphId;
use wayfinder_graph::{RoadMap, RoadMapSettings};

#[derive(Debug, Default)]
pub struct GraphRegistry {
    maps: BTreeMap<GraphId, RoadMap>,
    next_id: u32,
}

impl GraphRegistry {
    /// Whether no road map other than `except` is named `name`, ignoring
    /// case.
    pub fn is_name_free(&self, name: &str, except: Option<GraphId>) -> bool {
        !self
            .maps
            .values()
            .any(|m| Some(m.id()) != except && m.name().eq_ignore_ascii_case(name))
    }

    /// Creates an empty road map. The caller checks the name.
    pub fn create(&mut self, settings: RoadMapSettings) -> &mut RoadMap {
        self.next_id = self.next_id.max(1);
        let id = GraphId(self.next_id);
        self.next_id += 1;
        self.maps.entry(id).or_insert_with(|| RoadMap::new(id, settings))
    }

    /// Adds a road map loaded from storage.
    pub fn insert(&mut self, map: RoadMap) {
        self.next_id = self.next_id.max(map.id().0 + 1);
        self.maps.insert(map.id(), map);
    }

    pub fn remove(&mut self, id: GraphId) -> Option<RoadMap> {
        self.maps.remove(&id)
    }

    pub fn get(&self, id: GraphId) -> Option<&RoadMap> {
        self.maps.get(&id)
    }

    pub fn get_mut(&mut self, id: GraphId) -> Option<&mut RoadMap> {
        self.maps.get_mut(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&RoadMap> {
        self.maps.values().find(|m| m.name().eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoadMap> {
        self.maps.values()
    }

    pub fn ids(&self) -> Vec<GraphId> {
        self.maps.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
