//! Per-user state: graph selection, path sessions, edit membership and
//! discoveries.
//!
//! Graphs are referenced by id only. A deleted graph leaves at most a
//! stale id behind, which every lookup treats as "not found".

use crate::follower::PathSession;
use std::collections::{BTreeMap, BTreeSet};
use wayfinder_core::{GraphId, Marker, UserId};

#[derive(Debug)]
pub struct UserState {
    pub id: UserId,
    pub selected: Option<GraphId>,
    /// At most one session per graph.
    pub paths: BTreeMap<GraphId, PathSession>,
    /// The graph this user is editing, if any.
    pub editing: Option<GraphId>,
    pub discovered: BTreeSet<Marker>,
}

impl UserState {
    pub fn new(id: UserId, discovered: BTreeSet<Marker>) -> Self {
        Self {
            id,
            selected: None,
            paths: BTreeMap::new(),
            editing: None,
            discovered,
        }
    }

    /// Records a discovery. Returns true if it is new.
    pub fn discover(&mut self, marker: Marker) -> bool {
        self.discovered.insert(marker)
    }

    /// Drops every reference to `graph`. Returns true if any discovery was
    /// removed.
    pub fn forget_graph(&mut self, graph: GraphId) -> bool {
        if self.selected == Some(graph) {
            self.selected = None;
        }
        if self.editing == Some(graph) {
            self.editing = None;
        }
        self.paths.remove(&graph);
        let before = self.discovered.len();
        self.discovered.retain(|m| m.graph() != graph);
        before != self.discovered.len()
    }
}

/// Connected users.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: BTreeMap<UserId, UserState>,
}

impl UserRegistry {
    /// Registers a user. Reconnecting keeps the existing state.
    pub fn connect(&mut self, id: UserId, discovered: BTreeSet<Marker>) -> &mut UserState {
        self.users
            .entry(id)
            .or_insert_with(|| UserState::new(id, discovered))
    }

    pub fn disconnect(&mut self, id: UserId) -> Option<UserState> {
        self.users.remove(&id)
    }

    pub fn get(&self, id: UserId) -> Option<&UserState> {
        self.users.get(&id)
    }

    pub fn get_mut(&mut self, id: UserId) -> Option<&mut UserState> {
        self.users.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<UserId> {
        self.users.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UserState> {
        self.users.values_mut()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
