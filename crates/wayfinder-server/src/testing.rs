//! Recording fakes for the engine's collaborators.

use crate::collab::{MarkerLayer, Messenger, Notice, Presence, ProxySpec, Renderer};
use crate::persistence::{PersistOp, Repository};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wayfinder_core::{GraphId, NodeId, PositionSource, ProxyId, StyleId, UserId, Vec3};
use wayfinder_graph::{RoadMap, RoadMapSettings, StoreError};

pub fn settings(name: &str) -> RoadMapSettings {
    RoadMapSettings {
        name: name.to_string(),
        zone: "overworld".to_string(),
        discovery_gated: false,
        arrival_distance: 1.5,
        default_tension: 3.0,
        path_style: StyleId(1),
        edit_style: StyleId(2),
    }
}

/// A(0,0,0) - B(10,0,0) - C(10,10,0).
pub fn town() -> (RoadMap, [NodeId; 3]) {
    let mut map = RoadMap::new(GraphId(1), settings("Town"));
    let a = map.add_waypoint("A", Vec3::new(0.0, 0.0, 0.0)).unwrap();
    let b = map.add_waypoint("B", Vec3::new(10.0, 0.0, 0.0)).unwrap();
    let c = map.add_waypoint("C", Vec3::new(10.0, 10.0, 0.0)).unwrap();
    map.connect(a, b).unwrap();
    map.connect(b, c).unwrap();
    (map, [a, b, c])
}

#[derive(Debug, Default)]
struct RenderLog {
    proxies: BTreeMap<ProxyId, ProxySpec>,
    visible: BTreeMap<UserId, BTreeSet<ProxyId>>,
    markers: BTreeMap<(UserId, MarkerLayer), Vec<Vec3>>,
    draws: BTreeMap<UserId, usize>,
}

/// Keeps the current picture: live proxies, who sees which, and markers.
#[derive(Debug, Clone, Default)]
pub struct RecordingRenderer(Arc<Mutex<RenderLog>>);

impl RecordingRenderer {
    fn log(&self) -> std::sync::MutexGuard<'_, RenderLog> {
        self.0.lock().unwrap()
    }

    pub fn live_proxies(&self) -> BTreeMap<ProxyId, ProxySpec> {
        self.log().proxies.clone()
    }

    pub fn spec(&self, id: ProxyId) -> Option<ProxySpec> {
        self.log().proxies.get(&id).cloned()
    }

    pub fn label_of(&self, label: &str) -> Option<ProxyId> {
        self.log()
            .proxies
            .iter()
            .find(|(_, spec)| spec.label.as_deref() == Some(label))
            .map(|(id, _)| *id)
    }

    pub fn visible_to(&self, user: UserId) -> BTreeSet<ProxyId> {
        self.log().visible.get(&user).cloned().unwrap_or_default()
    }

    pub fn markers(&self, user: UserId, layer: MarkerLayer) -> Vec<Vec3> {
        self.log().markers.get(&(user, layer)).cloned().unwrap_or_default()
    }

    /// Total marker draw calls for `user`, across clears.
    pub fn marker_draws(&self, user: UserId) -> usize {
        self.log().draws.get(&user).copied().unwrap_or(0)
    }
}

impl Renderer for RecordingRenderer {
    fn spawn_proxy(&mut self, id: ProxyId, spec: &ProxySpec) {
        let previous = self.log().proxies.insert(id, spec.clone());
        assert!(previous.is_none(), "proxy {id:?} spawned twice");
    }

    fn update_proxy(&mut self, id: ProxyId, spec: &ProxySpec) {
        let mut log = self.log();
        assert!(log.proxies.contains_key(&id), "update of dead proxy {id:?}");
        log.proxies.insert(id, spec.clone());
    }

    fn destroy_proxy(&mut self, id: ProxyId) {
        let mut log = self.log();
        assert!(log.proxies.remove(&id).is_some(), "destroy of dead proxy {id:?}");
        for seen in log.visible.values_mut() {
            seen.remove(&id);
        }
    }

    fn set_proxy_visible(&mut self, viewer: UserId, id: ProxyId, visible: bool) {
        let mut log = self.log();
        let seen = log.visible.entry(viewer).or_default();
        if visible {
            seen.insert(id);
        } else {
            seen.remove(&id);
        }
    }

    fn draw_marker(&mut self, viewer: UserId, layer: MarkerLayer, at: Vec3, _icon: &str) {
        let mut log = self.log();
        log.markers.entry((viewer, layer)).or_default().push(at);
        *log.draws.entry(viewer).or_default() += 1;
    }

    fn clear_markers(&mut self, viewer: UserId, layer: MarkerLayer) {
        self.log().markers.remove(&(viewer, layer));
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingMessenger(Arc<Mutex<Vec<(UserId, Notice)>>>);

impl RecordingMessenger {
    pub fn notices_for(&self, user: UserId) -> Vec<Notice> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == user)
            .map(|(_, notice)| notice.clone())
            .collect()
    }
}

impl Messenger for RecordingMessenger {
    fn notify(&mut self, user: UserId, notice: Notice) {
        self.0.lock().unwrap().push((user, notice));
    }
}

#[derive(Debug, Default)]
struct PresenceState {
    positions: BTreeMap<UserId, Vec3>,
    permissions: BTreeSet<(UserId, String)>,
}

/// Users are online once placed.
#[derive(Debug, Clone, Default)]
pub struct FakePresence(Arc<Mutex<PresenceState>>);

impl FakePresence {
    pub fn place(&self, user: UserId, at: Vec3) {
        self.0.lock().unwrap().positions.insert(user, at);
    }

    pub fn remove(&self, user: UserId) {
        self.0.lock().unwrap().positions.remove(&user);
    }

    pub fn grant(&self, user: UserId, tag: &str) {
        self.0
            .lock()
            .unwrap()
            .permissions
            .insert((user, tag.to_string()));
    }
}

impl Presence for FakePresence {
    fn is_online(&self, user: UserId) -> bool {
        self.0.lock().unwrap().positions.contains_key(&user)
    }

    fn position(&self, user: UserId) -> Option<Vec3> {
        self.0.lock().unwrap().positions.get(&user).copied()
    }

    fn has_permission(&self, user: UserId, tag: &str) -> bool {
        self.0
            .lock()
            .unwrap()
            .permissions
            .contains(&(user, tag.to_string()))
    }
}

/// External entity positions that tests can move.
#[derive(Debug, Clone, Default)]
pub struct FakePositions(Arc<Mutex<BTreeMap<u32, Vec3>>>);

impl FakePositions {
    pub fn set(&self, external_id: u32, at: Vec3) {
        self.0.lock().unwrap().insert(external_id, at);
    }

    pub fn remove(&self, external_id: u32) {
        self.0.lock().unwrap().remove(&external_id);
    }
}

impl PositionSource for FakePositions {
    fn current_position(&self, external_id: u32) -> Option<Vec3> {
        self.0.lock().unwrap().get(&external_id).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingRepository {
    ops: Arc<Mutex<Vec<PersistOp>>>,
    failing: bool,
    delay: Duration,
}

impl RecordingRepository {
    /// Records every operation and then reports a failure.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Takes `delay` to apply each operation.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn ops(&self) -> Vec<PersistOp> {
        self.ops.lock().unwrap().clone()
    }
}

impl Repository for RecordingRepository {
    fn apply(&self, op: &PersistOp) -> Result<(), StoreError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.ops.lock().unwrap().push(op.clone());
        if self.failing {
            return Err(StoreError::Corrupt {
                graph: GraphId(0),
                reason: "disk on fire".to_string(),
            });
        }
        Ok(())
    }
}
