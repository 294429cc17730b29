//! Path and edit styles, and the per-field subscription channel.
//!
//! Every mutable style field keeps its own subscriber map keyed by the
//! owning graph's id. Setting a field calls each subscriber once, on the
//! calling thread. The engine's subscribers only post a [`StyleEvent`] to
//! its inbox, so no rendering happens inside a callback.

use crate::config::{EditStyleDef, PathStyleDef, DEFAULT_STYLE};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;
use wayfinder_core::{GraphId, StyleId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StyleError {
    #[error("unknown style #{0}")]
    Unknown(StyleId),
    #[error("a style named \"{0}\" already exists")]
    DuplicateName(String),
    #[error("style #{0} is still assigned to a road map")]
    InUse(StyleId),
    #[error("the default style cannot be deleted")]
    DefaultStyle,
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: f64 },
}

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A style value with subscribers.
pub struct StyleField<T> {
    value: T,
    subscribers: BTreeMap<GraphId, Callback<T>>,
}

impl<T> StyleField<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            subscribers: BTreeMap::new(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Registers `callback` for `owner`, replacing any earlier one.
    pub fn subscribe<F>(&mut self, owner: GraphId, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribers.insert(owner, Box::new(callback));
    }

    /// Removes `owner`'s callback. Returns false if there was none.
    pub fn unsubscribe(&mut self, owner: GraphId) -> bool {
        self.subscribers.remove(&owner).is_some()
    }

    pub fn is_subscribed(&self, owner: GraphId) -> bool {
        self.subscribers.contains_key(&owner)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Stores a new value and notifies every current subscriber once.
    pub fn set(&mut self, value: T) {
        self.value = value;
        for callback in self.subscribers.values() {
            callback(&self.value);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for StyleField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StyleField")
            .field("value", &self.value)
            .field("subscribers", &self.subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathField {
    Spacing,
    Icon,
    RefreshTicks,
    MarkerLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditField {
    NodeIcon,
    EdgeIcon,
    Spacing,
    RefreshTicks,
    MarkerLimit,
}

/// Posted to the engine when a subscribed style field changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleEvent {
    Path { graph: GraphId, field: PathField },
    Edit { graph: GraphId, field: EditField },
}

fn forward<T: 'static>(
    sink: &UnboundedSender<StyleEvent>,
    event: StyleEvent,
) -> impl Fn(&T) + Send + Sync + 'static {
    let sink = sink.clone();
    move |_: &T| {
        // The receiver only goes away with the engine.
        let _ = sink.send(event);
    }
}

/// Smallest marker spacing a style accepts, in blocks.
pub const MIN_SPACING: f64 = 0.05;

fn check_spacing(value: f64) -> Result<f64, StyleError> {
    if value.is_finite() && value >= MIN_SPACING {
        Ok(value)
    } else {
        Err(StyleError::InvalidValue {
            field: "spacing",
            value,
        })
    }
}

fn check_ticks(value: u32) -> Result<u32, StyleError> {
    if value == 0 {
        return Err(StyleError::InvalidValue {
            field: "refresh ticks",
            value: 0.0,
        });
    }
    Ok(value)
}

// ─────────────────────────────────────────────────────────────────────────────
// Path styles
// ─────────────────────────────────────────────────────────────────────────────

/// A change to one path style field.
#[derive(Debug, Clone, PartialEq)]
pub enum PathStyleChange {
    Spacing(f64),
    Icon(String),
    RefreshTicks(u32),
    MarkerLimit(usize),
}

/// How guide markers of a path session look.
#[derive(Debug)]
pub struct PathStyle {
    pub id: StyleId,
    pub name: String,
    pub spacing: StyleField<f64>,
    pub icon: StyleField<String>,
    pub refresh_ticks: StyleField<u32>,
    pub marker_limit: StyleField<usize>,
}

/// The parts of a path style fixed for the lifetime of one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentStyle {
    pub spacing: f64,
    pub icon: String,
    pub marker_limit: usize,
}

impl PathStyle {
    pub fn from_def(id: StyleId, def: &PathStyleDef) -> Result<Self, StyleError> {
        Ok(Self {
            id,
            name: def.name.clone(),
            spacing: StyleField::new(check_spacing(def.spacing)?),
            icon: StyleField::new(def.icon.clone()),
            refresh_ticks: StyleField::new(check_ticks(def.refresh_ticks)?),
            marker_limit: StyleField::new(def.marker_limit),
        })
    }

    pub fn apply(&mut self, change: PathStyleChange) -> Result<(), StyleError> {
        match change {
            PathStyleChange::Spacing(v) => self.spacing.set(check_spacing(v)?),
            PathStyleChange::Icon(v) => self.icon.set(v),
            PathStyleChange::RefreshTicks(v) => self.refresh_ticks.set(check_ticks(v)?),
            PathStyleChange::MarkerLimit(v) => self.marker_limit.set(v),
        }
        Ok(())
    }

    pub fn capture(&self) -> SegmentStyle {
        SegmentStyle {
            spacing: *self.spacing.get(),
            icon: self.icon.get().clone(),
            marker_limit: *self.marker_limit.get(),
        }
    }

    /// Subscribes `graph` to every field.
    pub fn subscribe(&mut self, graph: GraphId, sink: &UnboundedSender<StyleEvent>) {
        let event = |field| StyleEvent::Path { graph, field };
        self.spacing.subscribe(graph, forward(sink, event(PathField::Spacing)));
        self.icon.subscribe(graph, forward(sink, event(PathField::Icon)));
        self.refresh_ticks
            .subscribe(graph, forward(sink, event(PathField::RefreshTicks)));
        self.marker_limit
            .subscribe(graph, forward(sink, event(PathField::MarkerLimit)));
    }

    pub fn unsubscribe(&mut self, graph: GraphId) {
        self.spacing.unsubscribe(graph);
        self.icon.unsubscribe(graph);
        self.refresh_ticks.unsubscribe(graph);
        self.marker_limit.unsubscribe(graph);
    }

    pub fn is_subscribed(&self, graph: GraphId) -> bool {
        self.spacing.is_subscribed(graph)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Edit styles
// ─────────────────────────────────────────────────────────────────────────────

/// A change to one edit style field.
#[derive(Debug, Clone, PartialEq)]
pub enum EditStyleChange {
    NodeIcon(String),
    EdgeIcon(String),
    Spacing(f64),
    RefreshTicks(u32),
    MarkerLimit(usize),
}

/// How proxies and the style preview of an edit session look.
#[derive(Debug)]
pub struct EditStyle {
    pub id: StyleId,
    pub name: String,
    pub node_icon: StyleField<String>,
    pub edge_icon: StyleField<String>,
    pub spacing: StyleField<f64>,
    pub refresh_ticks: StyleField<u32>,
    pub marker_limit: StyleField<usize>,
}

impl EditStyle {
    pub fn from_def(id: StyleId, def: &EditStyleDef) -> Result<Self, StyleError> {
        Ok(Self {
            id,
            name: def.name.clone(),
            node_icon: StyleField::new(def.node_icon.clone()),
            edge_icon: StyleField::new(def.edge_icon.clone()),
            spacing: StyleField::new(check_spacing(def.spacing)?),
            refresh_ticks: StyleField::new(check_ticks(def.refresh_ticks)?),
            marker_limit: StyleField::new(def.marker_limit),
        })
    }

    pub fn apply(&mut self, change: EditStyleChange) -> Result<(), StyleError> {
        match change {
            EditStyleChange::NodeIcon(v) => self.node_icon.set(v),
            EditStyleChange::EdgeIcon(v) => self.edge_icon.set(v),
            EditStyleChange::Spacing(v) => self.spacing.set(check_spacing(v)?),
            EditStyleChange::RefreshTicks(v) => self.refresh_ticks.set(check_ticks(v)?),
            EditStyleChange::MarkerLimit(v) => self.marker_limit.set(v),
        }
        Ok(())
    }

    pub fn subscribe(&mut self, graph: GraphId, sink: &UnboundedSender<StyleEvent>) {
        let event = |field| StyleEvent::Edit { graph, field };
        self.node_icon.subscribe(graph, forward(sink, event(EditField::NodeIcon)));
        self.edge_icon.subscribe(graph, forward(sink, event(EditField::EdgeIcon)));
        self.spacing.subscribe(graph, forward(sink, event(EditField::Spacing)));
        self.refresh_ticks
            .subscribe(graph, forward(sink, event(EditField::RefreshTicks)));
        self.marker_limit
            .subscribe(graph, forward(sink, event(EditField::MarkerLimit)));
    }

    pub fn unsubscribe(&mut self, graph: GraphId) {
        self.node_icon.unsubscribe(graph);
        self.edge_icon.unsubscribe(graph);
        self.spacing.unsubscribe(graph);
        self.refresh_ticks.unsubscribe(graph);
        self.marker_limit.unsubscribe(graph);
    }

    pub fn is_subscribed(&self, graph: GraphId) -> bool {
        self.node_icon.is_subscribed(graph)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// All styles, created from the config at startup.
///
/// A style named `default` of each kind always exists and cannot be
/// deleted.
#[derive(Debug)]
pub struct StyleRegistry {
    paths: BTreeMap<StyleId, PathStyle>,
    edits: BTreeMap<StyleId, EditStyle>,
    default_path: StyleId,
    default_edit: StyleId,
    next_id: u32,
}

impl StyleRegistry {
    pub fn new(path_defs: &[PathStyleDef], edit_defs: &[EditStyleDef]) -> Self {
        let mut registry = Self {
            paths: BTreeMap::new(),
            edits: BTreeMap::new(),
            default_path: StyleId(0),
            default_edit: StyleId(0),
            next_id: 1,
        };

        for def in path_defs {
            if let Err(e) = registry.create_path_style(def) {
                warn!(style = %def.name, "skipping path style: {}", e);
            }
        }
        for def in edit_defs {
            if let Err(e) = registry.create_edit_style(def) {
                warn!(style = %def.name, "skipping edit style: {}", e);
            }
        }

        registry.default_path = match registry.path_by_name(DEFAULT_STYLE) {
            Some(style) => style.id,
            None => registry.insert_default_path(),
        };
        registry.default_edit = match registry.edit_by_name(DEFAULT_STYLE) {
            Some(style) => style.id,
            None => registry.insert_default_edit(),
        };
        registry
    }

    fn allocate(&mut self) -> StyleId {
        let id = StyleId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert_default_path(&mut self) -> StyleId {
        let id = self.allocate();
        let def = PathStyleDef::default();
        let style = PathStyle {
            id,
            name: def.name,
            spacing: StyleField::new(def.spacing),
            icon: StyleField::new(def.icon),
            refresh_ticks: StyleField::new(def.refresh_ticks),
            marker_limit: StyleField::new(def.marker_limit),
        };
        self.paths.insert(id, style);
        id
    }

    fn insert_default_edit(&mut self) -> StyleId {
        let id = self.allocate();
        let def = EditStyleDef::default();
        let style = EditStyle {
            id,
            name: def.name,
            node_icon: StyleField::new(def.node_icon),
            edge_icon: StyleField::new(def.edge_icon),
            spacing: StyleField::new(def.spacing),
            refresh_ticks: StyleField::new(def.refresh_ticks),
            marker_limit: StyleField::new(def.marker_limit),
        };
        self.edits.insert(id, style);
        id
    }

    pub fn default_path_style(&self) -> StyleId {
        self.default_path
    }

    pub fn default_edit_style(&self) -> StyleId {
        self.default_edit
    }

    pub fn path(&self, id: StyleId) -> Option<&PathStyle> {
        self.paths.get(&id)
    }

    pub fn path_mut(&mut self, id: StyleId) -> Option<&mut PathStyle> {
        self.paths.get_mut(&id)
    }

    pub fn edit(&self, id: StyleId) -> Option<&EditStyle> {
        self.edits.get(&id)
    }

    pub fn edit_mut(&mut self, id: StyleId) -> Option<&mut EditStyle> {
        self.edits.get_mut(&id)
    }

    pub fn path_by_name(&self, name: &str) -> Option<&PathStyle> {
        self.paths.values().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn edit_by_name(&self, name: &str) -> Option<&EditStyle> {
        self.edits.values().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn path_styles(&self) -> impl Iterator<Item = &PathStyle> {
        self.paths.values()
    }

    pub fn edit_styles(&self) -> impl Iterator<Item = &EditStyle> {
        self.edits.values()
    }

    pub fn create_path_style(&mut self, def: &PathStyleDef) -> Result<StyleId, StyleError> {
        if self.path_by_name(&def.name).is_some() {
            return Err(StyleError::DuplicateName(def.name.clone()));
        }
        let id = self.allocate();
        self.paths.insert(id, PathStyle::from_def(id, def)?);
        Ok(id)
    }

    pub fn create_edit_style(&mut self, def: &EditStyleDef) -> Result<StyleId, StyleError> {
        if self.edit_by_name(&def.name).is_some() {
            return Err(StyleError::DuplicateName(def.name.clone()));
        }
        let id = self.allocate();
        self.edits.insert(id, EditStyle::from_def(id, def)?);
        Ok(id)
    }

    /// Deletes a path style. `in_use` tells whether any road map refers
    /// to it.
    pub fn remove_path_style(&mut self, id: StyleId, in_use: bool) -> Result<(), StyleError> {
        if id == self.default_path {
            return Err(StyleError::DefaultStyle);
        }
        if !self.paths.contains_key(&id) {
            return Err(StyleError::Unknown(id));
        }
        if in_use {
            return Err(StyleError::InUse(id));
        }
        self.paths.remove(&id);
        Ok(())
    }

    pub fn remove_edit_style(&mut self, id: StyleId, in_use: bool) -> Result<(), StyleError> {
        if id == self.default_edit {
            return Err(StyleError::DefaultStyle);
        }
        if !self.edits.contains_key(&id) {
            return Err(StyleError::Unknown(id));
        }
        if in_use {
            return Err(StyleError::InUse(id));
        }
        self.edits.remove(&id);
        Ok(())
    }
}
