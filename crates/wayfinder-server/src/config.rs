//! Engine configuration, read from `.wayfinder/config.json`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the style every road map falls back to.
pub const DEFAULT_STYLE: &str = "default";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory of the sled database.
    pub data_dir: PathBuf,
    /// Length of one simulation step.
    pub tick_millis: u64,
    /// Editors only see proxies within this distance.
    pub proxy_view_distance: f64,
    /// How often proxy positions and visibility are refreshed, in ticks.
    pub proxy_refresh_ticks: u32,
    /// A warning is logged each time this many writes are waiting.
    pub persist_backlog_warning: usize,
    pub default_arrival_distance: f64,
    pub default_curve_tension: f64,
    pub path_styles: Vec<PathStyleDef>,
    pub edit_styles: Vec<EditStyleDef>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".wayfinder/db"),
            tick_millis: 50,
            proxy_view_distance: 20.0,
            proxy_refresh_ticks: 10,
            persist_backlog_warning: 1024,
            default_arrival_distance: 1.5,
            default_curve_tension: 3.0,
            path_styles: vec![PathStyleDef::default()],
            edit_styles: vec![EditStyleDef::default()],
        }
    }
}

impl EngineConfig {
    /// Reads a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Reads a config file, or returns the defaults when there is none.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Initial values of a path style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathStyleDef {
    pub name: String,
    /// Distance between two guide markers.
    pub spacing: f64,
    pub icon: String,
    /// Guide markers are redrawn every this many ticks.
    pub refresh_ticks: u32,
    /// Most markers drawn for one segment.
    pub marker_limit: usize,
}

impl Default for PathStyleDef {
    fn default() -> Self {
        Self {
            name: DEFAULT_STYLE.to_string(),
            spacing: 0.5,
            icon: "flame".to_string(),
            refresh_ticks: 20,
            marker_limit: 400,
        }
    }
}

/// Initial values of an edit style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditStyleDef {
    pub name: String,
    pub node_icon: String,
    pub edge_icon: String,
    /// Distance between two preview markers.
    pub spacing: f64,
    /// The preview is re-sent every this many ticks.
    pub refresh_ticks: u32,
    /// Most preview markers drawn for the whole graph.
    pub marker_limit: usize,
}

impl Default for EditStyleDef {
    fn default() -> Self {
        Self {
            name: DEFAULT_STYLE.to_string(),
            node_icon: "node".to_string(),
            edge_icon: "edge".to_string(),
            spacing: 0.3,
            refresh_ticks: 20,
            marker_limit: 10_000,
        }
    }
}
