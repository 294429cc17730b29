//! CLI command implementations.

use colored::Colorize;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use wayfinder_core::{NoExternalPositions, NpcRole, UserId, Vec3};
use wayfinder_graph::{GraphStore, RoadMap, RouteOutcome};
use wayfinder_server::{
    Collaborators, Engine, EngineConfig, LogMessenger, NullRenderer, Persistence, Presence,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Presence of a host with nobody connected.
struct NobodyOnline;

impl Presence for NobodyOnline {
    fn is_online(&self, _user: UserId) -> bool {
        false
    }

    fn position(&self, _user: UserId) -> Option<Vec3> {
        None
    }

    fn has_permission(&self, _user: UserId, _tag: &str) -> bool {
        false
    }
}

fn headless() -> Collaborators {
    Collaborators {
        renderer: Box::new(NullRenderer),
        messenger: Box::new(LogMessenger),
        presence: Box::new(NobodyOnline),
        positions: Box::new(NoExternalPositions),
    }
}

/// Loads every readable road map. Unreadable ones are reported and skipped.
fn load_maps(store: &GraphStore) -> Result<Vec<RoadMap>> {
    let mut maps = Vec::new();
    for loaded in store.load_all()? {
        match loaded {
            Ok(map) => maps.push(map),
            Err(e) => warn!("skipping road map: {}", e),
        }
    }
    Ok(maps)
}

/// Opens the store and starts an engine writing back to it.
fn open_engine(config: EngineConfig) -> Result<Engine> {
    let store = Arc::new(GraphStore::open(&config.data_dir)?);
    let maps = load_maps(&store)?;
    let persistence = Persistence::spawn(store, config.persist_backlog_warning);
    let mut engine = Engine::new(config, headless(), persistence);
    engine.load(maps);
    Ok(engine)
}

/// Write a default configuration.
pub fn init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("{} Already initialized", "✓".green());
        return Ok(());
    }

    EngineConfig::default().save(config_path)?;

    println!("{} Wrote {}", "✓".green(), config_path.display());
    println!("  Run {} to add a road map", "wayfinder import <file>".cyan());

    Ok(())
}

/// A road map as written by hand.
#[derive(Debug, Deserialize)]
struct MapFile {
    name: String,
    #[serde(default = "default_zone")]
    zone: String,
    #[serde(default)]
    discovery_gated: bool,
    arrival_distance: Option<f64>,
    default_tension: Option<f64>,
    #[serde(default)]
    groups: Vec<GroupEntry>,
    nodes: Vec<NodeEntry>,
    #[serde(default)]
    edges: Vec<(String, String)>,
}

fn default_zone() -> String {
    "overworld".to_string()
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    name: String,
    #[serde(default)]
    discoverable: bool,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    name: String,
    #[serde(flatten)]
    kind: NodeKind,
    group: Option<String>,
    permission: Option<String>,
    tension: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeKind {
    Waypoint { position: Vec3 },
    Npc { npc: u32, role: NpcRole },
}

/// Import a road map from a JSON file into the store.
pub async fn import(config_path: &Path, file: &Path, replace: bool) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    let text = fs::read_to_string(file)?;
    let spec: MapFile = serde_json::from_str(&text)?;

    let store = GraphStore::open(&config.data_dir)?;
    let mut engine = Engine::new(config, headless(), Persistence::disabled());
    engine.load(load_maps(&store)?);

    if let Some(existing) = engine.graph_by_name(&spec.name).map(RoadMap::id) {
        if !replace {
            return Err(format!(
                "a road map named \"{}\" already exists (use --replace)",
                spec.name
            )
            .into());
        }
        engine.delete_graph(existing)?;
        store.delete_graph(existing)?;
    }

    let graph = engine.create_graph(&spec.name, &spec.zone)?;
    engine.set_discovery_gated(graph, spec.discovery_gated)?;
    if let Some(distance) = spec.arrival_distance {
        engine.set_arrival_distance(graph, distance)?;
    }
    if let Some(tension) = spec.default_tension {
        engine.set_default_tension(graph, tension)?;
    }

    let mut groups = BTreeMap::new();
    for group in &spec.groups {
        let id = engine.create_group(graph, &group.name, group.discoverable)?;
        groups.insert(group.name.to_lowercase(), id);
    }

    let mut nodes = BTreeMap::new();
    for node in &spec.nodes {
        let id = match node.kind {
            NodeKind::Waypoint { position } => engine.add_waypoint(graph, &node.name, position)?,
            NodeKind::Npc { npc, role } => engine.add_npc(graph, &node.name, npc, role)?,
        };
        if let Some(name) = &node.group {
            let group = groups
                .get(&name.to_lowercase())
                .ok_or_else(|| format!("node \"{}\": unknown group \"{}\"", node.name, name))?;
            engine.set_node_group(graph, id, Some(*group))?;
        }
        if node.permission.is_some() {
            engine.set_node_permission(graph, id, node.permission.clone())?;
        }
        if node.tension.is_some() {
            engine.set_node_tension(graph, id, node.tension)?;
        }
        nodes.insert(node.name.to_lowercase(), id);
    }

    let lookup = |name: &str| {
        nodes
            .get(&name.to_lowercase())
            .copied()
            .ok_or_else(|| format!("edge refers to unknown node \"{}\"", name))
    };
    for (a, b) in &spec.edges {
        engine.connect(graph, lookup(a)?, lookup(b)?)?;
    }

    let map = engine
        .graph(graph)
        .ok_or_else(|| format!("road map \"{}\" vanished during import", spec.name))?;
    store.save_full(map)?;
    store.flush()?;

    println!(
        "{} Imported {} ({} nodes, {} edges, {} groups)",
        "✓".green(),
        map.name().cyan(),
        map.node_count(),
        map.edge_count(),
        map.group_count()
    );

    Ok(())
}

/// Show stored road maps.
pub fn status(config_path: &Path) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    let store = GraphStore::open(&config.data_dir)?;
    let loaded = store.load_all()?;

    println!("{}", "Wayfinder Status".cyan().bold());
    println!();
    println!("  {} {}", "Data:".dimmed(), config.data_dir.display());
    println!("  {} {}", "Road maps:".dimmed(), loaded.len());
    println!();

    for result in loaded {
        match result {
            Ok(map) => {
                let settings = map.settings();
                let gated = if settings.discovery_gated {
                    " gated".yellow().to_string()
                } else {
                    String::new()
                };
                println!(
                    "  {} {} {}{}",
                    format!("#{}", map.id()).dimmed(),
                    map.name().cyan(),
                    format!("({})", settings.zone).dimmed(),
                    gated
                );
                println!(
                    "      {} nodes, {} edges, {} groups",
                    map.node_count(),
                    map.edge_count(),
                    map.group_count()
                );
            }
            Err(e) => println!("  {} {}", "✗".red(), e),
        }
    }

    Ok(())
}

/// Compute a route between coordinates and a named node.
pub async fn route(config_path: &Path, graph: &str, target: &str, from: Vec3) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    let mut engine = open_engine(config)?;

    let map = engine
        .graph_by_name(graph)
        .ok_or_else(|| format!("no road map named \"{}\"", graph))?;
    let node = map
        .node_by_name(target)
        .ok_or_else(|| format!("no node named \"{}\" on {}", target, map.name()))?;

    match engine.plan_route(map.id(), from, node.id)? {
        RouteOutcome::Found(route) if route.is_empty() => {
            println!("{} Already at {}", "✓".green(), node.name.cyan());
        }
        RouteOutcome::Found(route) => {
            println!(
                "Route to {} ({:.1} blocks):\n",
                node.name.cyan(),
                route.cost
            );
            for (step, id) in route.nodes.iter().enumerate() {
                let name = map.node(*id).map(|n| n.name.as_str()).unwrap_or("?");
                println!("  {} {}", format!("{:>3}.", step + 1).dimmed(), name);
            }
        }
        RouteOutcome::NoRoute => {
            println!("{} No route to {}", "✗".red(), node.name);
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// Run the engine headless until Ctrl+C.
pub async fn serve(config_path: &Path) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path)?;
    let tick = Duration::from_millis(config.tick_millis.max(1));
    let mut engine = open_engine(config)?;

    println!(
        "{} Serving {} road maps, ticking every {}ms",
        "✓".green(),
        engine.graphs().count().to_string().cyan(),
        tick.as_millis()
    );
    println!("  Press {} to stop", "Ctrl+C".cyan());

    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = interval.tick() => engine.tick(),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    engine.shutdown().await;
    println!("{} Stopped after {} ticks", "✓".green(), engine.ticks());

    Ok(())
}
