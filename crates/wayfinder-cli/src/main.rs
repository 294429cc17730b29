//! Wayfinder CLI - Command-line interface for Wayfinder
//!
//! This is the entry point for operators managing road maps outside a
//! running host: creating the data directory, importing maps, inspecting
//! them and running the engine headless.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wayfinder_core::Vec3;

mod commands;

#[derive(Parser)]
#[command(name = "wayfinder")]
#[command(author = "Wayfinder Contributors")]
#[command(version)]
#[command(about = "Road-map pathfinding with guided routes and live editing", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file
    #[arg(short, long, global = true, default_value = ".wayfinder/config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Import a road map from a JSON description
    Import {
        /// The road map file
        file: PathBuf,

        /// Replace a road map of the same name
        #[arg(long)]
        replace: bool,
    },

    /// List stored road maps
    Status,

    /// Compute a route on a stored road map
    Route {
        /// Road map name
        graph: String,

        /// Destination node name
        target: String,

        /// Start coordinates as x,y,z
        #[arg(short, long, default_value = "0,0,0", allow_hyphen_values = true)]
        from: Vec3,
    },

    /// Run the engine headless until interrupted
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let result = match cli.command {
        Commands::Init => commands::init(&cli.config),
        Commands::Import { file, replace } => commands::import(&cli.config, &file, replace).await,
        Commands::Status => commands::status(&cli.config),
        Commands::Route {
            graph,
            target,
            from,
        } => commands::route(&cli.config, &graph, &target, from).await,
        Commands::Serve => commands::serve(&cli.config).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
