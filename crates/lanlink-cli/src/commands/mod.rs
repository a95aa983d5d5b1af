//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use lanlink_core::config::Config;

pub mod config;
pub mod run;

/// Load the configuration from `path`, or from the default location.
///
/// A missing file yields the defaults. A peer id is generated on first use
/// and written back so the identity survives restarts.
pub fn load_config(path: Option<&Path>) -> Result<(Config, PathBuf)> {
    let path = path.map_or_else(Config::config_path, Path::to_path_buf);
    let mut config = Config::load_from(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    if config.ensure_identity() {
        if let Err(e) = config.save_to(&path) {
            tracing::warn!("Could not persist generated peer id: {e}");
        }
    }

    Ok((config, path))
}

/// Lanlink - Serverless chat and file transfer on the local network
#[derive(Parser)]
#[command(name = "lanlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Start a node and read commands from stdin
    Run(RunArgs),

    /// Show or initialize the configuration
    Config(ConfigArgs),
}

/// Arguments for the run command
#[derive(Parser)]
pub struct RunArgs {
    /// Display name on the network
    #[arg(short, long, env = "LANLINK_NAME")]
    pub name: Option<String>,

    /// UDP port for discovery
    #[arg(long)]
    pub discovery_port: Option<u16>,

    /// TCP port for messages and files
    #[arg(long)]
    pub transport_port: Option<u16>,

    /// Configuration file to use instead of the default one
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Detailed logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Only print the configuration file path
    #[arg(long)]
    pub path: bool,

    /// Write a default configuration file if none exists
    #[arg(long)]
    pub init: bool,

    /// Configuration file to use instead of the default one
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
