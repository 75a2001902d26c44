//! Command-line interface definitions and config overrides.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use interlock::MeshConfig;
use interlock::config::PeerConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run an InterLock mesh node", long_about = None)]
pub struct Cli {
    /// Configuration file path (default: ~/.interlock/config.json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server name on the mesh
    #[arg(short, long)]
    pub name: Option<String>,

    /// UDP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Static peer, repeatable
    #[arg(long = "peer", value_name = "NAME@HOST:PORT")]
    pub peers: Vec<String>,

    /// Accepted signal (name, decimal or 0x hex), repeatable. Replaces the
    /// configured whitelist.
    #[arg(long = "accept", value_name = "SIGNAL")]
    pub accept: Vec<String>,

    /// Directory for rolling log files (default: ~/.interlock/logs)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Load the config file named on the command line, or the default one if
    /// it exists. An explicit path that cannot be read is an error.
    pub fn load_config(&self) -> Result<MeshConfig> {
        match &self.config {
            Some(path) => MeshConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display())),
            None => Ok(MeshConfig::load_or_default(&MeshConfig::default_path()?)),
        }
    }

    pub fn apply_overrides(&self, config: &mut MeshConfig) -> Result<()> {
        if let Some(name) = &self.name {
            config.server_name = name.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        for spec in &self.peers {
            let peer = PeerConfig::parse(spec)?;
            config.peers.retain(|p| p.name != peer.name);
            config.peers.push(peer);
        }
        if !self.accept.is_empty() {
            config.accepted_signals = self.accept.clone();
        }
        Ok(())
    }

    pub fn logs_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(MeshConfig::base_dir()?.join("logs")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
