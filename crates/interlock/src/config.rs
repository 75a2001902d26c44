//! Mesh configuration for an InterLock server.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::peer::RecoveryPolicy;

/// A statically configured peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// Parse `name@host:port`.
    pub fn parse(spec: &str) -> Result<Self, MeshError> {
        let (name, addr) = spec
            .split_once('@')
            .ok_or_else(|| MeshError::Config(format!("expected name@host:port, got {spec:?}")))?;
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| MeshError::Config(format!("missing port in {spec:?}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| MeshError::Config(format!("bad port in {spec:?}: {e}")))?;
        if name.is_empty() || host.is_empty() {
            return Err(MeshError::Config(format!("empty name or host in {spec:?}")));
        }
        Ok(Self::new(name, host.trim_start_matches('[').trim_end_matches(']'), port))
    }
}

/// What to do with datagrams from senders that are not registered peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPeerPolicy {
    /// Route the signal but do not register the sender.
    #[default]
    Admit,
    /// Route the signal and register the sender from its payload `sender`
    /// name and source address.
    Register,
    /// Drop the datagram before it reaches the router.
    Drop,
}

/// Recovery loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    #[serde(with = "duration_serde")]
    pub base_delay: Duration,
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,
    /// Probes per outage. `0` disables recovery: a silent peer is settled
    /// inactive on the next maintenance pass.
    pub max_attempts: u32,
    /// How often the maintenance loop sweeps liveness and probes peers.
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        let policy = RecoveryPolicy::default();
        Self {
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
            max_attempts: policy.max_attempts,
            check_interval: Duration::from_secs(5),
        }
    }
}

impl RecoveryConfig {
    pub fn policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            max_attempts: self.max_attempts,
        }
    }
}

/// Configuration for one mesh participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// This server's name on the mesh; sent as `sender` in every payload.
    pub server_name: String,

    /// Interface to bind the UDP socket on.
    pub bind_host: IpAddr,

    /// UDP port to listen on. `0` picks an ephemeral port.
    pub port: u16,

    /// Interval between heartbeat broadcasts.
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Silence after which an active peer is considered inactive.
    #[serde(with = "duration_serde")]
    pub heartbeat_timeout: Duration,

    /// Tumbler whitelist. Empty accepts every signal.
    pub accepted_signals: Vec<String>,

    /// Capabilities announced in DISCOVERY.
    pub capabilities: Vec<String>,

    /// Statically configured peers.
    pub peers: Vec<PeerConfig>,

    pub unknown_peer_policy: UnknownPeerPolicy,

    pub recovery: RecoveryConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            server_name: "interlock".to_string(),
            bind_host: IpAddr::from([0, 0, 0, 0]),
            port: 3001,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            accepted_signals: Vec::new(),
            capabilities: Vec::new(),
            peers: Vec::new(),
            unknown_peer_policy: UnknownPeerPolicy::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Defaults with a given server name.
    pub fn named(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }

    /// Check invariants the mesh relies on.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.server_name.trim().is_empty() {
            return Err(MeshError::Config("server_name must not be empty".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(MeshError::Config("heartbeat_interval must be positive".into()));
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(MeshError::Config("heartbeat_timeout must be positive".into()));
        }
        if self.recovery.check_interval.is_zero() || self.recovery.base_delay.is_zero() {
            return Err(MeshError::Config(
                "recovery check_interval and base_delay must be positive".into(),
            ));
        }
        if self.recovery.max_delay < self.recovery.base_delay {
            return Err(MeshError::Config(
                "recovery max_delay must not be below base_delay".into(),
            ));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.name.is_empty() || peer.host.is_empty() {
                return Err(MeshError::Config("peer name and host must not be empty".into()));
            }
            if peer.name == self.server_name {
                return Err(MeshError::Config(format!(
                    "peer {:?} has the same name as this server",
                    peer.name
                )));
            }
            if !seen.insert(peer.name.as_str()) {
                return Err(MeshError::Config(format!("duplicate peer name {:?}", peer.name)));
            }
        }
        Ok(())
    }

    /// `~/.interlock`
    pub fn base_dir() -> Result<PathBuf, MeshError> {
        let home = dirs::home_dir()
            .ok_or_else(|| MeshError::Config("Could not determine home directory".into()))?;
        Ok(home.join(".interlock"))
    }

    /// `~/.interlock/config.json`
    pub fn default_path() -> Result<PathBuf, MeshError> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), MeshError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, MeshError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("Unusable config file {}, using defaults: {e}", path.display()),
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(dur.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.recovery.max_attempts, 5);
        assert_eq!(config.recovery.base_delay, Duration::from_secs(10));
        assert!(config.accepted_signals.is_empty());
        assert_eq!(config.unknown_peer_policy, UnknownPeerPolicy::Admit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "server_name": "search",
            "port": 3010,
            "heartbeat_interval": 2.5,
            "accepted_signals": ["heartbeat", "0x20"],
            "peers": [{"name": "indexer", "host": "127.0.0.1", "port": 3011}],
            "unknown_peer_policy": "register"
        }"#;
        let config: MeshConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server_name, "search");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(2500));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(config.peers[0], PeerConfig::new("indexer", "127.0.0.1", 3011));
        assert_eq!(config.unknown_peer_policy, UnknownPeerPolicy::Register);
        assert_eq!(config.recovery, RecoveryConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut config = MeshConfig::named("a");
        config.peers = vec![
            PeerConfig::new("b", "127.0.0.1", 1),
            PeerConfig::new("b", "127.0.0.1", 2),
        ];
        assert!(config.validate().is_err());

        let mut config = MeshConfig::named("a");
        config.peers = vec![PeerConfig::new("a", "127.0.0.1", 1)];
        assert!(config.validate().is_err());

        let mut config = MeshConfig::named(" ");
        assert!(config.validate().is_err());
        config.server_name = "ok".into();
        config.heartbeat_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::named("a");
        config.recovery.max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_config_parse() {
        assert_eq!(
            PeerConfig::parse("indexer@10.0.0.2:3002").unwrap(),
            PeerConfig::new("indexer", "10.0.0.2", 3002)
        );
        assert_eq!(PeerConfig::parse("v6@[::1]:9").unwrap().host, "::1");
        assert!(PeerConfig::parse("indexer:3002").is_err());
        assert!(PeerConfig::parse("indexer@host").is_err());
        assert!(PeerConfig::parse("@host:1").is_err());
        assert!(PeerConfig::parse("x@host:99999").is_err());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut original = MeshConfig::named("builder");
        original.peers.push(PeerConfig::new("verifier", "localhost", 3005));
        original.recovery.max_attempts = 3;
        original.save_to_file(&path).unwrap();

        let loaded = MeshConfig::load_or_default(&path);
        assert_eq!(loaded.server_name, "builder");
        assert_eq!(loaded.peers, original.peers);
        assert_eq!(loaded.recovery.max_attempts, 3);
    }

    #[test]
    fn test_config_load_missing_or_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(MeshConfig::load_or_default(&missing).port, 3001);

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{not json").unwrap();
        assert!(MeshConfig::load_from_file(&corrupt).is_err());
        assert_eq!(MeshConfig::load_or_default(&corrupt).server_name, "interlock");
    }
}
