//! Peer registry: known servers, their liveness and recovery bookkeeping.
//!
//! Peers are created from static configuration (or on first contact when the
//! unknown-peer policy allows it) and are never removed for the lifetime of
//! the process. Liveness is reclassified by [`PeerRegistry::sweep_at`]; the
//! recovery loop drives [`PeerRegistry::due_for_recovery`] and
//! [`PeerRegistry::schedule_recovery`].
//!
//! Every time-dependent method has an `_at(now)` form so the state machine
//! can be exercised without waiting on the wall clock.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Registered but never heard from.
    Unknown,
    /// Heard from within the heartbeat timeout.
    Active,
    /// Silent past the timeout; eligible for recovery probes.
    Inactive,
    /// At least one recovery probe is outstanding.
    Recovering,
}

/// A remote mesh participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: PeerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub heartbeat_count: u64,
    pub recovery_attempts: u32,
    pub next_recovery_at: Option<DateTime<Utc>>,
    /// Set once recovery gave up; cleared if the peer speaks again.
    pub recovery_exhausted: bool,
}

impl Peer {
    fn new(name: String, host: String, port: u16, now: DateTime<Utc>) -> Self {
        Self {
            name,
            host,
            port,
            status: PeerStatus::Unknown,
            registered_at: now,
            last_seen_at: None,
            heartbeat_count: 0,
            recovery_attempts: 0,
            next_recovery_at: None,
            recovery_exhausted: false,
        }
    }

    /// `host:port`, suitable for `UdpSocket::send_to`.
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Whether a datagram from `addr` plausibly came from this peer.
    pub fn matches_addr(&self, addr: &SocketAddr) -> bool {
        if self.port != addr.port() {
            return false;
        }
        match self.host.parse::<IpAddr>() {
            Ok(ip) => ip == addr.ip(),
            Err(_) => self.host.eq_ignore_ascii_case("localhost") && addr.ip().is_loopback(),
        }
    }
}

/// Exponential backoff parameters for re-probing inactive peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

impl RecoveryPolicy {
    /// `base_delay × 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// What [`PeerRegistry::mark_seen_at`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenOutcome {
    /// No peer with that name is registered.
    Unregistered,
    /// First message ever from this peer.
    FirstContact,
    /// An already-active peer checked in again.
    Refreshed,
    /// The peer was inactive or recovering and is back.
    Recovered,
}

/// Registry of all known peers, keyed by name.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer or update its address. Returns `true` when the peer is new.
    /// Liveness state of an existing peer is left untouched.
    pub fn register(&mut self, name: impl Into<String>, host: impl Into<String>, port: u16) -> bool {
        self.register_at(name, host, port, Utc::now())
    }

    pub fn register_at(
        &mut self,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        now: DateTime<Utc>,
    ) -> bool {
        let name = name.into();
        let host = host.into();
        match self.peers.get_mut(&name) {
            Some(peer) => {
                peer.host = host;
                peer.port = port;
                false
            }
            None => {
                self.peers
                    .insert(name.clone(), Peer::new(name, host, port, now));
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Peer> {
        self.peers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    /// Find the peer whose configured address matches a datagram source.
    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<&Peer> {
        self.peers.values().find(|p| p.matches_addr(addr))
    }

    /// Record an inbound message from `name`.
    pub fn mark_seen(&mut self, name: &str) -> SeenOutcome {
        self.mark_seen_at(name, Utc::now())
    }

    pub fn mark_seen_at(&mut self, name: &str, now: DateTime<Utc>) -> SeenOutcome {
        let Some(peer) = self.peers.get_mut(name) else {
            return SeenOutcome::Unregistered;
        };

        let outcome = match peer.status {
            PeerStatus::Unknown => SeenOutcome::FirstContact,
            PeerStatus::Active => SeenOutcome::Refreshed,
            PeerStatus::Inactive | PeerStatus::Recovering => SeenOutcome::Recovered,
        };

        peer.last_seen_at = Some(now);
        peer.heartbeat_count += 1;
        peer.status = PeerStatus::Active;
        peer.recovery_attempts = 0;
        peer.next_recovery_at = None;
        peer.recovery_exhausted = false;

        outcome
    }

    /// Force a peer inactive, e.g. after it announced shutdown. Recovery
    /// starts from the base delay.
    pub fn mark_inactive(&mut self, name: &str) -> bool {
        match self.peers.get_mut(name) {
            Some(peer) => {
                deactivate(peer);
                true
            }
            None => false,
        }
    }

    /// Reclassify active peers silent for longer than `timeout` as inactive.
    /// Returns the names that changed.
    pub fn sweep(&mut self, timeout: Duration) -> Vec<String> {
        self.sweep_at(Utc::now(), timeout)
    }

    pub fn sweep_at(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let timeout = to_chrono(timeout);
        let mut changed = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.status != PeerStatus::Active {
                continue;
            }
            let stale = peer
                .last_seen_at
                .is_none_or(|seen| now.signed_duration_since(seen) > timeout);
            if stale {
                deactivate(peer);
                changed.push(peer.name.clone());
            }
        }
        changed.sort();
        changed
    }

    /// Peers that should receive a recovery probe now.
    pub fn due_for_recovery(&self, now: DateTime<Utc>, policy: &RecoveryPolicy) -> Vec<String> {
        let mut due: Vec<String> = self
            .peers
            .values()
            .filter(|p| matches!(p.status, PeerStatus::Inactive | PeerStatus::Recovering))
            .filter(|p| p.recovery_attempts < policy.max_attempts)
            .filter(|p| p.next_recovery_at.is_none_or(|at| at <= now))
            .map(|p| p.name.clone())
            .collect();
        due.sort();
        due
    }

    /// Record that a probe was sent to `name` and schedule the next one.
    /// Returns the backoff delay chosen, or `None` if the peer is unknown or
    /// out of attempts.
    pub fn schedule_recovery(
        &mut self,
        name: &str,
        now: DateTime<Utc>,
        policy: &RecoveryPolicy,
    ) -> Option<Duration> {
        let peer = self.peers.get_mut(name)?;
        if peer.recovery_attempts >= policy.max_attempts {
            return None;
        }

        let delay = policy.delay_for(peer.recovery_attempts);
        let next = now
            .checked_add_signed(to_chrono(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        peer.next_recovery_at = Some(next);
        peer.recovery_attempts += 1;
        peer.status = PeerStatus::Recovering;
        Some(delay)
    }

    /// Settle inactive or recovering peers that used every attempt and whose
    /// last window elapsed: they become permanently inactive. With
    /// `max_attempts == 0` recovery is disabled and a peer is settled as soon
    /// as it goes inactive. Returns names settled by this call.
    pub fn expire_exhausted(&mut self, now: DateTime<Utc>, policy: &RecoveryPolicy) -> Vec<String> {
        let mut expired = Vec::new();
        for peer in self.peers.values_mut() {
            if !matches!(peer.status, PeerStatus::Inactive | PeerStatus::Recovering) {
                continue;
            }
            if peer.recovery_exhausted || peer.recovery_attempts < policy.max_attempts {
                continue;
            }
            if peer.next_recovery_at.is_none_or(|at| at <= now) {
                peer.status = PeerStatus::Inactive;
                peer.recovery_exhausted = true;
                expired.push(peer.name.clone());
            }
        }
        expired.sort();
        expired
    }

    /// All peers, sorted by name.
    pub fn list_all(&self) -> Vec<&Peer> {
        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    /// `(name, address)` pairs for every peer, sorted by name.
    pub fn addresses(&self) -> Vec<(String, String)> {
        self.list_all()
            .into_iter()
            .map(|p| (p.name.clone(), p.address()))
            .collect()
    }

    pub fn count_by_status(&self, status: PeerStatus) -> usize {
        self.peers.values().filter(|p| p.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn deactivate(peer: &mut Peer) {
    peer.status = PeerStatus::Inactive;
    peer.recovery_attempts = 0;
    peer.next_recovery_at = None;
    peer.recovery_exhausted = false;
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
