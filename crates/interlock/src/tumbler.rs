//! Tumbler: admission control for inbound signals.
//!
//! A Tumbler holds the set of signal types a server wants to see. An empty
//! set admits everything (observer deployments); otherwise only exact type
//! matches pass. Every decision is counted, accepted or not.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::signal::{Signal, SignalType};

/// Outcome of [`Tumbler::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub accepted: bool,
    /// Why the signal was rejected. `None` when accepted.
    pub reason: Option<String>,
}

impl Verdict {
    fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }
}

/// Snapshot of Tumbler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TumblerStats {
    pub accepted: u64,
    pub rejected: u64,
    /// Signals seen per type name, regardless of outcome.
    pub per_type: BTreeMap<String, u64>,
}

impl TumblerStats {
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected
    }
}

/// Whitelist-based admission filter.
#[derive(Debug, Clone)]
pub struct Tumbler {
    allowed: BTreeSet<u16>,
    /// Set only when no identifiers were configured. A whitelist whose
    /// entries all failed to parse stays closed.
    open: bool,
    stats: TumblerStats,
}

impl Default for Tumbler {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl Tumbler {
    /// Build a Tumbler from textual identifiers: hex (`"0x04"`), decimal
    /// (`"4"`) or symbolic (`"heartbeat"`). Entries that do not parse are
    /// skipped with a warning.
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = BTreeSet::new();
        let mut configured = 0usize;
        for ident in identifiers {
            configured += 1;
            let ident = ident.as_ref();
            match parse_identifier(ident) {
                Some(kind) => {
                    allowed.insert(kind.code());
                }
                None => warn!("Ignoring unrecognised signal identifier in whitelist: {ident:?}"),
            }
        }
        if configured > 0 && allowed.is_empty() {
            warn!("No usable entries in signal whitelist; every signal will be rejected");
        }
        Self {
            allowed,
            open: configured == 0,
            stats: TumblerStats::default(),
        }
    }

    /// A Tumbler that admits every signal.
    pub fn accept_all() -> Self {
        Self {
            allowed: BTreeSet::new(),
            open: true,
            stats: TumblerStats::default(),
        }
    }

    /// Whether this Tumbler admits everything.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Whether `kind` would be admitted, without touching the counters.
    pub fn allows(&self, kind: SignalType) -> bool {
        self.open || self.allowed.contains(&kind.code())
    }

    /// The whitelist as signal types, in code order.
    pub fn allowed(&self) -> Vec<SignalType> {
        self.allowed.iter().copied().map(SignalType::from_code).collect()
    }

    /// Decide whether to admit `signal` and record the decision.
    pub fn process(&mut self, signal: &Signal) -> Verdict {
        *self
            .stats
            .per_type
            .entry(signal.kind.stats_key())
            .or_insert(0) += 1;

        if self.allows(signal.kind) {
            self.stats.accepted += 1;
            Verdict::accept()
        } else {
            self.stats.rejected += 1;
            Verdict::reject(format!("{} is not in the accepted set", signal.kind))
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> TumblerStats {
        self.stats.clone()
    }

    /// Zero all counters; the whitelist is left alone.
    pub fn reset_stats(&mut self) {
        self.stats = TumblerStats::default();
    }
}

/// Parse a single whitelist identifier.
pub fn parse_identifier(ident: &str) -> Option<SignalType> {
    let ident = ident.trim();
    if ident.is_empty() {
        return None;
    }

    if let Some(hex) = ident
        .strip_prefix("0x")
        .or_else(|| ident.strip_prefix("0X"))
    {
        return u16::from_str_radix(hex, 16).ok().map(SignalType::from_code);
    }

    if ident.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return ident
            .parse::<i64>()
            .ok()
            .and_then(|n| SignalType::try_from(n).ok());
    }

    SignalType::from_name(ident)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
