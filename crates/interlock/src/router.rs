//! Signal router: admits signals through the Tumbler and dispatches them.
//!
//! Dispatch order for an accepted signal is: every observer (wildcard)
//! handler in registration order, then every handler registered for the
//! signal's type in registration order. A handler that returns an error or
//! panics is logged and skipped; it never stops the rest.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, error, trace};

use crate::collaborator::{EventSink, RecordedSignal, SignalRecorder, events};
use crate::queue::WorkQueue;
use crate::signal::{Signal, SignalType};
use crate::tumbler::{Tumbler, TumblerStats, Verdict, parse_identifier};

/// A synchronous signal handler. Slow work belongs on the router's
/// [`WorkQueue`].
pub type SignalHandler = Arc<dyn Fn(&Signal, SocketAddr) -> anyhow::Result<()> + Send + Sync>;

/// Result of routing one signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub verdict: Verdict,
    pub handlers_run: usize,
    pub handler_failures: usize,
}

/// Routes admitted signals to observers and per-type handlers.
pub struct SignalRouter {
    tumbler: Tumbler,
    observers: Vec<SignalHandler>,
    handlers: HashMap<SignalType, Vec<SignalHandler>>,
    queue: WorkQueue,
    handler_failures: u64,
}

impl SignalRouter {
    pub fn new(tumbler: Tumbler) -> Self {
        Self {
            tumbler,
            observers: Vec::new(),
            handlers: HashMap::new(),
            queue: WorkQueue::new(),
            handler_failures: 0,
        }
    }

    /// Register a handler for one signal type. Handlers for the same type run
    /// in registration order.
    pub fn on<F>(&mut self, kind: SignalType, handler: F)
    where
        F: Fn(&Signal, SocketAddr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        debug!("Registering handler for {kind}");
        self.handlers.entry(kind).or_default().push(Arc::new(handler));
    }

    /// Register a handler by identifier (`"build_started"`, `"0x30"`, `"48"`).
    /// Returns the resolved type, or `None` if the identifier is not a signal.
    pub fn on_name<F>(&mut self, identifier: &str, handler: F) -> Option<SignalType>
    where
        F: Fn(&Signal, SocketAddr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let kind = parse_identifier(identifier)?;
        self.on(kind, handler);
        Some(kind)
    }

    /// Register a handler that receives the payload deserialized as `T`. A
    /// payload that does not deserialize counts as a handler failure.
    pub fn on_typed<T, F>(&mut self, kind: SignalType, handler: F)
    where
        T: DeserializeOwned,
        F: Fn(&Signal, T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(kind, move |signal, _source| {
            let payload: T = signal.payload_as()?;
            handler(signal, payload)
        });
    }

    /// Register a wildcard handler invoked for every accepted signal.
    pub fn observe<F>(&mut self, handler: F)
    where
        F: Fn(&Signal, SocketAddr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(handler));
    }

    /// Observer hook that hands every accepted signal to a recorder.
    pub fn observe_with_recorder(&mut self, recorder: Arc<dyn SignalRecorder>) {
        self.observe(move |signal, source| recorder.record(&RecordedSignal::new(signal, source)));
    }

    /// Observer hook that relays every accepted signal to an event sink.
    pub fn relay_to(&mut self, sink: Arc<dyn EventSink>) {
        self.observe(move |signal, source| {
            sink.emit(
                events::SIGNAL,
                serde_json::json!({
                    "type": signal.kind.name(),
                    "code": signal.kind.code(),
                    "sender": signal.sender,
                    "source": source.to_string(),
                    "timestamp": signal.timestamp,
                    "payload": signal.payload,
                }),
            );
            Ok(())
        });
    }

    /// Admit and dispatch one signal.
    pub fn route(&mut self, signal: &Signal, source: SocketAddr) -> RouteOutcome {
        let verdict = self.tumbler.process(signal);
        if !verdict.accepted {
            trace!(
                "Tumbler rejected {} from {source}: {}",
                signal.kind,
                verdict.reason.as_deref().unwrap_or("")
            );
            return RouteOutcome {
                verdict,
                handlers_run: 0,
                handler_failures: 0,
            };
        }

        let typed = self.handlers.get(&signal.kind).map(Vec::as_slice).unwrap_or(&[]);
        let mut handlers_run = 0;
        let mut failures = 0;

        for handler in self.observers.iter().chain(typed) {
            handlers_run += 1;
            if !invoke(handler, signal, source) {
                failures += 1;
            }
        }

        self.handler_failures += failures as u64;
        RouteOutcome {
            verdict,
            handlers_run,
            handler_failures: failures,
        }
    }

    pub fn has_handler(&self, kind: SignalType) -> bool {
        self.handlers.get(&kind).is_some_and(|h| !h.is_empty())
    }

    /// Total number of per-type handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Handler errors and panics caught since creation.
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures
    }

    /// Queue for handler side effects; clone it into handler closures.
    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    pub fn tumbler(&self) -> &Tumbler {
        &self.tumbler
    }

    pub fn tumbler_stats(&self) -> TumblerStats {
        self.tumbler.stats()
    }

    pub fn reset_stats(&mut self) {
        self.tumbler.reset_stats();
        self.handler_failures = 0;
    }
}

impl Default for SignalRouter {
    fn default() -> Self {
        Self::new(Tumbler::accept_all())
    }
}

/// Run one handler, containing errors and panics. Returns `true` on success.
fn invoke(handler: &SignalHandler, signal: &Signal, source: SocketAddr) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(signal, source))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Handler for {} from {source} failed: {e:#}", signal.kind);
            false
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic".to_string());
            error!("Handler for {} from {source} panicked: {msg}", signal.kind);
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
