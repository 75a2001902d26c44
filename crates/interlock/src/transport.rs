//! MeshTransport: the UDP endpoint that ties the mesh together.
//!
//! [`MeshTransport`] owns the socket and runs three background tasks:
//! - the receive loop (decode → liveness bookkeeping → route),
//! - the heartbeat loop (broadcast `HEARTBEAT` every interval),
//! - the maintenance loop (liveness sweep, recovery probes with backoff).
//!
//! Collaborators that need to send or inspect the mesh get a cloneable
//! [`MeshHandle`]; nobody outside this module touches the registry or the
//! Tumbler directly.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::collaborator::{EventSink, NullSink, SignalRecorder, events};
use crate::config::{MeshConfig, UnknownPeerPolicy};
use crate::error::MeshError;
use crate::peer::{Peer, PeerRegistry, RecoveryPolicy, SeenOutcome};
use crate::router::{RouteOutcome, SignalRouter};
use crate::signal::{
    DiscoveryPayload, HeartbeatPayload, ShutdownPayload, Signal, SignalType,
};
use crate::tumbler::{Tumbler, TumblerStats};
use crate::wire;

/// Largest datagram we will read.
const RECV_BUFFER_LEN: usize = 65_536;

/// Lifecycle of a [`MeshTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for MeshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Per-peer result of a [`MeshHandle::broadcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Active peers that went silent past the timeout.
    pub newly_inactive: Vec<String>,
    /// Peers probed, with the backoff delay until their next probe.
    pub probed: Vec<(String, Duration)>,
    /// Peers that used every recovery attempt.
    pub exhausted: Vec<String>,
}

/// Point-in-time view of the mesh, for status endpoints and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshStatus {
    pub server_name: String,
    pub state: MeshState,
    pub local_addr: Option<String>,
    pub peers: Vec<Peer>,
    pub tumbler: TumblerStats,
    pub handler_failures: u64,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    config: MeshConfig,
    policy: RecoveryPolicy,
    /// Distinguishes this process from a restarted one with the same name,
    /// and lets us ignore our own datagrams.
    instance_id: String,
    registry: RwLock<PeerRegistry>,
    router: RwLock<SignalRouter>,
    sink: parking_lot::RwLock<Arc<dyn EventSink>>,
    socket: parking_lot::RwLock<Option<Arc<UdpSocket>>>,
    state: parking_lot::Mutex<MeshState>,
    started_at: parking_lot::Mutex<Option<Instant>>,
}

/// Cloneable handle for sending on and inspecting a mesh.
#[derive(Clone)]
pub struct MeshHandle {
    shared: Arc<Shared>,
}

impl MeshHandle {
    pub fn server_name(&self) -> &str {
        &self.shared.config.server_name
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    pub fn state(&self) -> MeshState {
        *self.shared.state.lock()
    }

    /// Address the socket is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|s| s.local_addr().ok())
    }

    /// Add or update a peer. Liveness state of an existing peer is kept.
    pub async fn register_peer(&self, name: impl Into<String>, host: impl Into<String>, port: u16) {
        let name = name.into();
        let host = host.into();
        if self.shared.registry.write().await.register(name.clone(), host.clone(), port) {
            info!("Registered peer '{name}' at {host}:{port}");
        }
    }

    pub async fn peer(&self, name: &str) -> Option<Peer> {
        self.shared.registry.read().await.get(name).cloned()
    }

    /// Snapshot of every peer, sorted by name.
    pub async fn peers(&self) -> Vec<Peer> {
        self.shared
            .registry
            .read()
            .await
            .list_all()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn tumbler_stats(&self) -> TumblerStats {
        self.shared.router.read().await.tumbler_stats()
    }

    pub async fn reset_tumbler_stats(&self) {
        self.shared.router.write().await.reset_stats();
    }

    pub async fn status(&self) -> MeshStatus {
        let (tumbler, handler_failures) = {
            let router = self.shared.router.read().await;
            (router.tumbler_stats(), router.handler_failures())
        };
        MeshStatus {
            server_name: self.server_name().to_string(),
            state: self.state(),
            local_addr: self.local_addr().map(|a| a.to_string()),
            peers: self.peers().await,
            tumbler,
            handler_failures,
        }
    }

    /// Send one signal to a named peer. Best-effort: an unknown peer or a
    /// failed send is logged and returned, never retried.
    pub async fn send(
        &self,
        peer: &str,
        kind: SignalType,
        payload: serde_json::Value,
    ) -> Result<(), MeshError> {
        let socket = self.socket().ok_or(MeshError::NotRunning)?;
        let addr = self.shared.registry.read().await.get(peer).map(Peer::address);
        let Some(addr) = addr else {
            warn!("Cannot send {kind}: no peer named '{peer}'");
            return Err(MeshError::PeerNotFound(peer.to_string()));
        };

        let frame = self.encode(kind, payload)?;
        send_frame(&socket, peer, &addr, &frame).await.inspect_err(|e| warn!("{e}"))
    }

    /// Send one signal to every registered peer concurrently. One peer's
    /// failure does not affect the others.
    pub async fn broadcast(
        &self,
        kind: SignalType,
        payload: serde_json::Value,
    ) -> Result<BroadcastReport, MeshError> {
        let socket = self.socket().ok_or(MeshError::NotRunning)?;
        let frame = self.encode(kind, payload)?;
        let targets = self.shared.registry.read().await.addresses();
        Ok(fan_out(&socket, targets, &frame, kind).await)
    }

    /// One liveness sweep and recovery pass at `now`. The maintenance loop
    /// calls this on every tick.
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let policy = self.shared.policy;
        let timeout = self.shared.config.heartbeat_timeout;

        let (report, probes) = {
            let mut registry = self.shared.registry.write().await;
            let newly_inactive = registry.sweep_at(now, timeout);
            let exhausted = registry.expire_exhausted(now, &policy);

            let mut probed = Vec::new();
            let mut probes = Vec::new();
            for name in registry.due_for_recovery(now, &policy) {
                if let Some(delay) = registry.schedule_recovery(&name, now, &policy) {
                    if let Some(peer) = registry.get(&name) {
                        probes.push((name.clone(), peer.address()));
                    }
                    probed.push((name, delay));
                }
            }
            (
                MaintenanceReport {
                    newly_inactive,
                    probed,
                    exhausted,
                },
                probes,
            )
        };

        for name in &report.newly_inactive {
            info!("Peer '{name}' inactive: no traffic for {timeout:?}");
            self.emit(events::PEER_INACTIVE, serde_json::json!({"peer": name, "reason": "timeout"}));
        }
        for name in &report.exhausted {
            warn!(
                "Peer '{name}' did not answer {} recovery probes; giving up",
                policy.max_attempts
            );
            self.emit(
                events::RECOVERY_EXHAUSTED,
                serde_json::json!({"peer": name, "attempts": policy.max_attempts}),
            );
        }
        for (name, delay) in &report.probed {
            debug!("Recovery probe to '{name}', next in {delay:?}");
        }

        if !probes.is_empty()
            && let Some(socket) = self.socket()
        {
            match self.encode(SignalType::Discovery, self.discovery_payload(true)) {
                Ok(frame) => {
                    fan_out(&socket, probes, &frame, SignalType::Discovery).await;
                }
                Err(e) => warn!("Failed to encode recovery probe: {e}"),
            }
        }

        report
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.shared.socket.read().clone()
    }

    fn emit(&self, event_type: &str, data: serde_json::Value) {
        let sink = Arc::clone(&*self.shared.sink.read());
        sink.emit(event_type, data);
    }

    fn encode(&self, kind: SignalType, payload: serde_json::Value) -> Result<Vec<u8>, MeshError> {
        let payload = match payload {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };
        Ok(wire::encode(kind, &payload, Some(self.server_name()))?)
    }

    fn uptime_secs(&self) -> u64 {
        self.shared
            .started_at
            .lock()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    fn discovery_payload(&self, probe: bool) -> serde_json::Value {
        let config = &self.shared.config;
        let port = self.local_addr().map_or(config.port, |a| a.port());
        serde_json::to_value(DiscoveryPayload {
            sender: config.server_name.clone(),
            instance_id: self.shared.instance_id.clone(),
            port,
            capabilities: config.capabilities.clone(),
            accepted_signals: config.accepted_signals.clone(),
            probe,
        })
        .unwrap_or_default()
    }

    fn heartbeat_payload(&self) -> serde_json::Value {
        serde_json::to_value(HeartbeatPayload {
            sender: self.shared.config.server_name.clone(),
            instance_id: self.shared.instance_id.clone(),
            uptime_secs: self.uptime_secs(),
        })
        .unwrap_or_default()
    }

    /// Full inbound path for one datagram.
    async fn handle_datagram(&self, bytes: &[u8], source: SocketAddr) -> Option<RouteOutcome> {
        let signal = wire::decode(bytes)?;

        if signal.payload.get("instance_id").and_then(|v| v.as_str())
            == Some(self.shared.instance_id.as_str())
        {
            trace!("Ignoring own {} datagram", signal.kind);
            return None;
        }

        let sender = self.track_sender(&signal, source).await?;
        trace!(
            "Received {} from {} ({source})",
            signal.kind,
            sender.as_deref().unwrap_or("unregistered")
        );

        self.handle_protocol(&signal, sender.as_deref(), source).await;

        let outcome = self.shared.router.write().await.route(&signal, source);
        Some(outcome)
    }

    /// Resolve the sender to a registered peer and update its liveness.
    /// Returns `None` when the datagram must be dropped, `Some(None)` for an
    /// admitted but unregistered sender.
    async fn track_sender(&self, signal: &Signal, source: SocketAddr) -> Option<Option<String>> {
        let mut registry = self.shared.registry.write().await;

        let mut name = signal
            .sender
            .as_deref()
            .filter(|n| registry.contains(n))
            .map(str::to_string)
            .or_else(|| registry.find_by_addr(&source).map(|p| p.name.clone()));

        if name.is_none() {
            match self.shared.config.unknown_peer_policy {
                UnknownPeerPolicy::Drop => {
                    debug!("Dropping {} from unregistered sender {source}", signal.kind);
                    return None;
                }
                UnknownPeerPolicy::Admit => {}
                UnknownPeerPolicy::Register => {
                    if let Some(sender) = signal.sender.as_deref() {
                        let port = signal
                            .payload_as::<DiscoveryPayload>()
                            .map(|d| d.port)
                            .unwrap_or_else(|_| source.port());
                        registry.register(sender, source.ip().to_string(), port);
                        info!("Registered peer '{sender}' at {}:{port} on first contact", source.ip());
                        name = Some(sender.to_string());
                    }
                }
            }
        }

        let Some(name) = name else {
            return Some(None);
        };

        match registry.mark_seen(&name) {
            SeenOutcome::Recovered => {
                drop(registry);
                info!("Peer '{name}' recovered");
                self.emit(events::PEER_RECOVERED, serde_json::json!({"peer": name}));
            }
            SeenOutcome::FirstContact => debug!("First contact from peer '{name}'"),
            SeenOutcome::Refreshed | SeenOutcome::Unregistered => {}
        }
        Some(Some(name))
    }

    /// Transport-level reactions that happen regardless of the Tumbler.
    async fn handle_protocol(&self, signal: &Signal, sender: Option<&str>, source: SocketAddr) {
        match signal.kind {
            SignalType::Shutdown => {
                if let Some(name) = sender {
                    let reason = signal
                        .payload_as::<ShutdownPayload>()
                        .ok()
                        .and_then(|p| p.reason);
                    self.shared.registry.write().await.mark_inactive(name);
                    info!("Peer '{name}' announced shutdown");
                    self.emit(
                        events::PEER_INACTIVE,
                        serde_json::json!({"peer": name, "reason": reason.unwrap_or_else(|| "shutdown".into())}),
                    );
                }
            }
            // Answer discovery (including recovery probes) so the prober
            // sees us without waiting for the next heartbeat.
            SignalType::Discovery => self.reply(source, SignalType::Heartbeat, self.heartbeat_payload()).await,
            SignalType::Ping => {
                let echo = signal.payload.get("nonce").cloned().unwrap_or_default();
                self.reply(source, SignalType::Pong, serde_json::json!({"nonce": echo}))
                    .await;
            }
            _ => {}
        }
    }

    async fn reply(&self, to: SocketAddr, kind: SignalType, payload: serde_json::Value) {
        let Some(socket) = self.socket() else { return };
        match self.encode(kind, payload) {
            Ok(frame) => {
                if let Err(e) = socket.send_to(&frame, to).await {
                    debug!("Reply {kind} to {to} failed: {e}");
                }
            }
            Err(e) => warn!("Failed to encode {kind} reply: {e}"),
        }
    }
}

async fn send_frame(socket: &UdpSocket, peer: &str, addr: &str, frame: &[u8]) -> Result<(), MeshError> {
    socket
        .send_to(frame, addr)
        .await
        .map(|_| ())
        .map_err(|e| MeshError::transport(peer, addr, e))
}

async fn fan_out(
    socket: &UdpSocket,
    targets: Vec<(String, String)>,
    frame: &[u8],
    kind: SignalType,
) -> BroadcastReport {
    let sends = targets.iter().map(|(name, addr)| async move {
        (name, send_frame(socket, name, addr, frame).await)
    });

    let mut report = BroadcastReport::default();
    for (name, result) in join_all(sends).await {
        match result {
            Ok(()) => report.delivered.push(name.clone()),
            Err(e) => {
                warn!("Broadcast {kind}: {e}");
                report.failed.push(name.clone());
            }
        }
    }
    report
}

// ---------------------------------------------------------------------------
// MeshTransport
// ---------------------------------------------------------------------------

/// A mesh participant. Create one per process at the composition root.
pub struct MeshTransport {
    handle: MeshHandle,
    shutdown_tx: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshTransport {
    /// Build a stopped transport. Static peers from `config` are registered
    /// immediately; the Tumbler is built from `accepted_signals`.
    pub fn new(config: MeshConfig) -> Self {
        let mut registry = PeerRegistry::new();
        for peer in &config.peers {
            registry.register(peer.name.clone(), peer.host.clone(), peer.port);
        }
        let router = SignalRouter::new(Tumbler::new(&config.accepted_signals));
        let policy = config.recovery.policy();

        let shared = Shared {
            config,
            policy,
            instance_id: uuid::Uuid::new_v4().to_string(),
            registry: RwLock::new(registry),
            router: RwLock::new(router),
            sink: parking_lot::RwLock::new(Arc::new(NullSink)),
            socket: parking_lot::RwLock::new(None),
            state: parking_lot::Mutex::new(MeshState::Stopped),
            started_at: parking_lot::Mutex::new(None),
        };

        Self {
            handle: MeshHandle {
                shared: Arc::new(shared),
            },
            shutdown_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Hand every accepted signal to `recorder` through an observer hook.
    pub async fn with_recorder(self, recorder: Arc<dyn SignalRecorder>) -> Self {
        self.handle
            .shared
            .router
            .write()
            .await
            .observe_with_recorder(recorder);
        self
    }

    /// Send liveness events and a relay of accepted signals to `sink`.
    pub async fn with_event_sink(self, sink: Arc<dyn EventSink>) -> Self {
        self.handle.shared.router.write().await.relay_to(Arc::clone(&sink));
        *self.handle.shared.sink.write() = sink;
        self
    }

    pub fn handle(&self) -> MeshHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.handle.shared.config
    }

    pub fn state(&self) -> MeshState {
        self.handle.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == MeshState::Running
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }

    /// Register a handler for one signal type.
    pub async fn on_signal<F>(&self, kind: SignalType, handler: F)
    where
        F: Fn(&Signal, SocketAddr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handle.shared.router.write().await.on(kind, handler);
    }

    /// Register a wildcard handler for every accepted signal.
    pub async fn on_any<F>(&self, handler: F)
    where
        F: Fn(&Signal, SocketAddr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handle.shared.router.write().await.observe(handler);
    }

    /// Direct access to the router for bulk registration.
    pub async fn with_router<R>(&self, f: impl FnOnce(&mut SignalRouter) -> R) -> R {
        f(&mut *self.handle.shared.router.write().await)
    }

    /// Queue that handlers use for asynchronous side effects.
    pub async fn work_queue(&self) -> crate::queue::WorkQueue {
        self.handle.shared.router.read().await.queue()
    }

    /// Bind the socket, start the background loops and announce ourselves.
    /// A bind failure is returned as-is and leaves the transport stopped.
    pub async fn start(&mut self) -> Result<SocketAddr, MeshError> {
        {
            let mut state = self.handle.shared.state.lock();
            if *state != MeshState::Stopped {
                return Err(MeshError::AlreadyStarted(state.to_string()));
            }
            *state = MeshState::Starting;
        }

        let (socket, local_addr) = match self.bind_socket().await {
            Ok(bound) => bound,
            Err(e) => {
                *self.handle.shared.state.lock() = MeshState::Stopped;
                return Err(e);
            }
        };

        *self.handle.shared.socket.write() = Some(Arc::clone(&socket));
        *self.handle.shared.started_at.lock() = Some(Instant::now());

        let (shutdown_tx, _) = broadcast::channel(4);
        self.shutdown_tx = Some(shutdown_tx.clone());

        self.tasks.push(tokio::spawn(receive_loop(
            self.handle(),
            socket,
            shutdown_tx.subscribe(),
        )));
        self.tasks.push(tokio::spawn(heartbeat_loop(
            self.handle(),
            self.config().heartbeat_interval,
            shutdown_tx.subscribe(),
        )));
        self.tasks.push(tokio::spawn(maintenance_loop(
            self.handle(),
            self.config().recovery.check_interval,
            shutdown_tx.subscribe(),
        )));

        *self.handle.shared.state.lock() = MeshState::Running;
        info!(
            "InterLock '{}' listening on {local_addr} ({} peers)",
            self.handle.server_name(),
            self.config().peers.len()
        );
        self.handle.emit(
            events::MESH_STARTED,
            serde_json::json!({"server": self.handle.server_name(), "addr": local_addr.to_string()}),
        );

        match self
            .handle
            .broadcast(SignalType::Discovery, self.handle.discovery_payload(false))
            .await
        {
            Ok(report) => debug!("Discovery announced to {} peers", report.delivered.len()),
            Err(e) => warn!("Discovery announcement failed: {e}"),
        }

        Ok(local_addr)
    }

    async fn bind_socket(&self) -> Result<(Arc<UdpSocket>, SocketAddr), MeshError> {
        let bind_addr = self.config().bind_addr();
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| MeshError::bind(bind_addr, e))?;
        let local_addr = socket.local_addr()?;
        Ok((Arc::new(socket), local_addr))
    }

    /// Announce shutdown, stop the loops and close the socket. Returns once
    /// the socket is released. No-op unless running.
    pub async fn stop(&mut self) {
        {
            let mut state = self.handle.shared.state.lock();
            if *state != MeshState::Running {
                return;
            }
            *state = MeshState::Stopping;
        }

        let notice = serde_json::to_value(ShutdownPayload {
            sender: self.handle.server_name().to_string(),
            reason: Some("shutdown".to_string()),
        })
        .unwrap_or_default();
        if let Err(e) = self.handle.broadcast(SignalType::Shutdown, notice).await {
            debug!("Shutdown notice not sent: {e}");
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!("Mesh task ended abnormally: {e}");
            }
        }

        self.handle.shared.router.read().await.queue().abort_all();

        // The loops held the only other references; dropping ours closes it.
        self.handle.shared.socket.write().take();
        *self.handle.shared.started_at.lock() = None;
        *self.handle.shared.state.lock() = MeshState::Stopped;

        info!("InterLock '{}' stopped", self.handle.server_name());
        self.handle.emit(
            events::MESH_STOPPED,
            serde_json::json!({"server": self.handle.server_name()}),
        );
    }

    pub async fn send(
        &self,
        peer: &str,
        kind: SignalType,
        payload: serde_json::Value,
    ) -> Result<(), MeshError> {
        self.handle.send(peer, kind, payload).await
    }

    pub async fn broadcast(
        &self,
        kind: SignalType,
        payload: serde_json::Value,
    ) -> Result<BroadcastReport, MeshError> {
        self.handle.broadcast(kind, payload).await
    }
}

impl Drop for MeshTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn receive_loop(handle: MeshHandle, socket: Arc<UdpSocket>, mut shutdown: broadcast::Receiver<()>) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, source)) => {
                        handle.handle_datagram(&buf[..len], source).await;
                    }
                    // ICMP port-unreachable from a dead peer surfaces here on
                    // some platforms; it is not fatal to the socket.
                    Err(e) => debug!("Receive error: {e}"),
                }
            }
            _ = shutdown.recv() => {
                debug!("Receive loop shutting down");
                break;
            }
        }
    }
}

async fn heartbeat_loop(handle: MeshHandle, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match handle.broadcast(SignalType::Heartbeat, handle.heartbeat_payload()).await {
                    Ok(report) => trace!("Heartbeat sent to {}/{} peers", report.delivered.len(), report.attempted()),
                    Err(e) => debug!("Heartbeat skipped: {e}"),
                }
            }
            _ = shutdown.recv() => {
                debug!("Heartbeat loop shutting down");
                break;
            }
        }
    }
}

async fn maintenance_loop(handle: MeshHandle, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                handle.run_maintenance(Utc::now()).await;
            }
            _ = shutdown.recv() => {
                debug!("Maintenance loop shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::BroadcastSink;
    use crate::config::PeerConfig;

    fn loopback_config(name: &str) -> MeshConfig {
        let mut config = MeshConfig::named(name);
        config.bind_host = "127.0.0.1".parse().unwrap();
        config.port = 0;
        config
    }

    /// A raw socket standing in for a remote peer.
    async fn fake_peer() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    async fn recv_signal(socket: &UdpSocket) -> Signal {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("datagram within timeout")
            .unwrap();
        wire::decode(&buf[..len]).expect("decodable datagram")
    }

    #[tokio::test]
    async fn test_new_registers_static_peers() {
        let mut config = loopback_config("api");
        config.peers = vec![PeerConfig::new("search", "127.0.0.1", 4000)];
        let mesh = MeshTransport::new(config);
        assert_eq!(mesh.state(), MeshState::Stopped);
        assert!(mesh.local_addr().is_none());

        let peers = mesh.handle().peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "search");
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let mut mesh = MeshTransport::new(loopback_config("lifecycle"));
        let addr = mesh.start().await.unwrap();
        assert!(mesh.is_running());
        assert_ne!(addr.port(), 0);
        assert!(matches!(mesh.start().await, Err(MeshError::AlreadyStarted(_))));

        mesh.stop().await;
        assert_eq!(mesh.state(), MeshState::Stopped);
        assert!(mesh.local_addr().is_none());

        // Stopping twice is a no-op; restarting works.
        mesh.stop().await;
        mesh.start().await.unwrap();
        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_fails_start() {
        let (holder, port) = fake_peer().await;
        let mut config = loopback_config("clash");
        config.port = port;

        let mut mesh = MeshTransport::new(config);
        let err = mesh.start().await.unwrap_err();
        assert!(matches!(err, MeshError::Bind { .. }));
        assert_eq!(mesh.state(), MeshState::Stopped);

        // A failed start leaves the transport restartable.
        drop(holder);
        assert_eq!(mesh.start().await.unwrap().port(), port);
        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_stop_aborts_queued_handler_jobs() {
        let mut mesh = MeshTransport::new(loopback_config("busy"));
        mesh.start().await.unwrap();

        let queue = mesh.work_queue().await;
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        queue.submit(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(queue.pending(), 1);

        mesh.stop().await;
        let drained = tokio::time::timeout(Duration::from_secs(2), queue.drain())
            .await
            .expect("aborted job finishes promptly");
        assert_eq!(drained, 1);
        assert!(!finished.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_send_requires_running_and_known_peer() {
        let mut mesh = MeshTransport::new(loopback_config("sender"));
        assert!(matches!(
            mesh.send("nobody", SignalType::Ping, serde_json::json!({})).await,
            Err(MeshError::NotRunning)
        ));

        mesh.start().await.unwrap();
        assert!(matches!(
            mesh.send("nobody", SignalType::Ping, serde_json::json!({})).await,
            Err(MeshError::PeerNotFound(_))
        ));
        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_start_announces_discovery_and_stop_announces_shutdown() {
        let (peer, port) = fake_peer().await;
        let mut config = loopback_config("announcer");
        config.capabilities = vec!["search".into()];
        config.peers = vec![PeerConfig::new("watcher", "127.0.0.1", port)];

        let mut mesh = MeshTransport::new(config);
        let addr = mesh.start().await.unwrap();

        let discovery = recv_signal(&peer).await;
        assert_eq!(discovery.kind, SignalType::Discovery);
        let payload: DiscoveryPayload = discovery.payload_as().unwrap();
        assert_eq!(payload.sender, "announcer");
        assert_eq!(payload.port, addr.port());
        assert_eq!(payload.capabilities, vec!["search".to_string()]);
        assert!(!payload.probe);

        mesh.stop().await;
        let shutdown = recv_signal(&peer).await;
        assert_eq!(shutdown.kind, SignalType::Shutdown);
        assert_eq!(shutdown.sender.as_deref(), Some("announcer"));
    }

    #[tokio::test]
    async fn test_broadcast_survives_unreachable_peer() {
        let (peer, port) = fake_peer().await;
        let mut config = loopback_config("fanout");
        config.peers = vec![
            PeerConfig::new("good", "127.0.0.1", port),
            // An IPv4 socket cannot reach an IPv6 address.
            PeerConfig::new("bad", "::1", 9),
        ];

        let mut mesh = MeshTransport::new(config);
        mesh.start().await.unwrap();
        let _ = recv_signal(&peer).await; // discovery

        let report = mesh
            .broadcast(SignalType::BuildCompleted, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(report.delivered, vec!["good".to_string()]);
        assert_eq!(report.failed, vec!["bad".to_string()]);

        let signal = recv_signal(&peer).await;
        assert_eq!(signal.kind, SignalType::BuildCompleted);
        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_marks_peer_seen_and_answers_ping() {
        let (peer, port) = fake_peer().await;
        let mut config = loopback_config("listener");
        config.peers = vec![PeerConfig::new("pinger", "127.0.0.1", port)];

        let mut mesh = MeshTransport::new(config);
        let addr = mesh.start().await.unwrap();
        let _ = recv_signal(&peer).await; // discovery

        let frame = wire::encode(SignalType::Ping, &serde_json::json!({"nonce": 7}), Some("pinger")).unwrap();
        peer.send_to(&frame, addr).await.unwrap();

        let pong = recv_signal(&peer).await;
        assert_eq!(pong.kind, SignalType::Pong);
        assert_eq!(pong.payload["nonce"], 7);

        let seen = mesh.handle().peer("pinger").await.unwrap();
        assert_eq!(seen.status, crate::peer::PeerStatus::Active);
        assert_eq!(seen.heartbeat_count, 1);
        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_peer_policies() {
        let source: SocketAddr = "127.0.0.1:5999".parse().unwrap();
        let frame = wire::encode(
            SignalType::FileIndexed,
            &serde_json::json!({"path": "/x"}),
            Some("stranger"),
        )
        .unwrap();

        let mut config = loopback_config("strict");
        config.unknown_peer_policy = UnknownPeerPolicy::Drop;
        let strict = MeshTransport::new(config);
        assert!(strict.handle().handle_datagram(&frame, source).await.is_none());
        assert_eq!(strict.handle().tumbler_stats().await.total(), 0);

        let open = MeshTransport::new(loopback_config("open"));
        let outcome = open.handle().handle_datagram(&frame, source).await.unwrap();
        assert!(outcome.verdict.accepted);
        assert!(open.handle().peers().await.is_empty());

        let mut config = loopback_config("welcoming");
        config.unknown_peer_policy = UnknownPeerPolicy::Register;
        let welcoming = MeshTransport::new(config);
        welcoming.handle().handle_datagram(&frame, source).await.unwrap();
        let peer = welcoming.handle().peer("stranger").await.unwrap();
        assert_eq!(peer.address(), "127.0.0.1:5999");
        assert_eq!(peer.status, crate::peer::PeerStatus::Active);
    }

    #[tokio::test]
    async fn test_own_datagrams_are_ignored() {
        let mesh = MeshTransport::new(loopback_config("echo"));
        let handle = mesh.handle();
        let frame = wire::encode(SignalType::Heartbeat, &handle.heartbeat_payload(), Some("echo")).unwrap();
        assert!(handle.handle_datagram(&frame, "127.0.0.1:1".parse().unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_notice_marks_peer_inactive() {
        let mut config = loopback_config("observer");
        config.peers = vec![PeerConfig::new("builder", "127.0.0.1", 6001)];
        let sink = BroadcastSink::new(16);
        let mut events_rx = sink.subscribe();
        let mesh = MeshTransport::new(config).with_event_sink(Arc::new(sink)).await;

        let frame = wire::encode(SignalType::Shutdown, &serde_json::json!({}), Some("builder")).unwrap();
        mesh.handle()
            .handle_datagram(&frame, "127.0.0.1:6001".parse().unwrap())
            .await
            .unwrap();

        let peer = mesh.handle().peer("builder").await.unwrap();
        assert_eq!(peer.status, crate::peer::PeerStatus::Inactive);

        let mut saw_inactive = false;
        while let Ok(event) = events_rx.try_recv() {
            saw_inactive |= event.event_type == events::PEER_INACTIVE && event.data["peer"] == "builder";
        }
        assert!(saw_inactive);
    }

    #[tokio::test]
    async fn test_recovery_probes_follow_backoff_and_recover() {
        let (peer, port) = fake_peer().await;
        let mut config = loopback_config("prober");
        config.peers = vec![PeerConfig::new("flaky", "127.0.0.1", port)];
        let sink = BroadcastSink::new(64);
        let mut events_rx = sink.subscribe();

        let mut mesh = MeshTransport::new(config).with_event_sink(Arc::new(sink)).await;
        let addr = mesh.start().await.unwrap();
        let handle = mesh.handle();
        let _ = recv_signal(&peer).await; // discovery

        // Peer checks in once, then goes quiet.
        let hello = wire::encode(SignalType::Heartbeat, &serde_json::json!({}), Some("flaky")).unwrap();
        peer.send_to(&hello, addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.peer("flaky").await.unwrap().heartbeat_count == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let seen_at = handle.peer("flaky").await.unwrap().last_seen_at.unwrap();
        let mut now = seen_at + chrono::Duration::seconds(91);

        let first = handle.run_maintenance(now).await;
        assert_eq!(first.newly_inactive, vec!["flaky".to_string()]);
        assert_eq!(first.probed, vec![("flaky".to_string(), Duration::from_secs(10))]);
        let probe = recv_signal(&peer).await;
        assert_eq!(probe.kind, SignalType::Discovery);
        assert_eq!(probe.payload["probe"], true);

        now += chrono::Duration::seconds(10);
        let second = handle.run_maintenance(now).await;
        assert_eq!(second.probed, vec![("flaky".to_string(), Duration::from_secs(20))]);
        let _ = recv_signal(&peer).await;

        // Any traffic from the peer resets recovery.
        peer.send_to(&hello, addr).await.unwrap();
        let recovered = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(event) = events_rx.recv().await
                    && event.event_type == events::PEER_RECOVERED
                {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(recovered.data["peer"], "flaky");

        let peer_state = handle.peer("flaky").await.unwrap();
        assert_eq!(peer_state.status, crate::peer::PeerStatus::Active);
        assert_eq!(peer_state.recovery_attempts, 0);

        mesh.stop().await;
    }
}
