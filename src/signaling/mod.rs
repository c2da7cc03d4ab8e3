// Copyright (C) 2026 Flux Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Typed signaling between peers.
//!
//! Messages travel as JSON envelopes over an in-process broadcast bus and,
//! when configured, a WebSocket relay. Each kind has at most one handler.

use crate::types::{PeerId, UserId, now_ms};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

pub mod message;

pub use message::{
    AnnouncePayload, AnswerPayload, AvailablePayload, IcePayload, OfferPayload, PeerProfile,
    QueryPayload, Signal, SignalEnvelope, SignalKind, SignalMessage,
};

const LOCAL_BUS_CAPACITY: usize = 1024;
/// Frames kept for the relay while it is unreachable; the oldest go first
const RELAY_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("Signaling channel is closed")]
    Closed,

    #[error("No signaling transport is available")]
    NoTransport,

    #[error("Failed to encode signal: {0}")]
    Encode(#[from] serde_json::Error),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Same-process broadcast bus shared by every channel attached to it
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<String>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Returns false when nobody is listening
    pub fn publish(&self, text: String) -> bool {
        self.tx.send(text).is_ok()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct SignalingOptions {
    pub local_bus: Option<LocalBus>,
    pub relay_url: Option<String>,
    pub reconnect_delay: Duration,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            local_bus: None,
            relay_url: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Snapshot of transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub local_sent: u64,
    pub relay_sent: u64,
    pub relay_queued: u64,
    pub relay_reconnects: u64,
    pub received: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct TransportCounters {
    local_sent: AtomicU64,
    relay_sent: AtomicU64,
    relay_queued: AtomicU64,
    relay_reconnects: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl TransportCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            local_sent: self.local_sent.load(Ordering::Relaxed),
            relay_sent: self.relay_sent.load(Ordering::Relaxed),
            relay_queued: self.relay_queued.load(Ordering::Relaxed),
            relay_reconnects: self.relay_reconnects.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Relay socket state shared between `send` and the relay task
#[derive(Default)]
struct RelayState {
    sink: Option<mpsc::UnboundedSender<String>>,
    queue: VecDeque<String>,
}

impl RelayState {
    fn is_open(&self) -> bool {
        self.sink.as_ref().is_some_and(|sink| !sink.is_closed())
    }

    /// Queue a frame for the next connection. Returns how many old frames
    /// were dropped to stay within capacity.
    fn enqueue(&mut self, text: String) -> usize {
        self.queue.push_back(text);
        self.trim()
    }

    /// Detach the socket writer and put frames it never wrote back in
    /// front of the queue
    fn detach(&mut self, unsent: Vec<String>) -> usize {
        self.sink = None;
        for text in unsent.into_iter().rev() {
            self.queue.push_front(text);
        }
        self.trim()
    }

    fn trim(&mut self) -> usize {
        let excess = self.queue.len().saturating_sub(RELAY_QUEUE_CAPACITY);
        self.queue.drain(..excess);
        excess
    }

    /// Attach a fresh socket writer and flush queued frames in order
    fn open(&mut self, sink: mpsc::UnboundedSender<String>) -> usize {
        let flushed = self.queue.len();
        while let Some(text) = self.queue.pop_front() {
            if sink.send(text).is_err() {
                break;
            }
        }
        self.sink = Some(sink);
        flushed
    }
}

pub type SignalHandler = Arc<dyn Fn(Signal) + Send + Sync>;

struct ChannelInner {
    peer_id: PeerId,
    user_id: UserId,
    handlers: Mutex<HashMap<SignalKind, SignalHandler>>,
    known_peers: Mutex<HashSet<PeerId>>,
    local_bus: Option<LocalBus>,
    relay: Option<Arc<Mutex<RelayState>>>,
    counters: Arc<TransportCounters>,
    closed: AtomicBool,
}

impl ChannelInner {
    fn receive(&self, text: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let envelope: SignalEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping undecodable signal: {}", e);
                TransportCounters::bump(&self.counters.dropped);
                return;
            }
        };

        if envelope.from == self.peer_id {
            return;
        }
        if envelope.to.as_ref().is_some_and(|to| *to != self.peer_id) {
            return;
        }

        let kind = envelope.kind;
        let signal = match Signal::from_envelope(envelope) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Malformed {} payload: {}", kind, e);
                TransportCounters::bump(&self.counters.dropped);
                return;
            }
        };
        TransportCounters::bump(&self.counters.received);

        match kind {
            SignalKind::Announce => {
                lock(&self.known_peers).insert(signal.from.clone());
            }
            SignalKind::Goodbye => {
                lock(&self.known_peers).remove(&signal.from);
            }
            _ => {}
        }

        let handler = lock(&self.handlers).get(&kind).cloned();
        match handler {
            Some(handler) => handler(signal),
            None => debug!("No handler for {} from {}", kind, signal.from.short()),
        }
    }
}

/// Signaling endpoint for one local peer
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Attach to the configured transports. Must be called within a tokio runtime.
    pub fn new(peer_id: PeerId, user_id: UserId, options: SignalingOptions) -> Self {
        let counters = Arc::new(TransportCounters::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let relay_url = options.relay_url.and_then(|url| {
            let url = url.trim().to_string();
            if url.starts_with("ws://") || url.starts_with("wss://") {
                Some(url)
            } else {
                error!("Ignoring relay url {:?}: expected ws:// or wss://", url);
                None
            }
        });
        let relay = relay_url.as_ref().map(|_| Arc::new(Mutex::new(RelayState::default())));

        let inner = Arc::new(ChannelInner {
            peer_id,
            user_id,
            handlers: Mutex::new(HashMap::new()),
            known_peers: Mutex::new(HashSet::new()),
            local_bus: options.local_bus,
            relay: relay.clone(),
            counters: counters.clone(),
            closed: AtomicBool::new(false),
        });

        if let Some(bus) = &inner.local_bus {
            let rx = bus.subscribe();
            tasks.push(tokio::spawn(run_local_bus(
                Arc::downgrade(&inner),
                rx,
                shutdown_rx.clone(),
            )));
        }

        if let (Some(url), Some(state)) = (relay_url, relay) {
            tasks.push(tokio::spawn(run_relay(
                Arc::downgrade(&inner),
                url,
                state,
                counters,
                options.reconnect_delay,
                shutdown_rx,
            )));
        }

        if inner.local_bus.is_none() && inner.relay.is_none() {
            warn!("Signaling channel has no transport; messages will not leave this node");
        }

        Self {
            inner,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// Broadcast (`target == None`) or address a message to one peer
    pub fn send(&self, message: SignalMessage, target: Option<&PeerId>) -> Result<(), SignalingError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        self.dispatch(message, target)
    }

    fn dispatch(&self, message: SignalMessage, target: Option<&PeerId>) -> Result<(), SignalingError> {
        let envelope = SignalEnvelope {
            kind: message.kind(),
            from: self.inner.peer_id.clone(),
            to: target.cloned(),
            user_id: self.inner.user_id.clone(),
            payload: message.to_payload()?,
            timestamp: now_ms(),
        };
        let text = serde_json::to_string(&envelope)?;
        let counters = &self.inner.counters;

        let mut delivered = false;

        if let Some(bus) = &self.inner.local_bus {
            bus.publish(text.clone());
            TransportCounters::bump(&counters.local_sent);
            delivered = true;
        }

        if let Some(relay) = &self.inner.relay {
            let mut relay = lock(relay);
            let sent = match &relay.sink {
                Some(sink) if relay.is_open() => sink.send(text.clone()).is_ok(),
                _ => false,
            };
            // relay_sent is counted by the relay task once the frame is written
            if !sent {
                TransportCounters::bump(&counters.relay_queued);
                let dropped = relay.enqueue(text);
                if dropped > 0 {
                    counters.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
                }
            }
            delivered = true;
        }

        if delivered {
            Ok(())
        } else {
            Err(SignalingError::NoTransport)
        }
    }

    /// Install the handler for `kind`, replacing any previous one
    pub fn on<F>(&self, kind: SignalKind, handler: F)
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        lock(&self.inner.handlers).insert(kind, Arc::new(handler));
    }

    pub fn off(&self, kind: SignalKind) {
        lock(&self.inner.handlers).remove(&kind);
    }

    /// Peers that announced themselves and have not said goodbye
    pub fn known_peers(&self) -> HashSet<PeerId> {
        lock(&self.inner.known_peers).clone()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.inner.counters.snapshot()
    }

    pub fn relay_open(&self) -> bool {
        self.inner.relay.as_ref().is_some_and(|relay| lock(relay).is_open())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Say goodbye and stop every transport task
    pub async fn close(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.dispatch(SignalMessage::Goodbye, None) {
            debug!("Goodbye not sent: {}", e);
        }
        self.inner.closed.store(true, Ordering::SeqCst);

        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            // The relay task flushes the goodbye before honouring shutdown
            if tokio::time::timeout(Duration::from_millis(500), task).await.is_err() {
                debug!("Signaling task did not stop in time");
            }
        }

        lock(&self.inner.handlers).clear();
        lock(&self.inner.known_peers).clear();
        info!("Signaling channel for {} closed", self.inner.peer_id.short());
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

async fn run_local_bus(
    inner: Weak<ChannelInner>,
    mut rx: broadcast::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            received = rx.recv() => match received {
                Ok(text) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.receive(&text);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Local signaling bus lagged, {} messages skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!("Local signaling bus task stopped");
}

/// Connect, pump frames both ways, and reconnect after `delay` on close
///
/// The loop is sequential, so at most one reconnect is pending at any time.
async fn run_relay(
    inner: Weak<ChannelInner>,
    url: String,
    state: Arc<Mutex<RelayState>>,
    counters: Arc<TransportCounters>,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!("Connected to signaling relay {}", url);
                let (mut write, mut read) = socket.split();
                let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<String>();

                let flushed = lock(&state).open(sink_tx);
                if flushed > 0 {
                    debug!("Flushed {} queued signals to relay", flushed);
                }

                let mut stopping = false;
                let mut unsent = Vec::new();
                loop {
                    tokio::select! {
                        biased;

                        Some(text) = sink_rx.recv() => {
                            if let Err(e) = write.send(WsMessage::Text(text.clone())).await {
                                warn!("Relay send failed: {}", e);
                                unsent.push(text);
                                break;
                            }
                            TransportCounters::bump(&counters.relay_sent);
                        }

                        _ = shutdown.changed() => {
                            stopping = true;
                            break;
                        }

                        frame = read.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                let Some(inner) = inner.upgrade() else {
                                    stopping = true;
                                    break;
                                };
                                inner.receive(&text);
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                info!("Signaling relay closed the connection");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("Signaling relay error: {}", e);
                                break;
                            }
                        }
                    }
                }

                {
                    let mut relay = lock(&state);
                    sink_rx.close();
                    while let Ok(text) = sink_rx.try_recv() {
                        unsent.push(text);
                    }
                    let requeued = unsent.len();
                    let dropped = relay.detach(unsent);
                    if dropped > 0 {
                        counters.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
                    }
                    if requeued > 0 {
                        debug!("Requeued {} unsent signals", requeued);
                    }
                }
                if stopping {
                    let _ = write.close().await;
                    break;
                }
            }
            Err(e) => {
                warn!("Could not reach signaling relay {}: {}", url, e);
            }
        }

        TransportCounters::bump(&counters.relay_reconnects);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("Signaling relay task stopped");
}
