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

use crate::protocol::PeerMessage;
use crate::rtc::{
    DataChannel, DataChannelEvent, DataChannelOptions, IceCandidate, RtcBackend, RtcConfig,
    RtcConnection, RtcConnectionState, RtcError, RtcEvent, SessionDescription,
};
use crate::types::{ConnectionDirection, PeerId, PeerState, UserId, now_ms};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

pub mod peer;

pub use peer::{PeerInfo, PeerSnapshot, PeerTable};

/// Label of the data channel used for chunk transfer
pub const CHUNK_CHANNEL_LABEL: &str = "chunks";
const CHUNK_CHANNEL_MAX_RETRANSMITS: u16 = 3;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The connection could not be created; no entry or event exists for it
    #[error("Could not set up connection: {0}")]
    Setup(RtcError),

    #[error(transparent)]
    Rtc(#[from] RtcError),
}

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub ice_servers: Vec<String>,
    pub max_retries: u32,
    /// Applied by callers through `expire_stalled`
    pub connection_timeout: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![crate::config::DEFAULT_ICE_SERVER.to_string()],
            max_retries: 3,
            connection_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Notifications published to every subscriber
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged {
        peer_id: PeerId,
        user_id: UserId,
        state: PeerState,
        retry_count: u32,
        /// The entry is gone; no further events follow for this connection
        removed: bool,
    },

    /// Application message from a peer (pings and pongs are handled internally)
    Message {
        peer_id: PeerId,
        message: PeerMessage,
    },

    /// Local candidate to forward through signaling
    IceCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },

    LatencyMeasured {
        peer_id: PeerId,
        rtt_ms: u64,
    },
}

/// Owns every live RTC connection of the node
///
/// Cloning yields another handle to the same connection set.
#[derive(Clone)]
pub struct PeerConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    backend: Arc<dyn RtcBackend>,
    config: PeerManagerConfig,
    peers: RwLock<PeerTable>,
    events: broadcast::Sender<PeerEvent>,
    next_generation: AtomicU64,
    next_nonce: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl PeerConnectionManager {
    pub fn new(backend: Arc<dyn RtcBackend>, config: PeerManagerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                backend,
                config,
                peers: RwLock::new(PeerTable::new()),
                events,
                next_generation: AtomicU64::new(0),
                next_nonce: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PeerManagerConfig {
        &self.inner.config
    }

    /// Independent event stream; dropping the receiver unsubscribes
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// Open a connection to `peer_id` and return the local offer
    pub async fn create_offer(
        &self,
        peer_id: &PeerId,
        remote_user_id: &UserId,
    ) -> Result<SessionDescription, PeerError> {
        let inner = &self.inner;
        let connection = inner
            .backend
            .create_connection(&inner.rtc_config())
            .await
            .map_err(PeerError::Setup)?;

        let options = DataChannelOptions {
            ordered: true,
            max_retransmits: Some(CHUNK_CHANNEL_MAX_RETRANSMITS),
        };
        let channel = match connection.create_data_channel(CHUNK_CHANNEL_LABEL, options) {
            Ok(channel) => channel,
            Err(e) => {
                connection.close().await;
                return Err(PeerError::Setup(e));
            }
        };

        let generation = inner
            .register(
                peer_id,
                remote_user_id,
                connection.clone(),
                Some(channel),
                ConnectionDirection::Outbound,
            )
            .await;

        let negotiated = async {
            let offer = connection.create_offer().await?;
            connection.set_local_description(offer.clone()).await?;
            Ok::<_, RtcError>(offer)
        }
        .await;

        match negotiated {
            Ok(offer) => {
                debug!("Created offer for {}", peer_id.short());
                Ok(offer)
            }
            Err(e) => {
                warn!("Offer to {} failed: {}", peer_id.short(), e);
                inner.handle_failure(peer_id, generation).await;
                Err(e.into())
            }
        }
    }

    /// Answer a remote offer; the data channel arrives from the remote side
    pub async fn accept_offer(
        &self,
        peer_id: &PeerId,
        remote_user_id: &UserId,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        let inner = &self.inner;
        let connection = inner
            .backend
            .create_connection(&inner.rtc_config())
            .await
            .map_err(PeerError::Setup)?;

        let generation = inner
            .register(
                peer_id,
                remote_user_id,
                connection.clone(),
                None,
                ConnectionDirection::Inbound,
            )
            .await;

        let negotiated = async {
            connection.set_remote_description(offer).await?;
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            Ok::<_, RtcError>(answer)
        }
        .await;

        match negotiated {
            Ok(answer) => {
                debug!("Answered offer from {}", peer_id.short());
                Ok(answer)
            }
            Err(e) => {
                warn!("Could not answer {}: {}", peer_id.short(), e);
                inner.handle_failure(peer_id, generation).await;
                Err(e.into())
            }
        }
    }

    /// Apply the remote answer to our pending offer
    pub async fn accept_answer(&self, peer_id: &PeerId, answer: SessionDescription) -> Result<(), PeerError> {
        let (connection, generation) = {
            let peers = self.inner.peers.read().await;
            let entry = peers
                .get(peer_id)
                .ok_or_else(|| PeerError::UnknownPeer(peer_id.clone()))?;
            (entry.connection.clone(), entry.generation)
        };

        if let Err(e) = connection.set_remote_description(answer).await {
            warn!("Answer from {} rejected: {}", peer_id.short(), e);
            self.inner.handle_failure(peer_id, generation).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Apply a remote candidate; problems are logged, never returned
    pub async fn add_ice_candidate(&self, peer_id: &PeerId, candidate: IceCandidate) {
        let connection = {
            let peers = self.inner.peers.read().await;
            match peers.get(peer_id) {
                Some(entry) => entry.connection.clone(),
                None => {
                    warn!("ICE candidate for unknown peer {}", peer_id.short());
                    return;
                }
            }
        };

        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate from {}: {}", peer_id.short(), e);
        }
    }

    /// Send over the peer's data channel; false if it is missing or not open
    pub async fn send_message(&self, peer_id: &PeerId, message: &PeerMessage) -> bool {
        self.inner.send(peer_id, message).await
    }

    /// Measure RTT; the result arrives as `PeerEvent::LatencyMeasured`
    pub async fn ping(&self, peer_id: &PeerId) -> bool {
        let nonce = self.inner.next_nonce.fetch_add(1, Ordering::Relaxed);
        let ping = PeerMessage::Ping {
            nonce,
            sent_at: now_ms(),
        };
        self.inner.send(peer_id, &ping).await
    }

    /// Close and forget a peer. Returns false if it was not known.
    pub async fn close_peer(&self, peer_id: &PeerId) -> bool {
        let removed = self.inner.peers.write().await.remove(peer_id);
        let Some(info) = removed else {
            return false;
        };

        close_handles(&info).await;
        info!("Closed connection to {}", peer_id.short());
        self.inner.emit(PeerEvent::StateChanged {
            peer_id: info.id,
            user_id: info.user_id,
            state: PeerState::Disconnected,
            retry_count: info.retry_count,
            removed: true,
        });
        true
    }

    pub async fn close_all(&self) {
        let ids = self.inner.peers.read().await.ids();
        for peer_id in ids {
            self.close_peer(&peer_id).await;
        }
    }

    /// Close disconnected peers idle for at least `max_age`
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let now = now_ms();
        let max_age_ms = max_age.as_millis() as u64;
        let stale: Vec<PeerId> = self
            .inner
            .peers
            .read()
            .await
            .iter()
            .filter(|info| info.state == PeerState::Disconnected)
            .filter(|info| now.saturating_sub(info.last_seen) >= max_age_ms)
            .map(|info| info.id.clone())
            .collect();

        let mut closed = 0;
        for peer_id in stale {
            if self.close_peer(&peer_id).await {
                closed += 1;
            }
        }
        if closed > 0 {
            debug!("Swept {} stale peers", closed);
        }
        closed
    }

    /// Fail handshakes still connecting after `timeout`. Each one goes
    /// through the usual failure path, so it is either retried or removed.
    pub async fn expire_stalled(&self, timeout: Duration) -> Vec<PeerId> {
        let now = now_ms();
        let timeout_ms = timeout.as_millis() as u64;
        // A connecting entry is only touched when it is registered
        let stalled: Vec<(PeerId, u64)> = self
            .inner
            .peers
            .read()
            .await
            .iter()
            .filter(|info| info.state == PeerState::Connecting)
            .filter(|info| now.saturating_sub(info.last_seen) >= timeout_ms)
            .map(|info| (info.id.clone(), info.generation))
            .collect();

        for (peer_id, generation) in &stalled {
            warn!("Handshake with {} timed out", peer_id.short());
            self.inner.handle_failure(peer_id, *generation).await;
        }
        stalled.into_iter().map(|(peer_id, _)| peer_id).collect()
    }

    pub async fn get_connected_peers(&self) -> Vec<PeerId> {
        let mut connected: Vec<PeerId> = self
            .inner
            .peers
            .read()
            .await
            .iter()
            .filter(|info| info.state == PeerState::Connected)
            .map(|info| info.id.clone())
            .collect();
        connected.sort();
        connected
    }

    pub async fn get_peers(&self) -> Vec<PeerSnapshot> {
        self.inner.peers.read().await.iter().map(PeerInfo::snapshot).collect()
    }

    pub async fn get_peer(&self, peer_id: &PeerId) -> Option<PeerSnapshot> {
        self.inner.peers.read().await.get(peer_id).map(PeerInfo::snapshot)
    }

    pub async fn peer_state(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.inner.peers.read().await.get(peer_id).map(|info| info.state)
    }

    /// Bytes (sent, received) over every connection since creation
    pub fn traffic(&self) -> (u64, u64) {
        (
            self.inner.bytes_sent.load(Ordering::Relaxed),
            self.inner.bytes_received.load(Ordering::Relaxed),
        )
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.peers.read().await.len()
    }
}

impl ManagerInner {
    fn rtc_config(&self) -> RtcConfig {
        RtcConfig {
            ice_servers: self.config.ice_servers.clone(),
        }
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Install a fresh entry for `peer_id` and start watching its events
    async fn register(
        self: &Arc<Self>,
        peer_id: &PeerId,
        user_id: &UserId,
        connection: Arc<dyn RtcConnection>,
        channel: Option<Arc<dyn DataChannel>>,
        direction: ConnectionDirection,
    ) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = connection.take_events();

        let mut info = PeerInfo::new(
            peer_id.clone(),
            user_id.clone(),
            connection,
            direction,
            generation,
        );
        info.data_channel = channel.clone();

        let (replaced, retry_count) = {
            let mut peers = self.peers.write().await;
            if let Some(existing) = peers.get(peer_id) {
                // Retries of an unfinished handshake keep counting
                if matches!(existing.state, PeerState::Failed | PeerState::Connecting) {
                    info.retry_count = existing.retry_count;
                }
            }
            let retry_count = info.retry_count;
            (peers.insert(info), retry_count)
        };

        if let Some(old) = replaced {
            debug!("Replacing connection to {}", peer_id.short());
            close_handles(&old).await;
        }

        if let Some(rx) = events {
            tokio::spawn(run_connection(
                Arc::downgrade(self),
                peer_id.clone(),
                generation,
                rx,
            ));
        }
        if let Some(channel) = channel {
            self.watch_channel(peer_id, generation, channel.as_ref());
        }

        self.emit(PeerEvent::StateChanged {
            peer_id: peer_id.clone(),
            user_id: user_id.clone(),
            state: PeerState::Connecting,
            retry_count,
            removed: false,
        });
        generation
    }

    fn watch_channel(self: &Arc<Self>, peer_id: &PeerId, generation: u64, channel: &dyn DataChannel) {
        match channel.take_events() {
            Some(rx) => {
                tokio::spawn(run_channel(Arc::downgrade(self), peer_id.clone(), generation, rx));
            }
            None => warn!("Data channel to {} is already being watched", peer_id.short()),
        }
    }

    async fn attach_channel(self: &Arc<Self>, peer_id: &PeerId, generation: u64, channel: Arc<dyn DataChannel>) {
        {
            let mut peers = self.peers.write().await;
            let Some(entry) = peers.get_generation_mut(peer_id, generation) else {
                channel.close();
                return;
            };
            if channel.label() != CHUNK_CHANNEL_LABEL {
                debug!("Ignoring data channel {:?} from {}", channel.label(), peer_id.short());
                return;
            }
            entry.data_channel = Some(channel.clone());
        }
        self.watch_channel(peer_id, generation, channel.as_ref());
    }

    async fn handle_open(&self, peer_id: &PeerId, generation: u64) {
        let event = {
            let mut peers = self.peers.write().await;
            let Some(entry) = peers.get_generation_mut(peer_id, generation) else {
                return;
            };
            if entry.state == PeerState::Connected {
                return;
            }
            let now = now_ms();
            entry.state = PeerState::Connected;
            entry.connected_at = Some(now);
            entry.last_seen = now;
            entry.retry_count = 0;
            PeerEvent::StateChanged {
                peer_id: entry.id.clone(),
                user_id: entry.user_id.clone(),
                state: PeerState::Connected,
                retry_count: 0,
                removed: false,
            }
        };
        info!("Peer {} connected", peer_id.short());
        self.emit(event);
    }

    async fn handle_disconnect(&self, peer_id: &PeerId, generation: u64) {
        let event = {
            let mut peers = self.peers.write().await;
            let Some(entry) = peers.get_generation_mut(peer_id, generation) else {
                return;
            };
            // A failure already decided this connection's fate
            if matches!(entry.state, PeerState::Failed | PeerState::Disconnected) {
                return;
            }
            entry.state = PeerState::Disconnected;
            entry.last_seen = now_ms();
            PeerEvent::StateChanged {
                peer_id: entry.id.clone(),
                user_id: entry.user_id.clone(),
                state: PeerState::Disconnected,
                retry_count: entry.retry_count,
                removed: false,
            }
        };
        info!("Peer {} disconnected", peer_id.short());
        self.emit(event);
    }

    /// Count a failure; past `max_retries` the peer is closed and removed
    async fn handle_failure(&self, peer_id: &PeerId, generation: u64) {
        let (event, removed) = {
            let mut peers = self.peers.write().await;
            let Some(entry) = peers.get_generation_mut(peer_id, generation) else {
                return;
            };
            if entry.state == PeerState::Failed {
                return;
            }

            if entry.retry_count < self.config.max_retries {
                entry.state = PeerState::Failed;
                entry.retry_count += 1;
                entry.last_seen = now_ms();
                let event = PeerEvent::StateChanged {
                    peer_id: entry.id.clone(),
                    user_id: entry.user_id.clone(),
                    state: PeerState::Failed,
                    retry_count: entry.retry_count,
                    removed: false,
                };
                (event, None)
            } else {
                let retry_count = entry.retry_count;
                let user_id = entry.user_id.clone();
                let removed = peers.remove_generation(peer_id, generation);
                let event = PeerEvent::StateChanged {
                    peer_id: peer_id.clone(),
                    user_id,
                    state: PeerState::Failed,
                    retry_count,
                    removed: true,
                };
                (event, removed)
            }
        };

        match removed {
            Some(info) => {
                warn!(
                    "Giving up on {} after {} retries",
                    peer_id.short(),
                    info.retry_count
                );
                close_handles(&info).await;
            }
            None => debug!("Connection to {} failed, retry permitted", peer_id.short()),
        }
        self.emit(event);
    }

    async fn handle_text(&self, peer_id: &PeerId, generation: u64, text: String) {
        let message = match PeerMessage::from_text(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message from {}: {}", peer_id.short(), e);
                return;
            }
        };

        let now = now_ms();
        {
            let mut peers = self.peers.write().await;
            let Some(entry) = peers.get_generation_mut(peer_id, generation) else {
                return;
            };
            entry.bytes_received += text.len() as u64;
            entry.last_seen = now;
            self.bytes_received.fetch_add(text.len() as u64, Ordering::Relaxed);
            match &message {
                PeerMessage::ContentAvailable { hashes } => {
                    entry.available_content = hashes.iter().cloned().collect();
                }
                PeerMessage::Pong { sent_at, .. } => {
                    entry.rtt = Some(now.saturating_sub(*sent_at));
                }
                _ => {}
            }
        }

        match message {
            PeerMessage::Ping { nonce, sent_at } => {
                if !self.send(peer_id, &PeerMessage::Pong { nonce, sent_at }).await {
                    debug!("Could not answer ping from {}", peer_id.short());
                }
            }
            PeerMessage::Pong { sent_at, .. } => {
                self.emit(PeerEvent::LatencyMeasured {
                    peer_id: peer_id.clone(),
                    rtt_ms: now.saturating_sub(sent_at),
                });
            }
            message => {
                debug!("{} from {}", message.kind(), peer_id.short());
                self.emit(PeerEvent::Message {
                    peer_id: peer_id.clone(),
                    message,
                });
            }
        }
    }

    async fn send(&self, peer_id: &PeerId, message: &PeerMessage) -> bool {
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.kind(), e);
                return false;
            }
        };

        let mut peers = self.peers.write().await;
        let Some(entry) = peers.get_mut(peer_id) else {
            return false;
        };
        let channel = match &entry.data_channel {
            Some(channel) if channel.is_open() => channel.clone(),
            _ => return false,
        };

        match channel.send_text(&text) {
            Ok(()) => {
                entry.bytes_sent += text.len() as u64;
                self.bytes_sent.fetch_add(text.len() as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!("Send to {} failed: {}", peer_id.short(), e);
                false
            }
        }
    }
}

async fn close_handles(info: &PeerInfo) {
    if let Some(channel) = &info.data_channel {
        channel.close();
    }
    info.connection.close().await;
}

async fn run_connection(
    inner: Weak<ManagerInner>,
    peer_id: PeerId,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<RtcEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match event {
            RtcEvent::StateChanged(state) => match state {
                RtcConnectionState::Failed => inner.handle_failure(&peer_id, generation).await,
                RtcConnectionState::Disconnected | RtcConnectionState::Closed => {
                    inner.handle_disconnect(&peer_id, generation).await
                }
                other => debug!("Connection to {} is {:?}", peer_id.short(), other),
            },
            RtcEvent::DataChannel(channel) => {
                inner.attach_channel(&peer_id, generation, channel).await;
            }
            RtcEvent::IceCandidate(candidate) => {
                inner.emit(PeerEvent::IceCandidate {
                    peer_id: peer_id.clone(),
                    candidate,
                });
            }
        }
    }
}

async fn run_channel(
    inner: Weak<ManagerInner>,
    peer_id: PeerId,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<DataChannelEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match event {
            DataChannelEvent::Open => inner.handle_open(&peer_id, generation).await,
            DataChannelEvent::Message(text) => inner.handle_text(&peer_id, generation, text).await,
            DataChannelEvent::Close => inner.handle_disconnect(&peer_id, generation).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::ConnectionQualityTracker;
    use crate::rtc::LoopbackNetwork;

    struct Node {
        id: PeerId,
        user: UserId,
        manager: PeerConnectionManager,
        events: broadcast::Receiver<PeerEvent>,
    }

    fn node(network: &LoopbackNetwork, name: &str) -> Node {
        let manager = PeerConnectionManager::new(
            Arc::new(network.backend(name)),
            PeerManagerConfig::default(),
        );
        let events = manager.subscribe();
        Node {
            id: PeerId::from(name),
            user: UserId::from(format!("user-{}", name)),
            manager,
            events,
        }
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<PeerEvent>, mut matches: F) -> PeerEvent
    where
        F: FnMut(&PeerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    fn is_state(event: &PeerEvent, wanted: PeerState) -> bool {
        matches!(event, PeerEvent::StateChanged { state, .. } if *state == wanted)
    }

    async fn handshake(a: &Node, b: &Node) {
        let offer = a.manager.create_offer(&b.id, &b.user).await.unwrap();
        let answer = b.manager.accept_offer(&a.id, &a.user, offer).await.unwrap();
        a.manager.accept_answer(&b.id, answer).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_chunk_reaches_remote_handler() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let mut b = node(&network, "b");
        let tracker = ConnectionQualityTracker::in_memory();

        handshake(&a, &b).await;
        wait_for(&mut a.events, |e| is_state(e, PeerState::Connected)).await;
        wait_for(&mut b.events, |e| is_state(e, PeerState::Connected)).await;

        let request = PeerMessage::from_text(r#"{"type":"request_chunk","requestId":"r1"}"#).unwrap();
        assert!(a.manager.send_message(&b.id, &request).await);

        let received = wait_for(&mut b.events, |e| matches!(e, PeerEvent::Message { .. })).await;
        match received {
            PeerEvent::Message { peer_id, message } => {
                assert_eq!(peer_id, a.id);
                assert_eq!(message, request);
            }
            other => panic!("unexpected event {:?}", other),
        }

        tracker.record_success(&b.id, None).await;
        assert_eq!(tracker.get_score(&b.id).success_rate, 1.0);
        assert_eq!(a.manager.get_connected_peers().await, vec![b.id.clone()]);
    }

    #[tokio::test]
    async fn test_send_without_open_channel_returns_false() {
        let network = LoopbackNetwork::new();
        let a = node(&network, "a");
        let b = node(&network, "b");
        let message = PeerMessage::ContentAvailable { hashes: vec![] };

        assert!(!a.manager.send_message(&b.id, &message).await);

        a.manager.create_offer(&b.id, &b.user).await.unwrap();
        assert!(!a.manager.send_message(&b.id, &message).await);
        assert_eq!(a.manager.peer_state(&b.id).await, Some(PeerState::Connecting));
    }

    #[tokio::test]
    async fn test_answer_for_unknown_peer_errors() {
        let network = LoopbackNetwork::new();
        let a = node(&network, "a");

        let result = a
            .manager
            .accept_answer(&PeerId::from("ghost"), SessionDescription::answer("v=0"))
            .await;
        assert!(matches!(result, Err(PeerError::UnknownPeer(_))));

        // Unknown peers are a logged no-op for candidates
        a.manager
            .add_ice_candidate(&PeerId::from("ghost"), IceCandidate::new("candidate:1"))
            .await;
        assert_eq!(a.manager.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_retries_end_in_removal() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let b = node(&network, "b");
        let max_retries = a.manager.config().max_retries;

        for attempt in 1..=(max_retries + 1) {
            let offer = a.manager.create_offer(&b.id, &b.user).await.unwrap();
            let answer = b.manager.accept_offer(&a.id, &a.user, offer).await.unwrap();

            network.set_unreachable("b", true);
            a.manager.accept_answer(&b.id, answer).await.unwrap();
            network.set_unreachable("b", false);

            let event = wait_for(&mut a.events, |e| is_state(e, PeerState::Failed)).await;
            let PeerEvent::StateChanged { retry_count, removed, .. } = event else {
                panic!("expected a state change");
            };

            if attempt <= max_retries {
                assert_eq!(retry_count, attempt);
                assert!(!removed);
                assert_eq!(a.manager.peer_state(&b.id).await, Some(PeerState::Failed));
            } else {
                assert!(removed);
            }
        }

        assert!(a.manager.get_peer(&b.id).await.is_none());
        assert!(a.manager.get_connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_offer_expires_into_failed() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let b = node(&network, "b");

        a.manager.create_offer(&b.id, &b.user).await.unwrap();
        assert!(a.manager.expire_stalled(Duration::from_secs(60)).await.is_empty());
        assert_eq!(a.manager.peer_state(&b.id).await, Some(PeerState::Connecting));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let expired = a.manager.expire_stalled(Duration::from_millis(10)).await;
        assert_eq!(expired, vec![b.id.clone()]);

        let event = wait_for(&mut a.events, |e| is_state(e, PeerState::Failed)).await;
        assert!(matches!(event, PeerEvent::StateChanged { retry_count: 1, removed: false, .. }));
        assert_eq!(a.manager.peer_state(&b.id).await, Some(PeerState::Failed));

        // Failed entries are not swept a second time
        assert!(a.manager.expire_stalled(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_close_disconnects_and_cleanup_sweeps() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let mut b = node(&network, "b");

        handshake(&a, &b).await;
        wait_for(&mut a.events, |e| is_state(e, PeerState::Connected)).await;
        wait_for(&mut b.events, |e| is_state(e, PeerState::Connected)).await;

        assert!(b.manager.close_peer(&a.id).await);
        assert!(!b.manager.close_peer(&a.id).await);

        wait_for(&mut a.events, |e| is_state(e, PeerState::Disconnected)).await;
        assert_eq!(a.manager.peer_state(&b.id).await, Some(PeerState::Disconnected));

        assert_eq!(a.manager.cleanup(Duration::from_secs(300)).await, 0);
        assert_eq!(a.manager.cleanup(Duration::ZERO).await, 1);
        assert!(a.manager.get_peer(&b.id).await.is_none());
    }

    #[tokio::test]
    async fn test_ping_measures_rtt() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let mut b = node(&network, "b");

        handshake(&a, &b).await;
        wait_for(&mut a.events, |e| is_state(e, PeerState::Connected)).await;
        wait_for(&mut b.events, |e| is_state(e, PeerState::Connected)).await;

        assert!(a.manager.ping(&b.id).await);
        wait_for(&mut a.events, |e| matches!(e, PeerEvent::LatencyMeasured { .. })).await;

        let snapshot = a.manager.get_peer(&b.id).await.unwrap();
        assert!(snapshot.rtt.is_some());
        assert!(snapshot.bytes_sent > 0);
        assert!(snapshot.bytes_received > 0);
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let network = LoopbackNetwork::new();
        let a = node(&network, "a");
        let b = node(&network, "b");

        let first = a.manager.subscribe();
        let mut second = a.manager.subscribe();
        drop(first);

        a.manager.create_offer(&b.id, &b.user).await.unwrap();
        let event = wait_for(&mut second, |e| is_state(e, PeerState::Connecting)).await;
        assert!(matches!(event, PeerEvent::StateChanged { ref peer_id, .. } if *peer_id == b.id));
    }

    #[tokio::test]
    async fn test_content_announcement_updates_entry() {
        let network = LoopbackNetwork::new();
        let mut a = node(&network, "a");
        let mut b = node(&network, "b");

        handshake(&a, &b).await;
        wait_for(&mut a.events, |e| is_state(e, PeerState::Connected)).await;
        wait_for(&mut b.events, |e| is_state(e, PeerState::Connected)).await;

        let hashes = vec![crate::types::ManifestHash::from("m1")];
        assert!(b.manager.send_message(&a.id, &PeerMessage::ContentAvailable { hashes: hashes.clone() }).await);
        wait_for(&mut a.events, |e| matches!(e, PeerEvent::Message { .. })).await;

        assert_eq!(a.manager.get_peer(&b.id).await.unwrap().available_content, hashes);
    }
}
