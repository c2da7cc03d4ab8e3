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

//! Node-level control plane.
//!
//! [`P2PManager`] owns the signaling channel and peer connection manager
//! for one running session, applies the connection policy (blocklist and
//! control flags), tracks discovery and content, and publishes aggregate
//! statistics. Failures never escape as errors from the background loop;
//! they are counted in [`P2PStats`] and recorded in [`Diagnostics`].

use crate::blocklist::{
    BlockDirection, BlocklistEntry, derive_blocked_peer_ids, derive_outbound_blocked_peer_ids,
    load_blocklist_from_storage, persist_blocklist, remove_blocklist_entry, upsert_blocklist_entry,
};
use crate::config::NodeConfig;
use crate::content::ContentStore;
use crate::dashboard::{NodeDashboardSnapshot, NodeDashboardSource, build_node_dashboard_snapshot};
use crate::diagnostics::Diagnostics;
use crate::identity::NodeIdentity;
use crate::network::{PeerConnectionManager, PeerError};
use crate::protocol::PeerMessage;
use crate::quality::ConnectionQualityTracker;
use crate::rendezvous::RendezvousTracker;
use crate::rtc::{IceCandidate, RtcBackend, SessionDescription};
use crate::signaling::{AvailablePayload, LocalBus, OfferPayload, SignalMessage, SignalingError};
use crate::storage::StateStore;
use crate::types::{ManifestHash, PeerId, PeerState, UserId, now_ms};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod discovery;
pub mod retry;
mod session;
pub mod state;
pub mod stats;

pub use discovery::{DiscoveredPeer, DiscoveryTable, should_initiate};
pub use state::{
    ControlFlag, ControlOptions, ControlResumeTargets, P2PControlState, PolicyGate, load_control,
    persist_control,
};
pub use stats::{NodeStatus, P2PStats};

use session::Session;
use stats::Counters;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("P2P manager is not running")]
    NotRunning,

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Peer {0} is blocked")]
    Blocked(PeerId),

    #[error("No connected peer could supply chunk {0}")]
    ChunkUnavailable(ManifestHash),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Result of [`P2PManager::connect_to_peer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Offer created and sent
    Initiated,
    AlreadyConnected,
    /// A handshake with the peer is already in flight
    Pending,
    Blocked,
    Isolated,
    Paused,
    NotRunning,
    SelfConnection,
    Failed(String),
}

impl ConnectOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ConnectOutcome::Initiated | ConnectOutcome::AlreadyConnected | ConnectOutcome::Pending
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Account of the remote peer; looked up in discovery when absent
    pub user_id: Option<UserId>,
}

/// An inbound offer parked while `manual_accept` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInbound {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub received_at: u64,
}

struct PendingOffer {
    user_id: UserId,
    description: SessionDescription,
    received_at: u64,
    candidates: Vec<IceCandidate>,
}

enum ChunkReply {
    Data { hash: ManifestHash, data: Vec<u8> },
    NotFound,
}

/// Collaborators the manager is built from
pub struct ManagerParts {
    pub store: Arc<dyn StateStore>,
    pub backend: Arc<dyn RtcBackend>,
    pub content: Arc<dyn ContentStore>,
    pub local_bus: Option<LocalBus>,
}

#[derive(Default)]
struct ControlSlot {
    state: P2PControlState,
    targets: ControlResumeTargets,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Shared {
    identity: NodeIdentity,
    config: NodeConfig,
    store: Arc<dyn StateStore>,
    backend: Arc<dyn RtcBackend>,
    content: Arc<dyn ContentStore>,
    local_bus: Option<LocalBus>,
    quality: ConnectionQualityTracker,
    diagnostics: Diagnostics,

    control: Mutex<ControlSlot>,
    resume_tasks: Mutex<HashMap<ControlFlag, JoinHandle<()>>>,
    blocklist: Mutex<Vec<BlocklistEntry>>,
    rendezvous: Mutex<RendezvousTracker>,
    discovery: Mutex<DiscoveryTable>,
    local_content: Mutex<BTreeSet<ManifestHash>>,
    pending_inbound: Mutex<HashMap<PeerId, PendingOffer>>,
    pending_chunks: Mutex<HashMap<String, oneshot::Sender<ChunkReply>>>,
    retry_tasks: Mutex<HashMap<PeerId, JoinHandle<()>>>,

    counters: Counters,
    stats_tx: watch::Sender<P2PStats>,
    session: Mutex<Option<Arc<Session>>>,
    /// Serialises start and stop
    lifecycle: tokio::sync::Mutex<()>,
}

/// The node's single connection controller
///
/// Cloning yields another handle to the same manager. Persisted state
/// (blocklist, control flags, quality metrics, rendezvous toggle) is loaded
/// at construction; networking only runs between [`start`](Self::start)
/// and [`stop`](Self::stop).
#[derive(Clone)]
pub struct P2PManager {
    shared: Arc<Shared>,
}

impl P2PManager {
    /// Build a stopped manager. Must be called within a tokio runtime.
    pub async fn new(identity: NodeIdentity, config: NodeConfig, parts: ManagerParts) -> Self {
        let store = parts.store;
        let blocklist = load_blocklist_from_storage(store.as_ref()).await;
        let quality = ConnectionQualityTracker::load(store.clone()).await;
        let (control, targets) = load_control(store.as_ref()).await;
        let rendezvous = RendezvousTracker::load(store.as_ref(), config.rendezvous_failure_limit).await;
        let local_content: BTreeSet<ManifestHash> = parts.content.hashes().await.into_iter().collect();
        let local_bus = parts.local_bus.filter(|_| config.local_bus);
        let (stats_tx, _) = watch::channel(P2PStats::default());

        info!(
            "P2P manager for {} loaded ({} blocklist entries, {} tracked peers)",
            identity.peer_id().short(),
            blocklist.len(),
            quality.tracked_peers()
        );

        let shared = Arc::new(Shared {
            identity,
            config,
            store,
            backend: parts.backend,
            content: parts.content,
            local_bus,
            quality,
            diagnostics: Diagnostics::new(),
            control: Mutex::new(ControlSlot {
                state: control,
                targets: targets.clone(),
            }),
            resume_tasks: Mutex::new(HashMap::new()),
            blocklist: Mutex::new(blocklist),
            rendezvous: Mutex::new(rendezvous),
            discovery: Mutex::new(DiscoveryTable::default()),
            local_content: Mutex::new(local_content),
            pending_inbound: Mutex::new(HashMap::new()),
            pending_chunks: Mutex::new(HashMap::new()),
            retry_tasks: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            stats_tx,
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        });

        // Deadlines persisted by an earlier run keep counting
        let now = now_ms();
        for (flag, resume_at) in targets {
            let task = shared.spawn_resume(flag, resume_at, now);
            lock(&shared.resume_tasks).insert(flag, task);
        }

        shared.refresh_stats().await;
        Self { shared }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.shared.identity.peer_id()
    }

    pub fn user_id(&self) -> &UserId {
        self.shared.identity.user_id()
    }

    pub fn is_running(&self) -> bool {
        self.shared.session().is_some()
    }

    /// Start networking, tearing down any previous session first
    pub async fn start(&self) {
        let _guard = self.shared.lifecycle.lock().await;
        self.shared.teardown().await;
        Session::start(&self.shared).await;
        self.shared.diagnostics.info("control", "P2P manager started");
        self.shared.refresh_stats().await;
    }

    /// Close every connection and the signaling channel
    pub async fn stop(&self) {
        let _guard = self.shared.lifecycle.lock().await;
        if self.shared.teardown().await {
            self.shared.diagnostics.info("control", "P2P manager stopped");
        }
        self.shared.refresh_stats().await;
    }

    pub async fn enable(&self) {
        self.start().await
    }

    pub async fn disable(&self) {
        self.stop().await
    }

    pub fn control_state(&self) -> P2PControlState {
        lock(&self.shared.control).state
    }

    pub fn resume_targets(&self) -> ControlResumeTargets {
        lock(&self.shared.control).targets.clone()
    }

    /// Set one control flag
    ///
    /// Any resume timer for the flag is cancelled. When a pausable flag is
    /// set with `auto_resume`, a new timer clears it again after that long.
    pub async fn set_control_flag(
        &self,
        flag: ControlFlag,
        value: bool,
        options: ControlOptions,
    ) -> P2PControlState {
        let shared = &self.shared;
        let now = now_ms();

        let state = {
            let mut control = lock(&shared.control);
            control.state.set(flag, value);
            control.targets.remove(&flag);

            let deadline = match options.auto_resume {
                Some(after) if value && flag.is_pausable() => {
                    let resume_at = now + after.as_millis() as u64;
                    control.targets.insert(flag, resume_at);
                    Some(resume_at)
                }
                _ => None,
            };

            let mut tasks = lock(&shared.resume_tasks);
            if let Some(stale) = tasks.remove(&flag) {
                stale.abort();
            }
            if let Some(resume_at) = deadline {
                tasks.insert(flag, shared.spawn_resume(flag, resume_at, now));
            }
            control.state
        };

        info!("Control flag {} set to {}", flag, value);
        shared.persist_control_state().await;
        shared.refresh_stats().await;
        state
    }

    /// Dial a peer, subject to the blocklist and control flags
    pub async fn connect_to_peer(&self, peer_id: &PeerId, options: ConnectOptions) -> ConnectOutcome {
        if let Some(refused) = self.shared.outbound_refusal(peer_id) {
            debug!("Not connecting to {}: {:?}", peer_id.short(), refused);
            return refused;
        }
        let Some(session) = self.shared.session() else {
            return ConnectOutcome::NotRunning;
        };
        self.shared.initiate(&session, peer_id, options.user_id).await
    }

    /// Inbound offers waiting for approval, oldest first
    pub fn pending_inbound(&self) -> Vec<PendingInbound> {
        let mut pending: Vec<PendingInbound> = lock(&self.shared.pending_inbound)
            .iter()
            .map(|(peer_id, offer)| PendingInbound {
                peer_id: peer_id.clone(),
                user_id: offer.user_id.clone(),
                received_at: offer.received_at,
            })
            .collect();
        pending.sort_by(|a, b| a.received_at.cmp(&b.received_at).then_with(|| a.peer_id.cmp(&b.peer_id)));
        pending
    }

    /// Complete a parked inbound handshake
    pub async fn approve_inbound(&self, peer_id: &PeerId) -> Result<(), ControlError> {
        let shared = &self.shared;
        let session = shared.session().ok_or(ControlError::NotRunning)?;
        let offer = lock(&shared.pending_inbound)
            .remove(peer_id)
            .ok_or_else(|| ControlError::UnknownPeer(peer_id.clone()))?;

        if derive_blocked_peer_ids(&lock(&shared.blocklist)).contains(peer_id) {
            return Err(ControlError::Blocked(peer_id.clone()));
        }

        info!("Approved inbound connection from {}", peer_id.short());
        shared
            .answer_offer(&session, peer_id, offer.user_id, offer.description, offer.candidates)
            .await;
        shared.refresh_stats().await;
        Ok(())
    }

    /// Drop a parked inbound offer. Returns false if none was waiting.
    pub async fn reject_inbound(&self, peer_id: &PeerId) -> bool {
        let removed = lock(&self.shared.pending_inbound).remove(peer_id).is_some();
        if removed {
            Counters::bump(&self.shared.counters.rejected_inbound);
            info!("Rejected inbound connection from {}", peer_id.short());
            self.shared.refresh_stats().await;
        }
        removed
    }

    pub fn get_blocklist(&self) -> Vec<BlocklistEntry> {
        lock(&self.shared.blocklist).clone()
    }

    /// Block a peer in one direction
    ///
    /// Blocking `All` also closes a live connection to the peer.
    pub async fn block_peer(
        &self,
        peer_id: &PeerId,
        direction: BlockDirection,
        reason: Option<String>,
    ) -> Vec<BlocklistEntry> {
        let shared = &self.shared;
        let entries = {
            let mut blocklist = lock(&shared.blocklist);
            *blocklist = upsert_blocklist_entry(&blocklist, peer_id, direction, reason);
            blocklist.clone()
        };
        shared.persist_blocklist(&entries).await;

        if direction.blocks_inbound() {
            lock(&shared.pending_inbound).remove(peer_id);
        }
        if direction.blocks_outbound() {
            shared.cancel_retry(peer_id);
        }
        if let Some(session) = shared.session() {
            // Failed entries lose their retry here, so they go too
            let state = session.peers.peer_state(peer_id).await;
            if direction == BlockDirection::All
                || (direction.blocks_outbound() && state == Some(PeerState::Failed))
            {
                session.peers.close_peer(peer_id).await;
            }
        }

        info!("Blocked {} ({:?})", peer_id.short(), direction);
        shared.refresh_stats().await;
        entries
    }

    /// Remove one direction, or every entry for the peer when `None`
    pub async fn unblock_peer(&self, peer_id: &PeerId, direction: Option<BlockDirection>) -> Vec<BlocklistEntry> {
        let entries = {
            let mut blocklist = lock(&self.shared.blocklist);
            *blocklist = remove_blocklist_entry(&blocklist, peer_id, direction);
            blocklist.clone()
        };
        self.shared.persist_blocklist(&entries).await;
        info!("Unblocked {}", peer_id.short());
        self.shared.refresh_stats().await;
        entries
    }

    pub async fn set_rendezvous_enabled(&self, enabled: bool) {
        let tracker = {
            let mut rendezvous = lock(&self.shared.rendezvous);
            rendezvous.set_enabled(enabled);
            rendezvous.clone()
        };
        if let Err(e) = tracker.persist(self.shared.store.as_ref()).await {
            warn!("Failed to persist rendezvous toggle: {:#}", e);
        }
        info!("Rendezvous mesh {}", if enabled { "enabled" } else { "disabled" });
        self.shared.refresh_stats().await;
    }

    /// Advertise a hash we can serve
    pub async fn announce_content(&self, hash: ManifestHash) {
        let shared = &self.shared;
        let (added, all) = {
            let mut local = lock(&shared.local_content);
            let added = local.insert(hash.clone());
            (added, local.iter().cloned().collect::<Vec<_>>())
        };
        if !added {
            return;
        }

        if let Some(session) = shared.session() {
            let available = SignalMessage::Available(AvailablePayload { hashes: vec![hash] });
            if let Err(e) = session.signaling.send(available, None) {
                debug!("Content announcement not sent: {}", e);
            }
            let message = PeerMessage::ContentAvailable { hashes: all };
            for peer_id in session.peers.get_connected_peers().await {
                session.peers.send_message(&peer_id, &message).await;
            }
        }
        shared.refresh_stats().await;
    }

    /// Store a chunk locally and advertise it
    pub async fn publish_chunk(&self, hash: ManifestHash, data: Vec<u8>) {
        self.shared.content.put_chunk(hash.clone(), data).await;
        self.announce_content(hash).await;
    }

    /// Fetch a chunk, locally if possible, otherwise from the best-scored
    /// connected peer that advertises it
    pub async fn request_chunk(&self, hash: &ManifestHash) -> Result<Vec<u8>, ControlError> {
        let shared = &self.shared;
        if let Some(data) = shared.content.get_chunk(hash).await {
            return Ok(data);
        }
        let session = shared.session().ok_or(ControlError::NotRunning)?;

        for peer_id in shared.chunk_sources(&session, hash).await {
            let request_id = Uuid::now_v7().to_string();
            let (tx, rx) = oneshot::channel();
            lock(&shared.pending_chunks).insert(request_id.clone(), tx);

            let request = PeerMessage::RequestChunk {
                request_id: request_id.clone(),
                hash: Some(hash.clone()),
            };
            if !session.peers.send_message(&peer_id, &request).await {
                lock(&shared.pending_chunks).remove(&request_id);
                continue;
            }

            match tokio::time::timeout(shared.config.chunk_request_timeout, rx).await {
                Ok(Ok(ChunkReply::Data { hash: received, data })) if received == *hash => {
                    shared.content.put_chunk(hash.clone(), data.clone()).await;
                    lock(&shared.local_content).insert(hash.clone());
                    debug!("Fetched {} from {}", hash, peer_id.short());
                    return Ok(data);
                }
                Ok(Ok(_)) => debug!("{} could not supply {}", peer_id.short(), hash),
                Ok(Err(_)) => return Err(ControlError::NotRunning),
                Err(_) => {
                    lock(&shared.pending_chunks).remove(&request_id);
                    shared.diagnostics.warn(
                        "content",
                        "Chunk request timed out",
                        json!({ "peerId": peer_id, "hash": hash }),
                    );
                }
            }
        }

        Err(ControlError::ChunkUnavailable(hash.clone()))
    }

    pub fn get_discovered_peers(&self) -> Vec<DiscoveredPeer> {
        lock(&self.shared.discovery).list()
    }

    /// Fresh statistics
    pub async fn get_stats(&self) -> P2PStats {
        self.shared.refresh_stats().await
    }

    /// Receiver that observes every stats rebuild
    pub fn subscribe_to_stats(&self) -> watch::Receiver<P2PStats> {
        self.shared.stats_tx.subscribe()
    }

    /// Connection manager of the running session
    pub fn peer_manager(&self) -> Option<PeerConnectionManager> {
        self.shared.session().map(|session| session.peers.clone())
    }

    pub fn quality(&self) -> &ConnectionQualityTracker {
        &self.shared.quality
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.shared.diagnostics
    }

    /// Everything the dashboard needs, captured at one instant
    pub async fn dashboard_source(&self) -> NodeDashboardSource {
        let shared = &self.shared;
        let stats = shared.refresh_stats().await;
        let peers = match shared.session() {
            Some(session) => session.peers.get_peers().await,
            None => Vec::new(),
        };
        let (control, resume_targets) = {
            let control = lock(&shared.control);
            (control.state, control.targets.clone())
        };

        NodeDashboardSource {
            now: now_ms(),
            peer_id: shared.identity.peer_id().clone(),
            stats,
            control,
            resume_targets,
            peers,
            quality: shared.quality.all_scores().into_iter().collect(),
            discovered: lock(&shared.discovery).list(),
            blocklist: lock(&shared.blocklist).clone(),
            diagnostics: shared.diagnostics.entries(),
            online_ttl_ms: shared.config.online_ttl.as_millis() as u64,
        }
    }

    pub async fn dashboard_snapshot(&self) -> NodeDashboardSnapshot {
        build_node_dashboard_snapshot(&self.dashboard_source().await)
    }
}

impl Shared {
    fn session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    /// Stop the running session, if any. Returns whether one was running.
    async fn teardown(&self) -> bool {
        // Taken out of the lock before any await
        let session = lock(&self.session).take();

        for (_, task) in lock(&self.retry_tasks).drain() {
            task.abort();
        }
        lock(&self.pending_inbound).clear();
        lock(&self.pending_chunks).clear();

        match session {
            Some(session) => {
                session.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Why an outbound attempt to `peer_id` is refused, if it is
    fn outbound_refusal(&self, peer_id: &PeerId) -> Option<ConnectOutcome> {
        if peer_id == self.identity.peer_id() {
            return Some(ConnectOutcome::SelfConnection);
        }
        if derive_outbound_blocked_peer_ids(&lock(&self.blocklist)).contains(peer_id) {
            return Some(ConnectOutcome::Blocked);
        }
        match lock(&self.control).state.outbound_gate() {
            Some(PolicyGate::Isolated) => Some(ConnectOutcome::Isolated),
            Some(PolicyGate::Paused) => Some(ConnectOutcome::Paused),
            None => None,
        }
    }

    /// Create an offer for `peer_id` and send it through signaling
    async fn initiate(&self, session: &Session, peer_id: &PeerId, user_id: Option<UserId>) -> ConnectOutcome {
        match session.peers.peer_state(peer_id).await {
            Some(PeerState::Connected) => return ConnectOutcome::AlreadyConnected,
            Some(PeerState::Connecting) => return ConnectOutcome::Pending,
            _ => {}
        }

        let user_id = user_id
            .or_else(|| lock(&self.discovery).get(peer_id).map(|d| d.user_id.clone()))
            .unwrap_or_default();

        Counters::bump(&self.counters.connection_attempts);
        let offer = match session.peers.create_offer(peer_id, &user_id).await {
            Ok(offer) => offer,
            Err(e) => {
                // Failures after registration arrive as peer events
                if matches!(e, PeerError::Setup(_)) {
                    self.record_connect_failure(peer_id, &e.to_string()).await;
                }
                return ConnectOutcome::Failed(e.to_string());
            }
        };

        let message = SignalMessage::Offer(OfferPayload { description: offer });
        match session.signaling.send(message, Some(peer_id)) {
            Ok(()) => {
                info!("Offer sent to {}", peer_id.short());
                ConnectOutcome::Initiated
            }
            Err(e) => {
                session.peers.close_peer(peer_id).await;
                self.record_connect_failure(peer_id, &e.to_string()).await;
                ConnectOutcome::Failed(e.to_string())
            }
        }
    }

    async fn record_connect_failure(&self, peer_id: &PeerId, error: &str) {
        Counters::bump(&self.counters.failed_connection_attempts);
        self.quality.record_failure(peer_id).await;
        self.diagnostics.warn(
            "connect",
            format!("Connection to {} failed", peer_id.short()),
            json!({ "peerId": peer_id, "error": error }),
        );
    }

    fn cancel_retry(&self, peer_id: &PeerId) {
        if let Some(task) = lock(&self.retry_tasks).remove(peer_id) {
            task.abort();
        }
    }

    /// Connected peers advertising `hash`, best quality first
    async fn chunk_sources(&self, session: &Session, hash: &ManifestHash) -> Vec<PeerId> {
        let connected = session.peers.get_peers().await;
        let mut sources: Vec<PeerId> = {
            let discovery = lock(&self.discovery);
            connected
                .into_iter()
                .filter(|peer| peer.state == PeerState::Connected)
                .filter(|peer| {
                    peer.available_content.contains(hash)
                        || discovery
                            .get(&peer.id)
                            .is_some_and(|d| d.available_content.contains(hash))
                })
                .map(|peer| peer.id)
                .collect()
        };

        let scores: HashMap<PeerId, f64> = sources
            .iter()
            .map(|id| (id.clone(), self.quality.get_score(id).score))
            .collect();
        sources.sort_by(|a, b| scores[b].total_cmp(&scores[a]).then_with(|| a.cmp(b)));
        sources
    }

    fn spawn_resume(self: &Arc<Self>, flag: ControlFlag, resume_at: u64, now: u64) -> JoinHandle<()> {
        let shared = Arc::downgrade(self);
        let delay = Duration::from_millis(resume_at.saturating_sub(now));
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = shared.upgrade() else { return };
            shared.resume(flag, resume_at).await;
        })
    }

    /// Clear `flag` if `resume_at` is still its deadline
    async fn resume(&self, flag: ControlFlag, resume_at: u64) {
        {
            let mut control = lock(&self.control);
            if control.targets.get(&flag) != Some(&resume_at) {
                return;
            }
            control.targets.remove(&flag);
            control.state.set(flag, false);
            lock(&self.resume_tasks).remove(&flag);
        }

        info!("Control flag {} resumed", flag);
        self.diagnostics.info("control", format!("{} lifted automatically", flag));
        self.persist_control_state().await;
        self.refresh_stats().await;
    }

    async fn persist_control_state(&self) {
        let (state, targets) = {
            let control = lock(&self.control);
            (control.state, control.targets.clone())
        };
        if let Err(e) = persist_control(self.store.as_ref(), &state, &targets).await {
            self.diagnostics.warn(
                "storage",
                "Control state not persisted",
                json!({ "error": format!("{:#}", e) }),
            );
        }
    }

    async fn persist_blocklist(&self, entries: &[BlocklistEntry]) {
        if let Err(e) = persist_blocklist(self.store.as_ref(), entries).await {
            self.diagnostics.warn(
                "storage",
                "Blocklist not persisted",
                json!({ "error": format!("{:#}", e) }),
            );
        }
    }

    fn local_content(&self) -> Vec<ManifestHash> {
        lock(&self.local_content).iter().cloned().collect()
    }

    /// Rebuild and publish the stats snapshot
    async fn refresh_stats(&self) -> P2PStats {
        let session = self.session();
        let now = now_ms();

        let (peers, transport, traffic, uptime_ms) = match &session {
            Some(session) => (
                session.peers.get_peers().await,
                session.signaling.transport_stats(),
                session.peers.traffic(),
                now.saturating_sub(session.started_at),
            ),
            None => (Vec::new(), Default::default(), (0, 0), 0),
        };

        let connected = peers.iter().filter(|p| p.state == PeerState::Connected).count();
        let connecting = peers.iter().filter(|p| p.state == PeerState::Connecting).count();

        let (discovered_peers, mut remote): (usize, HashSet<ManifestHash>) = {
            let discovery = lock(&self.discovery);
            let remote = discovery
                .list()
                .into_iter()
                .flat_map(|d| d.available_content)
                .collect();
            (discovery.len(), remote)
        };
        remote.extend(peers.iter().flat_map(|p| p.available_content.iter().cloned()));

        let counters = &self.counters;
        let stats = P2PStats {
            status: NodeStatus::derive(session.is_some(), connected, connecting),
            connected_peers: connected,
            connecting_peers: connecting,
            discovered_peers,
            local_content: lock(&self.local_content).len(),
            remote_content: remote.len(),
            pending_inbound: lock(&self.pending_inbound).len(),
            rendezvous: lock(&self.rendezvous).stats(),
            transport,
            connection_attempts: Counters::read(&counters.connection_attempts),
            successful_connections: Counters::read(&counters.successful_connections),
            failed_connection_attempts: Counters::read(&counters.failed_connection_attempts),
            rejected_inbound: Counters::read(&counters.rejected_inbound),
            bytes_uploaded: traffic.0,
            bytes_downloaded: traffic.1,
            relay_count: Counters::read(&counters.relay_count),
            ping_count: Counters::read(&counters.ping_count),
            uptime_ms,
            updated_at: now,
        };

        self.stats_tx.send_replace(stats.clone());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::BlockDirection;
    use crate::content::MemoryContentStore;
    use crate::rendezvous::RendezvousDisabledReason;
    use crate::rtc::LoopbackNetwork;
    use crate::storage::MemoryStore;
    use std::future::Future;

    fn test_config() -> NodeConfig {
        NodeConfig {
            poll_interval: Duration::from_millis(50),
            announce_interval: Duration::from_millis(100),
            rendezvous_interval: Duration::from_millis(200),
            cleanup_interval: Duration::from_secs(1),
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_millis(200),
            chunk_request_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    async fn manager_with(
        name: &str,
        network: &LoopbackNetwork,
        bus: Option<LocalBus>,
        store: Arc<dyn StateStore>,
        config: NodeConfig,
    ) -> P2PManager {
        let identity = NodeIdentity::new(PeerId::from(name), UserId::from(format!("user-{}", name)));
        let parts = ManagerParts {
            store,
            backend: Arc::new(network.backend(name)),
            content: Arc::new(MemoryContentStore::new()),
            local_bus: bus,
        };
        P2PManager::new(identity, config, parts).await
    }

    async fn manager(name: &str, network: &LoopbackNetwork, bus: &LocalBus) -> P2PManager {
        manager_with(name, network, Some(bus.clone()), Arc::new(MemoryStore::new()), test_config()).await
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn connected(manager: &P2PManager, peer: &PeerId) -> bool {
        match manager.peer_manager() {
            Some(peers) => peers.get_connected_peers().await.contains(peer),
            None => false,
        }
    }

    #[tokio::test]
    async fn test_discovered_peers_connect_and_exchange_messages() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;
        let b = manager("peer-b", &network, &bus).await;

        a.start().await;
        b.start().await;
        wait_until(|| connected(&a, b.peer_id())).await;
        wait_until(|| connected(&b, a.peer_id())).await;

        let mut b_events = b.peer_manager().unwrap().subscribe();
        let request = PeerMessage::RequestChunk {
            request_id: "r1".to_string(),
            hash: None,
        };
        assert!(a.peer_manager().unwrap().send_message(b.peer_id(), &request).await);

        let received = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(crate::network::PeerEvent::Message { peer_id, message }) = b_events.recv().await {
                    return (peer_id, message);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received.0, *a.peer_id());
        assert_eq!(received.1, request);

        let peer_b = b.peer_id().clone();
        wait_until(|| {
            let quality = a.quality().clone();
            let peer_b = peer_b.clone();
            async move { quality.get_score(&peer_b).success_rate == 1.0 }
        })
        .await;

        let stats = a.get_stats().await;
        assert_eq!(stats.status, NodeStatus::Online);
        assert_eq!(stats.connected_peers, 1);
        assert!(stats.successful_connections >= 1);
        assert_eq!(a.get_discovered_peers()[0].peer_id, peer_b);

        a.stop().await;
        b.stop().await;
        assert!(!a.is_running());
        assert_eq!(a.get_stats().await.status, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_request_chunk_from_peer() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;
        let b = manager("peer-b", &network, &bus).await;
        let hash = ManifestHash::from("manifest-1");

        b.publish_chunk(hash.clone(), b"hello mesh".to_vec()).await;
        a.start().await;
        b.start().await;
        wait_until(|| connected(&a, b.peer_id())).await;

        let peer_b = b.peer_id().clone();
        wait_until(|| {
            let a = a.clone();
            let peer_b = peer_b.clone();
            let hash = hash.clone();
            async move {
                match a.peer_manager() {
                    Some(peers) => peers
                        .get_peer(&peer_b)
                        .await
                        .is_some_and(|p| p.available_content.contains(&hash)),
                    None => false,
                }
            }
        })
        .await;

        assert_eq!(a.request_chunk(&hash).await.unwrap(), b"hello mesh".to_vec());
        assert!(b.get_stats().await.relay_count >= 1);

        let missing = a.request_chunk(&ManifestHash::from("nope")).await;
        assert!(matches!(missing, Err(ControlError::ChunkUnavailable(_))));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_blocked_peer_is_refused() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;
        let p9 = PeerId::from("p9");

        a.block_peer(&p9, BlockDirection::All, Some("spam".to_string())).await;
        a.start().await;

        let outcome = a.connect_to_peer(&p9, ConnectOptions::default()).await;
        assert_eq!(outcome, ConnectOutcome::Blocked);
        assert!(!outcome.is_success());

        let peers = a.peer_manager().unwrap();
        assert!(!peers.get_connected_peers().await.contains(&p9));
        assert!(peers.get_peer(&p9).await.is_none());

        let mut stats = a.subscribe_to_stats();
        stats.borrow_and_update();
        assert!(a.unblock_peer(&p9, None).await.is_empty());
        assert!(stats.has_changed().unwrap());
        a.stop().await;
    }

    #[tokio::test]
    async fn test_isolate_applies_immediately() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;
        let target = PeerId::from("peer-z");
        a.start().await;

        let state = a
            .set_control_flag(ControlFlag::Isolate, true, ControlOptions::default())
            .await;
        assert!(state.isolate);

        let outcome = a.connect_to_peer(&target, ConnectOptions::default()).await;
        assert_eq!(outcome, ConnectOutcome::Isolated);
        assert!(a.peer_manager().unwrap().get_peer(&target).await.is_none());
        assert_eq!(a.get_stats().await.connection_attempts, 0);
        a.stop().await;
    }

    #[tokio::test]
    async fn test_connect_when_stopped_or_to_self() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;

        let outcome = a.connect_to_peer(&PeerId::from("peer-b"), ConnectOptions::default()).await;
        assert_eq!(outcome, ConnectOutcome::NotRunning);

        let own = a.peer_id().clone();
        assert_eq!(
            a.connect_to_peer(&own, ConnectOptions::default()).await,
            ConnectOutcome::SelfConnection
        );
    }

    #[tokio::test]
    async fn test_pause_auto_resumes() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;
        a.start().await;

        let state = a
            .set_control_flag(
                ControlFlag::Paused,
                true,
                ControlOptions::auto_resume(Duration::from_millis(1000)),
            )
            .await;
        assert!(state.paused);
        assert!(a.resume_targets().contains_key(&ControlFlag::Paused));
        assert_eq!(
            a.connect_to_peer(&PeerId::from("peer-z"), ConnectOptions::default()).await,
            ConnectOutcome::Paused
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!a.control_state().paused);
        assert!(a.resume_targets().is_empty());
        a.stop().await;
    }

    #[tokio::test]
    async fn test_manual_change_cancels_resume_timer() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;

        a.set_control_flag(
            ControlFlag::PauseOutbound,
            true,
            ControlOptions::auto_resume(Duration::from_millis(200)),
        )
        .await;
        a.set_control_flag(ControlFlag::PauseOutbound, false, ControlOptions::default())
            .await;
        a.set_control_flag(ControlFlag::PauseOutbound, true, ControlOptions::default())
            .await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(a.control_state().pause_outbound);
        assert!(a.resume_targets().is_empty());
    }

    #[tokio::test]
    async fn test_auto_resume_ignored_for_non_pause_flags() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;

        a.set_control_flag(
            ControlFlag::Isolate,
            true,
            ControlOptions::auto_resume(Duration::from_millis(50)),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(a.control_state().isolate);
        assert!(a.resume_targets().is_empty());
    }

    #[tokio::test]
    async fn test_manual_accept_parks_offer_until_approved() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;
        let b = manager("peer-b", &network, &bus).await;

        b.set_control_flag(ControlFlag::ManualAccept, true, ControlOptions::default())
            .await;
        a.start().await;
        b.start().await;

        wait_until(|| {
            let b = b.clone();
            async move { !b.pending_inbound().is_empty() }
        })
        .await;
        assert_eq!(b.pending_inbound()[0].peer_id, *a.peer_id());
        assert!(!connected(&a, b.peer_id()).await);

        b.approve_inbound(a.peer_id()).await.unwrap();
        wait_until(|| connected(&a, b.peer_id())).await;
        wait_until(|| connected(&b, a.peer_id())).await;
        assert!(b.pending_inbound().is_empty());

        assert!(!b.reject_inbound(a.peer_id()).await);
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_paused_inbound_rejects_offers() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;
        let b = manager("peer-b", &network, &bus).await;

        b.set_control_flag(ControlFlag::PauseInbound, true, ControlOptions::default())
            .await;
        a.start().await;
        b.start().await;

        wait_until(|| {
            let b = b.clone();
            async move { b.get_stats().await.rejected_inbound > 0 }
        })
        .await;
        assert!(!connected(&b, a.peer_id()).await);
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_unanswered_offer_times_out_and_reconnects() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let config = NodeConfig {
            connection_timeout: Duration::from_millis(200),
            ..test_config()
        };
        let a = manager_with("peer-a", &network, Some(bus.clone()), Arc::new(MemoryStore::new()), config.clone()).await;
        let b = manager_with("peer-b", &network, Some(bus.clone()), Arc::new(MemoryStore::new()), config).await;

        b.set_control_flag(
            ControlFlag::PauseInbound,
            true,
            ControlOptions::auto_resume(Duration::from_millis(300)),
        )
        .await;
        a.start().await;
        b.start().await;

        wait_until(|| {
            let b = b.clone();
            async move { b.get_stats().await.rejected_inbound > 0 }
        })
        .await;

        wait_until(|| connected(&a, b.peer_id())).await;
        wait_until(|| connected(&b, a.peer_id())).await;
        assert!(!b.control_state().pause_inbound);
        assert_eq!(
            a.connect_to_peer(b.peer_id(), ConnectOptions::default()).await,
            ConnectOutcome::AlreadyConnected
        );
        assert!(a.get_stats().await.failed_connection_attempts >= 1);
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_refused_retry_redials_after_unpause() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let config = NodeConfig {
            connection_timeout: Duration::from_millis(150),
            retry_base_delay: Duration::from_millis(300),
            retry_max_delay: Duration::from_millis(300),
            ..test_config()
        };
        let a = manager_with("peer-a", &network, Some(bus.clone()), Arc::new(MemoryStore::new()), config.clone()).await;
        let b = manager_with("peer-b", &network, Some(bus.clone()), Arc::new(MemoryStore::new()), config).await;

        // peer-b cannot answer, so peer-a's first handshake stalls and fails
        network.set_unreachable("peer-b", true);
        a.start().await;
        b.start().await;

        let peer_b = b.peer_id().clone();
        let state_of_b = || {
            let peers = a.peer_manager();
            let peer_b = peer_b.clone();
            async move {
                match peers {
                    Some(peers) => peers.peer_state(&peer_b).await,
                    None => None,
                }
            }
        };
        wait_until(|| {
            let state = state_of_b();
            async move { state.await == Some(PeerState::Failed) }
        })
        .await;

        a.set_control_flag(ControlFlag::PauseOutbound, true, ControlOptions::default())
            .await;
        wait_until(|| {
            let state = state_of_b();
            async move { state.await.is_none() }
        })
        .await;

        network.set_unreachable("peer-b", false);
        a.set_control_flag(ControlFlag::PauseOutbound, false, ControlOptions::default())
            .await;
        wait_until(|| connected(&a, b.peer_id())).await;
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_outbound_block_drops_failed_entry() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let config = NodeConfig {
            connection_timeout: Duration::from_millis(150),
            retry_base_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(5),
            ..test_config()
        };
        let a = manager_with("peer-a", &network, Some(bus.clone()), Arc::new(MemoryStore::new()), config.clone()).await;
        let b = manager_with("peer-b", &network, Some(bus.clone()), Arc::new(MemoryStore::new()), config).await;

        network.set_unreachable("peer-b", true);
        a.start().await;
        b.start().await;

        let peers = a.peer_manager().unwrap();
        wait_until(|| {
            let peers = peers.clone();
            let peer_b = b.peer_id().clone();
            async move { peers.peer_state(&peer_b).await == Some(PeerState::Failed) }
        })
        .await;

        a.block_peer(b.peer_id(), BlockDirection::Outbound, None).await;
        assert!(peers.get_peer(b.peer_id()).await.is_none());

        network.set_unreachable("peer-b", false);
        let entries = a.unblock_peer(b.peer_id(), None).await;
        assert!(entries.is_empty());
        wait_until(|| connected(&a, b.peer_id())).await;
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_rendezvous_disables_after_repeated_failures() {
        let network = LoopbackNetwork::new();
        let config = NodeConfig {
            local_bus: false,
            relay_url: Some("ws://127.0.0.1:9".to_string()),
            relay_reconnect_delay: Duration::from_millis(50),
            rendezvous_interval: Duration::from_millis(30),
            rendezvous_failure_limit: 3,
            ..test_config()
        };
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let a = manager_with("peer-a", &network, None, store.clone(), config).await;
        a.start().await;

        wait_until(|| {
            let a = a.clone();
            async move { !a.get_stats().await.rendezvous.enabled }
        })
        .await;

        let stats = a.get_stats().await.rendezvous;
        assert_eq!(stats.disabled_reason, Some(RendezvousDisabledReason::Failures));
        assert!(stats.failure_streak >= 3);
        assert!(a.diagnostics().counts().error >= 1);

        a.set_rendezvous_enabled(true).await;
        let stats = a.get_stats().await.rendezvous;
        assert_ne!(stats.disabled_reason, Some(RendezvousDisabledReason::User));
        assert!(stats.failure_streak < 3);
        a.stop().await;
    }

    #[tokio::test]
    async fn test_no_transport_disables_rendezvous_for_capability() {
        let network = LoopbackNetwork::new();
        let config = NodeConfig {
            local_bus: false,
            ..test_config()
        };
        let a = manager_with("peer-a", &network, None, Arc::new(MemoryStore::new()), config).await;
        a.start().await;

        let stats = a.get_stats().await.rendezvous;
        assert!(!stats.enabled);
        assert_eq!(stats.disabled_reason, Some(RendezvousDisabledReason::Capability));
        a.stop().await;
    }

    #[tokio::test]
    async fn test_policy_survives_restart() {
        let network = LoopbackNetwork::new();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let first = manager_with("peer-a", &network, None, store.clone(), test_config()).await;

        first
            .set_control_flag(ControlFlag::Isolate, true, ControlOptions::default())
            .await;
        first
            .block_peer(&PeerId::from("p3"), BlockDirection::Inbound, None)
            .await;
        drop(first);

        let second = manager_with("peer-a", &network, None, store, test_config()).await;
        assert!(second.control_state().isolate);
        assert_eq!(second.get_blocklist().len(), 1);
        assert_eq!(second.get_blocklist()[0].direction, BlockDirection::Inbound);

        let remaining = second.unblock_peer(&PeerId::from("p3"), None).await;
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_dashboard_reflects_manager() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;
        a.block_peer(&PeerId::from("p9"), BlockDirection::Outbound, None).await;
        a.start().await;

        let snapshot = a.dashboard_snapshot().await;
        assert_eq!(snapshot.peer_id, *a.peer_id());
        assert_eq!(snapshot.status, NodeStatus::Waiting);
        assert_eq!(snapshot.blocked.outbound, 1);
        assert_eq!(snapshot.failure_rate, 0.0);
        a.stop().await;
    }

    #[tokio::test]
    async fn test_restart_rebuilds_session() {
        let network = LoopbackNetwork::new();
        let bus = LocalBus::new();
        let a = manager("peer-a", &network, &bus).await;
        let b = manager("peer-b", &network, &bus).await;

        a.start().await;
        b.start().await;
        wait_until(|| connected(&a, b.peer_id())).await;

        let before = a.peer_manager().unwrap();
        a.start().await;
        assert!(a.is_running());
        assert_eq!(before.peer_count().await, 0);

        // The fresh session rediscovers the peer on its next announce round
        wait_until(|| connected(&a, b.peer_id())).await;
        a.stop().await;
        b.stop().await;
    }
}
