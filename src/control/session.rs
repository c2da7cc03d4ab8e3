use super::discovery::should_initiate;
use super::retry::retry_delay;
use super::stats::{Counters, NodeStatus};
use super::{ChunkReply, PendingOffer, Shared, lock};
use crate::blocklist::derive_blocked_peer_ids;
use crate::network::{PeerConnectionManager, PeerError, PeerEvent, PeerManagerConfig};
use crate::protocol::PeerMessage;
use crate::rtc::{IceCandidate, SessionDescription};
use crate::signaling::{
    AnnouncePayload, AnswerPayload, IcePayload, PeerProfile, QueryPayload, Signal, SignalKind,
    SignalMessage, SignalingChannel, SignalingOptions,
};
use crate::types::{ConnectionDirection, PeerId, PeerState, UserId, now_ms};
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIN_TICK: Duration = Duration::from_millis(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Networking state that lives from `start` to `stop`
pub(super) struct Session {
    pub(super) signaling: SignalingChannel,
    pub(super) peers: PeerConnectionManager,
    pub(super) started_at: u64,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Build a session, install it in `shared` and spawn its event loop
    pub(super) async fn start(shared: &Arc<Shared>) {
        let config = &shared.config;
        let identity = &shared.identity;

        let signaling = SignalingChannel::new(
            identity.peer_id().clone(),
            identity.user_id().clone(),
            SignalingOptions {
                local_bus: shared.local_bus.clone(),
                relay_url: config.relay_url.clone(),
                reconnect_delay: config.relay_reconnect_delay,
            },
        );

        {
            let mut rendezvous = lock(&shared.rendezvous);
            if shared.local_bus.is_none() && config.relay_url.is_none() {
                rendezvous.disable_for_capability();
            } else {
                rendezvous.restore_capability();
            }
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        for kind in SignalKind::ALL {
            let tx = signal_tx.clone();
            signaling.on(kind, move |signal| {
                // The loop is gone once the session stops
                let _ = tx.send(signal);
            });
        }

        let peers = PeerConnectionManager::new(
            shared.backend.clone(),
            PeerManagerConfig {
                ice_servers: config.ice_servers.clone(),
                max_retries: config.max_retries,
                connection_timeout: config.connection_timeout,
            },
        );
        let peer_events = peers.subscribe();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Session {
            signaling,
            peers,
            started_at: now_ms(),
            shutdown,
            task: Mutex::new(None),
        });
        *lock(&shared.session) = Some(session.clone());

        let task = tokio::spawn(run(
            Arc::downgrade(shared),
            session.clone(),
            signal_rx,
            peer_events,
            shutdown_rx,
        ));
        *lock(&session.task) = Some(task);

        shared.send_announce(&session, None);
        info!("P2P session started for {}", identity.peer_id().short());
    }

    /// Stop the loop, then close every connection and the signaling channel
    pub(super) async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let task = lock(&self.task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("P2P session loop did not stop in time");
                task.abort();
            }
        }

        self.peers.close_all().await;
        self.signaling.close().await;
        info!("P2P session stopped");
    }
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_TICK);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run(
    weak: Weak<Shared>,
    session: Arc<Session>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut peer_events: broadcast::Receiver<PeerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(config) = weak.upgrade().map(|shared| shared.config.clone()) else {
        return;
    };
    let mut poll = ticker(config.poll_interval);
    let mut announce = ticker(config.announce_interval);
    let mut rendezvous = ticker(config.rendezvous_interval);
    let mut cleanup = ticker(config.cleanup_interval);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            Some(signal) = signals.recv() => {
                let Some(shared) = weak.upgrade() else { break };
                shared.handle_signal(&session, signal).await;
            }

            received = peer_events.recv() => match received {
                Ok(event) => {
                    let Some(shared) = weak.upgrade() else { break };
                    shared.handle_peer_event(&session, event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Peer event stream lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = poll.tick() => {
                let Some(shared) = weak.upgrade() else { break };
                shared.poll(&session).await;
            }

            _ = announce.tick() => {
                let Some(shared) = weak.upgrade() else { break };
                shared.send_announce(&session, None);
            }

            _ = rendezvous.tick() => {
                let Some(shared) = weak.upgrade() else { break };
                shared.rendezvous_round(&session).await;
            }

            _ = cleanup.tick() => {
                let Some(shared) = weak.upgrade() else { break };
                if session.peers.cleanup(config.stale_peer_age).await > 0 {
                    shared.refresh_stats().await;
                }
            }
        }
    }
    debug!("P2P session loop stopped");
}

impl Shared {
    fn send_announce(&self, session: &Session, target: Option<&PeerId>) {
        let status = match self.stats_tx.borrow().status {
            NodeStatus::Offline => NodeStatus::Waiting,
            status => status,
        };
        let payload = AnnouncePayload {
            profile: PeerProfile {
                display_name: self.config.display_name.clone(),
                ..Default::default()
            },
            available_content: self.local_content(),
            health_status: Some(status.as_str().to_string()),
        };
        if let Err(e) = session.signaling.send(SignalMessage::Announce(payload), target) {
            debug!("Announce not sent: {}", e);
        }
    }

    async fn handle_signal(self: &Arc<Self>, session: &Arc<Session>, signal: Signal) {
        let now = now_ms();
        let from = signal.from;
        let user_id = signal.user_id;

        match signal.message {
            SignalMessage::Announce(payload) => {
                let is_new = lock(&self.discovery).apply_announce(&from, &user_id, payload, now);
                if is_new {
                    info!("Discovered peer {}", from.short());
                    // Introduce ourselves to newcomers that broadcast
                    if signal.to.is_none() {
                        self.send_announce(session, Some(&from));
                    }
                }
                self.auto_connect(session, &from, &user_id).await;
            }
            SignalMessage::Query(query) => {
                lock(&self.discovery).touch(&from, now);
                let relevant = {
                    let held = lock(&self.local_content);
                    query.hashes.is_empty() || query.hashes.iter().any(|h| held.contains(h))
                };
                if relevant {
                    self.send_announce(session, Some(&from));
                }
            }
            SignalMessage::Available(available) => {
                lock(&self.discovery).apply_available(&from, &user_id, available.hashes, now);
            }
            SignalMessage::Goodbye => {
                debug!("{} said goodbye", from.short());
                lock(&self.discovery).mark_departed(&from);
            }
            SignalMessage::Offer(offer) => {
                lock(&self.discovery).touch(&from, now);
                self.handle_offer(session, from, user_id, offer.description).await;
            }
            SignalMessage::Answer(answer) => {
                if let Err(e) = session.peers.accept_answer(&from, answer.description).await {
                    debug!("Answer from {} not applied: {}", from.short(), e);
                }
            }
            SignalMessage::Ice(ice) => {
                let parked = {
                    let mut pending = lock(&self.pending_inbound);
                    match pending.get_mut(&from) {
                        Some(offer) => {
                            offer.candidates.push(ice.candidate.clone());
                            true
                        }
                        None => false,
                    }
                };
                if !parked {
                    session.peers.add_ice_candidate(&from, ice.candidate).await;
                }
            }
        }
    }

    /// Dial a discovered peer when policy allows and we are the initiator
    async fn auto_connect(&self, session: &Session, peer_id: &PeerId, user_id: &UserId) {
        if !lock(&self.control).state.auto_connect {
            return;
        }
        if !should_initiate(self.identity.peer_id(), peer_id) {
            return;
        }
        if self.outbound_refusal(peer_id).is_some() {
            return;
        }
        if lock(&self.retry_tasks).contains_key(peer_id) {
            return;
        }
        if matches!(
            session.peers.peer_state(peer_id).await,
            Some(PeerState::Connected | PeerState::Connecting | PeerState::Failed)
        ) {
            return;
        }

        let outcome = self.initiate(session, peer_id, Some(user_id.clone())).await;
        debug!("Auto-connect to {}: {:?}", peer_id.short(), outcome);
    }

    async fn handle_offer(
        &self,
        session: &Session,
        from: PeerId,
        user_id: UserId,
        description: SessionDescription,
    ) {
        if derive_blocked_peer_ids(&lock(&self.blocklist)).contains(&from) {
            Counters::bump(&self.counters.rejected_inbound);
            debug!("Ignoring offer from blocked peer {}", from.short());
            return;
        }

        let control = lock(&self.control).state;
        if let Some(gate) = control.inbound_gate() {
            Counters::bump(&self.counters.rejected_inbound);
            debug!("Refusing offer from {}: {:?}", from.short(), gate);
            return;
        }

        // Both sides dialled at once: the lower id keeps its own offer
        if let Some(existing) = session.peers.get_peer(&from).await {
            if existing.direction == ConnectionDirection::Outbound
                && existing.state == PeerState::Connecting
                && should_initiate(self.identity.peer_id(), &from)
            {
                debug!("Ignoring crossed offer from {}", from.short());
                return;
            }
        }

        if control.manual_accept {
            lock(&self.pending_inbound).insert(
                from.clone(),
                PendingOffer {
                    user_id,
                    description,
                    received_at: now_ms(),
                    candidates: Vec::new(),
                },
            );
            self.diagnostics.info(
                "control",
                format!("Inbound connection from {} awaits approval", from.short()),
            );
            return;
        }

        self.answer_offer(session, &from, user_id, description, Vec::new()).await;
    }

    pub(super) async fn answer_offer(
        &self,
        session: &Session,
        from: &PeerId,
        user_id: UserId,
        description: SessionDescription,
        candidates: Vec<IceCandidate>,
    ) {
        Counters::bump(&self.counters.connection_attempts);
        match session.peers.accept_offer(from, &user_id, description).await {
            Ok(answer) => {
                let message = SignalMessage::Answer(AnswerPayload { description: answer });
                if let Err(e) = session.signaling.send(message, Some(from)) {
                    warn!("Answer to {} not sent: {}", from.short(), e);
                }
                for candidate in candidates {
                    session.peers.add_ice_candidate(from, candidate).await;
                }
            }
            Err(e @ PeerError::Setup(_)) => self.record_connect_failure(from, &e.to_string()).await,
            Err(e) => debug!("Offer from {} not accepted: {}", from.short(), e),
        }
    }

    async fn handle_peer_event(self: &Arc<Self>, session: &Arc<Session>, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate { peer_id, candidate } => {
                let message = SignalMessage::Ice(IcePayload { candidate });
                if let Err(e) = session.signaling.send(message, Some(&peer_id)) {
                    debug!("ICE candidate for {} not sent: {}", peer_id.short(), e);
                }
            }
            PeerEvent::StateChanged {
                peer_id,
                user_id,
                state,
                retry_count,
                removed,
            } => {
                self.handle_state_change(session, peer_id, user_id, state, retry_count, removed)
                    .await;
                self.refresh_stats().await;
            }
            PeerEvent::Message { peer_id, message } => {
                self.handle_peer_message(session, peer_id, message).await;
            }
            PeerEvent::LatencyMeasured { peer_id, rtt_ms } => {
                self.quality.record_latency(&peer_id, rtt_ms).await;
            }
        }
    }

    async fn handle_state_change(
        self: &Arc<Self>,
        session: &Arc<Session>,
        peer_id: PeerId,
        user_id: UserId,
        state: PeerState,
        retry_count: u32,
        removed: bool,
    ) {
        match state {
            PeerState::Connected => {
                Counters::bump(&self.counters.successful_connections);
                self.cancel_retry(&peer_id);
                let rtt = session.peers.get_peer(&peer_id).await.and_then(|p| p.rtt);
                self.quality.record_success(&peer_id, rtt).await;
                self.diagnostics
                    .info("peer", format!("Connected to {}", peer_id.short()));

                let hashes = self.local_content();
                if !hashes.is_empty() {
                    let message = PeerMessage::ContentAvailable { hashes };
                    session.peers.send_message(&peer_id, &message).await;
                }
            }
            PeerState::Failed => {
                Counters::bump(&self.counters.failed_connection_attempts);
                self.quality.record_failure(&peer_id).await;
                let context = json!({ "peerId": peer_id, "retryCount": retry_count });

                if removed {
                    self.diagnostics.error(
                        "peer",
                        format!("Gave up on {}", peer_id.short()),
                        context,
                    );
                    return;
                }
                self.diagnostics
                    .warn("peer", format!("Connection to {} failed", peer_id.short()), context);

                let direction = session.peers.get_peer(&peer_id).await.map(|p| p.direction);
                match direction {
                    Some(ConnectionDirection::Outbound) => {
                        self.schedule_retry(session, peer_id, user_id, retry_count)
                    }
                    // The dialer owns retries of inbound handshakes
                    Some(ConnectionDirection::Inbound) => {
                        session.peers.close_peer(&peer_id).await;
                    }
                    None => {}
                }
            }
            PeerState::Disconnected if !removed => {
                self.diagnostics
                    .info("peer", format!("{} disconnected", peer_id.short()));
            }
            _ => {}
        }
    }

    fn schedule_retry(
        self: &Arc<Self>,
        session: &Arc<Session>,
        peer_id: PeerId,
        user_id: UserId,
        attempt: u32,
    ) {
        let delay = retry_delay(attempt, self.config.retry_base_delay, self.config.retry_max_delay);
        debug!("Retrying {} in {:?}", peer_id.short(), delay);

        let weak_shared = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        let target = peer_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let (Some(shared), Some(session)) = (weak_shared.upgrade(), weak_session.upgrade()) else {
                return;
            };
            lock(&shared.retry_tasks).remove(&target);

            if let Some(refused) = shared.outbound_refusal(&target) {
                // Dropped so auto-connect can dial again once policy allows
                debug!("Retry to {} skipped: {:?}", target.short(), refused);
                session.peers.close_peer(&target).await;
                return;
            }
            let outcome = shared.initiate(&session, &target, Some(user_id)).await;
            debug!("Retry {} to {}: {:?}", attempt, target.short(), outcome);
        });

        if let Some(previous) = lock(&self.retry_tasks).insert(peer_id, task) {
            previous.abort();
        }
    }

    async fn handle_peer_message(&self, session: &Session, peer_id: PeerId, message: PeerMessage) {
        match message {
            PeerMessage::RequestChunk {
                request_id,
                hash: Some(hash),
            } => {
                let reply = match self.content.get_chunk(&hash).await {
                    Some(data) => {
                        Counters::bump(&self.counters.relay_count);
                        PeerMessage::ChunkData { request_id, hash, data }
                    }
                    None => PeerMessage::ChunkNotFound { request_id, hash },
                };
                if !session.peers.send_message(&peer_id, &reply).await {
                    debug!("Chunk reply to {} not sent", peer_id.short());
                }
            }
            PeerMessage::RequestChunk { request_id, hash: None } => {
                debug!("Request {} from {} names no chunk", request_id, peer_id.short());
            }
            PeerMessage::ChunkData { request_id, hash, data } => {
                self.resolve_chunk(&request_id, ChunkReply::Data { hash, data });
            }
            PeerMessage::ChunkNotFound { request_id, .. } => {
                self.resolve_chunk(&request_id, ChunkReply::NotFound);
            }
            PeerMessage::ContentAvailable { hashes } => {
                lock(&self.discovery).replace_content(&peer_id, &hashes);
            }
            PeerMessage::Ping { .. } | PeerMessage::Pong { .. } => {}
        }
    }

    fn resolve_chunk(&self, request_id: &str, reply: ChunkReply) {
        match lock(&self.pending_chunks).remove(request_id) {
            // The requester may have timed out meanwhile
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!("Unsolicited chunk reply {}", request_id),
        }
    }

    /// Fail stalled handshakes, ping connected peers and rebuild stats
    async fn poll(&self, session: &Session) {
        for peer_id in session.peers.expire_stalled(self.config.connection_timeout).await {
            self.diagnostics.warn(
                "peer",
                format!("Handshake with {} timed out", peer_id.short()),
                json!({ "peerId": peer_id, "timeoutMs": self.config.connection_timeout.as_millis() as u64 }),
            );
        }
        for peer_id in session.peers.get_connected_peers().await {
            if session.peers.ping(&peer_id).await {
                Counters::bump(&self.counters.ping_count);
            }
        }
        self.refresh_stats().await;
    }

    /// One mesh-wide discovery query
    async fn rendezvous_round(&self, session: &Session) {
        if !lock(&self.rendezvous).is_enabled() {
            return;
        }

        let reachable = self.local_bus.is_some() || session.signaling.relay_open();
        let query = SignalMessage::Query(QueryPayload::default());
        let failure = match session.signaling.send(query, None) {
            Ok(()) if reachable => None,
            Ok(()) => Some("relay not connected".to_string()),
            Err(e) => Some(e.to_string()),
        };

        let (disabled, tracker) = {
            let mut rendezvous = lock(&self.rendezvous);
            let disabled = match &failure {
                None => {
                    rendezvous.record_success(now_ms());
                    false
                }
                Some(error) => rendezvous.record_failure(error.clone()),
            };
            (disabled, rendezvous.clone())
        };

        let Some(error) = failure else {
            return;
        };
        let streak = tracker.stats().failure_streak;
        self.diagnostics.warn(
            "rendezvous",
            "Rendezvous round failed",
            json!({ "error": error, "failureStreak": streak }),
        );

        if disabled {
            self.diagnostics.error(
                "rendezvous",
                "Rendezvous mesh disabled after repeated failures",
                json!({ "failureStreak": streak }),
            );
            if let Err(e) = tracker.persist(self.store.as_ref()).await {
                warn!("Failed to persist rendezvous toggle: {:#}", e);
            }
            self.refresh_stats().await;
        }
    }
}
