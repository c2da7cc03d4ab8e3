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

use super::{
    DataChannel, DataChannelEvent, DataChannelOptions, IceCandidate, RtcBackend, RtcConfig,
    RtcConnection, RtcConnectionState, RtcError, RtcEvent, SdpKind, SessionDescription,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::debug;

const SDP_ORIGIN: &str = "o=flux-loopback";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process "network" that pairs loopback connections
///
/// Offers and answers carry the connection id in their SDP origin line. When
/// the offering side applies the answer, the two connections are linked,
/// data channels are mirrored to the answering side and both report
/// `Connected`. Endpoints can be marked unreachable to exercise failure paths.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    connections: HashMap<u64, Weak<LoopbackConnection>>,
    unreachable: HashSet<String>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend handing out connections for one endpoint (node)
    pub fn backend(&self, endpoint: &str) -> LoopbackBackend {
        LoopbackBackend {
            network: self.clone(),
            endpoint: endpoint.to_string(),
        }
    }

    /// Future handshakes touching `endpoint` fail instead of connecting
    pub fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut state = lock(&self.state);
        if unreachable {
            state.unreachable.insert(endpoint.to_string());
        } else {
            state.unreachable.remove(endpoint);
        }
    }

    /// Fail every live connection of `endpoint`, as a dropped network link would
    pub fn sever(&self, endpoint: &str) {
        for connection in self.live_connections() {
            if connection.endpoint == endpoint {
                connection.fail();
                if let Some(remote) = connection.remote() {
                    remote.fail();
                }
            }
        }
    }

    /// Live connections currently registered
    pub fn connection_count(&self) -> usize {
        self.live_connections().len()
    }

    fn live_connections(&self) -> Vec<Arc<LoopbackConnection>> {
        let mut state = lock(&self.state);
        state.connections.retain(|_, weak| weak.strong_count() > 0);
        state.connections.values().filter_map(Weak::upgrade).collect()
    }

    fn register(&self, endpoint: &str) -> Arc<LoopbackConnection> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(LoopbackConnection {
            id,
            endpoint: endpoint.to_string(),
            network: self.clone(),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(RtcConnectionState::New),
            channels: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            remote_id: Mutex::new(None),
        });
        state.connections.insert(id, Arc::downgrade(&connection));
        connection
    }

    fn lookup(&self, id: u64) -> Option<Arc<LoopbackConnection>> {
        lock(&self.state).connections.get(&id).and_then(Weak::upgrade)
    }

    fn is_unreachable(&self, endpoint: &str) -> bool {
        lock(&self.state).unreachable.contains(endpoint)
    }

    /// Complete the handshake between an offerer and an answerer
    fn establish(&self, offerer: &Arc<LoopbackConnection>, answerer_id: u64) {
        let Some(answerer) = self.lookup(answerer_id) else {
            offerer.fail();
            return;
        };

        if self.is_unreachable(&offerer.endpoint) || self.is_unreachable(&answerer.endpoint) {
            debug!(
                "Loopback handshake {} <-> {} failed: endpoint unreachable",
                offerer.endpoint, answerer.endpoint
            );
            offerer.fail();
            answerer.fail();
            return;
        }

        let local_channels: Vec<Arc<LoopbackChannel>> = lock(&offerer.channels).clone();
        for local in local_channels {
            let remote = LoopbackChannel::new(&local.label);
            *lock(&local.peer) = Arc::downgrade(&remote);
            *lock(&remote.peer) = Arc::downgrade(&local);
            lock(&answerer.channels).push(remote.clone());

            answerer.emit(RtcEvent::DataChannel(remote.clone()));
            local.open();
            remote.open();
        }

        offerer.set_state(RtcConnectionState::Connected);
        answerer.set_state(RtcConnectionState::Connected);
    }
}

#[derive(Clone)]
pub struct LoopbackBackend {
    network: LoopbackNetwork,
    endpoint: String,
}

impl LoopbackBackend {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RtcBackend for LoopbackBackend {
    async fn create_connection(&self, _config: &RtcConfig) -> Result<Arc<dyn RtcConnection>, RtcError> {
        if self.network.is_unreachable(&self.endpoint) {
            return Err(RtcError::Backend(format!("endpoint {} is offline", self.endpoint)));
        }
        Ok(self.network.register(&self.endpoint))
    }
}

pub struct LoopbackConnection {
    id: u64,
    endpoint: String,
    network: LoopbackNetwork,
    events_tx: Mutex<Option<mpsc::UnboundedSender<RtcEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RtcEvent>>>,
    state: Mutex<RtcConnectionState>,
    channels: Mutex<Vec<Arc<LoopbackChannel>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    remote_id: Mutex<Option<u64>>,
}

impl LoopbackConnection {
    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let role = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        SessionDescription {
            kind,
            sdp: format!("v=0\r\n{} {} {}\r\ns={}\r\n", SDP_ORIGIN, self.id, self.endpoint, role),
        }
    }

    fn emit(&self, event: RtcEvent) {
        if let Some(tx) = lock(&self.events_tx).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn set_state(&self, next: RtcConnectionState) {
        {
            let mut state = lock(&self.state);
            if *state == next || *state == RtcConnectionState::Closed {
                return;
            }
            *state = next;
        }
        self.emit(RtcEvent::StateChanged(next));
    }

    fn fail(&self) {
        for channel in lock(&self.channels).iter() {
            channel.open.store(false, Ordering::SeqCst);
        }
        self.set_state(RtcConnectionState::Failed);
    }

    fn remote(&self) -> Option<Arc<LoopbackConnection>> {
        let remote_id = (*lock(&self.remote_id))?;
        self.network.lookup(remote_id)
    }

    fn ensure_open(&self) -> Result<(), RtcError> {
        if *lock(&self.state) == RtcConnectionState::Closed {
            return Err(RtcError::ConnectionClosed);
        }
        Ok(())
    }
}

fn parse_origin(sdp: &str) -> Result<u64, RtcError> {
    let line = sdp
        .lines()
        .find(|line| line.starts_with(SDP_ORIGIN))
        .ok_or_else(|| RtcError::InvalidDescription("missing loopback origin".to_string()))?;

    line[SDP_ORIGIN.len()..]
        .split_whitespace()
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| RtcError::InvalidDescription(format!("bad origin line: {}", line)))
}

#[async_trait]
impl RtcConnection for LoopbackConnection {
    fn create_data_channel(
        &self,
        label: &str,
        _options: DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, RtcError> {
        self.ensure_open()?;
        let channel = LoopbackChannel::new(label);
        lock(&self.channels).push(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_open()?;
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_open()?;
        match lock(&self.remote).as_ref() {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(self.describe(SdpKind::Answer)),
            _ => Err(RtcError::InvalidState("no remote offer to answer".to_string())),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.ensure_open()?;
        *lock(&self.local) = Some(description);
        self.set_state(RtcConnectionState::Connecting);
        self.emit(RtcEvent::IceCandidate(IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
            self.id,
            40000 + self.id % 20000
        ))));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.ensure_open()?;
        let remote_id = parse_origin(&description.sdp)?;

        match description.kind {
            SdpKind::Offer => {
                *lock(&self.remote_id) = Some(remote_id);
                *lock(&self.remote) = Some(description);
                Ok(())
            }
            SdpKind::Answer => {
                let has_offer = matches!(
                    lock(&self.local).as_ref(),
                    Some(local) if local.kind == SdpKind::Offer
                );
                if !has_offer {
                    return Err(RtcError::InvalidState("answer without a local offer".to_string()));
                }
                *lock(&self.remote_id) = Some(remote_id);
                *lock(&self.remote) = Some(description);

                if let Some(me) = self.network.lookup(self.id) {
                    self.network.establish(&me, remote_id);
                }
                Ok(())
            }
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.ensure_open()?;
        if lock(&self.remote).is_none() {
            return Err(RtcError::InvalidState("remote description not set".to_string()));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(RtcError::InvalidCandidate(candidate.candidate));
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcEvent>> {
        lock(&self.events_rx).take()
    }

    fn state(&self) -> RtcConnectionState {
        *lock(&self.state)
    }

    async fn close(&self) {
        {
            let mut state = lock(&self.state);
            if *state == RtcConnectionState::Closed {
                return;
            }
            *state = RtcConnectionState::Closed;
        }

        let channels: Vec<Arc<LoopbackChannel>> = lock(&self.channels).drain(..).collect();
        for channel in channels {
            channel.close();
        }

        if let Some(remote) = self.remote() {
            remote.set_state(RtcConnectionState::Disconnected);
        }

        // Dropping the sender ends the consumer's event loop
        lock(&self.events_tx).take();
    }
}

pub struct LoopbackChannel {
    label: String,
    open: AtomicBool,
    peer: Mutex<Weak<LoopbackChannel>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<DataChannelEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DataChannelEvent>>>,
}

impl LoopbackChannel {
    fn new(label: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            peer: Mutex::new(Weak::new()),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
        })
    }

    fn emit(&self, event: DataChannelEvent) {
        if let Some(tx) = lock(&self.events_tx).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.emit(DataChannelEvent::Open);
        }
    }

    fn shut(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.emit(DataChannelEvent::Close);
        }
        lock(&self.events_tx).take();
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: &str) -> Result<(), RtcError> {
        if !self.is_open() {
            return Err(RtcError::ChannelClosed);
        }
        let peer = lock(&self.peer).upgrade().ok_or(RtcError::ChannelClosed)?;
        if !peer.is_open() {
            return Err(RtcError::ChannelClosed);
        }
        peer.emit(DataChannelEvent::Message(text.to_string()));
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataChannelEvent>> {
        lock(&self.events_rx).take()
    }

    fn close(&self) {
        let peer = lock(&self.peer).upgrade();
        self.shut();
        if let Some(peer) = peer {
            peer.shut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake(
        network: &LoopbackNetwork,
    ) -> (Arc<dyn RtcConnection>, Arc<dyn RtcConnection>, Arc<dyn DataChannel>) {
        let a = network.backend("a").create_connection(&RtcConfig::default()).await.unwrap();
        let b = network.backend("b").create_connection(&RtcConfig::default()).await.unwrap();

        let channel = a
            .create_data_channel("chunks", DataChannelOptions::default())
            .unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();

        a.set_remote_description(answer).await.unwrap();
        (a, b, channel)
    }

    #[tokio::test]
    async fn test_handshake_opens_mirrored_channel() {
        let network = LoopbackNetwork::new();
        let (a, b, channel) = handshake(&network).await;

        assert_eq!(a.state(), RtcConnectionState::Connected);
        assert_eq!(b.state(), RtcConnectionState::Connected);
        assert!(channel.is_open());

        let mut b_events = b.take_events().unwrap();
        let remote_channel = loop {
            match b_events.recv().await.unwrap() {
                RtcEvent::DataChannel(channel) => break channel,
                _ => continue,
            }
        };
        assert_eq!(remote_channel.label(), "chunks");

        let mut remote_events = remote_channel.take_events().unwrap();
        assert_eq!(remote_events.recv().await, Some(DataChannelEvent::Open));

        channel.send_text("hello").unwrap();
        assert_eq!(
            remote_events.recv().await,
            Some(DataChannelEvent::Message("hello".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_both_sides() {
        let network = LoopbackNetwork::new();
        let a = network.backend("a").create_connection(&RtcConfig::default()).await.unwrap();
        let b = network.backend("b").create_connection(&RtcConfig::default()).await.unwrap();
        network.set_unreachable("b", true);

        let channel = a.create_data_channel("chunks", DataChannelOptions::default()).unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.state(), RtcConnectionState::Failed);
        assert_eq!(b.state(), RtcConnectionState::Failed);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_close_disconnects_remote() {
        let network = LoopbackNetwork::new();
        let (a, b, channel) = handshake(&network).await;

        a.close().await;

        assert_eq!(a.state(), RtcConnectionState::Closed);
        assert_eq!(b.state(), RtcConnectionState::Disconnected);
        assert!(!channel.is_open());
        assert!(channel.send_text("late").is_err());
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let network = LoopbackNetwork::new();
        let a = network.backend("a").create_connection(&RtcConfig::default()).await.unwrap();

        let result = a.add_ice_candidate(IceCandidate::new("candidate:1 1 udp 1 1.2.3.4 5 typ host")).await;
        assert!(matches!(result, Err(RtcError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_rejected() {
        let network = LoopbackNetwork::new();
        let a = network.backend("a").create_connection(&RtcConfig::default()).await.unwrap();

        let result = a.create_answer().await;
        assert!(matches!(result, Err(RtcError::InvalidState(_))));

        let bogus = SessionDescription::answer("v=0\r\n");
        assert!(matches!(
            a.set_remote_description(bogus).await,
            Err(RtcError::InvalidDescription(_))
        ));
    }
}
