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

//! Transport-neutral view of an RTC peer connection.
//!
//! The connection manager only talks to these traits. Backends own the real
//! ICE/DTLS machinery and report progress as [`RtcEvent`]s on a channel that
//! the manager takes once per connection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod loopback;

pub use loopback::{LoopbackBackend, LoopbackNetwork};

#[derive(Debug, thiserror::Error)]
pub enum RtcError {
    #[error("Invalid connection state: {0}")]
    InvalidState(String),

    #[error("Malformed session description: {0}")]
    InvalidDescription(String),

    #[error("Rejected ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Data channel is not open")]
    ChannelClosed,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP blob plus its role in the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RtcConfig {
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChannelOptions {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Connection-level notifications
pub enum RtcEvent {
    StateChanged(RtcConnectionState),
    /// The remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    /// A local candidate was gathered and should be signaled
    IceCandidate(IceCandidate),
}

impl fmt::Debug for RtcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtcEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            RtcEvent::DataChannel(channel) => f.debug_tuple("DataChannel").field(&channel.label()).finish(),
            RtcEvent::IceCandidate(candidate) => f.debug_tuple("IceCandidate").field(candidate).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelEvent {
    Open,
    Message(String),
    Close,
}

/// Factory for peer connections
#[async_trait]
pub trait RtcBackend: Send + Sync {
    async fn create_connection(&self, config: &RtcConfig) -> Result<Arc<dyn RtcConnection>, RtcError>;
}

#[async_trait]
pub trait RtcConnection: Send + Sync {
    fn create_data_channel(
        &self,
        label: &str,
        options: DataChannelOptions,
    ) -> Result<Arc<dyn DataChannel>, RtcError>;

    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;

    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    /// Event stream for this connection; `None` once taken
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcEvent>>;

    fn state(&self) -> RtcConnectionState;

    async fn close(&self);
}

pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    fn send_text(&self, text: &str) -> Result<(), RtcError>;

    /// Event stream for this channel; `None` once taken
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataChannelEvent>>;

    fn close(&self);
}
