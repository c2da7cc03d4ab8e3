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

use crate::rtc::{IceCandidate, SessionDescription};
use crate::types::{ManifestHash, PeerId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind tag carried in the envelope's `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Announce,
    Offer,
    Answer,
    Ice,
    Query,
    Available,
    Goodbye,
}

impl SignalKind {
    pub const ALL: [SignalKind; 7] = [
        SignalKind::Announce,
        SignalKind::Offer,
        SignalKind::Answer,
        SignalKind::Ice,
        SignalKind::Query,
        SignalKind::Available,
        SignalKind::Goodbye,
    ];
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Announce => "announce",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
            SignalKind::Query => "query",
            SignalKind::Available => "available",
            SignalKind::Goodbye => "goodbye",
        };
        f.write_str(name)
    }
}

/// Wire envelope shared by every signaling transport
///
/// `{type, from, to?, userId, payload, timestamp}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    pub user_id: UserId,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

/// Display metadata attached to announcements
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    #[serde(default)]
    pub profile: PeerProfile,
    #[serde(default)]
    pub available_content: Vec<ManifestHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcePayload {
    pub candidate: IceCandidate,
}

/// Rendezvous query: "who is out there", optionally narrowed to content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    #[serde(default)]
    pub hashes: Vec<ManifestHash>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailablePayload {
    #[serde(default)]
    pub hashes: Vec<ManifestHash>,
}

/// Typed signaling message, one payload shape per kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Announce(AnnouncePayload),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    Ice(IcePayload),
    Query(QueryPayload),
    Available(AvailablePayload),
    Goodbye,
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalMessage::Announce(_) => SignalKind::Announce,
            SignalMessage::Offer(_) => SignalKind::Offer,
            SignalMessage::Answer(_) => SignalKind::Answer,
            SignalMessage::Ice(_) => SignalKind::Ice,
            SignalMessage::Query(_) => SignalKind::Query,
            SignalMessage::Available(_) => SignalKind::Available,
            SignalMessage::Goodbye => SignalKind::Goodbye,
        }
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            SignalMessage::Announce(p) => serde_json::to_value(p),
            SignalMessage::Offer(p) => serde_json::to_value(p),
            SignalMessage::Answer(p) => serde_json::to_value(p),
            SignalMessage::Ice(p) => serde_json::to_value(p),
            SignalMessage::Query(p) => serde_json::to_value(p),
            SignalMessage::Available(p) => serde_json::to_value(p),
            SignalMessage::Goodbye => Ok(serde_json::Value::Object(Default::default())),
        }
    }

    pub fn from_payload(kind: SignalKind, payload: serde_json::Value) -> Result<Self, serde_json::Error> {
        // Peers may omit the payload for kinds whose fields all default
        let payload = if payload.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            payload
        };

        Ok(match kind {
            SignalKind::Announce => SignalMessage::Announce(serde_json::from_value(payload)?),
            SignalKind::Offer => SignalMessage::Offer(serde_json::from_value(payload)?),
            SignalKind::Answer => SignalMessage::Answer(serde_json::from_value(payload)?),
            SignalKind::Ice => SignalMessage::Ice(serde_json::from_value(payload)?),
            SignalKind::Query => SignalMessage::Query(serde_json::from_value(payload)?),
            SignalKind::Available => SignalMessage::Available(serde_json::from_value(payload)?),
            SignalKind::Goodbye => SignalMessage::Goodbye,
        })
    }
}

/// A decoded message delivered to a handler
#[derive(Debug, Clone)]
pub struct Signal {
    pub from: PeerId,
    pub to: Option<PeerId>,
    pub user_id: UserId,
    pub timestamp: u64,
    pub message: SignalMessage,
}

impl Signal {
    pub fn from_envelope(envelope: SignalEnvelope) -> Result<Self, serde_json::Error> {
        let message = SignalMessage::from_payload(envelope.kind, envelope.payload)?;
        Ok(Self {
            from: envelope.from,
            to: envelope.to,
            user_id: envelope.user_id,
            timestamp: envelope.timestamp,
            message,
        })
    }
}
