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

use crate::types::ManifestHash;
use serde::{Deserialize, Serialize};

/// Messages exchanged between connected peers over the data channel
///
/// Encoded as JSON objects tagged by `type`, e.g.
/// `{"type":"request_chunk","requestId":"r1","hash":"abc"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PeerMessage {
    /// Ask the peer for the chunk identified by `hash`
    RequestChunk {
        request_id: String,
        #[serde(default)]
        hash: Option<ManifestHash>,
    },

    /// Chunk payload answering a request
    ChunkData {
        request_id: String,
        hash: ManifestHash,
        data: Vec<u8>,
    },

    /// The peer does not hold the requested chunk
    ChunkNotFound {
        request_id: String,
        hash: ManifestHash,
    },

    /// Full set of hashes the sender can serve
    ContentAvailable {
        hashes: Vec<ManifestHash>,
    },

    /// Latency probe; `sent_at` is echoed back unchanged
    Ping {
        nonce: u64,
        sent_at: u64,
    },

    Pong {
        nonce: u64,
        sent_at: u64,
    },
}

impl PeerMessage {
    /// Serialize for the data channel
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a frame received from the data channel
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::RequestChunk { .. } => "request_chunk",
            PeerMessage::ChunkData { .. } => "chunk_data",
            PeerMessage::ChunkNotFound { .. } => "chunk_not_found",
            PeerMessage::ContentAvailable { .. } => "content_available",
            PeerMessage::Ping { .. } => "ping",
            PeerMessage::Pong { .. } => "pong",
        }
    }
}
