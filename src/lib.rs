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

//! Flux peer-to-peer node: connection lifecycle and mesh health.

pub mod blocklist;
pub mod config;
pub mod content;
pub mod control;
pub mod dashboard;
pub mod diagnostics;
pub mod identity;
pub mod network;
pub mod protocol;
pub mod quality;
pub mod rendezvous;
pub mod rtc;
pub mod signaling;
pub mod storage;
pub mod types;

pub use control::{ConnectOptions, ConnectOutcome, ControlError, ManagerParts, P2PManager};
