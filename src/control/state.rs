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

use crate::storage::{CONTROL_KEY, CONTROL_RESUME_KEY, StateStore, load_json, save_json};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// One boolean of the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlFlag {
    AutoConnect,
    ManualAccept,
    Isolate,
    Paused,
    PauseInbound,
    PauseOutbound,
}

impl ControlFlag {
    pub const ALL: [ControlFlag; 6] = [
        ControlFlag::AutoConnect,
        ControlFlag::ManualAccept,
        ControlFlag::Isolate,
        ControlFlag::Paused,
        ControlFlag::PauseInbound,
        ControlFlag::PauseOutbound,
    ];

    /// Flags that accept an auto-resume window
    pub fn is_pausable(self) -> bool {
        matches!(
            self,
            ControlFlag::Paused | ControlFlag::PauseInbound | ControlFlag::PauseOutbound
        )
    }
}

impl fmt::Display for ControlFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlFlag::AutoConnect => "autoConnect",
            ControlFlag::ManualAccept => "manualAccept",
            ControlFlag::Isolate => "isolate",
            ControlFlag::Paused => "paused",
            ControlFlag::PauseInbound => "pauseInbound",
            ControlFlag::PauseOutbound => "pauseOutbound",
        };
        f.write_str(name)
    }
}

/// Node-wide connection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct P2PControlState {
    pub auto_connect: bool,
    pub manual_accept: bool,
    pub isolate: bool,
    pub paused: bool,
    pub pause_inbound: bool,
    pub pause_outbound: bool,
}

impl Default for P2PControlState {
    fn default() -> Self {
        Self {
            auto_connect: true,
            manual_accept: false,
            isolate: false,
            paused: false,
            pause_inbound: false,
            pause_outbound: false,
        }
    }
}

impl P2PControlState {
    pub fn get(&self, flag: ControlFlag) -> bool {
        match flag {
            ControlFlag::AutoConnect => self.auto_connect,
            ControlFlag::ManualAccept => self.manual_accept,
            ControlFlag::Isolate => self.isolate,
            ControlFlag::Paused => self.paused,
            ControlFlag::PauseInbound => self.pause_inbound,
            ControlFlag::PauseOutbound => self.pause_outbound,
        }
    }

    pub fn set(&mut self, flag: ControlFlag, value: bool) {
        let slot = match flag {
            ControlFlag::AutoConnect => &mut self.auto_connect,
            ControlFlag::ManualAccept => &mut self.manual_accept,
            ControlFlag::Isolate => &mut self.isolate,
            ControlFlag::Paused => &mut self.paused,
            ControlFlag::PauseInbound => &mut self.pause_inbound,
            ControlFlag::PauseOutbound => &mut self.pause_outbound,
        };
        *slot = value;
    }

    /// Why a new outbound attempt would be refused, if it would
    pub fn outbound_gate(&self) -> Option<PolicyGate> {
        if self.isolate {
            Some(PolicyGate::Isolated)
        } else if self.paused || self.pause_outbound {
            Some(PolicyGate::Paused)
        } else {
            None
        }
    }

    /// Why a new inbound handshake would be refused, if it would
    pub fn inbound_gate(&self) -> Option<PolicyGate> {
        if self.isolate {
            Some(PolicyGate::Isolated)
        } else if self.paused || self.pause_inbound {
            Some(PolicyGate::Paused)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyGate {
    Isolated,
    Paused,
}

/// Absolute resume deadlines (ms since epoch) per pausable flag
pub type ControlResumeTargets = BTreeMap<ControlFlag, u64>;

/// Options for [`set_control_flag`](super::P2PManager::set_control_flag)
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlOptions {
    /// Clear the flag again after this long; only honoured when pausing
    pub auto_resume: Option<Duration>,
}

impl ControlOptions {
    pub fn auto_resume(after: Duration) -> Self {
        Self {
            auto_resume: Some(after),
        }
    }
}

/// Load flags and resume targets, falling back to defaults on bad data
pub async fn load_control(store: &dyn StateStore) -> (P2PControlState, ControlResumeTargets) {
    let state = match load_json::<P2PControlState>(store, CONTROL_KEY).await {
        Ok(state) => state.unwrap_or_default(),
        Err(e) => {
            warn!("Discarding unreadable control state: {:#}", e);
            P2PControlState::default()
        }
    };

    let targets = match load_json::<ControlResumeTargets>(store, CONTROL_RESUME_KEY).await {
        Ok(targets) => targets.unwrap_or_default(),
        Err(e) => {
            warn!("Discarding unreadable resume targets: {:#}", e);
            ControlResumeTargets::new()
        }
    };

    // A deadline only makes sense while its flag is still set
    let targets = targets
        .into_iter()
        .filter(|(flag, _)| flag.is_pausable() && state.get(*flag))
        .collect();

    (state, targets)
}

pub async fn persist_control(
    store: &dyn StateStore,
    state: &P2PControlState,
    targets: &ControlResumeTargets,
) -> Result<()> {
    save_json(store, CONTROL_KEY, state).await?;
    save_json(store, CONTROL_RESUME_KEY, targets).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_gates() {
        let mut state = P2PControlState::default();
        assert_eq!(state.outbound_gate(), None);
        assert_eq!(state.inbound_gate(), None);

        state.set(ControlFlag::PauseOutbound, true);
        assert_eq!(state.outbound_gate(), Some(PolicyGate::Paused));
        assert_eq!(state.inbound_gate(), None);

        state.set(ControlFlag::Isolate, true);
        assert_eq!(state.outbound_gate(), Some(PolicyGate::Isolated));
        assert_eq!(state.inbound_gate(), Some(PolicyGate::Isolated));
    }

    #[test]
    fn test_wire_names() {
        let value = serde_json::to_value(P2PControlState::default()).unwrap();
        assert_eq!(value["autoConnect"], true);
        assert_eq!(value["pauseOutbound"], false);

        let mut targets = ControlResumeTargets::new();
        targets.insert(ControlFlag::PauseInbound, 42);
        assert_eq!(serde_json::to_string(&targets).unwrap(), r#"{"pauseInbound":42}"#);
    }

    #[tokio::test]
    async fn test_round_trip_drops_orphan_targets() {
        let store = MemoryStore::new();
        let mut state = P2PControlState::default();
        state.paused = true;

        let mut targets = ControlResumeTargets::new();
        targets.insert(ControlFlag::Paused, 10);
        targets.insert(ControlFlag::PauseInbound, 20);
        persist_control(&store, &state, &targets).await.unwrap();

        let (loaded, loaded_targets) = load_control(&store).await;
        assert_eq!(loaded, state);
        assert_eq!(loaded_targets.len(), 1);
        assert_eq!(loaded_targets.get(&ControlFlag::Paused), Some(&10));
    }

    #[tokio::test]
    async fn test_partial_state_uses_defaults() {
        let store = MemoryStore::new();
        store.set(CONTROL_KEY, r#"{"isolate":true}"#).await.unwrap();

        let (state, _) = load_control(&store).await;
        assert!(state.isolate);
        assert!(state.auto_connect);
    }
}
