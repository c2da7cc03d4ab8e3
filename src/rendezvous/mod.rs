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

use crate::storage::{RENDEZVOUS_KEY, StateStore};
use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Why mesh-wide discovery is off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RendezvousDisabledReason {
    /// Turned off through the control API
    User,
    /// No signaling transport can reach the mesh
    Capability,
    /// Too many consecutive failed rounds
    Failures,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RendezvousStats {
    pub enabled: bool,
    pub disabled_reason: Option<RendezvousDisabledReason>,
    pub attempts: u64,
    pub successes: u64,
    pub failure_streak: u32,
    pub last_sync: Option<u64>,
    pub last_error: Option<String>,
}

/// Counters and toggle for periodic rendezvous rounds
///
/// A round is one broadcast `query`; the control plane reports whether the
/// mesh could be reached. After `failure_limit` consecutive failures the
/// tracker disables itself until re-enabled.
#[derive(Debug, Clone)]
pub struct RendezvousTracker {
    stats: RendezvousStats,
    failure_limit: u32,
}

impl RendezvousTracker {
    pub fn new(enabled: bool, failure_limit: u32) -> Self {
        Self {
            stats: RendezvousStats {
                enabled,
                disabled_reason: (!enabled).then_some(RendezvousDisabledReason::User),
                ..Default::default()
            },
            failure_limit: failure_limit.max(1),
        }
    }

    /// Restore the persisted toggle; missing or unreadable means enabled
    pub async fn load(store: &dyn StateStore, failure_limit: u32) -> Self {
        let enabled = match store.get(RENDEZVOUS_KEY).await {
            Ok(Some(raw)) => raw.trim() != "false",
            Ok(None) => true,
            Err(e) => {
                warn!("Could not read rendezvous toggle: {:#}", e);
                true
            }
        };
        debug!("Rendezvous mesh {}", if enabled { "enabled" } else { "disabled" });
        Self::new(enabled, failure_limit)
    }

    pub async fn persist(&self, store: &dyn StateStore) -> Result<()> {
        // Failure-driven shutdowns are not remembered across restarts
        let enabled = self.stats.enabled
            || self.stats.disabled_reason == Some(RendezvousDisabledReason::Failures);
        store
            .set(RENDEZVOUS_KEY, if enabled { "true" } else { "false" })
            .await
            .context("Failed to persist rendezvous toggle")
    }

    pub fn is_enabled(&self) -> bool {
        self.stats.enabled
    }

    pub fn stats(&self) -> RendezvousStats {
        self.stats.clone()
    }

    /// Turn rounds on or off by request; re-enabling clears the failure streak
    pub fn set_enabled(&mut self, enabled: bool) {
        self.stats.enabled = enabled;
        if enabled {
            self.stats.disabled_reason = None;
            self.stats.failure_streak = 0;
        } else {
            self.stats.disabled_reason = Some(RendezvousDisabledReason::User);
        }
    }

    /// Stop rounds because no transport can carry them
    pub fn disable_for_capability(&mut self) {
        // User shutdowns are never relabelled
        if self.stats.disabled_reason == Some(RendezvousDisabledReason::User) {
            return;
        }
        if self.stats.enabled {
            info!("Rendezvous mesh unavailable: no signaling transport");
        }
        self.stats.enabled = false;
        self.stats.disabled_reason = Some(RendezvousDisabledReason::Capability);
    }

    /// Lift a capability shutdown once a transport is available again
    pub fn restore_capability(&mut self) {
        if self.stats.disabled_reason == Some(RendezvousDisabledReason::Capability) {
            self.stats.enabled = true;
            self.stats.disabled_reason = None;
        }
    }

    pub fn record_success(&mut self, now: u64) {
        self.stats.attempts += 1;
        self.stats.successes += 1;
        self.stats.failure_streak = 0;
        self.stats.last_sync = Some(now);
        self.stats.last_error = None;
    }

    /// Returns true when this failure switched the mesh off
    pub fn record_failure(&mut self, error: impl Into<String>) -> bool {
        self.stats.attempts += 1;
        self.stats.failure_streak += 1;
        self.stats.last_error = Some(error.into());

        if self.stats.enabled && self.stats.failure_streak >= self.failure_limit {
            self.stats.enabled = false;
            self.stats.disabled_reason = Some(RendezvousDisabledReason::Failures);
            return true;
        }
        false
    }

    /// Fraction of rounds that reached the mesh, 0 when none ran
    pub fn success_rate(&self) -> f64 {
        if self.stats.attempts == 0 {
            0.0
        } else {
            self.stats.successes as f64 / self.stats.attempts as f64
        }
    }
}
