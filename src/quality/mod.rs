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

use crate::storage::{QUALITY_KEY, StateStore, load_json, save_json};
use crate::types::{PeerId, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Latency samples kept per peer
pub const MAX_LATENCY_SAMPLES: usize = 10;

/// Peers retained in durable storage
pub const MAX_STORED_PEERS: usize = 100;

const RELIABILITY_HALF_LIFE_MS: f64 = 7.0 * 24.0 * 60.0 * 60.0 * 1000.0;

/// Latency score used before any sample has been recorded
const UNKNOWN_LATENCY_SCORE: f64 = 0.5;

/// Per-peer connection statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionQualityMetrics {
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub total_attempts: u64,
    pub avg_latency_ms: Option<f64>,
    pub last_success_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    #[serde(default)]
    pub latency_samples: VecDeque<u64>,
}

impl ConnectionQualityMetrics {
    fn push_latency(&mut self, latency_ms: u64) {
        self.latency_samples.push_back(latency_ms);
        while self.latency_samples.len() > MAX_LATENCY_SAMPLES {
            self.latency_samples.pop_front();
        }
        let sum: u64 = self.latency_samples.iter().sum();
        self.avg_latency_ms = Some(sum as f64 / self.latency_samples.len() as f64);
    }

    /// Repair counters from older or hand-edited records
    fn repair(&mut self) {
        self.total_attempts = self.successful_connections + self.failed_connections;
        while self.latency_samples.len() > MAX_LATENCY_SAMPLES {
            self.latency_samples.pop_front();
        }
        if !self.latency_samples.is_empty() {
            let sum: u64 = self.latency_samples.iter().sum();
            self.avg_latency_ms = Some(sum as f64 / self.latency_samples.len() as f64);
        }
    }
}

/// Derived score for a peer, every field in [0, 1] except latency
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityScore {
    pub success_rate: f64,
    pub reliability: f64,
    pub avg_latency_ms: f64,
    pub score: f64,
}

/// Map a latency to [0, 1]: flat to 100ms, 1.0→0.5 by 500ms, 0.5→0 by 2000ms
pub fn latency_score(latency_ms: f64) -> f64 {
    if latency_ms <= 100.0 {
        1.0
    } else if latency_ms <= 500.0 {
        1.0 - 0.5 * (latency_ms - 100.0) / 400.0
    } else if latency_ms < 2000.0 {
        0.5 * (1.0 - (latency_ms - 500.0) / 1500.0)
    } else {
        0.0
    }
}

/// Score a metrics record as seen at `now`
pub fn score_metrics(metrics: &ConnectionQualityMetrics, now: u64) -> QualityScore {
    if metrics.total_attempts == 0 {
        return QualityScore::default();
    }

    let success_rate = metrics.successful_connections as f64 / metrics.total_attempts as f64;

    let recency = match metrics.last_success_at {
        Some(at) => {
            let age = now.saturating_sub(at) as f64;
            0.5_f64.powf(age / RELIABILITY_HALF_LIFE_MS)
        }
        None => 0.0,
    };
    let reliability = (0.7 * success_rate + 0.3 * recency).clamp(0.0, 1.0);

    let latency = match metrics.avg_latency_ms {
        Some(avg) => latency_score(avg),
        None => UNKNOWN_LATENCY_SCORE,
    };

    let score = (0.6 * success_rate + 0.25 * reliability + 0.15 * latency).clamp(0.0, 1.0);

    QualityScore {
        success_rate,
        reliability,
        avg_latency_ms: metrics.avg_latency_ms.unwrap_or(0.0),
        score,
    }
}

/// Tracks connection outcomes per peer and ranks peers for auto-connect
///
/// Metrics live in memory and are written through to the store after every
/// mutation. A failed write is logged; the in-memory copy stays authoritative.
#[derive(Clone)]
pub struct ConnectionQualityTracker {
    metrics: Arc<Mutex<HashMap<PeerId, ConnectionQualityMetrics>>>,
    store: Option<Arc<dyn StateStore>>,
}

impl ConnectionQualityTracker {
    /// Tracker without persistence
    pub fn in_memory() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(HashMap::new())),
            store: None,
        }
    }

    /// Load stored metrics; unreadable data starts an empty tracker
    pub async fn load(store: Arc<dyn StateStore>) -> Self {
        let metrics = match load_json::<HashMap<PeerId, ConnectionQualityMetrics>>(store.as_ref(), QUALITY_KEY).await {
            Ok(Some(mut metrics)) => {
                for record in metrics.values_mut() {
                    record.repair();
                }
                debug!("Loaded quality metrics for {} peers", metrics.len());
                metrics
            }
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!("Discarding unreadable quality metrics: {:#}", e);
                HashMap::new()
            }
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
            store: Some(store),
        }
    }

    pub async fn record_success(&self, peer_id: &PeerId, latency_ms: Option<u64>) {
        self.record_success_at(peer_id, latency_ms, now_ms()).await;
    }

    pub async fn record_success_at(&self, peer_id: &PeerId, latency_ms: Option<u64>, now: u64) {
        self.mutate(peer_id, |m| {
            m.successful_connections += 1;
            m.total_attempts += 1;
            m.last_success_at = Some(now);
            if let Some(latency) = latency_ms {
                m.push_latency(latency);
            }
        });
        self.persist().await;
    }

    pub async fn record_failure(&self, peer_id: &PeerId) {
        self.record_failure_at(peer_id, now_ms()).await;
    }

    pub async fn record_failure_at(&self, peer_id: &PeerId, now: u64) {
        self.mutate(peer_id, |m| {
            m.failed_connections += 1;
            m.total_attempts += 1;
            m.last_failure_at = Some(now);
        });
        self.persist().await;
    }

    /// Add an RTT sample without counting a connection attempt
    pub async fn record_latency(&self, peer_id: &PeerId, latency_ms: u64) {
        let known = {
            let mut metrics = self.lock();
            match metrics.get_mut(peer_id) {
                Some(record) => {
                    record.push_latency(latency_ms);
                    true
                }
                None => false,
            }
        };
        if known {
            self.persist().await;
        }
    }

    pub fn get_score(&self, peer_id: &PeerId) -> QualityScore {
        self.get_score_at(peer_id, now_ms())
    }

    pub fn get_score_at(&self, peer_id: &PeerId, now: u64) -> QualityScore {
        self.lock()
            .get(peer_id)
            .map(|m| score_metrics(m, now))
            .unwrap_or_default()
    }

    /// The `n` best-scoring peers, best first
    pub fn get_top_peers(&self, n: usize) -> Vec<PeerId> {
        let now = now_ms();
        let mut scored: Vec<(PeerId, f64)> = self
            .lock()
            .iter()
            .map(|(id, m)| (id.clone(), score_metrics(m, now).score))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.into_iter().take(n).map(|(id, _)| id).collect()
    }

    pub fn metrics(&self, peer_id: &PeerId) -> Option<ConnectionQualityMetrics> {
        self.lock().get(peer_id).cloned()
    }

    pub fn all_scores(&self) -> HashMap<PeerId, QualityScore> {
        let now = now_ms();
        self.lock()
            .iter()
            .map(|(id, m)| (id.clone(), score_metrics(m, now)))
            .collect()
    }

    pub fn tracked_peers(&self) -> usize {
        self.lock().len()
    }

    fn mutate<F>(&self, peer_id: &PeerId, f: F)
    where
        F: FnOnce(&mut ConnectionQualityMetrics),
    {
        let mut metrics = self.lock();
        let record = metrics.entry(peer_id.clone()).or_default();
        f(record);
    }

    /// Prune to the storage cap, then write the snapshot
    async fn persist(&self) {
        let snapshot = {
            let mut metrics = self.lock();
            prune_lowest(&mut metrics, MAX_STORED_PEERS, now_ms());
            metrics.clone()
        };

        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = save_json(store.as_ref(), QUALITY_KEY, &snapshot).await {
            warn!("Failed to persist quality metrics: {:#}", e);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, ConnectionQualityMetrics>> {
        // A poisoned lock only means another thread panicked mid-update
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn prune_lowest(metrics: &mut HashMap<PeerId, ConnectionQualityMetrics>, cap: usize, now: u64) {
    if metrics.len() <= cap {
        return;
    }

    let mut scored: Vec<(PeerId, f64)> = metrics
        .iter()
        .map(|(id, m)| (id.clone(), score_metrics(m, now).score))
        .collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)));

    let excess = metrics.len() - cap;
    for (id, _) in scored.into_iter().take(excess) {
        metrics.remove(&id);
    }
    debug!("Pruned {} low-scoring peers from quality metrics", excess);
}
