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

//! Display-ready projection of the control plane.
//!
//! [`build_node_dashboard_snapshot`] is a pure function of its input: the
//! clock is part of [`NodeDashboardSource`], so equal inputs give equal
//! snapshots.

use crate::blocklist::{BlockDirection, BlocklistEntry};
use crate::control::{ControlFlag, ControlResumeTargets, DiscoveredPeer, NodeStatus, P2PControlState, P2PStats};
use crate::diagnostics::{DiagnosticCounts, DiagnosticEvent, DiagnosticLevel};
use crate::network::PeerSnapshot;
use crate::quality::QualityScore;
use crate::rendezvous::RendezvousStats;
use crate::types::{PeerId, PeerState, UserId};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// RTT above which a connected peer counts as degraded
pub const DEGRADED_RTT_MS: u64 = 1_000;
/// Quality score below which a connected peer counts as degraded
pub const DEGRADED_SCORE: f64 = 0.3;
const RECENT_DIAGNOSTICS: usize = 10;

/// Everything the dashboard is computed from
#[derive(Debug, Clone, Default)]
pub struct NodeDashboardSource {
    pub now: u64,
    pub peer_id: PeerId,
    pub stats: P2PStats,
    pub control: P2PControlState,
    pub resume_targets: ControlResumeTargets,
    pub peers: Vec<PeerSnapshot>,
    pub quality: BTreeMap<PeerId, QualityScore>,
    pub discovered: Vec<DiscoveredPeer>,
    pub blocklist: Vec<BlocklistEntry>,
    pub diagnostics: Vec<DiagnosticEvent>,
    pub online_ttl_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub avg_rtt_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardPeer {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub state: PeerState,
    pub health: PeerHealth,
    pub rtt: Option<u64>,
    pub score: f64,
    pub last_seen: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardDiscoveredPeer {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub last_seen: u64,
    /// Seen within the online window
    pub online: bool,
    pub connected: bool,
    pub blocked: bool,
    pub content_count: usize,
    pub health_status: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedCounts {
    pub inbound: usize,
    pub outbound: usize,
    pub all: usize,
    /// Distinct peers with any entry
    pub peers: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportFallbacks {
    pub local_sent: u64,
    pub relay_sent: u64,
    pub relay_queued: u64,
    pub relay_reconnects: u64,
    /// Share of relay traffic that had to wait for the socket
    pub queued_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeCountdown {
    pub flag: ControlFlag,
    pub resume_at: u64,
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDashboardSnapshot {
    pub generated_at: u64,
    pub peer_id: PeerId,
    pub status: NodeStatus,
    pub control: P2PControlState,
    pub resume_countdowns: Vec<ResumeCountdown>,
    pub failure_rate: f64,
    pub rendezvous_success_rate: f64,
    pub bandwidth_kbps: f64,
    pub mesh_strength: f64,
    pub health: ConnectionHealthSummary,
    pub peers: Vec<DashboardPeer>,
    pub discovered: Vec<DashboardDiscoveredPeer>,
    pub online_now: usize,
    pub blocked: BlockedCounts,
    pub transport: TransportFallbacks,
    pub rendezvous: RendezvousStats,
    pub diagnostics: DiagnosticCounts,
    /// Newest first
    pub recent_diagnostics: Vec<DiagnosticEvent>,
    pub stats: P2PStats,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub fn classify_peer(peer: &PeerSnapshot, score: Option<&QualityScore>) -> PeerHealth {
    if peer.state != PeerState::Connected || !peer.channel_open {
        return PeerHealth::Unhealthy;
    }
    let slow = peer.rtt.is_some_and(|rtt| rtt > DEGRADED_RTT_MS);
    let unreliable = score.is_some_and(|s| s.score < DEGRADED_SCORE);
    if slow || unreliable {
        PeerHealth::Degraded
    } else {
        PeerHealth::Healthy
    }
}

fn summarize_health(peers: &[DashboardPeer]) -> ConnectionHealthSummary {
    let mut summary = ConnectionHealthSummary {
        total: peers.len(),
        ..Default::default()
    };
    for peer in peers {
        match peer.health {
            PeerHealth::Healthy => summary.healthy += 1,
            PeerHealth::Degraded => summary.degraded += 1,
            PeerHealth::Unhealthy => summary.unhealthy += 1,
        }
    }

    let rtts: Vec<u64> = peers.iter().filter_map(|p| p.rtt).collect();
    if !rtts.is_empty() {
        summary.avg_rtt_ms = Some(rtts.iter().sum::<u64>() as f64 / rtts.len() as f64);
    }
    summary
}

fn count_blocked(entries: &[BlocklistEntry]) -> BlockedCounts {
    let mut counts = BlockedCounts::default();
    let mut peers = HashSet::new();
    for entry in entries {
        match entry.direction {
            BlockDirection::Inbound => counts.inbound += 1,
            BlockDirection::Outbound => counts.outbound += 1,
            BlockDirection::All => counts.all += 1,
        }
        peers.insert(&entry.peer_id);
    }
    counts.peers = peers.len();
    counts
}

fn count_diagnostics(events: &[DiagnosticEvent]) -> DiagnosticCounts {
    let mut counts = DiagnosticCounts::default();
    for event in events {
        match event.level {
            DiagnosticLevel::Info => counts.info += 1,
            DiagnosticLevel::Warn => counts.warn += 1,
            DiagnosticLevel::Error => counts.error += 1,
        }
    }
    counts
}

/// Project manager state into a dashboard snapshot
pub fn build_node_dashboard_snapshot(source: &NodeDashboardSource) -> NodeDashboardSnapshot {
    let stats = &source.stats;
    let now = source.now;

    let display_names: BTreeMap<&PeerId, &str> = source
        .discovered
        .iter()
        .filter_map(|d| d.profile.display_name.as_deref().map(|name| (&d.peer_id, name)))
        .collect();

    let mut peers: Vec<DashboardPeer> = source
        .peers
        .iter()
        .map(|peer| {
            let score = source.quality.get(&peer.id);
            DashboardPeer {
                peer_id: peer.id.clone(),
                user_id: peer.user_id.clone(),
                display_name: display_names.get(&peer.id).map(|name| name.to_string()),
                state: peer.state,
                health: classify_peer(peer, score),
                rtt: peer.rtt,
                score: score.map(|s| s.score).unwrap_or(0.0),
                last_seen: peer.last_seen,
                bytes_sent: peer.bytes_sent,
                bytes_received: peer.bytes_received,
            }
        })
        .collect();
    peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.peer_id.cmp(&b.peer_id)));

    let connected: HashSet<&PeerId> = source
        .peers
        .iter()
        .filter(|p| p.state == PeerState::Connected)
        .map(|p| &p.id)
        .collect();
    let blocked: HashSet<&PeerId> = source.blocklist.iter().map(|e| &e.peer_id).collect();

    let mut discovered: Vec<DashboardDiscoveredPeer> = source
        .discovered
        .iter()
        .map(|d| DashboardDiscoveredPeer {
            peer_id: d.peer_id.clone(),
            user_id: d.user_id.clone(),
            display_name: d.profile.display_name.clone(),
            last_seen: d.last_seen,
            online: d.is_online(now, source.online_ttl_ms),
            connected: connected.contains(&d.peer_id),
            blocked: blocked.contains(&d.peer_id),
            content_count: d.available_content.len(),
            health_status: d.health_status.clone(),
        })
        .collect();
    discovered.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.peer_id.cmp(&b.peer_id)));
    let online_now = discovered.iter().filter(|d| d.online).count();

    let health = summarize_health(&peers);
    let mesh_strength = ratio(health.healthy as u64, health.total as u64);

    let uptime_secs = stats.uptime_ms as f64 / 1000.0;
    let bandwidth_kbps = if stats.uptime_ms == 0 {
        0.0
    } else {
        (stats.bytes_uploaded + stats.bytes_downloaded) as f64 * 8.0 / uptime_secs / 1000.0
    };

    let transport = TransportFallbacks {
        local_sent: stats.transport.local_sent,
        relay_sent: stats.transport.relay_sent,
        relay_queued: stats.transport.relay_queued,
        relay_reconnects: stats.transport.relay_reconnects,
        queued_ratio: ratio(
            stats.transport.relay_queued,
            stats.transport.relay_sent + stats.transport.relay_queued,
        ),
    };

    let resume_countdowns = source
        .resume_targets
        .iter()
        .map(|(flag, resume_at)| ResumeCountdown {
            flag: *flag,
            resume_at: *resume_at,
            remaining_ms: resume_at.saturating_sub(now),
        })
        .collect();

    let recent_diagnostics = source
        .diagnostics
        .iter()
        .rev()
        .take(RECENT_DIAGNOSTICS)
        .cloned()
        .collect();

    NodeDashboardSnapshot {
        generated_at: now,
        peer_id: source.peer_id.clone(),
        status: stats.status,
        control: source.control,
        resume_countdowns,
        failure_rate: ratio(stats.failed_connection_attempts, stats.connection_attempts),
        rendezvous_success_rate: ratio(stats.rendezvous.successes, stats.rendezvous.attempts),
        bandwidth_kbps,
        mesh_strength,
        health,
        peers,
        discovered,
        online_now,
        blocked: count_blocked(&source.blocklist),
        transport,
        rendezvous: stats.rendezvous.clone(),
        diagnostics: count_diagnostics(&source.diagnostics),
        recent_diagnostics,
        stats: stats.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::PeerProfile;
    use crate::types::ConnectionDirection;
    use std::collections::BTreeSet;

    fn peer(id: &str, state: PeerState, last_seen: u64, rtt: Option<u64>) -> PeerSnapshot {
        PeerSnapshot {
            id: PeerId::from(id),
            user_id: UserId::from("u"),
            state,
            direction: ConnectionDirection::Outbound,
            available_content: Vec::new(),
            last_seen,
            rtt,
            retry_count: 0,
            connected_at: Some(0),
            bytes_sent: 0,
            bytes_received: 0,
            channel_open: state == PeerState::Connected,
        }
    }

    fn discovered(id: &str, last_seen: u64) -> DiscoveredPeer {
        DiscoveredPeer {
            peer_id: PeerId::from(id),
            user_id: UserId::from("u"),
            profile: PeerProfile {
                display_name: Some(format!("{} node", id)),
                ..Default::default()
            },
            last_seen,
            available_content: BTreeSet::new(),
            health_status: None,
        }
    }

    fn source() -> NodeDashboardSource {
        let mut stats = P2PStats {
            status: NodeStatus::Online,
            connection_attempts: 4,
            failed_connection_attempts: 1,
            bytes_uploaded: 3_000,
            bytes_downloaded: 7_000,
            uptime_ms: 10_000,
            ..Default::default()
        };
        stats.rendezvous.attempts = 5;
        stats.rendezvous.successes = 4;
        stats.transport.relay_sent = 3;
        stats.transport.relay_queued = 1;

        NodeDashboardSource {
            now: 100_000,
            peer_id: PeerId::from("me"),
            stats,
            peers: vec![
                peer("p1", PeerState::Connected, 90_000, Some(40)),
                peer("p2", PeerState::Connected, 99_000, Some(1_500)),
                peer("p3", PeerState::Disconnected, 95_000, None),
                peer("p4", PeerState::Connected, 80_000, None),
            ],
            discovered: vec![discovered("p1", 95_000), discovered("p9", 10_000)],
            blocklist: vec![
                BlocklistEntry {
                    peer_id: PeerId::from("p9"),
                    direction: BlockDirection::All,
                    reason: None,
                    added_at: 1,
                },
                BlocklistEntry {
                    peer_id: PeerId::from("p9"),
                    direction: BlockDirection::Inbound,
                    reason: None,
                    added_at: 2,
                },
            ],
            online_ttl_ms: 30_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_derived_rates() {
        let snapshot = build_node_dashboard_snapshot(&source());

        assert_eq!(snapshot.failure_rate, 0.25);
        assert_eq!(snapshot.rendezvous_success_rate, 0.8);
        // (3000 + 7000) bytes * 8 / 10s / 1000
        assert_eq!(snapshot.bandwidth_kbps, 8.0);
        assert_eq!(snapshot.transport.queued_ratio, 0.25);
    }

    #[test]
    fn test_health_and_mesh_strength() {
        let snapshot = build_node_dashboard_snapshot(&source());

        assert_eq!(snapshot.health.total, 4);
        assert_eq!(snapshot.health.healthy, 2);
        assert_eq!(snapshot.health.degraded, 1);
        assert_eq!(snapshot.health.unhealthy, 1);
        assert_eq!(snapshot.mesh_strength, 0.5);
        assert_eq!(snapshot.health.avg_rtt_ms, Some(770.0));
    }

    #[test]
    fn test_lists_sorted_by_activity() {
        let snapshot = build_node_dashboard_snapshot(&source());

        let order: Vec<&str> = snapshot.peers.iter().map(|p| p.peer_id.as_str()).collect();
        assert_eq!(order, vec!["p2", "p3", "p1", "p4"]);
        assert_eq!(snapshot.peers[2].display_name.as_deref(), Some("p1 node"));

        assert_eq!(snapshot.discovered[0].peer_id, PeerId::from("p1"));
        assert!(snapshot.discovered[0].online);
        assert!(snapshot.discovered[0].connected);
        assert!(!snapshot.discovered[1].online);
        assert!(snapshot.discovered[1].blocked);
        assert_eq!(snapshot.online_now, 1);
    }

    #[test]
    fn test_blocked_counts() {
        let snapshot = build_node_dashboard_snapshot(&source());
        assert_eq!(
            snapshot.blocked,
            BlockedCounts { inbound: 1, outbound: 0, all: 1, peers: 1 }
        );
    }

    #[test]
    fn test_empty_source_has_zero_rates() {
        let snapshot = build_node_dashboard_snapshot(&NodeDashboardSource::default());

        assert_eq!(snapshot.failure_rate, 0.0);
        assert_eq!(snapshot.rendezvous_success_rate, 0.0);
        assert_eq!(snapshot.bandwidth_kbps, 0.0);
        assert_eq!(snapshot.mesh_strength, 0.0);
        assert!(snapshot.health.avg_rtt_ms.is_none());
    }

    #[test]
    fn test_deterministic() {
        let source = source();
        assert_eq!(
            build_node_dashboard_snapshot(&source),
            build_node_dashboard_snapshot(&source)
        );
    }
}
