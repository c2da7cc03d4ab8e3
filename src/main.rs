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

use anyhow::{Context, Result};
use flux_node::config::NodeConfig;
use flux_node::content::MemoryContentStore;
use flux_node::identity::NodeIdentity;
use flux_node::rtc::LoopbackNetwork;
use flux_node::signaling::LocalBus;
use flux_node::storage::{StateStore, Storage};
use flux_node::types::UserId;
use flux_node::{ManagerParts, P2PManager};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    // Log to a file so stdout stays free for the embedding process
    let log_file = std::fs::File::create(config.log_path()).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("flux_node=info".parse()?))
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .init();

    tracing::info!("Starting Flux node...");

    let db_path = config.database_path();
    tracing::info!("Database path: {:?}", db_path);
    let storage: Arc<dyn StateStore> = Arc::new(Storage::new(&db_path).await?);

    let identity =
        NodeIdentity::load_or_generate(storage.as_ref(), UserId::from(config.user_id.clone())).await?;
    tracing::info!("Peer ID: {}", identity.peer_id());
    tracing::info!("User ID: {}", identity.user_id());

    // In-process RTC: peers sharing this process connect directly
    let network = LoopbackNetwork::new();
    let parts = ManagerParts {
        store: storage,
        backend: Arc::new(network.backend(identity.peer_id().as_str())),
        content: Arc::new(MemoryContentStore::new()),
        local_bus: Some(LocalBus::new()),
    };

    let manager = P2PManager::new(identity, config, parts).await;
    manager.start().await;

    let mut stats = manager.subscribe_to_stats();
    let mut report = tokio::time::interval(STATS_LOG_INTERVAL);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }

            _ = report.tick() => {
                let current = stats.borrow_and_update().clone();
                tracing::info!(
                    "Status {}: {} connected, {} discovered, {} attempts ({} failed)",
                    current.status.as_str(),
                    current.connected_peers,
                    current.discovered_peers,
                    current.connection_attempts,
                    current.failed_connection_attempts
                );
            }
        }
    }

    tracing::info!("Flux node shutting down...");
    manager.stop().await;

    Ok(())
}
