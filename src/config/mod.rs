use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default STUN server handed to the RTC backend
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Node configuration
///
/// Every field has a default; `from_env` overrides individual fields from
/// `FLUX_*` environment variables and ignores values that fail to parse.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the database and log file
    pub data_dir: PathBuf,
    /// Account the node runs for
    pub user_id: String,
    /// Optional WebSocket relay for signaling
    pub relay_url: Option<String>,
    /// Whether to join the in-process broadcast bus
    pub local_bus: bool,
    pub ice_servers: Vec<String>,
    pub max_retries: u32,
    /// Handshakes still connecting after this long are failed by the control plane
    pub connection_timeout: Duration,
    pub relay_reconnect_delay: Duration,
    /// Stats rebuild cadence while running
    pub poll_interval: Duration,
    pub announce_interval: Duration,
    pub rendezvous_interval: Duration,
    /// Consecutive rendezvous failures before the mesh disables itself
    pub rendezvous_failure_limit: u32,
    pub cleanup_interval: Duration,
    /// Age after which disconnected peers are swept
    pub stale_peer_age: Duration,
    /// Window for the "online now" classification of discovered peers
    pub online_ttl: Duration,
    pub chunk_request_timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Display name sent in announcements
    pub display_name: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            user_id: "anonymous".to_string(),
            relay_url: None,
            local_bus: true,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            max_retries: 3,
            connection_timeout: Duration::from_millis(10_000),
            relay_reconnect_delay: Duration::from_millis(2_000),
            poll_interval: Duration::from_millis(2_000),
            announce_interval: Duration::from_secs(15),
            rendezvous_interval: Duration::from_secs(30),
            rendezvous_failure_limit: 5,
            cleanup_interval: Duration::from_secs(60),
            stale_peer_age: Duration::from_secs(300),
            online_ttl: Duration::from_secs(30),
            chunk_request_timeout: Duration::from_millis(3_000),
            retry_base_delay: Duration::from_millis(1_000),
            retry_max_delay: Duration::from_secs(30),
            display_name: None,
        }
    }
}

impl NodeConfig {
    /// Build a configuration from `FLUX_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("FLUX_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(user) = lookup("FLUX_USER_ID").filter(|v| !v.trim().is_empty()) {
            config.user_id = user.trim().to_string();
        }
        config.relay_url = lookup("FLUX_RELAY_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let Some(enabled) = parse_bool(lookup("FLUX_LOCAL_BUS")) {
            config.local_bus = enabled;
        }
        if let Some(servers) = lookup("FLUX_ICE_SERVERS") {
            let servers: Vec<String> = servers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !servers.is_empty() {
                config.ice_servers = servers;
            }
        }
        if let Some(retries) = parse(lookup("FLUX_MAX_RETRIES")) {
            config.max_retries = retries;
        }
        if let Some(ms) = parse::<u64>(lookup("FLUX_CONNECTION_TIMEOUT_MS")) {
            config.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(lookup("FLUX_POLL_INTERVAL_MS")).filter(|ms| *ms > 0) {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(lookup("FLUX_RENDEZVOUS_INTERVAL_MS")).filter(|ms| *ms > 0) {
            config.rendezvous_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(lookup("FLUX_CHUNK_TIMEOUT_MS")) {
            config.chunk_request_timeout = Duration::from_millis(ms);
        }
        config.display_name = lookup("FLUX_DISPLAY_NAME")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        config
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("flux.db")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("flux.log")
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: Option<String>) -> Option<bool> {
    match value?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.connection_timeout, Duration::from_millis(10_000));
        assert_eq!(config.relay_reconnect_delay, Duration::from_millis(2_000));
        assert_eq!(config.poll_interval, Duration::from_millis(2_000));
        assert_eq!(config.stale_peer_age, Duration::from_secs(300));
        assert!(config.local_bus);
    }

    #[test]
    fn test_overrides() {
        let config = NodeConfig::from_lookup(lookup_from(&[
            ("FLUX_USER_ID", "alice"),
            ("FLUX_RELAY_URL", "ws://localhost:8787"),
            ("FLUX_LOCAL_BUS", "off"),
            ("FLUX_ICE_SERVERS", "stun:a, stun:b ,"),
            ("FLUX_MAX_RETRIES", "5"),
            ("FLUX_POLL_INTERVAL_MS", "500"),
        ]));

        assert_eq!(config.user_id, "alice");
        assert_eq!(config.relay_url.as_deref(), Some("ws://localhost:8787"));
        assert!(!config.local_bus);
        assert_eq!(config.ice_servers, vec!["stun:a", "stun:b"]);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = NodeConfig::from_lookup(lookup_from(&[
            ("FLUX_MAX_RETRIES", "many"),
            ("FLUX_POLL_INTERVAL_MS", "0"),
            ("FLUX_LOCAL_BUS", "maybe"),
            ("FLUX_RELAY_URL", "  "),
        ]));

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(2_000));
        assert!(config.local_bus);
        assert!(config.relay_url.is_none());
    }
}
