use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::liveness::LivenessConfig;

/// Indexnode settings, loaded from TOML or JSON. Missing fields take defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexnodeConfig {
    /// Listen address of the HTTP front end.
    pub bind_addr: SocketAddr,
    /// Host address substituted for loopback clients; resolved at startup when unset.
    pub advertised_address: Option<IpAddr>,
    /// Require secure client connections.
    pub secure_mode: bool,
    /// Seconds between liveness pings.
    pub ping_interval_secs: u64,
    /// Consecutive failed pings tolerated before a client is destroyed.
    pub max_ping_failures: u32,
    /// Size of the share refresh worker pool.
    pub refresh_workers: usize,
    /// Timeout for every request to a client.
    pub peer_timeout_secs: u64,
    /// Seconds between statistics snapshots.
    pub stats_interval_secs: u64,
    /// Popular files kept in each snapshot.
    pub popular_files_limit: usize,
    /// Cap on search hits per query.
    pub search_result_limit: usize,
    /// Chat messages retained.
    pub chat_history_limit: usize,
    /// Largest accepted avatar.
    pub max_avatar_bytes: usize,
    /// Aliases with administrator rights.
    pub admins: Vec<String>,
    /// Aliases only local clients may use.
    pub local_only_aliases: Vec<String>,
}

impl Default for IndexnodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 41230)),
            advertised_address: None,
            secure_mode: false,
            ping_interval_secs: 30,
            max_ping_failures: 3,
            refresh_workers: 4,
            peer_timeout_secs: 10,
            stats_interval_secs: 60,
            popular_files_limit: 20,
            search_result_limit: 500,
            chat_history_limit: 200,
            max_avatar_bytes: 256 * 1024,
            admins: Vec::new(),
            local_only_aliases: Vec::new(),
        }
    }
}

impl IndexnodeConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: IndexnodeConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: IndexnodeConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Liveness monitor settings.
    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            probe_timeout: self.peer_timeout(),
            max_failures: self.max_ping_failures,
        }
    }

    /// Per-request client timeout, at least one second.
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.max(1))
    }

    /// Statistics refresh period, at least one second.
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}
