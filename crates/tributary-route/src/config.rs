//! Routing configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::batch_algorithm::BatchAlgorithm;
use crate::error::{RouteError, RouteResult};
use crate::model::ChannelPolicy;

/// Environment variable consulted for the cluster server id.
pub const SERVER_ID_ENV: &str = "TRIBUTARY_SERVER_ID";

/// Configuration of a routing server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// DuckDB database file, or `:memory:`.
    pub database_path: String,
    /// Identity of this server in the cluster lock table.
    pub server_id: Option<String>,
    /// Root of the staging directory.
    pub staging_dir: PathBuf,
    /// Payload size above which staged resources spill to disk.
    pub staging_threshold_bytes: u64,
    /// Age after which an abandoned staged write is purged.
    pub staging_ttl_ms: i64,
    /// Reader peek-ahead depth and queue capacity.
    pub peek_ahead_window: usize,
    /// Number of gaps spelled out in the reader query.
    pub max_gaps_to_qualify_in_sql: usize,
    /// Gap count above which the reader selects `data_id >= first gap start`.
    pub gaps_to_use_greater_query: usize,
    /// How long the router waits for the reader to hand over a row.
    pub wait_for_data_timeout_secs: u64,
    /// When false, locks are kept in process instead of the lock table.
    pub cluster_locking_enabled: bool,
    /// Lease after which a held lock may be taken over.
    pub cluster_lock_timeout_ms: i64,
    /// Age after which a long-held lock is refreshed.
    pub cluster_lock_refresh_ms: i64,
    /// Age after which an empty, closed gap is dropped.
    pub stale_gap_timeout_ms: i64,
    /// Route job period.
    pub route_interval_ms: u64,
    /// Purge job period.
    pub purge_interval_ms: u64,
    /// Identity of this node.
    pub node_id: String,
    /// Nodes changes are routed to.
    pub target_nodes: Vec<String>,
    /// Channel policies.
    pub channels: Vec<ChannelPolicy>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            database_path: String::from(":memory:"),
            server_id: None,
            staging_dir: PathBuf::from("/var/lib/tributary/staging"),
            staging_threshold_bytes: 262_144,
            staging_ttl_ms: 3_600_000,
            peek_ahead_window: 1000,
            max_gaps_to_qualify_in_sql: 100,
            gaps_to_use_greater_query: 100,
            wait_for_data_timeout_secs: 330,
            cluster_locking_enabled: true,
            cluster_lock_timeout_ms: 1_800_000,
            cluster_lock_refresh_ms: 1_200_000,
            stale_gap_timeout_ms: 1_200_000,
            route_interval_ms: 10_000,
            purge_interval_ms: 60_000,
            node_id: String::from("000"),
            target_nodes: Vec::new(),
            channels: vec![
                ChannelPolicy::new("default"),
                ChannelPolicy::new("reload")
                    .with_max_batch_size(1)
                    .with_algorithm(BatchAlgorithm::Transactional),
            ],
        }
    }
}

impl RouteConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> RouteResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RouteConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| RouteError::Config { msg: e.to_string() })?,
            "json" => serde_json::from_str(&contents).map_err(|e| RouteError::Config { msg: e.to_string() })?,
            _ => {
                return Err(RouteError::Config {
                    msg: format!("unsupported config file extension: {ext}"),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the router cannot run with.
    pub fn validate(&self) -> RouteResult<()> {
        if self.peek_ahead_window == 0 {
            return Err(RouteError::Config {
                msg: "peek_ahead_window must be at least 1".to_string(),
            });
        }
        if self.max_gaps_to_qualify_in_sql == 0 {
            return Err(RouteError::Config {
                msg: "max_gaps_to_qualify_in_sql must be at least 1".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if channel.max_batch_size == 0 {
                return Err(RouteError::Config {
                    msg: format!("channel {} has max_batch_size 0", channel.channel_id),
                });
            }
            if !seen.insert(channel.channel_id.as_str()) {
                return Err(RouteError::Config {
                    msg: format!("channel {} is configured twice", channel.channel_id),
                });
            }
        }
        Ok(())
    }

    /// Look up a channel policy.
    pub fn channel(&self, channel_id: &str) -> RouteResult<&ChannelPolicy> {
        self.channels
            .iter()
            .find(|c| c.channel_id == channel_id)
            .ok_or_else(|| RouteError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            })
    }

    /// Consumer take timeout.
    pub fn wait_for_data_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_for_data_timeout_secs)
    }

    /// Server id for the cluster lock table: the configured value, then
    /// `TRIBUTARY_SERVER_ID`, then `HOSTNAME`, then `"unknown"`.
    pub fn resolve_server_id(&self) -> String {
        let server_id = self
            .server_id
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var(SERVER_ID_ENV).ok().filter(|s| !s.is_empty()))
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "unknown".to_string());
        info!(server_id = %server_id, "resolved cluster server id");
        server_id
    }
}
