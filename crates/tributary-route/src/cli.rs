//! `trib-route` command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cluster_lock::{ClusterLockService, ACTIONS, COMMON_LOCK_ID};
use crate::config::RouteConfig;
use crate::current_time_ms;
use crate::gap_registry::{GapRegistry, SqlGapRegistry};
use crate::job::{JobRunner, LockedJob, PurgeJob, RouteJob};
use crate::router::{RouterService, SqlBatchSink};
use crate::statistics::ChannelStatistics;

const DEFAULT_CONFIG: &str = "/etc/tributary/route.toml";

/// Command line of the routing server.
#[derive(Parser)]
#[command(name = "trib-route")]
#[command(about = "Tributary change-log router", long_about = None)]
pub struct Cli {
    /// Print listings as JSON and log in JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the route and purge jobs until interrupted.
    Serve {
        /// Configuration file (.toml or .json).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Run one routing pass.
    Route {
        /// Configuration file (.toml or .json).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Route even if another server holds the route lock.
        #[arg(long)]
        force: bool,
    },
    /// List the cluster lock rows.
    Locks {
        /// Configuration file (.toml or .json).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Stop an action on every server until it is resumed.
    Stop {
        /// Action key, e.g. ROUTE or PURGE.
        action: String,
        /// Configuration file (.toml or .json).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Lock id of the action.
        #[arg(long, default_value = COMMON_LOCK_ID)]
        lock_id: String,
    },
    /// Lift a stop placed with `stop`.
    Resume {
        /// Action key, e.g. ROUTE or PURGE.
        action: String,
        /// Configuration file (.toml or .json).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Lock id of the action.
        #[arg(long, default_value = COMMON_LOCK_ID)]
        lock_id: String,
    },
    /// List the data gaps.
    Gaps {
        /// Configuration file (.toml or .json).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// List recent outgoing batches.
    Batches {
        /// Configuration file (.toml or .json).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Number of batches shown.
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Purge consumed staged payloads and abandoned writes once.
    Purge {
        /// Configuration file (.toml or .json).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

/// Load `path`, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<RouteConfig> {
    if path.exists() {
        Ok(RouteConfig::from_file(path)?)
    } else {
        warn!("Config file not found, using defaults: {}", path.display());
        Ok(RouteConfig::default())
    }
}

/// Place or lift an operator stop on `action`. Returns false when there was
/// nothing to change.
pub fn set_stopped(service: &ClusterLockService, action: &str, lock_id: &str, stopped: bool) -> Result<bool> {
    let action = action.to_ascii_uppercase();
    if !ACTIONS.contains(&action.as_str()) {
        bail!("unknown action {action}, expected one of {}", ACTIONS.join(", "));
    }
    if stopped {
        Ok(service.acquire_infinite(&action, lock_id)?)
    } else {
        Ok(service.clear_infinite(&action, lock_id)?)
    }
}

fn format_time(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl Cli {
    /// Execute the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve { ref config } => self.serve(config).await,
            Command::Route { ref config, force } => self.route(config, force).await,
            Command::Locks { ref config } => self.locks(config),
            Command::Stop {
                ref config,
                ref action,
                ref lock_id,
            } => self.stop(config, action, lock_id, true),
            Command::Resume {
                ref config,
                ref action,
                ref lock_id,
            } => self.stop(config, action, lock_id, false),
            Command::Gaps { ref config } => self.gaps(config),
            Command::Batches { ref config, limit } => self.batches(config, limit),
            Command::Purge { ref config } => self.purge(config),
        }
    }

    async fn serve(&self, config_path: &Path) -> Result<()> {
        let config = load_config(config_path)?;
        let route_interval = Duration::from_millis(config.route_interval_ms.max(1));
        let purge_interval = Duration::from_millis(config.purge_interval_ms.max(1));
        let statistics = Arc::new(ChannelStatistics::new());
        let router = RouterService::from_config(config)?.with_statistics(statistics.clone());
        let router = Arc::new(router);
        info!(
            server_id = router.locks().server_id(),
            node_id = %router.config().node_id,
            "routing server starting"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let route_job = Arc::new(RouteJob::new(Arc::clone(&router)));
        let purge_job = Arc::new(LockedJob::new(
            PurgeJob::new(Arc::clone(router.staging())),
            Arc::clone(router.locks()),
        ));
        let route_handle = JobRunner::spawn(route_job, route_interval, shutdown_rx.clone());
        let purge_handle = JobRunner::spawn(purge_job, purge_interval, shutdown_rx);

        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        shutdown_tx.send(true)?;
        route_handle.await?;
        purge_handle.await?;

        tracing::debug!(metrics = %statistics.format_prometheus(), "final routing statistics");
        Ok(())
    }

    async fn route(&self, config_path: &Path, force: bool) -> Result<()> {
        let router = RouterService::from_config(load_config(config_path)?)?;
        let routed = router.route_data(force).await?;
        if self.json {
            print_json(&serde_json::json!({ "routed": routed }))
        } else {
            println!("Routed {routed} rows");
            Ok(())
        }
    }

    fn lock_table(config_path: &Path) -> Result<(RouteConfig, ClusterLockService)> {
        let config = load_config(config_path)?;
        let db = crate::db::Database::open(&config.database_path)?;
        db.install_schema()?;
        let service = ClusterLockService::new(
            db,
            &config.resolve_server_id(),
            config.cluster_lock_timeout_ms,
            config.cluster_lock_refresh_ms,
        );
        Ok((config, service))
    }

    fn stop(&self, config_path: &Path, action: &str, lock_id: &str, stopped: bool) -> Result<()> {
        let (config, service) = Self::lock_table(config_path)?;
        if !config.cluster_locking_enabled {
            warn!("cluster locking is disabled, servers with this config ignore the lock table");
        }
        let changed = set_stopped(&service, action, lock_id, stopped)?;
        let state = if stopped { "stopped" } else { "resumed" };
        if self.json {
            return print_json(&serde_json::json!({
                "action": action.to_ascii_uppercase(),
                "lock_id": lock_id,
                "state": state,
                "changed": changed,
            }));
        }
        if changed {
            println!("{} {state}", action.to_ascii_uppercase());
        } else {
            println!("{} was not changed", action.to_ascii_uppercase());
        }
        Ok(())
    }

    fn locks(&self, config_path: &Path) -> Result<()> {
        let (_, service) = Self::lock_table(config_path)?;
        let rows = service.find_locks()?;
        if self.json {
            return print_json(&rows);
        }

        println!(
            "{:<12} {:<10} {:<20} {:<20} {:<20} {:<20}",
            "ACTION", "LOCK ID", "HOLDER", "LOCKED AT", "LAST HOLDER", "LAST LOCKED AT"
        );
        println!("{}", "-".repeat(107));
        for row in rows {
            println!(
                "{:<12} {:<10} {:<20} {:<20} {:<20} {:<20}",
                row.lock_action,
                row.lock_id,
                row.locking_server_id.as_deref().unwrap_or("-"),
                format_time(row.lock_time_ms),
                row.last_locking_server_id.as_deref().unwrap_or("-"),
                format_time(row.last_lock_time_ms),
            );
        }
        Ok(())
    }

    fn gaps(&self, config_path: &Path) -> Result<()> {
        let config = load_config(config_path)?;
        let db = crate::db::Database::open(&config.database_path)?;
        db.install_schema()?;
        let gaps = SqlGapRegistry::new(db, config.stale_gap_timeout_ms).find_gaps()?;
        if self.json {
            return print_json(&gaps);
        }

        let now = current_time_ms();
        println!("{:<24} {:>14} {:>12}", "RANGE", "SIZE", "AGE (s)");
        println!("{}", "-".repeat(52));
        for gap in gaps {
            let size = if gap.is_open_ended() {
                "open".to_string()
            } else {
                gap.size().to_string()
            };
            println!(
                "{:<24} {:>14} {:>12}",
                gap.to_string(),
                size,
                (now - gap.create_time_ms) / 1000
            );
        }
        Ok(())
    }

    fn batches(&self, config_path: &Path, limit: usize) -> Result<()> {
        let config = load_config(config_path)?;
        let db = crate::db::Database::open(&config.database_path)?;
        db.install_schema()?;
        let batches = SqlBatchSink::new(db).recorded(limit)?;
        if self.json {
            return print_json(&batches);
        }

        println!(
            "{:>10} {:<10} {:<12} {:<6} {:>8} {:<20}",
            "BATCH", "NODE", "CHANNEL", "STATUS", "ROWS", "CREATED"
        );
        println!("{}", "-".repeat(71));
        for b in batches {
            println!(
                "{:>10} {:<10} {:<12} {:<6} {:>8} {:<20}",
                b.batch_id,
                b.node_id,
                b.channel_id,
                b.status,
                b.data_event_count,
                format_time(Some(b.create_time_ms)),
            );
        }
        Ok(())
    }

    fn purge(&self, config_path: &Path) -> Result<()> {
        let config = load_config(config_path)?;
        let staging = tributary_stage::StagingManager::new(
            config.staging_dir.clone(),
            config.staging_threshold_bytes,
            config.staging_ttl_ms,
        )?;
        let purged = staging.purge(current_time_ms())?;
        if self.json {
            print_json(&serde_json::json!({ "purged": purged }))
        } else {
            println!("Purged {purged} staged resources");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_force() {
        let cli = Cli::try_parse_from(["trib-route", "route", "--config", "/tmp/r.toml", "--force"]).unwrap();
        match cli.command {
            Command::Route { config, force } => {
                assert_eq!(config, PathBuf::from("/tmp/r.toml"));
                assert!(force);
            }
            _ => panic!("expected route"),
        }
        assert!(!cli.json);
    }

    #[test]
    fn test_global_json_flag() {
        let cli = Cli::try_parse_from(["trib-route", "locks", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Locks { ref config } if config == Path::new(DEFAULT_CONFIG)));
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/tributary/route.toml")).unwrap();
        assert_eq!(config.peek_ahead_window, RouteConfig::default().peek_ahead_window);
    }

    #[test]
    fn test_parse_stop_and_resume() {
        let cli = Cli::try_parse_from(["trib-route", "stop", "purge", "-c", "/tmp/r.toml"]).unwrap();
        match cli.command {
            Command::Stop { action, config, lock_id } => {
                assert_eq!(action, "purge");
                assert_eq!(config, PathBuf::from("/tmp/r.toml"));
                assert_eq!(lock_id, COMMON_LOCK_ID);
            }
            _ => panic!("expected stop"),
        }
        let cli = Cli::try_parse_from(["trib-route", "resume", "ROUTE", "--lock-id", "west"]).unwrap();
        assert!(matches!(cli.command, Command::Resume { ref lock_id, .. } if lock_id == "west"));
    }

    #[test]
    fn test_set_stopped_blocks_until_resumed() {
        let db = crate::db::Database::open_in_memory().unwrap();
        let operator = ClusterLockService::new(db.clone(), "operator", 60_000, 30_000);
        let server = ClusterLockService::new(db, "server-a", -1, 30_000);
        server.init().unwrap();

        assert!(set_stopped(&operator, "route", COMMON_LOCK_ID, true).unwrap());
        assert!(!server.try_acquire(crate::cluster_lock::ROUTE, COMMON_LOCK_ID).unwrap());
        assert!(set_stopped(&operator, "route", COMMON_LOCK_ID, false).unwrap());
        assert!(!set_stopped(&operator, "route", COMMON_LOCK_ID, false).unwrap());
        assert!(server.try_acquire(crate::cluster_lock::ROUTE, COMMON_LOCK_ID).unwrap());
        assert!(set_stopped(&operator, "reroute", COMMON_LOCK_ID, true).is_err());
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(None), "-");
        assert_eq!(format_time(Some(0)), "1970-01-01 00:00:00");
    }
}
