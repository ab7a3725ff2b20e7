#![warn(missing_docs)]

//! Tributary routing subsystem: gapped change-log reader, batch routing and cluster lock
//!
//! Captured row changes land in an append-only change log whose ids are
//! allocated before their transactions commit. The router reads only the id
//! ranges not yet confirmed as routed (the gaps), keeps the rows of one
//! transaction together, writes them into per-node outgoing batches staged
//! through `tributary-stage`, and confirms what it routed so the gaps shrink.
//! A lock-table row per action keeps one server routing at a time.

pub mod batch;
pub mod batch_algorithm;
pub mod cli;
pub mod cluster_lock;
pub mod config;
pub mod context;
pub mod data_router;
pub mod db;
pub mod error;
pub mod gap_registry;
pub mod job;
pub mod model;
pub mod reader;
pub mod router;
pub mod statistics;

pub use batch::{BatchStatus, ClosedBatch, OutgoingBatch, UNROUTED_NODE_ID};
pub use batch_algorithm::BatchAlgorithm;
pub use cluster_lock::{ClusterLockGuard, ClusterLockRow, ClusterLockService};
pub use config::RouteConfig;
pub use context::{RouteStats, RouterContext};
pub use data_router::{DataRouter, DefaultDataRouter};
pub use db::Database;
pub use error::{RouteError, RouteResult};
pub use gap_registry::{GapRegistry, InMemoryGapRegistry, SqlGapRegistry};
pub use job::{JobRunner, LockedJob, PurgeJob, RouteJob, ScheduledJob};
pub use model::{ChangeRecord, ChannelPolicy, DataGap, EventType, TriggerHistory, OPEN_END_ID};
pub use reader::{PeekAheadReader, ReaderHandle, ReaderSettings, ReaderStats};
pub use router::{BatchSink, CollectingBatchSink, RouterService, SqlBatchSink};
pub use statistics::{ChannelStatistics, StatisticsSink};
pub use tributary_stage::current_time_ms;
