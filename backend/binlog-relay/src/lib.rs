//! # Binlog Relay
//!
//! Relays row-level change events from a MySQL binary log to a batched delivery sink and
//! keeps a resumable checkpoint of how far it has read.
//!
//! ## Pipeline
//!
//! 1. On startup the saved checkpoint is reconciled against the server's current log
//!    position ([`position::reconcile`]); a checkpoint pointing into a log file the server
//!    has moved past is discarded in favor of the current position.
//! 2. The change stream is opened there and every record is normalized into a
//!    [`ChangeEvent`].
//! 3. Each event's position is queued as a checkpoint candidate, and row mutations plus
//!    table metadata are queued for the sink.
//! 4. Two independent [`scheduler::PeriodicTask`]s drain those queues: one ships batches of
//!    at most 500 records to the sink, the other persists the newest checkpoint.
//!
//! ## Delivery guarantees
//!
//! The two drains are not coordinated. A checkpoint can be persisted for events whose sink
//! batch is still in flight (or later fails), and a batch can be delivered before its
//! checkpoint is written. Failed batches are logged and dropped. Data still queued when the
//! relay stops is abandoned. The relay therefore provides **at-most-once** delivery with a
//! loss window of roughly one flush interval per stop or failure, plus possible duplicates
//! of up to one checkpoint interval after a restart.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use binlog_relay::checkpoint::{CheckpointStore, S3CheckpointBackend};
//! use binlog_relay::position::MySqlPositionSource;
//! use binlog_relay::sink::{KafkaSinkClient, SinkBatcher};
//! use binlog_relay::source::{BinlogSourceOptions, MysqlBinlogSource};
//! use binlog_relay::{Relay, RelayConfig};
//!
//! async fn relay(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = S3CheckpointBackend::from_env(&config.aws_region, &config.checkpoint_bucket).await;
//!     let checkpoints = Arc::new(CheckpointStore::new(Arc::new(backend), &config.checkpoint_key));
//!
//!     let kafka = KafkaSinkClient::connect(&config.kafka_brokers, &config.kafka_topic)?;
//!     let sink = Arc::new(SinkBatcher::new(Arc::new(kafka), config.max_workers, config.sink_max_batch_size));
//!
//!     let positions = MySqlPositionSource::connect(config.mysql_connect_options()).await?;
//!     let source = MysqlBinlogSource::new(BinlogSourceOptions {
//!         host: config.mysql_host.clone(),
//!         port: config.mysql_port,
//!         user: config.mysql_user.clone(),
//!         password: config.mysql_password.clone(),
//!         server_id: config.replication_server_id,
//!         heartbeat: Duration::from_secs(30),
//!     });
//!
//!     let summary = Relay::new(Arc::new(source), Arc::new(positions), checkpoints, sink)
//!         .with_flush_intervals(config.sink_flush_interval(), config.checkpoint_flush_interval())
//!         .run(async { let _ = tokio::signal::ctrl_c().await; })
//!         .await?;
//!
//!     println!("consumed {} events", summary.events);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod position;
pub mod relay;
pub mod scheduler;
pub mod sink;
pub mod source;

pub use checkpoint::{CheckpointBackend, CheckpointMarker, CheckpointStore};
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use event::{ChangeEvent, EventKind, EventNormalizer, RawRecord};
pub use metrics::RelayMetrics;
pub use relay::{Relay, RelayState, RunSummary, StreamEnd};
pub use sink::{FlushOutcome, SinkBatcher, SinkClient};
