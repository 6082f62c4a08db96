//! Startup position resolution.
//!
//! The source database is the authority on which log files still exist. A saved
//! checkpoint is only trusted when it points into the file the server is currently
//! writing; anything else restarts from the server's current position and accepts the
//! gap in between.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Executor, Row};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointMarker;
use crate::error::RelayResult;

/// Source of the database's current authoritative log position.
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn current_position(&self) -> RelayResult<CheckpointMarker>;
}

/// Decide where a new run resumes.
///
/// Returns `saved` only when it is complete and names the same file as `authoritative`.
pub fn reconcile(authoritative: &CheckpointMarker, saved: &CheckpointMarker) -> CheckpointMarker {
    if !saved.is_complete() || saved.log_file != authoritative.log_file {
        if saved.is_complete() {
            warn!(
                saved = %saved,
                current = %authoritative,
                "Saved checkpoint names a different log file, resuming from current position"
            );
        }
        return authoritative.clone();
    }

    saved.clone()
}

/// Reads the binary log status of a MySQL server.
pub struct MySqlPositionSource {
    pool: MySqlPool,
}

impl MySqlPositionSource {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Open a single-connection pool; the status query runs once per process.
    pub async fn connect(options: MySqlConnectOptions) -> RelayResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    fn marker_from_row(row: Option<MySqlRow>) -> RelayResult<CheckpointMarker> {
        match row {
            Some(row) => {
                let file: String = row.try_get("File")?;
                let pos: u64 = row.try_get("Position")?;
                Ok(CheckpointMarker::at(file, pos))
            }
            None => {
                warn!("Binary logging appears disabled, no master status available");
                Ok(CheckpointMarker::default())
            }
        }
    }
}

#[async_trait]
impl PositionSource for MySqlPositionSource {
    async fn current_position(&self) -> RelayResult<CheckpointMarker> {
        // Text protocol: SHOW statements are not preparable on every server version.
        let row = match self.pool.fetch_optional("SHOW MASTER STATUS").await {
            Ok(row) => row,
            Err(e) => {
                // MySQL 8.4 removed the MASTER spelling.
                debug!(error = %e, "SHOW MASTER STATUS failed, trying SHOW BINARY LOG STATUS");
                self.pool.fetch_optional("SHOW BINARY LOG STATUS").await?
            }
        };

        let marker = Self::marker_from_row(row)?;
        info!(current = %marker, "Fetched master status");
        Ok(marker)
    }
}
