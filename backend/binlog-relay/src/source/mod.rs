//! Replication change sources.

use async_trait::async_trait;

use crate::checkpoint::CheckpointMarker;
use crate::error::RelayResult;
use crate::event::RawRecord;

mod binlog;

pub use binlog::{BinlogSourceOptions, MysqlBinlogSource};

/// Opens change streams at a given log position.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Start streaming from `resume`. An incomplete marker lets the server pick its
    /// current position.
    async fn open(&self, resume: &CheckpointMarker) -> RelayResult<Box<dyn ChangeStream>>;
}

/// An open, ordered stream of decoded records.
#[async_trait]
pub trait ChangeStream: Send {
    /// Next record, or `Ok(None)` once the source has nothing more to send.
    async fn next(&mut self) -> RelayResult<Option<RawRecord>>;

    /// Release the replication connection. Calling it twice is a no-op.
    async fn close(&mut self) -> RelayResult<()>;
}
