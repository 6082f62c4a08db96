//! S3-backed checkpoint storage
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, error};

use super::CheckpointBackend;
use crate::error::{RelayError, RelayResult};

/// Stores checkpoint blobs as objects in one bucket.
#[derive(Clone)]
pub struct S3CheckpointBackend {
    client: Client,
    bucket: String,
}

impl S3CheckpointBackend {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client for `region` from the ambient AWS credentials chain.
    pub async fn from_env(region: &str, bucket: impl Into<String>) -> Self {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;

        Self::new(Client::new(&aws_config), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl CheckpointBackend for S3CheckpointBackend {
    async fn get(&self, key: &str) -> RelayResult<Option<Vec<u8>>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error().map_or(false, |se| se.is_no_such_key()) {
                    debug!(bucket = %self.bucket, key = %key, "Checkpoint object does not exist");
                    return Ok(None);
                }
                error!(bucket = %self.bucket, key = %key, error = %e, "Failed to fetch checkpoint");
                return Err(RelayError::CheckpointStorage(format!(
                    "get s3://{}/{}: {}",
                    self.bucket, key, e
                )));
            }
        };

        let body = response
            .body
            .collect()
            .await
            .context("Failed to read checkpoint object body")?;

        Ok(Some(body.into_bytes().to_vec()))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> RelayResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                RelayError::CheckpointStorage(format!("put s3://{}/{}: {}", self.bucket, key, e))
            })?;

        Ok(())
    }
}
