use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{debug, warn};

use super::SinkClient;
use crate::error::{RelayError, RelayResult};

/// Kafka-backed sink: every record becomes one message on a single topic.
///
/// Messages carry no key; ordering across partitions is not preserved, which the relay
/// does not promise anyway.
pub struct KafkaSinkClient {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaSinkClient {
    /// Create a client from an existing producer.
    ///
    /// The producer should be configured with `enable.idempotence = true` and
    /// `acks = all` so a retried send cannot duplicate a message broker-side.
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            delivery_timeout: Duration::from_secs(30),
        }
    }

    /// Build an idempotent producer for `brokers`.
    pub fn connect(brokers: &str, topic: impl Into<String>) -> RelayResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("compression.type", "lz4")
            .set("linger.ms", "20")
            .create()
            .map_err(|e| RelayError::DeliveryFailed(format!("Kafka producer setup failed: {}", e)))?;

        Ok(Self::new(producer, topic))
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl SinkClient for KafkaSinkClient {
    async fn submit_batch(&self, records: Vec<Vec<u8>>) -> RelayResult<usize> {
        let submitted = records.len();

        let sends = records.iter().map(|payload| {
            let record = FutureRecord::<(), [u8]>::to(&self.topic).payload(payload.as_slice());
            self.producer.send(record, self.delivery_timeout)
        });

        let mut accepted = 0;
        let mut last_error = None;
        for result in join_all(sends).await {
            match result {
                Ok(_) => accepted += 1,
                Err((err, _)) => {
                    warn!(topic = %self.topic, error = %err, "Kafka rejected record");
                    last_error = Some(err);
                }
            }
        }

        if accepted == 0 {
            if let Some(err) = last_error {
                return Err(RelayError::DeliveryFailed(format!(
                    "Kafka publish failed for all {} records: {}",
                    submitted, err
                )));
            }
        }

        debug!(topic = %self.topic, accepted, submitted, "Kafka batch acknowledged");
        Ok(accepted)
    }
}
