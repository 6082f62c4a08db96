//! Relay configuration loaded from the environment.

use std::time::Duration;

use serde::Deserialize;
use sqlx::mysql::MySqlConnectOptions;

use crate::error::{RelayError, RelayResult};
use crate::event::EventNormalizer;
use crate::sink::DEFAULT_MAX_BATCH_SIZE;

pub const DEFAULT_CHECKPOINT_KEY: &str = "binlog-relay/checkpoint.json";

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub mysql_host: String,
    #[serde(default = "default_mysql_port")]
    pub mysql_port: u16,
    pub mysql_user: String,
    #[serde(default)]
    pub mysql_password: String,
    #[serde(default = "default_heartbeat_secs")]
    pub mysql_heartbeat_secs: u64,
    /// Must be unique among the replicas of the source server.
    pub replication_server_id: u32,

    pub aws_region: String,
    pub checkpoint_bucket: String,
    #[serde(default = "default_checkpoint_key")]
    pub checkpoint_key: String,

    pub kafka_brokers: String,
    pub kafka_topic: String,

    #[serde(default = "default_sink_flush_interval_secs")]
    pub sink_flush_interval_secs: f64,
    #[serde(default = "default_checkpoint_flush_interval_secs")]
    pub checkpoint_flush_interval_secs: f64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_sink_max_batch_size")]
    pub sink_max_batch_size: usize,
    #[serde(default = "default_protected_schemas")]
    pub protected_schemas: Vec<String>,
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_checkpoint_key() -> String {
    DEFAULT_CHECKPOINT_KEY.to_string()
}

fn default_sink_flush_interval_secs() -> f64 {
    1.0
}

fn default_checkpoint_flush_interval_secs() -> f64 {
    5.0
}

fn default_max_workers() -> usize {
    4
}

fn default_sink_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_protected_schemas() -> Vec<String> {
    vec![EventNormalizer::DEFAULT_PROTECTED_SCHEMA.to_string()]
}

impl RelayConfig {
    /// Load `.env` if present, then read and validate the process environment.
    pub fn from_env() -> RelayResult<Self> {
        dotenv::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        for (name, secs) in [
            ("SINK_FLUSH_INTERVAL_SECS", self.sink_flush_interval_secs),
            ("CHECKPOINT_FLUSH_INTERVAL_SECS", self.checkpoint_flush_interval_secs),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(RelayError::Config(format!(
                    "{} must be a positive number of seconds, got {}",
                    name, secs
                )));
            }
        }

        if self.max_workers == 0 {
            return Err(RelayError::Config("MAX_WORKERS must be at least 1".to_string()));
        }
        if self.sink_max_batch_size == 0 {
            return Err(RelayError::Config(
                "SINK_MAX_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if self.checkpoint_key.trim().is_empty() {
            return Err(RelayError::Config("CHECKPOINT_KEY must not be empty".to_string()));
        }

        Ok(())
    }

    pub fn sink_flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sink_flush_interval_secs)
    }

    pub fn checkpoint_flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.checkpoint_flush_interval_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.mysql_heartbeat_secs)
    }

    /// Connection options for the status query pool.
    pub fn mysql_connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.mysql_host)
            .port(self.mysql_port)
            .username(&self.mysql_user)
            .password(&self.mysql_password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> Vec<(String, String)> {
        [
            ("MYSQL_HOST", "db.internal"),
            ("MYSQL_USER", "replicator"),
            ("MYSQL_PASSWORD", "secret"),
            ("REPLICATION_SERVER_ID", "4242"),
            ("AWS_REGION", "us-east-1"),
            ("CHECKPOINT_BUCKET", "relay-state"),
            ("KAFKA_BROKERS", "kafka:9092"),
            ("KAFKA_TOPIC", "cdc.events"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn load(extra: &[(&str, &str)]) -> Result<RelayConfig, envy::Error> {
        let mut env = base_env();
        env.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        envy::from_iter(env)
    }

    #[test]
    fn test_defaults_applied() {
        let config = load(&[]).unwrap();
        assert_eq!(config.mysql_port, 3306);
        assert_eq!(config.mysql_heartbeat_secs, 30);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.sink_max_batch_size, 500);
        assert_eq!(config.protected_schemas, vec!["auth".to_string()]);
        assert_eq!(config.sink_flush_interval(), Duration::from_secs(1));
        assert_eq!(config.checkpoint_flush_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_and_schema_list() {
        let config = load(&[
            ("SINK_FLUSH_INTERVAL_SECS", "0.25"),
            ("PROTECTED_SCHEMAS", "auth,billing"),
            ("MAX_WORKERS", "8"),
        ])
        .unwrap();

        assert_eq!(config.sink_flush_interval(), Duration::from_millis(250));
        assert_eq!(config.protected_schemas, vec!["auth", "billing"]);
        assert_eq!(config.max_workers, 8);
    }

    #[test]
    fn test_missing_required_variable_fails() {
        let env: Vec<(String, String)> = base_env()
            .into_iter()
            .filter(|(k, _)| k != "KAFKA_TOPIC")
            .collect();
        let err = envy::from_iter::<_, RelayConfig>(env).unwrap_err();
        assert!(RelayError::from(err).to_string().contains("kafka_topic"));
    }

    #[test]
    fn test_validate_rejects_non_positive_interval() {
        let config = load(&[("CHECKPOINT_FLUSH_INTERVAL_SECS", "0")]).unwrap();
        tokio_test::assert_err!(config.validate());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = load(&[("MAX_WORKERS", "0")]).unwrap();
        tokio_test::assert_err!(config.validate());
    }
}
