use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use binlog_relay::checkpoint::{CheckpointStore, S3CheckpointBackend};
use binlog_relay::position::MySqlPositionSource;
use binlog_relay::sink::{KafkaSinkClient, SinkBatcher};
use binlog_relay::source::{BinlogSourceOptions, MysqlBinlogSource};
use binlog_relay::{EventNormalizer, Relay, RelayConfig, RelayMetrics};

const SERVICE_NAME: &str = "binlog-relay";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = RelayConfig::from_env().context("Failed to load relay configuration")?;
    info!(
        mysql_host = %config.mysql_host,
        server_id = config.replication_server_id,
        bucket = %config.checkpoint_bucket,
        topic = %config.kafka_topic,
        "Starting {}",
        SERVICE_NAME
    );

    let metrics = RelayMetrics::new(SERVICE_NAME);

    let backend =
        S3CheckpointBackend::from_env(&config.aws_region, config.checkpoint_bucket.clone()).await;
    let checkpoints = Arc::new(CheckpointStore::new(
        Arc::new(backend),
        config.checkpoint_key.clone(),
    ));

    let kafka = KafkaSinkClient::connect(&config.kafka_brokers, config.kafka_topic.clone())
        .context("Failed to create Kafka producer")?;
    let sink = Arc::new(
        SinkBatcher::new(
            Arc::new(kafka),
            config.max_workers,
            config.sink_max_batch_size,
        )
        .with_metrics(metrics.clone()),
    );

    let positions = MySqlPositionSource::connect(config.mysql_connect_options())
        .await
        .context("Failed to connect to source database")?;

    let source = MysqlBinlogSource::new(BinlogSourceOptions {
        host: config.mysql_host.clone(),
        port: config.mysql_port,
        user: config.mysql_user.clone(),
        password: config.mysql_password.clone(),
        server_id: config.replication_server_id,
        heartbeat: config.heartbeat_period(),
    });

    let normalizer = EventNormalizer::new(
        config
            .protected_schemas
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty()),
    );

    let relay = Relay::new(Arc::new(source), Arc::new(positions), checkpoints, sink)
        .with_normalizer(normalizer)
        .with_flush_intervals(
            config.sink_flush_interval(),
            config.checkpoint_flush_interval(),
        )
        .with_metrics(metrics);

    match relay.run(shutdown_signal()).await {
        Ok(summary) => {
            info!(
                events = summary.events,
                end = ?summary.end,
                resumed_from = %summary.resumed_from,
                "Relay stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Relay failed");
            Err(e.into())
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,rdkafka=warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C will stop the relay");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
}
