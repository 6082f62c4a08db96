use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct RelayMetrics {
    pub events_consumed: IntCounter,
    pub events_enqueued: IntCounter,
    pub records_delivered: IntCounter,
    pub delivery_failures: IntCounter,
    pub checkpoint_writes: IntCounter,
    pub flush_failures: IntCounter,
    pub sink_pending: IntGauge,
    /// Current `RelayState` of the consume loop
    pub relay_state: IntGauge,
}

impl RelayMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
                .expect("valid metric opts for relay counter")
        };

        let events_consumed = counter(
            "binlog_relay_events_consumed_total",
            "Total number of replication records read from the source stream",
        );
        let events_enqueued = counter(
            "binlog_relay_events_enqueued_total",
            "Total number of change events queued for the sink",
        );
        let records_delivered = counter(
            "binlog_relay_records_delivered_total",
            "Total number of records accepted by the sink",
        );
        let delivery_failures = counter(
            "binlog_relay_delivery_failures_total",
            "Total number of records the sink rejected or never received",
        );
        let checkpoint_writes = counter(
            "binlog_relay_checkpoint_writes_total",
            "Total number of checkpoints persisted",
        );
        let flush_failures = counter(
            "binlog_relay_flush_failures_total",
            "Total number of periodic flushes that returned an error",
        );

        let gauge = |name: &str, help: &str| {
            IntGauge::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
                .expect("valid metric opts for relay gauge")
        };

        let sink_pending = gauge(
            "binlog_relay_sink_pending_count",
            "Number of serialized events waiting for the next sink flush",
        );
        let relay_state = gauge(
            "binlog_relay_state",
            "Relay lifecycle state (0 initializing, 1 running, 2 draining, 3 closed)",
        );

        for metric in [
            Box::new(events_consumed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(events_enqueued.clone()),
            Box::new(records_delivered.clone()),
            Box::new(delivery_failures.clone()),
            Box::new(checkpoint_writes.clone()),
            Box::new(flush_failures.clone()),
            Box::new(sink_pending.clone()),
            Box::new(relay_state.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register relay metric: {}", e);
            }
        }

        Self {
            events_consumed,
            events_enqueued,
            records_delivered,
            delivery_failures,
            checkpoint_writes,
            flush_failures,
            sink_pending,
            relay_state,
        }
    }
}
