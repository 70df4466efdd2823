//! Instruments emitted by an ingestion task.

use metric::{Metric, Registry, U64Counter, U64Gauge};

/// Counters and gauges shared by the ingestion loop, drainers and produce
/// completions.
#[derive(Debug, Clone)]
pub struct IngesterMetrics {
    /// Records skipped as duplicates by validation.
    pub div_duplicate: U64Counter,
    /// Fatal validation failures (gaps, corrupt segments).
    pub div_fatal: U64Counter,
    /// Rewinds classified benign.
    pub benign_rewind: U64Counter,
    /// Rewinds classified lossy.
    pub lossy_rewind: U64Counter,
    /// Produce failures surfaced to the task.
    pub producer_failure: U64Counter,
    /// Produce-side waits that timed out and were tolerated.
    pub benign_producer_failure: U64Counter,
    /// Completed standby-to-leader promotions.
    pub leader_promotions: U64Counter,
    /// Completed leader-to-standby demotions.
    pub leader_demotions: U64Counter,
    /// Topic switches executed by a leader.
    pub topic_switches: U64Counter,
    /// Records applied to storage.
    pub records_applied: U64Counter,
    /// Replication lag of the leader against its upstream.
    pub leader_lag: U64Gauge,
    /// Replication lag of followers against the version topic.
    pub follower_lag: U64Gauge,
}

impl IngesterMetrics {
    /// Register all instruments against `registry`.
    pub fn new(registry: &Registry) -> Self {
        let validation: Metric<U64Counter> = registry.register_metric(
            "ingest_data_validation",
            "data-integrity validation outcomes by class",
        );
        let rewind: Metric<U64Counter> = registry.register_metric(
            "ingest_upstream_rewind",
            "upstream offset rewinds by classification",
        );
        let producer: Metric<U64Counter> = registry.register_metric(
            "ingest_producer_failure",
            "version-topic produce failures by severity",
        );
        let transitions: Metric<U64Counter> = registry.register_metric(
            "ingest_role_transition",
            "completed partition role transitions",
        );
        let applied: Metric<U64Counter> = registry
            .register_metric("ingest_records_applied", "records applied to storage");
        let lag: Metric<U64Gauge> =
            registry.register_metric("ingest_replication_lag", "replication lag by role");

        Self {
            div_duplicate: validation.recorder(&[("class", "duplicate")]),
            div_fatal: validation.recorder(&[("class", "fatal")]),
            benign_rewind: rewind.recorder(&[("class", "benign")]),
            lossy_rewind: rewind.recorder(&[("class", "lossy")]),
            producer_failure: producer.recorder(&[("severity", "fatal")]),
            benign_producer_failure: producer.recorder(&[("severity", "benign")]),
            leader_promotions: transitions.recorder(&[("transition", "promotion")]),
            leader_demotions: transitions.recorder(&[("transition", "demotion")]),
            topic_switches: transitions.recorder(&[("transition", "topic_switch")]),
            records_applied: applied.recorder(&[("outcome", "ok")]),
            leader_lag: lag.recorder(&[("role", "leader")]),
            follower_lag: lag.recorder(&[("role", "follower")]),
        }
    }
}
