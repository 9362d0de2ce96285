//! Counters backing the Supervisor health snapshot (spec.md §4.8).

use std::sync::Arc;

use opentelemetry::metrics::Counter;
use opentelemetry::{global, KeyValue};

#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

struct Inner {
    events_decoded_total: Counter<u64>,
    events_applied_total: Counter<u64>,
    events_ignored_total: Counter<u64>,
    decode_errors_total: Counter<u64>,
    reconnects_total: Counter<u64>,
    catchup_rounds_total: Counter<u64>,
    task_restarts_total: Counter<u64>,
}

impl Telemetry {
    pub fn new() -> Self {
        let meter = global::meter("speedrun_indexer");

        Self {
            inner: Arc::new(Inner {
                events_decoded_total: meter
                    .u64_counter("speedrun.events_decoded_total")
                    .with_description("Logs successfully decoded into a DecodedEvent")
                    .build(),
                events_applied_total: meter
                    .u64_counter("speedrun.events_applied_total")
                    .with_description("Decoded events that advanced an intent's status")
                    .build(),
                events_ignored_total: meter
                    .u64_counter("speedrun.events_ignored_total")
                    .with_description("Decoded events ignored as stale or already applied")
                    .build(),
                decode_errors_total: meter
                    .u64_counter("speedrun.decode_errors_total")
                    .with_description("Logs dropped because they failed to decode")
                    .build(),
                reconnects_total: meter
                    .u64_counter("speedrun.reconnects_total")
                    .with_description("Subscriber reconnect attempts")
                    .build(),
                catchup_rounds_total: meter
                    .u64_counter("speedrun.catchup_rounds_total")
                    .with_description("Periodic catchup rounds completed")
                    .build(),
                task_restarts_total: meter
                    .u64_counter("speedrun.task_restarts_total")
                    .with_description("Supervised tasks restarted after a panic or error")
                    .build(),
            }),
        }
    }

    pub fn record_decoded(&self, chain_id: u64, count: u64) {
        self.inner
            .events_decoded_total
            .add(count, &[KeyValue::new("chain_id", chain_id as i64)]);
    }

    pub fn record_applied(&self, chain_id: u64) {
        self.inner
            .events_applied_total
            .add(1, &[KeyValue::new("chain_id", chain_id as i64)]);
    }

    pub fn record_ignored(&self, chain_id: u64) {
        self.inner
            .events_ignored_total
            .add(1, &[KeyValue::new("chain_id", chain_id as i64)]);
    }

    pub fn record_decode_error(&self, chain_id: u64) {
        self.inner
            .decode_errors_total
            .add(1, &[KeyValue::new("chain_id", chain_id as i64)]);
    }

    pub fn record_reconnect(&self, chain_id: u64) {
        self.inner
            .reconnects_total
            .add(1, &[KeyValue::new("chain_id", chain_id as i64)]);
    }

    pub fn record_catchup_round(&self, chain_id: u64) {
        self.inner
            .catchup_rounds_total
            .add(1, &[KeyValue::new("chain_id", chain_id as i64)]);
    }

    pub fn record_task_restart(&self, task_name: &str) {
        self.inner
            .task_restarts_total
            .add(1, &[KeyValue::new("task", task_name.to_string())]);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
