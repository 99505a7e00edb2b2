//! Prometheus metrics for the ingress status sync
//!
//! # Exported metrics
//! - `ingress_status_sync_cycles_total` (counter): reconciliation cycles labeled by outcome.
//! - `ingress_status_updates_total` (counter): per-ingress status updates labeled by result.
//! - `ingress_status_sync_leader` (gauge): 1 while this replica leads, 0 otherwise.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels for reconciliation cycles
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CycleLabels {
    /// "completed", "failed", "resolution_failed", "not_leader" or "shutting_down"
    pub outcome: String,
}

/// Labels for per-ingress status updates
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpdateLabels {
    pub result: String,
}

pub static SYNC_CYCLES_TOTAL: Lazy<Family<CycleLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static STATUS_UPDATES_TOTAL: Lazy<Family<UpdateLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static IS_LEADER: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "ingress_status_sync_cycles",
        "Status reconciliation cycles by outcome",
        SYNC_CYCLES_TOTAL.clone(),
    );
    registry.register(
        "ingress_status_updates",
        "Per-ingress status updates by result",
        STATUS_UPDATES_TOTAL.clone(),
    );
    registry.register(
        "ingress_status_sync_leader",
        "Whether this replica currently leads status updates",
        IS_LEADER.clone(),
    );

    registry
});

pub fn record_cycle(outcome: &str) {
    let labels = CycleLabels {
        outcome: outcome.to_string(),
    };
    SYNC_CYCLES_TOTAL.get_or_create(&labels).inc();
}

pub fn record_status_update(result: &str) {
    let labels = UpdateLabels {
        result: result.to_string(),
    };
    STATUS_UPDATES_TOTAL.get_or_create(&labels).inc();
}

pub fn set_leader(leader: bool) {
    IS_LEADER.set(i64::from(leader));
}

/// Render the registry in the OpenMetrics text format
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_cycle_counts_by_outcome() {
        let labels = CycleLabels {
            outcome: "completed".to_string(),
        };
        let before = SYNC_CYCLES_TOTAL.get_or_create(&labels).get();
        record_cycle("completed");
        record_cycle("completed");
        assert!(SYNC_CYCLES_TOTAL.get_or_create(&labels).get() >= before + 2);
    }

    #[test]
    fn test_encode_lists_registered_metrics() {
        record_status_update("unchanged");
        set_leader(true);

        let text = encode().unwrap();
        assert!(text.contains("# TYPE ingress_status_sync_cycles counter"));
        assert!(text.contains("ingress_status_updates_total{result=\"unchanged\"}"));
        assert!(text.contains("ingress_status_sync_leader"));
        assert!(text.ends_with("# EOF\n"));
    }
}
