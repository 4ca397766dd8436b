use lazy_static::lazy_static;
use prometheus::{register_int_gauge, register_int_gauge_vec, Encoder, IntGauge, IntGaugeVec, TextEncoder};
use serde::Deserialize;
use tracing::warn;

use crate::console::ConsoleSnapshot;
use crate::model::Category;

lazy_static! {
    pub static ref HAZARD_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        "hazardwatch_hazard_total",
        "Worker-reported hazard count summed over registered cameras",
        &["category"]
    )
    .expect("register hazardwatch_hazard_total");
    pub static ref LIVE_SUBSCRIPTIONS: IntGauge = register_int_gauge!(
        "hazardwatch_live_subscriptions",
        "Open per-camera feed subscriptions"
    )
    .expect("register hazardwatch_live_subscriptions");
    pub static ref REGISTERED_SOURCES: IntGauge = register_int_gauge!(
        "hazardwatch_registered_sources",
        "Cameras currently in the registry"
    )
    .expect("register hazardwatch_registered_sources");
}

fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub fn record_snapshot(snapshot: &ConsoleSnapshot) {
    for category in Category::ALL {
        HAZARD_TOTAL
            .with_label_values(&[category.as_str()])
            .set(gauge_value(snapshot.total(category)));
    }
    LIVE_SUBSCRIPTIONS.set(gauge_value(snapshot.live_subscriptions as u64));
    REGISTERED_SOURCES.set(gauge_value(snapshot.sources.len() as u64));
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitoring_enabled(),
        }
    }
}

fn default_monitoring_enabled() -> bool {
    true
}
