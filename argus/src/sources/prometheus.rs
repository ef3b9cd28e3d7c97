//! Pushed Prometheus alerts.
//!
//! The ingress handler posts Alertmanager-v2 shaped alerts here. Only alerts
//! labelled `platform=argus` are processed; a firing alert named like the
//! configured watchdog feeds the watchdog heartbeat and nothing else, and
//! everything else is converted and upserted into the vector.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::alert::{Alert, AlertStatus};
use crate::config::DefaultNocConfig;
use crate::vector::AlertsVector;
use crate::watchdog::Watchdog;

/// Label that routes an alert to this sidecar.
pub const PLATFORM_LABEL: &str = "platform";

/// Required value of the platform label.
pub const PLATFORM_VALUE: &str = "argus";

const PRIORITY_LABEL: &str = "priority";
const ALERTNAME_LABEL: &str = "alertname";

/// One element of the Alertmanager-v2-compatible request body.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusAlert {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// `firing` or `resolved`.
    pub status: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
}

/// Counters published on the health surface.
#[derive(Debug, Default)]
pub struct PrometheusMetrics {
    accepted: AtomicU64,
    filtered: AtomicU64,
    watchdog_heartbeats: AtomicU64,
}

pub struct PrometheusSource {
    vector: Arc<AlertsVector>,
    watchdog: Arc<Watchdog>,
    watchdog_alert_name: String,
    defaults: DefaultNocConfig,
    metrics: PrometheusMetrics,
}

// === impl PrometheusMetrics ===

impl PrometheusMetrics {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    pub fn watchdog_heartbeats(&self) -> u64 {
        self.watchdog_heartbeats.load(Ordering::Relaxed)
    }
}

// === impl PrometheusSource ===

impl PrometheusSource {
    pub fn new(
        vector: Arc<AlertsVector>,
        watchdog: Arc<Watchdog>,
        watchdog_alert_name: String,
        defaults: DefaultNocConfig,
    ) -> Self {
        Self {
            vector,
            watchdog,
            watchdog_alert_name,
            defaults,
            metrics: PrometheusMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &PrometheusMetrics {
        &self.metrics
    }

    pub fn ingest(&self, alerts: Vec<PrometheusAlert>) {
        for alert in alerts {
            self.ingest_one(alert);
        }
    }

    fn ingest_one(&self, incoming: PrometheusAlert) {
        if incoming.labels.get(PLATFORM_LABEL).map(String::as_str) != Some(PLATFORM_VALUE) {
            self.metrics.filtered.fetch_add(1, Ordering::Relaxed);
            trace!(fingerprint = %incoming.fingerprint, "Alert without platform label filtered");
            return;
        }

        let name = incoming
            .labels
            .get(ALERTNAME_LABEL)
            .cloned()
            .unwrap_or_default();
        let firing = incoming.status == "firing";

        if name == self.watchdog_alert_name {
            if firing {
                self.watchdog.record_heartbeat();
                self.metrics.watchdog_heartbeats.fetch_add(1, Ordering::Relaxed);
            } else {
                debug!("Resolved watchdog alert ignored");
            }
            return;
        }

        let status = if firing {
            AlertStatus::Create
        } else {
            AlertStatus::Cancel
        };
        let behavior = match status {
            AlertStatus::Create => &self.defaults.create_noc_behavior,
            AlertStatus::Cancel => &self.defaults.cancel_noc_behavior,
        };
        let priority = incoming
            .labels
            .get(PRIORITY_LABEL)
            .and_then(|p| p.parse::<i32>().ok())
            .unwrap_or(0)
            .max(0);

        let mut alert = Alert::new(&incoming.fingerprint, &name, "prometheus", status, priority)
            .with_payload_template(behavior);
        if let Some(summary) = incoming.annotations.get("summary") {
            alert.summary = summary.clone();
        }
        if let Some(description) = incoming.annotations.get("description") {
            alert.description = description.clone();
        }
        if let Some(started) = incoming.starts_at {
            alert.timestamp = started;
        }
        alert.annotations = incoming.annotations;

        self.metrics.accepted.fetch_add(1, Ordering::Relaxed);
        self.vector.update_alert(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;
    use crate::suppression::SuppressionCache;
    use crate::timer::TickClock;

    fn source() -> (Arc<AlertsVector>, Arc<Watchdog>, PrometheusSource) {
        let clock = Arc::new(TickClock::new());
        let suppression = Arc::new(SuppressionCache::new(
            clock.clone(),
            &DefaultNocConfig::default(),
        ));
        let vector = Arc::new(AlertsVector::new(clock.clone(), suppression, 86400));
        let watchdog = Arc::new(Watchdog::new(
            clock,
            vector.clone(),
            WatchdogConfig::default(),
        ));
        let source = PrometheusSource::new(
            vector.clone(),
            watchdog.clone(),
            "Watchdog".to_string(),
            DefaultNocConfig::default(),
        );
        (vector, watchdog, source)
    }

    fn firing(name: &str, fingerprint: &str, platform: Option<&str>) -> PrometheusAlert {
        let mut labels = BTreeMap::new();
        labels.insert(ALERTNAME_LABEL.to_string(), name.to_string());
        if let Some(platform) = platform {
            labels.insert(PLATFORM_LABEL.to_string(), platform.to_string());
        }
        PrometheusAlert {
            labels,
            status: "firing".to_string(),
            fingerprint: fingerprint.to_string(),
            ..PrometheusAlert::default()
        }
    }

    #[test]
    fn alerts_without_the_platform_label_are_filtered() {
        let (vector, _watchdog, source) = source();
        source.ingest(vec![
            firing("CpuHigh", "fp-1", None),
            firing("CpuHigh", "fp-2", Some("other")),
        ]);
        assert!(vector.is_empty());
        assert_eq!(source.metrics().filtered(), 2);
        assert_eq!(source.metrics().accepted(), 0);
    }

    #[test]
    fn platform_alerts_enter_the_vector() {
        let (vector, _watchdog, source) = source();
        let mut alert = firing("CpuHigh", "fp-1", Some(PLATFORM_VALUE));
        alert
            .annotations
            .insert("summary".to_string(), "cpu is high".to_string());
        source.ingest(vec![alert]);

        let stored = vector.get("fp-1").expect("alert stored");
        assert_eq!(stored.status, AlertStatus::Create);
        assert_eq!(stored.name, "CpuHigh");
        assert_eq!(stored.summary, "cpu is high");
        assert_eq!(stored.priority, 0);
        assert_eq!(source.metrics().accepted(), 1);
    }

    #[test]
    fn firing_watchdog_feeds_the_heartbeat_only() {
        let (vector, watchdog, source) = source();
        source.ingest(vec![firing("Watchdog", "wd-fp", Some(PLATFORM_VALUE))]);

        assert!(vector.is_empty());
        assert!(watchdog.last_heartbeat_tick().is_some());
        assert_eq!(source.metrics().watchdog_heartbeats(), 1);
    }

    #[test]
    fn resolved_alerts_map_to_cancel() {
        let (vector, _watchdog, source) = source();
        source.ingest(vec![firing("CpuHigh", "fp-1", Some(PLATFORM_VALUE))]);

        let mut resolved = firing("CpuHigh", "fp-1", Some(PLATFORM_VALUE));
        resolved.status = "resolved".to_string();
        source.ingest(vec![resolved]);

        assert_eq!(vector.get("fp-1").unwrap().status, AlertStatus::Cancel);
    }

    #[test]
    fn priority_label_is_clamped_to_non_negative() {
        let (vector, _watchdog, source) = source();
        let mut alert = firing("CpuHigh", "fp-1", Some(PLATFORM_VALUE));
        alert
            .labels
            .insert(PRIORITY_LABEL.to_string(), "-5".to_string());
        source.ingest(vec![alert]);
        assert_eq!(vector.get("fp-1").unwrap().priority, 0);

        let mut alert = firing("MemHigh", "fp-2", Some(PLATFORM_VALUE));
        alert
            .labels
            .insert(PRIORITY_LABEL.to_string(), "7".to_string());
        source.ingest(vec![alert]);
        assert_eq!(vector.get("fp-2").unwrap().priority, 7);
    }

    #[test]
    fn each_ingestion_gets_a_fresh_execution_id() {
        let (vector, _watchdog, source) = source();
        source.ingest(vec![firing("A", "fp-a", Some(PLATFORM_VALUE))]);
        source.ingest(vec![firing("B", "fp-b", Some(PLATFORM_VALUE))]);
        let a = vector.get("fp-a").unwrap();
        let b = vector.get("fp-b").unwrap();
        assert_ne!(a.execution_id, b.execution_id);
        assert_eq!(a.execution_id.len(), 8);
    }
}
