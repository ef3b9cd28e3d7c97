//! Kubernetes-layer health probes.
//!
//! Every polling cycle runs three checks in parallel (API reachability,
//! Prometheus pod health, kube-state-metrics pod health) and always
//! emits all three alerts so the vector reflects the current state. The
//! three alerts of one cycle share a single execution id.

use std::sync::Arc;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube_client::api::{Api, ListParams};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

use crate::alert::{new_execution_id, Alert, AlertStatus};
use crate::config::{DefaultNocConfig, K8sLayerConfig, RestartTrackingConfig};
use crate::vector::AlertsVector;

/// Fingerprints and priorities of the three layer alerts.
pub const API_FINGERPRINT: &str = "k8s-layer-api";
pub const API_PRIORITY: i32 = -10;
pub const PROMETHEUS_FINGERPRINT: &str = "k8s-layer-prometheus";
pub const PROMETHEUS_PRIORITY: i32 = -9;
pub const KSM_FINGERPRINT: &str = "k8s-layer-ksm";
pub const KSM_PRIORITY: i32 = -8;

/// Outcome of one check, kept for the status endpoint.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub healthy: bool,
    pub detail: String,
}

/// The last polling cycle's outcomes.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sLayerStatus {
    pub api: CheckResult,
    pub prometheus: CheckResult,
    pub ksm: CheckResult,
    pub checked_at: DateTime<Utc>,
}

/// Tracks per-pod restart churn over a bounded sample window.
struct RestartTracker {
    window_size: usize,
    threshold: u32,
    samples: AHashMap<String, VecDeque<u32>>,
}

pub struct K8sLayerSource {
    client: kube_client::Client,
    config: K8sLayerConfig,
    defaults: DefaultNocConfig,
    vector: Arc<AlertsVector>,
    restarts: Mutex<RestartTracker>,
    last_status: Mutex<Option<K8sLayerStatus>>,
}

// === impl CheckResult ===

impl CheckResult {
    fn healthy(detail: impl ToString) -> Self {
        Self {
            healthy: true,
            detail: detail.to_string(),
        }
    }

    fn unhealthy(detail: impl ToString) -> Self {
        Self {
            healthy: false,
            detail: detail.to_string(),
        }
    }
}

// === impl RestartTracker ===

impl RestartTracker {
    fn new(config: &RestartTrackingConfig) -> Self {
        Self {
            window_size: config.window_size.max(2),
            threshold: config.restart_threshold,
            samples: AHashMap::new(),
        }
    }

    /// Records a restart-count sample; true when the pod restarted at least
    /// `threshold` times within the window.
    fn observe(&mut self, pod: &str, restarts: u32) -> bool {
        let samples = self.samples.entry(pod.to_string()).or_default();
        samples.push_back(restarts);
        while samples.len() > self.window_size {
            samples.pop_front();
        }
        let oldest = samples.front().copied().unwrap_or(restarts);
        self.threshold > 0 && restarts.saturating_sub(oldest) >= self.threshold
    }
}

// === impl K8sLayerSource ===

impl K8sLayerSource {
    pub fn new(
        client: kube_client::Client,
        config: K8sLayerConfig,
        defaults: DefaultNocConfig,
        vector: Arc<AlertsVector>,
    ) -> Self {
        let restarts = RestartTracker::new(&config.restart_tracking);
        Self {
            client,
            config,
            defaults,
            vector,
            restarts: Mutex::new(restarts),
            last_status: Mutex::new(None),
        }
    }

    pub fn last_status(&self) -> Option<K8sLayerStatus> {
        self.last_status.lock().clone()
    }

    /// One polling cycle: run the three checks in parallel and upsert the
    /// three alerts unconditionally.
    pub async fn poll(&self) {
        let execution_id = new_execution_id();
        let (api, prometheus, ksm) = tokio::join!(
            self.check_api(),
            self.check_pods("prometheus", &self.config.prometheus_label_selector),
            self.check_pods("kube-state-metrics", &self.config.ksm_label_selector),
        );

        self.emit(API_FINGERPRINT, "k8s-api", API_PRIORITY, &api, &execution_id);
        self.emit(
            PROMETHEUS_FINGERPRINT,
            "prometheus",
            PROMETHEUS_PRIORITY,
            &prometheus,
            &execution_id,
        );
        self.emit(
            KSM_FINGERPRINT,
            "kube-state-metrics",
            KSM_PRIORITY,
            &ksm,
            &execution_id,
        );

        *self.last_status.lock() = Some(K8sLayerStatus {
            api,
            prometheus,
            ksm,
            checked_at: Utc::now(),
        });
    }

    async fn check_api(&self) -> CheckResult {
        match self.client.apiserver_version().await {
            Ok(version) => {
                CheckResult::healthy(format!("API server {}.{}", version.major, version.minor))
            }
            Err(error) => CheckResult::unhealthy(format!("API server unreachable: {error}")),
        }
    }

    async fn check_pods(&self, what: &str, selector: &str) -> CheckResult {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let params = ListParams::default().labels(selector);
        match pods.list(&params).await {
            Ok(list) => self.evaluate_pods(what, list.items),
            Err(error) => CheckResult::unhealthy(format!("failed to list {what} pods: {error}")),
        }
    }

    /// Judges a pod listing: at least one ready pod and no pod churning
    /// through restarts within the tracking window.
    fn evaluate_pods(&self, what: &str, pods: Vec<Pod>) -> CheckResult {
        if pods.is_empty() {
            return CheckResult::unhealthy(format!("no {what} pods found"));
        }

        let mut ready = 0usize;
        let mut churning: Vec<String> = Vec::new();
        let mut tracker = self.restarts.lock();
        for pod in &pods {
            let name = pod
                .metadata
                .name
                .clone()
                .unwrap_or_else(|| "<unnamed>".to_string());
            if pod_is_ready(pod) {
                ready += 1;
            }
            if tracker.observe(&name, pod_restart_count(pod)) {
                churning.push(name);
            }
        }
        drop(tracker);

        if ready == 0 {
            return CheckResult::unhealthy(format!("no ready {what} pods ({} total)", pods.len()));
        }
        if !churning.is_empty() {
            return CheckResult::unhealthy(format!(
                "{what} pods restarting too often: {}",
                churning.join(", ")
            ));
        }
        CheckResult::healthy(format!("{ready}/{} {what} pods ready", pods.len()))
    }

    fn emit(
        &self,
        fingerprint: &str,
        name: &str,
        priority: i32,
        result: &CheckResult,
        execution_id: &str,
    ) {
        let status = if result.healthy {
            AlertStatus::Cancel
        } else {
            AlertStatus::Create
        };
        let behavior = match status {
            AlertStatus::Create => &self.defaults.create_noc_behavior,
            AlertStatus::Cancel => &self.defaults.cancel_noc_behavior,
        };
        debug!(fingerprint, healthy = result.healthy, detail = %result.detail, "Layer check");
        let alert = Alert::new(fingerprint, name, "k8s-layer", status, priority)
            .with_payload_template(behavior)
            .with_summary(&result.detail)
            .with_execution_id(execution_id);
        self.vector.update_alert(alert);
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn pod_restart_count(pod: &Pod) -> u32 {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|containers| containers.iter().map(|c| c.restart_count.max(0) as u32).sum())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str, ready: bool, restarts: i32) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..PodCondition::default()
                }]),
                container_statuses: Some(vec![ContainerStatus {
                    name: "main".to_string(),
                    restart_count: restarts,
                    ..ContainerStatus::default()
                }]),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn restart_tracker_flags_churn_within_the_window() {
        let mut tracker = RestartTracker::new(&RestartTrackingConfig {
            window_size: 4,
            restart_threshold: 3,
        });

        assert!(!tracker.observe("pod", 0));
        assert!(!tracker.observe("pod", 1));
        assert!(!tracker.observe("pod", 2));
        // 3 restarts since the oldest sample in the window
        assert!(tracker.observe("pod", 3));
        // the window slides: oldest is now 1
        assert!(!tracker.observe("pod", 3));
    }

    #[test]
    fn restart_tracker_tracks_pods_independently() {
        let mut tracker = RestartTracker::new(&RestartTrackingConfig {
            window_size: 4,
            restart_threshold: 2,
        });
        assert!(!tracker.observe("a", 0));
        assert!(!tracker.observe("b", 0));
        assert!(tracker.observe("a", 2));
        assert!(!tracker.observe("b", 1));
    }

    #[test]
    fn pod_readiness_is_read_from_conditions() {
        assert!(pod_is_ready(&pod("a", true, 0)));
        assert!(!pod_is_ready(&pod("a", false, 0)));
        assert!(!pod_is_ready(&Pod::default()));
    }

    #[test]
    fn restart_counts_sum_over_containers() {
        assert_eq!(pod_restart_count(&pod("a", true, 4)), 4);
        assert_eq!(pod_restart_count(&Pod::default()), 0);
    }
}
