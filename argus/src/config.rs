//! Hierarchical configuration for the sidecar.
//!
//! The configuration file is a single JSON document with one root section,
//! `Argus`. Every field is optional and falls back to a default, so an absent
//! file yields a runnable (if NOC-less) configuration.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::noc::payload::NocPayload;

/// Default TTL for entries in the alerts vector.
const DEFAULT_ALERT_TTL_SECS: u64 = 24 * 60 * 60;

/// Indicates an error loading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed
    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration parsed but is not usable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ConfigFile {
    argus: ArgusConfig,
}

/// The root `Argus` configuration section
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ArgusConfig {
    pub noc: NocConfig,
    pub leader_election: LeaderElectionConfig,
    pub coordinator: CoordinatorConfig,
    pub watchdog: WatchdogConfig,
    pub k8s_layer: K8sLayerConfig,
    pub alerts_vector: AlertsVectorConfig,
    pub default_noc: DefaultNocConfig,
    pub status_file_system: StatusFileSystemConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NocConfig {
    /// Master kill-switch for all NOC HTTP traffic.
    pub enabled: bool,
    pub circuit_breaker: CircuitBreakerConfig,
    pub http_client: NocHttpClientConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NocHttpClientConfig {
    pub send_endpoint: String,
    pub verify_endpoint: String,
    pub timeout_seconds: u64,
    pub bypass_ssl_validation: bool,
    /// When set (with `ConnectPort`), connections to the endpoint hosts skip
    /// DNS resolution and use this address instead.
    pub connect_ip_address: Option<String>,
    pub connect_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub team_name: String,
    pub system_name: String,
    pub host_name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: i64,
    pub renew_interval_seconds: u64,
    /// Accepted for compatibility; the election callback cadence already
    /// bounds retry latency.
    pub retry_interval_seconds: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CoordinatorConfig {
    pub snapshot_interval_seconds: u64,
    pub startup_grace_period_multiplier: f64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WatchdogConfig {
    pub alert_name: String,
    pub timeout_seconds: u64,
    pub create_noc_behavior: NocBehavior,
    pub cancel_noc_behavior: NocBehavior,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct K8sLayerConfig {
    pub polling_interval_seconds: u64,
    /// Namespace holding the Prometheus and kube-state-metrics pods.
    pub namespace: String,
    pub prometheus_label_selector: String,
    pub ksm_label_selector: String,
    pub restart_tracking: RestartTrackingConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RestartTrackingConfig {
    /// How many recent restart-count samples to retain per pod.
    pub window_size: usize,
    /// Restarts within the window at which the pod is considered unhealthy.
    pub restart_threshold: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AlertsVectorConfig {
    /// Duration string (`<decimal><s|m|h|d>`); entries not refreshed within
    /// this window are evicted.
    pub alert_ttl: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DefaultNocConfig {
    pub create_noc_behavior: NocBehavior,
    pub cancel_noc_behavior: NocBehavior,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StatusFileSystemConfig {
    pub polling_interval_seconds: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HeartbeatConfig {
    pub interval_seconds: u64,
    pub file: HeartbeatFileConfig,
    pub http: HeartbeatHttpConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HeartbeatFileConfig {
    pub enabled: bool,
    pub destination_path: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HeartbeatHttpConfig {
    pub noc_behavior: NocBehavior,
}

/// How an alert is presented to the NOC: the payload template, whether it is
/// sent at all, and its suppression window.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NocBehavior {
    pub send_to_noc: bool,
    /// Duration string; empty means no suppression, unparseable falls back to
    /// the per-status default.
    pub suppress_window: Option<String>,
    pub payload: NocPayload,
}

// === impl ArgusConfig ===

impl ArgusConfig {
    /// Loads the configuration from `path`, or all defaults when no path is
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let file: ConfigFile = serde_json::from_str(&text)?;
                file.argus
            }
            None => ArgusConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let le = &self.leader_election;
        if le.renew_interval_seconds as i64 >= le.lease_duration_seconds {
            return Err(ConfigError::Invalid(format!(
                "LeaderElection.RenewIntervalSeconds ({}) must be less than \
                 LeaseDurationSeconds ({})",
                le.renew_interval_seconds, le.lease_duration_seconds,
            )));
        }
        if self.noc.enabled {
            let http = &self.noc.http_client;
            if http.send_endpoint.is_empty() || http.verify_endpoint.is_empty() {
                return Err(ConfigError::Invalid(
                    "Noc.HttpClient.SendEndpoint and VerifyEndpoint are required \
                     when Noc.Enabled is true"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

// === impl CoordinatorConfig ===

impl CoordinatorConfig {
    /// Startup window during which grace-aware callbacks do not run. The
    /// multiplier is floored at 1.0.
    pub fn grace_period_seconds(&self) -> u64 {
        let multiplier = self.startup_grace_period_multiplier.max(1.0);
        (self.snapshot_interval_seconds as f64 * multiplier) as u64
    }
}

// === impl AlertsVectorConfig ===

impl AlertsVectorConfig {
    pub fn alert_ttl_seconds(&self) -> u64 {
        parse_duration_secs(&self.alert_ttl)
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_ALERT_TTL_SECS)
    }
}

// === defaults ===

impl Default for NocConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            circuit_breaker: CircuitBreakerConfig::default(),
            http_client: NocHttpClientConfig::default(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
        }
    }
}

impl Default for NocHttpClientConfig {
    fn default() -> Self {
        Self {
            send_endpoint: String::new(),
            verify_endpoint: String::new(),
            timeout_seconds: 30,
            bypass_ssl_validation: false,
            connect_ip_address: None,
            connect_port: None,
            username: None,
            password: None,
            team_name: String::new(),
            system_name: String::new(),
            host_name: String::new(),
        }
    }
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_name: "argus-leader".to_string(),
            lease_namespace: "default".to_string(),
            lease_duration_seconds: 30,
            renew_interval_seconds: 10,
            retry_interval_seconds: 5,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_seconds: 30,
            startup_grace_period_multiplier: 2.0,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            alert_name: "Watchdog".to_string(),
            timeout_seconds: 120,
            create_noc_behavior: NocBehavior {
                payload: NocPayload {
                    severity: "critical".to_string(),
                    visible: true,
                    ..NocPayload::default()
                },
                ..NocBehavior::default()
            },
            cancel_noc_behavior: NocBehavior::default(),
        }
    }
}

impl Default for K8sLayerConfig {
    fn default() -> Self {
        Self {
            polling_interval_seconds: 60,
            namespace: "monitoring".to_string(),
            prometheus_label_selector: "app.kubernetes.io/name=prometheus".to_string(),
            ksm_label_selector: "app.kubernetes.io/name=kube-state-metrics".to_string(),
            restart_tracking: RestartTrackingConfig::default(),
        }
    }
}

impl Default for RestartTrackingConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            restart_threshold: 3,
        }
    }
}

impl Default for AlertsVectorConfig {
    fn default() -> Self {
        Self {
            alert_ttl: "24h".to_string(),
        }
    }
}

impl Default for DefaultNocConfig {
    fn default() -> Self {
        Self {
            create_noc_behavior: NocBehavior {
                suppress_window: Some("5m".to_string()),
                ..NocBehavior::default()
            },
            cancel_noc_behavior: NocBehavior {
                suppress_window: Some("5m".to_string()),
                ..NocBehavior::default()
            },
        }
    }
}

impl Default for StatusFileSystemConfig {
    fn default() -> Self {
        Self {
            polling_interval_seconds: 60,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            file: HeartbeatFileConfig::default(),
            http: HeartbeatHttpConfig::default(),
        }
    }
}

impl Default for HeartbeatFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            destination_path: "/status/argus-heartbeat.json".to_string(),
        }
    }
}

impl Default for NocBehavior {
    fn default() -> Self {
        Self {
            send_to_noc: true,
            suppress_window: None,
            payload: NocPayload {
                visible: true,
                ..NocPayload::default()
            },
        }
    }
}

/// Parses the duration grammar `<decimal><unit>` with unit ∈ {s, m, h, d}.
///
/// Returns the duration in whole seconds. An empty string parses as zero
/// seconds ("no suppression"); an unparseable string returns `None` so the
/// caller can fall back to a default.
pub fn parse_duration_secs(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Some(0);
    }

    let unit = s.chars().last()?;
    let value = &s[..s.len() - unit.len_utf8()];
    let scale: f64 = match unit {
        's' => 1.0,
        'm' => 60.0,
        'h' => 3600.0,
        'd' => 86400.0,
        _ => return None,
    };
    let value: f64 = value.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * scale) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_unit_suffixes() {
        assert_eq!(parse_duration_secs("90s"), Some(90));
        assert_eq!(parse_duration_secs("2m"), Some(120));
        assert_eq!(parse_duration_secs("1.5h"), Some(5400));
        assert_eq!(parse_duration_secs("1d"), Some(86400));
        assert_eq!(parse_duration_secs(" 30s "), Some(30));
    }

    #[test]
    fn empty_duration_means_zero() {
        assert_eq!(parse_duration_secs(""), Some(0));
        assert_eq!(parse_duration_secs("  "), Some(0));
    }

    #[test]
    fn unparseable_durations_fall_through() {
        assert_eq!(parse_duration_secs("5"), None);
        assert_eq!(parse_duration_secs("5w"), None);
        assert_eq!(parse_duration_secs("m"), None);
        assert_eq!(parse_duration_secs("-1m"), None);
        assert_eq!(parse_duration_secs("five minutes"), None);
    }

    #[test]
    fn defaults_are_usable() {
        let config = ArgusConfig::default();
        assert!(config.noc.enabled);
        assert_eq!(config.noc.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.coordinator.grace_period_seconds(), 60);
        assert_eq!(config.alerts_vector.alert_ttl_seconds(), 86400);
    }

    #[test]
    fn grace_multiplier_floored_at_one() {
        let coordinator = CoordinatorConfig {
            snapshot_interval_seconds: 30,
            startup_grace_period_multiplier: 0.1,
        };
        assert_eq!(coordinator.grace_period_seconds(), 30);
    }

    #[test]
    fn pascal_case_sections_deserialize() {
        let text = r#"{
            "Argus": {
                "Noc": {
                    "Enabled": true,
                    "CircuitBreaker": { "FailureThreshold": 5 },
                    "HttpClient": {
                        "SendEndpoint": "https://noc.example.com/send",
                        "VerifyEndpoint": "https://noc.example.com/verify",
                        "Username": "argus",
                        "Password": "secret"
                    }
                },
                "LeaderElection": { "LeaseName": "argus", "RenewIntervalSeconds": 5 },
                "Watchdog": {
                    "TimeoutSeconds": 90,
                    "CreateNocBehavior": {
                        "SuppressWindow": "10m",
                        "Payload": { "Severity": "critical", "Visible": true }
                    }
                },
                "AlertsVector": { "AlertTtl": "12h" }
            }
        }"#;
        let file: ConfigFile = serde_json::from_str(text).unwrap();
        let config = file.argus;
        assert_eq!(config.noc.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.leader_election.lease_name, "argus");
        assert_eq!(config.watchdog.timeout_seconds, 90);
        assert_eq!(
            config.watchdog.create_noc_behavior.suppress_window.as_deref(),
            Some("10m")
        );
        assert_eq!(config.watchdog.create_noc_behavior.payload.severity, "critical");
        assert_eq!(config.alerts_vector.alert_ttl_seconds(), 12 * 3600);
        config.validate().unwrap();
    }

    #[test]
    fn renew_interval_must_undercut_lease_duration() {
        let mut config = ArgusConfig::default();
        config.leader_election.renew_interval_seconds = 30;
        config.leader_election.lease_duration_seconds = 30;
        assert!(config.validate().is_err());
    }
}
