//! The NOC wire payload and the runtime overrides applied before a send.

use serde::{Deserialize, Serialize};

use crate::alert::{Alert, AlertStatus};
use crate::config::NocHttpClientConfig;

/// Wire level for an alert that opens an incident.
pub const LEVEL_CREATE: i32 = 3;

/// Wire level for an alert that closes an incident.
pub const LEVEL_CANCEL: i32 = 0;

/// The JSON document POSTed to the NOC send endpoint.
///
/// Field aliases accept the PascalCase spelling used in the configuration
/// file; serialization is always camelCase as the receiver expects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NocPayload {
    #[serde(alias = "Custom1")]
    pub custom1: String,
    #[serde(alias = "Custom2")]
    pub custom2: String,
    #[serde(alias = "HostName")]
    pub host_name: String,
    #[serde(alias = "Level")]
    pub level: i32,
    #[serde(alias = "Message")]
    pub message: String,
    #[serde(alias = "Severity")]
    pub severity: String,
    #[serde(alias = "Source")]
    pub source: String,
    #[serde(alias = "SuppressionKey")]
    pub suppression_key: String,
    #[serde(alias = "Visible")]
    pub visible: bool,
}

/// The filter document POSTed to the NOC verify endpoint.
///
/// Identical in shape to [`NocPayload`] plus the three `userTga` fields,
/// which are always sent empty.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NocFilter {
    #[serde(flatten)]
    pub payload: NocPayload,
    pub user_tga1: String,
    pub user_tga2: String,
    pub user_tga3: String,
}

// === impl NocPayload ===

impl NocPayload {
    /// Applies the per-alert runtime overrides that take precedence over the
    /// configured payload template.
    pub fn apply_overrides(&mut self, alert: &Alert) {
        self.level = match alert.status {
            AlertStatus::Create => LEVEL_CREATE,
            AlertStatus::Cancel => LEVEL_CANCEL,
        };
        self.message = alert.message().to_string();
        self.source = alert.source.clone();
        self.suppression_key = alert.fingerprint.clone();
    }

    /// Fills `custom1`/`custom2`/`hostName` from the client configuration when
    /// the template left them empty.
    pub fn fill_defaults(&mut self, config: &NocHttpClientConfig) {
        if self.custom1.is_empty() {
            self.custom1 = config.team_name.clone();
        }
        if self.custom2.is_empty() {
            self.custom2 = config.system_name.clone();
        }
        if self.host_name.is_empty() {
            self.host_name = config.host_name.clone();
        }
    }

    /// Whether a verify-phase response matches a previously sent payload.
    ///
    /// Only `suppressionKey`, `level`, and `source` are required to agree;
    /// the receiver is free to rewrite everything else.
    pub fn matches(&self, received: &NocPayload) -> bool {
        self.suppression_key == received.suppression_key
            && self.level == received.level
            && self.source == received.source
    }
}

impl From<NocPayload> for NocFilter {
    fn from(payload: NocPayload) -> Self {
        Self {
            payload,
            user_tga1: String::new(),
            user_tga2: String::new(),
            user_tga3: String::new(),
        }
    }
}
