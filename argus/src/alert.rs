//! The alert record carried from the sources to the NOC dispatch.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{parse_duration_secs, NocBehavior};
use crate::noc::payload::NocPayload;

/// Annotation key carrying a per-alert suppression window.
pub const SUPPRESS_WINDOW_ANNOTATION: &str = "suppress_window";

/// The alert's firing/resolved status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertStatus {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "CANCEL")]
    Cancel,
}

/// A structured health assertion with a stable fingerprint.
///
/// The fingerprint is the primary key in the alerts vector and the NOC
/// `suppressionKey`; it must be stable across replicas and ticks.
#[derive(Clone, Debug)]
pub struct Alert {
    pub fingerprint: String,
    pub name: String,
    pub source: String,
    pub status: AlertStatus,
    /// Lower is more important. Infrastructure alerts use -10..-6; Prometheus
    /// alerts are ≥ 0.
    pub priority: i32,
    pub summary: String,
    pub description: String,
    /// NOC payload template; runtime overrides are applied at send time.
    pub payload: NocPayload,
    pub send_to_noc: bool,
    /// Explicit suppression window. `Some(0s)` disables suppression; `None`
    /// falls back to the annotation and then the per-status default.
    pub suppress_window: Option<Duration>,
    /// Wall clock at creation; tiebreaker in the vector ordering.
    pub timestamp: DateTime<Utc>,
    pub last_seen_tick: u64,
    pub last_seen_timestamp: DateTime<Utc>,
    /// Opaque correlation string assigned once at ingestion; travels
    /// unchanged to the NOC send.
    pub execution_id: String,
    pub annotations: BTreeMap<String, String>,
}

// === impl AlertStatus ===

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Create => "CREATE",
            AlertStatus::Cancel => "CANCEL",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Alert ===

impl Alert {
    pub fn new(
        fingerprint: impl ToString,
        name: impl ToString,
        source: impl ToString,
        status: AlertStatus,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: fingerprint.to_string(),
            name: name.to_string(),
            source: source.to_string(),
            status,
            priority,
            summary: String::new(),
            description: String::new(),
            payload: NocPayload::default(),
            send_to_noc: true,
            suppress_window: None,
            timestamp: now,
            last_seen_tick: 0,
            last_seen_timestamp: now,
            execution_id: new_execution_id(),
            annotations: BTreeMap::new(),
        }
    }

    /// Applies a configured NOC behavior: the payload template, the send
    /// flag, and the suppression window (when the configured string parses).
    pub fn with_behavior(mut self, behavior: &NocBehavior) -> Self {
        self.payload = behavior.payload.clone();
        self.send_to_noc = behavior.send_to_noc;
        self.suppress_window = behavior
            .suppress_window
            .as_deref()
            .and_then(parse_duration_secs)
            .map(Duration::from_secs);
        self
    }

    /// Applies only the payload template and the send flag. Unlike
    /// [`Alert::with_behavior`], the suppression window is left unset so it
    /// still resolves through the annotation and the per-status default.
    pub fn with_payload_template(mut self, behavior: &NocBehavior) -> Self {
        self.payload = behavior.payload.clone();
        self.send_to_noc = behavior.send_to_noc;
        self
    }

    pub fn with_summary(mut self, summary: impl ToString) -> Self {
        self.summary = summary.to_string();
        self
    }

    pub fn with_description(mut self, description: impl ToString) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl ToString) -> Self {
        self.execution_id = execution_id.to_string();
        self
    }

    /// The wire message: the description when present, the summary otherwise.
    pub fn message(&self) -> &str {
        if self.description.is_empty() {
            &self.summary
        } else {
            &self.description
        }
    }

    pub fn suppress_window_annotation(&self) -> Option<&str> {
        self.annotations
            .get(SUPPRESS_WINDOW_ANNOTATION)
            .map(String::as_str)
    }
}

/// A fresh execution id for an alert entering the system.
pub fn new_execution_id() -> String {
    crate::random_suffix(8)
}
