//! The liveness-aware heartbeat.
//!
//! Both roles run the callback; outputs differ. The NOC heartbeat goes
//! through the same two-phase protocol as alerts and feeds the circuit
//! breaker. The file heartbeat is leader-only and is gated on both the
//! liveness vector and the breaker: on either degradation edge one FINAL
//! DIAGNOSTIC document is written and then the file goes silent, so the
//! external monitor sees a stale or UNHEALTHY file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{HeartbeatConfig, NocHttpClientConfig};
use crate::liveness::{LivenessRecord, LivenessVector};
use crate::noc::client::NocTransport;
use crate::noc::health::NocHealth;
use crate::noc::payload::NocPayload;
use crate::noc::{two_phase, TwoPhaseOutcome};
use crate::timer::TickClock;

/// Reason written into a FINAL DIAGNOSTIC document.
pub const LIVENESS_FAILURE: &str = "LIVENESS_FAILURE";
pub const NOC_FAILURE: &str = "NOC_FAILURE";

/// The document written to the heartbeat file; external monitors parse it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatDocument {
    pub tick: u64,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    /// `HEALTHY` or `UNHEALTHY`.
    pub status: &'static str,
    pub unhealthy_reason: String,
    pub noc_circuit_breaker: CircuitBreakerDocument,
    pub liveness_vector: LivenessDocument,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerDocument {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessDocument {
    pub is_healthy: bool,
    pub total_count: usize,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
    pub callbacks: Vec<CallbackDocument>,
    pub unhealthy_details: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackDocument {
    pub name: String,
    pub last_execution_tick: u64,
    pub expected_interval_ticks: u64,
    pub age: u64,
    pub is_healthy: bool,
}

#[derive(Debug)]
struct EdgeState {
    liveness_healthy: bool,
    noc_healthy: bool,
    sent_payload: Option<NocPayload>,
}

pub struct HeartbeatService {
    clock: Arc<TickClock>,
    liveness: Arc<LivenessVector>,
    health: Arc<NocHealth>,
    transport: Arc<dyn NocTransport>,
    is_leader: watch::Receiver<bool>,
    noc_enabled: bool,
    config: HeartbeatConfig,
    http_config: NocHttpClientConfig,
    state: Mutex<EdgeState>,
}

// === impl HeartbeatService ===

impl HeartbeatService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<TickClock>,
        liveness: Arc<LivenessVector>,
        health: Arc<NocHealth>,
        transport: Arc<dyn NocTransport>,
        is_leader: watch::Receiver<bool>,
        noc_enabled: bool,
        config: HeartbeatConfig,
        http_config: NocHttpClientConfig,
    ) -> Self {
        Self {
            clock,
            liveness,
            health,
            transport,
            is_leader,
            noc_enabled,
            config,
            http_config,
            state: Mutex::new(EdgeState {
                liveness_healthy: true,
                noc_healthy: true,
                sent_payload: None,
            }),
        }
    }

    /// One heartbeat round.
    pub async fn tick(&self, tick: u64, correlation_id: &str) {
        let is_leader = *self.is_leader.borrow();

        // 1. Liveness gate. On the degradation edge, one FINAL DIAGNOSTIC
        //    file; while degraded, nothing else happens: the NOC heartbeat
        //    stops too, so the breaker state freezes at its last value.
        let unhealthy = self.liveness.unhealthy_callbacks(tick);
        let liveness_healthy = unhealthy.is_empty();
        let was_liveness_healthy = self.state.lock().liveness_healthy;

        if !liveness_healthy {
            if was_liveness_healthy {
                self.state.lock().liveness_healthy = false;
                warn!(
                    unhealthy = unhealthy.len(),
                    callbacks = ?unhealthy.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
                    "Liveness degraded; writing final diagnostic heartbeat"
                );
                if is_leader {
                    self.write_final_diagnostic(tick, correlation_id, LIVENESS_FAILURE)
                        .await;
                }
            }
            return;
        }
        if !was_liveness_healthy {
            self.state.lock().liveness_healthy = true;
            info!("Liveness recovered; resuming heartbeats");
        }

        // 2. NOC heartbeat via the shared two-phase exchange.
        if self.noc_enabled && self.config.http.noc_behavior.send_to_noc {
            let payload = self.build_payload();
            let cached = self.state.lock().sent_payload.clone();
            let TwoPhaseOutcome { sent, verified } =
                two_phase(&*self.transport, is_leader, &payload, cached.as_ref()).await;
            if sent {
                self.state.lock().sent_payload = Some(payload);
            }
            if verified {
                self.health.record_success();
            } else {
                self.health.record_failure();
            }
        }

        // 3. Breaker gate, same edge shape as the liveness gate.
        let noc_healthy = self.health.is_healthy();
        let was_noc_healthy = self.state.lock().noc_healthy;
        if !noc_healthy {
            if was_noc_healthy {
                self.state.lock().noc_healthy = false;
                warn!("NOC circuit breaker tripped; writing final diagnostic heartbeat");
                if is_leader {
                    self.write_final_diagnostic(tick, correlation_id, NOC_FAILURE)
                        .await;
                }
            }
            return;
        }
        if !was_noc_healthy {
            self.state.lock().noc_healthy = true;
            info!("NOC circuit breaker recovered; resuming file heartbeats");
        }

        // 4. Everything healthy: the leader writes the regular file.
        if is_leader {
            let document = self.document(tick, correlation_id, "HEALTHY", String::new());
            self.write_file(&document).await;
        }
    }

    fn build_payload(&self) -> NocPayload {
        let mut payload = self.config.http.noc_behavior.payload.clone();
        if payload.suppression_key.is_empty() {
            payload.suppression_key = "argus-heartbeat".to_string();
        }
        if payload.message.is_empty() {
            payload.message = "argus heartbeat".to_string();
        }
        if payload.source.is_empty() {
            payload.source = "argus".to_string();
        }
        payload.fill_defaults(&self.http_config);
        payload
    }

    async fn write_final_diagnostic(&self, tick: u64, correlation_id: &str, reason: &str) {
        if !self.config.file.enabled {
            return;
        }
        let document = self.document(tick, correlation_id, "UNHEALTHY", reason.to_string());
        self.write_file(&document).await;
    }

    fn document(
        &self,
        tick: u64,
        correlation_id: &str,
        status: &'static str,
        unhealthy_reason: String,
    ) -> HeartbeatDocument {
        let records = self.liveness.snapshot();
        let callbacks: Vec<CallbackDocument> = records
            .iter()
            .map(|record| callback_document(record, tick))
            .collect();
        let unhealthy_details: Vec<String> = callbacks
            .iter()
            .filter(|c| !c.is_healthy)
            .map(|c| {
                format!(
                    "{}: age {} >= 2x interval {}",
                    c.name, c.age, c.expected_interval_ticks
                )
            })
            .collect();
        let healthy_count = callbacks.iter().filter(|c| c.is_healthy).count();

        HeartbeatDocument {
            tick,
            correlation_id: correlation_id.to_string(),
            timestamp: self.clock.timestamp(),
            status,
            unhealthy_reason,
            noc_circuit_breaker: CircuitBreakerDocument {
                is_healthy: self.health.is_healthy(),
                consecutive_failures: self.health.consecutive_failures(),
                failure_threshold: self.health.failure_threshold(),
            },
            liveness_vector: LivenessDocument {
                is_healthy: healthy_count == callbacks.len(),
                total_count: callbacks.len(),
                healthy_count,
                unhealthy_count: callbacks.len() - healthy_count,
                callbacks,
                unhealthy_details,
            },
        }
    }

    /// Writes the document atomically: temp file, then rename over the
    /// destination. The directory is created on demand. Failures are logged,
    /// never fatal.
    async fn write_file(&self, document: &HeartbeatDocument) {
        if !self.config.file.enabled {
            return;
        }
        let path = PathBuf::from(&self.config.file.destination_path);
        if let Err(error) = write_atomically(&path, document).await {
            error!(path = %path.display(), %error, "Failed to write heartbeat file");
        } else {
            debug!(path = %path.display(), status = document.status, "Heartbeat file written");
        }
    }
}

fn callback_document(record: &LivenessRecord, tick: u64) -> CallbackDocument {
    CallbackDocument {
        name: record.name.clone(),
        last_execution_tick: record.entry.last_execution_tick,
        expected_interval_ticks: record.entry.expected_interval_ticks,
        age: record.entry.age(tick),
        is_healthy: record.entry.is_healthy(tick),
    }
}

async fn write_atomically(path: &Path, document: &HeartbeatDocument) -> std::io::Result<()> {
    if let Some(directory) = path.parent() {
        tokio::fs::create_dir_all(directory).await?;
    }
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let body = serde_json::to_vec_pretty(document)?;
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
