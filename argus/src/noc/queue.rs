//! The decision queue and its single-consumer dispatcher.
//!
//! Decisions are processed strictly in enqueue order by one worker. Before
//! acting, the worker re-reads the alert's current state by fingerprint; a
//! decision whose intent no longer matches the vector is dropped. This
//! compensates for the lag between snapshot time and dispatch time without a
//! versioned vector.

use std::sync::Arc;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::NocTransport;
use super::health::NocHealth;
use super::payload::NocPayload;
use super::{two_phase, TwoPhaseOutcome};
use crate::alert::{Alert, AlertStatus};
use crate::config::NocHttpClientConfig;
use crate::suppression::SuppressionCache;
use crate::vector::AlertsVector;

/// How long the worker sleeps when the queue is empty.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// How long the worker backs off after a dispatch failure.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What the snapshot decided to do with an alert.
#[derive(Clone, Debug)]
pub enum NocAction {
    HandleCreate(Alert),
    HandleCancels(Vec<Alert>),
}

/// A queue element: the action plus its provenance.
#[derive(Clone, Debug)]
pub struct NocDecision {
    pub action: NocAction,
    pub snapshot_time: DateTime<Utc>,
    pub correlation_id: String,
}

/// Producer half of the decision queue.
#[derive(Clone)]
pub struct NocQueueSender {
    tx: mpsc::UnboundedSender<NocDecision>,
}

/// Creates the decision queue.
pub fn queue() -> (NocQueueSender, mpsc::UnboundedReceiver<NocDecision>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NocQueueSender { tx }, rx)
}

pub struct NocDispatcher {
    transport: Arc<dyn NocTransport>,
    vector: Arc<AlertsVector>,
    suppression: Arc<SuppressionCache>,
    health: Arc<NocHealth>,
    is_leader: watch::Receiver<bool>,
    noc_enabled: bool,
    http_config: NocHttpClientConfig,
    /// Last successfully sent payload per fingerprint; read when a follower
    /// (or a failed Phase 1) needs a verify filter.
    sent_payloads: Mutex<AHashMap<String, NocPayload>>,
}

// === impl NocQueueSender ===

impl NocQueueSender {
    pub fn enqueue(&self, decision: NocDecision) {
        if self.tx.send(decision).is_err() {
            warn!("NOC queue closed; decision dropped");
        }
    }
}

// === impl NocDispatcher ===

impl NocDispatcher {
    pub fn new(
        transport: Arc<dyn NocTransport>,
        vector: Arc<AlertsVector>,
        suppression: Arc<SuppressionCache>,
        health: Arc<NocHealth>,
        is_leader: watch::Receiver<bool>,
        noc_enabled: bool,
        http_config: NocHttpClientConfig,
    ) -> Self {
        Self {
            transport,
            vector,
            suppression,
            health,
            is_leader,
            noc_enabled,
            http_config,
            sent_payloads: Mutex::new(AHashMap::new()),
        }
    }

    /// Drains the queue until cancelled. Decisions are processed one at a
    /// time; the worker naps briefly when idle and backs off after failures.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<NocDecision>,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                debug!("NOC queue worker cancelled");
                return;
            }

            match rx.try_recv() {
                Ok(decision) => {
                    let failed = self.process(decision).await;
                    if failed {
                        if nap(&cancel, ERROR_BACKOFF).await {
                            return;
                        }
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    if nap(&cancel, IDLE_WAIT).await {
                        return;
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!("NOC queue senders dropped; worker exiting");
                    return;
                }
            }
        }
    }

    /// Processes one decision. Returns true when any alert in it failed the
    /// exchange, so the caller can back off.
    async fn process(&self, decision: NocDecision) -> bool {
        let correlation_id = decision.correlation_id;
        match decision.action {
            NocAction::HandleCreate(alert) => {
                debug!(
                    correlation_id = %correlation_id,
                    fingerprint = %alert.fingerprint,
                    "Dispatching CREATE"
                );
                self.dispatch(alert, AlertStatus::Create).await
            }
            NocAction::HandleCancels(alerts) => {
                debug!(
                    correlation_id = %correlation_id,
                    count = alerts.len(),
                    "Dispatching CANCELs"
                );
                let mut failed = false;
                for alert in alerts {
                    failed |= self.dispatch(alert, AlertStatus::Cancel).await;
                }
                failed
            }
        }
    }

    /// Dispatches one alert. Returns true on an exchange failure.
    async fn dispatch(&self, alert: Alert, intent: AlertStatus) -> bool {
        // Re-check before side-effect: the vector may have moved on since the
        // snapshot was taken.
        match self.vector.get(&alert.fingerprint) {
            Some(current) if current.status == intent => {}
            current => {
                debug!(
                    fingerprint = %alert.fingerprint,
                    intent = %intent,
                    current = ?current.map(|a| a.status),
                    "Dropping stale decision"
                );
                return false;
            }
        }

        if !self.noc_enabled || !alert.send_to_noc {
            // No HTTP, but a CANCEL still clears the vector.
            if intent == AlertStatus::Cancel {
                self.vector.remove_alert(&alert.fingerprint);
            }
            return false;
        }

        let payload = self.build_payload(&alert);
        let cached = self.sent_payloads.lock().get(&alert.fingerprint).cloned();
        let is_leader = *self.is_leader.borrow();
        let TwoPhaseOutcome { sent, verified } =
            two_phase(&*self.transport, is_leader, &payload, cached.as_ref()).await;

        if sent {
            self.sent_payloads
                .lock()
                .insert(alert.fingerprint.clone(), payload.clone());
        }

        if verified {
            self.health.record_success();
            if intent == AlertStatus::Cancel {
                self.vector.remove_alert(&alert.fingerprint);
                self.sent_payloads.lock().remove(&alert.fingerprint);
            }
            false
        } else {
            self.health.record_failure();
            // Re-arm the next snapshot; a CANCEL stays in the vector.
            self.suppression.unmark_as_processed(&alert);
            true
        }
    }

    fn build_payload(&self, alert: &Alert) -> NocPayload {
        let mut payload = alert.payload.clone();
        payload.apply_overrides(alert);
        payload.fill_defaults(&self.http_config);
        payload
    }
}

/// Sleeps unless cancelled first; returns true when cancelled.
async fn nap(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultNocConfig;
    use crate::noc::client::NocError;
    use crate::noc::payload::NocFilter;
    use crate::timer::TickClock;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct MockNoc {
        send_results: Mutex<VecDeque<Result<(), NocError>>>,
        verify_results: Mutex<VecDeque<Result<NocPayload, NocError>>>,
        sends: Mutex<Vec<NocPayload>>,
        verifies: Mutex<Vec<NocFilter>>,
    }

    impl MockNoc {
        fn expect_send(&self, result: Result<(), NocError>) {
            self.send_results.lock().push_back(result);
        }

        fn expect_verify(&self, result: Result<NocPayload, NocError>) {
            self.verify_results.lock().push_back(result);
        }

        fn echo_for(fingerprint: &str, level: i32, source: &str) -> NocPayload {
            NocPayload {
                suppression_key: fingerprint.to_string(),
                level,
                source: source.to_string(),
                ..NocPayload::default()
            }
        }
    }

    #[async_trait]
    impl NocTransport for MockNoc {
        async fn send(&self, payload: &NocPayload) -> Result<(), NocError> {
            self.sends.lock().push(payload.clone());
            self.send_results
                .lock()
                .pop_front()
                .unwrap_or(Err(NocError::SendStatus(StatusCode::INTERNAL_SERVER_ERROR)))
        }

        async fn verify(&self, filter: &NocFilter) -> Result<NocPayload, NocError> {
            self.verifies.lock().push(filter.clone());
            self.verify_results
                .lock()
                .pop_front()
                .unwrap_or(Err(NocError::VerifyStatus(StatusCode::INTERNAL_SERVER_ERROR)))
        }
    }

    struct Harness {
        vector: Arc<AlertsVector>,
        suppression: Arc<SuppressionCache>,
        health: Arc<NocHealth>,
        transport: Arc<MockNoc>,
        dispatcher: NocDispatcher,
        _leader_tx: watch::Sender<bool>,
    }

    fn harness(is_leader: bool, noc_enabled: bool) -> Harness {
        let clock = Arc::new(TickClock::new());
        let suppression = Arc::new(SuppressionCache::new(
            clock.clone(),
            &DefaultNocConfig::default(),
        ));
        let vector = Arc::new(AlertsVector::new(clock.clone(), suppression.clone(), 86400));
        let health = Arc::new(NocHealth::new(3));
        let transport = Arc::new(MockNoc::default());
        let (leader_tx, leader_rx) = watch::channel(is_leader);
        let dispatcher = NocDispatcher::new(
            transport.clone(),
            vector.clone(),
            suppression.clone(),
            health.clone(),
            leader_rx,
            noc_enabled,
            NocHttpClientConfig::default(),
        );
        Harness {
            vector,
            suppression,
            health,
            transport,
            dispatcher,
            _leader_tx: leader_tx,
        }
    }

    fn cancel_alert(fingerprint: &str) -> Alert {
        let mut alert = Alert::new(fingerprint, "name", "argus", AlertStatus::Cancel, 0);
        alert.suppress_window = Some(StdDuration::from_secs(300));
        alert
    }

    /// Seeds the vector with an entry in CANCEL state.
    fn seed_cancel(h: &Harness, fingerprint: &str) -> Alert {
        let mut create = cancel_alert(fingerprint);
        create.status = AlertStatus::Create;
        h.vector.update_alert(create);
        let cancel = cancel_alert(fingerprint);
        h.vector.update_alert(cancel.clone());
        cancel
    }

    fn decision(action: NocAction) -> NocDecision {
        NocDecision {
            action,
            snapshot_time: Utc::now(),
            correlation_id: "tick-00001-abcdefgh".to_string(),
        }
    }

    #[tokio::test]
    async fn cancel_removed_when_verify_succeeds_despite_send_failure() {
        let h = harness(true, true);
        let alert = seed_cancel(&h, "y");
        h.suppression.mark_as_processed(&alert);

        // Phase 1 returns 500; Phase 2 echoes a matching payload.
        h.transport
            .expect_send(Err(NocError::SendStatus(StatusCode::INTERNAL_SERVER_ERROR)));
        h.transport
            .expect_verify(Ok(MockNoc::echo_for("y", 0, "argus")));

        let failed = h
            .dispatcher
            .process(decision(NocAction::HandleCancels(vec![alert])))
            .await;

        assert!(!failed);
        assert!(h.health.is_healthy());
        assert_eq!(h.health.consecutive_failures(), 0);
        assert!(h.vector.get("y").is_none());
    }

    #[tokio::test]
    async fn cancel_kept_and_suppression_unmarked_on_comparison_mismatch() {
        let h = harness(true, true);
        let alert = seed_cancel(&h, "y");
        h.suppression.mark_as_processed(&alert);

        h.transport.expect_send(Ok(()));
        h.transport
            .expect_verify(Ok(MockNoc::echo_for("someone-else", 0, "argus")));

        let failed = h
            .dispatcher
            .process(decision(NocAction::HandleCancels(vec![alert.clone()])))
            .await;

        assert!(failed);
        assert_eq!(h.health.consecutive_failures(), 1);
        assert!(h.vector.get("y").is_some());
        // unmarked, so the next snapshot retries
        assert!(!h.suppression.was_recently_processed(&alert));
    }

    #[tokio::test]
    async fn create_stays_in_vector_after_success() {
        let h = harness(true, true);
        let mut alert = Alert::new("c", "name", "argus", AlertStatus::Create, 0);
        alert.suppress_window = Some(StdDuration::from_secs(300));
        h.vector.update_alert(alert.clone());

        h.transport.expect_send(Ok(()));
        h.transport
            .expect_verify(Ok(MockNoc::echo_for("c", 3, "argus")));

        let failed = h
            .dispatcher
            .process(decision(NocAction::HandleCreate(alert)))
            .await;

        assert!(!failed);
        assert!(h.vector.get("c").is_some());
        // the sent payload stays cached for future verifies
        assert!(h.dispatcher.sent_payloads.lock().contains_key("c"));
    }

    #[tokio::test]
    async fn follower_verifies_without_sending() {
        let h = harness(false, true);
        let alert = seed_cancel(&h, "f");

        h.transport
            .expect_verify(Ok(MockNoc::echo_for("f", 0, "argus")));

        let failed = h
            .dispatcher
            .process(decision(NocAction::HandleCancels(vec![alert])))
            .await;

        assert!(!failed);
        assert!(h.transport.sends.lock().is_empty());
        assert_eq!(h.transport.verifies.lock().len(), 1);
        assert!(h.vector.get("f").is_none());
    }

    #[tokio::test]
    async fn stale_decisions_are_dropped() {
        let h = harness(true, true);
        let mut alert = Alert::new("s", "name", "argus", AlertStatus::Create, 0);
        alert.suppress_window = Some(StdDuration::from_secs(300));
        h.vector.update_alert(alert.clone());
        // The alert resolves before the decision is dispatched.
        let mut cancel = alert.clone();
        cancel.status = AlertStatus::Cancel;
        h.vector.update_alert(cancel);

        let failed = h
            .dispatcher
            .process(decision(NocAction::HandleCreate(alert)))
            .await;

        assert!(!failed);
        assert!(h.transport.sends.lock().is_empty());
        assert!(h.transport.verifies.lock().is_empty());
    }

    #[tokio::test]
    async fn disabled_noc_skips_http_but_cancel_still_removes() {
        let h = harness(true, false);
        let alert = seed_cancel(&h, "d");

        let failed = h
            .dispatcher
            .process(decision(NocAction::HandleCancels(vec![alert])))
            .await;

        assert!(!failed);
        assert!(h.transport.sends.lock().is_empty());
        assert!(h.transport.verifies.lock().is_empty());
        assert!(h.vector.get("d").is_none());
    }

    #[tokio::test]
    async fn payload_overrides_and_defaults_applied_at_send() {
        let h = harness(true, true);
        let mut alert = Alert::new("p", "name", "k8s-layer", AlertStatus::Create, -10);
        alert.summary = "api unreachable".to_string();
        alert.suppress_window = Some(StdDuration::from_secs(300));
        h.vector.update_alert(alert.clone());

        h.transport.expect_send(Ok(()));
        h.transport
            .expect_verify(Ok(MockNoc::echo_for("p", 3, "k8s-layer")));

        h.dispatcher
            .process(decision(NocAction::HandleCreate(alert)))
            .await;

        let sends = h.transport.sends.lock();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].level, 3);
        assert_eq!(sends[0].suppression_key, "p");
        assert_eq!(sends[0].source, "k8s-layer");
        assert_eq!(sends[0].message, "api unreachable");
    }

    #[tokio::test]
    async fn worker_drains_in_order_and_exits_on_cancel() {
        let h = harness(true, false);
        seed_cancel(&h, "q1");
        seed_cancel(&h, "q2");

        let (tx, rx) = queue();
        tx.enqueue(decision(NocAction::HandleCancels(vec![cancel_alert("q1")])));
        tx.enqueue(decision(NocAction::HandleCancels(vec![cancel_alert("q2")])));

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(h.dispatcher.run(rx, cancel.clone()));

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(h.vector.get("q1").is_none());
        assert!(h.vector.get("q2").is_none());

        cancel.cancel();
        worker.await.unwrap();
    }
}
