//! The HTTP ingress: alert intake, status readers, and probe endpoints.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Method, Request, Response, StatusCode};
use tracing::{debug, info_span, warn, Instrument};

use crate::leader::LeaderElector;
use crate::liveness::LivenessVector;
use crate::noc::health::NocHealth;
use crate::sources::k8s_layer::K8sLayerSource;
use crate::sources::prometheus::{PrometheusAlert, PrometheusSource};
use crate::timer::{TickClock, TimerMetrics};
use crate::vector::AlertsVector;
use crate::watchdog::Watchdog;

/// Server errors
pub type Error = hyper::Error;

/// Command-line arguments used to configure the ingress server
#[derive(Clone, Debug, clap::Parser)]
pub struct AdminArgs {
    /// The ingress server's address
    #[clap(long, default_value = "0.0.0.0:8080")]
    pub admin_addr: SocketAddr,
}

/// Supports configuring the ingress server
#[derive(Debug)]
pub struct Builder {
    addr: SocketAddr,
    ready: Readiness,
}

/// A bound server that has not started accepting connections yet
pub struct Bound {
    addr: SocketAddr,
    ready: Readiness,
    server: hyper::server::Builder<hyper::server::conn::AddrIncoming>,
}

/// Controls how the server advertises readiness
#[derive(Clone, Debug)]
pub struct Readiness(Arc<AtomicBool>);

/// A handle to a running ingress server
#[derive(Debug)]
pub struct Server {
    addr: SocketAddr,
    ready: Readiness,
    task: tokio::task::JoinHandle<Result<(), hyper::Error>>,
}

/// The shared read surface behind the status endpoints.
pub struct StatusReaders {
    pub clock: Arc<TickClock>,
    pub grace_period_seconds: u64,
    pub liveness: Arc<LivenessVector>,
    pub vector: Arc<AlertsVector>,
    pub watchdog: Arc<Watchdog>,
    pub noc_health: Arc<NocHealth>,
    pub leader: Arc<LeaderElector>,
    pub k8s: Arc<K8sLayerSource>,
    pub prometheus: Arc<PrometheusSource>,
    pub timer_metrics: Arc<TimerMetrics>,
}

// === impl AdminArgs ===

impl Default for AdminArgs {
    fn default() -> Self {
        Self {
            admin_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl AdminArgs {
    pub fn into_builder(self) -> Builder {
        Builder::new(self.admin_addr)
    }
}

// === impl Builder ===

impl Builder {
    /// The server starts unready; the runtime marks it ready once everything
    /// is wired.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            ready: Readiness(Arc::new(false.into())),
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.ready.clone()
    }

    /// Binds the server without accepting connections
    pub fn bind(self) -> Result<Bound, hyper::Error> {
        let Self { addr, ready } = self;

        let server = hyper::server::Server::try_bind(&addr)?
            // Allow weird clients (like netcat).
            .http1_half_close(true)
            // Prevent port scanners, etc, from holding connections open.
            .http1_header_read_timeout(Duration::from_secs(2))
            // Use a small buffer, since we don't really transfer much data.
            .http1_max_buf_size(8 * 1024);

        Ok(Bound {
            addr,
            ready,
            server,
        })
    }
}

// === impl Bound ===

impl Bound {
    pub fn readiness(&self) -> Readiness {
        self.ready.clone()
    }

    /// Runs the server on a background task, returning a handle
    pub fn spawn(self, state: Arc<StatusReaders>) -> Server {
        let ready = self.ready.clone();
        let make = hyper::service::make_service_fn(move |_conn| {
            let state = state.clone();
            let ready = ready.clone();
            let svc = hyper::service::service_fn(move |req| {
                handle(state.clone(), ready.clone(), req)
            });
            async move { Ok::<_, Infallible>(svc) }
        });
        let serve = self.server.serve(make);
        let task = tokio::spawn(
            async move {
                debug!("Serving");
                serve.await
            }
            .instrument(info_span!("admin", port = %self.addr.port())),
        );

        Server {
            task,
            addr: self.addr,
            ready: self.ready,
        }
    }
}

// === impl Readiness ===

impl Readiness {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }
}

// === impl Server ===

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn readiness(&self) -> Readiness {
        self.ready.clone()
    }

    pub fn into_join_handle(self) -> tokio::task::JoinHandle<Result<(), hyper::Error>> {
        self.task
    }
}

// === routes ===

async fn handle(
    state: Arc<StatusReaders>,
    ready: Readiness,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let probe = method == Method::GET || method == Method::HEAD;
    let response = match req.uri().path() {
        "/livez" if probe => text(StatusCode::OK, "alive\n"),
        "/readyz" if probe => {
            if ready.get() {
                text(StatusCode::OK, "ready\n")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
            }
        }
        "/api/v2/alerts" if method == Method::POST => handle_alerts_post(&state, req).await,
        "/api/alerts" if method == Method::GET => handle_alerts_get(&state),
        "/api/health" if method == Method::GET => handle_health(&state),
        "/api/k8s/health" if method == Method::GET => handle_k8s_health(&state),
        "/api/watchdog" if method == Method::GET => handle_watchdog(&state),
        "/livez" | "/readyz" | "/api/v2/alerts" | "/api/alerts" | "/api/health"
        | "/api/k8s/health" | "/api/watchdog" => Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::default())
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::default())
            .unwrap(),
    };
    Ok(response)
}

async fn handle_alerts_post(state: &StatusReaders, req: Request<Body>) -> Response<Body> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(%error, "Failed to read alert body");
            return text(StatusCode::BAD_REQUEST, "unreadable body\n");
        }
    };
    match serde_json::from_slice::<Vec<PrometheusAlert>>(&bytes) {
        Ok(alerts) => {
            debug!(count = alerts.len(), "Alerts received");
            state.prometheus.ingest(alerts);
            Response::builder()
                .status(StatusCode::OK)
                .body(Body::default())
                .unwrap()
        }
        Err(error) => {
            warn!(%error, "Malformed alert body");
            text(StatusCode::BAD_REQUEST, "malformed body\n")
        }
    }
}

fn handle_alerts_get(state: &StatusReaders) -> Response<Body> {
    let alerts: Vec<serde_json::Value> = state
        .vector
        .snapshot()
        .iter()
        .map(|alert| {
            serde_json::json!({
                "fingerprint": alert.fingerprint,
                "name": alert.name,
                "source": alert.source,
                "status": alert.status,
                "priority": alert.priority,
                "summary": alert.summary,
                "timestamp": alert.timestamp,
                "lastSeenTick": alert.last_seen_tick,
                "lastSeenTimestamp": alert.last_seen_timestamp,
                "executionId": alert.execution_id,
            })
        })
        .collect();
    json(serde_json::Value::Array(alerts))
}

fn handle_health(state: &StatusReaders) -> Response<Body> {
    let tick = state.clock.tick();
    let leadership = state.leader.leadership();
    let unhealthy = state.liveness.unhealthy_callbacks(tick);
    json(serde_json::json!({
        "tick": tick,
        "timestamp": state.clock.timestamp(),
        "gracePeriodActive": tick < state.grace_period_seconds,
        "leadership": {
            "isLeader": leadership.is_leader,
            "currentLeader": leadership.current_leader,
            "podIdentity": leadership.pod_identity,
        },
        "liveness": {
            "isHealthy": unhealthy.is_empty(),
            "totalCount": state.liveness.count(),
            "unhealthy": unhealthy.iter().map(|r| r.name.clone()).collect::<Vec<_>>(),
        },
        "nocCircuitBreaker": {
            "isHealthy": state.noc_health.is_healthy(),
            "consecutiveFailures": state.noc_health.consecutive_failures(),
            "failureThreshold": state.noc_health.failure_threshold(),
        },
        "counters": {
            "alertsActive": state.vector.len(),
            "alertsCreated": state.vector.metrics().created(),
            "alertsResolved": state.vector.metrics().resolved(),
            "alertsExpired": state.vector.metrics().expired(),
            "callbacksSkipped": state.timer_metrics.callbacks_skipped(),
            "callbackErrors": state.timer_metrics.callback_errors(),
            "prometheusAccepted": state.prometheus.metrics().accepted(),
            "prometheusFiltered": state.prometheus.metrics().filtered(),
        },
    }))
}

fn handle_k8s_health(state: &StatusReaders) -> Response<Body> {
    match state.k8s.last_status() {
        Some(status) => json(serde_json::json!(status)),
        None => json(serde_json::json!({ "status": "unknown" })),
    }
}

fn handle_watchdog(state: &StatusReaders) -> Response<Body> {
    let tick = state.clock.tick();
    let grace_active = tick < state.grace_period_seconds;
    let last = state.watchdog.last_heartbeat_tick();
    json(serde_json::json!({
        "status": state.watchdog.status(grace_active),
        "lastHeartbeatTick": last,
        "ageTicks": last.map(|t| tick.saturating_sub(t)),
        "timeoutTicks": state.watchdog.timeout_ticks(),
    }))
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(body.into())
        .unwrap()
}

fn json(value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}
