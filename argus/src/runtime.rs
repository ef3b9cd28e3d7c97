//! Builds the component graph, registers the timer callbacks, and spawns the
//! long-running tasks.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admin;
use crate::config::ArgusConfig;
use crate::heartbeat::HeartbeatService;
use crate::leader::{pod_identity, LeaderElector};
use crate::liveness::LivenessVector;
use crate::noc::client::{HttpNocClient, NocError, NocTransport};
use crate::noc::health::NocHealth;
use crate::noc::queue::{self, NocDispatcher};
use crate::noc::snapshot::NocSnapshot;
use crate::sources::k8s_layer::K8sLayerSource;
use crate::sources::prometheus::PrometheusSource;
use crate::sources::status_fs::StatusFileSystemSource;
use crate::suppression::SuppressionCache;
use crate::timer::CentralTimer;
use crate::vector::AlertsVector;
use crate::watchdog::Watchdog;

const LEADER_CALLBACK: &str = "leader-election";
const K8S_CALLBACK: &str = "k8s-layer";
const STATUS_FS_CALLBACK: &str = "status-filesystem";
const WATCHDOG_CALLBACK: &str = "watchdog";
const SNAPSHOT_CALLBACK: &str = "noc-snapshot";
const HEARTBEAT_CALLBACK: &str = "heartbeat";

/// Indicates an error bringing the runtime up
#[derive(Debug, Error)]
pub enum StartError {
    /// The NOC HTTP client could not be built
    #[error("failed to build NOC client: {0}")]
    Noc(#[from] NocError),

    /// The ingress server could not bind its address
    #[error("failed to bind ingress server: {0}")]
    Admin(#[from] hyper::Error),
}

/// Handles to the running tasks.
pub struct Runtime {
    cancel: CancellationToken,
    leader: Arc<LeaderElector>,
    admin: admin::Server,
    timer_task: tokio::task::JoinHandle<()>,
    queue_task: tokio::task::JoinHandle<()>,
}

// === impl Runtime ===

impl Runtime {
    /// Cancels the tick loop and the queue worker, abdicates the lease, and
    /// stops the ingress server.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.leader.abdicate().await;
        let _ = self.timer_task.await;
        let _ = self.queue_task.await;
        self.admin.into_join_handle().abort();
    }
}

/// Wires every component and spawns the tick loop, the queue worker, and the
/// ingress server. The server reports ready once this returns.
pub fn start(
    config: ArgusConfig,
    client: kube_client::Client,
    admin: admin::Builder,
) -> Result<Runtime, StartError> {
    let mut timer = CentralTimer::new(config.coordinator.grace_period_seconds());
    let clock = timer.clock();

    let suppression = Arc::new(SuppressionCache::new(clock.clone(), &config.default_noc));
    let vector = Arc::new(AlertsVector::new(
        clock.clone(),
        suppression.clone(),
        config.alerts_vector.alert_ttl_seconds(),
    ));
    let liveness = Arc::new(LivenessVector::new());
    let noc_health = Arc::new(NocHealth::new(config.noc.circuit_breaker.failure_threshold));
    let transport: Arc<dyn NocTransport> =
        Arc::new(HttpNocClient::new(config.noc.http_client.clone())?);

    let leader = Arc::new(LeaderElector::new(
        client.clone(),
        config.leader_election.clone(),
        pod_identity(),
    ));
    let watchdog = Arc::new(Watchdog::new(
        clock.clone(),
        vector.clone(),
        config.watchdog.clone(),
    ));
    let prometheus = Arc::new(PrometheusSource::new(
        vector.clone(),
        watchdog.clone(),
        config.watchdog.alert_name.clone(),
        config.default_noc.clone(),
    ));
    let k8s = Arc::new(K8sLayerSource::new(
        client,
        config.k8s_layer.clone(),
        config.default_noc.clone(),
        vector.clone(),
    ));
    let heartbeat_directory = PathBuf::from(&config.heartbeat.file.destination_path)
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let status_fs = Arc::new(StatusFileSystemSource::new(
        heartbeat_directory,
        config.default_noc.clone(),
        vector.clone(),
    ));

    let (queue_tx, queue_rx) = queue::queue();
    let snapshot = Arc::new(NocSnapshot::new(
        vector.clone(),
        suppression.clone(),
        queue_tx,
    ));
    let dispatcher = NocDispatcher::new(
        transport.clone(),
        vector.clone(),
        suppression,
        noc_health.clone(),
        leader.watch(),
        config.noc.enabled,
        config.noc.http_client.clone(),
    );
    let heartbeat = Arc::new(HeartbeatService::new(
        clock.clone(),
        liveness.clone(),
        noc_health.clone(),
        transport,
        leader.watch(),
        config.noc.enabled,
        config.heartbeat.clone(),
        config.noc.http_client.clone(),
    ));

    // Callback registration order is dispatch order within a tick.
    {
        let leader = leader.clone();
        let liveness = liveness.clone();
        let interval = config.leader_election.renew_interval_seconds.max(1);
        timer.register(LEADER_CALLBACK, interval, false, move |ctx| {
            let leader = leader.clone();
            let liveness = liveness.clone();
            async move {
                leader.tick().await;
                liveness.record_execution(LEADER_CALLBACK, interval, ctx.tick);
                Ok(())
            }
        });
    }
    {
        let k8s = k8s.clone();
        let liveness = liveness.clone();
        let interval = config.k8s_layer.polling_interval_seconds.max(1);
        timer.register(K8S_CALLBACK, interval, false, move |ctx| {
            let k8s = k8s.clone();
            let liveness = liveness.clone();
            async move {
                k8s.poll().await;
                liveness.record_execution(K8S_CALLBACK, interval, ctx.tick);
                Ok(())
            }
        });
    }
    {
        let status_fs = status_fs.clone();
        let liveness = liveness.clone();
        let interval = config.status_file_system.polling_interval_seconds.max(1);
        timer.register(STATUS_FS_CALLBACK, interval, false, move |ctx| {
            let status_fs = status_fs.clone();
            let liveness = liveness.clone();
            async move {
                status_fs.probe().await;
                liveness.record_execution(STATUS_FS_CALLBACK, interval, ctx.tick);
                Ok(())
            }
        });
    }
    {
        let watchdog = watchdog.clone();
        let liveness = liveness.clone();
        let interval = watchdog.timeout_ticks();
        timer.register(WATCHDOG_CALLBACK, interval, true, move |ctx| {
            let watchdog = watchdog.clone();
            let liveness = liveness.clone();
            async move {
                watchdog.evaluate(false);
                liveness.record_execution(WATCHDOG_CALLBACK, interval, ctx.tick);
                Ok(())
            }
        });
    }
    {
        let snapshot = snapshot.clone();
        let liveness = liveness.clone();
        let interval = config.coordinator.snapshot_interval_seconds.max(1);
        timer.register(SNAPSHOT_CALLBACK, interval, true, move |ctx| {
            let snapshot = snapshot.clone();
            let liveness = liveness.clone();
            async move {
                snapshot.run(&ctx.correlation_id);
                liveness.record_execution(SNAPSHOT_CALLBACK, interval, ctx.tick);
                Ok(())
            }
        });
    }
    {
        let heartbeat = heartbeat.clone();
        let liveness = liveness.clone();
        let interval = config.heartbeat.interval_seconds.max(1);
        timer.register(HEARTBEAT_CALLBACK, interval, false, move |ctx| {
            let heartbeat = heartbeat.clone();
            let liveness = liveness.clone();
            async move {
                heartbeat.tick(ctx.tick, &ctx.correlation_id).await;
                liveness.record_execution(HEARTBEAT_CALLBACK, interval, ctx.tick);
                Ok(())
            }
        });
    }

    let readers = Arc::new(admin::StatusReaders {
        clock,
        grace_period_seconds: timer.grace_period_seconds(),
        liveness,
        vector,
        watchdog,
        noc_health,
        leader: leader.clone(),
        k8s,
        prometheus,
        timer_metrics: timer.metrics(),
    });

    let bound = admin.bind()?;
    let ready = bound.readiness();
    let admin = bound.spawn(readers);

    let cancel = CancellationToken::new();
    let timer_task = tokio::spawn(timer.run(cancel.clone()));
    let queue_task = tokio::spawn(dispatcher.run(queue_rx, cancel.clone()));
    ready.set(true);
    info!(
        addr = %admin.local_addr(),
        identity = %leader.identity(),
        "Runtime started"
    );

    Ok(Runtime {
        cancel,
        leader,
        admin,
        timer_task,
        queue_task,
    })
}
