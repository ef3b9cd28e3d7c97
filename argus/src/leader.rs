//! Lease-based leader election.
//!
//! All replicas compute the same decisions; the lease only gates the mutating
//! NOC send and the file heartbeat. The election runs as a non-grace-aware
//! timer callback: the leader renews its claim, followers watch for expiry
//! and take over. Conflicts (409) and a missing lease (404) demote the
//! leader; anything else is a warning that leaves state unchanged.

use chrono::Utc;
use k8s_openapi::api::coordination::v1 as coordv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube_client::api::{Api, PostParams};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::LeaderElectionConfig;

/// Identity and role of this replica.
#[derive(Clone, Debug)]
pub struct LeadershipState {
    pub is_leader: bool,
    pub current_leader: Option<String>,
    pub pod_identity: String,
}

pub struct LeaderElector {
    api: Api<coordv1::Lease>,
    config: LeaderElectionConfig,
    identity: String,
    state: Mutex<InnerState>,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
struct InnerState {
    is_leader: bool,
    current_leader: Option<String>,
}

/// The pod's identity as lease holder: `POD_NAME` when set, else a fresh
/// random identifier.
pub fn pod_identity() -> String {
    std::env::var("POD_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("argus-{}", crate::random_suffix(8)))
}

// === impl LeaderElector ===

impl LeaderElector {
    pub fn new(client: kube_client::Client, config: LeaderElectionConfig, identity: String) -> Self {
        let api = Api::namespaced(client, &config.lease_namespace);
        let (tx, rx) = watch::channel(false);
        Self {
            api,
            config,
            identity,
            state: Mutex::new(InnerState::default()),
            tx,
            rx,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().is_leader
    }

    pub fn leadership(&self) -> LeadershipState {
        let state = self.state.lock();
        LeadershipState {
            is_leader: state.is_leader,
            current_leader: state.current_leader.clone(),
            pod_identity: self.identity.clone(),
        }
    }

    /// A receiver that observes leadership flips. The channel is
    /// edge-triggered: a value is published only on an actual transition.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// One election round; runs every `RenewIntervalSeconds`.
    pub async fn tick(&self) {
        let result = if self.is_leader() {
            self.renew().await
        } else {
            self.try_acquire().await
        };
        if let Err(error) = result {
            warn!(%error, lease = %self.config.lease_name, "Lease operation failed");
        }
    }

    /// Renews our claim. Losing the holder field, a conflict, or a missing
    /// lease all demote us.
    async fn renew(&self) -> Result<(), kube_client::Error> {
        let mut lease = match self.api.get(&self.config.lease_name).await {
            Ok(lease) => lease,
            Err(error) if status_code(&error) == Some(404) => {
                self.demote("lease disappeared");
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let holder = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.clone());
        if holder.as_deref() != Some(self.identity.as_str()) {
            self.set_follower(holder);
            return Ok(());
        }

        let spec = lease.spec.get_or_insert_with(Default::default);
        spec.renew_time = Some(MicroTime(Utc::now()));
        spec.lease_duration_seconds = Some(self.config.lease_duration_seconds as i32);

        match self
            .api
            .replace(&self.config.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                debug!(lease = %self.config.lease_name, "Lease renewed");
                Ok(())
            }
            Err(error) if matches!(status_code(&error), Some(409) | Some(404)) => {
                self.demote("lease renewal conflict");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Attempts to claim the lease: creates it when missing, takes over when
    /// it is expired or already ours, otherwise remembers the holder.
    async fn try_acquire(&self) -> Result<(), kube_client::Error> {
        let mut lease = match self.api.get(&self.config.lease_name).await {
            Ok(lease) => lease,
            Err(error) if status_code(&error) == Some(404) => {
                return self.create_lease().await;
            }
            Err(error) => return Err(error),
        };

        let now = Utc::now();
        let spec = lease.spec.get_or_insert_with(Default::default);
        let holder = spec.holder_identity.clone();
        if !claimable(spec, now, &self.identity, self.config.lease_duration_seconds) {
            self.set_follower(holder);
            return Ok(());
        }

        spec.holder_identity = Some(self.identity.clone());
        spec.lease_duration_seconds = Some(self.config.lease_duration_seconds as i32);
        spec.acquire_time = Some(
            spec.acquire_time
                .clone()
                .unwrap_or(MicroTime(now)),
        );
        spec.renew_time = Some(MicroTime(now));
        spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);

        match self
            .api
            .replace(&self.config.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                self.promote();
                Ok(())
            }
            Err(error) if status_code(&error) == Some(409) => {
                debug!(lease = %self.config.lease_name, "Lost lease claim race");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn create_lease(&self) -> Result<(), kube_client::Error> {
        let now = Utc::now();
        let lease = coordv1::Lease {
            metadata: ObjectMeta {
                name: Some(self.config.lease_name.clone()),
                namespace: Some(self.config.lease_namespace.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(coordv1::LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.config.lease_duration_seconds as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(1),
                ..coordv1::LeaseSpec::default()
            }),
        };

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                self.promote();
                Ok(())
            }
            Err(error) if status_code(&error) == Some(409) => {
                // Another replica created it first; re-read on the next round.
                debug!(lease = %self.config.lease_name, "Lease created concurrently");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Clears the lease holder if we hold it. Called on shutdown so another
    /// replica can claim before the lease duration expires.
    pub async fn abdicate(&self) {
        if !self.is_leader() {
            return;
        }

        let result = async {
            let mut lease = self.api.get(&self.config.lease_name).await?;
            if let Some(spec) = lease.spec.as_mut() {
                if spec.holder_identity.as_deref() == Some(self.identity.as_str()) {
                    spec.holder_identity = None;
                    spec.acquire_time = None;
                    spec.renew_time = None;
                    self.api
                        .replace(&self.config.lease_name, &PostParams::default(), &lease)
                        .await?;
                }
            }
            Ok::<(), kube_client::Error>(())
        }
        .await;

        if let Err(error) = result {
            debug!(%error, "Failed to abdicate lease");
        }
        self.demote("shutting down");
    }

    fn promote(&self) {
        let mut state = self.state.lock();
        state.current_leader = Some(self.identity.clone());
        if !state.is_leader {
            state.is_leader = true;
            info!(identity = %self.identity, lease = %self.config.lease_name, "Acquired leadership");
            self.tx.send_replace(true);
        }
    }

    fn demote(&self, reason: &str) {
        let mut state = self.state.lock();
        state.current_leader = None;
        if state.is_leader {
            state.is_leader = false;
            info!(identity = %self.identity, reason, "Lost leadership");
            self.tx.send_replace(false);
        }
    }

    fn set_follower(&self, holder: Option<String>) {
        let mut state = self.state.lock();
        let was_leader = state.is_leader;
        state.current_leader = holder.clone();
        if state.is_leader {
            state.is_leader = false;
            info!(
                identity = %self.identity,
                holder = holder.as_deref().unwrap_or("<none>"),
                "Lost leadership to another holder"
            );
            self.tx.send_replace(false);
        }
        if !was_leader {
            debug!(holder = holder.as_deref().unwrap_or("<none>"), "Following");
        }
    }
}

/// Whether a follower may claim the lease: no holder, an expired renew time,
/// or the holder is already us (e.g. after a restart).
fn claimable(
    spec: &coordv1::LeaseSpec,
    now: chrono::DateTime<Utc>,
    identity: &str,
    lease_duration_seconds: i64,
) -> bool {
    let holder = match spec.holder_identity.as_deref() {
        Some(holder) if !holder.is_empty() => holder,
        _ => return true,
    };
    if holder == identity {
        return true;
    }
    match spec.renew_time.as_ref() {
        Some(MicroTime(renewed)) => {
            (now - *renewed) > chrono::Duration::seconds(lease_duration_seconds)
        }
        None => true,
    }
}

fn status_code(error: &kube_client::Error) -> Option<u16> {
    match error {
        kube_client::Error::Api(response) => Some(response.code),
        _ => None,
    }
}
