//! The central tick scheduler.
//!
//! A single loop wakes every second, advances the tick count, and dispatches
//! the registered callbacks whose interval divides the current tick. All
//! callbacks launched in the same tick share one correlation id. Successive
//! invocations of the same callback are serialized by a running flag: an
//! overlapping invocation is dropped and counted rather than queued, so a
//! slow dependency can never stall the loop; the liveness vector flags the
//! stuck callback instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Seconds between ticks. The tick arithmetic throughout the crate assumes
/// this is 1.
pub const TICK_INTERVAL_SECONDS: u64 = 1;

/// Errors surfaced by a callback are opaque to the scheduler; they are logged
/// and counted, nothing more.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

type CallbackFuture = Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send>>;
type CallbackFn = Box<dyn Fn(TickContext) -> CallbackFuture + Send + Sync>;

/// The monotonically increasing tick count and the wall clock of the last
/// tick, shared with every component that stamps tick state.
#[derive(Debug)]
pub struct TickClock {
    tick: AtomicU64,
    heartbeat: RwLock<DateTime<Utc>>,
}

/// Arguments handed to each callback invocation.
#[derive(Clone, Debug)]
pub struct TickContext {
    pub tick: u64,
    /// Shared by all callbacks launched in the same tick.
    pub correlation_id: Arc<str>,
    pub cancel: CancellationToken,
}

/// Counters published on the health surface.
#[derive(Debug, Default)]
pub struct TimerMetrics {
    callbacks_skipped: AtomicU64,
    callback_errors: AtomicU64,
}

struct Registration {
    name: String,
    interval_ticks: u64,
    grace_aware: bool,
    running: Arc<AtomicBool>,
    f: CallbackFn,
}

/// The tick-driven coordination engine.
pub struct CentralTimer {
    clock: Arc<TickClock>,
    grace_period_seconds: u64,
    callbacks: Vec<Registration>,
    metrics: Arc<TimerMetrics>,
}

// === impl TickClock ===

impl TickClock {
    pub(crate) fn new() -> Self {
        Self {
            tick: AtomicU64::new(0),
            heartbeat: RwLock::new(Utc::now()),
        }
    }

    /// The current tick count.
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Wall clock at the last tick.
    pub fn timestamp(&self) -> DateTime<Utc> {
        *self.heartbeat.read()
    }

    pub(crate) fn advance(&self) -> u64 {
        let tick = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        *self.heartbeat.write() = Utc::now();
        tick
    }
}

// === impl TimerMetrics ===

impl TimerMetrics {
    pub fn callbacks_skipped(&self) -> u64 {
        self.callbacks_skipped.load(Ordering::Relaxed)
    }

    pub fn callback_errors(&self) -> u64 {
        self.callback_errors.load(Ordering::Relaxed)
    }
}

// === impl CentralTimer ===

impl CentralTimer {
    pub fn new(grace_period_seconds: u64) -> Self {
        Self {
            clock: Arc::new(TickClock::new()),
            grace_period_seconds,
            callbacks: Vec::new(),
            metrics: Arc::new(TimerMetrics::default()),
        }
    }

    pub fn clock(&self) -> Arc<TickClock> {
        self.clock.clone()
    }

    pub fn metrics(&self) -> Arc<TimerMetrics> {
        self.metrics.clone()
    }

    pub fn grace_period_seconds(&self) -> u64 {
        self.grace_period_seconds
    }

    /// Whether the startup grace period is still active. Grace-aware
    /// callbacks do not run while this is true.
    pub fn is_grace_period_active(&self) -> bool {
        self.clock.tick() < self.grace_period_seconds
    }

    /// Registers a callback to run every `interval_ticks` ticks.
    ///
    /// Names are unique; a second registration under an existing name is
    /// rejected.
    pub fn register<F, Fut>(
        &mut self,
        name: impl ToString,
        interval_ticks: u64,
        grace_aware: bool,
        f: F,
    ) -> bool
    where
        F: Fn(TickContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        let name = name.to_string();
        if self.callbacks.iter().any(|c| c.name == name) {
            warn!(callback = %name, "Duplicate callback registration rejected");
            return false;
        }

        debug!(callback = %name, interval_ticks, grace_aware, "Callback registered");
        self.callbacks.push(Registration {
            name,
            interval_ticks: interval_ticks.max(1),
            grace_aware,
            running: Arc::new(AtomicBool::new(false)),
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        });
        true
    }

    /// Runs the tick loop until the token is cancelled.
    ///
    /// Callbacks are launched concurrently in registration order; the loop
    /// never waits for them before advancing.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECONDS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick completes immediately; consume it so the
        // first counted tick lands a full second after startup.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Tick loop cancelled");
                    return;
                }
                _ = interval.tick() => {}
            }

            let tick = self.clock.advance();
            let grace_active = tick < self.grace_period_seconds;
            let correlation_id: Arc<str> = new_correlation_id(tick).into();
            trace!(tick, correlation_id = %correlation_id, "Tick");

            for callback in &self.callbacks {
                if tick % callback.interval_ticks != 0 {
                    continue;
                }
                if callback.grace_aware && grace_active {
                    trace!(callback = %callback.name, tick, "Skipped during grace period");
                    continue;
                }
                if callback.running.swap(true, Ordering::AcqRel) {
                    self.metrics.callbacks_skipped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        callback = %callback.name,
                        tick,
                        "Callback still running, skipping invocation"
                    );
                    continue;
                }

                let fut = (callback.f)(TickContext {
                    tick,
                    correlation_id: correlation_id.clone(),
                    cancel: cancel.child_token(),
                });
                let running = callback.running.clone();
                let name = callback.name.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    if let Err(error) = fut.await {
                        metrics.callback_errors.fetch_add(1, Ordering::Relaxed);
                        error!(callback = %name, %error, "Callback failed");
                    }
                    running.store(false, Ordering::Release);
                });
            }
        }
    }
}

/// One correlation id per tick, shared by every callback launched in it.
fn new_correlation_id(tick: u64) -> String {
    format!("tick-{:05}-{}", tick, crate::random_suffix(8))
}
