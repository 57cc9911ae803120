//! Endpoint lifecycle manager: wake, sleep, and the auto-sleep sweep.
//!
//! All status transitions flow through here. Wake and sleep for a given
//! variant are serialized on a per-endpoint async lock, so two concurrent
//! wake calls produce exactly one management-API request: the second caller
//! parks on the lock, re-checks status, and sees `running`.
//!
//! ```text
//! wake:  sleeping ──request──▶ starting ──poll 2s,4s,8s..30s──▶ running
//!                                   │ 5 min ceiling
//!                                   └──────────────▶ error (WakeTimeout)
//! sleep: running ──▶ stopping ──request──▶ sleeping
//! ```
//!
//! The sweeper walks every endpoint on an interval and puts to sleep the
//! running ones whose auto-sleep deadline has passed with nothing in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::events::{OrchestrationEvent, SharedEventBus};

use super::control::EndpointControl;
use super::error::EndpointError;
use super::tracker::EndpointTracker;
use super::types::{EndpointStatus, ModelVariant};

/// First wake poll delay; doubles up to [`WAKE_BACKOFF_CAP`].
const WAKE_BACKOFF_BASE: Duration = Duration::from_secs(2);
const WAKE_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Attempts per management request (wake/sleep) before giving up.
const CONTROL_RETRIES: u32 = 3;
const CONTROL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Consecutive failed status probes tolerated while waiting for a wake.
const MAX_PROBE_FAILURES: u32 = 5;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Lifecycle metrics counters
#[derive(Debug, Default)]
pub struct LifecycleMetrics {
    wakes_requested: AtomicU64,
    wakes_succeeded: AtomicU64,
    wake_timeouts: AtomicU64,
    sleeps: AtomicU64,
    auto_sleeps: AtomicU64,
    management_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleMetricsSnapshot {
    pub wakes_requested: u64,
    pub wakes_succeeded: u64,
    pub wake_timeouts: u64,
    pub sleeps: u64,
    pub auto_sleeps: u64,
    pub management_errors: u64,
}

impl LifecycleMetrics {
    fn record_wake_requested(&self) {
        self.wakes_requested.fetch_add(1, Ordering::Relaxed);
    }

    fn record_wake_succeeded(&self) {
        self.wakes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_wake_timeout(&self) {
        self.wake_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_sleep(&self, auto: bool) {
        if auto {
            self.auto_sleeps.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sleeps.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_management_error(&self) {
        self.management_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LifecycleMetricsSnapshot {
        LifecycleMetricsSnapshot {
            wakes_requested: self.wakes_requested.load(Ordering::Relaxed),
            wakes_succeeded: self.wakes_succeeded.load(Ordering::Relaxed),
            wake_timeouts: self.wake_timeouts.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
            auto_sleeps: self.auto_sleeps.load(Ordering::Relaxed),
            management_errors: self.management_errors.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Drives endpoint wake/sleep against the management API.
pub struct LifecycleManager {
    tracker: Arc<EndpointTracker>,
    control: Arc<dyn EndpointControl>,
    events: SharedEventBus,
    metrics: LifecycleMetrics,
    /// Serializes wake/sleep per endpoint.
    op_locks: HashMap<ModelVariant, tokio::sync::Mutex<()>>,
    wake_timeout: Duration,
    sweep_interval: Duration,
}

impl LifecycleManager {
    pub fn new(
        tracker: Arc<EndpointTracker>,
        control: Arc<dyn EndpointControl>,
        events: SharedEventBus,
        config: &GatewayConfig,
    ) -> Self {
        let op_locks = ModelVariant::all()
            .into_iter()
            .map(|id| (id, tokio::sync::Mutex::new(())))
            .collect();
        Self {
            tracker,
            control,
            events,
            metrics: LifecycleMetrics::default(),
            op_locks,
            wake_timeout: config.wake_timeout,
            sweep_interval: config.sweep_interval,
        }
    }

    pub fn metrics_snapshot(&self) -> LifecycleMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn op_lock(&self, id: ModelVariant) -> Result<&tokio::sync::Mutex<()>, EndpointError> {
        self.op_locks
            .get(&id)
            .ok_or(EndpointError::UnknownEndpoint { id })
    }

    /// Bring an endpoint to `running`. Idempotent: a running endpoint
    /// returns immediately, and a caller that queues behind an in-flight
    /// wake returns without issuing a second request.
    pub async fn wake(&self, id: ModelVariant) -> Result<(), EndpointError> {
        if self.tracker.get_status(id)?.status == EndpointStatus::Running {
            return Ok(());
        }

        let _guard = self.op_lock(id)?.lock().await;
        if self.tracker.get_status(id)?.status == EndpointStatus::Running {
            return Ok(());
        }
        self.wake_locked(id).await
    }

    async fn wake_locked(&self, id: ModelVariant) -> Result<(), EndpointError> {
        let started = tokio::time::Instant::now();
        self.metrics.record_wake_requested();
        self.events.publish(OrchestrationEvent::WakeRequested {
            endpoint: id,
            timestamp: Utc::now(),
        });
        info!(endpoint = %id, "waking endpoint");

        if let Err(err) = self.request_with_retry(id, true).await {
            self.wake_failed(id, &err);
            return Err(err);
        }
        self.tracker.set_status(id, EndpointStatus::Starting)?;

        let mut backoff = WAKE_BACKOFF_BASE;
        let mut probe_failures = 0u32;
        while started.elapsed() < self.wake_timeout {
            match self.control.probe_status(id).await {
                Ok(EndpointStatus::Running) => {
                    self.tracker.set_status(id, EndpointStatus::Running)?;
                    self.tracker.record_activity(id)?;
                    let waited_ms = started.elapsed().as_millis() as u64;
                    self.metrics.record_wake_succeeded();
                    self.events.publish(OrchestrationEvent::EndpointWoke {
                        endpoint: id,
                        waited_ms,
                        timestamp: Utc::now(),
                    });
                    info!(endpoint = %id, waited_ms, "endpoint running");
                    return Ok(());
                }
                Ok(other) => {
                    probe_failures = 0;
                    debug!(endpoint = %id, status = %other, "endpoint not ready yet");
                }
                Err(e) => {
                    probe_failures += 1;
                    warn!(endpoint = %id, probe_failures, error = %e, "status probe failed");
                    if probe_failures >= MAX_PROBE_FAILURES {
                        self.tracker.set_status(id, EndpointStatus::Error)?;
                        let err = EndpointError::Management {
                            id,
                            message: e.to_string(),
                        };
                        self.wake_failed(id, &err);
                        return Err(err);
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(WAKE_BACKOFF_CAP);
        }

        self.tracker.set_status(id, EndpointStatus::Error)?;
        self.metrics.record_wake_timeout();
        let err = EndpointError::WakeTimeout {
            id,
            waited_secs: started.elapsed().as_secs(),
        };
        self.events.publish(OrchestrationEvent::WakeFailed {
            endpoint: id,
            error: err.to_string(),
            timestamp: Utc::now(),
        });
        warn!(endpoint = %id, "wake timed out");
        Err(err)
    }

    fn wake_failed(&self, id: ModelVariant, err: &EndpointError) {
        self.metrics.record_management_error();
        self.events.publish(OrchestrationEvent::WakeFailed {
            endpoint: id,
            error: err.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Put an endpoint to sleep. Sleeping endpoints are a no-op. Does not
    /// wait for in-flight inference calls.
    pub async fn sleep(&self, id: ModelVariant) -> Result<(), EndpointError> {
        if self.tracker.get_status(id)?.status == EndpointStatus::Sleeping {
            return Ok(());
        }
        let _guard = self.op_lock(id)?.lock().await;
        self.sleep_locked(id, false).await
    }

    async fn sleep_locked(&self, id: ModelVariant, auto: bool) -> Result<(), EndpointError> {
        if self.tracker.get_status(id)?.status == EndpointStatus::Sleeping {
            return Ok(());
        }
        self.tracker.set_status(id, EndpointStatus::Stopping)?;

        match self.request_with_retry(id, false).await {
            Ok(()) => {
                self.tracker.set_status(id, EndpointStatus::Sleeping)?;
                self.metrics.record_sleep(auto);
                self.events.publish(OrchestrationEvent::EndpointSlept {
                    endpoint: id,
                    auto,
                    timestamp: Utc::now(),
                });
                info!(endpoint = %id, auto, "endpoint sleeping");
                Ok(())
            }
            Err(err) => {
                self.metrics.record_management_error();
                self.tracker.set_status(id, EndpointStatus::Error)?;
                Err(err)
            }
        }
    }

    /// Issue one management request (wake or sleep) with bounded retries.
    async fn request_with_retry(&self, id: ModelVariant, wake: bool) -> Result<(), EndpointError> {
        let mut last_error = String::new();
        for attempt in 1..=CONTROL_RETRIES {
            let result = if wake {
                self.control.request_wake(id).await
            } else {
                self.control.request_sleep(id).await
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(endpoint = %id, attempt, wake, error = %e, "management request failed");
                    last_error = e.to_string();
                    if attempt < CONTROL_RETRIES {
                        tokio::time::sleep(CONTROL_RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(EndpointError::Management {
            id,
            message: last_error,
        })
    }

    /// One sweep pass: sleep every running endpoint whose deadline has
    /// passed with zero in-flight calls. Returns the variants put to sleep.
    pub async fn auto_sleep_sweep(&self) -> Vec<ModelVariant> {
        let now = Utc::now();
        let mut slept = Vec::new();

        for snapshot in self.tracker.snapshot_all() {
            if snapshot.status != EndpointStatus::Running || snapshot.in_flight > 0 {
                continue;
            }
            let Some(deadline) = snapshot.auto_sleep_deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }

            let Ok(lock) = self.op_lock(snapshot.id) else {
                continue;
            };
            let _guard = lock.lock().await;

            // Re-check under the lock: a call or a manual wake/sleep may
            // have raced the scan.
            let Ok(current) = self.tracker.get_status(snapshot.id) else {
                continue;
            };
            let still_idle = current.status == EndpointStatus::Running
                && current.in_flight == 0
                && current.auto_sleep_deadline.map_or(false, |d| d <= Utc::now());
            if !still_idle {
                continue;
            }

            match self.sleep_locked(snapshot.id, true).await {
                Ok(()) => slept.push(snapshot.id),
                Err(e) => warn!(endpoint = %snapshot.id, error = %e, "auto-sleep failed"),
            }
        }

        if !slept.is_empty() {
            info!(count = slept.len(), "auto-sleep swept endpoints");
        }
        slept
    }

    /// Run the sweep on a fixed interval until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("sweeper cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let swept = manager.auto_sleep_sweep().await;
                        debug!(swept = swept.len(), metrics = ?manager.metrics.snapshot(), "sweep pass finished");
                    }
                }
            }
        })
    }

    /// Wake every endpoint; each outcome independent.
    pub async fn wake_all(&self) -> Vec<(ModelVariant, Result<(), EndpointError>)> {
        let ops = ModelVariant::all().map(|id| async move { (id, self.wake(id).await) });
        futures::future::join_all(ops).await
    }

    /// Sleep every endpoint; each outcome independent.
    pub async fn sleep_all(&self) -> Vec<(ModelVariant, Result<(), EndpointError>)> {
        let ops = ModelVariant::all().map(|id| async move { (id, self.sleep(id).await) });
        futures::future::join_all(ops).await
    }

    /// Startup reconciliation: probe every endpoint and overwrite tracker
    /// state with what the provider reports. Probe failures leave the
    /// endpoint `unknown`.
    pub async fn resync(&self) -> Vec<(ModelVariant, EndpointStatus)> {
        let mut statuses = Vec::new();
        for id in ModelVariant::all() {
            let status = match self.control.probe_status(id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(endpoint = %id, error = %e, "status probe failed during resync");
                    EndpointStatus::Unknown
                }
            };
            if let Err(e) = self.tracker.sync_status(id, status) {
                warn!(endpoint = %id, error = %e, "resync skipped endpoint");
                continue;
            }
            // A running endpoint gets a fresh deadline so an idle restart
            // still becomes sweep-eligible.
            if status == EndpointStatus::Running {
                if let Err(e) = self.tracker.record_activity(id) {
                    warn!(endpoint = %id, error = %e, "resync activity stamp failed");
                }
            }
            info!(endpoint = %id, %status, "endpoint resynced");
            statuses.push((id, status));
        }
        statuses
    }
}
