//! Lifecycle manager integration tests with a scripted control plane.
//!
//! Wake and timeout tests run on a paused clock so the probe backoff and
//! the five-minute wake ceiling elapse instantly. The sweep tests use real
//! time with millisecond windows because the auto-sleep deadline is
//! wall-clock based.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gateway::config::EndpointTarget;
use gateway::endpoints::{ControlError, EndpointControl};
use gateway::{
    EndpointError, EndpointStatus, EndpointTracker, EventBus, GatewayConfig, LifecycleManager,
    ModelVariant, OrchestrationEvent, SharedEventBus,
};

fn test_config(wake_timeout: Duration, auto_sleep_window: Duration) -> GatewayConfig {
    GatewayConfig {
        api_key: None,
        gpt_120b: EndpointTarget {
            base_url: "http://localhost:8601".into(),
            control_url: "http://localhost:8601".into(),
        },
        gpt_20b: EndpointTarget {
            base_url: "http://localhost:8602".into(),
            control_url: "http://localhost:8602".into(),
        },
        wake_timeout,
        auto_sleep_window,
        sweep_interval: Duration::from_secs(60),
        request_timeout: Duration::from_secs(45),
        mcp_servers: Vec::new(),
    }
}

fn rig(
    control: Arc<dyn EndpointControl>,
    config: &GatewayConfig,
) -> (Arc<EndpointTracker>, Arc<LifecycleManager>, SharedEventBus) {
    let events = EventBus::new().shared();
    let tracker = Arc::new(EndpointTracker::new(config));
    let manager = Arc::new(LifecycleManager::new(
        tracker.clone(),
        control,
        events.clone(),
        config,
    ));
    (tracker, manager, events)
}

fn drain_event_types(
    rx: &mut tokio::sync::broadcast::Receiver<OrchestrationEvent>,
) -> Vec<&'static str> {
    let mut types = Vec::new();
    while let Ok(event) = rx.try_recv() {
        types.push(event.event_type());
    }
    types
}

// ---------------------------------------------------------------------------
// Control plane stubs
// ---------------------------------------------------------------------------

/// Accepts every request; probes answer `starting` a configurable number
/// of times before `running`.
struct ReadyControl {
    warmup_probes: u32,
    wake_requests: AtomicU32,
    sleep_requests: AtomicU32,
    probes: AtomicU32,
}

impl ReadyControl {
    fn new(warmup_probes: u32) -> Arc<Self> {
        Arc::new(Self {
            warmup_probes,
            wake_requests: AtomicU32::new(0),
            sleep_requests: AtomicU32::new(0),
            probes: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl EndpointControl for ReadyControl {
    async fn request_wake(&self, _id: ModelVariant) -> Result<(), ControlError> {
        self.wake_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn request_sleep(&self, _id: ModelVariant) -> Result<(), ControlError> {
        self.sleep_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe_status(&self, _id: ModelVariant) -> Result<EndpointStatus, ControlError> {
        let seen = self.probes.fetch_add(1, Ordering::SeqCst);
        if seen < self.warmup_probes {
            Ok(EndpointStatus::Starting)
        } else {
            Ok(EndpointStatus::Running)
        }
    }
}

/// Accepts wake requests but the endpoint never leaves `starting`.
#[derive(Default)]
struct NeverReadyControl {
    probes: AtomicU32,
}

#[async_trait]
impl EndpointControl for NeverReadyControl {
    async fn request_wake(&self, _id: ModelVariant) -> Result<(), ControlError> {
        Ok(())
    }

    async fn request_sleep(&self, _id: ModelVariant) -> Result<(), ControlError> {
        Ok(())
    }

    async fn probe_status(&self, _id: ModelVariant) -> Result<EndpointStatus, ControlError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(EndpointStatus::Starting)
    }
}

/// Rejects wakes for one variant or all sleeps; probes report `running`.
struct RejectingControl {
    fail_wake: Option<ModelVariant>,
    fail_sleep: bool,
    wake_requests: AtomicU32,
    sleep_requests: AtomicU32,
}

impl RejectingControl {
    fn new(fail_wake: Option<ModelVariant>, fail_sleep: bool) -> Arc<Self> {
        Arc::new(Self {
            fail_wake,
            fail_sleep,
            wake_requests: AtomicU32::new(0),
            sleep_requests: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl EndpointControl for RejectingControl {
    async fn request_wake(&self, id: ModelVariant) -> Result<(), ControlError> {
        self.wake_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_wake == Some(id) {
            return Err(ControlError::Api {
                status: 503,
                body: "no capacity".into(),
            });
        }
        Ok(())
    }

    async fn request_sleep(&self, _id: ModelVariant) -> Result<(), ControlError> {
        self.sleep_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_sleep {
            return Err(ControlError::Api {
                status: 500,
                body: "pause failed".into(),
            });
        }
        Ok(())
    }

    async fn probe_status(&self, _id: ModelVariant) -> Result<EndpointStatus, ControlError> {
        Ok(EndpointStatus::Running)
    }
}

/// Fixed per-variant probe results; variants not listed fail the probe.
struct FixedControl {
    statuses: HashMap<ModelVariant, EndpointStatus>,
}

impl FixedControl {
    fn new(statuses: &[(ModelVariant, EndpointStatus)]) -> Arc<Self> {
        Arc::new(Self {
            statuses: statuses.iter().copied().collect(),
        })
    }
}

#[async_trait]
impl EndpointControl for FixedControl {
    async fn request_wake(&self, _id: ModelVariant) -> Result<(), ControlError> {
        Ok(())
    }

    async fn request_sleep(&self, _id: ModelVariant) -> Result<(), ControlError> {
        Ok(())
    }

    async fn probe_status(&self, id: ModelVariant) -> Result<EndpointStatus, ControlError> {
        self.statuses
            .get(&id)
            .copied()
            .ok_or_else(|| ControlError::Malformed("no state field in response".into()))
    }
}

// ---------------------------------------------------------------------------
// Wake
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_wake_reaches_running() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = ReadyControl::new(2);
    let (tracker, manager, events) = rig(control.clone(), &config);
    let mut rx = events.subscribe();

    tracker
        .sync_status(ModelVariant::Gpt120b, EndpointStatus::Sleeping)
        .unwrap();
    manager.wake(ModelVariant::Gpt120b).await.unwrap();

    let snapshot = tracker.get_status(ModelVariant::Gpt120b).unwrap();
    assert_eq!(snapshot.status, EndpointStatus::Running);
    assert!(snapshot.wake_time.is_some());
    assert!(
        snapshot.last_activity.is_some(),
        "a successful wake stamps activity"
    );
    assert_eq!(control.wake_requests.load(Ordering::SeqCst), 1);

    let metrics = manager.metrics_snapshot();
    assert_eq!(metrics.wakes_requested, 1);
    assert_eq!(metrics.wakes_succeeded, 1);

    let types = drain_event_types(&mut rx);
    assert!(types.contains(&"wake_requested"));
    assert!(types.contains(&"endpoint_woke"));
}

#[tokio::test(start_paused = true)]
async fn test_wake_running_endpoint_is_noop() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = ReadyControl::new(0);
    let (tracker, manager, _events) = rig(control.clone(), &config);

    tracker
        .sync_status(ModelVariant::Gpt120b, EndpointStatus::Running)
        .unwrap();
    manager.wake(ModelVariant::Gpt120b).await.unwrap();

    assert_eq!(control.wake_requests.load(Ordering::SeqCst), 0);
    assert_eq!(manager.metrics_snapshot().wakes_requested, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_wakes_issue_one_request() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = ReadyControl::new(1);
    let (tracker, manager, _events) = rig(control.clone(), &config);
    tracker
        .sync_status(ModelVariant::Gpt120b, EndpointStatus::Sleeping)
        .unwrap();

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.wake(ModelVariant::Gpt120b).await }
    });
    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.wake(ModelVariant::Gpt120b).await }
    });

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(
        control.wake_requests.load(Ordering::SeqCst),
        1,
        "the caller that queued behind the lock must not issue a second request"
    );
    assert_eq!(manager.metrics_snapshot().wakes_requested, 1);
}

#[tokio::test(start_paused = true)]
async fn test_wake_timeout_marks_error() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = Arc::new(NeverReadyControl::default());
    let (tracker, manager, events) = rig(control, &config);
    let mut rx = events.subscribe();
    tracker
        .sync_status(ModelVariant::Gpt120b, EndpointStatus::Sleeping)
        .unwrap();

    match manager.wake(ModelVariant::Gpt120b).await {
        Err(EndpointError::WakeTimeout { id, waited_secs }) => {
            assert_eq!(id, ModelVariant::Gpt120b);
            assert!(waited_secs >= 300, "ceiling is 300s, waited {waited_secs}s");
        }
        other => panic!("expected WakeTimeout, got {other:?}"),
    }

    assert_eq!(
        tracker.get_status(ModelVariant::Gpt120b).unwrap().status,
        EndpointStatus::Error
    );
    assert_eq!(manager.metrics_snapshot().wake_timeouts, 1);
    assert!(drain_event_types(&mut rx).contains(&"wake_failed"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_wake_leaves_status_alone() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = RejectingControl::new(Some(ModelVariant::Gpt120b), false);
    let (tracker, manager, _events) = rig(control.clone(), &config);
    tracker
        .sync_status(ModelVariant::Gpt120b, EndpointStatus::Sleeping)
        .unwrap();

    match manager.wake(ModelVariant::Gpt120b).await {
        Err(EndpointError::Management { id, .. }) => assert_eq!(id, ModelVariant::Gpt120b),
        other => panic!("expected Management error, got {other:?}"),
    }

    // Three attempts, and a request that never got accepted does not move
    // the endpoint out of sleeping.
    assert_eq!(control.wake_requests.load(Ordering::SeqCst), 3);
    assert_eq!(
        tracker.get_status(ModelVariant::Gpt120b).unwrap().status,
        EndpointStatus::Sleeping
    );
    assert_eq!(manager.metrics_snapshot().management_errors, 1);
}

// ---------------------------------------------------------------------------
// Sleep
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_sleep_running_endpoint() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = ReadyControl::new(0);
    let (tracker, manager, events) = rig(control.clone(), &config);
    let mut rx = events.subscribe();

    tracker
        .sync_status(ModelVariant::Gpt20b, EndpointStatus::Running)
        .unwrap();
    manager.sleep(ModelVariant::Gpt20b).await.unwrap();

    let snapshot = tracker.get_status(ModelVariant::Gpt20b).unwrap();
    assert_eq!(snapshot.status, EndpointStatus::Sleeping);
    assert!(snapshot.sleep_time.is_some());
    assert_eq!(control.sleep_requests.load(Ordering::SeqCst), 1);

    let metrics = manager.metrics_snapshot();
    assert_eq!(metrics.sleeps, 1);
    assert_eq!(metrics.auto_sleeps, 0);
    assert!(drain_event_types(&mut rx).contains(&"endpoint_slept"));
}

#[tokio::test(start_paused = true)]
async fn test_sleep_sleeping_endpoint_is_noop() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = ReadyControl::new(0);
    let (tracker, manager, _events) = rig(control.clone(), &config);

    tracker
        .sync_status(ModelVariant::Gpt20b, EndpointStatus::Sleeping)
        .unwrap();
    manager.sleep(ModelVariant::Gpt20b).await.unwrap();

    assert_eq!(control.sleep_requests.load(Ordering::SeqCst), 0);
    assert_eq!(manager.metrics_snapshot().sleeps, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sleep_failure_marks_error() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = RejectingControl::new(None, true);
    let (tracker, manager, _events) = rig(control, &config);

    tracker
        .sync_status(ModelVariant::Gpt20b, EndpointStatus::Running)
        .unwrap();
    match manager.sleep(ModelVariant::Gpt20b).await {
        Err(EndpointError::Management { id, .. }) => assert_eq!(id, ModelVariant::Gpt20b),
        other => panic!("expected Management error, got {other:?}"),
    }

    assert_eq!(
        tracker.get_status(ModelVariant::Gpt20b).unwrap().status,
        EndpointStatus::Error
    );
}

// ---------------------------------------------------------------------------
// Batch operations and resync
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_wake_all_outcomes_are_independent() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = RejectingControl::new(Some(ModelVariant::Gpt120b), false);
    let (tracker, manager, _events) = rig(control, &config);
    for id in ModelVariant::all() {
        tracker.sync_status(id, EndpointStatus::Sleeping).unwrap();
    }

    let outcomes = manager.wake_all().await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].0, ModelVariant::Gpt120b);
    assert!(outcomes[0].1.is_err(), "120b wake was rejected");
    assert_eq!(outcomes[1].0, ModelVariant::Gpt20b);
    assert!(outcomes[1].1.is_ok(), "20b wake succeeds independently");

    assert_eq!(
        tracker.get_status(ModelVariant::Gpt120b).unwrap().status,
        EndpointStatus::Sleeping
    );
    assert_eq!(
        tracker.get_status(ModelVariant::Gpt20b).unwrap().status,
        EndpointStatus::Running
    );
}

#[tokio::test]
async fn test_resync_overwrites_and_stamps_activity() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = FixedControl::new(&[
        (ModelVariant::Gpt120b, EndpointStatus::Running),
        (ModelVariant::Gpt20b, EndpointStatus::Sleeping),
    ]);
    let (tracker, manager, _events) = rig(control, &config);
    // A stale belief the probe must overwrite.
    tracker
        .sync_status(ModelVariant::Gpt120b, EndpointStatus::Sleeping)
        .unwrap();

    let statuses = manager.resync().await;
    assert_eq!(
        statuses,
        vec![
            (ModelVariant::Gpt120b, EndpointStatus::Running),
            (ModelVariant::Gpt20b, EndpointStatus::Sleeping),
        ]
    );

    let primary = tracker.get_status(ModelVariant::Gpt120b).unwrap();
    assert_eq!(primary.status, EndpointStatus::Running);
    assert!(
        primary.auto_sleep_deadline.is_some(),
        "a running endpoint gets a fresh deadline at resync"
    );
    let fallback = tracker.get_status(ModelVariant::Gpt20b).unwrap();
    assert_eq!(fallback.status, EndpointStatus::Sleeping);
    assert!(fallback.auto_sleep_deadline.is_none());
}

#[tokio::test]
async fn test_resync_probe_failure_reports_unknown() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = FixedControl::new(&[(ModelVariant::Gpt120b, EndpointStatus::Running)]);
    let (tracker, manager, _events) = rig(control, &config);

    let statuses = manager.resync().await;
    assert_eq!(statuses[1], (ModelVariant::Gpt20b, EndpointStatus::Unknown));
    assert_eq!(
        tracker.get_status(ModelVariant::Gpt20b).unwrap().status,
        EndpointStatus::Unknown
    );
}

// ---------------------------------------------------------------------------
// Auto-sleep sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sweep_sleeps_idle_endpoint() {
    let config = test_config(Duration::from_secs(300), Duration::from_millis(10));
    let control = ReadyControl::new(0);
    let (tracker, manager, events) = rig(control, &config);
    let mut rx = events.subscribe();

    tracker
        .sync_status(ModelVariant::Gpt120b, EndpointStatus::Running)
        .unwrap();
    tracker.record_activity(ModelVariant::Gpt120b).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let swept = manager.auto_sleep_sweep().await;
    assert_eq!(swept, vec![ModelVariant::Gpt120b]);
    assert_eq!(
        tracker.get_status(ModelVariant::Gpt120b).unwrap().status,
        EndpointStatus::Sleeping
    );
    assert_eq!(manager.metrics_snapshot().auto_sleeps, 1);

    let mut auto_flag = None;
    while let Ok(event) = rx.try_recv() {
        if let OrchestrationEvent::EndpointSlept { auto, .. } = event {
            auto_flag = Some(auto);
        }
    }
    assert_eq!(auto_flag, Some(true), "sweep sleeps publish auto=true");
}

#[tokio::test]
async fn test_sweep_skips_in_flight_calls() {
    let config = test_config(Duration::from_secs(300), Duration::from_millis(10));
    let control = ReadyControl::new(0);
    let (tracker, manager, _events) = rig(control, &config);

    tracker
        .sync_status(ModelVariant::Gpt120b, EndpointStatus::Running)
        .unwrap();
    tracker.record_activity(ModelVariant::Gpt120b).unwrap();
    let guard = tracker.begin_call(ModelVariant::Gpt120b).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(manager.auto_sleep_sweep().await.is_empty());
    assert_eq!(
        tracker.get_status(ModelVariant::Gpt120b).unwrap().status,
        EndpointStatus::Running
    );

    drop(guard);
    assert_eq!(
        manager.auto_sleep_sweep().await,
        vec![ModelVariant::Gpt120b]
    );
}

#[tokio::test]
async fn test_sweep_skips_fresh_activity() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(300));
    let control = ReadyControl::new(0);
    let (tracker, manager, _events) = rig(control, &config);

    // 120b is active well inside its window; 20b is running with no
    // recorded activity and therefore no deadline.
    tracker
        .sync_status(ModelVariant::Gpt120b, EndpointStatus::Running)
        .unwrap();
    tracker.record_activity(ModelVariant::Gpt120b).unwrap();
    tracker
        .sync_status(ModelVariant::Gpt20b, EndpointStatus::Running)
        .unwrap();

    assert!(manager.auto_sleep_sweep().await.is_empty());
    assert_eq!(
        tracker.get_status(ModelVariant::Gpt120b).unwrap().status,
        EndpointStatus::Running
    );
    assert_eq!(
        tracker.get_status(ModelVariant::Gpt20b).unwrap().status,
        EndpointStatus::Running
    );
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_stops_on_cancel() {
    let config = test_config(Duration::from_secs(300), Duration::from_secs(900));
    let control = ReadyControl::new(0);
    let (_tracker, manager, _events) = rig(control, &config);

    let cancel = CancellationToken::new();
    let handle = manager.spawn_sweeper(cancel.clone());
    tokio::task::yield_now().await;

    cancel.cancel();
    handle.await.unwrap();
}
