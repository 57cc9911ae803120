//! Model fallback router.
//!
//! Inference goes to the preferred variant; if that variant fails for any
//! reason (wake timeout, call timeout, 5xx, transport), the identical
//! request is retried once against its fallback. Never more than one hop,
//! and never in the other direction: the 20B model has no fallback.

mod backend;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::endpoints::{EndpointStatus, EndpointTracker, LifecycleManager, ModelVariant};
use crate::events::{OrchestrationEvent, SharedEventBus};
use crate::harmony::{Message, WireRequest};

pub use backend::{BackendError, HttpInferenceBackend, InferenceBackend};

/// Both variants failed (or the only variant, when the preferred one has no
/// fallback). Carries each variant's last error text.
#[derive(Debug, Clone)]
pub struct InferenceUnavailable {
    pub preferred: (ModelVariant, String),
    pub fallback: Option<(ModelVariant, String)>,
}

impl std::fmt::Display for InferenceUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (variant, error) = &self.preferred;
        write!(f, "inference unavailable: {variant} failed ({error})")?;
        if let Some((fallback, error)) = &self.fallback {
            write!(f, "; {fallback} failed ({error})")?;
        }
        Ok(())
    }
}

impl std::error::Error for InferenceUnavailable {}

/// Router metrics counters
#[derive(Debug, Default)]
pub struct RouterMetrics {
    requests: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterMetricsSnapshot {
    pub requests: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

impl RouterMetrics {
    fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RouterMetricsSnapshot {
        RouterMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Routes inference to the preferred variant with a single fallback hop.
pub struct FallbackRouter {
    tracker: Arc<EndpointTracker>,
    manager: Arc<LifecycleManager>,
    backend: Arc<dyn InferenceBackend>,
    events: SharedEventBus,
    metrics: RouterMetrics,
}

impl FallbackRouter {
    pub fn new(
        tracker: Arc<EndpointTracker>,
        manager: Arc<LifecycleManager>,
        backend: Arc<dyn InferenceBackend>,
        events: SharedEventBus,
    ) -> Self {
        Self {
            tracker,
            manager,
            backend,
            events,
            metrics: RouterMetrics::default(),
        }
    }

    pub fn metrics_snapshot(&self) -> RouterMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run one inference request, waking the target endpoint if needed and
    /// falling back at most once.
    pub async fn infer(
        &self,
        request: &WireRequest,
        preferred: ModelVariant,
    ) -> Result<Message, InferenceUnavailable> {
        self.metrics.record_request();

        let primary_error = match self.attempt(preferred, request).await {
            Ok(message) => return Ok(message),
            Err(error) => error,
        };

        let Some(alternate) = preferred.fallback() else {
            self.metrics.record_failure();
            return Err(InferenceUnavailable {
                preferred: (preferred, primary_error),
                fallback: None,
            });
        };

        warn!(from = %preferred, to = %alternate, error = %primary_error, "engaging fallback");
        self.metrics.record_fallback();
        self.events.publish(OrchestrationEvent::FallbackEngaged {
            from: preferred,
            to: alternate,
            error: primary_error.clone(),
            timestamp: Utc::now(),
        });

        match self.attempt(alternate, request).await {
            Ok(message) => Ok(message),
            Err(secondary_error) => {
                self.metrics.record_failure();
                Err(InferenceUnavailable {
                    preferred: (preferred, primary_error),
                    fallback: Some((alternate, secondary_error)),
                })
            }
        }
    }

    /// One attempt against one variant: wake if not running, hold an
    /// in-flight guard for the call, record activity on success.
    async fn attempt(&self, variant: ModelVariant, request: &WireRequest) -> Result<Message, String> {
        let status = self
            .tracker
            .get_status(variant)
            .map_err(|e| e.to_string())?
            .status;
        if status != EndpointStatus::Running {
            self.manager.wake(variant).await.map_err(|e| e.to_string())?;
        }

        let _guard = self.tracker.begin_call(variant).map_err(|e| e.to_string())?;
        let message = self
            .backend
            .complete(variant, request)
            .await
            .map_err(|e| e.to_string())?;

        self.tracker
            .record_activity(variant)
            .map_err(|e| e.to_string())?;
        debug!(endpoint = %variant, "inference call succeeded");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_display_includes_both_errors() {
        let error = InferenceUnavailable {
            preferred: (ModelVariant::Gpt120b, "wake timed out".into()),
            fallback: Some((ModelVariant::Gpt20b, "502 from endpoint".into())),
        };
        let text = error.to_string();
        assert!(text.contains("120b failed (wake timed out)"));
        assert!(text.contains("20b failed (502 from endpoint)"));

        let error = InferenceUnavailable {
            preferred: (ModelVariant::Gpt20b, "timeout".into()),
            fallback: None,
        };
        assert_eq!(
            error.to_string(),
            "inference unavailable: 20b failed (timeout)"
        );
    }

    #[test]
    fn test_router_metrics_snapshot() {
        let metrics = RouterMetrics::default();
        metrics.record_request();
        metrics.record_request();
        metrics.record_fallback();
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.fallbacks, 1);
        assert_eq!(snapshot.failures, 1);
    }
}
