//! Single source of truth for endpoint status and activity.
//!
//! The tracker owns one record per configured [`ModelVariant`] and hands out
//! owned snapshots; nothing else in the workspace holds endpoint state.
//! Status changes go through [`EndpointTracker::set_status`], which enforces
//! the transition table, or through [`EndpointTracker::sync_status`] at
//! startup, when a management-API probe is authoritative.
//!
//! Records live behind a `std::sync::RwLock` with short critical sections
//! and no await points while held.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::debug;

use crate::config::GatewayConfig;

use super::error::EndpointError;
use super::types::{
    is_legal_status_transition, EndpointSnapshot, EndpointStatus, ModelVariant,
};

#[derive(Debug, Clone)]
struct EndpointRecord {
    url: String,
    status: EndpointStatus,
    last_activity: Option<chrono::DateTime<Utc>>,
    wake_time: Option<chrono::DateTime<Utc>>,
    sleep_time: Option<chrono::DateTime<Utc>>,
    auto_sleep_deadline: Option<chrono::DateTime<Utc>>,
    in_flight: u32,
}

impl EndpointRecord {
    fn new(url: String) -> Self {
        Self {
            url,
            status: EndpointStatus::Unknown,
            last_activity: None,
            wake_time: None,
            sleep_time: None,
            auto_sleep_deadline: None,
            in_flight: 0,
        }
    }

    fn snapshot(&self, id: ModelVariant) -> EndpointSnapshot {
        EndpointSnapshot {
            id,
            url: self.url.clone(),
            status: self.status,
            last_activity: self.last_activity,
            wake_time: self.wake_time,
            sleep_time: self.sleep_time,
            auto_sleep_deadline: self.auto_sleep_deadline,
            in_flight: self.in_flight,
        }
    }
}

/// Tracks status, activity, and in-flight counts for every endpoint.
pub struct EndpointTracker {
    records: RwLock<HashMap<ModelVariant, EndpointRecord>>,
    /// Inactivity window added to each recorded activity.
    window: chrono::Duration,
}

impl EndpointTracker {
    /// One record per configured variant, all starting at `Unknown` until
    /// the startup resync probe lands.
    pub fn new(config: &GatewayConfig) -> Self {
        let mut records = HashMap::new();
        for variant in ModelVariant::all() {
            records.insert(
                variant,
                EndpointRecord::new(config.target(variant).base_url.clone()),
            );
        }
        Self {
            records: RwLock::new(records),
            window: chrono::Duration::from_std(config.auto_sleep_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(900)),
        }
    }

    // A poisoned lock still holds valid records; recover the guard.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ModelVariant, EndpointRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ModelVariant, EndpointRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record inference activity: bumps `last_activity` and pushes the
    /// auto-sleep deadline forward. The deadline never moves backward.
    pub fn record_activity(&self, id: ModelVariant) -> Result<(), EndpointError> {
        let mut records = self.write();
        let record = records
            .get_mut(&id)
            .ok_or(EndpointError::UnknownEndpoint { id })?;

        let now = Utc::now();
        let candidate = now + self.window;
        record.last_activity = Some(now);
        record.auto_sleep_deadline = match record.auto_sleep_deadline {
            Some(existing) if existing > candidate => Some(existing),
            _ => Some(candidate),
        };
        Ok(())
    }

    /// Owned point-in-time view of one endpoint.
    pub fn get_status(&self, id: ModelVariant) -> Result<EndpointSnapshot, EndpointError> {
        let records = self.read();
        records
            .get(&id)
            .map(|record| record.snapshot(id))
            .ok_or(EndpointError::UnknownEndpoint { id })
    }

    /// Snapshots of every endpoint, preference order.
    pub fn snapshot_all(&self) -> Vec<EndpointSnapshot> {
        let records = self.read();
        ModelVariant::all()
            .into_iter()
            .filter_map(|id| records.get(&id).map(|record| record.snapshot(id)))
            .collect()
    }

    /// Apply a lifecycle transition. Illegal moves are rejected; arriving at
    /// `Running` stamps `wake_time`, arriving at `Sleeping` stamps
    /// `sleep_time`.
    pub fn set_status(
        &self,
        id: ModelVariant,
        status: EndpointStatus,
    ) -> Result<(), EndpointError> {
        let mut records = self.write();
        let record = records
            .get_mut(&id)
            .ok_or(EndpointError::UnknownEndpoint { id })?;

        let from = record.status;
        if !is_legal_status_transition(from, status) {
            return Err(EndpointError::InvalidTransition {
                id,
                from,
                to: status,
            });
        }

        let now = Utc::now();
        if status == EndpointStatus::Running && from != EndpointStatus::Running {
            record.wake_time = Some(now);
        }
        if status == EndpointStatus::Sleeping && from != EndpointStatus::Sleeping {
            record.sleep_time = Some(now);
        }
        record.status = status;
        debug!(endpoint = %id, %from, to = %status, "endpoint status changed");
        Ok(())
    }

    /// Overwrite status from an authoritative probe, ignoring the transition
    /// table. Startup resync only.
    pub fn sync_status(
        &self,
        id: ModelVariant,
        status: EndpointStatus,
    ) -> Result<(), EndpointError> {
        let mut records = self.write();
        let record = records
            .get_mut(&id)
            .ok_or(EndpointError::UnknownEndpoint { id })?;
        let from = record.status;
        record.status = status;
        debug!(endpoint = %id, %from, to = %status, "endpoint status resynced");
        Ok(())
    }

    /// Mark an inference call in flight. The returned guard decrements the
    /// count on drop, so callers just keep it alive for the duration of the
    /// call.
    pub fn begin_call(self: &Arc<Self>, id: ModelVariant) -> Result<InFlightGuard, EndpointError> {
        let mut records = self.write();
        let record = records
            .get_mut(&id)
            .ok_or(EndpointError::UnknownEndpoint { id })?;
        record.in_flight += 1;
        drop(records);
        Ok(InFlightGuard {
            tracker: Arc::clone(self),
            id,
        })
    }
}

/// RAII handle for one in-flight inference call.
pub struct InFlightGuard {
    tracker: Arc<EndpointTracker>,
    id: ModelVariant,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut records = self.tracker.write();
        if let Some(record) = records.get_mut(&self.id) {
            record.in_flight = record.in_flight.saturating_sub(1);
        }
    }
}
