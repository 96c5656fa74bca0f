//! Entity collector interface.
//!
//! A collector owns the connection to a telemetry source for one entity
//! group and returns every configured counter for every monitored entity of
//! that group on each call.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gpusight_common::{Counter, EntityGroup, MetricsByCounter, SystemInfo};
use thiserror::Error;

/// Errors returned by a collector.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("telemetry source unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read field {field_id} for {group} entity {entity_id}: {reason}")]
    Field {
        group: EntityGroup,
        entity_id: String,
        field_id: u16,
        reason: String,
    },

    #[error("collector error: {0}")]
    Other(String),
}

/// Produces metrics for one entity group.
///
/// Collectors are polled from a single thread; `get_metrics` takes `&mut self`
/// so implementations may keep per-call state without locking. Every metric
/// in the returned grouping must be listed under its own counter.
pub trait EntityCollector: Send {
    /// Collect one round of observations.
    fn get_metrics(&mut self) -> Result<MetricsByCounter, CollectorError>;

    /// Topology resolved for this collector's group.
    fn system_info(&self) -> &SystemInfo;

    /// Counter definitions this collector emits.
    fn counters(&self) -> &[Counter];

    /// Entity group served by this collector.
    fn group(&self) -> EntityGroup {
        self.system_info().group
    }
}

/// Boxed collector as stored by the pipeline.
pub type BoxedCollector = Box<dyn EntityCollector>;

/// Collector replaying a fixed set of readings, or a fixed failure.
///
/// Useful to drive the pipeline without a telemetry source.
#[derive(Debug, Clone)]
pub struct StaticCollector {
    info: SystemInfo,
    counters: Vec<Counter>,
    readings: MetricsByCounter,
    failure: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl StaticCollector {
    /// Replay `readings` on every call.
    pub fn new(info: SystemInfo, readings: MetricsByCounter) -> Self {
        let mut counters: Vec<Counter> = readings.keys().cloned().collect();
        counters.sort_by_key(|c| c.field_id);
        Self {
            info,
            counters,
            readings,
            failure: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail every call with `reason`.
    pub fn failing(info: SystemInfo, reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::new(info, MetricsByCounter::new())
        }
    }

    /// Override the advertised counter list.
    pub fn with_counters(mut self, counters: Vec<Counter>) -> Self {
        self.counters = counters;
        self
    }

    /// Shared count of `get_metrics` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl EntityCollector for StaticCollector {
    fn get_metrics(&mut self) -> Result<MetricsByCounter, CollectorError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match &self.failure {
            Some(reason) => Err(CollectorError::Unavailable(reason.clone())),
            None => Ok(self.readings.clone()),
        }
    }

    fn system_info(&self) -> &SystemInfo {
        &self.info
    }

    fn counters(&self) -> &[Counter] {
        &self.counters
    }
}
