//! Enrichment stages applied to GPU metrics before rendering.
//!
//! Stages only add attributes; they never add, drop or reorder metrics.

mod hpc;
mod pod;

use std::path::PathBuf;
use std::sync::Arc;

use gpusight_common::{MetricsByCounter, SystemInfo};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ExporterConfig;
use crate::watcher::WorkloadResolver;

pub use hpc::{HPC_JOB_ATTRIBUTE, HpcMapper};
pub use pod::{DeviceAllocations, PodDevices, PodInfo, PodMapper};

/// Structural failures of a transform stage.
///
/// A metric that simply has no mapping is not an error.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("device allocation source failed: {0}")]
    Allocations(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A metric enrichment step.
pub trait Transform {
    /// Add attributes to the metrics in place.
    fn process(
        &self,
        metrics: &mut MetricsByCounter,
        sys_info: &SystemInfo,
    ) -> Result<(), TransformError>;

    /// Stage name used in logs and errors.
    fn name(&self) -> &str;
}

/// The closed set of transform stages.
pub enum TransformStage {
    Pod(PodMapper),
    Hpc(HpcMapper),
}

impl Transform for TransformStage {
    fn process(
        &self,
        metrics: &mut MetricsByCounter,
        sys_info: &SystemInfo,
    ) -> Result<(), TransformError> {
        match self {
            TransformStage::Pod(mapper) => mapper.process(metrics, sys_info),
            TransformStage::Hpc(mapper) => mapper.process(metrics, sys_info),
        }
    }

    fn name(&self) -> &str {
        match self {
            TransformStage::Pod(mapper) => mapper.name(),
            TransformStage::Hpc(mapper) => mapper.name(),
        }
    }
}

impl std::fmt::Debug for TransformStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TransformStage").field(&self.name()).finish()
    }
}

/// Build the configured stages, pod mapper first.
///
/// The pod mapper needs a device allocation source; without one it is
/// skipped with a warning rather than failing startup.
pub fn build_transformations(
    config: &ExporterConfig,
    allocations: Option<Arc<dyn DeviceAllocations>>,
    resolver: Option<Arc<dyn WorkloadResolver>>,
) -> Vec<TransformStage> {
    let mut stages = Vec::new();

    if config.kubernetes.enabled {
        match allocations {
            Some(allocations) => {
                let mapper = PodMapper::new(config.kubernetes.clone(), allocations);
                let mapper = match resolver {
                    Some(resolver) => mapper.with_resolver(resolver),
                    None => mapper,
                };
                stages.push(TransformStage::Pod(mapper));
            }
            None => {
                warn!(
                    "Could not enable kubernetes metric collection: no device allocation source available"
                );
            }
        }
    }

    if let Some(dir) = &config.hpc.job_mapping_dir {
        stages.push(TransformStage::Hpc(HpcMapper::new(dir.clone())));
    }

    if !stages.is_empty() {
        let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        info!(stages = ?names, "Transform stages enabled");
    }

    stages
}
