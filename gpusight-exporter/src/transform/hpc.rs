//! HPC job mapping.
//!
//! A workload manager prolog writes one file per GPU into the mapping
//! directory. The file is named after the GPU index and lists the ids of the
//! jobs using that GPU, one per line.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use gpusight_common::{MetricsByCounter, SystemInfo};
use tracing::{debug, warn};

use super::{Transform, TransformError};

/// Attribute carrying the job ids of a GPU.
pub const HPC_JOB_ATTRIBUTE: &str = "hpc_job";

/// Attaches HPC job ids to GPU metrics.
#[derive(Debug, Clone)]
pub struct HpcMapper {
    dir: PathBuf,
}

impl HpcMapper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Read the mapping directory into GPU index -> comma-joined job ids.
    fn read_mapping(&self) -> Result<HashMap<String, String>, TransformError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| TransformError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut mapping = HashMap::new();
        for entry in entries {
            let entry = entry.map_err(|source| TransformError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(gpu) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read job mapping file");
                    continue;
                }
            };

            let jobs: Vec<&str> = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            if !jobs.is_empty() {
                mapping.insert(gpu.to_string(), jobs.join(","));
            }
        }

        debug!(gpus = mapping.len(), dir = %self.dir.display(), "Loaded HPC job mapping");
        Ok(mapping)
    }
}

impl Transform for HpcMapper {
    fn process(
        &self,
        metrics: &mut MetricsByCounter,
        _sys_info: &SystemInfo,
    ) -> Result<(), TransformError> {
        let mapping = self.read_mapping()?;
        if mapping.is_empty() {
            return Ok(());
        }

        for samples in metrics.values_mut() {
            for metric in samples.iter_mut() {
                if let Some(jobs) = mapping.get(&metric.entity_id) {
                    metric
                        .attributes
                        .insert(HPC_JOB_ATTRIBUTE.to_string(), jobs.clone());
                }
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "hpcMapper"
    }
}
