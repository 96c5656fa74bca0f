//! Kubernetes pod mapping.

use std::collections::HashMap;
use std::sync::Arc;

use gpusight_common::{Metric, MetricsByCounter, SystemInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Transform, TransformError};
use crate::config::{GpuIdType, KubernetesConfig};
use crate::labels::sanitize_label_name;
use crate::template::is_prefix_label;
use crate::watcher::WorkloadResolver;

/// Container that was assigned a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub container: String,
}

impl PodInfo {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            container: container.into(),
        }
    }
}

/// Devices assigned to one container.
///
/// Device ids are GPU UUIDs or device names, or `"<gpu>-<gpu_instance_id>"`
/// for MIG instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDevices {
    pub pod: PodInfo,
    pub device_ids: Vec<String>,
}

/// Source of pod to device assignments (e.g., the kubelet pod resources API).
pub trait DeviceAllocations: Send + Sync {
    fn list(&self) -> Result<Vec<PodDevices>, TransformError>;
}

/// Attaches pod identity to GPU metrics.
pub struct PodMapper {
    config: KubernetesConfig,
    allocations: Arc<dyn DeviceAllocations>,
    resolver: Option<Arc<dyn WorkloadResolver>>,
}

impl PodMapper {
    pub fn new(config: KubernetesConfig, allocations: Arc<dyn DeviceAllocations>) -> Self {
        Self {
            config,
            allocations,
            resolver: None,
        }
    }

    /// Look up pod labels and UIDs through `resolver`.
    pub fn with_resolver(mut self, resolver: Arc<dyn WorkloadResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Key under which the allocation list refers to the metric's device.
    fn device_key(&self, metric: &Metric) -> String {
        if let Some(mig) = &metric.mig {
            return format!("{}-{}", metric.entity_id, mig.instance_id);
        }
        match self.config.gpu_id_type {
            GpuIdType::Uid => metric.uuid.clone(),
            GpuIdType::DeviceName => metric.device.clone(),
        }
    }

    fn attribute_names(&self) -> (&'static str, &'static str, &'static str) {
        if self.config.use_old_namespace {
            ("pod_name", "pod_namespace", "container_name")
        } else {
            ("pod", "namespace", "container")
        }
    }

    fn annotate(&self, metric: &mut Metric, pod: &PodInfo) {
        let (pod_attr, namespace_attr, container_attr) = self.attribute_names();
        metric.attributes.insert(pod_attr.to_string(), pod.name.clone());
        metric
            .attributes
            .insert(namespace_attr.to_string(), pod.namespace.clone());
        metric
            .attributes
            .insert(container_attr.to_string(), pod.container.clone());

        let Some(resolver) = &self.resolver else {
            return;
        };
        if !self.config.enable_pod_labels && !self.config.enable_pod_uid {
            return;
        }
        let Some(meta) = resolver.lookup(&pod.namespace, &pod.name) else {
            trace!(namespace = %pod.namespace, pod = %pod.name, "No workload metadata");
            return;
        };

        if self.config.enable_pod_uid {
            metric.attributes.insert("pod_uid".to_string(), meta.uid.clone());
        }
        if self.config.enable_pod_labels {
            let mut labels: Vec<_> = meta.labels.iter().collect();
            labels.sort();
            for (k, v) in labels {
                let key = sanitize_label_name(k);
                if is_label_taken(metric, &key) {
                    debug!(
                        namespace = %pod.namespace,
                        pod = %pod.name,
                        label = %k,
                        "Skipping pod label that collides with an existing label"
                    );
                    continue;
                }
                metric.attributes.insert(key, v.clone());
            }
        }
    }
}

/// Whether a sample already carries `key`, ignoring ASCII case.
///
/// Pod labels never replace the device prefix, static labels or pod identity.
fn is_label_taken(metric: &Metric, key: &str) -> bool {
    is_prefix_label(key)
        || metric.uuid_label.eq_ignore_ascii_case(key)
        || metric.labels.keys().any(|k| k.eq_ignore_ascii_case(key))
        || metric.attributes.keys().any(|k| k.eq_ignore_ascii_case(key))
}

impl Transform for PodMapper {
    fn process(
        &self,
        metrics: &mut MetricsByCounter,
        _sys_info: &SystemInfo,
    ) -> Result<(), TransformError> {
        let allocations = self.allocations.list()?;

        let mut by_device: HashMap<&str, &PodInfo> = HashMap::new();
        for entry in &allocations {
            for id in &entry.device_ids {
                by_device.insert(id.as_str(), &entry.pod);
            }
        }
        debug!(devices = by_device.len(), "Loaded device allocations");

        for samples in metrics.values_mut() {
            for metric in samples.iter_mut() {
                let key = self.device_key(metric);
                if let Some(pod) = by_device.get(key.as_str()) {
                    self.annotate(metric, pod);
                }
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "podMapper"
    }
}
