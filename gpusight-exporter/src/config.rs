//! Configuration for the GPU metrics exporter.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use gpusight_common::{COUNTER_SUFFIX, Counter, EntityGroup, LoggingConfig};

use crate::labels::{is_valid_label_name, is_valid_metric_name};
use crate::template::is_prefix_label;
use crate::transform::HPC_JOB_ATTRIBUTE;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Collection loop settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Counter definitions to collect.
    #[serde(default = "default_counters")]
    pub counters: Vec<Counter>,

    /// Static labels attached to every metric.
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Kubernetes pod mapping.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// HPC job mapping.
    #[serde(default)]
    pub hpc: HpcConfig,

    /// HTTP endpoint settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// OpenTelemetry push settings.
    #[serde(default)]
    pub opentelemetry: OtelConfig,

    /// Simulated collector settings.
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collection loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Interval between collection cycles in milliseconds (default: 30000).
    #[serde(default = "default_collect_interval")]
    pub collect_interval_ms: u64,

    /// Capacity of the rendered output channel (default: 10).
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,

    /// Hostname attached to every metric (default: resolved from the OS).
    #[serde(default)]
    pub hostname: Option<String>,

    /// Do not attach a hostname to metrics.
    #[serde(default)]
    pub no_hostname: bool,

    /// Entity groups to collect (default: all).
    #[serde(default = "default_entity_groups")]
    pub entity_groups: Vec<EntityGroup>,
}

fn default_collect_interval() -> u64 {
    30_000
}

fn default_output_capacity() -> usize {
    10
}

fn default_entity_groups() -> Vec<EntityGroup> {
    EntityGroup::ALL.to_vec()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collect_interval_ms: default_collect_interval(),
            output_capacity: default_output_capacity(),
            hostname: None,
            no_hostname: false,
            entity_groups: default_entity_groups(),
        }
    }
}

impl PipelineConfig {
    /// Get the collection interval as Duration.
    pub fn collect_interval(&self) -> Duration {
        Duration::from_millis(self.collect_interval_ms)
    }
}

fn default_counters() -> Vec<Counter> {
    use gpusight_common::PromType;

    vec![
        Counter::new(
            100,
            "DCGM_FI_DEV_SM_CLOCK",
            PromType::Gauge,
            "SM clock frequency (in MHz).",
        ),
        Counter::new(
            150,
            "DCGM_FI_DEV_GPU_TEMP",
            PromType::Gauge,
            "GPU temperature (in C).",
        ),
        Counter::new(
            155,
            "DCGM_FI_DEV_POWER_USAGE",
            PromType::Gauge,
            "Power draw (in W).",
        ),
        Counter::new(
            203,
            "DCGM_FI_DEV_GPU_UTIL",
            PromType::Gauge,
            "GPU utilization (in %).",
        ),
        Counter::new(
            252,
            "DCGM_FI_DEV_FB_USED",
            PromType::Gauge,
            "Framebuffer memory used (in MiB).",
        ),
    ]
}

/// Which device identifier the pod allocation list uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuIdType {
    /// GPU UUID (e.g., "GPU-0f3a...").
    #[default]
    Uid,
    /// Device name (e.g., "nvidia0").
    DeviceName,
}

/// Kubernetes pod mapping configuration.
///
/// Pod mapping needs a device allocation source passed to
/// [`build_transformations`](crate::transform::build_transformations). The
/// `gpusight-exporter` binary has none, so there this section only reserves
/// the pod attribute names and logs a warning at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Attach pod identity to GPU metrics.
    #[serde(default)]
    pub enabled: bool,

    /// Identifier kind used to match devices to pods.
    #[serde(default)]
    pub gpu_id_type: GpuIdType,

    /// Use the legacy `pod_name`/`pod_namespace`/`container_name` attribute names.
    #[serde(default)]
    pub use_old_namespace: bool,

    /// Attach the pod's own labels as attributes.
    #[serde(default)]
    pub enable_pod_labels: bool,

    /// Attach the pod UID as the `pod_uid` attribute.
    #[serde(default)]
    pub enable_pod_uid: bool,
}

/// HPC job mapping configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HpcConfig {
    /// Directory with one file per GPU index listing the jobs using it.
    #[serde(default)]
    pub job_mapping_dir: Option<PathBuf>,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address to listen on (default: "0.0.0.0:9400").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_listen() -> String {
    "0.0.0.0:9400".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
        }
    }
}

/// OpenTelemetry OTLP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtelConfig {
    /// Mirror metrics into OTLP instruments.
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint (e.g., "http://localhost:4317" for gRPC).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Protocol: "grpc" or "http".
    #[serde(default)]
    pub protocol: OtlpProtocol,

    /// Export interval in milliseconds.
    #[serde(default = "default_export_interval")]
    pub export_interval_ms: u64,

    /// Export timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Service name for OTEL resource.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Resource attributes to add to all telemetry.
    #[serde(default)]
    pub resource: HashMap<String, String>,
}

fn default_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_export_interval() -> u64 {
    10_000
}

fn default_timeout() -> u64 {
    30
}

fn default_service_name() -> String {
    "gpusight-exporter".to_string()
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            protocol: OtlpProtocol::default(),
            export_interval_ms: default_export_interval(),
            timeout_secs: default_timeout(),
            service_name: default_service_name(),
            resource: HashMap::new(),
        }
    }
}

impl OtelConfig {
    /// Get export interval as Duration.
    pub fn export_interval(&self) -> Duration {
        Duration::from_millis(self.export_interval_ms)
    }

    /// Get timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// OTLP protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    /// gRPC protocol (port 4317).
    #[default]
    Grpc,
    /// HTTP/protobuf protocol (port 4318).
    Http,
}

/// Simulated collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of simulated GPUs.
    #[serde(default = "default_gpus")]
    pub gpus: usize,

    /// Number of simulated NVSwitches.
    #[serde(default)]
    pub switches: usize,

    /// Number of simulated NVLinks per switch.
    #[serde(default)]
    pub links_per_switch: usize,

    /// Number of simulated CPUs.
    #[serde(default = "default_cpus")]
    pub cpus: usize,

    /// Number of simulated cores per CPU.
    #[serde(default)]
    pub cores_per_cpu: usize,

    /// Simulated GPU model name.
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

fn default_gpus() -> usize {
    2
}

fn default_cpus() -> usize {
    1
}

fn default_model_name() -> String {
    "NVIDIA A100-SXM4-40GB".to_string()
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            gpus: default_gpus(),
            switches: 0,
            links_per_switch: 0,
            cpus: default_cpus(),
            cores_per_cpu: 0,
            model_name: default_model_name(),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            counters: default_counters(),
            labels: HashMap::new(),
            kubernetes: KubernetesConfig::default(),
            hpc: HpcConfig::default(),
            http: HttpConfig::default(),
            opentelemetry: OtelConfig::default(),
            simulation: SimulationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.collect_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "collect_interval_ms must be > 0".to_string(),
            ));
        }

        if self.pipeline.output_capacity == 0 {
            return Err(ConfigError::Validation(
                "output_capacity must be > 0".to_string(),
            ));
        }

        if self.counters.is_empty() {
            return Err(ConfigError::Validation(
                "at least one counter must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for counter in &self.counters {
            if !is_valid_metric_name(&counter.field_name) {
                return Err(ConfigError::Validation(format!(
                    "Invalid counter name: {}",
                    counter.field_name
                )));
            }
            // Instruments are keyed by lower-cased name, so names must differ ignoring case.
            if !seen.insert(counter.field_name.to_lowercase()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate counter name: {}",
                    counter.field_name
                )));
            }
        }

        // The accumulator derives `<name>_COUNTER` for every GPU counter.
        for counter in &self.counters {
            let name = counter.field_name.to_lowercase();
            if let Some(base) = name.strip_suffix(&COUNTER_SUFFIX.to_lowercase()) {
                if seen.contains(base) {
                    return Err(ConfigError::Validation(format!(
                        "Counter {} collides with the derived counter of {}",
                        counter.field_name,
                        &counter.field_name[..base.len()]
                    )));
                }
            }
        }

        let mut keys: Vec<&String> = self.labels.keys().collect();
        keys.sort();
        let reserved = self.workload_attributes();
        let mut lowered = HashSet::new();
        for key in keys {
            if !is_valid_label_name(key) {
                return Err(ConfigError::Validation(format!(
                    "Invalid label name: {}",
                    key
                )));
            }
            if is_prefix_label(key) || reserved.iter().any(|r| r.eq_ignore_ascii_case(key)) {
                return Err(ConfigError::Validation(format!(
                    "Label {} collides with a built-in label",
                    key
                )));
            }
            // Meter attributes are lower-cased.
            if !lowered.insert(key.to_lowercase()) {
                return Err(ConfigError::Validation(format!(
                    "Labels differ only in case: {}",
                    key
                )));
            }
        }

        if self
            .http
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.http.listen
            )));
        }

        if !self.http.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.opentelemetry.enabled && self.opentelemetry.export_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "export_interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Attribute names the enabled transforms write.
    fn workload_attributes(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.kubernetes.enabled {
            names.extend([
                "pod",
                "namespace",
                "container",
                "pod_name",
                "pod_namespace",
                "container_name",
                "pod_uid",
            ]);
        }
        if self.hpc.job_mapping_dir.is_some() {
            names.push(HPC_JOB_ATTRIBUTE);
        }
        names
    }

    /// Hostname to attach to metrics, if any.
    pub fn resolve_hostname(&self) -> Option<String> {
        if self.pipeline.no_hostname {
            return None;
        }
        if let Some(hostname) = &self.pipeline.hostname {
            return Some(hostname.clone());
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusight_common::PromType;

    #[test]
    fn test_parse_minimal_config() {
        let config = ExporterConfig::parse("{}").unwrap();

        assert_eq!(config.pipeline.collect_interval_ms, 30_000);
        assert_eq!(config.pipeline.output_capacity, 10);
        assert_eq!(config.pipeline.entity_groups, EntityGroup::ALL.to_vec());
        assert_eq!(config.http.listen, "0.0.0.0:9400");
        assert_eq!(config.http.path, "/metrics");
        assert!(!config.kubernetes.enabled);
        assert!(config.hpc.job_mapping_dir.is_none());
        assert!(!config.opentelemetry.enabled);
        assert!(!config.counters.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            pipeline: {
                collect_interval_ms: 1000,
                output_capacity: 4,
                hostname: "node-7",
                entity_groups: ["gpu", "cpu"]
            },
            counters: [
                { field_id: 203, field_name: "UTIL", prom_type: "gauge", help: "GPU utilization" },
                { field_id: 1004, field_name: "TENSOR_ACTIVE", prom_type: "histogram" }
            ],
            labels: { cluster: "east" },
            kubernetes: {
                enabled: true,
                gpu_id_type: "device-name",
                use_old_namespace: true,
                enable_pod_labels: true
            },
            hpc: { job_mapping_dir: "/var/run/gpu-jobs" },
            http: { listen: "127.0.0.1:9401", path: "/gpu/metrics" },
            opentelemetry: {
                enabled: true,
                endpoint: "http://collector:4318",
                protocol: "http",
                export_interval_ms: 500
            },
            simulation: { gpus: 8, switches: 2, links_per_switch: 4 },
            logging: { level: "debug", format: "json" }
        }"#;

        let config = ExporterConfig::parse(json).unwrap();

        assert_eq!(config.pipeline.collect_interval(), Duration::from_secs(1));
        assert_eq!(config.pipeline.output_capacity, 4);
        assert_eq!(config.pipeline.hostname.as_deref(), Some("node-7"));
        assert_eq!(
            config.pipeline.entity_groups,
            vec![EntityGroup::Gpu, EntityGroup::Cpu]
        );
        assert_eq!(config.counters.len(), 2);
        assert_eq!(config.counters[1].prom_type, PromType::Histogram);
        assert_eq!(config.labels.get("cluster"), Some(&"east".to_string()));
        assert!(config.kubernetes.enabled);
        assert_eq!(config.kubernetes.gpu_id_type, GpuIdType::DeviceName);
        assert!(config.kubernetes.use_old_namespace);
        assert!(config.kubernetes.enable_pod_labels);
        assert!(!config.kubernetes.enable_pod_uid);
        assert_eq!(
            config.hpc.job_mapping_dir,
            Some(PathBuf::from("/var/run/gpu-jobs"))
        );
        assert_eq!(config.http.path, "/gpu/metrics");
        assert_eq!(config.opentelemetry.protocol, OtlpProtocol::Http);
        assert_eq!(
            config.opentelemetry.export_interval(),
            Duration::from_millis(500)
        );
        assert_eq!(config.simulation.gpus, 8);
        assert_eq!(config.simulation.links_per_switch, 4);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validate_zero_interval() {
        let result = ExporterConfig::parse("{ pipeline: { collect_interval_ms: 0 } }");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_zero_capacity() {
        let result = ExporterConfig::parse("{ pipeline: { output_capacity: 0 } }");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_empty_counters() {
        let result = ExporterConfig::parse("{ counters: [] }");
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("at least one counter")
        );
    }

    #[test]
    fn test_validate_duplicate_counter_ignoring_case() {
        let json = r#"{
            counters: [
                { field_id: 1, field_name: "UTIL", prom_type: "gauge" },
                { field_id: 2, field_name: "util", prom_type: "counter" }
            ]
        }"#;
        let result = ExporterConfig::parse(json);
        assert!(result.unwrap_err().to_string().contains("Duplicate counter"));
    }

    #[test]
    fn test_validate_invalid_counter_name() {
        let json = r#"{ counters: [{ field_id: 1, field_name: "gpu util", prom_type: "gauge" }] }"#;
        let result = ExporterConfig::parse(json);
        assert!(result.unwrap_err().to_string().contains("Invalid counter name"));
    }

    #[test]
    fn test_validate_invalid_label_name() {
        let result = ExporterConfig::parse(r#"{ labels: { "team-name": "ml" } }"#);
        assert!(result.unwrap_err().to_string().contains("Invalid label name"));
    }

    #[test]
    fn test_validate_label_colliding_with_prefix() {
        for key in ["device", "Hostname", "hostname", "UUID", "cpucore", "GPU_I_ID"] {
            let json = format!(r#"{{ labels: {{ {key}: "x" }} }}"#);
            let err = ExporterConfig::parse(&json).unwrap_err();
            assert!(err.to_string().contains("collides with a built-in label"), "{key}");
        }
        assert!(ExporterConfig::parse(r#"{ labels: { cluster: "east" } }"#).is_ok());
    }

    #[test]
    fn test_validate_label_colliding_with_workload_attributes() {
        let json = r#"{ labels: { namespace: "x" } }"#;
        assert!(ExporterConfig::parse(json).is_ok());

        let json = r#"{ labels: { namespace: "x" }, kubernetes: { enabled: true } }"#;
        assert!(ExporterConfig::parse(json).is_err());

        let json = r#"{ labels: { hpc_job: "x" }, hpc: { job_mapping_dir: "/tmp/jobs" } }"#;
        assert!(ExporterConfig::parse(json).is_err());
    }

    #[test]
    fn test_validate_labels_differing_in_case() {
        let result = ExporterConfig::parse(r#"{ labels: { Cluster: "a", cluster: "b" } }"#);
        assert!(result.unwrap_err().to_string().contains("differ only in case"));
    }

    #[test]
    fn test_validate_counter_colliding_with_derived_counter() {
        let json = r#"{
            counters: [
                { field_id: 1, field_name: "UTIL", prom_type: "gauge" },
                { field_id: 2, field_name: "UTIL_COUNTER", prom_type: "counter" }
            ]
        }"#;
        let result = ExporterConfig::parse(json);
        assert!(result.unwrap_err().to_string().contains("derived counter of UTIL"));

        let json = r#"{ counters: [{ field_id: 2, field_name: "UTIL_COUNTER", prom_type: "counter" }] }"#;
        assert!(ExporterConfig::parse(json).is_ok());
    }

    #[test]
    fn test_validate_invalid_listen() {
        let result = ExporterConfig::parse(r#"{ http: { listen: "not-an-address" } }"#);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid listen address")
        );
    }

    #[test]
    fn test_validate_invalid_path() {
        let result = ExporterConfig::parse(r#"{ http: { path: "metrics" } }"#);
        assert!(result.unwrap_err().to_string().contains("must start with /"));
    }

    #[test]
    fn test_resolve_hostname() {
        let mut config = ExporterConfig::default();
        config.pipeline.hostname = Some("node-1".to_string());
        assert_eq!(config.resolve_hostname().as_deref(), Some("node-1"));

        config.pipeline.no_hostname = true;
        assert_eq!(config.resolve_hostname(), None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpusight.json5");
        std::fs::write(&path, "{ pipeline: { collect_interval_ms: 250 } }").unwrap();

        let config = ExporterConfig::load_from_file(&path).unwrap();
        assert_eq!(config.pipeline.collect_interval_ms, 250);
    }
}
