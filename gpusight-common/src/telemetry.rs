use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use std::str::FromStr;

use crate::error::Error;

/// Suffix appended to the field name of a synthesized cumulative counter.
pub const COUNTER_SUFFIX: &str = "_COUNTER";

/// Default label name used for the device UUID on GPU samples.
pub const DEFAULT_UUID_LABEL: &str = "UUID";

/// Prometheus metric type of a counter definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromType {
    Gauge,
    Counter,
    Histogram,
    Summary,
    Label,
}

impl PromType {
    /// Get the TYPE comment string for Prometheus exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            PromType::Gauge => "gauge",
            PromType::Counter => "counter",
            PromType::Histogram => "histogram",
            PromType::Summary => "summary",
            PromType::Label => "label",
        }
    }
}

impl std::fmt::Display for PromType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PromType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(PromType::Gauge),
            "counter" => Ok(PromType::Counter),
            "histogram" => Ok(PromType::Histogram),
            "summary" => Ok(PromType::Summary),
            "label" => Ok(PromType::Label),
            other => Err(Error::UnknownPromType(other.to_string())),
        }
    }
}

/// A named, typed metric definition.
///
/// Counters are used as map keys, so two definitions are the same series
/// family only if every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counter {
    /// Native telemetry field identifier.
    pub field_id: u16,
    /// Exposed metric name (e.g., "DCGM_FI_DEV_GPU_UTIL").
    pub field_name: String,
    /// Prometheus metric type.
    pub prom_type: PromType,
    /// Help text for the HELP line.
    #[serde(default)]
    pub help: String,
}

impl Counter {
    /// Create a new counter definition.
    pub fn new(
        field_id: u16,
        field_name: impl Into<String>,
        prom_type: PromType,
        help: impl Into<String>,
    ) -> Self {
        Self {
            field_id,
            field_name: field_name.into(),
            prom_type,
            help: help.into(),
        }
    }

    /// The cumulative counter synthesized from this definition.
    pub fn derived(&self) -> Counter {
        Counter {
            field_id: self.field_id,
            field_name: format!("{}{}", self.field_name, COUNTER_SUFFIX),
            prom_type: PromType::Counter,
            help: self.help.clone(),
        }
    }
}

/// A MIG (multi-instance GPU) partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigInstance {
    /// Instance profile name (e.g., "1g.5gb").
    pub profile: String,
    /// GPU instance identifier.
    pub instance_id: String,
}

impl MigInstance {
    pub fn new(profile: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            instance_id: instance_id.into(),
        }
    }
}

/// A single observation produced by an entity collector.
///
/// Entity fields are reused across groups: for a switch `entity_id` is the
/// switch id, for a link it is the link id and `device` the parent switch,
/// for a CPU core `device` is the parent CPU.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub counter: Counter,
    /// Observed value, already decimal-encoded.
    pub value: String,

    pub entity_id: String,
    pub uuid: String,
    pub device: String,
    pub model_name: String,
    pub pci_bus_id: String,

    /// Label name under which `uuid` is exposed.
    pub uuid_label: String,

    pub mig: Option<MigInstance>,
    pub hostname: Option<String>,

    /// Static, user-configured labels.
    pub labels: HashMap<String, String>,
    /// Dynamic labels populated by transform stages.
    pub attributes: HashMap<String, String>,
}

impl Metric {
    /// Create a metric for the given counter and entity.
    pub fn new(counter: Counter, entity_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            counter,
            value: value.into(),
            entity_id: entity_id.into(),
            uuid: String::new(),
            device: String::new(),
            model_name: String::new(),
            pci_bus_id: String::new(),
            uuid_label: DEFAULT_UUID_LABEL.to_string(),
            mig: None,
            hostname: None,
            labels: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_pci_bus_id(mut self, pci_bus_id: impl Into<String>) -> Self {
        self.pci_bus_id = pci_bus_id.into();
        self
    }

    pub fn with_mig(mut self, mig: MigInstance) -> Self {
        self.mig = Some(mig);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Add a static label to this metric.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add multiple static labels to this metric.
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Add a dynamic attribute to this metric.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Deterministic identity of the series this observation belongs to.
    ///
    /// Built from the metric name, every entity identifier and the sorted
    /// labels and attributes, so the same series yields the same string on
    /// every cycle regardless of map iteration order.
    pub fn fingerprint(&self) -> String {
        let mut fp = String::with_capacity(256);
        let (mig_profile, instance_id) = match &self.mig {
            Some(mig) => (mig.profile.as_str(), mig.instance_id.as_str()),
            None => ("", ""),
        };

        let _ = write!(fp, "name={},", self.counter.field_name);
        let _ = write!(fp, "gpu={},", self.entity_id);
        let _ = write!(fp, "gpu_uuid={},", self.uuid);
        let _ = write!(fp, "gpu_device={},", self.device);
        let _ = write!(fp, "gpu_model_name={},", self.model_name);
        let _ = write!(fp, "gpu_pci_bus_id={},", self.pci_bus_id);
        let _ = write!(fp, "uuid={},", self.uuid_label);
        let _ = write!(fp, "mig_profile={},", mig_profile);
        let _ = write!(fp, "gpu_instance_id={},", instance_id);
        let _ = write!(fp, "hostname={},", self.hostname.as_deref().unwrap_or(""));

        for map in [&self.labels, &self.attributes] {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));
            for (k, v) in pairs {
                let _ = write!(fp, "{}={},", k, v);
            }
        }

        fp
    }
}

/// Observations of one collection pass, grouped by counter definition.
pub type MetricsByCounter = HashMap<Counter, Vec<Metric>>;

/// Class of monitored hardware unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityGroup {
    Gpu,
    Switch,
    Link,
    Cpu,
    CpuCore,
}

impl EntityGroup {
    /// All groups in pipeline processing order.
    pub const ALL: [EntityGroup; 5] = [
        EntityGroup::Gpu,
        EntityGroup::Switch,
        EntityGroup::Link,
        EntityGroup::Cpu,
        EntityGroup::CpuCore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityGroup::Gpu => "gpu",
            EntityGroup::Switch => "switch",
            EntityGroup::Link => "link",
            EntityGroup::Cpu => "cpu",
            EntityGroup::CpuCore => "cpu_core",
        }
    }

    /// Position of this group in processing order.
    pub fn index(&self) -> usize {
        match self {
            EntityGroup::Gpu => 0,
            EntityGroup::Switch => 1,
            EntityGroup::Link => 2,
            EntityGroup::Cpu => 3,
            EntityGroup::CpuCore => 4,
        }
    }
}

impl std::fmt::Display for EntityGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityGroup {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpu" => Ok(EntityGroup::Gpu),
            "switch" => Ok(EntityGroup::Switch),
            "link" => Ok(EntityGroup::Link),
            "cpu" => Ok(EntityGroup::Cpu),
            "cpu_core" => Ok(EntityGroup::CpuCore),
            other => Err(Error::UnknownEntityGroup(other.to_string())),
        }
    }
}

/// One monitored device as resolved by a collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub entity_id: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub pci_bus_id: String,
    #[serde(default)]
    pub mig_instances: Vec<MigInstance>,
}

/// Topology context a collector resolved for its entity group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub group: EntityGroup,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

impl SystemInfo {
    pub fn new(group: EntityGroup) -> Self {
        Self {
            group,
            devices: Vec::new(),
        }
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.devices.push(device);
        self
    }

    /// Look up a device by entity id.
    pub fn device(&self, entity_id: &str) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.entity_id == entity_id)
    }
}
