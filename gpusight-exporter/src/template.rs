//! Per-entity-group label layouts shared by the renderer and the meter emitter.

use gpusight_common::{DEFAULT_UUID_LABEL, EntityGroup, Metric};

/// Label names written by the fixed prefix of some entity group.
pub const PREFIX_LABELS: &[&str] = &[
    "gpu",
    DEFAULT_UUID_LABEL,
    "pci_bus_id",
    "device",
    "modelName",
    "GPU_I_PROFILE",
    "GPU_I_ID",
    "Hostname",
    "nvswitch",
    "nvlink",
    "cpu",
    "cpucore",
];

/// Whether `name` is one of [`PREFIX_LABELS`], ignoring ASCII case.
///
/// Case is ignored because the meter emitter lower-cases attribute keys.
pub fn is_prefix_label(name: &str) -> bool {
    PREFIX_LABELS.iter().any(|p| p.eq_ignore_ascii_case(name))
}

/// One fixed label position in a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// `entity_id` under the given label name.
    EntityId(&'static str),
    /// `uuid` under the metric's own `uuid_label`.
    Uuid,
    PciBusId,
    /// `device` under the given label name.
    Device(&'static str),
    ModelName,
    /// `GPU_I_PROFILE` and `GPU_I_ID`, only for MIG instances.
    Mig,
    /// `Hostname`, only when known.
    Hostname,
}

/// Compiled label layout for one entity group.
///
/// Built once when the pipeline is constructed; every sample of the group is
/// labelled from the same layout.
#[derive(Debug, Clone)]
pub struct MetricTemplate {
    group: EntityGroup,
    slots: Vec<Slot>,
}

impl MetricTemplate {
    /// Build the layout for an entity group.
    pub fn for_group(group: EntityGroup) -> Self {
        let slots = match group {
            EntityGroup::Gpu => vec![
                Slot::EntityId("gpu"),
                Slot::Uuid,
                Slot::PciBusId,
                Slot::Device("device"),
                Slot::ModelName,
                Slot::Mig,
                Slot::Hostname,
            ],
            EntityGroup::Switch => vec![Slot::EntityId("nvswitch"), Slot::Hostname],
            EntityGroup::Link => vec![
                Slot::EntityId("nvlink"),
                Slot::Device("nvswitch"),
                Slot::Hostname,
            ],
            EntityGroup::Cpu => vec![Slot::EntityId("cpu"), Slot::Hostname],
            EntityGroup::CpuCore => vec![
                Slot::EntityId("cpucore"),
                Slot::Device("cpu"),
                Slot::Hostname,
            ],
        };

        Self { group, slots }
    }

    pub fn group(&self) -> EntityGroup {
        self.group
    }

    /// Label pairs for one sample, in exposition order.
    ///
    /// The group's fixed prefix comes first, then the metric's labels and
    /// then its attributes, each sorted by key.
    pub fn sample_labels<'a>(&self, metric: &'a Metric) -> Vec<(&'a str, &'a str)> {
        let mut pairs = Vec::with_capacity(
            self.slots.len() + 1 + metric.labels.len() + metric.attributes.len(),
        );

        for slot in &self.slots {
            match *slot {
                Slot::EntityId(name) => pairs.push((name, metric.entity_id.as_str())),
                Slot::Uuid => pairs.push((metric.uuid_label.as_str(), metric.uuid.as_str())),
                Slot::PciBusId => pairs.push(("pci_bus_id", metric.pci_bus_id.as_str())),
                Slot::Device(name) => pairs.push((name, metric.device.as_str())),
                Slot::ModelName => pairs.push(("modelName", metric.model_name.as_str())),
                Slot::Mig => {
                    if let Some(mig) = &metric.mig {
                        pairs.push(("GPU_I_PROFILE", mig.profile.as_str()));
                        pairs.push(("GPU_I_ID", mig.instance_id.as_str()));
                    }
                }
                Slot::Hostname => {
                    if let Some(hostname) = &metric.hostname {
                        pairs.push(("Hostname", hostname.as_str()));
                    }
                }
            }
        }

        let start = pairs.len();
        pairs.extend(
            metric
                .labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        pairs[start..].sort_unstable_by(|a, b| a.0.cmp(b.0));

        let start = pairs.len();
        pairs.extend(
            metric
                .attributes
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        pairs[start..].sort_unstable_by(|a, b| a.0.cmp(b.0));

        pairs
    }
}
