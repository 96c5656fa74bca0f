//! Simulated telemetry source.
//!
//! Generates plausible readings for every configured counter on a synthetic
//! topology, so the exporter can run without GPU drivers.

use std::collections::HashMap;
use std::sync::Arc;

use gpusight_common::{
    Counter, DeviceInfo, EntityGroup, Metric, MetricsByCounter, PromType, SystemInfo,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace};

use crate::collector::{CollectorError, EntityCollector};
use crate::config::{ExporterConfig, SimulationConfig};
use crate::emitter::MeterEmitter;
use crate::error::PipelineError;
use crate::labels::format_value;
use crate::pipeline::MetricsPipeline;
use crate::transform::build_transformations;
use crate::watcher::WorkloadResolver;

/// Build the synthetic topology of a group.
///
/// Links are numbered across switches and carry their parent switch in
/// `device`; CPU cores likewise carry their parent CPU.
pub fn simulated_topology(group: EntityGroup, config: &SimulationConfig) -> SystemInfo {
    let mut info = SystemInfo::new(group);

    match group {
        EntityGroup::Gpu => {
            for gpu in 0..config.gpus {
                info.devices.push(DeviceInfo {
                    entity_id: gpu.to_string(),
                    uuid: format!("GPU-5eed{:04x}-0000-4000-8000-{:012x}", gpu, gpu),
                    device: format!("nvidia{}", gpu),
                    model_name: config.model_name.clone(),
                    pci_bus_id: format!("00000000:{:02X}:00.0", 0x10 + gpu),
                    mig_instances: Vec::new(),
                });
            }
        }
        EntityGroup::Switch => {
            for switch in 0..config.switches {
                info.devices.push(entity(switch, ""));
            }
        }
        EntityGroup::Link => {
            for switch in 0..config.switches {
                for link in 0..config.links_per_switch {
                    let id = switch * config.links_per_switch + link;
                    info.devices.push(entity(id, &switch.to_string()));
                }
            }
        }
        EntityGroup::Cpu => {
            for cpu in 0..config.cpus {
                info.devices.push(entity(cpu, ""));
            }
        }
        EntityGroup::CpuCore => {
            for cpu in 0..config.cpus {
                for core in 0..config.cores_per_cpu {
                    let id = cpu * config.cores_per_cpu + core;
                    info.devices.push(entity(id, &cpu.to_string()));
                }
            }
        }
    }

    info
}

fn entity(id: usize, parent: &str) -> DeviceInfo {
    DeviceInfo {
        entity_id: id.to_string(),
        device: parent.to_string(),
        ..Default::default()
    }
}

/// Collector producing random-walk readings.
///
/// Gauges and histograms wander between 0 and 100, counters only grow.
pub struct SimulatedCollector {
    info: SystemInfo,
    counters: Vec<Counter>,
    labels: HashMap<String, String>,
    hostname: Option<String>,
    rng: SmallRng,
    levels: HashMap<(u16, String), f64>,
}

impl SimulatedCollector {
    pub fn new(
        group: EntityGroup,
        config: &SimulationConfig,
        counters: Vec<Counter>,
        labels: HashMap<String, String>,
        hostname: Option<String>,
    ) -> Self {
        Self {
            info: simulated_topology(group, config),
            counters,
            labels,
            hostname,
            rng: SmallRng::from_os_rng(),
            levels: HashMap::new(),
        }
    }

    /// Use a fixed seed for reproducible readings.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    fn next_value(&mut self, counter: &Counter, entity_id: &str) -> f64 {
        let rng = &mut self.rng;
        let level = self
            .levels
            .entry((counter.field_id, entity_id.to_string()))
            .or_insert_with(|| rng.random_range(10.0..60.0));

        match counter.prom_type {
            PromType::Counter => *level += rng.random_range(0.0..1000.0),
            PromType::Gauge | PromType::Histogram => {
                *level = (*level + rng.random_range(-5.0..5.0)).clamp(0.0, 100.0)
            }
            PromType::Summary | PromType::Label => *level = 1.0,
        }

        (*level * 100.0).round() / 100.0
    }
}

impl EntityCollector for SimulatedCollector {
    fn get_metrics(&mut self) -> Result<MetricsByCounter, CollectorError> {
        let counters = self.counters.clone();
        let devices = self.info.devices.clone();
        let mut metrics = MetricsByCounter::with_capacity(counters.len());

        for counter in counters {
            let mut samples = Vec::with_capacity(devices.len());
            for device in &devices {
                let value = self.next_value(&counter, &device.entity_id);
                let mut metric =
                    Metric::new(counter.clone(), &device.entity_id, format_value(value))
                        .with_uuid(&device.uuid)
                        .with_device(&device.device)
                        .with_model_name(&device.model_name)
                        .with_pci_bus_id(&device.pci_bus_id)
                        .with_labels(self.labels.clone());
                if let Some(hostname) = &self.hostname {
                    metric = metric.with_hostname(hostname);
                }
                samples.push(metric);
            }
            metrics.insert(counter, samples);
        }

        trace!(group = %self.info.group, counters = metrics.len(), "Simulated readings");
        Ok(metrics)
    }

    fn system_info(&self) -> &SystemInfo {
        &self.info
    }

    fn counters(&self) -> &[Counter] {
        &self.counters
    }
}

/// Build a pipeline fed by simulated collectors for every enabled group.
///
/// Groups whose simulated topology is empty get no collector.
pub fn build_simulated_pipeline(
    config: &ExporterConfig,
    hostname: Option<String>,
    emitter: Option<MeterEmitter>,
    resolver: Option<Arc<dyn WorkloadResolver>>,
) -> Result<MetricsPipeline, PipelineError> {
    let mut builder = MetricsPipeline::builder(config.pipeline.collect_interval());

    for group in EntityGroup::ALL {
        if !config.pipeline.entity_groups.contains(&group) {
            continue;
        }
        let collector = SimulatedCollector::new(
            group,
            &config.simulation,
            config.counters.clone(),
            config.labels.clone(),
            hostname.clone(),
        );
        let devices = collector.system_info().devices.len();
        if devices == 0 {
            debug!(group = %group, "No simulated devices, skipping group");
            continue;
        }
        info!(group = %group, devices, "Simulated collector enabled");
        builder = builder.with_collector(group, Box::new(collector));
    }

    builder = builder.with_transforms(build_transformations(config, None, resolver));
    if let Some(emitter) = emitter {
        builder = builder.with_emitter(emitter);
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimulationConfig {
        SimulationConfig {
            gpus: 2,
            switches: 2,
            links_per_switch: 3,
            cpus: 2,
            cores_per_cpu: 4,
            ..Default::default()
        }
    }

    fn counters() -> Vec<Counter> {
        vec![
            Counter::new(150, "TEMP", PromType::Gauge, ""),
            Counter::new(1001, "BYTES", PromType::Counter, ""),
        ]
    }

    #[test]
    fn test_topology_sizes() {
        let config = config();
        let sizes: Vec<usize> = EntityGroup::ALL
            .iter()
            .map(|g| simulated_topology(*g, &config).devices.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 6, 2, 8]);
    }

    #[test]
    fn test_topology_parents() {
        let config = config();
        let links = simulated_topology(EntityGroup::Link, &config);
        assert_eq!(links.device("4").map(|d| d.device.as_str()), Some("1"));

        let cores = simulated_topology(EntityGroup::CpuCore, &config);
        assert_eq!(cores.device("7").map(|d| d.device.as_str()), Some("1"));

        let gpus = simulated_topology(EntityGroup::Gpu, &config);
        let gpu = gpus.device("1").unwrap();
        assert_eq!(gpu.device, "nvidia1");
        assert!(gpu.uuid.starts_with("GPU-"));
    }

    #[test]
    fn test_every_counter_and_device() {
        let mut collector = SimulatedCollector::new(
            EntityGroup::Gpu,
            &config(),
            counters(),
            HashMap::from([("cluster".to_string(), "east".to_string())]),
            Some("node-1".to_string()),
        )
        .with_seed(7);

        let metrics = collector.get_metrics().unwrap();
        assert_eq!(metrics.len(), 2);
        for (counter, samples) in &metrics {
            assert_eq!(samples.len(), 2);
            for metric in samples {
                assert_eq!(&metric.counter, counter);
                assert!(metric.value.parse::<f64>().is_ok());
                assert_eq!(metric.labels["cluster"], "east");
                assert_eq!(metric.hostname.as_deref(), Some("node-1"));
            }
        }
    }

    #[test]
    fn test_gauges_bounded_counters_grow() {
        let mut collector =
            SimulatedCollector::new(EntityGroup::Cpu, &config(), counters(), HashMap::new(), None)
                .with_seed(42);

        let mut last_bytes = 0.0;
        for _ in 0..50 {
            let metrics = collector.get_metrics().unwrap();
            for (counter, samples) in &metrics {
                let value: f64 = samples[0].value.parse().unwrap();
                match counter.prom_type {
                    PromType::Gauge => assert!((0.0..=100.0).contains(&value)),
                    PromType::Counter => {
                        assert!(value >= last_bytes);
                        last_bytes = value;
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn test_build_simulated_pipeline() {
        let mut config = ExporterConfig::default();
        config.simulation = SimulationConfig {
            gpus: 1,
            switches: 0,
            cpus: 1,
            cores_per_cpu: 2,
            ..Default::default()
        };
        config.pipeline.entity_groups =
            vec![EntityGroup::Gpu, EntityGroup::Switch, EntityGroup::CpuCore];

        let mut pipeline = build_simulated_pipeline(&config, None, None, None).unwrap();
        assert_eq!(pipeline.groups(), vec![EntityGroup::Gpu, EntityGroup::CpuCore]);

        let output = pipeline.run_cycle().unwrap();
        assert!(output.contains("DCGM_FI_DEV_GPU_TEMP{gpu=\"0\""));
        assert!(output.contains("DCGM_FI_DEV_GPU_TEMP_COUNTER{gpu=\"0\""));
        assert!(output.contains("{cpucore=\"1\",cpu=\"0\"}"));
        assert!(!output.contains("{cpu=\"0\"}"));
    }
}
