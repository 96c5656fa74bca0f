//! Mirrors collected metrics into OpenTelemetry instruments.

use std::collections::HashMap;

use gpusight_common::{Counter, EntityGroup, MetricsByCounter, PromType};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter as OtelCounter, Gauge, Histogram, Meter};
use tracing::{debug, trace};

use crate::template::MetricTemplate;

/// Instrument registry keyed by lower-cased field name.
///
/// Instruments are created once from the full configured counter list.
/// `summary` and `label` counters have no instrument and are never mirrored.
pub struct MeterEmitter {
    gauges: HashMap<String, Gauge<f64>>,
    counters: HashMap<String, OtelCounter<f64>>,
    histograms: HashMap<String, Histogram<f64>>,
    templates: Vec<MetricTemplate>,
}

impl MeterEmitter {
    /// Register one instrument per instrumentable counter.
    pub fn new(meter: &Meter, counters: &[Counter]) -> Self {
        let mut gauges = HashMap::new();
        let mut otel_counters = HashMap::new();
        let mut histograms = HashMap::new();

        for counter in counters {
            let name = counter.field_name.to_lowercase();
            match counter.prom_type {
                PromType::Gauge => {
                    let gauge = meter
                        .f64_gauge(name.clone())
                        .with_description(counter.help.clone())
                        .build();
                    gauges.insert(name, gauge);
                }
                PromType::Counter => {
                    let instrument = meter
                        .f64_counter(name.clone())
                        .with_description(counter.help.clone())
                        .build();
                    otel_counters.insert(name, instrument);
                }
                PromType::Histogram => {
                    let histogram = meter
                        .f64_histogram(name.clone())
                        .with_description(counter.help.clone())
                        .build();
                    histograms.insert(name, histogram);
                }
                PromType::Summary | PromType::Label => {
                    trace!(counter = %counter.field_name, "No instrument for counter type");
                }
            }
        }

        debug!(
            gauges = gauges.len(),
            counters = otel_counters.len(),
            histograms = histograms.len(),
            "Registered meter instruments"
        );

        Self {
            gauges,
            counters: otel_counters,
            histograms,
            templates: EntityGroup::ALL
                .iter()
                .map(|g| MetricTemplate::for_group(*g))
                .collect(),
        }
    }

    /// Whether `counter` is mirrored by this emitter.
    pub fn is_instrumentable(counter: &Counter) -> bool {
        matches!(
            counter.prom_type,
            PromType::Gauge | PromType::Counter | PromType::Histogram
        )
    }

    /// Whether an instrument of the right kind exists for `counter`.
    pub fn has_instrument(&self, counter: &Counter) -> bool {
        let name = counter.field_name.to_lowercase();
        match counter.prom_type {
            PromType::Gauge => self.gauges.contains_key(&name),
            PromType::Counter => self.counters.contains_key(&name),
            PromType::Histogram => self.histograms.contains_key(&name),
            PromType::Summary | PromType::Label => false,
        }
    }

    /// Record every sample of a group.
    ///
    /// # Panics
    ///
    /// Panics if an instrumentable counter has no registered instrument, or if
    /// a sample value is not a number. The pipeline builder checks the first
    /// condition up front.
    pub fn observe(&self, group: EntityGroup, metrics: &MetricsByCounter) {
        let template = &self.templates[group.index()];

        for (counter, samples) in metrics {
            if !Self::is_instrumentable(counter) {
                continue;
            }
            let name = counter.field_name.to_lowercase();

            for metric in samples {
                let value: f64 = metric.value.parse().unwrap_or_else(|e| {
                    panic!(
                        "value '{}' of {} for {} entity {} is not a number: {}",
                        metric.value, counter.field_name, group, metric.entity_id, e
                    )
                });

                let attributes: Vec<KeyValue> = template
                    .sample_labels(metric)
                    .into_iter()
                    .map(|(k, v)| KeyValue::new(k.to_lowercase(), v.to_string()))
                    .collect();

                match counter.prom_type {
                    PromType::Gauge => self.gauge(&name).record(value, &attributes),
                    PromType::Counter => self.counter(&name).add(value, &attributes),
                    PromType::Histogram => self.histogram(&name).record(value, &attributes),
                    PromType::Summary | PromType::Label => {}
                }
            }
        }
    }

    fn gauge(&self, name: &str) -> &Gauge<f64> {
        self.gauges
            .get(name)
            .unwrap_or_else(|| panic!("no gauge registered for {name}"))
    }

    fn counter(&self, name: &str) -> &OtelCounter<f64> {
        self.counters
            .get(name)
            .unwrap_or_else(|| panic!("no counter registered for {name}"))
    }

    fn histogram(&self, name: &str) -> &Histogram<f64> {
        self.histograms
            .get(name)
            .unwrap_or_else(|| panic!("no histogram registered for {name}"))
    }
}

impl std::fmt::Debug for MeterEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeterEmitter")
            .field("gauges", &self.gauges.len())
            .field("counters", &self.counters.len())
            .field("histograms", &self.histograms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusight_common::Metric;
    use gpusight_common::MigInstance;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::data::{
        Aggregation, Gauge as GaugeData, Histogram as HistogramData, ResourceMetrics, Sum,
    };
    use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

    fn counters() -> Vec<Counter> {
        vec![
            Counter::new(203, "DCGM_FI_DEV_GPU_UTIL", PromType::Gauge, "utilization"),
            Counter::new(1001, "DCGM_FI_PROF_BYTES", PromType::Counter, "bytes"),
            Counter::new(1002, "DCGM_FI_LATENCY", PromType::Histogram, "latency"),
            Counter::new(1003, "DCGM_FI_DRIVER", PromType::Label, "driver"),
        ]
    }

    fn emitter() -> MeterEmitter {
        let provider = SdkMeterProvider::builder().build();
        MeterEmitter::new(&provider.meter("test"), &counters())
    }

    fn grouping(counter: Counter, value: &str) -> MetricsByCounter {
        let metric = Metric::new(counter.clone(), "0", value)
            .with_uuid("GPU-abc")
            .with_label("Cluster", "east");
        MetricsByCounter::from([(counter, vec![metric])])
    }

    #[test]
    fn test_registers_instrumentable_counters() {
        let emitter = emitter();
        let all = counters();

        assert!(emitter.has_instrument(&all[0]));
        assert!(emitter.has_instrument(&all[1]));
        assert!(emitter.has_instrument(&all[2]));
        assert!(!emitter.has_instrument(&all[3]));
        assert!(!MeterEmitter::is_instrumentable(&all[3]));
    }

    #[test]
    fn test_lookup_ignores_case() {
        let emitter = emitter();
        let lower = Counter::new(203, "dcgm_fi_dev_gpu_util", PromType::Gauge, "");
        assert!(emitter.has_instrument(&lower));
    }

    #[test]
    fn test_lookup_checks_kind() {
        let emitter = emitter();
        let as_counter = Counter::new(203, "DCGM_FI_DEV_GPU_UTIL", PromType::Counter, "");
        assert!(!emitter.has_instrument(&as_counter));
    }

    #[test]
    fn test_observe_all_kinds() {
        let emitter = emitter();
        for counter in counters() {
            emitter.observe(EntityGroup::Gpu, &grouping(counter, "12.5"));
        }
    }

    #[test]
    fn test_observe_skips_label_counters() {
        let emitter = emitter();
        let label = counters().remove(3);
        emitter.observe(EntityGroup::Gpu, &grouping(label, "r535"));
    }

    #[test]
    #[should_panic(expected = "no gauge registered")]
    fn test_observe_missing_instrument_panics() {
        let emitter = emitter();
        let unknown = Counter::new(9, "UNKNOWN", PromType::Gauge, "");
        emitter.observe(EntityGroup::Switch, &grouping(unknown, "1"));
    }

    #[test]
    #[should_panic(expected = "is not a number")]
    fn test_observe_bad_value_panics() {
        let emitter = emitter();
        let util = counters().remove(0);
        emitter.observe(EntityGroup::Gpu, &grouping(util, "n/a"));
    }

    struct Recorder {
        provider: SdkMeterProvider,
        exporter: InMemoryMetricExporter,
        emitter: MeterEmitter,
    }

    impl Recorder {
        fn new() -> Self {
            let exporter = InMemoryMetricExporter::default();
            let provider = SdkMeterProvider::builder()
                .with_reader(PeriodicReader::builder(exporter.clone()).build())
                .build();
            let emitter = MeterEmitter::new(&provider.meter("test"), &counters());
            Self {
                provider,
                exporter,
                emitter,
            }
        }

        fn finish(self) -> Vec<ResourceMetrics> {
            self.provider.force_flush().unwrap();
            let metrics = self.exporter.get_finished_metrics().unwrap();
            let _ = self.provider.shutdown();
            metrics
        }
    }

    fn find<'a>(metrics: &'a [ResourceMetrics], name: &str) -> Option<&'a dyn Aggregation> {
        metrics
            .iter()
            .flat_map(|rm| &rm.scope_metrics)
            .flat_map(|sm| &sm.metrics)
            .find(|m| m.name == name)
            .map(|m| m.data.as_ref())
    }

    fn attribute_keys(attributes: &[KeyValue]) -> Vec<String> {
        let mut keys: Vec<String> = attributes.iter().map(|kv| kv.key.to_string()).collect();
        keys.sort();
        keys
    }

    fn mig_sample(counter: Counter, value: &str) -> MetricsByCounter {
        let metric = Metric::new(counter.clone(), "0", value)
            .with_uuid("GPU-abc")
            .with_device("nvidia0")
            .with_model_name("A100")
            .with_pci_bus_id("00000000:3B:00.0")
            .with_mig(MigInstance::new("1g.5gb", "9"))
            .with_hostname("node-1")
            .with_label("Cluster", "east")
            .with_attribute("pod", "trainer-0");
        MetricsByCounter::from([(counter, vec![metric])])
    }

    #[test]
    fn test_gauge_records_value_with_lowercased_keys() {
        let recorder = Recorder::new();
        let util = counters().remove(0);
        recorder
            .emitter
            .observe(EntityGroup::Gpu, &mig_sample(util, "12.5"));
        let metrics = recorder.finish();

        let data = find(&metrics, "dcgm_fi_dev_gpu_util").expect("gauge exported");
        let gauge = data.as_any().downcast_ref::<GaugeData<f64>>().unwrap();
        assert_eq!(gauge.data_points.len(), 1);

        let point = &gauge.data_points[0];
        assert_eq!(point.value, 12.5);
        assert_eq!(
            attribute_keys(&point.attributes),
            vec![
                "cluster",
                "device",
                "gpu",
                "gpu_i_id",
                "gpu_i_profile",
                "hostname",
                "modelname",
                "pci_bus_id",
                "pod",
                "uuid",
            ]
        );
        let profile = point
            .attributes
            .iter()
            .find(|kv| kv.key.as_str() == "gpu_i_profile")
            .unwrap();
        assert_eq!(profile.value.to_string(), "1g.5gb");
    }

    #[test]
    fn test_counter_adds_values() {
        let recorder = Recorder::new();
        let bytes = counters().remove(1);
        recorder
            .emitter
            .observe(EntityGroup::Gpu, &mig_sample(bytes.clone(), "3"));
        recorder
            .emitter
            .observe(EntityGroup::Gpu, &mig_sample(bytes, "4.5"));
        let metrics = recorder.finish();

        let data = find(&metrics, "dcgm_fi_prof_bytes").expect("counter exported");
        let sum = data.as_any().downcast_ref::<Sum<f64>>().unwrap();
        assert!(sum.is_monotonic);
        assert_eq!(sum.data_points.len(), 1);
        assert_eq!(sum.data_points[0].value, 7.5);
    }

    #[test]
    fn test_histogram_records_each_value() {
        let recorder = Recorder::new();
        let latency = counters().remove(2);
        for value in ["2", "4"] {
            recorder
                .emitter
                .observe(EntityGroup::Gpu, &mig_sample(latency.clone(), value));
        }
        let metrics = recorder.finish();

        let data = find(&metrics, "dcgm_fi_latency").expect("histogram exported");
        let histogram = data.as_any().downcast_ref::<HistogramData<f64>>().unwrap();
        assert_eq!(histogram.data_points.len(), 1);
        assert_eq!(histogram.data_points[0].count, 2);
        assert_eq!(histogram.data_points[0].sum, 6.0);
    }

    #[test]
    fn test_group_prefix_and_skipped_label_counter() {
        let recorder = Recorder::new();
        let all = counters();
        let metric = Metric::new(all[0].clone(), "4", "55")
            .with_device("nvswitch1")
            .with_hostname("node-1");
        recorder.emitter.observe(
            EntityGroup::Link,
            &MetricsByCounter::from([(all[0].clone(), vec![metric])]),
        );
        recorder
            .emitter
            .observe(EntityGroup::Gpu, &grouping(all[3].clone(), "r535"));
        let metrics = recorder.finish();

        let data = find(&metrics, "dcgm_fi_dev_gpu_util").expect("gauge exported");
        let gauge = data.as_any().downcast_ref::<GaugeData<f64>>().unwrap();
        let point = &gauge.data_points[0];
        assert_eq!(point.value, 55.0);
        assert_eq!(
            attribute_keys(&point.attributes),
            vec!["hostname", "nvlink", "nvswitch"]
        );
        assert!(find(&metrics, "dcgm_fi_driver").is_none());
    }
}
