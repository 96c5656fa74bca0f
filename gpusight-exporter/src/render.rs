//! Prometheus exposition rendering.
//!
//! The goal is the following layout for every counter of a group:
//!
//! ```text
//! # HELP FIELD_NAME HELP_MSG
//! # TYPE FIELD_NAME PROM_TYPE
//! FIELD_NAME{gpu="0",UUID="GPU-...",...} VALUE
//! FIELD_NAME{gpu="1",UUID="GPU-...",...} VALUE
//! ```

use std::collections::HashSet;
use std::fmt::Write;

use gpusight_common::{Counter, EntityGroup, MetricsByCounter};
use thiserror::Error;

use crate::labels::{escape_label_value, is_valid_label_name, is_valid_metric_name};
use crate::template::MetricTemplate;

/// Errors raised while rendering a group.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid metric name '{0}'")]
    InvalidMetricName(String),

    #[error("invalid label name '{label}' on metric {metric}")]
    InvalidLabelName { metric: String, label: String },

    #[error("duplicate label '{label}' on metric {metric}")]
    DuplicateLabel { metric: String, label: String },

    #[error("sample of {found} listed under counter {expected}")]
    CounterMismatch { expected: String, found: String },
}

/// Renders metric groupings with one compiled template per entity group.
#[derive(Debug, Clone)]
pub struct Renderer {
    templates: Vec<MetricTemplate>,
}

impl Renderer {
    /// Compile the templates for every entity group.
    pub fn new() -> Self {
        Self {
            templates: EntityGroup::ALL
                .iter()
                .map(|g| MetricTemplate::for_group(*g))
                .collect(),
        }
    }

    /// The compiled template of a group.
    pub fn template(&self, group: EntityGroup) -> &MetricTemplate {
        &self.templates[group.index()]
    }

    /// Render a grouping in exposition format.
    ///
    /// Counters are written in field id order so output is stable across
    /// cycles.
    pub fn render(
        &self,
        group: EntityGroup,
        metrics: &MetricsByCounter,
    ) -> Result<String, RenderError> {
        let template = self.template(group);

        let mut counters: Vec<&Counter> = metrics.keys().collect();
        counters.sort_by(|a, b| {
            (a.field_id, &a.field_name, a.prom_type).cmp(&(b.field_id, &b.field_name, b.prom_type))
        });

        let mut output = String::with_capacity(metrics.len() * 256);
        let mut seen = HashSet::new();

        for counter in counters {
            let name = &counter.field_name;
            if !is_valid_metric_name(name) {
                return Err(RenderError::InvalidMetricName(name.clone()));
            }

            let _ = writeln!(output, "# HELP {} {}", name, escape_help(&counter.help));
            let _ = writeln!(output, "# TYPE {} {}", name, counter.prom_type);

            for metric in &metrics[counter] {
                if &metric.counter != counter {
                    return Err(RenderError::CounterMismatch {
                        expected: name.clone(),
                        found: metric.counter.field_name.clone(),
                    });
                }

                seen.clear();
                output.push_str(name);
                output.push('{');
                for (i, (key, value)) in template.sample_labels(metric).into_iter().enumerate() {
                    if !is_valid_label_name(key) {
                        return Err(RenderError::InvalidLabelName {
                            metric: name.clone(),
                            label: key.to_string(),
                        });
                    }
                    if !seen.insert(key) {
                        return Err(RenderError::DuplicateLabel {
                            metric: name.clone(),
                            label: key.to_string(),
                        });
                    }
                    if i > 0 {
                        output.push(',');
                    }
                    let _ = write!(output, "{}=\"{}\"", key, escape_label_value(value));
                }
                let _ = writeln!(output, "}} {}", metric.value);
            }
        }

        Ok(output)
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Escape a HELP docstring.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusight_common::{Metric, MigInstance, PromType};

    fn util() -> Counter {
        Counter::new(203, "UTIL", PromType::Gauge, "GPU utilization")
    }

    fn grouping(counter: &Counter, metrics: Vec<Metric>) -> MetricsByCounter {
        let mut grouped = MetricsByCounter::new();
        grouped.insert(counter.clone(), metrics);
        grouped
    }

    #[test]
    fn test_render_gpu_sample() {
        let counter = util();
        let metrics = grouping(
            &counter,
            vec![
                Metric::new(counter.clone(), "0", "42")
                    .with_uuid("GPU-abc")
                    .with_pci_bus_id("00000000:3B:00.0")
                    .with_device("nvidia0")
                    .with_model_name("A100")
                    .with_hostname("node-1"),
            ],
        );

        let output = Renderer::new().render(EntityGroup::Gpu, &metrics).unwrap();

        assert_eq!(
            output,
            "# HELP UTIL GPU utilization\n\
             # TYPE UTIL gauge\n\
             UTIL{gpu=\"0\",UUID=\"GPU-abc\",pci_bus_id=\"00000000:3B:00.0\",device=\"nvidia0\",modelName=\"A100\",Hostname=\"node-1\"} 42\n"
        );
    }

    #[test]
    fn test_render_mig_labels() {
        let counter = util();
        let metrics = grouping(
            &counter,
            vec![
                Metric::new(counter.clone(), "0", "7")
                    .with_mig(MigInstance::new("3g.20gb", "1"))
                    .with_attribute("pod", "trainer-0"),
            ],
        );

        let output = Renderer::new().render(EntityGroup::Gpu, &metrics).unwrap();
        assert!(output.contains(
            "modelName=\"\",GPU_I_PROFILE=\"3g.20gb\",GPU_I_ID=\"1\",pod=\"trainer-0\"} 7\n"
        ));
    }

    #[test]
    fn test_render_orders_counters_by_field_id() {
        let temp = Counter::new(150, "TEMP", PromType::Gauge, "temperature");
        let util = util();
        let mut metrics = MetricsByCounter::new();
        metrics.insert(util.clone(), vec![Metric::new(util.clone(), "0", "1")]);
        metrics.insert(temp.clone(), vec![Metric::new(temp.clone(), "0", "55")]);

        let output = Renderer::new().render(EntityGroup::Gpu, &metrics).unwrap();
        let temp_pos = output.find("# HELP TEMP").unwrap();
        let util_pos = output.find("# HELP UTIL").unwrap();
        assert!(temp_pos < util_pos);
    }

    #[test]
    fn test_render_switch_and_link() {
        let counter = Counter::new(780, "NVSWITCH_TEMP", PromType::Gauge, "switch temp");
        let metrics = grouping(
            &counter,
            vec![Metric::new(counter.clone(), "2", "40").with_label("cluster", "east")],
        );
        let renderer = Renderer::new();

        assert!(
            renderer
                .render(EntityGroup::Switch, &metrics)
                .unwrap()
                .contains("NVSWITCH_TEMP{nvswitch=\"2\",cluster=\"east\"} 40\n")
        );

        let counter = Counter::new(781, "LINK_BW", PromType::Counter, "link bytes");
        let metrics = grouping(
            &counter,
            vec![Metric::new(counter.clone(), "5", "1000").with_device("2")],
        );
        assert!(
            renderer
                .render(EntityGroup::Link, &metrics)
                .unwrap()
                .contains("LINK_BW{nvlink=\"5\",nvswitch=\"2\"} 1000\n")
        );
    }

    #[test]
    fn test_render_escapes_values_and_help() {
        let counter = Counter::new(1, "X", PromType::Gauge, "line one\nline \\two");
        let metrics = grouping(
            &counter,
            vec![Metric::new(counter.clone(), "0", "1").with_label("note", "say \"hi\"")],
        );

        let output = Renderer::new().render(EntityGroup::Cpu, &metrics).unwrap();
        assert!(output.contains("# HELP X line one\\nline \\\\two\n"));
        assert!(output.contains("note=\"say \\\"hi\\\"\""));
    }

    #[test]
    fn test_render_rejects_duplicate_label() {
        let counter = Counter::new(780, "NVSWITCH_TEMP", PromType::Gauge, "");
        let metrics = grouping(
            &counter,
            vec![Metric::new(counter.clone(), "2", "40").with_label("nvswitch", "x")],
        );

        let result = Renderer::new().render(EntityGroup::Switch, &metrics);
        assert!(matches!(result, Err(RenderError::DuplicateLabel { .. })));
    }

    #[test]
    fn test_render_rejects_label_repeated_as_attribute() {
        let counter = util();
        let metrics = grouping(
            &counter,
            vec![
                Metric::new(counter.clone(), "0", "1")
                    .with_label("pod", "a")
                    .with_attribute("pod", "b"),
            ],
        );

        let result = Renderer::new().render(EntityGroup::Gpu, &metrics);
        assert!(matches!(result, Err(RenderError::DuplicateLabel { label, .. }) if label == "pod"));
    }

    #[test]
    fn test_render_rejects_invalid_label_name() {
        let counter = util();
        let metrics = grouping(
            &counter,
            vec![Metric::new(counter.clone(), "0", "1").with_attribute("app.kubernetes.io/name", "x")],
        );

        let result = Renderer::new().render(EntityGroup::Gpu, &metrics);
        assert!(matches!(result, Err(RenderError::InvalidLabelName { .. })));
    }

    #[test]
    fn test_render_rejects_mismatched_counter() {
        let counter = util();
        let other = Counter::new(1, "OTHER", PromType::Gauge, "");
        let metrics = grouping(&counter, vec![Metric::new(other, "0", "1")]);

        let result = Renderer::new().render(EntityGroup::Gpu, &metrics);
        assert!(matches!(result, Err(RenderError::CounterMismatch { .. })));
    }

    #[test]
    fn test_render_empty_grouping() {
        let output = Renderer::new()
            .render(EntityGroup::Gpu, &MetricsByCounter::new())
            .unwrap();
        assert!(output.is_empty());
    }
}
