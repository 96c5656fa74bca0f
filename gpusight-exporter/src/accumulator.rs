//! Running sums that turn GPU gauges into cumulative counters.

use std::collections::HashMap;

use gpusight_common::MetricsByCounter;
use tracing::{trace, warn};

use crate::labels::format_value;

/// Per-series running totals, keyed by metric fingerprint.
///
/// Entries are never evicted: a series that disappears keeps its total, and
/// resumes from it if the series comes back.
#[derive(Debug, Default)]
pub struct CounterAccumulator {
    totals: HashMap<String, f64>,
}

impl CounterAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of series tracked.
    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Current total of a series.
    pub fn total(&self, fingerprint: &str) -> Option<f64> {
        self.totals.get(fingerprint).copied()
    }

    /// Return a copy of `metrics` extended with one derived counter per
    /// original counter.
    ///
    /// Each sample's value is added to the running total of its series and
    /// the derived sample carries the new total. Samples whose value does not
    /// parse are skipped with a warning and do not touch the total.
    pub fn extend(&mut self, metrics: &MetricsByCounter) -> MetricsByCounter {
        let mut extended = metrics.clone();

        for (counter, samples) in metrics {
            let derived_counter = counter.derived();
            let mut derived = Vec::with_capacity(samples.len());

            for metric in samples {
                let value: f64 = match metric.value.parse() {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            metric = %counter.field_name,
                            gpu = %metric.entity_id,
                            value = %metric.value,
                            error = %e,
                            "Failed to parse metric value, skipping counter update"
                        );
                        continue;
                    }
                };

                let total = self.totals.entry(metric.fingerprint()).or_insert(0.0);
                *total += value;

                let mut sample = metric.clone();
                sample.counter = derived_counter.clone();
                sample.value = format_value(*total);
                derived.push(sample);
            }

            if derived.is_empty() {
                continue;
            }

            trace!(
                counter = %derived_counter.field_name,
                samples = derived.len(),
                "Derived cumulative counter"
            );
            extended.insert(derived_counter, derived);
        }

        extended
    }
}
