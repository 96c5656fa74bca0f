//! The metrics pipeline: collect, transform, accumulate, render and emit.

use std::time::Duration;

use gpusight_common::EntityGroup;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::accumulator::CounterAccumulator;
use crate::collector::BoxedCollector;
use crate::emitter::MeterEmitter;
use crate::error::PipelineError;
use crate::render::Renderer;
use crate::transform::{Transform, TransformStage};

/// Assembles a [`MetricsPipeline`].
pub struct MetricsPipelineBuilder {
    interval: Duration,
    collectors: Vec<(EntityGroup, BoxedCollector)>,
    transforms: Vec<TransformStage>,
    emitter: Option<MeterEmitter>,
}

impl MetricsPipelineBuilder {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            collectors: Vec::new(),
            transforms: Vec::new(),
            emitter: None,
        }
    }

    /// Attach the collector of a group, replacing any previous one.
    pub fn with_collector(mut self, group: EntityGroup, collector: BoxedCollector) -> Self {
        self.collectors.retain(|(g, _)| *g != group);
        self.collectors.push((group, collector));
        self
    }

    /// Set the GPU transform stages, applied in order.
    pub fn with_transforms(mut self, transforms: Vec<TransformStage>) -> Self {
        self.transforms = transforms;
        self
    }

    /// Mirror every group into meter instruments.
    pub fn with_emitter(mut self, emitter: MeterEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Validate and build the pipeline.
    ///
    /// Every collector must serve the group it was attached to and, with an
    /// emitter, every instrumentable counter it advertises must have a
    /// registered instrument.
    pub fn build(self) -> Result<MetricsPipeline, PipelineError> {
        if self.interval.is_zero() {
            return Err(PipelineError::Config(
                "collect interval must be > 0".to_string(),
            ));
        }

        let mut collectors: Vec<Option<BoxedCollector>> =
            EntityGroup::ALL.iter().map(|_| None).collect();

        for (group, collector) in self.collectors {
            let reported = collector.group();
            if reported != group {
                return Err(PipelineError::GroupMismatch { group, reported });
            }

            if let Some(emitter) = &self.emitter {
                for counter in collector.counters() {
                    if MeterEmitter::is_instrumentable(counter)
                        && !emitter.has_instrument(counter)
                    {
                        return Err(PipelineError::UnregisteredCounter {
                            group,
                            name: counter.field_name.clone(),
                            prom_type: counter.prom_type.to_string(),
                        });
                    }
                }
            }

            collectors[group.index()] = Some(collector);
        }

        if collectors[EntityGroup::Gpu.index()].is_none() && !self.transforms.is_empty() {
            warn!("Transform stages configured without a GPU collector; they will not run");
        }

        Ok(MetricsPipeline {
            interval: self.interval,
            collectors,
            transforms: self.transforms,
            emitter: self.emitter,
            renderer: Renderer::new(),
            accumulator: CounterAccumulator::new(),
        })
    }
}

/// A configured pipeline instance.
///
/// Owns its collectors and counter state; dropping the pipeline releases
/// them.
pub struct MetricsPipeline {
    interval: Duration,
    collectors: Vec<Option<BoxedCollector>>,
    transforms: Vec<TransformStage>,
    emitter: Option<MeterEmitter>,
    renderer: Renderer,
    accumulator: CounterAccumulator,
}

impl MetricsPipeline {
    pub fn builder(interval: Duration) -> MetricsPipelineBuilder {
        MetricsPipelineBuilder::new(interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Groups with a collector, in processing order.
    pub fn groups(&self) -> Vec<EntityGroup> {
        EntityGroup::ALL
            .iter()
            .copied()
            .filter(|g| self.collectors[g.index()].is_some())
            .collect()
    }

    pub fn accumulator(&self) -> &CounterAccumulator {
        &self.accumulator
    }

    /// Run one collection cycle and return the exposition text.
    ///
    /// A collection or transform failure in any group, or a GPU render
    /// failure, fails the whole cycle. Render failures of other groups only
    /// drop that group's section.
    ///
    /// # Panics
    ///
    /// Panics if the emitter meets a value that is not a number.
    pub fn run_cycle(&mut self) -> Result<String, PipelineError> {
        let mut output = String::new();

        for group in EntityGroup::ALL {
            let Some(collector) = self.collectors[group.index()].as_mut() else {
                continue;
            };

            let mut metrics = collector
                .get_metrics()
                .map_err(|source| PipelineError::Collect { group, source })?;

            if group == EntityGroup::Gpu {
                for stage in &self.transforms {
                    stage
                        .process(&mut metrics, collector.system_info())
                        .map_err(|source| PipelineError::Transform {
                            stage: stage.name().to_string(),
                            source,
                        })?;
                }
            }

            if let Some(emitter) = &self.emitter {
                emitter.observe(group, &metrics);
            }

            if group == EntityGroup::Gpu {
                let extended = self.accumulator.extend(&metrics);
                debug!(series = self.accumulator.len(), "Counter accumulator size");

                let text = self
                    .renderer
                    .render(group, &extended)
                    .map_err(|source| PipelineError::Render { group, source })?;
                output.push_str(&text);
                continue;
            }

            if metrics.is_empty() {
                continue;
            }

            match self.renderer.render(group, &metrics) {
                Ok(text) => output.push_str(&text),
                Err(e) => {
                    warn!(group = %group, error = %e, "Failed to format metrics, omitting group");
                }
            }
        }

        Ok(output)
    }

    /// Run one cycle per tick until `stop` is set or `out` is closed.
    ///
    /// The first tick fires one interval after start and missed ticks are
    /// skipped. A failed cycle publishes an empty payload rather than stale
    /// data. Publishing never waits: when `out` is full the payload is
    /// dropped.
    pub async fn run(mut self, out: mpsc::Sender<String>, mut stop: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            groups = ?self.groups(),
            transforms = self.transforms.len(),
            "Pipeline starting"
        );

        if *stop.borrow() {
            info!("Pipeline stopped");
            return;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let payload = match self.run_cycle() {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "Failed to collect metrics");
                            String::new()
                        }
                    };

                    if !publish(&out, payload) {
                        info!("Output channel closed");
                        break;
                    }
                }
            }
        }

        info!("Pipeline stopped");
    }
}

/// Offer a payload without waiting. Returns false once the receiver is gone.
fn publish(out: &mpsc::Sender<String>, payload: String) -> bool {
    match out.try_send(payload) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            error!("Output channel is full, skipping metrics");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
