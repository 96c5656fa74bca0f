//! GPU telemetry exporter.
//!
//! This crate periodically collects GPU, NVSwitch, NVLink, CPU and CPU core
//! metrics, enriches GPU metrics with workload identity, and publishes them
//! in Prometheus exposition format and to OpenTelemetry instruments.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────┐   ┌─────────────┐
//! │ Collectors │──>│ Transforms │──>│ Accumulator │──>│ Renderer │──>│ HTTP Server │
//! │ (5 groups) │   │ (GPU only) │   │ (GPU only)  │   │          │   │ (/metrics)  │
//! └────────────┘   └────────────┘   └─────────────┘   └──────────┘   └─────────────┘
//!        │                │
//!        └────────────────┴──> Meter Emitter ──> OTLP
//! ```
//!
//! # Usage
//!
//! Run the exporter binary with a configuration file:
//!
//! ```bash
//! gpusight-exporter --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod accumulator;
pub mod collector;
pub mod config;
pub mod emitter;
pub mod error;
pub mod http;
pub mod labels;
pub mod otel;
pub mod pipeline;
pub mod render;
pub mod simulate;
pub mod template;
pub mod transform;
pub mod watcher;

pub use accumulator::CounterAccumulator;
pub use collector::{BoxedCollector, CollectorError, EntityCollector, StaticCollector};
pub use config::ExporterConfig;
pub use emitter::MeterEmitter;
pub use error::PipelineError;
pub use http::{HttpServer, MetricsStore, SharedStore};
pub use pipeline::{MetricsPipeline, MetricsPipelineBuilder};
pub use render::{RenderError, Renderer};
pub use simulate::{SimulatedCollector, build_simulated_pipeline};
pub use transform::{Transform, TransformError, TransformStage, build_transformations};
pub use watcher::{WorkloadEvent, WorkloadMeta, WorkloadResolver, WorkloadWatcher};
