//! Pipeline error types.

use gpusight_common::EntityGroup;
use thiserror::Error;

use crate::collector::CollectorError;
use crate::render::RenderError;
use crate::transform::TransformError;

/// Errors raised while building or running the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to collect {group} metrics: {source}")]
    Collect {
        group: EntityGroup,
        #[source]
        source: CollectorError,
    },

    #[error("transform '{stage}' failed: {source}")]
    Transform {
        stage: String,
        #[source]
        source: TransformError,
    },

    #[error("failed to render {group} metrics: {source}")]
    Render {
        group: EntityGroup,
        #[source]
        source: RenderError,
    },

    #[error("counter {name} ({prom_type}) emitted by the {group} collector has no registered instrument")]
    UnregisteredCounter {
        group: EntityGroup,
        name: String,
        prom_type: String,
    },

    #[error("collector for {group} reports group {reported}")]
    GroupMismatch {
        group: EntityGroup,
        reported: EntityGroup,
    },

    #[error("invalid pipeline configuration: {0}")]
    Config(String),
}
