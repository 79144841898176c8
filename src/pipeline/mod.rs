//! Cross-node relay pipelines

mod config;
mod manager;
#[allow(clippy::module_inception)]
mod pipeline;

pub use config::PipelineConfig;
pub use manager::{pipeline_id, PipelineManager, Pipelines, PIPELINE_NAMESPACE_CALL};
pub use pipeline::Pipeline;
