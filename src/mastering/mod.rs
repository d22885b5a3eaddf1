//! Mastering: the DSP engine seam and the tiered fallback pipeline.

mod engine;
mod pipeline;
mod tiers;

pub use engine::{
    parameter_filter_chain, EngineError, FfmpegMasteringEngine, MasteringEngine,
    TRUE_PEAK_CEILING_DB,
};
pub use pipeline::{MasteringOutcome, MasteringPipeline, PipelineError};
pub use tiers::{
    default_tiers, MasteringStrategy, ParameterTier, PassthroughTier, ReducedParameterTier,
    ReferenceInput, ReferenceTier, TierContext, TierError,
};
