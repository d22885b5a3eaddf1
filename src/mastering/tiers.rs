//! Fallback tiers, most ambitious first.

use super::engine::{EngineError, MasteringEngine};
use crate::ffmpeg::ConversionError;
use crate::ingest::{AudioConverter, NormalizedAudio};
use crate::jobs::{MasteringMethod, MasteringParams, MethodUsed};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TierError {
    /// The tier cannot run for this job (missing reference, capability off).
    #[error("unsupported method: {0}")]
    Unsupported(String),

    #[error("reference track unusable: {0}")]
    Reference(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("export failed: {0}")]
    Export(ConversionError),
}

/// State of the optional reference track once ingest has looked at it.
#[derive(Debug, Clone)]
pub enum ReferenceInput {
    Missing,
    Ready(NormalizedAudio),
    /// The upload was present but failed ingest; holds the ingest error.
    Rejected(String),
}

/// Everything a tier may read. Tiers never touch the job store.
#[derive(Debug, Clone, Copy)]
pub struct TierContext<'a> {
    pub job_id: &'a str,
    pub target: &'a NormalizedAudio,
    pub reference: &'a ReferenceInput,
    pub params: MasteringParams,
    pub method_requested: MasteringMethod,
    pub work_dir: &'a Path,
}

/// One strategy in the pipeline's ordered attempt list.
#[async_trait]
pub trait MasteringStrategy: Send + Sync {
    fn tier(&self) -> MethodUsed;

    /// Tiers that do not apply are skipped without being recorded.
    fn applies(&self, _ctx: &TierContext<'_>) -> bool {
        true
    }

    /// Writes a WAV intermediate to `output`.
    async fn attempt(&self, ctx: &TierContext<'_>, output: &Path) -> Result<(), TierError>;
}

pub struct ReferenceTier {
    engine: Arc<dyn MasteringEngine>,
}

impl ReferenceTier {
    pub fn new(engine: Arc<dyn MasteringEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MasteringStrategy for ReferenceTier {
    fn tier(&self) -> MethodUsed {
        MethodUsed::Reference
    }

    fn applies(&self, ctx: &TierContext<'_>) -> bool {
        ctx.method_requested == MasteringMethod::Reference
    }

    async fn attempt(&self, ctx: &TierContext<'_>, output: &Path) -> Result<(), TierError> {
        let reference = match ctx.reference {
            ReferenceInput::Ready(audio) => audio,
            ReferenceInput::Missing => {
                return Err(TierError::Unsupported(
                    "no reference track supplied".to_string(),
                ))
            }
            ReferenceInput::Rejected(reason) => return Err(TierError::Reference(reason.clone())),
        };
        if !self.engine.supports_reference_matching() {
            return Err(TierError::Unsupported(
                "reference matching is not available".to_string(),
            ));
        }
        self.engine
            .master_by_reference(&ctx.target.path, &reference.path, output)
            .await?;
        Ok(())
    }
}

pub struct ParameterTier {
    engine: Arc<dyn MasteringEngine>,
}

impl ParameterTier {
    pub fn new(engine: Arc<dyn MasteringEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MasteringStrategy for ParameterTier {
    fn tier(&self) -> MethodUsed {
        MethodUsed::Parameter
    }

    async fn attempt(&self, ctx: &TierContext<'_>, output: &Path) -> Result<(), TierError> {
        self.engine
            .master_by_parameters(&ctx.target.path, &ctx.params, output)
            .await?;
        Ok(())
    }
}

/// Loudness normalization only.
pub struct ReducedParameterTier {
    engine: Arc<dyn MasteringEngine>,
}

impl ReducedParameterTier {
    pub fn new(engine: Arc<dyn MasteringEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MasteringStrategy for ReducedParameterTier {
    fn tier(&self) -> MethodUsed {
        MethodUsed::ReducedParameter
    }

    async fn attempt(&self, ctx: &TierContext<'_>, output: &Path) -> Result<(), TierError> {
        self.engine
            .master_by_parameters(&ctx.target.path, &ctx.params.reduced(), output)
            .await?;
        Ok(())
    }
}

/// Last resort: the input re-encoded with basic gain staging.
pub struct PassthroughTier {
    converter: Arc<dyn AudioConverter>,
}

impl PassthroughTier {
    pub fn new(converter: Arc<dyn AudioConverter>) -> Self {
        Self { converter }
    }
}

#[async_trait]
impl MasteringStrategy for PassthroughTier {
    fn tier(&self) -> MethodUsed {
        MethodUsed::Passthrough
    }

    async fn attempt(&self, ctx: &TierContext<'_>, output: &Path) -> Result<(), TierError> {
        self.converter.passthrough(&ctx.target.path, output).await?;
        Ok(())
    }
}

/// The standard attempt list.
pub fn default_tiers(
    engine: Arc<dyn MasteringEngine>,
    converter: Arc<dyn AudioConverter>,
) -> Vec<Box<dyn MasteringStrategy>> {
    vec![
        Box::new(ReferenceTier::new(engine.clone())),
        Box::new(ParameterTier::new(engine.clone())),
        Box::new(ReducedParameterTier::new(engine)),
        Box::new(PassthroughTier::new(converter)),
    ]
}
