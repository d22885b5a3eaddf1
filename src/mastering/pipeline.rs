//! Ordered fallback over mastering tiers.
//!
//! Tiers are attempted in order and the first one that produces an exported
//! artifact wins. Every attempt, successful or not, is recorded so the job can
//! report which methods were tried.

use super::engine::MasteringEngine;
use super::tiers::{default_tiers, MasteringStrategy, TierContext, TierError};
use crate::ingest::AudioConverter;
use crate::jobs::{ExportFormat, MethodUsed, TierAttempt};
use crate::server::metrics;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct MasteringOutcome {
    pub method_used: MethodUsed,
    pub output: PathBuf,
    pub attempts: Vec<TierAttempt>,
}

/// Every applicable tier failed.
#[derive(Debug, Error)]
#[error("{}", describe_failures(.attempts))]
pub struct PipelineError {
    pub attempts: Vec<TierAttempt>,
}

fn describe_failures(attempts: &[TierAttempt]) -> String {
    if attempts.is_empty() {
        return "no mastering method could be attempted".to_string();
    }
    let tried: Vec<String> = attempts
        .iter()
        .map(|a| match &a.error {
            Some(error) => format!("{}: {}", a.tier, error),
            None => a.tier.to_string(),
        })
        .collect();
    format!("all mastering methods failed ({})", tried.join("; "))
}

pub struct MasteringPipeline {
    tiers: Vec<Box<dyn MasteringStrategy>>,
    converter: Arc<dyn AudioConverter>,
}

impl MasteringPipeline {
    /// Pipeline with the standard tier order:
    /// reference, parameter, reduced parameter, pass-through.
    pub fn new(engine: Arc<dyn MasteringEngine>, converter: Arc<dyn AudioConverter>) -> Self {
        Self::with_tiers(default_tiers(engine, converter.clone()), converter)
    }

    pub fn with_tiers(
        tiers: Vec<Box<dyn MasteringStrategy>>,
        converter: Arc<dyn AudioConverter>,
    ) -> Self {
        Self { tiers, converter }
    }

    /// Masters `ctx.target` and exports it to `output`.
    ///
    /// On failure nothing is left at `output`.
    pub async fn run(
        &self,
        ctx: &TierContext<'_>,
        export_format: ExportFormat,
        output: &Path,
    ) -> Result<MasteringOutcome, PipelineError> {
        let mut attempts = Vec::new();

        for strategy in &self.tiers {
            let tier = strategy.tier();
            if !strategy.applies(ctx) {
                continue;
            }

            let start = Instant::now();
            let result = self.attempt_tier(strategy.as_ref(), ctx, export_format, output).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            metrics::record_tier_attempt(tier.as_str(), result.is_ok());

            match result {
                Ok(()) => {
                    info!(
                        "Job {}: tier {} succeeded in {} ms",
                        ctx.job_id, tier, elapsed_ms
                    );
                    attempts.push(TierAttempt {
                        tier,
                        succeeded: true,
                        error: None,
                        elapsed_ms,
                    });
                    return Ok(MasteringOutcome {
                        method_used: tier,
                        output: output.to_path_buf(),
                        attempts,
                    });
                }
                Err(e) => {
                    warn!(
                        "Job {}: tier {} failed after {} ms: {}",
                        ctx.job_id, tier, elapsed_ms, e
                    );
                    remove_partial(output).await;
                    attempts.push(TierAttempt {
                        tier,
                        succeeded: false,
                        error: Some(e.to_string()),
                        elapsed_ms,
                    });
                }
            }
        }

        Err(PipelineError { attempts })
    }

    async fn attempt_tier(
        &self,
        strategy: &dyn MasteringStrategy,
        ctx: &TierContext<'_>,
        export_format: ExportFormat,
        output: &Path,
    ) -> Result<(), TierError> {
        let intermediate = ctx
            .work_dir
            .join(format!("{}.mastered.wav", strategy.tier().as_str()));
        strategy.attempt(ctx, &intermediate).await?;
        self.converter
            .encode(&intermediate, output, export_format)
            .await
            .map_err(TierError::Export)?;
        Ok(())
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial output {:?}: {}", path, e);
        }
    }
}
