//! End-to-end screening run: vectorize, fit the reference population, cross-validate,
//! build the null distribution, and score the out-of-sample respondents.

use crate::cache::{ArtifactCache, CacheError, CacheKey, Provenance, ScreeningArtifact};
use crate::classify::{
    ClassifyError, NullDistribution, PersonOutcome, excluded_outcome, reference_outcome,
    score_population,
};
use crate::config::{ConfigError, ScreeningConfig};
use crate::estimate::{self, EstimationError, FitControl, FitDiagnostics, FitResult};
use crate::loocv::{LoocvError, LoocvInput, LoocvSummary, run_loocv};
use crate::model::{FitData, ParameterSet};
use crate::optimize::ConvergenceStatus;
use crate::progress::LoocvProgressObserver;
use crate::types::Population;
use crate::vectorize::{ItemDeclaration, ResponseSet, VectorizeError, WideMatrix, vectorize};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vectorize(#[from] VectorizeError),
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Loocv(#[from] LoocvError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("The response matrix contains no reference persons after exclusions.")]
    NoReference,
    #[error("The full-population fit failed numerically: {0}")]
    FullFitFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningReport {
    pub n_items: usize,
    pub n_reference: usize,
    pub n_scored: usize,
    pub n_excluded: usize,
    pub full_fit_status: ConvergenceStatus,
    pub full_fit: FitDiagnostics,
    pub loocv: LoocvSummary,
    pub null: NullDistribution,
    pub flagged: usize,
    pub cache_hit: bool,
    pub artifact_path: Option<PathBuf>,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone)]
pub struct ScreeningOutput {
    /// One outcome per input row, in input order.
    pub outcomes: Vec<PersonOutcome>,
    pub params: ParameterSet,
    pub report: ScreeningReport,
}

/// Fits the model to the reference population only.
pub fn fit_reference(
    set: &ResponseSet,
    config: &ScreeningConfig,
) -> Result<(FitData, FitResult), PipelineError> {
    let reference = FitData::from_population(set, Population::Reference);
    if reference.n_persons() == 0 {
        return Err(PipelineError::NoReference);
    }
    log::info!(
        "Fitting the ordinal model to {} reference persons over {} items.",
        reference.n_persons(),
        reference.n_items()
    );
    let result = estimate::fit(
        &reference,
        None,
        &config.model,
        &config.optimizer,
        &FitControl::default(),
    )?;
    match &result.status {
        ConvergenceStatus::NumericalFailure(reason) => {
            return Err(PipelineError::FullFitFailed(reason.clone()));
        }
        status if !status.is_converged() => log::warn!(
            "Full-population fit did not converge ({status}); folds warm start from the last iterate."
        ),
        status => log::info!(
            "Full-population fit {status} after {} iterations (objective {:.6}, spacing {:.4}, eta SD {:.4}).",
            result.diagnostics.iterations,
            result.diagnostics.objective,
            result.params.spacing,
            result.params.person_effect_sd()
        ),
    }
    Ok((reference, result))
}

/// Runs the full screening pipeline, reusing a cached LOOCV run when its provenance
/// matches the input and `cache.rebuild` is off.
pub fn run(
    matrix: &WideMatrix,
    declarations: &[ItemDeclaration],
    config: &ScreeningConfig,
    observer: &mut dyn LoocvProgressObserver,
) -> Result<ScreeningOutput, PipelineError> {
    let start = Instant::now();
    config.validate()?;
    let set = vectorize(matrix, declarations, &config.vectorize)?;
    let n_reference = set.persons_in(Population::Reference).count();
    if n_reference == 0 {
        return Err(PipelineError::NoReference);
    }

    let cache = ArtifactCache::new(config.cache.dir.clone());
    let key = CacheKey::new(&set.item_set_hash, &set.content_hash, n_reference, config);
    let cached = if config.cache.rebuild {
        cache.invalidate()?;
        None
    } else {
        cache.load(&key)?
    };
    let cache_hit = cached.is_some();

    let (artifact, artifact_path) = match cached {
        Some(artifact) => (artifact, Some(cache.artifact_path())),
        None => {
            let (reference, full) = fit_reference(&set, config)?;
            let input = LoocvInput::new(reference, full.params.clone(), set.content_hash.clone())
                .with_checkpoint(cache.checkpoint_path());
            let loocv = run_loocv(&input, config, observer)?;
            let artifact = ScreeningArtifact {
                provenance: Provenance::new(&key, &loocv.summary),
                full_fit_status: full.status,
                full_fit: full.diagnostics,
                params: full.params,
                summary: loocv.summary,
                folds: loocv.outcomes,
            };
            let path = if artifact.summary.complete {
                let path = cache.store(&artifact)?;
                cache.discard_checkpoint()?;
                Some(path)
            } else {
                log::warn!(
                    "LOOCV run is incomplete ({} folds skipped); results are not cached. Rerun to resume from the checkpoint.",
                    artifact.summary.skipped
                );
                None
            };
            (artifact, path)
        }
    };

    let null = NullDistribution::from_folds(&artifact.folds, &config.classifier)?;
    let scored = score_population(&set, &artifact.params, &null, &config.classifier)?;
    let n_scored = scored.len();
    let flagged = scored.iter().filter(|o| o.flagged == Some(true)).count();

    let mut by_id: HashMap<String, PersonOutcome> = HashMap::with_capacity(matrix.rows.len());
    for fold in &artifact.folds {
        let eligible = set
            .person_index(&fold.person_id)
            .map(|p| set.persons[p.get()].eligible)
            .unwrap_or(false);
        by_id.insert(fold.person_id.clone(), reference_outcome(fold, Some(&null), eligible));
    }
    for outcome in scored {
        by_id.insert(outcome.person_id.clone(), outcome);
    }
    let eligibility: HashMap<&str, bool> = matrix
        .rows
        .iter()
        .map(|row| (row.person_id.as_str(), row.eligible))
        .collect();
    for exclusion in &set.exclusions {
        let eligible = eligibility.get(exclusion.person_id.as_str()).copied().unwrap_or(false);
        by_id.insert(
            exclusion.person_id.clone(),
            excluded_outcome(&exclusion.person_id, &exclusion.reason, eligible),
        );
    }
    let outcomes: Vec<PersonOutcome> = matrix
        .rows
        .iter()
        .filter_map(|row| by_id.remove(&row.person_id))
        .collect();

    let report = ScreeningReport {
        n_items: set.n_items(),
        n_reference,
        n_scored,
        n_excluded: set.exclusions.len(),
        full_fit_status: artifact.full_fit_status.clone(),
        full_fit: artifact.full_fit.clone(),
        loocv: artifact.summary.clone(),
        null,
        flagged,
        cache_hit,
        artifact_path,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };
    log::info!(
        "Screening finished in {:.1}s: {} reference ({} folds converged), {} scored, {} flagged, {} excluded{}.",
        report.elapsed_secs,
        report.n_reference,
        report.loocv.converged,
        report.n_scored,
        report.flagged,
        report.n_excluded,
        if cache_hit { ", from cache" } else { "" }
    );
    Ok(ScreeningOutput {
        outcomes,
        params: artifact.params,
        report,
    })
}
