//! # Null-Distribution Builder & Classifier
//!
//! Summarizes the LOOCV person-fit statistics of the reference population into an
//! empirical null distribution, then scores out-of-sample respondents against it.
//!
//! Each scored person gets the `avg_logpost` bucket (quintile by default) they fall in,
//! a raw weight for that bucket, and a decision flag `lz > lz_cutoff`. Raw weights are
//! rescaled so they sum to the number of scored persons.

use crate::config::ClassifierConfig;
use crate::loocv::FoldOutcome;
use crate::model::ParameterSet;
use crate::personfit::{FitStatistic, score_person};
use crate::types::Population;
use crate::vectorize::{ExclusionReason, ResponseSet};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Converged folds needed before a null distribution is meaningful.
pub const MIN_REFERENCE_FOLDS: usize = 2;

#[derive(Error, Debug, PartialEq)]
pub enum ClassifyError {
    #[error(
        "Only {converged} reference folds converged; at least {required} are needed to build a null distribution."
    )]
    InsufficientReference { converged: usize, required: usize },
    #[error("Parameters cover {found} items, but the response set has {expected}.")]
    ItemCountMismatch { expected: usize, found: usize },
}

/// Empirical null summary of the reference population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullDistribution {
    pub n_folds: usize,
    pub lz_mean: f64,
    pub lz_sd: f64,
    pub avg_logpost_mean: f64,
    pub avg_logpost_sd: f64,
    /// Probabilities the breakpoints were taken at.
    pub quantiles: Vec<f64>,
    /// `avg_logpost` value at each probability in `quantiles`, ascending.
    pub avg_logpost_breakpoints: Vec<f64>,
    pub lz_percentile: f64,
    pub lz_cutoff: f64,
}

impl NullDistribution {
    /// Builds the null summary from the converged folds of a LOOCV run.
    pub fn from_folds(folds: &[FoldOutcome], config: &ClassifierConfig) -> Result<Self, ClassifyError> {
        let stats: Vec<&FitStatistic> = folds.iter().filter_map(FoldOutcome::statistic).collect();
        Self::from_statistics(&stats, config)
    }

    pub fn from_statistics(stats: &[&FitStatistic], config: &ClassifierConfig) -> Result<Self, ClassifyError> {
        if stats.len() < MIN_REFERENCE_FOLDS {
            return Err(ClassifyError::InsufficientReference {
                converged: stats.len(),
                required: MIN_REFERENCE_FOLDS,
            });
        }
        let mut lz: Vec<f64> = stats.iter().map(|s| s.lz).collect();
        let mut avg: Vec<f64> = stats.iter().map(|s| s.avg_logpost).collect();
        lz.sort_by(f64::total_cmp);
        avg.sort_by(f64::total_cmp);

        let (lz_mean, lz_sd) = mean_and_sd(&lz);
        let (avg_logpost_mean, avg_logpost_sd) = mean_and_sd(&avg);
        let null = Self {
            n_folds: stats.len(),
            lz_mean,
            lz_sd,
            avg_logpost_mean,
            avg_logpost_sd,
            quantiles: config.quantiles.clone(),
            avg_logpost_breakpoints: config.quantiles.iter().map(|&p| quantile(&avg, p)).collect(),
            lz_percentile: config.lz_percentile,
            lz_cutoff: quantile(&lz, config.lz_percentile),
        };
        log::info!(
            "Null distribution over {} folds: lz {:.3} +/- {:.3}, cutoff {:.3} at p = {}.",
            null.n_folds,
            null.lz_mean,
            null.lz_sd,
            null.lz_cutoff,
            null.lz_percentile
        );
        Ok(null)
    }

    /// 1-based bucket of `avg_logpost` among the breakpoints. Values equal to a
    /// breakpoint fall in the lower bucket.
    pub fn bucket(&self, avg_logpost: f64) -> usize {
        1 + self
            .avg_logpost_breakpoints
            .iter()
            .filter(|&&b| avg_logpost > b)
            .count()
    }

    pub fn bucket_count(&self) -> usize {
        self.avg_logpost_breakpoints.len() + 1
    }

    pub fn is_flagged(&self, lz: f64) -> bool {
        lz > self.lz_cutoff
    }
}

/// Quantile of an ascending slice with linear interpolation between order statistics
/// (Hyndman & Fan type 7).
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * p.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

fn mean_and_sd(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (mean, (ss / (n - 1.0)).sqrt())
}

/// Where a person's statistic came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    /// Reference member scored through their own LOOCV fold.
    Fold(String),
    /// Out-of-sample respondent scored against the full-population fit.
    OutOfSample,
    /// Removed before fitting.
    Excluded,
}

impl OutcomeSource {
    pub fn label(&self) -> &str {
        match self {
            Self::Fold(state) => state,
            Self::OutOfSample => "out_of_sample",
            Self::Excluded => "excluded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonOutcome {
    pub person_id: String,
    pub population: Option<Population>,
    pub source: OutcomeSource,
    pub statistic: Option<FitStatistic>,
    pub quintile: Option<usize>,
    pub fit_weight: Option<f64>,
    pub flagged: Option<bool>,
    pub eligible: bool,
    pub exclusion: Option<ExclusionReason>,
}

impl PersonOutcome {
    pub fn lz(&self) -> Option<f64> {
        self.statistic.as_ref().map(|s| s.lz)
    }

    pub fn avg_logpost(&self) -> Option<f64> {
        self.statistic.as_ref().map(|s| s.avg_logpost)
    }

    pub fn meets_inclusion(&self) -> bool {
        self.eligible && self.fit_weight.is_some()
    }
}

/// Scores every out-of-sample person of `set` against the full-population parameters.
///
/// Person effects are estimated by one-dimensional MAP since these persons never took
/// part in fitting. The returned weights sum to the number of scored persons; when every
/// raw bucket weight is zero each person gets weight 1.
pub fn score_population(
    set: &ResponseSet,
    params: &ParameterSet,
    null: &NullDistribution,
    config: &ClassifierConfig,
) -> Result<Vec<PersonOutcome>, ClassifyError> {
    if params.n_items() != set.n_items() {
        return Err(ClassifyError::ItemCountMismatch {
            expected: set.n_items(),
            found: params.n_items(),
        });
    }
    let categories: Vec<u8> = set.items.iter().map(|item| item.categories).collect();
    let scored: Vec<_> = set.persons_in(Population::Scored).collect();

    let mut outcomes: Vec<PersonOutcome> = scored
        .par_iter()
        .map(|&person| {
            let record = &set.persons[person.get()];
            let stat = score_person(set.responses_for(person), record.covariate, &categories, params);
            let fit_defined = stat.lz.is_finite() && stat.avg_logpost.is_finite();
            PersonOutcome {
                person_id: record.id.clone(),
                population: Some(Population::Scored),
                source: OutcomeSource::OutOfSample,
                quintile: fit_defined.then(|| null.bucket(stat.avg_logpost)),
                flagged: fit_defined.then(|| null.is_flagged(stat.lz)),
                statistic: Some(stat),
                fit_weight: None,
                eligible: record.eligible,
                exclusion: None,
            }
        })
        .collect();

    let raw: Vec<Option<f64>> = outcomes
        .iter()
        .map(|o| o.quintile.map(|q| config.raw_bucket_weight(q)))
        .collect();
    let weights = conserve_weights(&raw);
    for (outcome, weight) in outcomes.iter_mut().zip(weights) {
        outcome.fit_weight = weight;
    }

    let flagged = outcomes.iter().filter(|o| o.flagged == Some(true)).count();
    log::info!(
        "Scored {} out-of-sample persons; {} flagged as consistent with the reference population.",
        outcomes.len(),
        flagged
    );
    Ok(outcomes)
}

/// Rescales raw weights so the defined ones sum to their count.
pub fn conserve_weights(raw: &[Option<f64>]) -> Vec<Option<f64>> {
    let defined = raw.iter().flatten().count();
    let total: f64 = raw.iter().flatten().sum();
    raw.iter()
        .map(|w| {
            w.map(|w| {
                if total > 0.0 {
                    w * defined as f64 / total
                } else {
                    1.0
                }
            })
        })
        .collect()
}

/// Outcome of a reference member, taken from their LOOCV fold.
pub fn reference_outcome(
    fold: &FoldOutcome,
    null: Option<&NullDistribution>,
    eligible: bool,
) -> PersonOutcome {
    let statistic = fold.statistic().cloned();
    let defined = statistic.is_some();
    PersonOutcome {
        person_id: fold.person_id.clone(),
        population: Some(Population::Reference),
        source: OutcomeSource::Fold(fold.state.label().to_string()),
        quintile: null
            .zip(statistic.as_ref())
            .map(|(null, stat)| null.bucket(stat.avg_logpost)),
        flagged: null
            .zip(statistic.as_ref())
            .map(|(null, stat)| null.is_flagged(stat.lz)),
        statistic,
        fit_weight: defined.then_some(1.0),
        eligible,
        exclusion: None,
    }
}

pub fn excluded_outcome(person_id: &str, reason: &ExclusionReason, eligible: bool) -> PersonOutcome {
    PersonOutcome {
        person_id: person_id.to_string(),
        population: None,
        source: OutcomeSource::Excluded,
        statistic: None,
        quintile: None,
        fit_weight: None,
        flagged: None,
        eligible,
        exclusion: Some(reason.clone()),
    }
}
