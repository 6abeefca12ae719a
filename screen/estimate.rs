//! # Model Fitter
//!
//! MAP estimation of the ordinal mixed model. `fit` wraps the quasi-Newton minimizer
//! around the negative log-posterior, builds the starting point (cold or warm), and
//! turns the optimizer vector back into a validated `ParameterSet`.
//!
//! A fit that does not converge is not an error: the `FitResult` carries the status and
//! the best parameters found. Errors are reserved for structural problems such as a
//! warm-start parameter set belonging to a different item set.

use crate::config::{OptimizerConfig, PriorConfig};
use crate::model::{FitData, ModelError, OrdinalModel, ParameterSet, center_in_place};
use crate::optimize::{ConvergenceStatus, minimize};
use ndarray::{Array1, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bound on the cold-start thresholds, in logits.
const INITIAL_THRESHOLD_BOUND: f64 = 5.0;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Training data contains no persons.")]
    EmptyTrainingData,
    #[error("Training data contains no responses.")]
    NoResponses,
    #[error(
        "Warm-start parameters were fitted for item set {found}, but the training data uses item set {expected}."
    )]
    ItemSetMismatch { expected: String, found: String },
    #[error("Warm-start parameters cover {found} items, but the training data has {expected}.")]
    ItemCountMismatch { expected: usize, found: usize },
    #[error("An invalid parameter set was produced: {0}")]
    Parameter(#[from] ModelError),
}

/// Per-fit execution limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitControl {
    pub deadline: Option<Instant>,
}

impl FitControl {
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    pub iterations: usize,
    pub evaluations: usize,
    /// Negative log-posterior at the returned parameters.
    pub objective: f64,
    pub gradient_norm: f64,
    pub sum_to_zero_error: f64,
    pub elapsed_secs: f64,
    pub warm_start: bool,
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub params: ParameterSet,
    pub status: ConvergenceStatus,
    pub diagnostics: FitDiagnostics,
}

/// Fits the model to `data`, optionally warm-starting from `init`.
pub fn fit(
    data: &FitData,
    init: Option<&ParameterSet>,
    priors: &PriorConfig,
    optimizer: &OptimizerConfig,
    control: &FitControl,
) -> Result<FitResult, EstimationError> {
    if data.n_persons() == 0 {
        return Err(EstimationError::EmptyTrainingData);
    }
    if data.responses.is_empty() {
        return Err(EstimationError::NoResponses);
    }
    let start_time = Instant::now();
    let x0 = match init {
        Some(params) => warm_start_vector(data, params)?,
        None => cold_start_vector(data, optimizer),
    };
    let start_params = ParameterSet::from_vector(
        &data.layout(),
        x0.view(),
        data.person_ids.clone(),
        data.item_set_hash.clone(),
    )?;

    let model = OrdinalModel::new(data, priors);
    let outcome = minimize(
        x0,
        |x: &Array1<f64>| model.value_and_gradient(x.view()),
        optimizer,
        control.deadline,
    );

    let (params, status) = match ParameterSet::from_vector(
        &data.layout(),
        outcome.x.view(),
        data.person_ids.clone(),
        data.item_set_hash.clone(),
    ) {
        Ok(params) => (params, outcome.status),
        Err(e) => (
            start_params,
            ConvergenceStatus::NumericalFailure(format!("optimizer produced invalid parameters: {e}")),
        ),
    };

    let diagnostics = FitDiagnostics {
        iterations: outcome.iterations,
        evaluations: outcome.evaluations,
        objective: outcome.value,
        gradient_norm: outcome.gradient_norm,
        sum_to_zero_error: params.sum_to_zero_error(),
        elapsed_secs: start_time.elapsed().as_secs_f64(),
        warm_start: init.is_some(),
    };
    log::debug!(
        "Fit over {} persons finished after {} iterations: {} (objective {:.6}, |grad| {:.3e}).",
        data.n_persons(),
        diagnostics.iterations,
        status,
        diagnostics.objective,
        diagnostics.gradient_norm
    );
    Ok(FitResult {
        params,
        status,
        diagnostics,
    })
}

/// Starting point without prior information: thresholds from the marginal share of the
/// lowest category, unit spacing, zero slopes, and seeded jitter on the person effects.
pub fn cold_start_vector(data: &FitData, optimizer: &OptimizerConfig) -> Array1<f64> {
    let layout = data.layout();
    let mut x = Array1::zeros(layout.len());

    let mut lowest = vec![0usize; data.n_items()];
    let mut answered = vec![0usize; data.n_items()];
    for r in &data.responses {
        answered[r.item.get()] += 1;
        if r.category == 0 {
            lowest[r.item.get()] += 1;
        }
    }
    for j in layout.thresholds() {
        let share = (lowest[j] as f64 + 0.5) / (answered[j] as f64 + 1.0);
        x[j] = (share / (1.0 - share))
            .ln()
            .clamp(-INITIAL_THRESHOLD_BOUND, INITIAL_THRESHOLD_BOUND);
    }
    x[layout.log_spacing()] = 0.0;

    let mut rng = StdRng::seed_from_u64(optimizer.seed);
    let jitter = optimizer.init_jitter.abs();
    let mut effects = Array1::from_shape_fn(layout.n_persons, |_| {
        if jitter > 0.0 {
            rng.gen_range(-jitter..jitter)
        } else {
            0.0
        }
    });
    center_in_place(&mut effects);
    x.slice_mut(s![layout.person_effects()]).assign(&effects);
    x
}

/// Starting point copied from a previous fit. Person effects are matched by id; persons
/// absent from `data` are dropped, new persons start at zero, and the block is
/// re-centered so the sum-to-zero constraint holds before the first iteration.
pub fn warm_start_vector(data: &FitData, init: &ParameterSet) -> Result<Array1<f64>, EstimationError> {
    if init.item_set_hash != data.item_set_hash {
        return Err(EstimationError::ItemSetMismatch {
            expected: data.item_set_hash.clone(),
            found: init.item_set_hash.clone(),
        });
    }
    if init.n_items() != data.n_items() {
        return Err(EstimationError::ItemCountMismatch {
            expected: data.n_items(),
            found: init.n_items(),
        });
    }
    let layout = data.layout();
    let mut x = Array1::zeros(layout.len());
    x.slice_mut(s![layout.thresholds()]).assign(&init.thresholds);
    x[layout.log_spacing()] = init.spacing.ln();
    x.slice_mut(s![layout.slopes()]).assign(&init.slopes);

    let previous: HashMap<&str, f64> = init
        .person_ids
        .iter()
        .map(String::as_str)
        .zip(init.person_effects.iter().copied())
        .collect();
    let mut effects = Array1::from_shape_fn(layout.n_persons, |i| {
        previous
            .get(data.person_ids[i].as_str())
            .copied()
            .unwrap_or(0.0)
    });
    center_in_place(&mut effects);
    x.slice_mut(s![layout.person_effects()]).assign(&effects);
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::Criterion;
    use crate::types::{ItemIndex, PersonIndex, Response};

    fn toy_data() -> FitData {
        let answers = [[0u8, 1, 0], [1, 1, 1], [0, 0, 2], [1, 0, 1], [0, 1, 0]];
        let mut responses = Vec::new();
        let mut person_offsets = vec![0];
        for (i, row) in answers.iter().enumerate() {
            for (j, &category) in row.iter().enumerate() {
                responses.push(Response {
                    person: PersonIndex::new(i),
                    item: ItemIndex::new(j),
                    category,
                });
            }
            person_offsets.push(responses.len());
        }
        FitData {
            categories: vec![2, 2, 3],
            person_ids: (1..=5).map(|i| format!("p{i}")).collect(),
            covariate: vec![-1.2649, -0.6325, 0.0, 0.6325, 1.2649],
            responses,
            person_offsets,
            item_set_hash: "toy".to_string(),
        }
    }

    #[test]
    fn toy_fit_converges_with_centered_effects() {
        let data = toy_data();
        let result = fit(
            &data,
            None,
            &PriorConfig::default(),
            &OptimizerConfig::default(),
            &FitControl::default(),
        )
        .unwrap();
        assert!(result.status.is_converged(), "status: {}", result.status);
        assert!(result.params.sum_to_zero_error() < 1e-6);
        assert!(result.params.spacing > 0.0);
        assert_eq!(result.params.person_ids, data.person_ids);
    }

    #[test]
    fn dense_backend_agrees_with_lbfgs_on_toy_data() {
        let data = toy_data();
        let priors = PriorConfig::default();
        let lbfgs = fit(&data, None, &priors, &OptimizerConfig::default(), &FitControl::default()).unwrap();
        let dense_config = OptimizerConfig {
            backend: crate::config::OptimizerBackend::DenseBfgs,
            tol_grad: 1e-6,
            ..OptimizerConfig::default()
        };
        let dense = fit(&data, None, &priors, &dense_config, &FitControl::default()).unwrap();
        if dense.status.is_converged() {
            assert!(
                (lbfgs.diagnostics.objective - dense.diagnostics.objective).abs() < 1e-4,
                "objectives differ: {} vs {}",
                lbfgs.diagnostics.objective,
                dense.diagnostics.objective
            );
        }
    }

    #[test]
    fn warm_start_drops_held_out_person_and_recenters() {
        let data = toy_data();
        let full = fit(
            &data,
            None,
            &PriorConfig::default(),
            &OptimizerConfig::default(),
            &FitControl::default(),
        )
        .unwrap();
        let fold = data.without_person(PersonIndex::new(2));
        let x = warm_start_vector(&fold, &full.params).unwrap();
        let layout = fold.layout();
        let effects = x.slice(s![layout.person_effects()]);
        assert_eq!(effects.len(), 4);
        assert!(effects.sum().abs() < 1e-12);
        let shift = full.params.person_effects[2] / 4.0;
        assert!((effects[0] - (full.params.person_effects[0] + shift)).abs() < 1e-12);
    }

    #[test]
    fn warm_start_rejects_foreign_item_set() {
        let data = toy_data();
        let mut other = data.clone();
        other.item_set_hash = "other".to_string();
        let full = fit(
            &other,
            None,
            &PriorConfig::default(),
            &OptimizerConfig::default(),
            &FitControl::default(),
        )
        .unwrap();
        assert!(matches!(
            warm_start_vector(&data, &full.params),
            Err(EstimationError::ItemSetMismatch { .. })
        ));
    }

    #[test]
    fn warm_started_refit_needs_fewer_iterations() {
        let data = toy_data();
        let priors = PriorConfig::default();
        let optimizer = OptimizerConfig::default();
        let cold = fit(&data, None, &priors, &optimizer, &FitControl::default()).unwrap();
        let warm = fit(&data, Some(&cold.params), &priors, &optimizer, &FitControl::default()).unwrap();
        assert!(warm.status.is_converged());
        assert!(warm.diagnostics.iterations <= cold.diagnostics.iterations);
        assert!(warm.params.max_abs_difference(&cold.params) < 1e-3);
    }

    #[test]
    fn cold_start_is_reproducible_for_a_seed() {
        let data = toy_data();
        let optimizer = OptimizerConfig::default();
        assert_eq!(cold_start_vector(&data, &optimizer), cold_start_vector(&data, &optimizer));
        let other_seed = OptimizerConfig {
            seed: 7,
            ..OptimizerConfig::default()
        };
        assert_ne!(cold_start_vector(&data, &optimizer), cold_start_vector(&data, &other_seed));
    }

    #[test]
    fn iteration_cap_is_a_status_not_an_error() {
        let data = toy_data();
        let optimizer = OptimizerConfig {
            max_iterations: 1,
            ..OptimizerConfig::default()
        };
        let result = fit(&data, None, &PriorConfig::default(), &optimizer, &FitControl::default()).unwrap();
        assert!(matches!(
            result.status,
            ConvergenceStatus::MaxIterations | ConvergenceStatus::Converged(Criterion::Gradient)
        ));
        assert!(result.params.sum_to_zero_error() < 1e-9);
    }
}
