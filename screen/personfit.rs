//! # Person-Fit Calculator
//!
//! Standardized log-likelihood person-fit (`lz`) and its unstandardized companion
//! `avg_logpost`, computed from one person's answered items against a fixed set of
//! item parameters.

use crate::model::{ParameterSet, category_probabilities, response_terms};
use crate::types::Response;
use serde::{Deserialize, Serialize};

/// Floor on the summed variance so `lz` stays finite for near-deterministic items.
pub const VARIANCE_FLOOR: f64 = 1e-12;

/// Person effects are searched inside this interval.
const EFFECT_BOUND: f64 = 8.0;
const BISECTION_STEPS: usize = 100;
const BISECTION_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitStatistic {
    pub observed_loglik: f64,
    pub expected_loglik: f64,
    pub expected_variance: f64,
    pub lz: f64,
    pub avg_logpost: f64,
    pub n_items: usize,
    /// Person effect the statistic was evaluated at.
    pub person_effect: f64,
}

/// Computes the person-fit statistic of `responses` at the given person effect.
///
/// `categories` holds the category count of every item, indexed like the item
/// parameters of `params`. An empty response slice yields `n_items = 0` with `lz` and
/// `avg_logpost` undefined (NaN); callers only score persons with answered items.
pub fn person_fit(
    responses: &[Response],
    covariate: f64,
    person_effect: f64,
    categories: &[u8],
    params: &ParameterSet,
) -> FitStatistic {
    let mut observed = 0.0;
    let mut expected = 0.0;
    let mut variance = 0.0;
    let mut probs = Vec::new();
    for r in responses {
        let j = r.item.get();
        let mu = person_effect + params.slopes[j] * covariate;
        category_probabilities(categories[j], params.thresholds[j], params.spacing, mu, &mut probs);

        let log_probs: Vec<f64> = probs.iter().map(|p| p.ln()).collect();
        let e: f64 = probs.iter().zip(&log_probs).map(|(p, lp)| p * lp).sum();
        let e2: f64 = probs.iter().zip(&log_probs).map(|(p, lp)| p * lp * lp).sum();

        observed += log_probs[r.category as usize];
        expected += e;
        variance += (e2 - e * e).max(0.0);
    }

    let n_items = responses.len();
    let (lz, avg_logpost) = if n_items == 0 {
        (f64::NAN, f64::NAN)
    } else {
        (
            (observed - expected) / variance.max(VARIANCE_FLOOR).sqrt(),
            observed / n_items as f64,
        )
    };
    FitStatistic {
        observed_loglik: observed,
        expected_loglik: expected,
        expected_variance: variance,
        lz,
        avg_logpost,
        n_items,
        person_effect,
    }
}

/// Log-likelihood of `responses` at the given person effect.
pub fn response_loglik(
    responses: &[Response],
    covariate: f64,
    person_effect: f64,
    categories: &[u8],
    params: &ParameterSet,
) -> f64 {
    responses
        .iter()
        .map(|r| {
            let j = r.item.get();
            let mu = person_effect + params.slopes[j] * covariate;
            response_terms(categories[j], params.thresholds[j], params.spacing, mu, r.category).log_p
        })
        .sum()
}

/// MAP person effect with the item parameters held fixed and a standard normal prior.
///
/// The log-posterior is concave in the effect, so the root of its derivative is found
/// by bisection. Effects whose optimum lies outside `[-8, 8]` are clamped to the bound.
pub fn estimate_person_effect(
    responses: &[Response],
    covariate: f64,
    categories: &[u8],
    params: &ParameterSet,
) -> f64 {
    let slope = |eta: f64| -> f64 {
        let score: f64 = responses
            .iter()
            .map(|r| {
                let j = r.item.get();
                let mu = eta + params.slopes[j] * covariate;
                response_terms(categories[j], params.thresholds[j], params.spacing, mu, r.category).d_mu
            })
            .sum();
        score - eta
    };

    let (mut lo, mut hi) = (-EFFECT_BOUND, EFFECT_BOUND);
    if slope(lo) <= 0.0 {
        return lo;
    }
    if slope(hi) >= 0.0 {
        return hi;
    }
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if slope(mid) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < BISECTION_TOLERANCE {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Estimates the person effect and evaluates the person-fit statistic there.
pub fn score_person(
    responses: &[Response],
    covariate: f64,
    categories: &[u8],
    params: &ParameterSet,
) -> FitStatistic {
    let eta = estimate_person_effect(responses, covariate, categories, params);
    person_fit(responses, covariate, eta, categories, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemIndex, PersonIndex};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn params() -> ParameterSet {
        ParameterSet::new(
            array![-2.0, 0.0, 2.0],
            1.2,
            array![0.0, 0.2, -0.1],
            vec!["a".to_string(), "b".to_string()],
            array![0.25, -0.25],
            "items".to_string(),
        )
        .unwrap()
    }

    fn answers(categories: &[u8]) -> Vec<Response> {
        categories
            .iter()
            .enumerate()
            .map(|(j, &category)| Response {
                person: PersonIndex::new(0),
                item: ItemIndex::new(j),
                category,
            })
            .collect()
    }

    const CATEGORIES: [u8; 3] = [2, 2, 3];

    #[test]
    fn statistic_is_consistent_with_its_parts() {
        let p = params();
        let responses = answers(&[0, 1, 2]);
        let stat = person_fit(&responses, 0.5, 0.1, &CATEGORIES, &p);
        assert_eq!(stat.n_items, 3);
        assert_abs_diff_eq!(
            stat.lz,
            (stat.observed_loglik - stat.expected_loglik) / stat.expected_variance.sqrt(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(stat.avg_logpost, stat.observed_loglik / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            stat.observed_loglik,
            response_loglik(&responses, 0.5, 0.1, &CATEGORIES, &p),
            epsilon = 1e-12
        );
        assert!(stat.expected_variance > 0.0);
    }

    #[test]
    fn expected_loglik_is_entropy_of_binary_item() {
        let p = ParameterSet::new(
            array![0.0],
            1.0,
            array![0.0],
            Vec::new(),
            ndarray::Array1::zeros(0),
            "items".to_string(),
        )
        .unwrap();
        let stat = person_fit(&answers(&[1]), 0.0, 0.0, &[2], &p);
        assert_abs_diff_eq!(stat.expected_loglik, 0.5f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(stat.expected_variance, 0.0, epsilon = 1e-12);
        assert!(stat.lz.is_finite());
    }

    #[test]
    fn improbable_answers_have_lower_lz() {
        let p = params();
        let typical = score_person(&answers(&[1, 1, 0]), 0.0, &CATEGORIES, &p);
        let mixed = score_person(&answers(&[0, 0, 2]), 0.0, &CATEGORIES, &p);
        assert!(mixed.lz < typical.lz, "{} vs {}", mixed.lz, typical.lz);
    }

    #[test]
    fn estimated_effect_zeroes_the_posterior_slope() {
        let p = params();
        let responses = answers(&[1, 0, 1]);
        let eta = estimate_person_effect(&responses, 0.3, &CATEGORIES, &p);
        let h = 1e-5;
        let logpost = |e: f64| response_loglik(&responses, 0.3, e, &CATEGORIES, &p) - 0.5 * e * e;
        assert!(logpost(eta) >= logpost(eta + h));
        assert!(logpost(eta) >= logpost(eta - h));
    }

    #[test]
    fn high_categories_imply_positive_effect() {
        let p = params();
        let high = estimate_person_effect(&answers(&[1, 1, 2]), 0.0, &CATEGORIES, &p);
        let low = estimate_person_effect(&answers(&[0, 0, 0]), 0.0, &CATEGORIES, &p);
        assert!(high > 0.0);
        assert!(low < 0.0);
        assert!(high.abs() < EFFECT_BOUND);
    }

    #[test]
    fn no_answers_leave_statistic_undefined() {
        let stat = person_fit(&[], 0.0, 0.0, &CATEGORIES, &params());
        assert_eq!(stat.n_items, 0);
        assert!(stat.lz.is_nan());
        assert!(stat.avg_logpost.is_nan());
    }
}
