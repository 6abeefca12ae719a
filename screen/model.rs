//! # Ordinal Mixed-Model Specification
//!
//! Cumulative-logit graded response model for person `i` and item `j`:
//!
//! ```text
//! mu_ij        = eta_i + beta_j * x_i
//! theta_jk     = tau_j + k * delta                 k = 0 .. K_j - 2
//! P(Y <= k)    = logistic(theta_jk - mu_ij)
//! ```
//!
//! The spacing `delta` is shared by every item. Person effects carry no free variance;
//! they are standard normal a priori and identified by the constraint `sum(eta) = 0`.
//! Every category probability is floored at `PROBABILITY_FLOOR` before a logarithm is
//! taken, and a floored probability contributes no gradient.
//!
//! The optimizer works on the unconstrained vector `[tau | log delta | beta | eta]`.
//! The prior on `delta` is evaluated on the natural scale (no change-of-variables term),
//! which keeps the objective a MAP criterion for `delta` itself.

use crate::config::PriorConfig;
use crate::types::{PersonIndex, Population, Response};
use crate::vectorize::ResponseSet;
use ndarray::{Array1, ArrayView1, s};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

/// Lower bound applied to every category probability before taking a logarithm.
pub const PROBABILITY_FLOOR: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Parameter vector '{name}' has length {found}, expected {expected}.")]
    LengthMismatch {
        name: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("Threshold spacing must be positive and finite, got {0}.")]
    InvalidSpacing(f64),
    #[error("Parameter set contains a non-finite value in '{0}'.")]
    NonFinite(&'static str),
    #[error("Failed to read or write parameter file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML parameter file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize parameters to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Fitted model state: item parameters plus one effect per training person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Per-item base threshold `tau_j`.
    pub thresholds: Array1<f64>,
    /// Global threshold spacing `delta > 0`.
    pub spacing: f64,
    /// Per-item covariate slope `beta1_j`.
    pub slopes: Array1<f64>,
    /// Ids of the persons whose effects are stored, aligned with `person_effects`.
    pub person_ids: Vec<String>,
    /// Person effects `eta_i`, summing to zero.
    pub person_effects: Array1<f64>,
    /// Item set these parameters were fitted for.
    pub item_set_hash: String,
}

impl ParameterSet {
    pub fn new(
        thresholds: Array1<f64>,
        spacing: f64,
        slopes: Array1<f64>,
        person_ids: Vec<String>,
        person_effects: Array1<f64>,
        item_set_hash: String,
    ) -> Result<Self, ModelError> {
        if slopes.len() != thresholds.len() {
            return Err(ModelError::LengthMismatch {
                name: "slopes",
                found: slopes.len(),
                expected: thresholds.len(),
            });
        }
        if person_effects.len() != person_ids.len() {
            return Err(ModelError::LengthMismatch {
                name: "person_effects",
                found: person_effects.len(),
                expected: person_ids.len(),
            });
        }
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(ModelError::InvalidSpacing(spacing));
        }
        if thresholds.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("thresholds"));
        }
        if slopes.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("slopes"));
        }
        if person_effects.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("person_effects"));
        }
        Ok(Self {
            thresholds,
            spacing,
            slopes,
            person_ids,
            person_effects,
            item_set_hash,
        })
    }

    /// Rebuilds a parameter set from an optimizer vector, re-centering the person block.
    pub fn from_vector(
        layout: &ParameterLayout,
        x: ArrayView1<f64>,
        person_ids: Vec<String>,
        item_set_hash: String,
    ) -> Result<Self, ModelError> {
        if x.len() != layout.len() {
            return Err(ModelError::LengthMismatch {
                name: "parameter vector",
                found: x.len(),
                expected: layout.len(),
            });
        }
        let mut person_effects = x.slice(s![layout.person_effects()]).to_owned();
        center_in_place(&mut person_effects);
        Self::new(
            x.slice(s![layout.thresholds()]).to_owned(),
            x[layout.log_spacing()].exp(),
            x.slice(s![layout.slopes()]).to_owned(),
            person_ids,
            person_effects,
            item_set_hash,
        )
    }

    pub fn to_vector(&self) -> Array1<f64> {
        let layout = self.layout();
        let mut x = Array1::zeros(layout.len());
        x.slice_mut(s![layout.thresholds()]).assign(&self.thresholds);
        x[layout.log_spacing()] = self.spacing.ln();
        x.slice_mut(s![layout.slopes()]).assign(&self.slopes);
        x.slice_mut(s![layout.person_effects()])
            .assign(&self.person_effects);
        x
    }

    pub fn layout(&self) -> ParameterLayout {
        ParameterLayout::new(self.n_items(), self.n_persons())
    }

    pub fn n_items(&self) -> usize {
        self.thresholds.len()
    }

    pub fn n_persons(&self) -> usize {
        self.person_effects.len()
    }

    pub fn person_effect(&self, id: &str) -> Option<f64> {
        self.person_ids
            .iter()
            .position(|p| p == id)
            .map(|i| self.person_effects[i])
    }

    /// `|sum(eta)|`, which must stay below 1e-6 for any fitted set.
    pub fn sum_to_zero_error(&self) -> f64 {
        self.person_effects.sum().abs()
    }

    /// Empirical dispersion of the person effects (sample standard deviation).
    pub fn person_effect_sd(&self) -> f64 {
        let n = self.person_effects.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.person_effects.sum() / n as f64;
        let ss: f64 = self.person_effects.iter().map(|e| (e - mean).powi(2)).sum();
        (ss / (n as f64 - 1.0)).sqrt()
    }

    /// Largest absolute difference against another set over the same items and persons.
    pub fn max_abs_difference(&self, other: &ParameterSet) -> f64 {
        if self.layout() != other.layout() || self.person_ids != other.person_ids {
            return f64::INFINITY;
        }
        let a = self.to_vector();
        let b = other.to_vector();
        a.iter()
            .zip(b.iter())
            .fold(0.0_f64, |acc, (x, y)| acc.max((x - y).abs()))
    }

    /// Stable digest of every stored value, used to key checkpoints.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.item_set_hash.as_bytes());
        for value in self.to_vector().iter() {
            hasher.update(value.to_bits().to_le_bytes());
        }
        for id in &self.person_ids {
            hasher.update((id.len() as u64).to_le_bytes());
            hasher.update(id.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let params: Self = toml::from_str(&toml_string)?;
        Self::new(
            params.thresholds,
            params.spacing,
            params.slopes,
            params.person_ids,
            params.person_effects,
            params.item_set_hash,
        )
    }
}

/// Positions of each parameter block inside the optimizer vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    pub n_items: usize,
    pub n_persons: usize,
}

impl ParameterLayout {
    pub fn new(n_items: usize, n_persons: usize) -> Self {
        Self { n_items, n_persons }
    }

    pub fn thresholds(&self) -> Range<usize> {
        0..self.n_items
    }

    pub fn log_spacing(&self) -> usize {
        self.n_items
    }

    pub fn slopes(&self) -> Range<usize> {
        self.n_items + 1..2 * self.n_items + 1
    }

    pub fn person_effects(&self) -> Range<usize> {
        2 * self.n_items + 1..self.len()
    }

    pub fn len(&self) -> usize {
        2 * self.n_items + 1 + self.n_persons
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The training view handed to the fitter: a subset of persons from a `ResponseSet`
/// with person indices renumbered to `0..n_persons`.
#[derive(Debug, Clone, PartialEq)]
pub struct FitData {
    pub categories: Vec<u8>,
    pub person_ids: Vec<String>,
    pub covariate: Vec<f64>,
    pub responses: Vec<Response>,
    pub person_offsets: Vec<usize>,
    pub item_set_hash: String,
}

impl FitData {
    /// Training data made of every person of one population.
    pub fn from_population(set: &ResponseSet, population: Population) -> Self {
        let mut data = Self {
            categories: set.items.iter().map(|item| item.categories).collect(),
            person_ids: Vec::new(),
            covariate: Vec::new(),
            responses: Vec::new(),
            person_offsets: vec![0],
            item_set_hash: set.item_set_hash.clone(),
        };
        for person in set.persons_in(population) {
            let record = &set.persons[person.get()];
            data.push_person(&record.id, record.covariate, set.responses_for(person));
        }
        data
    }

    /// Copy of this view with one person and all of their responses removed.
    pub fn without_person(&self, held_out: PersonIndex) -> Self {
        let mut data = Self {
            categories: self.categories.clone(),
            person_ids: Vec::with_capacity(self.n_persons().saturating_sub(1)),
            covariate: Vec::with_capacity(self.n_persons().saturating_sub(1)),
            responses: Vec::with_capacity(self.responses.len()),
            person_offsets: vec![0],
            item_set_hash: self.item_set_hash.clone(),
        };
        for i in 0..self.n_persons() {
            if i == held_out.get() {
                continue;
            }
            let person = PersonIndex::new(i);
            data.push_person(
                &self.person_ids[i],
                self.covariate[i],
                self.responses_for(person),
            );
        }
        data
    }

    fn push_person(&mut self, id: &str, covariate: f64, responses: &[Response]) {
        let local = PersonIndex::new(self.person_ids.len());
        self.person_ids.push(id.to_string());
        self.covariate.push(covariate);
        self.responses.extend(responses.iter().map(|r| Response {
            person: local,
            ..*r
        }));
        self.person_offsets.push(self.responses.len());
    }

    pub fn n_items(&self) -> usize {
        self.categories.len()
    }

    pub fn n_persons(&self) -> usize {
        self.person_ids.len()
    }

    pub fn responses_for(&self, person: PersonIndex) -> &[Response] {
        let i = person.get();
        &self.responses[self.person_offsets[i]..self.person_offsets[i + 1]]
    }

    pub fn person_index(&self, id: &str) -> Option<PersonIndex> {
        self.person_ids
            .iter()
            .position(|p| p == id)
            .map(PersonIndex::new)
    }

    pub fn layout(&self) -> ParameterLayout {
        ParameterLayout::new(self.n_items(), self.n_persons())
    }
}

#[inline]
pub fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Fills `out` with the floored probability of every category of an item.
pub fn category_probabilities(categories: u8, tau: f64, spacing: f64, mu: f64, out: &mut Vec<f64>) {
    out.clear();
    let k_max = categories as usize - 1;
    let mut previous_cdf = 0.0;
    for k in 0..k_max {
        let cdf = logistic(tau + k as f64 * spacing - mu);
        out.push((cdf - previous_cdf).max(PROBABILITY_FLOOR));
        previous_cdf = cdf;
    }
    let upper = logistic(-(tau + (k_max - 1) as f64 * spacing - mu));
    out.push(upper.max(PROBABILITY_FLOOR));
}

/// Log-probability of one observed category and its partial derivatives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseTerms {
    pub log_p: f64,
    /// d log p / d mu.
    pub d_mu: f64,
    /// d log p / d tau.
    pub d_tau: f64,
    /// d log p / d delta.
    pub d_spacing: f64,
}

pub fn response_terms(categories: u8, tau: f64, spacing: f64, mu: f64, category: u8) -> ResponseTerms {
    let last = categories - 1;
    let c = category as usize;
    let x = |k: usize| tau + k as f64 * spacing - mu;
    // d log p / d theta_k for the (at most two) thresholds bounding the category.
    let (p, upper, lower) = if category == 0 {
        let x0 = x(0);
        (logistic(x0), Some((0, logistic(-x0))), None)
    } else if category == last {
        let xl = x(c - 1);
        (logistic(-xl), None, Some((c - 1, -logistic(xl))))
    } else {
        let f_hi = logistic(x(c));
        let f_lo = logistic(x(c - 1));
        let p = f_hi - f_lo;
        if p > 0.0 {
            (
                p,
                Some((c, f_hi * (1.0 - f_hi) / p)),
                Some((c - 1, -f_lo * (1.0 - f_lo) / p)),
            )
        } else {
            (p, None, None)
        }
    };
    if !(p >= PROBABILITY_FLOOR) {
        return ResponseTerms {
            log_p: PROBABILITY_FLOOR.ln(),
            d_mu: 0.0,
            d_tau: 0.0,
            d_spacing: 0.0,
        };
    }
    let mut d_tau = 0.0;
    let mut d_spacing = 0.0;
    for (k, d_theta) in upper.into_iter().chain(lower) {
        d_tau += d_theta;
        d_spacing += k as f64 * d_theta;
    }
    ResponseTerms {
        log_p: p.ln(),
        d_mu: -d_tau,
        d_tau,
        d_spacing,
    }
}

/// The MAP objective (negative log-posterior) over a `FitData` view.
pub struct OrdinalModel<'a> {
    data: &'a FitData,
    priors: &'a PriorConfig,
    layout: ParameterLayout,
}

impl<'a> OrdinalModel<'a> {
    pub fn new(data: &'a FitData, priors: &'a PriorConfig) -> Self {
        Self {
            data,
            priors,
            layout: data.layout(),
        }
    }

    pub fn layout(&self) -> ParameterLayout {
        self.layout
    }

    pub fn data(&self) -> &FitData {
        self.data
    }

    /// Log-likelihood of every training response.
    pub fn log_likelihood(&self, x: ArrayView1<f64>) -> f64 {
        let spacing = x[self.layout.log_spacing()].exp();
        let eta = self.layout.person_effects().start;
        let beta = self.layout.slopes().start;
        self.data
            .responses
            .iter()
            .map(|r| {
                let i = r.person.get();
                let j = r.item.get();
                let mu = x[eta + i] + x[beta + j] * self.data.covariate[i];
                response_terms(self.data.categories[j], x[j], spacing, mu, r.category).log_p
            })
            .sum()
    }

    pub fn neg_log_prior(&self, x: ArrayView1<f64>) -> f64 {
        self.prior_terms(x, None)
    }

    pub fn value(&self, x: ArrayView1<f64>) -> f64 {
        -self.log_likelihood(x) + self.neg_log_prior(x)
    }

    /// Objective and gradient. The person block of the gradient is projected onto the
    /// zero-sum subspace so that every optimizer step preserves `sum(eta) = 0`.
    pub fn value_and_gradient(&self, x: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let layout = self.layout;
        let mut grad = Array1::zeros(layout.len());
        let spacing = x[layout.log_spacing()].exp();
        let eta = layout.person_effects().start;
        let beta = layout.slopes().start;
        let mut log_lik = 0.0;
        let mut d_spacing = 0.0;
        for r in &self.data.responses {
            let i = r.person.get();
            let j = r.item.get();
            let covariate = self.data.covariate[i];
            let mu = x[eta + i] + x[beta + j] * covariate;
            let terms = response_terms(self.data.categories[j], x[j], spacing, mu, r.category);
            log_lik += terms.log_p;
            grad[j] -= terms.d_tau;
            grad[beta + j] -= terms.d_mu * covariate;
            grad[eta + i] -= terms.d_mu;
            d_spacing += terms.d_spacing;
        }
        grad[layout.log_spacing()] -= d_spacing * spacing;
        let prior = self.prior_terms(x, Some(&mut grad));
        project_zero_sum(&mut grad, layout.person_effects());
        (-log_lik + prior, grad)
    }

    fn prior_terms(&self, x: ArrayView1<f64>, mut grad: Option<&mut Array1<f64>>) -> f64 {
        let layout = self.layout;
        let p = self.priors;
        let mut value = 0.0;

        let tau_var = p.threshold_sd * p.threshold_sd;
        for j in layout.thresholds() {
            value += 0.5 * x[j] * x[j] / tau_var;
            if let Some(g) = grad.as_deref_mut() {
                g[j] += x[j] / tau_var;
            }
        }

        let beta_var = p.slope_sd * p.slope_sd;
        for j in layout.slopes() {
            value += 0.5 * x[j] * x[j] / beta_var;
            if let Some(g) = grad.as_deref_mut() {
                g[j] += x[j] / beta_var;
            }
        }

        // Half-Student-t on delta, restricted to delta > 0 by the log parameterization.
        let spacing = x[layout.log_spacing()].exp();
        let z = (spacing - p.spacing_location) / p.spacing_scale;
        let nu = p.spacing_df;
        value += 0.5 * (nu + 1.0) * (1.0 + z * z / nu).ln();
        if let Some(g) = grad.as_deref_mut() {
            let d_delta = (nu + 1.0) * z / (p.spacing_scale * nu * (1.0 + z * z / nu));
            g[layout.log_spacing()] += d_delta * spacing;
        }

        for i in layout.person_effects() {
            value += 0.5 * x[i] * x[i];
            if let Some(g) = grad.as_deref_mut() {
                g[i] += x[i];
            }
        }
        value
    }
}

/// Subtracts the block mean so the block sums to zero.
pub fn project_zero_sum(values: &mut Array1<f64>, block: Range<usize>) {
    if block.is_empty() {
        return;
    }
    let mut view = values.slice_mut(s![block]);
    let mean = view.sum() / view.len() as f64;
    view.mapv_inplace(|v| v - mean);
}

pub fn center_in_place(values: &mut Array1<f64>) {
    let len = values.len();
    project_zero_sum(values, 0..len);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemIndex;
    use approx::assert_abs_diff_eq;

    fn toy_data() -> FitData {
        let categories = vec![2, 2, 3];
        let answers = [[0u8, 1, 0], [1, 1, 1], [0, 0, 2], [1, 0, 1], [0, 1, 0]];
        let mut data = FitData {
            categories,
            person_ids: Vec::new(),
            covariate: Vec::new(),
            responses: Vec::new(),
            person_offsets: vec![0],
            item_set_hash: "toy".to_string(),
        };
        for (i, row) in answers.iter().enumerate() {
            let responses: Vec<Response> = row
                .iter()
                .enumerate()
                .map(|(j, &c)| Response {
                    person: PersonIndex::new(0),
                    item: ItemIndex::new(j),
                    category: c,
                })
                .collect();
            data.push_person(&format!("p{}", i + 1), (i as f64 - 2.0) / 1.58, &responses);
        }
        data
    }

    #[test]
    fn category_probabilities_sum_to_one() {
        let mut probs = Vec::new();
        for &(k, tau, spacing, mu) in &[(2u8, 0.3, 1.0, -0.2), (5, -1.0, 0.7, 0.4), (3, 0.0, 2.0, 3.0)] {
            category_probabilities(k, tau, spacing, mu, &mut probs);
            assert_eq!(probs.len(), k as usize);
            assert_abs_diff_eq!(probs.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
            assert!(probs.iter().all(|&p| p >= PROBABILITY_FLOOR));
        }
    }

    #[test]
    fn extreme_predictor_is_floored_not_zero() {
        let mut probs = Vec::new();
        category_probabilities(3, 0.0, 1.0, 80.0, &mut probs);
        assert_eq!(probs[0], PROBABILITY_FLOOR);
        let terms = response_terms(3, 0.0, 1.0, 80.0, 0);
        assert_eq!(terms.log_p, PROBABILITY_FLOOR.ln());
        assert_eq!(terms.d_mu, 0.0);
    }

    #[test]
    fn response_terms_match_probabilities() {
        let mut probs = Vec::new();
        category_probabilities(4, -0.5, 0.8, 0.3, &mut probs);
        for c in 0..4u8 {
            let terms = response_terms(4, -0.5, 0.8, 0.3, c);
            assert_abs_diff_eq!(terms.log_p, probs[c as usize].ln(), epsilon = 1e-12);
        }
    }

    #[test]
    fn analytic_gradient_matches_finite_differences() {
        let data = toy_data();
        let priors = PriorConfig::default();
        let model = OrdinalModel::new(&data, &priors);
        let layout = model.layout();
        let mut x = Array1::from_shape_fn(layout.len(), |i| 0.1 * ((i * 7 % 5) as f64 - 2.0));
        project_zero_sum(&mut x, layout.person_effects());
        let (_, grad) = model.value_and_gradient(x.view());

        let h = 1e-6;
        let mut numeric = Array1::zeros(layout.len());
        for i in 0..layout.len() {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[i] += h;
            minus[i] -= h;
            numeric[i] = (model.value(plus.view()) - model.value(minus.view())) / (2.0 * h);
        }
        project_zero_sum(&mut numeric, layout.person_effects());
        for i in 0..layout.len() {
            assert!(
                (grad[i] - numeric[i]).abs() < 1e-5,
                "gradient mismatch at {i}: analytic {} vs numeric {}",
                grad[i],
                numeric[i]
            );
        }
    }

    #[test]
    fn projected_gradient_sums_to_zero_over_persons() {
        let data = toy_data();
        let priors = PriorConfig::default();
        let model = OrdinalModel::new(&data, &priors);
        let x = Array1::from_elem(model.layout().len(), 0.2);
        let (_, grad) = model.value_and_gradient(x.view());
        let block = grad.slice(s![model.layout().person_effects()]);
        assert_abs_diff_eq!(block.sum(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn without_person_drops_every_response_of_that_person() {
        let data = toy_data();
        let fold = data.without_person(PersonIndex::new(2));
        assert_eq!(fold.n_persons(), 4);
        assert!(fold.person_index("p3").is_none());
        assert_eq!(fold.responses.len(), 12);
        assert!(fold.responses.iter().all(|r| r.person.get() < 4));
        let shifted: Vec<(usize, u8)> = fold
            .responses_for(PersonIndex::new(2))
            .iter()
            .map(|r| (r.item.get(), r.category))
            .collect();
        let original: Vec<(usize, u8)> = data
            .responses_for(PersonIndex::new(3))
            .iter()
            .map(|r| (r.item.get(), r.category))
            .collect();
        assert_eq!(shifted, original);
    }

    #[test]
    fn parameter_set_rejects_bad_spacing_and_lengths() {
        let ok = ParameterSet::new(
            Array1::zeros(2),
            1.0,
            Array1::zeros(2),
            vec!["a".into()],
            Array1::zeros(1),
            String::new(),
        );
        assert!(ok.is_ok());
        assert!(matches!(
            ParameterSet::new(
                Array1::zeros(2),
                0.0,
                Array1::zeros(2),
                vec![],
                Array1::zeros(0),
                String::new()
            ),
            Err(ModelError::InvalidSpacing(_))
        ));
        assert!(matches!(
            ParameterSet::new(
                Array1::zeros(2),
                1.0,
                Array1::zeros(3),
                vec![],
                Array1::zeros(0),
                String::new()
            ),
            Err(ModelError::LengthMismatch { name: "slopes", .. })
        ));
    }

    #[test]
    fn vector_round_trip_recenters_person_effects() {
        let layout = ParameterLayout::new(2, 3);
        let x = Array1::from_vec(vec![0.1, -0.2, 0.5_f64.ln(), 0.3, 0.4, 1.0, 2.0, 3.0]);
        let params = ParameterSet::from_vector(
            &layout,
            x.view(),
            vec!["a".into(), "b".into(), "c".into()],
            "h".into(),
        )
        .unwrap();
        assert_abs_diff_eq!(params.spacing, 0.5, epsilon = 1e-12);
        assert!(params.sum_to_zero_error() < 1e-12);
        assert_abs_diff_eq!(params.person_effect("a").unwrap(), -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(params.person_effect_sd(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn toml_round_trip_preserves_parameters() {
        let params = ParameterSet::new(
            Array1::from_vec(vec![0.25, -1.5]),
            0.8,
            Array1::from_vec(vec![0.1, 0.2]),
            vec!["x".into(), "y".into()],
            Array1::from_vec(vec![0.5, -0.5]),
            "abc".into(),
        )
        .unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        params.save(file.path()).unwrap();
        let loaded = ParameterSet::load(file.path()).unwrap();
        assert_eq!(loaded, params);
        assert_eq!(loaded.fingerprint(), params.fingerprint());
    }
}
