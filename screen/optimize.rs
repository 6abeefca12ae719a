//! # Quasi-Newton Minimizers
//!
//! Two line-search minimizers for smooth objectives supplied as a closure returning
//! `(value, gradient)`:
//!
//! - **L-BFGS** (default): two-loop recursion over the last `history_size` correction
//!   pairs with a strong Wolfe line search. Memory is linear in the parameter count,
//!   which matters because the person block grows with the reference population.
//! - **Dense BFGS**: delegated to `wolfe_bfgs`, kept for small problems and as a
//!   cross-check of the limited-memory path.
//!
//! Neither minimizer panics or errors on non-convergence. The outcome always carries a
//! `ConvergenceStatus` that callers are expected to inspect.

use crate::config::{OptimizerBackend, OptimizerConfig};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Sufficient-decrease constant of the Wolfe conditions.
const WOLFE_C1: f64 = 1e-4;
/// Curvature constant of the Wolfe conditions.
const WOLFE_C2: f64 = 0.9;
const MAX_BRACKET_STEPS: usize = 25;
const MAX_ZOOM_STEPS: usize = 40;
const MAX_STEP: f64 = 1e10;
/// Value handed to `wolfe_bfgs` in place of a non-finite objective.
const DENSE_PENALTY_VALUE: f64 = 1e10;

/// The tolerance that ended a successful minimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    AbsoluteObjective,
    RelativeObjective,
    Gradient,
    RelativeGradient,
    Parameter,
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::AbsoluteObjective => "absolute objective change",
            Self::RelativeObjective => "relative objective change",
            Self::Gradient => "gradient norm",
            Self::RelativeGradient => "relative gradient magnitude",
            Self::Parameter => "parameter change",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Converged(Criterion),
    MaxIterations,
    NumericalFailure(String),
    TimedOut,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged(_))
    }
}

impl fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged(criterion) => write!(f, "converged ({criterion})"),
            Self::MaxIterations => f.write_str("maximum iterations reached"),
            Self::NumericalFailure(reason) => write!(f, "numerical failure: {reason}"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerOutcome {
    pub x: Array1<f64>,
    pub value: f64,
    /// Largest absolute gradient component at `x`.
    pub gradient_norm: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub status: ConvergenceStatus,
}

/// Minimizes `objective` from `x0` with the configured backend.
pub fn minimize<F>(
    x0: Array1<f64>,
    objective: F,
    config: &OptimizerConfig,
    deadline: Option<Instant>,
) -> OptimizerOutcome
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    match config.backend {
        OptimizerBackend::Lbfgs => Lbfgs::new(config, deadline).run(x0, objective),
        OptimizerBackend::DenseBfgs => minimize_dense(x0, objective, config, deadline),
    }
}

fn inf_norm(v: &Array1<f64>) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

fn all_finite(v: &Array1<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// A point accepted by the line search.
struct Step {
    alpha: f64,
    x: Array1<f64>,
    value: f64,
    grad: Array1<f64>,
}

struct Correction {
    s: Array1<f64>,
    y: Array1<f64>,
    rho: f64,
}

struct Lbfgs<'a> {
    config: &'a OptimizerConfig,
    deadline: Option<Instant>,
    history: VecDeque<Correction>,
    evaluations: usize,
}

impl<'a> Lbfgs<'a> {
    fn new(config: &'a OptimizerConfig, deadline: Option<Instant>) -> Self {
        Self {
            config,
            deadline,
            history: VecDeque::with_capacity(config.history_size),
            evaluations: 0,
        }
    }

    fn eval<F>(&mut self, objective: &F, x: &Array1<f64>) -> (f64, Array1<f64>)
    where
        F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
    {
        self.evaluations += 1;
        let (value, grad) = objective(x);
        if value.is_finite() && all_finite(&grad) {
            (value, grad)
        } else {
            (f64::INFINITY, grad)
        }
    }

    /// Two-loop recursion: returns `H g` for the current inverse-Hessian approximation.
    fn apply_inverse_hessian(&self, g: &Array1<f64>) -> Array1<f64> {
        let mut q = g.clone();
        let mut alphas = Vec::with_capacity(self.history.len());
        for c in self.history.iter().rev() {
            let a = c.rho * c.s.dot(&q);
            q.scaled_add(-a, &c.y);
            alphas.push(a);
        }
        if let Some(last) = self.history.back() {
            let gamma = last.s.dot(&last.y) / last.y.dot(&last.y);
            q *= gamma;
        }
        for (c, a) in self.history.iter().zip(alphas.iter().rev()) {
            let b = c.rho * c.y.dot(&q);
            q.scaled_add(a - b, &c.s);
        }
        q
    }

    fn outcome(
        &self,
        x: Array1<f64>,
        value: f64,
        grad: &Array1<f64>,
        iterations: usize,
        status: ConvergenceStatus,
    ) -> OptimizerOutcome {
        OptimizerOutcome {
            x,
            value,
            gradient_norm: inf_norm(grad),
            iterations,
            evaluations: self.evaluations,
            status,
        }
    }

    fn run<F>(mut self, x0: Array1<f64>, objective: F) -> OptimizerOutcome
    where
        F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
    {
        let mut x = x0;
        let (mut value, mut grad) = self.eval(&objective, &x);
        if !value.is_finite() {
            return self.outcome(
                x,
                value,
                &grad,
                0,
                ConvergenceStatus::NumericalFailure(
                    "objective is not finite at the starting point".to_string(),
                ),
            );
        }
        if inf_norm(&grad) < self.config.tol_grad {
            return self.outcome(x, value, &grad, 0, ConvergenceStatus::Converged(Criterion::Gradient));
        }

        let eps = f64::EPSILON;
        for iteration in 1..=self.config.max_iterations {
            if past(self.deadline) {
                return self.outcome(x, value, &grad, iteration - 1, ConvergenceStatus::TimedOut);
            }

            let mut direction = -self.apply_inverse_hessian(&grad);
            let mut slope = grad.dot(&direction);
            if !(slope < 0.0) {
                self.history.clear();
                direction = -&grad;
                slope = -grad.dot(&grad);
            }
            let initial_step = if self.history.is_empty() {
                (1.0 / direction.dot(&direction).sqrt()).min(1.0)
            } else {
                1.0
            };

            let step = match self.line_search(&objective, &x, value, &direction, slope, initial_step) {
                Some(step) => step,
                None if !self.history.is_empty() => {
                    log::debug!("Line search failed at iteration {iteration}; resetting L-BFGS history.");
                    self.history.clear();
                    continue;
                }
                None => {
                    let status = if past(self.deadline) {
                        ConvergenceStatus::TimedOut
                    } else {
                        ConvergenceStatus::NumericalFailure(format!(
                            "line search failed to find an acceptable step at iteration {iteration}"
                        ))
                    };
                    return self.outcome(x, value, &grad, iteration, status);
                }
            };

            let s = &step.x - &x;
            let y = &step.grad - &grad;
            let sy = s.dot(&y);
            let value_change = (value - step.value).abs();
            let param_change = inf_norm(&s);
            if sy > 1e-10 * s.dot(&s).sqrt() * y.dot(&y).sqrt() {
                if self.history.len() == self.config.history_size {
                    self.history.pop_front();
                }
                self.history.push_back(Correction { s, y, rho: 1.0 / sy });
            }
            let previous_value = value;
            x = step.x;
            value = step.value;
            grad = step.grad;
            log::trace!("L-BFGS iteration {iteration}: f = {value:.10e}, alpha = {:.3e}", step.alpha);

            let criterion = if value_change < self.config.tol_obj {
                Some(Criterion::AbsoluteObjective)
            } else if value_change / previous_value.abs().max(value.abs()).max(1.0)
                < self.config.tol_rel_obj * eps
            {
                Some(Criterion::RelativeObjective)
            } else if inf_norm(&grad) < self.config.tol_grad {
                Some(Criterion::Gradient)
            } else if grad.dot(&self.apply_inverse_hessian(&grad)).abs() / value.abs().max(1.0)
                < self.config.tol_rel_grad * eps
            {
                Some(Criterion::RelativeGradient)
            } else if param_change < self.config.tol_param {
                Some(Criterion::Parameter)
            } else {
                None
            };
            if let Some(criterion) = criterion {
                return self.outcome(x, value, &grad, iteration, ConvergenceStatus::Converged(criterion));
            }
        }
        let iterations = self.config.max_iterations;
        self.outcome(x, value, &grad, iterations, ConvergenceStatus::MaxIterations)
    }

    /// Strong Wolfe line search: bracketing followed by safeguarded interpolation.
    fn line_search<F>(
        &mut self,
        objective: &F,
        x: &Array1<f64>,
        value: f64,
        direction: &Array1<f64>,
        slope: f64,
        initial_step: f64,
    ) -> Option<Step>
    where
        F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
    {
        let mut previous: Option<Step> = None;
        let mut previous_alpha = 0.0;
        let mut previous_value = value;
        let mut previous_slope = slope;
        let mut alpha = initial_step;

        for i in 0..MAX_BRACKET_STEPS {
            if past(self.deadline) {
                return None;
            }
            let trial = x + &(direction * alpha);
            let (trial_value, trial_grad) = self.eval(objective, &trial);
            let candidate = Step {
                alpha,
                x: trial,
                value: trial_value,
                grad: trial_grad,
            };
            if candidate.value > value + WOLFE_C1 * alpha * slope
                || (i > 0 && candidate.value >= previous_value)
            {
                let lo = Bound {
                    alpha: previous_alpha,
                    value: previous_value,
                    slope: previous_slope,
                    step: previous,
                };
                return self.zoom(objective, x, value, direction, slope, lo, candidate.alpha, candidate.value);
            }
            let trial_slope = candidate.grad.dot(direction);
            if trial_slope.abs() <= -WOLFE_C2 * slope {
                return Some(candidate);
            }
            if trial_slope >= 0.0 {
                let hi_alpha = previous_alpha;
                let hi_value = previous_value;
                let lo = Bound {
                    alpha: candidate.alpha,
                    value: candidate.value,
                    slope: trial_slope,
                    step: Some(candidate),
                };
                return self.zoom(objective, x, value, direction, slope, lo, hi_alpha, hi_value);
            }
            previous_alpha = alpha;
            previous_value = candidate.value;
            previous_slope = trial_slope;
            previous = Some(candidate);
            alpha = (alpha * 2.0).min(MAX_STEP);
        }
        previous.filter(|p| p.value < value)
    }

    #[allow(clippy::too_many_arguments)]
    fn zoom<F>(
        &mut self,
        objective: &F,
        x: &Array1<f64>,
        value: f64,
        direction: &Array1<f64>,
        slope: f64,
        mut lo: Bound,
        mut hi_alpha: f64,
        mut hi_value: f64,
    ) -> Option<Step>
    where
        F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
    {
        for _ in 0..MAX_ZOOM_STEPS {
            if past(self.deadline) || (hi_alpha - lo.alpha).abs() < 1e-16 {
                break;
            }
            let alpha = interpolate(lo.alpha, lo.value, lo.slope, hi_alpha, hi_value);
            let trial = x + &(direction * alpha);
            let (trial_value, trial_grad) = self.eval(objective, &trial);
            if trial_value > value + WOLFE_C1 * alpha * slope || trial_value >= lo.value {
                hi_alpha = alpha;
                hi_value = trial_value;
                continue;
            }
            let trial_slope = trial_grad.dot(direction);
            let candidate = Step {
                alpha,
                x: trial,
                value: trial_value,
                grad: trial_grad,
            };
            if trial_slope.abs() <= -WOLFE_C2 * slope {
                return Some(candidate);
            }
            if trial_slope * (hi_alpha - lo.alpha) >= 0.0 {
                hi_alpha = lo.alpha;
                hi_value = lo.value;
            }
            lo = Bound {
                alpha,
                value: trial_value,
                slope: trial_slope,
                step: Some(candidate),
            };
        }
        // Accept the best sufficient-decrease point even if curvature was not met.
        lo.step.filter(|s| s.value < value)
    }
}

/// Low end of a bracketing interval in the zoom phase.
struct Bound {
    alpha: f64,
    value: f64,
    slope: f64,
    step: Option<Step>,
}

/// Minimizer of the quadratic through `(lo, f_lo, f'_lo)` and `(hi, f_hi)`, kept away
/// from the interval ends; falls back to bisection.
fn interpolate(lo: f64, f_lo: f64, d_lo: f64, hi: f64, f_hi: f64) -> f64 {
    let width = hi - lo;
    let (left, right) = if lo < hi { (lo, hi) } else { (hi, lo) };
    let margin = 0.1 * width.abs();
    let bisection = 0.5 * (lo + hi);
    if !f_hi.is_finite() {
        return bisection;
    }
    let denominator = 2.0 * (f_hi - f_lo - d_lo * width);
    if !(denominator > 0.0) {
        return bisection;
    }
    let alpha = lo - d_lo * width * width / denominator;
    if alpha.is_finite() && alpha >= left + margin && alpha <= right - margin {
        alpha
    } else {
        bisection
    }
}

fn minimize_dense<F>(
    x0: Array1<f64>,
    objective: F,
    config: &OptimizerConfig,
    deadline: Option<Instant>,
) -> OptimizerOutcome
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    let evaluations = Cell::new(0usize);
    let start = x0.clone();
    let cost_and_grad = |x: &Array1<f64>| -> (f64, Array1<f64>) {
        evaluations.set(evaluations.get() + 1);
        if past(deadline) {
            return (DENSE_PENALTY_VALUE, Array1::zeros(x.len()));
        }
        let (value, grad) = objective(x);
        if value.is_finite() && all_finite(&grad) {
            (value, grad)
        } else {
            log::warn!("Non-finite objective encountered: {value}, returning large finite value");
            (DENSE_PENALTY_VALUE, Array1::zeros(x.len()))
        }
    };

    let result = Bfgs::new(x0, cost_and_grad)
        .with_tolerance(config.tol_grad)
        .with_max_iterations(config.max_iterations)
        .run();

    match result {
        Ok(BfgsSolution {
            final_point,
            iterations,
            ..
        }) => {
            let (value, grad) = objective(&final_point);
            let status = if past(deadline) {
                ConvergenceStatus::TimedOut
            } else {
                ConvergenceStatus::Converged(Criterion::Gradient)
            };
            OptimizerOutcome {
                gradient_norm: inf_norm(&grad),
                x: final_point,
                value,
                iterations,
                evaluations: evaluations.get() + 1,
                status,
            }
        }
        Err(e) => {
            let message = format!("{e:?}");
            let status = if past(deadline) {
                ConvergenceStatus::TimedOut
            } else if message.contains("MaxIterations") {
                ConvergenceStatus::MaxIterations
            } else {
                ConvergenceStatus::NumericalFailure(format!("BFGS failed: {message}"))
            };
            let (value, grad) = objective(&start);
            OptimizerOutcome {
                gradient_norm: inf_norm(&grad),
                x: start,
                value,
                iterations: config.max_iterations,
                evaluations: evaluations.get() + 1,
                status,
            }
        }
    }
}
