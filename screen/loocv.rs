//! # LOOCV Orchestrator
//!
//! Runs one independent refit per reference person. Every fold removes the held-out
//! person's responses, warm starts from the full-population fit, refits the model, and
//! scores the held-out person against the refit item parameters.
//!
//! Folds run as independent tasks on a dedicated rayon pool and report back over a
//! channel. The calling thread is the only reducer: it owns the checkpoint store and the
//! progress observer, so nothing mutable is shared between workers.

use crate::checkpoint::{CheckpointError, CheckpointKey, CheckpointStore};
use crate::config::{FailureEscalation, OptimizerConfig, PriorConfig, ScreeningConfig};
use crate::estimate::{self, FitControl};
use crate::model::{FitData, ParameterSet};
use crate::optimize::ConvergenceStatus;
use crate::personfit::{FitStatistic, score_person};
use crate::progress::LoocvProgressObserver;
use crate::types::PersonIndex;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoocvError {
    #[error("Leave-one-out validation needs at least 2 reference persons, found {0}.")]
    TooFewPersons(usize),
    #[error("Failed to build the LOOCV worker pool: {0}")]
    ThreadPool(String),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(
        "{failed} of {attempted} folds failed ({:.1}%), above the allowed {:.1}%.",
        .rate * 100.0,
        .limit * 100.0
    )]
    ExcessiveFailures {
        failed: usize,
        attempted: usize,
        rate: f64,
        limit: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FoldState {
    Pending,
    Running,
    Converged,
    Failed { reason: String },
    Skipped,
}

impl FoldState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Converged => "converged",
            Self::Failed { .. } => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Converged and failed folds are final and never re-run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::Failed { .. })
    }
}

impl fmt::Display for FoldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldOutcome {
    pub person_id: String,
    /// Position of the held-out person in the reference training data.
    pub person: PersonIndex,
    pub state: FoldState,
    pub status: Option<ConvergenceStatus>,
    /// Held-out statistic against the refit item parameters. Its `observed_loglik` is the
    /// held-out log-likelihood.
    pub fit: Option<FitStatistic>,
    pub iterations: usize,
    pub elapsed_secs: f64,
}

impl FoldOutcome {
    fn pending(person_id: &str, person: PersonIndex) -> Self {
        Self {
            person_id: person_id.to_string(),
            person,
            state: FoldState::Pending,
            status: None,
            fit: None,
            iterations: 0,
            elapsed_secs: 0.0,
        }
    }

    fn skipped(person_id: &str, person: PersonIndex) -> Self {
        Self {
            state: FoldState::Skipped,
            ..Self::pending(person_id, person)
        }
    }

    fn failed(person_id: &str, person: PersonIndex, reason: String, elapsed: Duration) -> Self {
        Self {
            state: FoldState::Failed { reason },
            elapsed_secs: elapsed.as_secs_f64(),
            ..Self::pending(person_id, person)
        }
    }

    /// The person-fit statistic of a converged fold.
    pub fn statistic(&self) -> Option<&FitStatistic> {
        match self.state {
            FoldState::Converged => self.fit.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoocvSummary {
    pub folds: usize,
    pub converged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub restored: usize,
    /// `failed / (converged + failed)`, zero when nothing was attempted.
    pub failure_rate: f64,
    pub complete: bool,
    pub elapsed_secs: f64,
}

impl LoocvSummary {
    fn from_outcomes(outcomes: &[FoldOutcome], restored: usize, elapsed: Duration) -> Self {
        let mut summary = Self {
            folds: outcomes.len(),
            converged: 0,
            failed: 0,
            skipped: 0,
            restored,
            failure_rate: 0.0,
            complete: false,
            elapsed_secs: elapsed.as_secs_f64(),
        };
        for outcome in outcomes {
            match outcome.state {
                FoldState::Converged => summary.converged += 1,
                FoldState::Failed { .. } => summary.failed += 1,
                _ => summary.skipped += 1,
            }
        }
        let attempted = summary.converged + summary.failed;
        if attempted > 0 {
            summary.failure_rate = summary.failed as f64 / attempted as f64;
        }
        summary.complete = summary.skipped == 0;
        summary
    }
}

#[derive(Debug, Clone)]
pub struct LoocvRun {
    /// One outcome per reference person, in training-data order.
    pub outcomes: Vec<FoldOutcome>,
    pub summary: LoocvSummary,
}

/// Read-only inputs shared by every fold.
#[derive(Debug, Clone)]
pub struct LoocvInput {
    pub data: Arc<FitData>,
    pub full_fit: Arc<ParameterSet>,
    pub content_hash: String,
    pub checkpoint: Option<PathBuf>,
    /// Raised by the caller to stop scheduling further folds.
    pub cancel: Arc<AtomicBool>,
}

impl LoocvInput {
    pub fn new(data: FitData, full_fit: ParameterSet, content_hash: String) -> Self {
        Self {
            data: Arc::new(data),
            full_fit: Arc::new(full_fit),
            content_hash,
            checkpoint: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_checkpoint(mut self, path: PathBuf) -> Self {
        self.checkpoint = Some(path);
        self
    }

    pub fn checkpoint_key(&self) -> CheckpointKey {
        CheckpointKey {
            content_hash: self.content_hash.clone(),
            fold_count: self.data.n_persons(),
            params_fingerprint: self.full_fit.fingerprint(),
        }
    }
}

enum FoldEvent {
    Started(PersonIndex),
    Finished(FoldOutcome),
}

struct FoldTask {
    data: Arc<FitData>,
    full_fit: Arc<ParameterSet>,
    priors: PriorConfig,
    optimizer: OptimizerConfig,
    fold_timeout: Option<Duration>,
    budget_deadline: Option<Instant>,
    cancel: Arc<AtomicBool>,
}

impl FoldTask {
    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
            || self.budget_deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn execute(&self, person: PersonIndex, events: &Sender<FoldEvent>) {
        let person_id = &self.data.person_ids[person.get()];
        if self.should_stop() {
            let _ = events.send(FoldEvent::Finished(FoldOutcome::skipped(person_id, person)));
            return;
        }
        let _ = events.send(FoldEvent::Started(person));
        let started = Instant::now();
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.refit(person))) {
            Ok(outcome) => outcome,
            Err(payload) => FoldOutcome::failed(
                person_id,
                person,
                format!("fold panicked: {}", panic_message(payload.as_ref())),
                started.elapsed(),
            ),
        };
        let _ = events.send(FoldEvent::Finished(outcome));
    }

    fn refit(&self, person: PersonIndex) -> FoldOutcome {
        let started = Instant::now();
        let person_id = &self.data.person_ids[person.get()];
        let training = self.data.without_person(person);

        let control = FitControl::with_timeout(self.fold_timeout);
        let result = match estimate::fit(
            &training,
            Some(&self.full_fit),
            &self.priors,
            &self.optimizer,
            &control,
        ) {
            Ok(result) => result,
            Err(e) => return FoldOutcome::failed(person_id, person, e.to_string(), started.elapsed()),
        };
        if !result.status.is_converged() {
            log::debug!("Fold for '{person_id}' did not converge: {}", result.status);
            return FoldOutcome {
                status: Some(result.status.clone()),
                iterations: result.diagnostics.iterations,
                ..FoldOutcome::failed(person_id, person, result.status.to_string(), started.elapsed())
            };
        }

        let stat = score_person(
            self.data.responses_for(person),
            self.data.covariate[person.get()],
            &self.data.categories,
            &result.params,
        );
        if !(stat.lz.is_finite() && stat.avg_logpost.is_finite()) {
            return FoldOutcome::failed(
                person_id,
                person,
                "held-out person-fit statistic is not finite".to_string(),
                started.elapsed(),
            );
        }
        log::debug!(
            "Fold for '{person_id}' converged after {} iterations: lz {:.3}, avg_logpost {:.3}.",
            result.diagnostics.iterations,
            stat.lz,
            stat.avg_logpost
        );
        FoldOutcome {
            person_id: person_id.clone(),
            person,
            state: FoldState::Converged,
            status: Some(result.status),
            fit: Some(stat),
            iterations: result.diagnostics.iterations,
            elapsed_secs: started.elapsed().as_secs_f64(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs every leave-one-out fold over the reference training data.
///
/// Folds restored from a matching checkpoint are not re-run. Folds beyond `max_folds`,
/// or not yet started when the wall-clock budget or the cancel flag trips, are
/// `Skipped` and the run is reported incomplete.
pub fn run_loocv(
    input: &LoocvInput,
    config: &ScreeningConfig,
    observer: &mut dyn LoocvProgressObserver,
) -> Result<LoocvRun, LoocvError> {
    let start = Instant::now();
    let data = &input.data;
    let n = data.n_persons();
    if n < 2 {
        return Err(LoocvError::TooFewPersons(n));
    }
    let settings = &config.loocv;

    let mut store = match &input.checkpoint {
        Some(path) => Some(CheckpointStore::open(path, input.checkpoint_key())?),
        None => None,
    };
    let mut slots: Vec<FoldOutcome> = (0..n)
        .map(|i| FoldOutcome::pending(&data.person_ids[i], PersonIndex::new(i)))
        .collect();
    if let Some(store) = &store {
        for fold in store.restored() {
            match data.person_index(&fold.person_id) {
                Some(index) if fold.state.is_terminal() => {
                    slots[index.get()] = FoldOutcome {
                        person: index,
                        ..fold.clone()
                    };
                }
                _ => log::warn!(
                    "Ignoring checkpointed fold for unknown person '{}'.",
                    fold.person_id
                ),
            }
        }
    }
    let restored = slots.iter().filter(|slot| slot.state.is_terminal()).count();

    let pending: Vec<usize> = (0..n)
        .filter(|&i| slots[i].state == FoldState::Pending)
        .collect();
    let run_limit = settings.max_folds.unwrap_or(usize::MAX).min(pending.len());
    let (to_run, deferred) = pending.split_at(run_limit);
    for &i in deferred {
        slots[i].state = FoldState::Skipped;
    }

    let workers = settings.worker_count();
    log::info!(
        "Running {} of {} LOOCV folds on {} workers ({} restored, {} deferred).",
        to_run.len(),
        n,
        workers,
        restored,
        deferred.len()
    );
    observer.on_start(n, restored);

    if !to_run.is_empty() {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("loocv-{i}"))
            .build()
            .map_err(|e| LoocvError::ThreadPool(e.to_string()))?;
        let task = Arc::new(FoldTask {
            data: Arc::clone(&input.data),
            full_fit: Arc::clone(&input.full_fit),
            priors: config.model.clone(),
            optimizer: config.optimizer.clone(),
            fold_timeout: settings.fold_timeout(),
            budget_deadline: settings.wall_clock_budget().map(|budget| start + budget),
            cancel: Arc::clone(&input.cancel),
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        for &i in to_run {
            let task = Arc::clone(&task);
            let tx = tx.clone();
            pool.spawn(move || task.execute(PersonIndex::new(i), &tx));
        }
        drop(tx);

        let mut completed = restored;
        for event in rx.iter() {
            match event {
                FoldEvent::Started(person) => {
                    slots[person.get()].state = FoldState::Running;
                    observer.on_fold_started(&data.person_ids[person.get()]);
                }
                FoldEvent::Finished(outcome) => {
                    completed += 1;
                    if let Some(store) = store.as_mut().filter(|_| outcome.state.is_terminal()) {
                        store.record(outcome.clone());
                        if store.unflushed() >= settings.checkpoint_every {
                            store.flush()?;
                        }
                    }
                    observer.on_fold_finished(&outcome, completed);
                    let index = outcome.person.get();
                    slots[index] = outcome;
                }
            }
        }
    }
    if let Some(store) = store.as_mut() {
        if store.unflushed() > 0 {
            store.flush()?;
        }
    }

    // A fold still pending or running here never reported back.
    let mut outcomes = slots;
    for outcome in &mut outcomes {
        if matches!(outcome.state, FoldState::Pending | FoldState::Running) {
            outcome.state = FoldState::Skipped;
        }
    }
    let summary = LoocvSummary::from_outcomes(&outcomes, restored, start.elapsed());
    observer.on_finish(&summary);
    log::info!(
        "LOOCV finished in {:.1}s: {} converged, {} failed, {} skipped{}.",
        summary.elapsed_secs,
        summary.converged,
        summary.failed,
        summary.skipped,
        if summary.complete { "" } else { " (incomplete)" }
    );

    if summary.failure_rate > settings.max_failure_rate {
        let error = LoocvError::ExcessiveFailures {
            failed: summary.failed,
            attempted: summary.converged + summary.failed,
            rate: summary.failure_rate,
            limit: settings.max_failure_rate,
        };
        match settings.failure_escalation {
            FailureEscalation::Warn => log::warn!("{error}"),
            FailureEscalation::Error => return Err(error),
        }
    }

    Ok(LoocvRun { outcomes, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopLoocvProgress;
    use crate::types::{ItemIndex, Response};

    fn simulated_data(n_persons: usize) -> FitData {
        let categories = vec![2, 3, 2, 3];
        let mut data = FitData {
            categories: categories.clone(),
            person_ids: Vec::new(),
            covariate: Vec::new(),
            responses: Vec::new(),
            person_offsets: vec![0],
            item_set_hash: "sim".to_string(),
        };
        for i in 0..n_persons {
            data.person_ids.push(format!("r{i}"));
            data.covariate.push((i % 7) as f64 / 3.0 - 1.0);
            for (j, &k) in categories.iter().enumerate() {
                let category = ((i * 7 + j * 3) % 11 % k as usize) as u8;
                data.responses.push(Response {
                    person: PersonIndex::new(i),
                    item: ItemIndex::new(j),
                    category,
                });
            }
            data.person_offsets.push(data.responses.len());
        }
        data
    }

    fn input(n_persons: usize) -> LoocvInput {
        let data = simulated_data(n_persons);
        let config = ScreeningConfig::default();
        let full = estimate::fit(
            &data,
            None,
            &config.model,
            &config.optimizer,
            &FitControl::default(),
        )
        .unwrap();
        LoocvInput::new(data, full.params, "content".to_string())
    }

    fn config(threads: usize) -> ScreeningConfig {
        let mut config = ScreeningConfig::default();
        config.loocv.threads = Some(threads);
        config
    }

    #[test]
    fn every_fold_reports_a_finite_statistic() {
        let input = input(12);
        let run = run_loocv(&input, &config(2), &mut NoopLoocvProgress).unwrap();
        assert_eq!(run.outcomes.len(), 12);
        assert!(run.summary.complete);
        assert_eq!(run.summary.converged + run.summary.failed, 12);
        for (i, outcome) in run.outcomes.iter().enumerate() {
            assert_eq!(outcome.person.get(), i);
            if let Some(stat) = outcome.statistic() {
                assert!(stat.lz.is_finite());
                assert_eq!(stat.n_items, 4);
            }
        }
        assert!(run.summary.converged >= 11);
    }

    #[test]
    fn outcomes_do_not_depend_on_worker_count() {
        let input = input(8);
        let one = run_loocv(&input, &config(1), &mut NoopLoocvProgress).unwrap();
        let three = run_loocv(&input, &config(3), &mut NoopLoocvProgress).unwrap();
        for (a, b) in one.outcomes.iter().zip(&three.outcomes) {
            assert_eq!(a.state, b.state);
            assert_eq!(a.fit, b.fit);
        }
    }

    #[test]
    fn max_folds_defers_the_rest_and_checkpoint_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let input = input(6).with_checkpoint(dir.path().join("folds.json"));
        let mut limited = config(2);
        limited.loocv.max_folds = Some(2);
        limited.loocv.checkpoint_every = 1;

        let first = run_loocv(&input, &limited, &mut NoopLoocvProgress).unwrap();
        assert!(!first.summary.complete);
        assert_eq!(first.summary.skipped, 4);
        assert_eq!(first.summary.restored, 0);

        let resumed = run_loocv(&input, &config(2), &mut NoopLoocvProgress).unwrap();
        assert!(resumed.summary.complete);
        assert_eq!(resumed.summary.restored, 2);

        let uninterrupted = run_loocv(&input.clone_without_checkpoint(), &config(2), &mut NoopLoocvProgress)
            .unwrap();
        for (a, b) in resumed.outcomes.iter().zip(&uninterrupted.outcomes) {
            assert_eq!(a.person_id, b.person_id);
            assert_eq!(a.fit, b.fit);
        }
    }

    #[test]
    fn raised_cancel_flag_skips_everything() {
        let input = input(5);
        input.cancel.store(true, Ordering::Relaxed);
        let run = run_loocv(&input, &config(2), &mut NoopLoocvProgress).unwrap();
        assert_eq!(run.summary.skipped, 5);
        assert!(!run.summary.complete);
        assert_eq!(run.summary.failure_rate, 0.0);
    }

    #[test]
    fn failure_escalation_follows_configuration() {
        let input = input(5);
        let mut starved = config(2);
        starved.optimizer.max_iterations = 1;
        starved.optimizer.tol_grad = 0.0;
        starved.optimizer.tol_rel_grad = 0.0;
        starved.optimizer.tol_obj = 0.0;
        starved.optimizer.tol_rel_obj = 0.0;
        starved.optimizer.tol_param = 0.0;

        let run = run_loocv(&input, &starved, &mut NoopLoocvProgress).unwrap();
        assert_eq!(run.summary.failed, 5);
        assert_eq!(run.summary.failure_rate, 1.0);
        for outcome in &run.outcomes {
            assert!(matches!(outcome.state, FoldState::Failed { .. }));
            assert!(outcome.fit.is_none());
        }

        starved.loocv.failure_escalation = FailureEscalation::Error;
        assert!(matches!(
            run_loocv(&input, &starved, &mut NoopLoocvProgress),
            Err(LoocvError::ExcessiveFailures { failed: 5, attempted: 5, .. })
        ));
    }

    #[test]
    fn fold_timeout_fails_folds_without_aborting_the_batch() {
        let input = input(4);
        let mut hurried = config(2);
        hurried.loocv.fold_timeout_secs = Some(1e-9);
        hurried.optimizer.tol_grad = 0.0;

        let run = run_loocv(&input, &hurried, &mut NoopLoocvProgress).unwrap();
        assert!(run.summary.complete);
        assert_eq!(run.summary.failed, 4);
        for outcome in &run.outcomes {
            assert_eq!(
                outcome.state,
                FoldState::Failed {
                    reason: "timed out".to_string()
                }
            );
            assert_eq!(outcome.status, Some(ConvergenceStatus::TimedOut));
            assert!(outcome.statistic().is_none());
        }
    }

    #[test]
    fn exhausted_budget_skips_folds_and_resume_runs_them() {
        let dir = tempfile::tempdir().unwrap();
        let input = input(5).with_checkpoint(dir.path().join("folds.json"));
        let mut budgeted = config(1);
        budgeted.loocv.wall_clock_budget_secs = Some(1e-9);

        let starved = run_loocv(&input, &budgeted, &mut NoopLoocvProgress).unwrap();
        assert!(!starved.summary.complete);
        assert_eq!(starved.summary.skipped, 5);
        assert!(starved.outcomes.iter().all(|o| o.state == FoldState::Skipped));

        let resumed = run_loocv(&input, &config(1), &mut NoopLoocvProgress).unwrap();
        assert!(resumed.summary.complete);
        assert_eq!(resumed.summary.restored, 0);
        assert_eq!(resumed.summary.converged + resumed.summary.failed, 5);
    }

    #[test]
    fn observer_sees_every_started_fold() {
        #[derive(Default)]
        struct Recorder {
            started: Vec<String>,
            finished: usize,
        }
        impl LoocvProgressObserver for Recorder {
            fn on_fold_started(&mut self, person_id: &str) {
                self.started.push(person_id.to_string());
            }
            fn on_fold_finished(&mut self, outcome: &FoldOutcome, _completed: usize) {
                assert!(outcome.state.is_terminal(), "{}", outcome.state);
                self.finished += 1;
            }
        }

        let input = input(4);
        let mut recorder = Recorder::default();
        run_loocv(&input, &config(2), &mut recorder).unwrap();
        recorder.started.sort();
        assert_eq!(recorder.started, vec!["r0", "r1", "r2", "r3"]);
        assert_eq!(recorder.finished, 4);
    }

    #[test]
    fn single_person_cannot_be_cross_validated() {
        let mut input = input(3);
        input.data = Arc::new(simulated_data(1));
        assert!(matches!(
            run_loocv(&input, &config(1), &mut NoopLoocvProgress),
            Err(LoocvError::TooFewPersons(1))
        ));
    }

    impl LoocvInput {
        fn clone_without_checkpoint(&self) -> Self {
            Self {
                checkpoint: None,
                ..self.clone()
            }
        }
    }
}
