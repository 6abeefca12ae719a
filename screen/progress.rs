use crate::loocv::{FoldOutcome, FoldState, LoocvSummary};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;

/// Observer for reporting incremental progress while the LOOCV batch runs.
///
/// All callbacks are invoked from the orchestrating thread, never from a worker.
pub trait LoocvProgressObserver {
    fn on_start(&mut self, total_folds: usize, restored_folds: usize) {
        let _ = (total_folds, restored_folds);
    }
    fn on_fold_started(&mut self, person_id: &str) {
        let _ = person_id;
    }
    fn on_fold_finished(&mut self, outcome: &FoldOutcome, completed_folds: usize) {
        let _ = (outcome, completed_folds);
    }
    fn on_finish(&mut self, summary: &LoocvSummary) {
        let _ = summary;
    }
}

#[derive(Default)]
pub struct NoopLoocvProgress;

impl LoocvProgressObserver for NoopLoocvProgress {}

/// Progress bar on stderr. Hidden when stderr is not a terminal.
#[derive(Default)]
pub struct ConsoleLoocvProgress {
    bar: Option<ProgressBar>,
    failed: usize,
}

impl ConsoleLoocvProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} folds ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

impl LoocvProgressObserver for ConsoleLoocvProgress {
    fn on_start(&mut self, total_folds: usize, restored_folds: usize) {
        let bar = create_progress_bar(total_folds as u64, "leave-one-out refits");
        bar.set_position(restored_folds as u64);
        self.bar = Some(bar);
    }

    fn on_fold_finished(&mut self, outcome: &FoldOutcome, completed_folds: usize) {
        if matches!(outcome.state, FoldState::Failed { .. }) {
            self.failed += 1;
        }
        if let Some(bar) = &self.bar {
            bar.set_position(completed_folds as u64);
            if self.failed > 0 {
                bar.set_message(format!("{} failed", self.failed));
            }
        }
    }

    fn on_finish(&mut self, summary: &LoocvSummary) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!(
                "{} converged, {} failed, {} skipped",
                summary.converged, summary.failed, summary.skipped
            ));
        }
    }
}
