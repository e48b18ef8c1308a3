use std::sync::{Arc, Mutex};

/// Shared progress handle for long optimizer runs; clones observe the same state.
#[derive(Clone, Default)]
pub struct OptimizerStatus {
    inner: Arc<Mutex<OptimizerStatusData>>,
}

#[derive(Default)]
struct OptimizerStatusData {
    phase: String,
    total_combinations: usize,
    completed_combinations: usize,
    failed_combinations: usize,
    best_objective: Option<f64>,
    note: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerStatusSnapshot {
    pub phase: String,
    pub total_combinations: usize,
    pub completed_combinations: usize,
    pub failed_combinations: usize,
    pub best_objective: Option<f64>,
    pub note: Option<String>,
}

impl OptimizerStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(OptimizerStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    pub fn set_progress(
        &self,
        total_combinations: usize,
        completed_combinations: usize,
        failed_combinations: usize,
    ) {
        if let Ok(mut data) = self.inner.lock() {
            data.total_combinations = total_combinations;
            data.completed_combinations = completed_combinations;
            data.failed_combinations = failed_combinations;
        }
    }

    /// Keeps the maximum objective observed; non-finite values are ignored.
    pub fn record_objective(&self, objective: f64) {
        if !objective.is_finite() {
            return;
        }
        if let Ok(mut data) = self.inner.lock() {
            data.best_objective = Some(match data.best_objective {
                Some(best) => best.max(objective),
                None => objective,
            });
        }
    }

    pub fn set_note<S: Into<String>>(&self, note: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.note = Some(note.into());
        }
    }

    pub fn snapshot(&self) -> OptimizerStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            OptimizerStatusSnapshot {
                phase: data.phase.clone(),
                total_combinations: data.total_combinations,
                completed_combinations: data.completed_combinations,
                failed_combinations: data.failed_combinations,
                best_objective: data.best_objective,
                note: data.note.clone(),
            }
        } else {
            OptimizerStatusSnapshot {
                phase: "Status unavailable".to_string(),
                total_combinations: 0,
                completed_combinations: 0,
                failed_combinations: 0,
                best_objective: None,
                note: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_progress_and_best_objective() {
        let status = OptimizerStatus::new();
        let observer = status.clone();
        assert_eq!(observer.snapshot().phase, "Initializing");

        status.set_phase("Grid search");
        status.set_progress(10, 4, 1);
        status.record_objective(1.5);
        status.record_objective(f64::NAN);
        status.record_objective(0.5);
        status.set_note("window 2 skipped");

        let snap = observer.snapshot();
        assert_eq!(snap.phase, "Grid search");
        assert_eq!(snap.completed_combinations, 4);
        assert_eq!(snap.failed_combinations, 1);
        assert_eq!(snap.best_objective, Some(1.5));
        assert_eq!(snap.note.as_deref(), Some("window 2 skipped"));
    }
}
