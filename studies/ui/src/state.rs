use std::sync::{ Arc, Mutex };

/// `(samples seen, value)` points for one data source.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetricSeries {
    pub loss: Vec<(f64, f64)>,
    pub f1_score: Vec<(f64, f64)>,
}

impl MetricSeries {
    pub fn push(&mut self, step: f64, loss: f64, f1_score: f64) {
        self.loss.push((step, loss));
        self.f1_score.push((step, f1_score));
    }

    pub fn last_step(&self) -> f64 {
        self.loss.last().map_or(0.0, |(step, _)| *step)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Progress {
    pub mode: String,
    pub current_epoch: usize,
    pub max_epoch: usize,
    pub batch_size: usize,
    pub current_batch: usize,
    pub max_batch: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TrainingState {
    pub run_name: String,
    pub train: MetricSeries,
    pub validation: MetricSeries,
    pub progress: Progress,
    pub best_score: Option<f64>,
    /// Latest `(metric, value)` pairs, training first.
    pub summary: Vec<(String, String)>,
    pub history: Vec<(String, String)>,
    pub finished: bool,
}

impl TrainingState {
    /// Right edge of the charts: the furthest step of either series.
    pub fn max_step(&self) -> f64 {
        self.train.last_step().max(self.validation.last_step()).max(1.0)
    }
}

pub type StateMutex = Arc<Mutex<TrainingState>>;
