//! Per-sample confusion accumulation and its reduction to epoch metrics.
//!
//! During an epoch every sample owns one column of a `[METRICS_SIZE, samples]`
//! tensor that stays on the compute device. At the end of the epoch the tensor
//! is copied to the host once, checked for non-finite values and reduced into
//! a [`SegMetrics`] record whose `score` drives checkpoint promotion.

use burn::{ prelude::Backend, tensor::Tensor };
use ndarray::{ Array2, ArrayView1, Axis };
use serde::Serialize;

use crate::error::{ SegError, SegResult };

pub const METRICS_LABEL_NDX: usize = 0;
pub const METRICS_LOSS_NDX: usize = 1;
pub const METRICS_MAL_LOSS_NDX: usize = 2;
// row 3 is reserved
pub const METRICS_MTP_NDX: usize = 4;
pub const METRICS_MFN_NDX: usize = 5;
pub const METRICS_MFP_NDX: usize = 6;
pub const METRICS_ATP_NDX: usize = 7;
pub const METRICS_AFN_NDX: usize = 8;
pub const METRICS_AFP_NDX: usize = 9;

pub const METRICS_SIZE: usize = 10;

/// Values computed by one batch step, one entry per sample.
pub struct BatchStats<B: Backend> {
    pub labels: Tensor<B, 1>,
    pub loss: Tensor<B, 1>,
    pub mal_loss: Tensor<B, 1>,
    pub mal_tp: Tensor<B, 1>,
    pub mal_fn: Tensor<B, 1>,
    pub mal_fp: Tensor<B, 1>,
    pub all_tp: Tensor<B, 1>,
    pub all_fn: Tensor<B, 1>,
    pub all_fp: Tensor<B, 1>,
}

/// Device-resident accumulator for one epoch.
///
/// Created fresh per epoch and consumed by [`MetricsBuffer::into_host`]; it is
/// never read before the epoch is over.
#[derive(Debug)]
pub struct MetricsBuffer<B: Backend> {
    values: Tensor<B, 2>,
    samples: usize,
}

impl<B: Backend> MetricsBuffer<B> {
    pub fn new(samples: usize, device: &B::Device) -> Self {
        Self {
            values: Tensor::zeros([METRICS_SIZE, samples], device),
            samples,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.samples
    }

    /// Writes a batch into columns `start..start + n`.
    pub fn record(&mut self, start: usize, stats: BatchStats<B>) -> SegResult<()> {
        let n = stats.labels.dims()[0];
        let end = start + n;
        if end > self.samples {
            return Err(SegError::ColumnRange { start, end, total: self.samples });
        }

        let rows = [
            (METRICS_LABEL_NDX, stats.labels),
            (METRICS_LOSS_NDX, stats.loss),
            (METRICS_MAL_LOSS_NDX, stats.mal_loss),
            (METRICS_MTP_NDX, stats.mal_tp),
            (METRICS_MFN_NDX, stats.mal_fn),
            (METRICS_MFP_NDX, stats.mal_fp),
            (METRICS_ATP_NDX, stats.all_tp),
            (METRICS_AFN_NDX, stats.all_fn),
            (METRICS_AFP_NDX, stats.all_fp),
        ];

        for (row, values) in rows {
            let dims = values.dims();
            if dims[0] != n {
                return Err(SegError::ShapeMismatch {
                    what: "metrics row",
                    expected: vec![n],
                    actual: dims.to_vec(),
                });
            }
            self.values = self.values
                .clone()
                .slice_assign([row..row + 1, start..end], values.reshape([1, n]));
        }

        Ok(())
    }

    /// Moves the buffer to host memory, ending its life on the device.
    pub fn into_host(self) -> SegResult<MetricsArray> {
        let values = self.values
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| SegError::TensorData(format!("{e:?}")))?;
        let array = Array2::from_shape_vec((METRICS_SIZE, self.samples), values).map_err(|e|
            SegError::TensorData(e.to_string())
        )?;

        Ok(MetricsArray(array))
    }
}

/// Host copy of an epoch's metrics buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsArray(pub Array2<f32>);

impl MetricsArray {
    pub fn num_samples(&self) -> usize {
        self.0.ncols()
    }

    pub fn row(&self, ndx: usize) -> ArrayView1<'_, f32> {
        self.0.row(ndx)
    }

    pub fn non_finite_count(&self) -> usize {
        self.0
            .iter()
            .filter(|v| !v.is_finite())
            .count()
    }
}

/// Malignant samples are the ones whose label has the low bit set (1 or 3).
pub fn is_malignant_label(label: f32) -> bool {
    label == 1.0 || label == 3.0
}

/// Epoch metrics, computed once and shared by the logging sinks and the scorer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SegMetrics {
    pub loss_all: f64,
    pub loss_mal: f64,
    pub correct_all: f64,
    pub correct_mal: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub score: f64,
    pub all_correct: f64,
    pub all_label: f64,
    pub mal_correct: f64,
    pub mal_label: f64,
}

impl SegMetrics {
    /// Reduces a host metrics buffer.
    ///
    /// Fails when any entry is NaN or infinite: a corrupted epoch must stop the
    /// run instead of being reported.
    pub fn from_array(mode: &str, metrics: &MetricsArray) -> SegResult<Self> {
        let non_finite = metrics.non_finite_count();
        if non_finite > 0 {
            return Err(SegError::NonFiniteMetrics { mode: mode.to_string(), count: non_finite });
        }

        let sums: Vec<f64> = metrics.0
            .map(|v| *v as f64)
            .sum_axis(Axis(1))
            .to_vec();

        let all_tp = sums[METRICS_ATP_NDX];
        let all_fn = sums[METRICS_AFN_NDX];
        let all_fp = sums[METRICS_AFP_NDX];
        let mal_tp = sums[METRICS_MTP_NDX];
        let mal_fn = sums[METRICS_MFN_NDX];

        let loss_all = mean(metrics.row(METRICS_LOSS_NDX).iter().copied());
        let loss_mal = mean(
            metrics
                .row(METRICS_LABEL_NDX)
                .iter()
                .zip(metrics.row(METRICS_MAL_LOSS_NDX).iter())
                .filter(|(label, _)| is_malignant_label(**label))
                .map(|(_, loss)| *loss)
        );

        let precision = floored_ratio(all_tp, all_tp + all_fp);
        let recall = floored_ratio(all_tp, all_tp + all_fn);
        let f1_score = floored_ratio(2.0 * precision * recall, precision + recall);

        Ok(SegMetrics {
            loss_all,
            loss_mal,
            correct_all: floored_ratio(all_tp, all_tp + all_fn) * 100.0,
            correct_mal: floored_ratio(mal_tp, mal_tp + mal_fn) * 100.0,
            precision,
            recall,
            f1_score,
            score: score(f1_score, recall, loss_mal, loss_all),
            all_correct: all_tp,
            all_label: all_tp + all_fn,
            mal_correct: mal_tp,
            mal_label: mal_tp + mal_fn,
        })
    }

    /// Named scalars as they are written to the logging sinks.
    pub fn scalars(&self) -> [(&'static str, f64); 7] {
        [
            ("loss/all", self.loss_all),
            ("loss/mal", self.loss_mal),
            ("correct/mal", self.correct_mal),
            ("correct/all", self.correct_all),
            ("pr/precision", self.precision),
            ("pr/recall", self.recall),
            ("pr/f1_score", self.f1_score),
        ]
    }
}

/// Model selection score, higher is better.
///
/// F1 dominates; the recall term penalises flooding the mask with positives and
/// the two loss terms only break ties.
pub fn score(f1_score: f64, recall: f64, loss_mal: f64, loss_all: f64) -> f64 {
    1.0 + f1_score - recall * 0.01 - loss_mal * 0.001 - loss_all * 0.0001
}

/// `numerator / denominator`, with a zero denominator replaced by one.
fn floored_ratio(numerator: f64, denominator: f64) -> f64 {
    numerator / (if denominator == 0.0 { 1.0 } else { denominator })
}

/// Mean of the values, 0 for an empty set.
fn mean(values: impl Iterator<Item = f32>) -> f64 {
    let (sum, count) = values.fold((0.0f64, 0usize), |(sum, count), v| (sum + (v as f64), count + 1));
    if count == 0 { 0.0 } else { sum / (count as f64) }
}
