use burn::prelude::Backend;
use burn::tensor::{ Tensor, TensorData };
use std::ops::Range;
use std::sync::mpsc::{ sync_channel, Receiver };
use std::sync::Arc;
use std::thread;

use crate::error::{ SegError, SegResult };

/// Batches each worker may queue ahead of the training loop.
const PREFETCH_PER_WORKER: usize = 2;

/// A CT slice with its neighbouring context slices and its masks.
#[derive(Debug, Clone, PartialEq)]
pub struct SegSample {
    /// `[channels, height, width]` in Hounsfield units; the center channel is
    /// the labelled slice.
    pub ct: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    /// `[height, width]` masks with values in {0, 1}.
    pub nodule: Vec<f32>,
    pub benign: Vec<f32>,
    pub malignant: Vec<f32>,
    /// Bit 1: a nodule is present. Bit 0: it is malignant.
    pub label: u8,
    pub series_uid: String,
    pub slice_ndx: usize,
}

impl SegSample {
    pub fn center_slice(&self) -> &[f32] {
        let plane = self.height * self.width;
        let center = self.channels / 2;
        &self.ct[center * plane..(center + 1) * plane]
    }

    fn check(&self) -> SegResult<()> {
        let plane = self.height * self.width;
        let expected = [self.channels * plane, plane, plane, plane];
        let actual = [self.ct.len(), self.nodule.len(), self.benign.len(), self.malignant.len()];
        if expected != actual {
            return Err(SegError::ShapeMismatch {
                what: "sample buffers",
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            });
        }
        Ok(())
    }
}

pub fn label_code(has_nodule: bool, is_malignant: bool) -> u8 {
    ((has_nodule as u8) << 1) | (is_malignant as u8)
}

pub trait SegmentationDataset: Send + Sync + 'static {
    fn len(&self) -> usize;

    fn get(&self, ndx: usize) -> SegResult<SegSample>;

    /// The sample as it is drawn in preview images, without random
    /// augmentation.
    fn get_preview(&self, ndx: usize) -> SegResult<SegSample> {
        self.get(ndx)
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Samples stacked into device tensors.
#[derive(Debug, Clone)]
pub struct SegBatch<B: Backend> {
    /// `[N, C, H, W]`
    pub input: Tensor<B, 4>,
    /// `[N, 1, H, W]`
    pub label: Tensor<B, 4>,
    pub labels: Vec<u8>,
    pub benign: Tensor<B, 4>,
    pub malignant: Tensor<B, 4>,
    pub series: Vec<(String, usize)>,
}

impl<B: Backend> SegBatch<B> {
    pub fn from_samples(samples: Vec<SegSample>, device: &B::Device) -> SegResult<Self> {
        let first = samples.first().ok_or_else(|| SegError::Dataset("empty batch".to_string()))?;
        let (channels, height, width) = (first.channels, first.height, first.width);
        let n = samples.len();
        let plane = height * width;

        let mut input = Vec::with_capacity(n * channels * plane);
        let mut label = Vec::with_capacity(n * plane);
        let mut benign = Vec::with_capacity(n * plane);
        let mut malignant = Vec::with_capacity(n * plane);
        let mut labels = Vec::with_capacity(n);
        let mut series = Vec::with_capacity(n);

        for sample in samples {
            sample.check()?;
            if (sample.channels, sample.height, sample.width) != (channels, height, width) {
                return Err(SegError::ShapeMismatch {
                    what: "batch samples",
                    expected: vec![channels, height, width],
                    actual: vec![sample.channels, sample.height, sample.width],
                });
            }
            input.extend_from_slice(&sample.ct);
            label.extend_from_slice(&sample.nodule);
            benign.extend_from_slice(&sample.benign);
            malignant.extend_from_slice(&sample.malignant);
            labels.push(sample.label);
            series.push((sample.series_uid, sample.slice_ndx));
        }

        let mask = |values: Vec<f32>| {
            Tensor::from_data(TensorData::new(values, [n, 1, height, width]), device)
        };

        Ok(Self {
            input: Tensor::from_data(TensorData::new(input, [n, channels, height, width]), device),
            label: mask(label),
            labels,
            benign: mask(benign),
            malignant: mask(malignant),
            series,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels_tensor(&self) -> Tensor<B, 1> {
        let values: Vec<f32> = self.labels
            .iter()
            .map(|&l| l as f32)
            .collect();
        Tensor::from_data(TensorData::new(values, [self.len()]), &self.input.device())
    }
}

/// Ordered, restartable batch source over a dataset.
///
/// With `num_workers > 0` samples are loaded on background threads, each
/// feeding a bounded queue. Batch `k` is always produced by worker
/// `k % num_workers`, so batches arrive in dataset order.
pub struct DataLoader<D: SegmentationDataset> {
    dataset: Arc<D>,
    batch_size: usize,
    num_workers: usize,
}

impl<D: SegmentationDataset> DataLoader<D> {
    pub fn new(dataset: D, batch_size: usize, num_workers: usize) -> DataLoader<D> {
        DataLoader {
            dataset: Arc::new(dataset),
            batch_size: batch_size.max(1),
            num_workers,
        }
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Total number of samples in the dataset
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Number of batches based on the dataset size and batch size
    pub fn len_batch(&self) -> usize {
        (self.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn batch_range(&self, batch_ndx: usize) -> Range<usize> {
        let start = batch_ndx * self.batch_size;
        start..(start + self.batch_size).min(self.len())
    }

    /// Starts a fresh pass over the dataset.
    pub fn iter<B: Backend>(&self, device: &B::Device) -> BatchIter<B, D> {
        let batches = self.len_batch();
        let workers = self.num_workers.min(batches);

        let receivers = (0..workers)
            .map(|worker| {
                let (tx, rx) = sync_channel(PREFETCH_PER_WORKER);
                let dataset = Arc::clone(&self.dataset);
                let ranges: Vec<Range<usize>> = (worker..batches)
                    .step_by(workers)
                    .map(|batch_ndx| self.batch_range(batch_ndx))
                    .collect();

                thread::spawn(move || {
                    for range in ranges {
                        let samples = load_samples(dataset.as_ref(), range);
                        let failed = samples.is_err();
                        if tx.send(samples).is_err() || failed {
                            break;
                        }
                    }
                });
                rx
            })
            .collect();

        BatchIter {
            dataset: Arc::clone(&self.dataset),
            receivers,
            batch_size: self.batch_size,
            batches,
            next_batch: 0,
            device: device.clone(),
        }
    }
}

fn load_samples<D: SegmentationDataset + ?Sized>(
    dataset: &D,
    range: Range<usize>
) -> SegResult<Vec<SegSample>> {
    range.map(|ndx| dataset.get(ndx)).collect()
}

pub struct BatchIter<B: Backend, D: SegmentationDataset> {
    dataset: Arc<D>,
    receivers: Vec<Receiver<SegResult<Vec<SegSample>>>>,
    batch_size: usize,
    batches: usize,
    next_batch: usize,
    device: B::Device,
}

impl<B: Backend, D: SegmentationDataset> BatchIter<B, D> {
    fn next_samples(&mut self, batch_ndx: usize) -> SegResult<Vec<SegSample>> {
        if self.receivers.is_empty() {
            let start = batch_ndx * self.batch_size;
            let end = (start + self.batch_size).min(self.dataset.len());
            return load_samples(self.dataset.as_ref(), start..end);
        }

        let worker = batch_ndx % self.receivers.len();
        self.receivers[worker]
            .recv()
            .map_err(|_| SegError::Dataset(format!("loader worker {worker} stopped early")))?
    }
}

impl<B: Backend, D: SegmentationDataset> Iterator for BatchIter<B, D> {
    type Item = SegResult<SegBatch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_batch >= self.batches {
            return None;
        }
        let batch_ndx = self.next_batch;
        self.next_batch += 1;

        Some(
            self
                .next_samples(batch_ndx)
                .and_then(|samples| SegBatch::from_samples(samples, &self.device))
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.batches - self.next_batch;
        (remaining, Some(remaining))
    }
}

impl<B: Backend, D: SegmentationDataset> ExactSizeIterator for BatchIter<B, D> {}
