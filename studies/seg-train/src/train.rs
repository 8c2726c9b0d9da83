use std::path::Path;

use burn::{
    module::AutodiffModule,
    optim::{ GradientsParams, Optimizer },
    prelude::Backend,
    tensor::{ backend::AutodiffBackend, Tensor },
};

use image::RgbImage;

use crate::checkpoint::{ BestScore, CheckpointManager, CheckpointRecord };
use crate::config::TrainingConfig;
use crate::data::{ DataLoader, SegBatch, SegmentationDataset };
use crate::error::{ SegError, SegResult };
use crate::metrics::{ BatchStats, MetricsArray, MetricsBuffer, SegMetrics };
use crate::model::SegmentationModel;
use crate::parallel::ModelParallel;
use crate::run::{ RunIdentity, RunMode };
use crate::sink::MetricsSink;
use crate::utils::dice::{ sum_per_sample, DiceLoss };
use crate::utils::images::SlicePreview;
use crate::utils::progress::EnumerateWithEstimate;

/// Runs the model on one batch and records its statistics in `metrics`.
///
/// The batch fills columns `batch_ndx * batch_size ..` of the buffer. Only the
/// returned mean dice loss carries gradients; everything written to `metrics`
/// is computed from detached, thresholded predictions.
pub fn compute_batch_loss<B, M, P>(
    model: &M,
    parallel: &P,
    dice: &DiceLoss,
    batch_ndx: usize,
    batch: SegBatch<B>,
    batch_size: usize,
    metrics: &mut MetricsBuffer<B>
) -> SegResult<Tensor<B, 1>>
    where B: Backend, M: SegmentationModel<B>, P: ModelParallel<B>
{
    let start_ndx = batch_ndx * batch_size;
    let labels = batch.labels_tensor();

    let prediction = parallel.forward(model, batch.input);
    let dice_loss = dice.forward(batch.label.clone(), prediction.clone())?;

    let prediction_bool = prediction.detach().greater_elem(0.5).float();
    let label = batch.label;
    let not_label = complement(label.clone());

    let mal_prediction = prediction_bool.clone() * complement(batch.benign);
    let mal_loss = dice.forward(batch.malignant.clone(), mal_prediction.clone())?;

    let stats = BatchStats {
        labels,
        loss: dice_loss.clone().detach(),
        mal_loss,
        mal_tp: sum_per_sample(batch.malignant.clone() * mal_prediction.clone()),
        mal_fn: sum_per_sample(batch.malignant * complement(mal_prediction.clone())),
        mal_fp: sum_per_sample(not_label.clone() * mal_prediction),
        all_tp: sum_per_sample(label.clone() * prediction_bool.clone()),
        all_fn: sum_per_sample(label * complement(prediction_bool.clone())),
        all_fp: sum_per_sample(not_label * prediction_bool),
    };
    metrics.record(start_ndx, stats)?;

    Ok(dice_loss.mean())
}

fn complement<B: Backend>(mask: Tensor<B, 4>) -> Tensor<B, 4> {
    mask.neg().add_scalar(1.0)
}

/// Epoch loop of the segmentation run: train, evaluate, log, checkpoint.
///
/// The app always owns the bare model; `parallel` only decides how a forward
/// pass is spread over devices.
pub struct SegmentationTrainingApp<B: AutodiffBackend, M, O, P> {
    config: TrainingConfig,
    device: B::Device,
    model: M,
    optimizer: O,
    parallel: P,
    dice: DiceLoss,
    run: RunIdentity,
    checkpoints: CheckpointManager,
    sinks: Vec<Box<dyn MetricsSink + Send>>,
    best: BestScore,
    start_epoch: usize,
}

impl<B, M, O, P> SegmentationTrainingApp<B, M, O, P>
    where
        B: AutodiffBackend,
        M: SegmentationModel<B> + AutodiffModule<B>,
        M::InnerModule: SegmentationModel<B::InnerBackend>,
        O: Optimizer<M, B>,
        P: ModelParallel<B> + ModelParallel<B::InnerBackend>
{
    pub fn new(
        config: TrainingConfig,
        device: B::Device,
        model: M,
        optimizer: O,
        parallel: P,
        run: RunIdentity,
        sinks: Vec<Box<dyn MetricsSink + Send>>
    ) -> Self {
        SegmentationTrainingApp {
            dice: DiceLoss::new(config.dice_epsilon),
            checkpoints: CheckpointManager::new(config.checkpoint_root.clone()),
            config,
            device,
            model,
            optimizer,
            parallel,
            run,
            sinks,
            best: BestScore::default(),
            start_epoch: 1,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn run_identity(&self) -> &RunIdentity {
        &self.run
    }

    pub fn best_score(&self) -> f64 {
        self.best.value()
    }

    /// Continues from a checkpoint: weights, optimizer state, epoch and
    /// sample count. The run keeps its own timestamp.
    pub fn resume(mut self, path: &Path) -> SegResult<Self> {
        let record: CheckpointRecord<M::Record, O::Record> = CheckpointManager::load::<B, _, _>(
            path,
            &self.device
        )?;

        if record.model_name != self.model.name() {
            log::warn!(
                "Checkpoint {} holds a {} model, loading it into {}",
                path.display(),
                record.model_name,
                self.model.name()
            );
        }

        self.model = self.model.load_record(record.model_state);
        self.optimizer = self.optimizer.load_record(record.optimizer_state);
        self.start_epoch = record.epoch + 1;
        self.run.total_training_samples = record.total_training_samples;

        log::info!(
            "Resumed from {} at epoch {} with {} training samples",
            path.display(),
            record.epoch,
            record.total_training_samples
        );
        Ok(self)
    }

    fn replicas(&self) -> usize {
        <P as ModelParallel<B>>::replicas(&self.parallel)
    }

    /// Runs every remaining epoch and returns the best validation score.
    pub fn main<TD, VD>(&mut self, train_dl: &DataLoader<TD>, test_dl: &DataLoader<VD>) -> SegResult<f64>
        where TD: SegmentationDataset, VD: SegmentationDataset
    {
        log::info!("Starting SegmentationTrainingApp, {:?}", self.config);

        let epochs = self.config.epochs;
        for epoch_ndx in self.start_epoch..=epochs {
            log::info!(
                "Epoch {} of {}, {}/{} batches of size {}*{}",
                epoch_ndx,
                epochs,
                train_dl.len_batch(),
                test_dl.len_batch(),
                self.config.batch_size,
                self.replicas()
            );
            for sink in self.sinks.iter_mut() {
                sink.epoch_started(epoch_ndx, epochs, train_dl.batch_size());
            }

            let training_metrics = self.do_training(epoch_ndx, train_dl)?;
            self.log_metrics(epoch_ndx, RunMode::Training, &training_metrics)?;
            self.log_images(epoch_ndx, RunMode::Training, train_dl);
            self.log_images(epoch_ndx, RunMode::Validation, test_dl);

            let testing_metrics = self.do_testing(epoch_ndx, test_dl)?;
            let score = self.log_metrics(epoch_ndx, RunMode::Validation, &testing_metrics)?;

            let is_best = self.best.promote(score);
            if is_best {
                for sink in self.sinks.iter_mut() {
                    sink.best_score(epoch_ndx, score);
                }
            }
            self.save_model("seg", epoch_ndx, is_best)?;
        }

        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.finish() {
                log::warn!("Failed to close a metrics sink: {}", e);
            }
        }

        Ok(self.best.value())
    }

    /// One optimisation pass; returns the epoch's metrics on the host.
    pub fn do_training<D: SegmentationDataset>(
        &mut self,
        epoch_ndx: usize,
        train_dl: &DataLoader<D>
    ) -> SegResult<MetricsArray> {
        let mut metrics = MetricsBuffer::<B>::new(train_dl.len(), &self.device);
        let batches = train_dl.len_batch();

        let batch_iter = EnumerateWithEstimate::new(
            train_dl.iter::<B>(&self.device),
            format!("E{} Training", epoch_ndx),
            batches,
            train_dl.num_workers()
        );
        for (batch_ndx, batch) in batch_iter {
            let loss = compute_batch_loss(
                &self.model,
                &self.parallel,
                &self.dice,
                batch_ndx,
                batch?,
                train_dl.batch_size(),
                &mut metrics
            )?;

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self.optimizer.step(self.config.learning_rate, self.model.clone(), grads);

            for sink in self.sinks.iter_mut() {
                sink.batch_progress(RunMode::Training, batch_ndx, batches);
            }
        }

        self.run.total_training_samples += metrics.num_samples() as u64;

        metrics.into_host()
    }

    /// One evaluation pass with the inference version of the model.
    pub fn do_testing<D: SegmentationDataset>(
        &mut self,
        epoch_ndx: usize,
        test_dl: &DataLoader<D>
    ) -> SegResult<MetricsArray> {
        let model = self.model.valid();
        let mut metrics = MetricsBuffer::<B::InnerBackend>::new(test_dl.len(), &self.device);
        let batches = test_dl.len_batch();

        let batch_iter = EnumerateWithEstimate::new(
            test_dl.iter::<B::InnerBackend>(&self.device),
            format!("E{} Testing ", epoch_ndx),
            batches,
            test_dl.num_workers()
        );
        for (batch_ndx, batch) in batch_iter {
            compute_batch_loss(
                &model,
                &self.parallel,
                &self.dice,
                batch_ndx,
                batch?,
                test_dl.batch_size(),
                &mut metrics
            )?;

            for sink in self.sinks.iter_mut() {
                sink.batch_progress(RunMode::Validation, batch_ndx, batches);
            }
        }

        metrics.into_host()
    }

    /// Reduces an epoch's metrics, reports them and returns the score.
    pub fn log_metrics(
        &mut self,
        epoch_ndx: usize,
        mode: RunMode,
        metrics: &MetricsArray
    ) -> SegResult<f64> {
        log::info!("E{} SegmentationTrainingApp", epoch_ndx);

        let reduced = SegMetrics::from_array(mode.as_str(), metrics)?;

        log::info!(
            "E{} {:8} {:.4} loss, {:.4} precision, {:.4} recall, {:.4} f1 score",
            epoch_ndx,
            mode.as_str(),
            reduced.loss_all,
            reduced.precision,
            reduced.recall,
            reduced.f1_score
        );
        log::info!(
            "E{} {:8} {:.4} loss, {:5.1}% correct ({} of {})",
            epoch_ndx,
            format!("{}_all", mode),
            reduced.loss_all,
            reduced.correct_all,
            reduced.all_correct,
            reduced.all_label
        );
        log::info!(
            "E{} {:8} {:.4} loss, {:5.1}% correct ({} of {})",
            epoch_ndx,
            format!("{}_mal", mode),
            reduced.loss_mal,
            reduced.correct_mal,
            reduced.mal_correct,
            reduced.mal_label
        );

        let step = self.run.total_training_samples;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.add_metrics(mode, epoch_ndx, &reduced, step) {
                log::warn!("Failed to log {} metrics: {}", mode, e);
            }
        }

        Ok(reduced.score)
    }

    /// Renders prediction overlays for a few evenly spaced samples. Failures
    /// are logged and skipped.
    pub fn log_images<D: SegmentationDataset>(
        &mut self,
        epoch_ndx: usize,
        mode: RunMode,
        dl: &DataLoader<D>
    ) {
        let total = dl.len();
        let count = self.config.preview_count.min(total);
        if count == 0 || self.sinks.is_empty() {
            return;
        }

        let model = self.model.valid();
        let step = self.run.total_training_samples;

        for i in 0..count {
            let ndx = (i * total) / count;
            if let Err(e) = self.log_image(&model, epoch_ndx, mode, dl.dataset(), i, ndx, step) {
                log::warn!("Failed to render {} preview {}: {}", mode, i, e);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_image<D: SegmentationDataset>(
        &mut self,
        model: &M::InnerModule,
        epoch_ndx: usize,
        mode: RunMode,
        dataset: &D,
        i: usize,
        ndx: usize,
        step: u64
    ) -> SegResult<()> {
        let sample = dataset.get_preview(ndx)?;
        let batch = SegBatch::<B::InnerBackend>::from_samples(vec![sample.clone()], &self.device)?;
        let prediction = model
            .forward(batch.input)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| SegError::TensorData(format!("{e:?}")))?;

        let preview = SlicePreview::from_sample(&sample);
        let image = preview.prediction_image(&prediction)?;
        self.publish_image(mode, &format!("{}/{}_prediction_{}", mode, i, sample.slice_ndx), &image, step);

        if epoch_ndx == 1 {
            let image = preview.label_image();
            self.publish_image(mode, &format!("{}/{}_label_{}", mode, i, sample.slice_ndx), &image, step);
        }

        Ok(())
    }

    fn publish_image(&mut self, mode: RunMode, tag: &str, image: &RgbImage, step: u64) {
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.add_image(mode, tag, image, step) {
                log::warn!("Failed to log image {}: {}", tag, e);
            }
        }
    }

    /// Writes a checkpoint for the current sample count, and the `best` copy
    /// when `is_best`.
    pub fn save_model(&self, type_str: &str, epoch_ndx: usize, is_best: bool) -> SegResult<()> {
        self.checkpoints.save::<B, _, _>(&self.run, type_str, epoch_ndx, &self.model, &self.optimizer, is_best)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ label_code, SegSample };
    use crate::metrics::{
        METRICS_AFN_NDX,
        METRICS_AFP_NDX,
        METRICS_ATP_NDX,
        METRICS_LABEL_NDX,
        METRICS_MFP_NDX,
        METRICS_MTP_NDX,
    };
    use crate::config::TrainArgs;
    use crate::parallel::SingleDevice;
    use burn::backend::{ Autodiff, NdArray };
    use burn::module::Module;
    use burn::nn::Relu;
    use burn::optim::SgdConfig;
    use clap::Parser;

    type TestBackend = NdArray<f32>;

    /// Predicts whatever the first input channel holds.
    #[derive(Module, Clone, Debug)]
    struct FirstChannel {
        activation: Relu,
    }

    impl<B: Backend> SegmentationModel<B> for FirstChannel {
        fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
            let [n, _, h, w] = input.dims();
            input.slice([0..n, 0..1, 0..h, 0..w])
        }

        fn name(&self) -> &'static str {
            "FirstChannel"
        }
    }

    const SIDE: usize = 4;

    /// A sample whose only input channel is its nodule mask.
    fn sample(has_nodule: bool, is_malignant: bool) -> SegSample {
        let plane = SIDE * SIDE;
        let mut nodule = vec![0.0; plane];
        if has_nodule {
            nodule[5] = 1.0;
            nodule[6] = 1.0;
        }
        let empty = vec![0.0; plane];
        let (benign, malignant) = if is_malignant {
            (empty.clone(), nodule.clone())
        } else {
            (nodule.clone(), empty)
        };

        SegSample {
            ct: nodule.clone(),
            channels: 1,
            height: SIDE,
            width: SIDE,
            nodule,
            benign,
            malignant,
            label: label_code(has_nodule, is_malignant),
            series_uid: "uid".to_string(),
            slice_ndx: 0,
        }
    }

    fn run_epoch(samples: Vec<SegSample>) -> MetricsArray {
        let device = Default::default();
        let model = FirstChannel { activation: Relu::new() };
        let mut metrics = MetricsBuffer::<TestBackend>::new(samples.len(), &device);
        let batch = SegBatch::from_samples(samples.clone(), &device).unwrap();

        let loss = compute_batch_loss(
            &model,
            &SingleDevice,
            &DiceLoss::default(),
            0,
            batch,
            samples.len(),
            &mut metrics
        ).unwrap();
        assert_eq!(loss.dims(), [1]);

        metrics.into_host().unwrap()
    }

    #[test]
    fn empty_labels_score_one() {
        let metrics = run_epoch(vec![sample(false, false); 4]);
        let reduced = SegMetrics::from_array("tst", &metrics).unwrap();

        assert_eq!(reduced.precision, 0.0);
        assert_eq!(reduced.recall, 0.0);
        assert_eq!(reduced.f1_score, 0.0);
        assert!(reduced.score <= 1.0 && reduced.score > 0.99, "{}", reduced.score);
    }

    #[test]
    fn perfect_prediction_scores_close_to_two() {
        let metrics = run_epoch(vec![sample(true, true), sample(true, false)]);
        let reduced = SegMetrics::from_array("tst", &metrics).unwrap();

        assert_eq!(metrics.row(METRICS_LABEL_NDX).to_vec(), vec![3.0, 2.0]);
        assert_eq!(metrics.row(METRICS_ATP_NDX).to_vec(), vec![2.0, 2.0]);
        assert_eq!(metrics.row(METRICS_MTP_NDX).to_vec(), vec![2.0, 0.0]);
        assert_eq!(metrics.row(METRICS_MFP_NDX).to_vec(), vec![0.0, 0.0]);
        assert_eq!(reduced.f1_score, 1.0);
        assert!((reduced.score - 1.99).abs() < 1e-6, "{}", reduced.score);
    }

    #[test]
    fn batches_land_at_their_offset() {
        let device = Default::default();
        let model = FirstChannel { activation: Relu::new() };
        let mut metrics = MetricsBuffer::<TestBackend>::new(4, &device);

        for batch_ndx in 0..2 {
            let samples = vec![sample(true, batch_ndx == 1), sample(false, false)];
            let batch = SegBatch::from_samples(samples, &device).unwrap();
            compute_batch_loss(&model, &SingleDevice, &DiceLoss::default(), batch_ndx, batch, 2, &mut metrics).unwrap();
        }

        let metrics = metrics.into_host().unwrap();
        assert_eq!(metrics.row(METRICS_LABEL_NDX).to_vec(), vec![2.0, 0.0, 3.0, 0.0]);
    }

    #[test]
    fn batch_past_the_buffer_is_rejected() {
        let device = Default::default();
        let model = FirstChannel { activation: Relu::new() };
        let mut metrics = MetricsBuffer::<TestBackend>::new(2, &device);
        let batch = SegBatch::from_samples(vec![sample(false, false); 2], &device).unwrap();

        let result = compute_batch_loss(&model, &SingleDevice, &DiceLoss::default(), 1, batch, 2, &mut metrics);

        assert!(matches!(result, Err(SegError::ColumnRange { start: 2, end: 4, total: 2 })));
    }

    /// Even samples hold a nodule on pixels 5 and 6 and predict pixels 6 and 7;
    /// odd samples are empty and predict pixel 0.
    fn offset_sample(ndx: usize) -> SegSample {
        let has_nodule = ndx % 2 == 0;
        let mut sample = sample(has_nodule, ndx % 4 == 0);
        sample.ct = vec![0.0; SIDE * SIDE];
        if has_nodule {
            sample.ct[6] = 1.0;
            sample.ct[7] = 1.0;
        } else {
            sample.ct[0] = 1.0;
        }
        sample
    }

    struct FixedDataset(Vec<SegSample>);

    impl SegmentationDataset for FixedDataset {
        fn len(&self) -> usize {
            self.0.len()
        }

        fn get(&self, ndx: usize) -> SegResult<SegSample> {
            self.0.get(ndx).cloned().ok_or_else(|| SegError::Dataset(format!("no sample {ndx}")))
        }
    }

    #[test]
    fn testing_epoch_fills_every_column() {
        type TestAutodiff = Autodiff<TestBackend>;

        let config = TrainingConfig::from(TrainArgs::parse_from(["seg-train", "--batch-size", "4"]));
        let mut app = SegmentationTrainingApp::<TestAutodiff, _, _, _>::new(
            config,
            Default::default(),
            FirstChannel { activation: Relu::new() },
            SgdConfig::new().init::<TestAutodiff, FirstChannel>(),
            SingleDevice,
            RunIdentity::with_time("t", "tag", "none"),
            Vec::new()
        );
        let test_dl = DataLoader::new(FixedDataset((0..10).map(offset_sample).collect()), 4, 2);
        assert_eq!(test_dl.len_batch(), 3);

        let metrics = app.do_testing(1, &test_dl).unwrap();

        let labels: Vec<f32> = (0..10).map(|ndx| label_code(ndx % 2 == 0, ndx % 4 == 0) as f32).collect();
        let hits: Vec<f32> = (0..10).map(|ndx| if ndx % 2 == 0 { 1.0 } else { 0.0 }).collect();
        assert_eq!(metrics.num_samples(), 10);
        assert_eq!(metrics.row(METRICS_LABEL_NDX).to_vec(), labels);
        assert_eq!(metrics.row(METRICS_ATP_NDX).to_vec(), hits);
        assert_eq!(metrics.row(METRICS_AFN_NDX).to_vec(), hits);
        assert_eq!(metrics.row(METRICS_AFP_NDX).to_vec(), vec![1.0; 10]);

        // 5 true positives, 5 false negatives, 10 false positives
        let reduced = SegMetrics::from_array("tst", &metrics).unwrap();
        assert!((reduced.precision - 5.0 / 15.0).abs() < 1e-9, "{}", reduced.precision);
        assert!((reduced.recall - 0.5).abs() < 1e-9, "{}", reduced.recall);
        assert!((reduced.correct_all - 50.0).abs() < 1e-9, "{}", reduced.correct_all);
    }
}
