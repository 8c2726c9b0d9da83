//! Model and optimizer checkpoints keyed by run identity.

use std::{ fs, path::{ Path, PathBuf } };

use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    record::{ FullPrecisionSettings, NamedMpkBytesRecorder, PrecisionSettings, Record, Recorder },
    tensor::backend::{ AutodiffBackend, Backend },
};
use serde::{ Deserialize, Serialize };

use crate::error::{ SegError, SegResult };
use crate::model::SegmentationModel;
use crate::run::RunIdentity;

/// Everything needed to continue a run: weights, optimizer state and the
/// position of the run when it was saved.
#[derive(Debug, Clone)]
pub struct CheckpointRecord<MR, OR> {
    pub model_state: MR,
    pub model_name: String,
    pub optimizer_state: OR,
    pub optimizer_name: String,
    pub epoch: usize,
    pub total_training_samples: u64,
}

#[derive(Serialize, Deserialize)]
pub struct CheckpointItem<MI, OI> {
    model_state: MI,
    model_name: String,
    optimizer_state: OI,
    optimizer_name: String,
    epoch: usize,
    total_training_samples: u64,
}

impl<B, MR, OR> Record<B> for CheckpointRecord<MR, OR>
    where B: Backend, MR: Record<B>, OR: Record<B>
{
    type Item<S: PrecisionSettings> = CheckpointItem<MR::Item<S>, OR::Item<S>>;

    fn into_item<S: PrecisionSettings>(self) -> Self::Item<S> {
        CheckpointItem {
            model_state: self.model_state.into_item(),
            model_name: self.model_name,
            optimizer_state: self.optimizer_state.into_item(),
            optimizer_name: self.optimizer_name,
            epoch: self.epoch,
            total_training_samples: self.total_training_samples,
        }
    }

    fn from_item<S: PrecisionSettings>(item: Self::Item<S>, device: &B::Device) -> Self {
        CheckpointRecord {
            model_state: MR::from_item(item.model_state, device),
            model_name: item.model_name,
            optimizer_state: OR::from_item(item.optimizer_state, device),
            optimizer_name: item.optimizer_name,
            epoch: item.epoch,
            total_training_samples: item.total_training_samples,
        }
    }
}

type CheckpointRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Writes checkpoints below `{root}/{tag}/`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CheckpointManager { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Saves the state under the run's current sample count and, when
    /// `is_best`, under the `best` name too. Returns the periodic path.
    pub fn save<B, M, O>(
        &self,
        run: &RunIdentity,
        type_str: &str,
        epoch: usize,
        model: &M,
        optimizer: &O,
        is_best: bool
    ) -> SegResult<PathBuf>
        where B: AutodiffBackend, M: SegmentationModel<B> + AutodiffModule<B>, O: Optimizer<M, B>
    {
        let file_path = run.checkpoint_path(
            &self.root,
            type_str,
            &run.total_training_samples.to_string()
        );
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).map_err(|e| SegError::io(parent, e))?;
        }

        let record = CheckpointRecord {
            model_state: model.clone().into_record(),
            model_name: model.name().to_string(),
            optimizer_state: optimizer.to_record(),
            optimizer_name: short_type_name::<O>().to_string(),
            epoch,
            total_training_samples: run.total_training_samples,
        };
        let bytes = Recorder::<B>::record(&CheckpointRecorder::default(), record, ())
            .map_err(|e| SegError::Checkpoint {
                path: file_path.clone(),
                msg: format!("{e:?}"),
            })?;

        fs::write(&file_path, &bytes).map_err(|e| SegError::io(&file_path, e))?;
        log::debug!("Saved model params to {}", file_path.display());

        if is_best {
            let best_path = run.checkpoint_path(&self.root, type_str, "best");
            fs::write(&best_path, &bytes).map_err(|e| SegError::io(&best_path, e))?;
            log::debug!("Saved model params to {}", best_path.display());
        }

        Ok(file_path)
    }

    /// Reads a checkpoint written by [`CheckpointManager::save`].
    pub fn load<B, MR, OR>(path: &Path, device: &B::Device) -> SegResult<CheckpointRecord<MR, OR>>
        where B: Backend, MR: Record<B>, OR: Record<B>
    {
        let bytes = fs::read(path).map_err(|e| SegError::io(path, e))?;

        Recorder::<B>::load(&CheckpointRecorder::default(), bytes, device).map_err(|e| {
            SegError::Checkpoint {
                path: path.to_path_buf(),
                msg: format!("{e:?}"),
            }
        })
    }
}

/// Highest validation score seen so far in a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestScore(f64);

impl Default for BestScore {
    fn default() -> Self {
        BestScore(0.0)
    }
}

impl BestScore {
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Records `score` and reports whether it ties or beats the best so far.
    pub fn promote(&mut self, score: f64) -> bool {
        if score >= self.0 {
            self.0 = score;
            return true;
        }
        false
    }
}

/// Last path segment of a type name; optimizer adaptors are named after the
/// optimizer they wrap (`OptimizerAdaptor<Sgd<..>, ..>` is `Sgd`).
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let (base, params) = full.split_once('<').unwrap_or((full, ""));
    let base = base.rsplit("::").next().unwrap_or(base);
    if base == "OptimizerAdaptor" {
        let inner = params.split(['<', ',']).next().unwrap_or(params);
        return inner.rsplit("::").next().unwrap_or(base);
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ SegNet, SegNetConfig };
    use crate::parallel::{ DataParallel, ModelParallel, SingleDevice };
    use burn::backend::{ ndarray::NdArrayDevice, Autodiff, NdArray };
    use burn::optim::{ adaptor::OptimizerAdaptor, momentum::MomentumConfig, GradientsParams, Sgd, SgdConfig };
    use burn::prelude::*;
    use burn::tensor::Distribution;
    use tempfile::tempdir;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;
    type TestModel = SegNet<TestAutodiffBackend>;
    type TestOptimizer = OptimizerAdaptor<Sgd<TestBackend>, TestModel, TestAutodiffBackend>;
    type TestRecord = CheckpointRecord<
        <TestModel as Module<TestAutodiffBackend>>::Record,
        <TestOptimizer as Optimizer<TestModel, TestAutodiffBackend>>::Record
    >;

    fn sgd() -> TestOptimizer {
        SgdConfig::new()
            .with_momentum(Some(MomentumConfig::new().with_momentum(0.99).with_dampening(0.0)))
            .init()
    }

    fn load(path: &Path) -> TestRecord {
        CheckpointManager::load::<TestAutodiffBackend, _, _>(path, &NdArrayDevice::Cpu).unwrap()
    }

    fn model(device: &NdArrayDevice) -> TestModel {
        SegNetConfig::new(3).with_width(4).with_depth(1).init(device)
    }

    fn step<P, O>(
        parallel: &P,
        model: TestModel,
        optimizer: &mut O,
        input: Tensor<TestAutodiffBackend, 4>
    ) -> TestModel
        where P: ModelParallel<TestAutodiffBackend>, O: Optimizer<TestModel, TestAutodiffBackend>
    {
        let loss = parallel.forward(&model, input).mean();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        optimizer.step(0.01, model, grads)
    }

    fn eval_output(model: &TestModel, input: &Tensor<TestAutodiffBackend, 4>) -> Vec<f32> {
        model.valid().forward(input.clone().inner()).into_data().to_vec::<f32>().unwrap()
    }

    fn assert_round_trip<P: ModelParallel<TestAutodiffBackend>>(parallel: P) {
        let device = NdArrayDevice::Cpu;
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let mut run = RunIdentity::with_time("2024-01-02_03.04.05", "tag", "none");
        run.total_training_samples = 8;

        let input = Tensor::<TestAutodiffBackend, 4>::random(
            [4, 3, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device
        );
        let mut optimizer = sgd();
        let trained = step(&parallel, model(&device), &mut optimizer, input.clone());

        let path = manager.save(&run, "seg", 1, &trained, &optimizer, false).unwrap();
        assert!(path.ends_with("tag/seg_2024-01-02_03.04.05_none.8.state"));

        let record = load(&path);
        assert_eq!(record.model_name, "SegNet");
        assert_eq!(record.optimizer_name, "Sgd");
        assert_eq!(record.epoch, 1);
        assert_eq!(record.total_training_samples, 8);

        let restored = model(&device).load_record(record.model_state);
        let mut restored_optimizer = sgd().load_record(record.optimizer_state);
        assert_eq!(eval_output(&trained, &input), eval_output(&restored, &input));

        // Momentum state must survive too: one more step diverges otherwise.
        let continued = step(&parallel, trained, &mut optimizer, input.clone());
        let resumed = step(&parallel, restored, &mut restored_optimizer, input.clone());
        for (a, b) in eval_output(&continued, &input).iter().zip(eval_output(&resumed, &input).iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn round_trip_restores_model_and_optimizer() {
        assert_round_trip(SingleDevice);
    }

    #[test]
    fn round_trip_is_independent_of_data_parallel_wrapping() {
        assert_round_trip(DataParallel::new(vec![NdArrayDevice::Cpu, NdArrayDevice::Cpu]));
    }

    #[test]
    fn best_file_keeps_the_best_epoch() {
        let device = NdArrayDevice::Cpu;
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let mut run = RunIdentity::with_time("t", "tag", "c");
        let model = model(&device);
        let optimizer = sgd();
        let mut best = BestScore::default();

        for (epoch, score) in [(1, 0.8), (2, 0.75)] {
            run.total_training_samples = epoch as u64 * 10;
            let is_best = best.promote(score);
            manager.save(&run, "seg", epoch, &model, &optimizer, is_best).unwrap();
        }

        let best_path = run.checkpoint_path(dir.path(), "seg", "best");
        let record = load(&best_path);
        assert_eq!(record.epoch, 1);
        assert_eq!(record.total_training_samples, 10);
        assert!(run.checkpoint_path(dir.path(), "seg", "10").exists());
        assert!(run.checkpoint_path(dir.path(), "seg", "20").exists());
        assert_eq!(best.value(), 0.8);
    }

    #[test]
    fn ties_are_promoted() {
        let mut best = BestScore::default();

        assert!(best.promote(0.99));
        assert!(best.promote(0.99));
        assert!(!best.promote(0.5));
        assert_eq!(best.value(), 0.99);
    }

    #[test]
    fn missing_checkpoint_is_an_io_error() {
        let result = CheckpointManager::load::<TestBackend, (), ()>(
            Path::new("/nonexistent/seg.best.state"),
            &NdArrayDevice::Cpu
        );

        assert!(matches!(result, Err(SegError::Io { .. })));
    }
}
