use std::{ fs::{ self, File }, sync::mpsc::{ self, Sender }, thread };

use anyhow::{ anyhow, Context, Result };
use burn::{ optim::{ momentum::MomentumConfig, SgdConfig }, prelude::Backend };
use clap::Parser;
use seg_train::{
    config::{ Augmentation, TrainArgs, TrainingConfig },
    data::{ DataLoader, SegmentationDataset },
    model::{ SegNet, SegNetConfig },
    parallel::{ DataParallel, ModelParallel, SingleDevice },
    run::RunIdentity,
    sink::{ DashboardSink, MetricsSink, RunWriter },
    synthetic::{ Split, SyntheticCtDataset },
    train::SegmentationTrainingApp,
    TrainAutodiffBackend,
    TrainBackend,
};
use ui::state::TrainingState;

type Device = <TrainBackend as Backend>::Device;

fn main() -> Result<()> {
    let config = TrainingConfig::from(TrainArgs::parse());
    let run = RunIdentity::new(config.tb_prefix.clone(), config.comment.clone());
    init_logger(&config, &run)?;

    if !config.dashboard {
        return train(config, run, None);
    }

    let (tx, rx) = mpsc::channel();
    let trainer = thread::spawn(move || train(config, run, Some(tx)));

    let dashboard = ui::run(rx);
    let trained = trainer.join().map_err(|_| anyhow!("training thread panicked"))?;
    dashboard.map_err(|e| anyhow!("dashboard failed: {e}"))?;
    trained
}

/// Logs to stderr, or to the run's log file while the dashboard owns the
/// terminal.
fn init_logger(config: &TrainingConfig, run: &RunIdentity) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if config.dashboard {
        let path = run.log_file(&config.runs_root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn train(config: TrainingConfig, run: RunIdentity, dashboard: Option<Sender<TrainingState>>) -> Result<()> {
    let device = Device::default();

    if config.devices > 1 {
        log::info!("Using {} devices.", config.devices);
        let parallel = DataParallel::new(devices(config.devices));
        run_training(config, run, dashboard, device, parallel)
    } else {
        run_training(config, run, dashboard, device, SingleDevice)
    }
}

#[cfg(not(feature = "wgpu"))]
fn devices(count: usize) -> Vec<Device> {
    vec![Device::default(); count]
}

#[cfg(feature = "wgpu")]
fn devices(count: usize) -> Vec<Device> {
    (0..count).map(burn_wgpu::WgpuDevice::DiscreteGpu).collect()
}

fn run_training<P>(
    config: TrainingConfig,
    run: RunIdentity,
    dashboard: Option<Sender<TrainingState>>,
    device: Device,
    parallel: P
) -> Result<()>
    where P: ModelParallel<TrainAutodiffBackend> + ModelParallel<TrainBackend>
{
    let replicas = <P as ModelParallel<TrainBackend>>::replicas(&parallel);
    let batch_size = config.batch_size * replicas;

    let train_ds = SyntheticCtDataset::new(&config.data, Split::Training, config.augmentation);
    let test_ds = SyntheticCtDataset::new(&config.data, Split::Validation, Augmentation::default());
    log::info!("{} training samples, {} validation samples", train_ds.len(), test_ds.len());
    let train_dl = DataLoader::new(train_ds, batch_size, config.num_workers);
    let test_dl = DataLoader::new(test_ds, batch_size, config.num_workers);

    let model: SegNet<TrainAutodiffBackend> = SegNetConfig::new(config.in_channels()).init(&device);
    let optimizer = SgdConfig::new()
        .with_momentum(
            Some(MomentumConfig::new().with_momentum(config.momentum).with_dampening(0.0))
        )
        .init::<TrainAutodiffBackend, SegNet<TrainAutodiffBackend>>();

    let mut sinks: Vec<Box<dyn MetricsSink + Send>> = vec![
        Box::new(RunWriter::new(run.clone(), config.runs_root.clone(), &config))
    ];
    if let Some(tx) = dashboard {
        sinks.push(Box::new(DashboardSink::new(tx, &run)));
    }

    let resume = config.resume.clone();
    let mut app = SegmentationTrainingApp::<TrainAutodiffBackend, _, _, _>::new(
        config,
        device,
        model,
        optimizer,
        parallel,
        run,
        sinks
    );
    if let Some(path) = resume {
        app = app.resume(&path).with_context(|| format!("resuming from {}", path.display()))?;
    }

    let best_score = app.main(&train_dl, &test_dl)?;
    log::info!("Finished training, best validation score {:.4}", best_score);

    Ok(())
}
