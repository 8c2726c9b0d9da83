use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

use crate::utils::dice::DEFAULT_DICE_EPSILON;

/// Amplitude of the additive noise augmentation, in Hounsfield units.
pub const NOISE_AUGMENTATION_HU: f32 = 25.0;

#[derive(Parser, Debug, Clone)]
#[command(name = "seg-train", about = "Train a nodule segmentation model on CT slices")]
pub struct TrainArgs {
    /// Batch size to use for training
    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,
    /// Number of worker threads for background data loading
    #[arg(long, default_value_t = 8)]
    pub num_workers: usize,
    /// Number of epochs to train for
    #[arg(long, default_value_t = 1)]
    pub epochs: usize,
    /// Augment the training data.
    #[arg(long)]
    pub augmented: bool,
    /// Augment the training data by randomly flipping the data left-right.
    #[arg(long)]
    pub augment_flip: bool,
    /// Augment the training data by randomly rotating the slices by quarter turns.
    #[arg(long)]
    pub augment_rotate: bool,
    /// Augment the training data by randomly adding noise to the data.
    #[arg(long)]
    pub augment_noise: bool,
    /// Data prefix to use for the run logs and checkpoints.
    #[arg(long, default_value = "p2ch12")]
    pub tb_prefix: String,
    /// Comment suffix for the run.
    #[arg(default_value = "none")]
    pub comment: String,
    /// SGD learning rate.
    #[arg(long, default_value_t = 0.001)]
    pub lr: f64,
    /// SGD momentum.
    #[arg(long, default_value_t = 0.99)]
    pub momentum: f64,
    /// Smoothing term of the dice loss.
    #[arg(long, default_value_t = DEFAULT_DICE_EPSILON)]
    pub dice_epsilon: f64,
    /// Number of compute devices to replicate the model over.
    #[arg(long, default_value_t = 1)]
    pub devices: usize,
    /// Root directory for checkpoints.
    #[arg(long, default_value = "data-unversioned/part2/models")]
    pub checkpoint_root: PathBuf,
    /// Root directory for scalar and image logs.
    #[arg(long, default_value = "runs")]
    pub runs_root: PathBuf,
    /// Number of preview images logged per data source and epoch.
    #[arg(long, default_value_t = 12)]
    pub preview_count: usize,
    /// CT slices on each side of the labelled slice.
    #[arg(long, default_value_t = 3)]
    pub context_slices: usize,
    /// Every n-th sample goes to the validation set.
    #[arg(long, default_value_t = 10)]
    pub test_stride: usize,
    /// Number of synthetic samples to generate.
    #[arg(long, default_value_t = 400)]
    pub samples: usize,
    /// Side length of the synthetic slices, in pixels.
    #[arg(long, default_value_t = 64)]
    pub image_size: usize,
    /// Seed of the synthetic dataset.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Checkpoint to resume training from.
    #[arg(long)]
    pub resume: Option<PathBuf>,
    /// Show the terminal dashboard while training.
    #[arg(long)]
    pub dashboard: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Augmentation {
    pub flip: bool,
    pub rotate: bool,
    /// Noise amplitude in Hounsfield units.
    pub noise: Option<f32>,
}

impl Augmentation {
    pub fn is_enabled(&self) -> bool {
        self.flip || self.rotate || self.noise.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyntheticConfig {
    pub samples: usize,
    pub image_size: usize,
    pub context_slices: usize,
    pub test_stride: usize,
    pub seed: u64,
}

/// Plain configuration record the training loop runs from.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    pub epochs: usize,
    pub augmentation: Augmentation,
    pub tb_prefix: String,
    pub comment: String,
    pub learning_rate: f64,
    pub momentum: f64,
    pub dice_epsilon: f64,
    pub devices: usize,
    pub checkpoint_root: PathBuf,
    pub runs_root: PathBuf,
    pub preview_count: usize,
    pub data: SyntheticConfig,
    pub resume: Option<PathBuf>,
    pub dashboard: bool,
}

impl From<TrainArgs> for TrainingConfig {
    fn from(args: TrainArgs) -> Self {
        let augmentation = Augmentation {
            flip: args.augmented || args.augment_flip,
            rotate: args.augmented || args.augment_rotate,
            noise: (args.augmented || args.augment_noise).then_some(NOISE_AUGMENTATION_HU),
        };

        TrainingConfig {
            batch_size: args.batch_size.max(1),
            num_workers: args.num_workers,
            epochs: args.epochs,
            augmentation,
            tb_prefix: args.tb_prefix,
            comment: args.comment,
            learning_rate: args.lr,
            momentum: args.momentum,
            dice_epsilon: args.dice_epsilon,
            devices: args.devices.max(1),
            checkpoint_root: args.checkpoint_root,
            runs_root: args.runs_root,
            preview_count: args.preview_count,
            data: SyntheticConfig {
                samples: args.samples,
                image_size: args.image_size.max(4),
                context_slices: args.context_slices,
                test_stride: args.test_stride.max(1),
                seed: args.seed,
            },
            resume: args.resume,
            dashboard: args.dashboard,
        }
    }
}

impl TrainingConfig {
    pub fn in_channels(&self) -> usize {
        self.data.context_slices * 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> TrainingConfig {
        let mut argv = vec!["seg-train"];
        argv.extend_from_slice(args);
        TrainArgs::parse_from(argv).into()
    }

    #[test]
    fn defaults_match_the_reference_run() {
        let config = parse(&[]);

        assert_eq!(config.batch_size, 16);
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.epochs, 1);
        assert_eq!(config.tb_prefix, "p2ch12");
        assert_eq!(config.comment, "none");
        assert_eq!(config.learning_rate, 0.001);
        assert_eq!(config.momentum, 0.99);
        assert_eq!(config.dice_epsilon, 1024.0);
        assert_eq!(config.in_channels(), 7);
        assert!(!config.augmentation.is_enabled());
    }

    #[test]
    fn augmented_enables_every_augmentation() {
        let config = parse(&["--augmented", "flipped-run"]);

        assert_eq!(config.comment, "flipped-run");
        assert_eq!(config.augmentation, Augmentation {
            flip: true,
            rotate: true,
            noise: Some(NOISE_AUGMENTATION_HU),
        });
    }

    #[test]
    fn single_augmentations_can_be_picked() {
        let config = parse(&["--augment-noise", "--epochs", "3"]);

        assert_eq!(config.epochs, 3);
        assert_eq!(config.augmentation, Augmentation {
            flip: false,
            rotate: false,
            noise: Some(NOISE_AUGMENTATION_HU),
        });
    }
}
