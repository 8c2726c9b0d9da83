pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod parallel;
pub mod run;
pub mod sink;
pub mod synthetic;
pub mod train;
pub mod utils;

use burn::backend::Autodiff;

#[cfg(not(feature = "wgpu"))]
pub type TrainBackend = burn::backend::NdArray<f32>;
#[cfg(feature = "wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu;

pub type TrainAutodiffBackend = Autodiff<TrainBackend>;

pub use error::{ SegError, SegResult };
