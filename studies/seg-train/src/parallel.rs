//! How a forward pass is spread over compute devices.
//!
//! The training loop always owns the base module; a [`ModelParallel`] strategy
//! only decides where replicas run. Checkpoints therefore never see a wrapper
//! and load the same way whatever strategy produced them.

use burn::prelude::*;

use crate::model::SegmentationModel;

pub trait ModelParallel<B: Backend> {
    fn forward<M: SegmentationModel<B>>(&self, model: &M, input: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Number of devices taking part in a forward pass.
    fn replicas(&self) -> usize;
}

/// Runs the model where its parameters live.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleDevice;

impl<B: Backend> ModelParallel<B> for SingleDevice {
    fn forward<M: SegmentationModel<B>>(&self, model: &M, input: Tensor<B, 4>) -> Tensor<B, 4> {
        model.forward(input)
    }

    fn replicas(&self) -> usize {
        1
    }
}

/// Splits every batch along its first dimension, runs one replica per device
/// and gathers the predictions back on the input's device.
///
/// Replicas are moved with `Module::to_device`, which keeps them attached to
/// the autodiff graph, so gradients land on the base module's parameters.
#[derive(Debug, Clone)]
pub struct DataParallel<D> {
    devices: Vec<D>,
}

impl<D> DataParallel<D> {
    pub fn new(devices: Vec<D>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[D] {
        &self.devices
    }
}

impl<B: Backend> ModelParallel<B> for DataParallel<B::Device> {
    fn forward<M: SegmentationModel<B>>(&self, model: &M, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let n = input.dims()[0];
        if self.devices.len() < 2 || n < 2 {
            return model.forward(input);
        }

        let home = input.device();
        let outputs = input
            .chunk(self.devices.len(), 0)
            .into_iter()
            .zip(self.devices.iter())
            .map(|(chunk, device)| {
                let replica = model.clone().to_device(device);
                replica.forward(chunk.to_device(device)).to_device(&home)
            })
            .collect();

        Tensor::cat(outputs, 0)
    }

    fn replicas(&self) -> usize {
        self.devices.len().max(1)
    }
}
