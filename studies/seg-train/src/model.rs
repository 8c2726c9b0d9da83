use burn::{
    nn::{
        conv::{ Conv2d, Conv2dConfig },
        BatchNorm,
        BatchNormConfig,
        PaddingConfig2d,
        Relu,
    },
    prelude::*,
    tensor::activation::sigmoid,
};

/// What the training loop needs from a segmentation network.
///
/// `forward` maps `[N, C, H, W]` context slices to `[N, 1, H, W]` nodule
/// probabilities in `[0, 1]`.
pub trait SegmentationModel<B: Backend>: Module<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4>;

    fn name(&self) -> &'static str;
}

#[derive(Config, Debug)]
pub struct SegNetConfig {
    /// Number of CT slices fed to the network (`2 * context + 1`).
    pub in_channels: usize,
    #[config(default = 16)]
    pub width: usize,
    #[config(default = 3)]
    pub depth: usize,
}

impl SegNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SegNet<B> {
        SegNet::new(self, device)
    }
}

/// Small fully convolutional network: normalised input, a stack of 3x3
/// convolutions and a 1x1 head squashed by a sigmoid.
#[derive(Module, Debug)]
pub struct SegNet<B: Backend> {
    input_norm: BatchNorm<B, 2>,
    stem: Conv2d<B>,
    blocks: Vec<Conv2d<B>>,
    norms: Vec<BatchNorm<B, 2>>,
    head: Conv2d<B>,
    activation: Relu,
}

impl<B: Backend> SegNet<B> {
    pub fn new(config: &SegNetConfig, device: &B::Device) -> Self {
        let width = config.width.max(1);

        let input_norm = BatchNormConfig::new(config.in_channels).init(device);
        let stem = Conv2dConfig::new([config.in_channels, width], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        let mut blocks = Vec::with_capacity(config.depth);
        let mut norms = Vec::with_capacity(config.depth);
        for _ in 0..config.depth {
            blocks.push(
                Conv2dConfig::new([width, width], [3, 3])
                    .with_padding(PaddingConfig2d::Same)
                    .init(device)
            );
            norms.push(BatchNormConfig::new(width).init(device));
        }

        let head = Conv2dConfig::new([width, 1], [1, 1]).init(device);

        Self {
            input_norm,
            stem,
            blocks,
            norms,
            head,
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> SegmentationModel<B> for SegNet<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.input_norm.forward(input);
        let mut x = self.activation.forward(self.stem.forward(x));

        for (conv, norm) in self.blocks.iter().zip(self.norms.iter()) {
            x = self.activation.forward(norm.forward(conv.forward(x)));
        }

        sigmoid(self.head.forward(x))
    }

    fn name(&self) -> &'static str {
        "SegNet"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn keeps_spatial_shape_and_probability_range() {
        let device = Default::default();
        let model = SegNetConfig::new(7).with_width(4).with_depth(1).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [2, 7, 12, 12],
            Distribution::Normal(0.0, 300.0),
            &device
        );

        let output = model.forward(input);

        assert_eq!(output.dims(), [2, 1, 12, 12]);
        let values = output.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
