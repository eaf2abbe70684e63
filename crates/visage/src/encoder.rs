//! The trainable encoder: images in, face parameters out.
//!
//! A compact residual backbone regresses the packed coarse parameter vector
//! through a single linear head (the packed layout is split by
//! [`FaceParameters::split`]). A second backbone of the same shape regresses
//! the detail coefficients; it stays frozen until the detail stage.

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::tensor::{backend::Backend, Tensor};

use crate::error::Error;
use crate::params::{FaceDims, FaceParameters};

#[derive(Config, Debug)]
pub struct EncoderConfig {
    /// Expected input resolution (square images).
    #[config(default = 224)]
    pub resolution: usize,
    /// Channel width of the first stage; later stages double it.
    #[config(default = 32)]
    pub base_channels: usize,
    /// Residual blocks per stage.
    #[config(default = 2)]
    pub blocks_per_stage: usize,
}

impl EncoderConfig {
    /// Builds the full encoder (coarse + detail towers) for the given
    /// parameter dimensionalities.
    pub fn init<B: Backend>(&self, dims: &FaceDims, device: &B::Device) -> FaceEncoder<B> {
        let coarse_backbone = self.backbone(device);
        let detail_backbone = self.backbone(device);
        let features = coarse_backbone.out_features;

        FaceEncoder {
            coarse: CoarseTower {
                backbone: coarse_backbone,
                head: LinearConfig::new(features, dims.coarse_total()).init(device),
            },
            detail: DetailTower {
                backbone: detail_backbone,
                head: LinearConfig::new(features, dims.detail).init(device),
            },
            resolution: Ignored(self.resolution),
            dims: Ignored(dims.clone()),
        }
    }

    fn backbone<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let c = self.base_channels;
        let mut blocks = Vec::new();
        let mut channels = c;
        for stage in 0..4 {
            let out = c << stage;
            for block in 0..self.blocks_per_stage {
                // First block of stages 1..=3 downsamples.
                let stride = if stage > 0 && block == 0 { 2 } else { 1 };
                blocks.push(ResidualBlock::new(channels, out, stride, device));
                channels = out;
            }
        }

        Backbone {
            stem: Conv2dConfig::new([3, c], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            stem_norm: norm(c, device),
            stem_pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            blocks,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            activation: Relu::new(),
            out_features: channels,
        }
    }
}

/// Group normalization keeps the encoder free of batch statistics, so eval
/// outputs are bit-reproducible and skipped steps leave no trace.
fn norm<B: Backend>(channels: usize, device: &B::Device) -> GroupNorm<B> {
    let groups = if channels % 8 == 0 { 8 } else { 1 };
    GroupNormConfig::new(groups, channels).init(device)
}

#[derive(Module, Debug)]
struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: GroupNorm<B>,
    conv2: Conv2d<B>,
    norm2: GroupNorm<B>,
    downsample: Option<Downsample<B>>,
    activation: Relu,
}

#[derive(Module, Debug)]
struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    norm: GroupNorm<B>,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(channels_in: usize, channels_out: usize, stride: usize, device: &B::Device) -> Self {
        let downsample = (stride != 1 || channels_in != channels_out).then(|| Downsample {
            conv: Conv2dConfig::new([channels_in, channels_out], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            norm: norm(channels_out, device),
        });

        Self {
            conv1: Conv2dConfig::new([channels_in, channels_out], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            norm1: norm(channels_out, device),
            conv2: Conv2dConfig::new([channels_out, channels_out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            norm2: norm(channels_out, device),
            downsample,
            activation: Relu::new(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = match &self.downsample {
            Some(down) => down.norm.forward(down.conv.forward(input.clone())),
            None => input.clone(),
        };
        let x = self.activation.forward(self.norm1.forward(self.conv1.forward(input)));
        let x = self.norm2.forward(self.conv2.forward(x));
        self.activation.forward(x + shortcut)
    }
}

#[derive(Module, Debug)]
struct Backbone<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: GroupNorm<B>,
    stem_pool: MaxPool2d,
    blocks: Vec<ResidualBlock<B>>,
    pool: AdaptiveAvgPool2d,
    activation: Relu,
    out_features: usize,
}

impl<B: Backend> Backbone<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(images);
        let x = self.activation.forward(self.stem_norm.forward(x));
        let mut x = self.stem_pool.forward(x);
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.pool.forward(x).flatten(1, 3)
    }
}

/// Coarse tower: backbone + one packed linear head.
#[derive(Module, Debug)]
pub struct CoarseTower<B: Backend> {
    backbone: Backbone<B>,
    head: Linear<B>,
}

/// Detail tower, structurally identical but regressing only `detail`.
#[derive(Module, Debug)]
pub struct DetailTower<B: Backend> {
    backbone: Backbone<B>,
    head: Linear<B>,
}

/// The learned face parameter regressor.
#[derive(Module, Debug)]
pub struct FaceEncoder<B: Backend> {
    pub coarse: CoarseTower<B>,
    pub detail: DetailTower<B>,
    resolution: Ignored<usize>,
    dims: Ignored<FaceDims>,
}

impl<B: Backend> FaceEncoder<B> {
    /// Checks that `images` is `[B, 3, R, R]` for the configured resolution.
    pub fn validate_input(&self, images: &Tensor<B, 4>) -> crate::Result<()> {
        let [batch, channels, height, width] = images.dims();
        let r = self.resolution.0;
        if channels != 3 || height != r || width != r {
            return Err(Error::shape(
                "FaceEncoder input",
                [batch, 3, r, r],
                images.dims(),
            ));
        }
        Ok(())
    }

    /// Regresses the coarse parameter sub-vectors from an image batch.
    pub fn forward_coarse(&self, images: Tensor<B, 4>) -> crate::Result<FaceParameters<B>> {
        self.validate_input(&images)?;
        let features = self.coarse.backbone.forward(images);
        let packed = self.coarse.head.forward(features);
        FaceParameters::split(packed, &self.dims.0)
    }

    /// Regresses the detail coefficients from an image batch.
    pub fn forward_detail(&self, images: Tensor<B, 4>) -> crate::Result<Tensor<B, 2>> {
        self.validate_input(&images)?;
        let features = self.detail.backbone.forward(images);
        Ok(self.detail.head.forward(features))
    }

    pub fn dims(&self) -> &FaceDims {
        &self.dims.0
    }

    pub fn resolution(&self) -> usize {
        self.resolution.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{cpu, small_dims, Cpu};
    use burn::tensor::Distribution;

    fn small_encoder() -> FaceEncoder<Cpu> {
        EncoderConfig::new()
            .with_resolution(32)
            .with_base_channels(4)
            .with_blocks_per_stage(1)
            .init(&small_dims(), &cpu())
    }

    #[test]
    fn forward_produces_configured_dims() {
        let encoder = small_encoder();
        let dims = small_dims();
        let images = Tensor::<Cpu, 4>::random([2, 3, 32, 32], Distribution::Default, &cpu());
        let params = encoder.forward_coarse(images.clone()).unwrap();
        assert_eq!(params.shape.dims(), [2, dims.shape]);
        assert_eq!(params.camera.dims(), [2, dims.camera]);
        assert_eq!(params.lighting.dims(), [2, dims.lighting]);

        let detail = encoder.forward_detail(images).unwrap();
        assert_eq!(detail.dims(), [2, dims.detail]);
    }

    #[test]
    fn rejects_wrong_resolution_and_channels() {
        let encoder = small_encoder();
        let wrong_res = Tensor::<Cpu, 4>::zeros([1, 3, 16, 16], &cpu());
        assert!(matches!(
            encoder.forward_coarse(wrong_res).unwrap_err(),
            Error::ShapeMismatch { .. }
        ));

        let wrong_channels = Tensor::<Cpu, 4>::zeros([1, 1, 32, 32], &cpu());
        assert!(encoder.forward_coarse(wrong_channels).is_err());
    }

    #[test]
    fn forward_is_deterministic() {
        let encoder = small_encoder();
        let images = Tensor::<Cpu, 4>::random([1, 3, 32, 32], Distribution::Default, &cpu());
        let a = encoder.forward_coarse(images.clone()).unwrap().pack();
        let b = encoder.forward_coarse(images).unwrap().pack();
        let diff = (a - b).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }
}
