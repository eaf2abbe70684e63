//! Frozen emotion recognition network.
//!
//! The network is an external, versioned artifact. It is loaded once, its
//! weights are never updated by this pipeline, and it is treated as a pure
//! function `image -> features`. Gradients still flow through its
//! activations, which is what lets the emotion-consistency loss steer the
//! encoder.

use std::path::Path;

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::tanh;
use burn::tensor::{backend::Backend, Tensor};

use crate::error::Error;

#[derive(Config, Debug)]
pub struct EmotionNetConfig {
    /// Channel width of the first convolution; doubled at each stage.
    #[config(default = 16)]
    pub channels: usize,
    /// Width of the emotion-descriptive embedding.
    #[config(default = 128)]
    pub embedding: usize,
    /// Number of discrete expression classes.
    #[config(default = 8)]
    pub expressions: usize,
}

impl EmotionNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EmotionNet<B> {
        let c = self.channels;
        let conv = |cin: usize, cout: usize| {
            Conv2dConfig::new([cin, cout], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        EmotionNet {
            conv1: conv(3, c),
            conv2: conv(c, c * 2),
            conv3: conv(c * 2, c * 4),
            conv4: conv(c * 4, c * 8),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            activation: Relu::new(),
            embed: LinearConfig::new(c * 8, self.embedding).init(device),
            valence: LinearConfig::new(self.embedding, 1).init(device),
            arousal: LinearConfig::new(self.embedding, 1).init(device),
            expression: LinearConfig::new(self.embedding, self.expressions).init(device),
        }
    }
}

/// Everything the emotion network reads off an image batch.
#[derive(Debug, Clone)]
pub struct EmotionFeatures<B: Backend> {
    /// Emotion-descriptive embedding, `[B, E]`.
    pub embedding: Tensor<B, 2>,
    /// Valence in `-1..=1`, `[B]`.
    pub valence: Tensor<B, 1>,
    /// Arousal in `-1..=1`, `[B]`.
    pub arousal: Tensor<B, 1>,
    /// Unnormalized discrete expression scores, `[B, K]`.
    pub expression_logits: Tensor<B, 2>,
}

/// Pretrained emotion recognizer. Read-only; shared freely across steps.
#[derive(Module, Debug)]
pub struct EmotionNet<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
    activation: Relu,
    embed: Linear<B>,
    valence: Linear<B>,
    arousal: Linear<B>,
    expression: Linear<B>,
}

impl<B: Backend> EmotionNet<B> {
    /// Loads the network from its versioned artifact file.
    ///
    /// The architecture in `config` must match the one the artifact was saved
    /// with. A missing file is [`Error::MissingArtifact`]; an unreadable or
    /// mismatched one is [`Error::InvalidArtifact`].
    pub fn load(
        path: impl AsRef<Path>,
        config: &EmotionNetConfig,
        device: &B::Device,
    ) -> crate::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingArtifact { path: path.into() });
        }
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let net = config
            .init(device)
            .load_file(path, &recorder, device)
            .map_err(|e| Error::InvalidArtifact {
                path: path.into(),
                reason: e.to_string(),
            })?;
        // Frozen by contract: parameters never receive gradients.
        Ok(net.no_grad())
    }

    /// Writes the network to `path` in the artifact format [`Self::load`]
    /// expects. Used by artifact preparation tooling and tests.
    pub fn save(self, path: impl AsRef<Path>) -> crate::Result<Self> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let path = path.as_ref();
        self.clone()
            .save_file(path, &recorder)
            .map_err(|e| Error::InvalidArtifact {
                path: path.into(),
                reason: e.to_string(),
            })?;
        Ok(self)
    }

    /// Extracts emotion features from an RGB image batch `[B, 3, H, W]`.
    ///
    /// Works at any resolution (the trunk is fully convolutional), so the
    /// input photo and the rendered reconstruction can be compared directly.
    pub fn encode(&self, images: Tensor<B, 4>) -> EmotionFeatures<B> {
        let [batch, _, _, _] = images.dims();
        let x = self.activation.forward(self.conv1.forward(images));
        let x = self.activation.forward(self.conv2.forward(x));
        let x = self.activation.forward(self.conv3.forward(x));
        let x = self.activation.forward(self.conv4.forward(x));
        let features = self.pool.forward(x).flatten(1, 3);
        let embedding = self.embed.forward(features);

        let squeeze = |t: Tensor<B, 2>| t.reshape([batch]);
        EmotionFeatures {
            valence: squeeze(tanh(self.valence.forward(embedding.clone()))),
            arousal: squeeze(tanh(self.arousal.forward(embedding.clone()))),
            expression_logits: self.expression.forward(embedding.clone()),
            embedding,
        }
    }
}
