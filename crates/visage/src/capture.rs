//! Inference: reconstruct a face from a photo and re-animate it.
//!
//! No losses, no weight updates. The encoder carries no batch statistics, so
//! repeated reconstructions of the same image with the same weights are
//! bit-identical.

use std::path::Path;

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::{backend::Backend, Tensor};

use crate::encoder::FaceEncoder;
use crate::error::{Error, Result};
use crate::morphable::{Mesh, Morphable};
use crate::params::FaceParameters;
use crate::render::{RenderOutput, Renderer};
use crate::trainer;

/// A reconstructed face: the regressed parameters, the decoded mesh and the
/// re-rendered image.
pub struct Reconstruction<B: Backend> {
    pub params: FaceParameters<B>,
    pub mesh: Mesh<B>,
    pub output: RenderOutput<B>,
}

/// Parameter replacements for re-animation. Unset fields keep the captured
/// value.
#[derive(Default)]
pub struct Reanimation<B: Backend> {
    pub expression: Option<Tensor<B, 2>>,
    pub pose: Option<Tensor<B, 2>>,
    pub detail: Option<Tensor<B, 2>>,
}

/// The inference pipeline: encoder + face model + renderer.
pub struct FaceCapture<B: Backend> {
    encoder: FaceEncoder<B>,
    renderer: Renderer<B>,
    with_detail: bool,
}

impl<B: Backend> FaceCapture<B> {
    pub fn new(encoder: FaceEncoder<B>, renderer: Renderer<B>) -> Self {
        Self {
            encoder,
            renderer,
            with_detail: false,
        }
    }

    /// Loads the trained encoder from a training checkpoint.
    ///
    /// The checkpoint's parameter layout must match `morphable`; anything
    /// else is [`Error::CheckpointCorruption`].
    pub fn from_checkpoint(
        dir: &Path,
        morphable: Morphable<B>,
        renderer_options: crate::render::RenderOptions,
        device: &B::Device,
    ) -> Result<Self> {
        let meta = trainer::load_checkpoint_meta(dir)?;
        let dims = morphable.dims();
        if meta.coarse_total != dims.coarse_total() || meta.detail_dim != dims.detail {
            return Err(Error::CheckpointCorruption {
                path: dir.into(),
                reason: format!(
                    "parameter layout {}+{} does not match the face model ({}+{})",
                    meta.coarse_total,
                    meta.detail_dim,
                    dims.coarse_total(),
                    dims.detail,
                ),
            });
        }

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let encoder = meta
            .encoder
            .init::<B>(&dims, device)
            .load_file(dir.join(trainer::ENCODER_FILE), &recorder, device)
            .map_err(|e| Error::CheckpointCorruption {
                path: dir.into(),
                reason: e.to_string(),
            })?;

        Ok(Self::new(encoder, Renderer::new(morphable, renderer_options)))
    }

    /// Also regress and apply detail displacements during reconstruction.
    pub fn with_detail(mut self, with_detail: bool) -> Self {
        self.with_detail = with_detail;
        self
    }

    pub fn renderer(&self) -> &Renderer<B> {
        &self.renderer
    }

    /// Reconstructs an image batch `[B, 3, R, R]`.
    pub fn reconstruct(&self, images: Tensor<B, 4>) -> Result<Reconstruction<B>> {
        let mut params = self.encoder.forward_coarse(images.clone())?;
        if self.with_detail {
            params.detail = Some(self.encoder.forward_detail(images.clone())?);
        }

        let (mesh, _) = self.renderer.model().decode(&params)?;
        let output = self.renderer.render(
            &mesh,
            params.camera.clone(),
            params.sh_lighting(),
            Some(&images),
        )?;

        Ok(Reconstruction {
            params,
            mesh,
            output,
        })
    }

    /// Re-renders captured parameters with some of them replaced; the
    /// animation-ready path for expression and pose transfer.
    ///
    /// `background` feeds the renderer's input compositing; pass `None` for
    /// renderers configured with a black background.
    pub fn reanimate(
        &self,
        captured: &FaceParameters<B>,
        changes: Reanimation<B>,
        background: Option<&Tensor<B, 4>>,
    ) -> Result<(Mesh<B>, RenderOutput<B>)> {
        let mut params = captured.clone();
        if let Some(expression) = changes.expression {
            params.expression = expression;
        }
        if let Some(pose) = changes.pose {
            params.pose = pose;
        }
        if let Some(detail) = changes.detail {
            params.detail = Some(detail);
        }

        let (mesh, _) = self.renderer.model().decode(&params)?;
        let output = self.renderer.render(
            &mesh,
            params.camera.clone(),
            params.sh_lighting(),
            background,
        )?;
        Ok((mesh, output))
    }
}
