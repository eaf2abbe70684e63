//! Face model parameters and their packed vector layout.

use burn::config::Config;
use burn::tensor::{backend::Backend, Tensor};

use crate::error::Error;

/// Dimensionalities of the face parameter sub-vectors.
///
/// These are dictated by the parametric face model artifact and must match it
/// exactly; every component that consumes or produces parameters is
/// constructed from the same `FaceDims` value. The defaults match the
/// shipped face model.
#[derive(Config, Debug, PartialEq, Eq)]
pub struct FaceDims {
    /// Identity geometry coefficients.
    #[config(default = 100)]
    pub shape: usize,
    /// Non-identity deformation coefficients.
    #[config(default = 50)]
    pub expression: usize,
    /// Global rotation + jaw articulation, both axis-angle.
    #[config(default = 6)]
    pub pose: usize,
    /// Orthographic camera: isotropic scale + 2D translation.
    #[config(default = 3)]
    pub camera: usize,
    /// Albedo texture coefficients.
    #[config(default = 50)]
    pub albedo: usize,
    /// Spherical-harmonics lighting, 9 bands × RGB.
    #[config(default = 27)]
    pub lighting: usize,
    /// High-frequency displacement coefficients.
    #[config(default = 128)]
    pub detail: usize,
}

impl FaceDims {
    /// Width of the packed coarse parameter vector (everything but `detail`).
    pub fn coarse_total(&self) -> usize {
        self.shape + self.expression + self.pose + self.camera + self.albedo + self.lighting
    }
}

/// A batch of face model parameters, partitioned into named sub-vectors.
///
/// Every tensor has shape `[batch, dim]` with `dim` fixed by [`FaceDims`].
/// `detail` is only present once the detail stage is active.
#[derive(Debug, Clone)]
pub struct FaceParameters<B: Backend> {
    pub shape: Tensor<B, 2>,
    pub expression: Tensor<B, 2>,
    pub pose: Tensor<B, 2>,
    pub camera: Tensor<B, 2>,
    pub albedo: Tensor<B, 2>,
    pub lighting: Tensor<B, 2>,
    pub detail: Option<Tensor<B, 2>>,
}

impl<B: Backend> FaceParameters<B> {
    /// Splits a packed `[batch, coarse_total]` coefficient tensor into named
    /// sub-vectors.
    ///
    /// The packed layout is `shape | expression | pose | camera | albedo |
    /// lighting`, in that order.
    pub fn split(packed: Tensor<B, 2>, dims: &FaceDims) -> crate::Result<Self> {
        let [batch, width] = packed.dims();
        if width != dims.coarse_total() {
            return Err(Error::shape(
                "FaceParameters::split",
                [batch, dims.coarse_total()],
                [batch, width],
            ));
        }

        let mut start = 0;
        let mut take = |len: usize| {
            let sub = packed.clone().slice([0..batch, start..start + len]);
            start += len;
            sub
        };

        Ok(Self {
            shape: take(dims.shape),
            expression: take(dims.expression),
            pose: take(dims.pose),
            camera: take(dims.camera),
            albedo: take(dims.albedo),
            lighting: take(dims.lighting),
            detail: None,
        })
    }

    /// Concatenates the coarse sub-vectors back into the packed layout.
    pub fn pack(&self) -> Tensor<B, 2> {
        Tensor::cat(
            vec![
                self.shape.clone(),
                self.expression.clone(),
                self.pose.clone(),
                self.camera.clone(),
                self.albedo.clone(),
                self.lighting.clone(),
            ],
            1,
        )
    }

    pub fn batch_size(&self) -> usize {
        self.shape.dims()[0]
    }

    /// Global head rotation, axis-angle `[batch, 3]`.
    pub fn global_pose(&self) -> Tensor<B, 2> {
        let [batch, _] = self.pose.dims();
        self.pose.clone().slice([0..batch, 0..3])
    }

    /// Jaw articulation, axis-angle `[batch, 3]`.
    pub fn jaw_pose(&self) -> Tensor<B, 2> {
        let [batch, width] = self.pose.dims();
        self.pose.clone().slice([0..batch, 3..width])
    }

    /// Lighting coefficients reshaped to `[batch, 9, 3]` (SH band × RGB).
    pub fn sh_lighting(&self) -> Tensor<B, 3> {
        let [batch, width] = self.lighting.dims();
        self.lighting.clone().reshape([batch, width / 3, 3])
    }

    /// Returns a copy with every coarse sub-vector detached from the autodiff
    /// graph. Used by the detail stage when the coarse encoder is frozen.
    pub fn detach_coarse(&self) -> Self {
        Self {
            shape: self.shape.clone().detach(),
            expression: self.expression.clone().detach(),
            pose: self.pose.clone().detach(),
            camera: self.camera.clone().detach(),
            albedo: self.albedo.clone().detach(),
            lighting: self.lighting.clone().detach(),
            detail: self.detail.clone(),
        }
    }

    /// Validates sub-vector widths against `dims`.
    pub fn check_dims(&self, dims: &FaceDims) -> crate::Result<()> {
        let batch = self.batch_size();
        let expect = |context, tensor: &Tensor<B, 2>, dim: usize| -> crate::Result<()> {
            if tensor.dims() != [batch, dim] {
                return Err(Error::shape(context, [batch, dim], tensor.dims()));
            }
            Ok(())
        };
        expect("FaceParameters.shape", &self.shape, dims.shape)?;
        expect("FaceParameters.expression", &self.expression, dims.expression)?;
        expect("FaceParameters.pose", &self.pose, dims.pose)?;
        expect("FaceParameters.camera", &self.camera, dims.camera)?;
        expect("FaceParameters.albedo", &self.albedo, dims.albedo)?;
        expect("FaceParameters.lighting", &self.lighting, dims.lighting)?;
        if let Some(detail) = &self.detail {
            expect("FaceParameters.detail", detail, dims.detail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{Cpu, cpu};
    use burn::tensor::Distribution;

    fn small_dims() -> FaceDims {
        FaceDims::new()
            .with_shape(4)
            .with_expression(3)
            .with_pose(6)
            .with_camera(3)
            .with_albedo(2)
            .with_lighting(27)
            .with_detail(5)
    }

    #[test]
    fn split_pack_roundtrip() {
        let dims = small_dims();
        let packed = Tensor::<Cpu, 2>::random(
            [2, dims.coarse_total()],
            Distribution::Normal(0.0, 1.0),
            &cpu(),
        );
        let params = FaceParameters::split(packed.clone(), &dims).unwrap();
        assert_eq!(params.shape.dims(), [2, 4]);
        assert_eq!(params.lighting.dims(), [2, 27]);
        assert_eq!(params.sh_lighting().dims(), [2, 9, 3]);

        let repacked = params.pack();
        let diff = (packed - repacked).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn split_rejects_wrong_width() {
        let dims = small_dims();
        let packed = Tensor::<Cpu, 2>::zeros([2, dims.coarse_total() + 1], &cpu());
        let err = FaceParameters::split(packed, &dims).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn pose_accessors() {
        let dims = small_dims();
        let packed = Tensor::<Cpu, 2>::zeros([1, dims.coarse_total()], &cpu());
        let params = FaceParameters::split(packed, &dims).unwrap();
        assert_eq!(params.global_pose().dims(), [1, 3]);
        assert_eq!(params.jaw_pose().dims(), [1, 3]);
    }
}
