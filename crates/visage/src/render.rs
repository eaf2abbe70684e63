//! Fixed differentiable renderer: orthographic projection, spherical-harmonic
//! shading and soft depth-aware splatting.
//!
//! The renderer never special-cases vertices outside the frustum; their splat
//! weights simply vanish, which is what keeps the whole forward pass
//! differentiable. All outputs are produced at the configured resolution.

use burn::config::Config;
use burn::tensor::{backend::Backend, Tensor, TensorData};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::morphable::{Mesh, Morphable};

/// What the pixels not covered by the face show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackgroundMode {
    /// Composite the input photo behind the face (requires an input image).
    Input,
    /// Leave the background black.
    Black,
}

#[derive(Config, Debug)]
pub struct RenderOptions {
    /// Output resolution; images are square `resolution × resolution`.
    #[config(default = 224)]
    pub resolution: usize,
    /// Splat radius in NDC units.
    #[config(default = 0.02)]
    pub sigma: f64,
    /// Sharpness of the depth-ordering soft max. Larger values make nearer
    /// vertices win more decisively.
    #[config(default = 20.0)]
    pub depth_sharpness: f64,
    /// Pseudo-weight of the background in the splat normalization; controls
    /// how quickly coverage falls off to zero.
    #[config(default = 1e-3)]
    pub background_weight: f64,
    #[config(default = "BackgroundMode::Black")]
    pub background: BackgroundMode,
}

/// Everything the rasterizer produces for one batch.
#[derive(Debug, Clone)]
pub struct RenderOutput<B: Backend> {
    /// Rendered RGB image, `[B, 3, H, W]`.
    pub image: Tensor<B, 4>,
    /// Soft face coverage in `0..=1`, `[B, 1, H, W]`.
    pub alpha: Tensor<B, 4>,
    /// Expected splat depth per pixel, `[B, 1, H, W]`.
    pub depth: Tensor<B, 4>,
    /// Projected landmark positions in NDC (Y down), `[B, L, 2]`.
    pub landmarks: Tensor<B, 3>,
}

/// The fixed soft rasterizer. Read-only after construction; shared freely.
#[derive(Clone)]
pub struct Renderer<B: Backend> {
    model: Morphable<B>,
    options: RenderOptions,
    /// Pixel-center X coordinates in NDC, `[1, 1, H*W]`.
    grid_x: Tensor<B, 3>,
    /// Pixel-center Y coordinates in NDC, `[1, 1, H*W]`.
    grid_y: Tensor<B, 3>,
}

impl<B: Backend> Renderer<B> {
    pub fn new(model: Morphable<B>, options: RenderOptions) -> Self {
        let res = options.resolution;
        let device = model.device().clone();

        let mut xs = Vec::with_capacity(res * res);
        let mut ys = Vec::with_capacity(res * res);
        for (row, col) in (0..res).cartesian_product(0..res) {
            xs.push((col as f32 + 0.5) / res as f32 * 2.0 - 1.0);
            ys.push((row as f32 + 0.5) / res as f32 * 2.0 - 1.0);
        }
        let grid = |v: Vec<f32>| {
            Tensor::<B, 1>::from_data(TensorData::new(v, [res * res]), &device)
                .reshape([1, 1, res * res])
        };

        Self {
            model,
            options,
            grid_x: grid(xs),
            grid_y: grid(ys),
        }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn model(&self) -> &Morphable<B> {
        &self.model
    }

    /// Renders a decoded mesh under the given camera and lighting.
    ///
    /// `camera` is `[B, 3]` (scale, tx, ty), `lighting` is `[B, 9, 3]`.
    /// `input` (required for [`BackgroundMode::Input`]) must match the output
    /// resolution exactly.
    pub fn render(
        &self,
        mesh: &Mesh<B>,
        camera: Tensor<B, 2>,
        lighting: Tensor<B, 3>,
        input: Option<&Tensor<B, 4>>,
    ) -> crate::Result<RenderOutput<B>> {
        let [batch, num_vertices, _] = mesh.vertices.dims();
        let res = self.options.resolution;
        let pixels = res * res;

        if let Some(input) = input {
            let expected = [batch, 3, res, res];
            if input.dims() != expected {
                return Err(Error::shape("Renderer input image", expected, input.dims()));
            }
        }

        let projected = orthographic_project(mesh.vertices.clone(), camera.clone());
        let sep = |i: usize| {
            projected
                .clone()
                .slice([0..batch, 0..num_vertices, i..i + 1])
        };
        let (x, y, z) = (sep(0), sep(1), sep(2));

        // Vertex colors: sampled albedo modulated by SH irradiance.
        let albedo = self.model.sample_texture(mesh.texture.clone());
        let normals = self.model.vertex_normals(mesh.vertices.clone());
        let shading = sh_irradiance(normals, lighting);
        let colors = (albedo * shading).clamp_min(0.0);

        // Soft splatting: spatial Gaussian × depth-ordering soft max.
        let inv_two_sigma_sq = 1.0 / (2.0 * self.options.sigma * self.options.sigma);
        let dx = x.clone() - self.grid_x.clone();
        let dy = y.clone() - self.grid_y.clone();
        let dist_sq = dx.clone() * dx + dy.clone() * dy;
        let spatial = (dist_sq * (-inv_two_sigma_sq)).exp();

        let z_max = z.clone().max_dim(1);
        let depth_rank = ((z.clone() - z_max) * self.options.depth_sharpness).exp();
        let weights = spatial * depth_rank;

        let weight_sum = weights.clone().sum_dim(1);
        let denom = weight_sum.clone() + self.options.background_weight;

        // [B, P, V] × [B, V, C] contractions resolve the per-pixel sums.
        let weights_t = weights.transpose();
        let denom_t = denom.clone().transpose();
        let rgb = weights_t.clone().matmul(colors) / denom_t.clone();
        let depth = weights_t.matmul(z) / denom_t.clone();
        let alpha = (weight_sum / denom).transpose();

        let to_image = |t: Tensor<B, 3>, channels: usize| {
            t.reshape([batch, res, res, channels])
                .permute([0, 3, 1, 2])
        };
        let rgb = to_image(rgb, 3);
        let alpha = to_image(alpha, 1);
        let depth = to_image(depth, 1);

        let image = match (self.options.background, input) {
            (BackgroundMode::Input, Some(input)) => {
                rgb + input.clone() * (alpha.clone().neg() + 1.0)
            }
            (BackgroundMode::Input, None) => {
                return Err(Error::shape(
                    "Renderer background input",
                    [batch, 3, res, res],
                    [0],
                ))
            }
            (BackgroundMode::Black, _) => rgb,
        };

        let landmarks = {
            let [_, l, _] = mesh.landmarks.dims();
            orthographic_project(mesh.landmarks.clone(), camera).slice([0..batch, 0..l, 0..2])
        };

        Ok(RenderOutput {
            image,
            alpha,
            depth,
            landmarks,
        })
    }
}

/// Orthographic camera: scale the translated vertices, then flip Y (image
/// rows grow downward) and Z (larger = closer to the camera).
pub fn orthographic_project<B: Backend>(
    vertices: Tensor<B, 3>,
    camera: Tensor<B, 2>,
) -> Tensor<B, 3> {
    let [batch, n, _] = vertices.dims();
    let scale = camera.clone().slice([0..batch, 0..1]).reshape([batch, 1, 1]);
    let translation = camera.slice([0..batch, 1..3]).reshape([batch, 1, 2]);

    let xy = vertices.clone().slice([0..batch, 0..n, 0..2]) + translation;
    let z = vertices.slice([0..batch, 0..n, 2..3]);
    let projected = Tensor::cat(vec![xy, z], 2) * scale;

    let flip = Tensor::<B, 1>::from_floats([1.0, -1.0, -1.0], &projected.device())
        .reshape([1, 1, 3]);
    projected * flip
}

/// Evaluates the 9-band spherical-harmonics irradiance at each normal.
///
/// `normals` is `[B, V, 3]`, `lighting` is `[B, 9, 3]`; the result is a
/// per-vertex RGB multiplier `[B, V, 3]`.
pub fn sh_irradiance<B: Backend>(normals: Tensor<B, 3>, lighting: Tensor<B, 3>) -> Tensor<B, 3> {
    const FACTORS: [f32; 9] = [
        0.282_094_8, // 1
        1.023_326_7, // ny
        1.023_326_7, // nz
        1.023_326_7, // nx
        0.858_085_5, // nx·ny
        0.858_085_5, // nx·nz
        0.858_085_5, // ny·nz
        0.429_042_8, // nx² − ny²
        0.247_708,   // 3nz² − 1
    ];

    let [batch, v, _] = normals.dims();
    let comp = |i: usize| normals.clone().slice([0..batch, 0..v, i..i + 1]);
    let (nx, ny, nz) = (comp(0), comp(1), comp(2));

    let basis = Tensor::cat(
        vec![
            nx.clone().zeros_like() + 1.0,
            ny.clone(),
            nz.clone(),
            nx.clone(),
            nx.clone() * ny.clone(),
            nx.clone() * nz.clone(),
            ny.clone() * nz.clone(),
            nx.clone() * nx.clone() - ny.clone() * ny.clone(),
            nz.clone() * nz * 3.0 - 1.0,
        ],
        2,
    );
    let factors =
        Tensor::<B, 1>::from_floats(FACTORS, &normals.device()).reshape([1, 1, 9]);

    (basis * factors).matmul(lighting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::FaceParameters;
    use crate::test::{cpu, synthetic_morphable, Cpu};
    use burn::tensor::{Distribution, Tensor};

    fn render_setup(res: usize) -> (Renderer<Cpu>, Mesh<Cpu>, Tensor<Cpu, 2>, Tensor<Cpu, 3>) {
        let model = synthetic_morphable(11);
        let dims = model.dims();
        let packed = Tensor::<Cpu, 2>::random(
            [2, dims.coarse_total()],
            Distribution::Normal(0.0, 0.1),
            &cpu(),
        );
        let params = FaceParameters::split(packed, &dims).unwrap();
        let (mesh, _) = model.decode(&params).unwrap();

        let camera = Tensor::<Cpu, 2>::from_floats([[1.0, 0.0, 0.0], [1.2, 0.1, -0.1]], &cpu());
        // Ambient-only lighting.
        let mut light = vec![0.0f32; 2 * 27];
        for b in 0..2 {
            for c in 0..3 {
                light[b * 27 + c] = 1.0;
            }
        }
        let lighting = Tensor::<Cpu, 1>::from_floats(light.as_slice(), &cpu()).reshape([2, 9, 3]);

        let renderer = Renderer::new(model, RenderOptions::new().with_resolution(res));
        (renderer, mesh, camera, lighting)
    }

    #[test]
    fn output_resolution_matches_configuration() {
        let (renderer, mesh, camera, lighting) = render_setup(16);
        let out = renderer.render(&mesh, camera, lighting, None).unwrap();
        assert_eq!(out.image.dims(), [2, 3, 16, 16]);
        assert_eq!(out.alpha.dims(), [2, 1, 16, 16]);
        assert_eq!(out.depth.dims(), [2, 1, 16, 16]);
        assert_eq!(out.landmarks.dims()[2], 2);
    }

    #[test]
    fn alpha_is_a_valid_coverage() {
        let (renderer, mesh, camera, lighting) = render_setup(12);
        let out = renderer.render(&mesh, camera, lighting, None).unwrap();
        let alpha: Vec<f32> = out.alpha.into_data().to_vec().unwrap();
        for a in alpha {
            assert!((0.0..=1.0).contains(&a), "alpha {a} out of range");
        }
    }

    #[test]
    fn input_background_requires_matching_resolution() {
        let (renderer, mesh, camera, lighting) = render_setup(8);
        let renderer = Renderer::new(
            renderer.model().clone(),
            RenderOptions::new()
                .with_resolution(8)
                .with_background(BackgroundMode::Input),
        );
        let bad = Tensor::<Cpu, 4>::zeros([2, 3, 9, 9], &cpu());
        assert!(renderer
            .render(&mesh, camera.clone(), lighting.clone(), Some(&bad))
            .is_err());

        let good = Tensor::<Cpu, 4>::zeros([2, 3, 8, 8], &cpu());
        assert!(renderer
            .render(&mesh, camera, lighting, Some(&good))
            .is_ok());
    }

    #[test]
    fn black_background_fades_to_zero_far_from_face() {
        let (renderer, mesh, _, lighting) = render_setup(8);
        // Push the face far outside the frustum; the image must be ~black.
        let camera = Tensor::<Cpu, 2>::from_floats([[1.0, 50.0, 50.0], [1.0, 50.0, 50.0]], &cpu());
        let out = renderer.render(&mesh, camera, lighting, None).unwrap();
        let max = out.image.abs().max().into_scalar();
        assert!(max < 1e-3, "expected black image, max {max}");
    }

    #[test]
    fn input_background_shows_through_uncovered_pixels() {
        let (renderer, mesh, _, lighting) = render_setup(8);
        let renderer = Renderer::new(
            renderer.model().clone(),
            RenderOptions::new()
                .with_resolution(8)
                .with_background(BackgroundMode::Input),
        );
        // Face pushed far out of frame: every pixel is background.
        let camera = Tensor::<Cpu, 2>::from_floats([[1.0, 50.0, 50.0], [1.0, 50.0, 50.0]], &cpu());
        let input = Tensor::<Cpu, 4>::ones([2, 3, 8, 8], &cpu()) * 0.25;
        let out = renderer
            .render(&mesh, camera, lighting, Some(&input))
            .unwrap();
        let diff = (out.image - input).abs().max().into_scalar();
        assert!(diff < 1e-3, "uncovered pixels must show the input, diff {diff}");
    }

    #[test]
    fn rendering_is_deterministic() {
        let (renderer, mesh, camera, lighting) = render_setup(10);
        let a = renderer
            .render(&mesh, camera.clone(), lighting.clone(), None)
            .unwrap();
        let b = renderer.render(&mesh, camera, lighting, None).unwrap();
        let diff = (a.image - b.image).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn ambient_irradiance_is_uniform() {
        let normals = Tensor::<Cpu, 3>::from_floats(
            [[[0.0, 0.0, 1.0], [0.0, 1.0, 0.0]]],
            &cpu(),
        );
        let mut light = vec![0.0f32; 27];
        light[0] = 1.0;
        light[1] = 1.0;
        light[2] = 1.0;
        let lighting = Tensor::<Cpu, 1>::from_floats(light.as_slice(), &cpu()).reshape([1, 9, 3]);
        let shading: Vec<f32> = sh_irradiance(normals, lighting)
            .into_data()
            .to_vec()
            .unwrap();
        for value in shading {
            approx::assert_abs_diff_eq!(value, 0.282_094_8, epsilon = 1e-5);
        }
    }
}
