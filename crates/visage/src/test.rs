//! Shared fixtures for unit tests: a tiny synthetic face model and small
//! component configurations that keep test runs fast.

use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};
use ndarray::{Array1, Array2};

use crate::encoder::EncoderConfig;
use crate::morphable::{Mesh, Morphable, MorphableData};
use crate::params::{FaceDims, FaceParameters};
use crate::render::{RenderOptions, RenderOutput, Renderer};
use crate::trainer::TrainerConfig;

pub type Cpu = NdArray;
pub type Train = Autodiff<NdArray>;

pub fn cpu() -> <Cpu as Backend>::Device {
    Default::default()
}

/// Dimensionalities small enough for encoder unit tests.
pub fn small_dims() -> FaceDims {
    FaceDims::new()
        .with_shape(4)
        .with_expression(3)
        .with_albedo(2)
        .with_detail(5)
}

/// Grid edge of the synthetic face patch.
const GRID: usize = 5;

/// Builds a tiny but fully populated face model: a bumpy quad patch with
/// seeded random bases.
pub fn synthetic_morphable_on<B: Backend>(seed: u64) -> Morphable<B>
where
    B::Device: Default,
{
    let mut rng = fastrand::Rng::with_seed(seed);
    let n = GRID;
    let v = n * n;
    let (d_shape, d_expr, d_albedo, d_detail) = (4, 3, 2, 5);
    let texture_size = 8;

    let mut template = Vec::with_capacity(v * 3);
    let mut uv = Vec::with_capacity(v * 2);
    let mut jaw_weights = Vec::with_capacity(v);
    let mut mirror = Vec::with_capacity(v);
    for row in 0..n {
        for col in 0..n {
            let x = col as f32 / (n - 1) as f32 - 0.5;
            let y = row as f32 / (n - 1) as f32 - 0.5;
            let z = 0.1 * (1.0 - (x * x + y * y));
            template.extend([x, y, z]);
            uv.extend([col as f32 / (n - 1) as f32, row as f32 / (n - 1) as f32]);
            // The lower third of the patch articulates with the jaw.
            jaw_weights.push(if y > 0.2 { ((y - 0.2) / 0.3).min(1.0) } else { 0.0 });
            mirror.push((row * n + (n - 1 - col)) as u32);
        }
    }

    let mut faces = Vec::new();
    for row in 0..n - 1 {
        for col in 0..n - 1 {
            let a = (row * n + col) as u32;
            let b = a + 1;
            let c = a + n as u32;
            let d = c + 1;
            faces.extend([a, c, b, b, c, d]);
        }
    }
    let num_faces = faces.len() / 3;

    let noise = |rng: &mut fastrand::Rng, len: usize, scale: f32| -> Vec<f32> {
        (0..len).map(|_| (rng.f32() - 0.5) * 2.0 * scale).collect()
    };

    let texels = texture_size * texture_size;
    let data = MorphableData {
        template: Array2::from_shape_vec((v, 3), template).unwrap(),
        shape_basis: Array2::from_shape_vec((v * 3, d_shape), noise(&mut rng, v * 3 * d_shape, 0.05))
            .unwrap(),
        expression_basis: Array2::from_shape_vec(
            (v * 3, d_expr),
            noise(&mut rng, v * 3 * d_expr, 0.05),
        )
        .unwrap(),
        jaw_weights: Array1::from_vec(jaw_weights),
        jaw_pivot: Array1::from_vec(vec![0.0, 0.2, 0.0]),
        faces: Array2::from_shape_vec((num_faces, 3), faces).unwrap(),
        landmark_indices: Array1::from_vec(vec![0, 6, 12, 18, 24]),
        uv_coords: Array2::from_shape_vec((v, 2), uv).unwrap(),
        texture_mean: Array2::from_shape_vec((texels, 3), vec![0.5; texels * 3]).unwrap(),
        texture_basis: Array2::from_shape_vec(
            (texels * 3, d_albedo),
            noise(&mut rng, texels * 3 * d_albedo, 0.1),
        )
        .unwrap(),
        detail_basis: Array2::from_shape_vec((v, d_detail), noise(&mut rng, v * d_detail, 0.01))
            .unwrap(),
        mirror_map: Array1::from_vec(mirror),
    };

    Morphable::from_data(data, &Default::default()).expect("synthetic model must be valid")
}

pub fn synthetic_morphable(seed: u64) -> Morphable<Cpu> {
    synthetic_morphable_on::<Cpu>(seed)
}

/// A decoded and rendered synthetic face, for loss tests.
pub struct RenderFixture {
    pub model: Morphable<Cpu>,
    pub params: FaceParameters<Cpu>,
    pub mesh: Mesh<Cpu>,
    pub rendered: RenderOutput<Cpu>,
}

pub fn render_fixture(seed: u64) -> RenderFixture {
    Cpu::seed(seed);
    let model = synthetic_morphable(seed);
    let dims = model.dims();
    let packed = Tensor::<Cpu, 2>::random(
        [2, dims.coarse_total()],
        Distribution::Normal(0.0, 0.1),
        &cpu(),
    );
    let params = FaceParameters::split(packed, &dims).unwrap();
    let (mesh, _) = model.decode(&params).unwrap();

    let renderer = Renderer::new(model.clone(), RenderOptions::new().with_resolution(12));
    let rendered = renderer
        .render(&mesh, params.camera.clone(), params.sh_lighting(), None)
        .unwrap();

    RenderFixture {
        model,
        params,
        mesh,
        rendered,
    }
}

/// A trainer configuration scaled down for unit tests.
pub fn test_trainer_config() -> TrainerConfig {
    TrainerConfig::new()
        .with_encoder(
            EncoderConfig::new()
                .with_resolution(12)
                .with_base_channels(4)
                .with_blocks_per_stage(1),
        )
        .with_render(RenderOptions::new().with_resolution(12))
        .with_learning_rate(1e-3)
}
