//! End-to-end run against on-disk artifacts: face model npz + emotion net
//! record in, a trained-and-checkpointed encoder and a reconstruction out.

use std::fs::File;
use std::path::Path;

use burn::backend::{Autodiff, NdArray};
use image::RgbImage;
use ndarray::{Array1, Array2};
use ndarray_npy::NpzWriter;

use visage::capture::FaceCapture;
use visage::data::{FaceSample, MemoryDataset, Prefetcher};
use visage::emotion::EmotionNetConfig;
use visage::encoder::EncoderConfig;
use visage::error::Error;
use visage::morphable::Morphable;
use visage::render::RenderOptions;
use visage::trainer::{Stage, Trainer, TrainerConfig};

type Train = Autodiff<NdArray>;
type Infer = NdArray;

const GRID: usize = 5;
const RES: usize = 16;

/// Writes a miniature face model artifact.
fn write_face_model(path: &Path) {
    let mut rng = fastrand::Rng::with_seed(1234);
    let n = GRID;
    let v = n * n;
    let (d_shape, d_expr, d_albedo, d_detail) = (6, 4, 3, 5);
    let texture_size = 8;
    let texels = texture_size * texture_size;

    let mut template = Vec::new();
    let mut uv = Vec::new();
    let mut jaw = Vec::new();
    let mut mirror = Vec::new();
    for row in 0..n {
        for col in 0..n {
            let x = col as f32 / (n - 1) as f32 - 0.5;
            let y = row as f32 / (n - 1) as f32 - 0.5;
            template.extend([x, y, 0.1 * (1.0 - x * x - y * y)]);
            uv.extend([x + 0.5, y + 0.5]);
            jaw.push(if y > 0.2 { 1.0 } else { 0.0 });
            mirror.push((row * n + (n - 1 - col)) as u32);
        }
    }
    let mut faces = Vec::new();
    for row in 0..n - 1 {
        for col in 0..n - 1 {
            let a = (row * n + col) as u32;
            let (b, c, d) = (a + 1, a + n as u32, a + n as u32 + 1);
            faces.extend([a, c, b, b, c, d]);
        }
    }
    let num_faces = faces.len() / 3;
    let noise = |rng: &mut fastrand::Rng, len: usize, scale: f32| -> Vec<f32> {
        (0..len).map(|_| (rng.f32() - 0.5) * 2.0 * scale).collect()
    };

    let mut npz = NpzWriter::new(File::create(path).unwrap());
    npz.add_array("version", &Array1::from_vec(vec![1i32])).unwrap();
    npz.add_array("template", &Array2::from_shape_vec((v, 3), template).unwrap())
        .unwrap();
    npz.add_array(
        "shape_basis",
        &Array2::from_shape_vec((v * 3, d_shape), noise(&mut rng, v * 3 * d_shape, 0.05)).unwrap(),
    )
    .unwrap();
    npz.add_array(
        "expression_basis",
        &Array2::from_shape_vec((v * 3, d_expr), noise(&mut rng, v * 3 * d_expr, 0.05)).unwrap(),
    )
    .unwrap();
    npz.add_array("jaw_weights", &Array1::from_vec(jaw)).unwrap();
    npz.add_array("jaw_pivot", &Array1::from_vec(vec![0.0, 0.2, 0.0]))
        .unwrap();
    npz.add_array("faces", &Array2::from_shape_vec((num_faces, 3), faces).unwrap())
        .unwrap();
    npz.add_array("landmark_indices", &Array1::from_vec(vec![0u32, 6, 12, 18, 24]))
        .unwrap();
    npz.add_array("uv_coords", &Array2::from_shape_vec((v, 2), uv).unwrap())
        .unwrap();
    npz.add_array(
        "texture_mean",
        &Array2::from_shape_vec((texels, 3), vec![0.5; texels * 3]).unwrap(),
    )
    .unwrap();
    npz.add_array(
        "texture_basis",
        &Array2::from_shape_vec((texels * 3, d_albedo), noise(&mut rng, texels * 3 * d_albedo, 0.1))
            .unwrap(),
    )
    .unwrap();
    npz.add_array(
        "detail_basis",
        &Array2::from_shape_vec((v, d_detail), noise(&mut rng, v * d_detail, 0.01)).unwrap(),
    )
    .unwrap();
    npz.add_array("mirror_map", &Array1::from_vec(mirror)).unwrap();
    npz.finish().unwrap();
}

fn small_config() -> TrainerConfig {
    TrainerConfig::new()
        .with_encoder(
            EncoderConfig::new()
                .with_resolution(RES)
                .with_base_channels(4)
                .with_blocks_per_stage(1),
        )
        .with_render(RenderOptions::new().with_resolution(RES))
        .with_emotion(EmotionNetConfig::new().with_channels(4).with_embedding(8))
        .with_coarse_steps(1)
        .with_detail_steps(1)
}

fn photo_dataset() -> MemoryDataset {
    let samples = (0..4)
        .map(|i| FaceSample {
            image: RgbImage::from_fn(RES as u32, RES as u32, |x, y| {
                image::Rgb([(x * 16) as u8, (y * 16) as u8, (i * 60) as u8])
            }),
            landmarks: None,
            mask: None,
            identity: Some(i / 2),
        })
        .collect();
    MemoryDataset::new(samples)
}

#[test]
fn artifacts_to_reconstruction() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("face_model.npz");
    let emotion_path = dir.path().join("emotion.bin");
    let checkpoint_dir = dir.path().join("checkpoint");
    write_face_model(&model_path);

    // The emotion artifact is itself produced by the crate's tooling path.
    let emotion_config = EmotionNetConfig::new().with_channels(4).with_embedding(8);
    emotion_config
        .init::<Train>(&Default::default())
        .save(&emotion_path)
        .unwrap();

    let device = Default::default();
    let mut trainer =
        Trainer::<Train, ()>::from_artifacts(small_config(), &model_path, &emotion_path, &device)
            .unwrap();

    // Coarse step, then detail step, then the stage machine stops.
    let mut prefetcher = Prefetcher::spawn(photo_dataset(), 2, RES, 2);
    trainer.train(&mut prefetcher, &device).unwrap();
    assert_eq!(trainer.stage(), Stage::Stopped);
    trainer.save_checkpoint(&checkpoint_dir).unwrap();

    // Inference on a plain backend from the persisted state.
    let morphable = Morphable::<Infer>::load(&model_path, &Default::default()).unwrap();
    let capture = FaceCapture::from_checkpoint(
        &checkpoint_dir,
        morphable,
        RenderOptions::new().with_resolution(RES),
        &Default::default(),
    )
    .unwrap()
    .with_detail(true);

    let image = burn::tensor::Tensor::<Infer, 4>::zeros([1, 3, RES, RES], &Default::default());
    let reconstruction = capture.reconstruct(image).unwrap();
    assert_eq!(reconstruction.output.image.dims(), [1, 3, RES, RES]);
    assert!(reconstruction.params.detail.is_some());

    let mut obj = Vec::new();
    capture
        .renderer()
        .model()
        .export_obj(&reconstruction.mesh, 0, &mut obj)
        .unwrap();
    assert!(!obj.is_empty());
}

#[test]
fn missing_artifacts_abort_startup() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("face_model.npz");
    write_face_model(&model_path);

    let device = Default::default();
    let missing_emotion = Trainer::<Train, ()>::from_artifacts(
        small_config(),
        &model_path,
        dir.path().join("no_such_emotion.bin"),
        &device,
    );
    assert!(matches!(
        missing_emotion.unwrap_err(),
        Error::MissingArtifact { .. }
    ));

    let missing_model = Trainer::<Train, ()>::from_artifacts(
        small_config(),
        dir.path().join("no_such_model.npz"),
        dir.path().join("no_such_emotion.bin"),
        &device,
    );
    assert!(matches!(
        missing_model.unwrap_err(),
        Error::MissingArtifact { .. }
    ));
}
