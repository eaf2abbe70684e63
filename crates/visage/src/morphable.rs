//! The fixed parametric face model (linear blendshapes + articulation).
//!
//! The model is a pretrained artifact loaded from an `.npz` file; nothing in
//! it is ever trained by this crate. Decoding is built entirely from tensor
//! ops so that gradients flow from the produced mesh and texture back into
//! every parameter sub-vector.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use ndarray::{Array1, Array2};
use ndarray_npy::NpzReader;

use crate::error::{Error, Result};
use crate::params::{FaceDims, FaceParameters};

/// Artifact format revision understood by this build.
pub const ARTIFACT_VERSION: i32 = 1;

/// Raw arrays of a face model artifact.
///
/// This mirrors the `.npz` layout one-to-one and exists so that tests (and
/// artifact conversion tools) can construct a [`Morphable`] without touching
/// the filesystem.
pub struct MorphableData {
    /// Neutral face vertices, `[V, 3]`.
    pub template: Array2<f32>,
    /// Identity offsets, `[V*3, D_shape]`.
    pub shape_basis: Array2<f32>,
    /// Expression offsets, `[V*3, D_expression]`.
    pub expression_basis: Array2<f32>,
    /// Per-vertex jaw skinning weights in `0..=1`, `[V]`.
    pub jaw_weights: Array1<f32>,
    /// Jaw rotation pivot, `[3]`.
    pub jaw_pivot: Array1<f32>,
    /// Triangle topology, `[F, 3]`.
    pub faces: Array2<u32>,
    /// Mesh indices of the tracked landmarks, `[L]`.
    pub landmark_indices: Array1<u32>,
    /// Per-vertex UV coordinates in `0..=1`, `[V, 2]`.
    pub uv_coords: Array2<f32>,
    /// Mean albedo texture, `[T*T, 3]` (row-major `T×T` image).
    pub texture_mean: Array2<f32>,
    /// Albedo texture basis, `[T*T*3, D_albedo]`.
    pub texture_basis: Array2<f32>,
    /// Per-vertex displacement basis (along the vertex normal), `[V, D_detail]`.
    pub detail_basis: Array2<f32>,
    /// Index of each vertex' horizontal mirror partner, `[V]`.
    pub mirror_map: Array1<u32>,
}

/// The fixed parametric face model.
///
/// Cheaply cloneable; all tensors are shared. The model is read-only after
/// construction and can be used concurrently from any number of forward
/// passes.
#[derive(Clone)]
pub struct Morphable<B: Backend> {
    device: B::Device,
    num_vertices: usize,
    num_faces: usize,
    num_landmarks: usize,
    texture_size: usize,

    template: Tensor<B, 2>,
    /// `[D_shape, V*3]`, transposed from the artifact for row-vector matmul.
    shape_basis: Tensor<B, 2>,
    /// `[D_expression, V*3]`.
    expression_basis: Tensor<B, 2>,
    jaw_weights: Tensor<B, 3>,
    jaw_pivot: Tensor<B, 3>,
    faces: [Tensor<B, 1, Int>; 3],
    landmark_indices: Tensor<B, 1, Int>,
    texture_mean: Tensor<B, 3>,
    /// `[D_albedo, T*T*3]`.
    texture_basis: Tensor<B, 2>,
    /// `[D_detail, V]`.
    detail_basis: Tensor<B, 2>,
    mirror_map: Tensor<B, 1, Int>,
    /// Flattened texel indices of the 4 bilinear taps per vertex, `[V*4]`.
    tex_taps: Tensor<B, 1, Int>,
    /// Bilinear tap weights, `[1, V, 4, 1]`.
    tex_tap_weights: Tensor<B, 4>,

    faces_host: Vec<[u32; 3]>,
    uv_host: Vec<[f32; 2]>,
}

/// A decoded face: vertices, landmarks and the synthesized albedo texture.
///
/// Recomputed on every forward pass and never stored as primary state.
#[derive(Debug, Clone)]
pub struct Mesh<B: Backend> {
    /// World-space vertices, `[B, V, 3]`.
    pub vertices: Tensor<B, 3>,
    /// World-space landmark positions, `[B, L, 3]`.
    pub landmarks: Tensor<B, 3>,
    /// Albedo texture image, `[B, T*T, 3]` in `0..=1`.
    pub texture: Tensor<B, 3>,
}

impl<B: Backend> Morphable<B> {
    /// Loads the model from its `.npz` artifact.
    ///
    /// Fails with [`Error::MissingArtifact`] if the file does not exist and
    /// with [`Error::InvalidArtifact`] if it cannot be parsed or its arrays
    /// are inconsistent.
    pub fn load(path: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingArtifact { path: path.into() });
        }
        let invalid = |reason: String| Error::InvalidArtifact {
            path: path.into(),
            reason,
        };

        let file = File::open(path)?;
        let mut npz = NpzReader::new(file).map_err(|e| invalid(e.to_string()))?;

        let version: Array1<i32> = npz
            .by_name("version")
            .map_err(|e| invalid(format!("version: {e}")))?;
        if version.to_vec() != vec![ARTIFACT_VERSION] {
            return Err(invalid(format!(
                "unsupported artifact version {:?} (expected {ARTIFACT_VERSION})",
                version.to_vec()
            )));
        }

        macro_rules! array {
            ($name:literal) => {
                npz.by_name($name)
                    .map_err(|e| invalid(format!(concat!($name, ": {}"), e)))?
            };
        }

        let data = MorphableData {
            template: array!("template"),
            shape_basis: array!("shape_basis"),
            expression_basis: array!("expression_basis"),
            jaw_weights: array!("jaw_weights"),
            jaw_pivot: array!("jaw_pivot"),
            faces: array!("faces"),
            landmark_indices: array!("landmark_indices"),
            uv_coords: array!("uv_coords"),
            texture_mean: array!("texture_mean"),
            texture_basis: array!("texture_basis"),
            detail_basis: array!("detail_basis"),
            mirror_map: array!("mirror_map"),
        };

        Self::from_data(data, device).map_err(|e| match e {
            Error::ShapeMismatch { context, expected, actual } => invalid(format!(
                "{context}: expected shape {expected:?}, got {actual:?}"
            )),
            other => other,
        })
    }

    /// Builds the model from in-memory arrays.
    pub fn from_data(data: MorphableData, device: &B::Device) -> Result<Self> {
        let v = data.template.nrows();
        let check = |context: &'static str, expected: Vec<usize>, actual: &[usize]| -> Result<()> {
            if expected != actual {
                return Err(Error::shape(context, expected, actual.to_vec()));
            }
            Ok(())
        };

        check("template", vec![v, 3], data.template.shape())?;
        check(
            "shape_basis",
            vec![v * 3, data.shape_basis.ncols()],
            data.shape_basis.shape(),
        )?;
        check(
            "expression_basis",
            vec![v * 3, data.expression_basis.ncols()],
            data.expression_basis.shape(),
        )?;
        check("jaw_weights", vec![v], data.jaw_weights.shape())?;
        check("jaw_pivot", vec![3], data.jaw_pivot.shape())?;
        check("faces", vec![data.faces.nrows(), 3], data.faces.shape())?;
        check("uv_coords", vec![v, 2], data.uv_coords.shape())?;
        let texels = data.texture_mean.nrows();
        let t = (texels as f64).sqrt() as usize;
        check("texture_mean", vec![t * t, 3], data.texture_mean.shape())?;
        check(
            "texture_basis",
            vec![t * t * 3, data.texture_basis.ncols()],
            data.texture_basis.shape(),
        )?;
        check(
            "detail_basis",
            vec![v, data.detail_basis.ncols()],
            data.detail_basis.shape(),
        )?;
        check("mirror_map", vec![v], data.mirror_map.shape())?;

        let f = data.faces.nrows();
        let l = data.landmark_indices.len();

        let float2 = |a: &Array2<f32>| {
            let shape = [a.nrows(), a.ncols()];
            let vec: Vec<f32> = a.iter().copied().collect();
            Tensor::<B, 2>::from_data(TensorData::new(vec, shape), device)
        };
        let ints = |a: &Array1<u32>| {
            let vec: Vec<i32> = a.iter().map(|&i| i as i32).collect();
            Tensor::<B, 1, Int>::from_data(TensorData::new(vec, [a.len()]), device)
        };

        // Transposed bases: decoding is `coeffs [B, D] × basis [D, V*3]`.
        let transposed = |a: &Array2<f32>| {
            let t = a.t();
            let shape = [t.nrows(), t.ncols()];
            let vec: Vec<f32> = t.iter().copied().collect();
            Tensor::<B, 2>::from_data(TensorData::new(vec, shape), device)
        };

        let faces_host: Vec<[u32; 3]> = data
            .faces
            .rows()
            .into_iter()
            .map(|r| [r[0], r[1], r[2]])
            .collect();
        for face in &faces_host {
            for &idx in face {
                if idx as usize >= v {
                    return Err(Error::shape("faces index", vec![v], vec![idx as usize]));
                }
            }
        }
        for &idx in &data.landmark_indices {
            if idx as usize >= v {
                return Err(Error::shape("landmark index", vec![v], vec![idx as usize]));
            }
        }
        for &idx in &data.mirror_map {
            if idx as usize >= v {
                return Err(Error::shape("mirror index", vec![v], vec![idx as usize]));
            }
        }
        let uv_host: Vec<[f32; 2]> = data
            .uv_coords
            .rows()
            .into_iter()
            .map(|r| [r[0], r[1]])
            .collect();

        let faces = [0, 1, 2].map(|corner| {
            let column: Vec<i32> = faces_host.iter().map(|f| f[corner] as i32).collect();
            Tensor::<B, 1, Int>::from_data(TensorData::new(column, [f]), device)
        });

        let (tap_idx, tap_w) = bilinear_taps(&uv_host, t);
        let tex_taps = Tensor::<B, 1, Int>::from_data(TensorData::new(tap_idx, [v * 4]), device);
        let tex_tap_weights =
            Tensor::<B, 1>::from_data(TensorData::new(tap_w, [v * 4]), device).reshape([1, v, 4, 1]);

        Ok(Self {
            device: device.clone(),
            num_vertices: v,
            num_faces: f,
            num_landmarks: l,
            texture_size: t,
            template: float2(&data.template),
            shape_basis: transposed(&data.shape_basis),
            expression_basis: transposed(&data.expression_basis),
            jaw_weights: Tensor::<B, 1>::from_data(
                TensorData::new(data.jaw_weights.to_vec(), [v]),
                device,
            )
            .reshape([1, v, 1]),
            jaw_pivot: Tensor::<B, 1>::from_data(
                TensorData::new(data.jaw_pivot.to_vec(), [3]),
                device,
            )
            .reshape([1, 1, 3]),
            faces,
            landmark_indices: ints(&data.landmark_indices),
            texture_mean: float2(&data.texture_mean).reshape([1, t * t, 3]),
            texture_basis: transposed(&data.texture_basis),
            detail_basis: transposed(&data.detail_basis),
            mirror_map: ints(&data.mirror_map),
            tex_taps,
            tex_tap_weights,
            faces_host,
            uv_host,
        })
    }

    /// Sub-vector dimensionalities dictated by this model.
    pub fn dims(&self) -> FaceDims {
        FaceDims::new()
            .with_shape(self.shape_basis.dims()[0])
            .with_expression(self.expression_basis.dims()[0])
            .with_pose(6)
            .with_camera(3)
            .with_albedo(self.texture_basis.dims()[0])
            .with_lighting(27)
            .with_detail(self.detail_basis.dims()[0])
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }

    pub fn num_faces(&self) -> usize {
        self.num_faces
    }

    pub fn num_landmarks(&self) -> usize {
        self.num_landmarks
    }

    /// Edge length of the square albedo texture.
    pub fn texture_size(&self) -> usize {
        self.texture_size
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// The neutral-expression template vertices, `[V, 3]`.
    pub fn neutral_template(&self) -> Tensor<B, 2> {
        self.template.clone()
    }

    /// Mirror partner index per vertex, `[V]`.
    pub fn mirror_map(&self) -> Tensor<B, 1, Int> {
        self.mirror_map.clone()
    }

    /// Decodes parameters into a mesh and texture.
    ///
    /// When `params.detail` is present, per-vertex displacements along the
    /// (pre-rotation) vertex normals are added before the global rotation is
    /// applied. The per-vertex displacement amounts are also returned so the
    /// detail regularizers can see them.
    pub fn decode(&self, params: &FaceParameters<B>) -> Result<(Mesh<B>, Option<Tensor<B, 2>>)> {
        params.check_dims(&self.dims())?;
        let batch = params.batch_size();
        let v = self.num_vertices;

        let offsets = params.shape.clone().matmul(self.shape_basis.clone())
            + params
                .expression
                .clone()
                .matmul(self.expression_basis.clone());
        let mut vertices = self.template.clone().reshape([1, v, 3]) + offsets.reshape([batch, v, 3]);

        // Jaw articulation: rotate about the pivot, blended by skinning weight.
        let jaw_rot = rodrigues(params.jaw_pose());
        let centered = vertices.clone() - self.jaw_pivot.clone();
        let rotated = centered.matmul(jaw_rot.transpose()) + self.jaw_pivot.clone();
        vertices = self.jaw_weights.clone() * rotated
            + (self.jaw_weights.clone().neg() + 1.0) * vertices;

        let displacement = match &params.detail {
            Some(detail) => {
                let normals = self.vertex_normals(vertices.clone());
                let amount = detail.clone().matmul(self.detail_basis.clone());
                vertices = vertices + amount.clone().reshape([batch, v, 1]) * normals;
                Some(amount)
            }
            None => None,
        };

        // Global head rotation last, so jaw and detail act in face space.
        let global_rot = rodrigues(params.global_pose());
        let vertices = vertices.matmul(global_rot.transpose());

        let landmarks = vertices.clone().select(1, self.landmark_indices.clone());

        let texels = self.texture_size * self.texture_size;
        let texture = (self.texture_mean.clone()
            + params
                .albedo
                .clone()
                .matmul(self.texture_basis.clone())
                .reshape([batch, texels, 3]))
        .clamp(0.0, 1.0);

        Ok((
            Mesh {
                vertices,
                landmarks,
                texture,
            },
            displacement,
        ))
    }

    /// Area-weighted vertex normals, `[B, V, 3]`, unit length.
    pub fn vertex_normals(&self, vertices: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, v, _] = vertices.dims();
        let f = self.num_faces;

        let corner = |i: usize| vertices.clone().select(1, self.faces[i].clone());
        let v0 = corner(0);
        let e1 = corner(1) - v0.clone();
        let e2 = corner(2) - v0;
        let face_normals = cross(e1, e2);

        let mut normals = Tensor::<B, 3>::zeros([batch, v, 3], &self.device);
        for i in 0..3 {
            let idx = self.faces[i]
                .clone()
                .reshape([1, f, 1])
                .expand([batch, f, 3]);
            normals = normals.scatter(1, idx, face_normals.clone());
        }

        let norm = normals
            .clone()
            .powi_scalar(2)
            .sum_dim(2)
            .sqrt()
            .clamp_min(1e-8);
        normals / norm
    }

    /// Per-vertex albedo colors: the texture sampled at the fixed UVs.
    ///
    /// The bilinear taps are precomputed at load time, so sampling reduces to
    /// a gather with constant weights and stays differentiable with respect
    /// to the texture.
    pub fn sample_texture(&self, texture: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, _, _] = texture.dims();
        let v = self.num_vertices;
        let taps = texture.select(1, self.tex_taps.clone()).reshape([batch, v, 4, 3]);
        let weighted: Tensor<B, 4> = taps * self.tex_tap_weights.clone();
        let summed: Tensor<B, 4> = weighted.sum_dim(2);
        summed.reshape([batch, v, 3])
    }

    /// Writes one batch element of a mesh as a Wavefront OBJ with UVs and
    /// host-computed normals.
    pub fn export_obj(&self, mesh: &Mesh<B>, index: usize, out: &mut dyn Write) -> Result<()> {
        let [batch, v, _] = mesh.vertices.dims();
        if index >= batch {
            return Err(Error::shape("export_obj batch index", [batch], [index]));
        }

        let verts: Vec<f32> = mesh
            .vertices
            .clone()
            .slice([index..index + 1, 0..v, 0..3])
            .reshape([v * 3])
            .into_data()
            .to_vec()
            .expect("vertex readback");
        let positions: Vec<nalgebra::Point3<f32>> = verts
            .chunks_exact(3)
            .map(|c| nalgebra::Point3::new(c[0], c[1], c[2]))
            .collect();

        let mut normals = vec![nalgebra::Vector3::zeros(); v];
        for face in &self.faces_host {
            let [a, b, c] = face.map(|i| i as usize);
            let n = (positions[b] - positions[a]).cross(&(positions[c] - positions[a]));
            normals[a] += n;
            normals[b] += n;
            normals[c] += n;
        }

        for p in &positions {
            writeln!(out, "v {} {} {}", p.x, p.y, p.z)?;
        }
        for uv in &self.uv_host {
            writeln!(out, "vt {} {}", uv[0], uv[1])?;
        }
        for n in &normals {
            let n = n.try_normalize(1e-12).unwrap_or_else(nalgebra::Vector3::z);
            writeln!(out, "vn {} {} {}", n.x, n.y, n.z)?;
        }
        for face in &self.faces_host {
            let [a, b, c] = face.map(|i| i + 1);
            writeln!(out, "f {a}/{a}/{a} {b}/{b}/{b} {c}/{c}/{c}")?;
        }
        Ok(())
    }
}

/// Converts batched axis-angle vectors `[B, 3]` to rotation matrices
/// `[B, 3, 3]` via the Rodrigues formula.
pub fn rodrigues<B: Backend>(axis_angle: Tensor<B, 2>) -> Tensor<B, 3> {
    let [batch, _] = axis_angle.dims();
    let device = axis_angle.device();

    let angle = axis_angle
        .clone()
        .powi_scalar(2)
        .sum_dim(1)
        .sqrt()
        .clamp_min(1e-8);
    let axis = axis_angle / angle.clone();

    let col = |i: usize| axis.clone().slice([0..batch, i..i + 1]);
    let zero = Tensor::<B, 2>::zeros([batch, 1], &device);
    let (x, y, z) = (col(0), col(1), col(2));

    // Skew-symmetric cross-product matrix K, rows stacked.
    let row0 = Tensor::cat(vec![zero.clone(), z.clone().neg(), y.clone()], 1);
    let row1 = Tensor::cat(vec![z, zero.clone(), x.clone().neg()], 1);
    let row2 = Tensor::cat(vec![y.neg(), x, zero], 1);
    let k: Tensor<B, 3> = Tensor::stack(vec![row0, row1, row2], 1);

    let sin = angle.clone().sin().reshape([batch, 1, 1]);
    let one_minus_cos = (angle.cos().neg() + 1.0).reshape([batch, 1, 1]);
    let eye = Tensor::<B, 2>::eye(3, &device)
        .reshape([1, 3, 3])
        .expand([batch, 3, 3]);

    eye + k.clone() * sin + k.clone().matmul(k) * one_minus_cos
}

/// Batched cross product of `[B, N, 3]` tensors.
pub fn cross<B: Backend>(a: Tensor<B, 3>, b: Tensor<B, 3>) -> Tensor<B, 3> {
    let [batch, n, _] = a.dims();
    let comp = |t: &Tensor<B, 3>, i: usize| t.clone().slice([0..batch, 0..n, i..i + 1]);
    let (ax, ay, az) = (comp(&a, 0), comp(&a, 1), comp(&a, 2));
    let (bx, by, bz) = (comp(&b, 0), comp(&b, 1), comp(&b, 2));
    Tensor::cat(
        vec![
            ay.clone() * bz.clone() - az.clone() * by.clone(),
            az * bx.clone() - ax.clone() * bz,
            ax * by - ay * bx,
        ],
        2,
    )
}

/// Precomputes the 4 bilinear texel taps and weights for each vertex UV.
fn bilinear_taps(uv: &[[f32; 2]], texture_size: usize) -> (Vec<i32>, Vec<f32>) {
    let t = texture_size;
    let mut indices = Vec::with_capacity(uv.len() * 4);
    let mut weights = Vec::with_capacity(uv.len() * 4);
    for &[u, v] in uv {
        let x = u.clamp(0.0, 1.0) * (t - 1) as f32;
        let y = v.clamp(0.0, 1.0) * (t - 1) as f32;
        let (x0, y0) = (x.floor() as usize, y.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(t - 1), (y0 + 1).min(t - 1));
        let (fx, fy) = (x - x0 as f32, y - y0 as f32);

        indices.extend([
            (y0 * t + x0) as i32,
            (y0 * t + x1) as i32,
            (y1 * t + x0) as i32,
            (y1 * t + x1) as i32,
        ]);
        weights.extend([
            (1.0 - fy) * (1.0 - fx),
            (1.0 - fy) * fx,
            fy * (1.0 - fx),
            fy * fx,
        ]);
    }
    (indices, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{cpu, synthetic_morphable, Cpu};
    use approx::assert_abs_diff_eq;
    use burn::tensor::Tensor;

    fn zero_params(model: &Morphable<Cpu>, batch: usize) -> FaceParameters<Cpu> {
        let dims = model.dims();
        let packed = Tensor::<Cpu, 2>::zeros([batch, dims.coarse_total()], &cpu());
        FaceParameters::split(packed, &dims).unwrap()
    }

    #[test]
    fn zero_expression_matches_neutral_template() {
        let model = synthetic_morphable(42);
        let params = zero_params(&model, 1);
        let (mesh, _) = model.decode(&params).unwrap();

        let decoded: Vec<f32> = mesh.vertices.into_data().to_vec().unwrap();
        let template: Vec<f32> = model.neutral_template().into_data().to_vec().unwrap();
        for (a, b) in decoded.iter().zip(&template) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn decode_shapes() {
        let model = synthetic_morphable(7);
        let (mesh, displacement) = model.decode(&zero_params(&model, 3)).unwrap();
        assert_eq!(mesh.vertices.dims(), [3, model.num_vertices(), 3]);
        assert_eq!(mesh.landmarks.dims(), [3, model.num_landmarks(), 3]);
        let texels = model.texture_size() * model.texture_size();
        assert_eq!(mesh.texture.dims(), [3, texels, 3]);
        assert!(displacement.is_none());
    }

    #[test]
    fn detail_produces_displacement() {
        let model = synthetic_morphable(8);
        let dims = model.dims();
        let mut params = zero_params(&model, 2);
        params.detail = Some(Tensor::<Cpu, 2>::ones([2, dims.detail], &cpu()));
        let (_, displacement) = model.decode(&params).unwrap();
        assert_eq!(
            displacement.unwrap().dims(),
            [2, model.num_vertices()]
        );
    }

    #[test]
    fn decode_rejects_wrong_dims() {
        let model = synthetic_morphable(9);
        let mut params = zero_params(&model, 1);
        params.shape = Tensor::<Cpu, 2>::zeros([1, model.dims().shape + 2], &cpu());
        assert!(matches!(
            model.decode(&params).unwrap_err(),
            Error::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn rodrigues_identity_for_zero_angle() {
        let rot = rodrigues(Tensor::<Cpu, 2>::zeros([1, 3], &cpu()));
        let data: Vec<f32> = rot.into_data().to_vec().unwrap();
        let eye = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        for (a, b) in data.iter().zip(&eye) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn rodrigues_quarter_turn_about_z() {
        use std::f32::consts::FRAC_PI_2;
        let aa = Tensor::<Cpu, 2>::from_floats([[0.0, 0.0, FRAC_PI_2]], &cpu());
        let rot = rodrigues(aa);
        // Row-vector convention: v' = v Rᵀ, so R (1,0,0) = (0,1,0).
        let x = Tensor::<Cpu, 3>::from_floats([[[1.0, 0.0, 0.0]]], &cpu());
        let rotated: Vec<f32> = x
            .matmul(rot.transpose())
            .into_data()
            .to_vec()
            .unwrap();
        assert_abs_diff_eq!(rotated[0], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(rotated[1], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(rotated[2], 0.0, epsilon = 1e-5);
    }

    #[test]
    fn vertex_normals_unit_length() {
        let model = synthetic_morphable(4);
        let (mesh, _) = model.decode(&zero_params(&model, 1)).unwrap();
        let normals = model.vertex_normals(mesh.vertices);
        let norms: Vec<f32> = normals
            .powi_scalar(2)
            .sum_dim(2)
            .sqrt()
            .into_data()
            .to_vec()
            .unwrap();
        for n in norms {
            // Vertices not referenced by any face keep a zero normal.
            assert!(n < 1.0 + 1e-4, "normal norm {n} out of range");
        }
    }

    #[test]
    fn obj_export_counts() {
        let model = synthetic_morphable(3);
        let (mesh, _) = model.decode(&zero_params(&model, 1)).unwrap();
        let mut buf = Vec::new();
        model.export_obj(&mesh, 0, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let count = |prefix: &str| text.lines().filter(|l| l.starts_with(prefix)).count();
        assert_eq!(count("v "), model.num_vertices());
        assert_eq!(count("vt "), model.num_vertices());
        assert_eq!(count("f "), model.num_faces());
    }
}
