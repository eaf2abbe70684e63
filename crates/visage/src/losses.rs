//! The multi-term training objective.
//!
//! Terms are identified by [`LossTerm`] and weighted through [`LossWeights`];
//! a weight of zero short-circuits the term entirely (in particular, the
//! emotion network is never invoked while all emotion weights are zero).
//! Terms are always evaluated in the fixed [`LossTerm::ALL`] order.

use std::collections::BTreeMap;

use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor};
use serde::{Deserialize, Serialize};

use crate::emotion::EmotionNet;
use crate::error::{Error, Result};
use crate::params::FaceParameters;
use crate::render::RenderOutput;

/// Landmark index pairs (68-landmark layout) whose distance tracks eye
/// opening.
const EYE_PAIRS: [(usize, usize); 4] = [(37, 41), (38, 40), (43, 47), (44, 46)];
/// Inner-lip pairs tracking mouth opening.
const LIP_PAIRS: [(usize, usize); 3] = [(61, 67), (62, 66), (63, 65)];

/// Identifier of one term of the training objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LossTerm {
    /// Masked pixel-wise L1 between input and rendering.
    Photometric,
    /// Squared error between projected and ground-truth landmarks.
    Landmark,
    /// L1 between predicted and ground-truth eye openings.
    EyeDistance,
    /// L1 between predicted and ground-truth lip openings.
    LipDistance,
    /// L1 between emotion embeddings of input and rendering.
    EmotionFeature,
    /// L1 between valence predictions.
    EmotionValence,
    /// L1 between arousal predictions.
    EmotionArousal,
    /// L1 between discrete expression distributions.
    EmotionExpression,
    /// L2 on shape coefficients.
    ShapeReg,
    /// L2 on expression coefficients.
    ExpressionReg,
    /// L2 on albedo coefficients.
    AlbedoReg,
    /// Penalizes chromatic (non-monochrome) lighting.
    LightingReg,
    /// L2 on detail coefficients.
    DetailReg,
    /// Mean magnitude of the detail displacement field.
    DetailMagnitude,
    /// Left/right asymmetry of the detail displacement field.
    DetailSymmetry,
    /// Deviation of shape codes from their per-identity batch mean.
    IdentityConsistency,
}

impl LossTerm {
    /// Every term, in evaluation order.
    pub const ALL: [LossTerm; 16] = [
        LossTerm::Photometric,
        LossTerm::Landmark,
        LossTerm::EyeDistance,
        LossTerm::LipDistance,
        LossTerm::EmotionFeature,
        LossTerm::EmotionValence,
        LossTerm::EmotionArousal,
        LossTerm::EmotionExpression,
        LossTerm::ShapeReg,
        LossTerm::ExpressionReg,
        LossTerm::AlbedoReg,
        LossTerm::LightingReg,
        LossTerm::DetailReg,
        LossTerm::DetailMagnitude,
        LossTerm::DetailSymmetry,
        LossTerm::IdentityConsistency,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LossTerm::Photometric => "photometric",
            LossTerm::Landmark => "landmark",
            LossTerm::EyeDistance => "eye_distance",
            LossTerm::LipDistance => "lip_distance",
            LossTerm::EmotionFeature => "emotion_feature",
            LossTerm::EmotionValence => "emotion_valence",
            LossTerm::EmotionArousal => "emotion_arousal",
            LossTerm::EmotionExpression => "emotion_expression",
            LossTerm::ShapeReg => "shape_reg",
            LossTerm::ExpressionReg => "expression_reg",
            LossTerm::AlbedoReg => "albedo_reg",
            LossTerm::LightingReg => "lighting_reg",
            LossTerm::DetailReg => "detail_reg",
            LossTerm::DetailMagnitude => "detail_magnitude",
            LossTerm::DetailSymmetry => "detail_symmetry",
            LossTerm::IdentityConsistency => "identity_consistency",
        }
    }

    /// Whether this term needs the emotion network.
    pub fn is_emotion(&self) -> bool {
        matches!(
            self,
            LossTerm::EmotionFeature
                | LossTerm::EmotionValence
                | LossTerm::EmotionArousal
                | LossTerm::EmotionExpression
        )
    }

    /// Whether the term is a coefficient regularizer subject to weight decay.
    pub fn is_regularizer(&self) -> bool {
        matches!(
            self,
            LossTerm::ShapeReg
                | LossTerm::ExpressionReg
                | LossTerm::AlbedoReg
                | LossTerm::DetailReg
        )
    }
}

/// Named weights of the training objective.
///
/// Mutated only by the training loop's schedule; the aggregator reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LossWeights {
    weights: BTreeMap<LossTerm, f64>,
}

impl LossWeights {
    /// All weights zero.
    pub fn none() -> Self {
        Self {
            weights: BTreeMap::new(),
        }
    }

    /// Weights used for coarse-stage training.
    pub fn coarse_defaults() -> Self {
        let mut w = Self::none();
        w.set(LossTerm::Photometric, 2.0);
        w.set(LossTerm::Landmark, 1.0);
        w.set(LossTerm::EyeDistance, 0.5);
        w.set(LossTerm::LipDistance, 0.5);
        w.set(LossTerm::EmotionFeature, 1.0);
        w.set(LossTerm::EmotionValence, 1.0);
        w.set(LossTerm::EmotionArousal, 1.0);
        w.set(LossTerm::EmotionExpression, 1.0);
        w.set(LossTerm::ShapeReg, 1e-4);
        w.set(LossTerm::ExpressionReg, 1e-4);
        w.set(LossTerm::AlbedoReg, 1e-4);
        w.set(LossTerm::LightingReg, 1.0);
        w.set(LossTerm::IdentityConsistency, 0.5);
        w
    }

    /// Additional terms activated by the detail stage.
    pub fn detail_defaults() -> Self {
        let mut w = Self::coarse_defaults();
        w.set(LossTerm::DetailReg, 1e-4);
        w.set(LossTerm::DetailMagnitude, 0.01);
        w.set(LossTerm::DetailSymmetry, 0.005);
        w
    }

    pub fn get(&self, term: LossTerm) -> f64 {
        self.weights.get(&term).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, term: LossTerm, weight: f64) {
        if weight == 0.0 {
            self.weights.remove(&term);
        } else {
            self.weights.insert(term, weight);
        }
    }

    /// True if any emotion term is active.
    pub fn any_emotion(&self) -> bool {
        LossTerm::ALL
            .iter()
            .any(|t| t.is_emotion() && self.get(*t) > 0.0)
    }

    /// Multiplies every regularizer weight by `factor` (the schedule's decay
    /// step).
    pub fn decay_regularizers(&mut self, factor: f64) {
        for term in LossTerm::ALL {
            if term.is_regularizer() {
                let w = self.get(term);
                if w > 0.0 {
                    self.set(term, w * factor);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (LossTerm, f64)> + '_ {
        self.weights.iter().map(|(t, w)| (*t, *w))
    }
}

/// Everything one training step hands to the aggregator.
pub struct LossContext<'a, B: Backend> {
    pub params: &'a FaceParameters<B>,
    /// Detail displacement amounts `[B, V]`, present in the detail stage.
    pub displacement: Option<&'a Tensor<B, 2>>,
    /// Mirror partner per vertex `[V]`, for the symmetry term.
    pub mirror_map: Option<&'a Tensor<B, 1, Int>>,
    /// Input photo `[B, 3, H, W]`.
    pub input: &'a Tensor<B, 4>,
    pub rendered: &'a RenderOutput<B>,
    /// Face-region mask `[B, 1, H, W]`; the rendered coverage stands in when
    /// absent.
    pub mask: Option<&'a Tensor<B, 4>>,
    /// Ground-truth landmarks in NDC `[B, L, 2]`.
    pub landmarks: Option<&'a Tensor<B, 3>>,
    /// Identity label per batch element.
    pub identities: Option<&'a [u32]>,
}

/// One evaluated objective: the differentiable total plus the per-term
/// weighted contributions for reporting.
#[derive(Debug)]
pub struct LossBreakdown<B: Backend> {
    pub total: Tensor<B, 1>,
    pub terms: Vec<(LossTerm, f32)>,
}

impl<B: Backend> LossBreakdown<B> {
    pub fn value(&self, term: LossTerm) -> Option<f32> {
        self.terms.iter().find(|(t, _)| *t == term).map(|(_, v)| *v)
    }

    pub fn total_value(&self) -> f32 {
        self.total.clone().into_scalar().elem()
    }
}

/// Computes the weighted objective for one step.
pub fn aggregate<B: Backend>(
    weights: &LossWeights,
    emotion: Option<&EmotionNet<B>>,
    ctx: &LossContext<'_, B>,
) -> Result<LossBreakdown<B>> {
    let device = ctx.input.device();
    let mut total = Tensor::<B, 1>::zeros([1], &device);
    let mut terms = Vec::new();

    let emotion_pair = if weights.any_emotion() {
        let net = emotion.ok_or_else(|| Error::MissingArtifact {
            path: "<emotion network not loaded>".into(),
        })?;
        Some((
            net.encode(ctx.input.clone()),
            net.encode(ctx.rendered.image.clone()),
        ))
    } else {
        None
    };

    for term in LossTerm::ALL {
        let weight = weights.get(term);
        if weight == 0.0 {
            continue;
        }
        let Some(value) = term_value(term, ctx, emotion_pair.as_ref()) else {
            continue;
        };
        let weighted = value * weight;
        terms.push((term, weighted.clone().detach().into_scalar().elem()));
        total = total + weighted;
    }

    Ok(LossBreakdown { total, terms })
}

/// Evaluates one unweighted term; `None` when its inputs are absent.
fn term_value<B: Backend>(
    term: LossTerm,
    ctx: &LossContext<'_, B>,
    emotion: Option<&(crate::emotion::EmotionFeatures<B>, crate::emotion::EmotionFeatures<B>)>,
) -> Option<Tensor<B, 1>> {
    match term {
        LossTerm::Photometric => Some(photometric(ctx)),
        LossTerm::Landmark => ctx.landmarks.map(|gt| {
            (ctx.rendered.landmarks.clone() - gt.clone())
                .powi_scalar(2)
                .mean()
        }),
        LossTerm::EyeDistance => ctx
            .landmarks
            .and_then(|gt| pair_distance_loss(&ctx.rendered.landmarks, gt, &EYE_PAIRS)),
        LossTerm::LipDistance => ctx
            .landmarks
            .and_then(|gt| pair_distance_loss(&ctx.rendered.landmarks, gt, &LIP_PAIRS)),
        LossTerm::EmotionFeature => emotion.map(|(input, output)| {
            (input.embedding.clone() - output.embedding.clone())
                .abs()
                .mean()
        }),
        LossTerm::EmotionValence => {
            emotion.map(|(i, o)| (i.valence.clone() - o.valence.clone()).abs().mean())
        }
        LossTerm::EmotionArousal => {
            emotion.map(|(i, o)| (i.arousal.clone() - o.arousal.clone()).abs().mean())
        }
        LossTerm::EmotionExpression => emotion.map(|(i, o)| {
            let dist = |logits: &Tensor<B, 2>| {
                burn::tensor::activation::softmax(logits.clone(), 1)
            };
            (dist(&i.expression_logits) - dist(&o.expression_logits))
                .abs()
                .mean()
        }),
        LossTerm::ShapeReg => Some(sum_sq_half(&ctx.params.shape)),
        LossTerm::ExpressionReg => Some(sum_sq_half(&ctx.params.expression)),
        LossTerm::AlbedoReg => Some(sum_sq_half(&ctx.params.albedo)),
        LossTerm::LightingReg => {
            let sh = ctx.params.sh_lighting();
            let mean = sh.clone().mean_dim(2);
            Some((mean - sh).powi_scalar(2).mean())
        }
        LossTerm::DetailReg => ctx.params.detail.as_ref().map(sum_sq_half),
        LossTerm::DetailMagnitude => ctx.displacement.map(|d| d.clone().abs().mean()),
        LossTerm::DetailSymmetry => match (ctx.displacement, ctx.mirror_map) {
            (Some(displacement), Some(mirror)) => {
                let mirrored = displacement.clone().select(1, mirror.clone()).detach();
                Some((displacement.clone() - mirrored).abs().mean())
            }
            _ => None,
        },
        LossTerm::IdentityConsistency => ctx
            .identities
            .and_then(|ids| identity_consistency(&ctx.params.shape, ids)),
    }
}

/// Masked L1 photometric term. A mask with zero valid elements contributes
/// exactly zero.
fn photometric<B: Backend>(ctx: &LossContext<'_, B>) -> Tensor<B, 1> {
    // The rendered coverage stands in for a missing skin mask; detached so
    // the term cannot shrink its own support.
    let mask = match ctx.mask {
        Some(mask) => mask.clone(),
        None => ctx.rendered.alpha.clone().detach(),
    };

    let valid: f32 = mask.clone().sum().into_scalar().elem();
    if valid <= 0.0 {
        return Tensor::zeros([1], &ctx.input.device());
    }

    let diff = (ctx.rendered.image.clone() - ctx.input.clone()).abs() * mask;
    diff.sum() / (valid * 3.0)
}

/// L1 between predicted and ground-truth landmark pair distances.
///
/// The pair tables assume the 68-landmark layout; other layouts skip the
/// term.
fn pair_distance_loss<B: Backend>(
    predicted: &Tensor<B, 3>,
    truth: &Tensor<B, 3>,
    pairs: &[(usize, usize)],
) -> Option<Tensor<B, 1>> {
    let [_, landmarks, _] = predicted.dims();
    if landmarks != 68 || truth.dims()[1] != 68 {
        return None;
    }

    let distances = |lmk: &Tensor<B, 3>| {
        let [batch, _, _] = lmk.dims();
        let per_pair: Vec<Tensor<B, 1>> = pairs
            .iter()
            .map(|&(a, b)| {
                let pa = lmk.clone().slice([0..batch, a..a + 1, 0..2]);
                let pb = lmk.clone().slice([0..batch, b..b + 1, 0..2]);
                (pa - pb)
                    .powi_scalar(2)
                    .sum_dim(2)
                    .sqrt()
                    .reshape([batch])
            })
            .collect();
        Tensor::stack::<2>(per_pair, 1)
    };

    Some((distances(predicted) - distances(truth)).abs().mean())
}

/// `Σx²/2` over the whole batch.
fn sum_sq_half<B: Backend>(t: &Tensor<B, 2>) -> Tensor<B, 1> {
    t.clone().powi_scalar(2).sum() / 2.0
}

/// Mean squared deviation of shape codes from their per-identity mean.
///
/// Identity grouping is opportunistic: batches without repeated identities
/// contribute zero, and the term is skipped entirely when labels are absent.
fn identity_consistency<B: Backend>(
    shape: &Tensor<B, 2>,
    identities: &[u32],
) -> Option<Tensor<B, 1>> {
    let [batch, _] = shape.dims();
    if identities.len() != batch {
        return None;
    }

    let device = shape.device();
    let mut groups: BTreeMap<u32, Vec<i32>> = BTreeMap::new();
    for (row, &id) in identities.iter().enumerate() {
        groups.entry(id).or_default().push(row as i32);
    }

    let mut value = Tensor::<B, 1>::zeros([1], &device);
    let mut group_count = 0usize;
    for rows in groups.values() {
        if rows.len() < 2 {
            continue;
        }
        let indices = Tensor::<B, 1, Int>::from_data(
            burn::tensor::TensorData::new(rows.clone(), [rows.len()]),
            &device,
        );
        let members = shape.clone().select(0, indices);
        let mean = members.clone().mean_dim(0);
        value = value + (members - mean).powi_scalar(2).mean();
        group_count += 1;
    }

    if group_count == 0 {
        Some(Tensor::zeros([1], &device))
    } else {
        Some(value / group_count as f64)
    }
}
