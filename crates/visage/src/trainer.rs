//! The staged training loop.
//!
//! Training proceeds through an explicit [`Stage`] state machine:
//! [`Stage::Coarse`] fits shape/expression/pose/camera/albedo/lighting with
//! the detail tower untouched, [`Stage::Detail`] unfreezes the detail tower
//! (and optionally keeps refining the coarse one), [`Stage::Stopped`] ends
//! the run. Joint optimization from scratch makes the coarse and detail
//! gradients fight each other, which is the whole reason for the staging.
//!
//! A non-finite loss skips the optimizer update for that step; a configured
//! number of consecutive non-finite steps aborts the run with
//! [`Error::NumericalDivergence`].

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burn::config::Config;
use burn::module::Module;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::data::{FaceBatch, Prefetcher};
use crate::emotion::{EmotionNet, EmotionNetConfig};
use crate::encoder::{EncoderConfig, FaceEncoder};
use crate::error::Error;
use crate::losses::{aggregate, LossContext, LossTerm, LossWeights};
use crate::morphable::Morphable;
use crate::render::{RenderOptions, Renderer};

/// Checkpoint format revision.
const CHECKPOINT_VERSION: u32 = 1;
const META_FILE: &str = "state.json";
pub(crate) const ENCODER_FILE: &str = "encoder";
const OPTIMIZER_FILE: &str = "optimizer";

/// Current phase of the staged schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Train the coarse tower only; no detail coefficients are produced.
    Coarse,
    /// Train the detail tower; the coarse tower keeps training only when
    /// configured to.
    Detail,
    /// The schedule has run its course; stepping is a no-op.
    Stopped,
}

impl Stage {
    fn uses_detail(self) -> bool {
        matches!(self, Stage::Detail)
    }
}

#[derive(Config, Debug)]
pub struct TrainerConfig {
    #[config(default = "EncoderConfig::new()")]
    pub encoder: EncoderConfig,
    #[config(default = "RenderOptions::new()")]
    pub render: RenderOptions,
    #[config(default = "EmotionNetConfig::new()")]
    pub emotion: EmotionNetConfig,

    #[config(default = 1e-4)]
    pub learning_rate: f64,
    /// Per-step multiplicative learning-rate decay (1.0 disables).
    #[config(default = 1.0)]
    pub learning_rate_decay: f64,
    /// Per-step multiplicative decay of the coefficient regularizer weights
    /// (1.0 disables).
    #[config(default = 1.0)]
    pub regularizer_decay: f64,

    /// Steps spent in the coarse stage before switching to detail.
    #[config(default = 10000)]
    pub coarse_steps: u64,
    /// Steps spent in the detail stage before stopping.
    #[config(default = 10000)]
    pub detail_steps: u64,
    /// Keep optimizing the coarse tower during the detail stage.
    #[config(default = false)]
    pub train_coarse_in_detail: bool,

    /// Consecutive non-finite losses tolerated before the run is aborted.
    #[config(default = 5)]
    pub nan_window: u32,
    /// Emit a checkpoint every N applied steps (0 disables; requires a
    /// checkpoint directory).
    #[config(default = 0)]
    pub checkpoint_every: u64,

    /// Width of the loss-plateau window for early stage transition
    /// (0 disables the plateau trigger).
    #[config(default = 0)]
    pub plateau_window: u64,
    /// Minimum relative improvement across the plateau window below which the
    /// coarse stage is considered converged.
    #[config(default = 1e-3)]
    pub plateau_min_improvement: f64,
}

/// What happened to one training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Gradients were applied.
    Applied,
    /// The loss was non-finite; no parameters changed.
    SkippedNonFinite,
    /// The trainer is in [`Stage::Stopped`].
    Stopped,
}

/// Per-step report: index, stage and the loss breakdown.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: u64,
    pub stage: Stage,
    pub outcome: StepOutcome,
    pub total: f32,
    pub terms: Vec<(LossTerm, f32)>,
}

impl StepReport {
    /// Weighted contribution of one term, if it was active this step.
    pub fn value_of(&self, term: LossTerm) -> Option<f32> {
        self.terms.iter().find(|(t, _)| *t == term).map(|(_, v)| *v)
    }
}

#[derive(Serialize, Deserialize)]
pub(crate) struct CheckpointMeta {
    version: u32,
    step: u64,
    stage: Stage,
    stage_entered_at: u64,
    learning_rate: f64,
    nan_streak: u32,
    weights: LossWeights,
    recent_totals: Vec<f64>,
    pub(crate) encoder: EncoderConfig,
    pub(crate) coarse_total: usize,
    pub(crate) detail_dim: usize,
}

/// Reads and validates a checkpoint's metadata file.
pub(crate) fn load_checkpoint_meta(dir: &Path) -> crate::Result<CheckpointMeta> {
    let corrupt = |reason: String| Error::CheckpointCorruption {
        path: dir.into(),
        reason,
    };
    let meta: CheckpointMeta = serde_json::from_reader(
        File::open(dir.join(META_FILE)).map_err(|e| corrupt(e.to_string()))?,
    )
    .map_err(|e| corrupt(e.to_string()))?;
    if meta.version != CHECKPOINT_VERSION {
        return Err(corrupt(format!(
            "checkpoint version {} (expected {CHECKPOINT_VERSION})",
            meta.version
        )));
    }
    Ok(meta)
}

/// The training loop. Owns the only mutable state of the whole pipeline.
pub struct Trainer<B: AutodiffBackend, O> {
    config: TrainerConfig,
    encoder: FaceEncoder<B>,
    renderer: Renderer<B>,
    emotion: Option<EmotionNet<B>>,
    optim: O,
    weights: LossWeights,
    learning_rate: f64,
    stage: Stage,
    step: u64,
    stage_entered_at: u64,
    nan_streak: u32,
    recent_totals: Vec<f64>,
    checkpoint_dir: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl<B: AutodiffBackend, O> std::fmt::Debug for Trainer<B, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("stage", &self.stage)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl<B: AutodiffBackend> Trainer<B, ()> {
    /// Builds a trainer around an already loaded face model and (optional)
    /// emotion network.
    ///
    /// The emotion network may only be omitted while every emotion weight in
    /// `weights` is zero.
    pub fn new(
        config: TrainerConfig,
        morphable: Morphable<B>,
        emotion: Option<EmotionNet<B>>,
        weights: LossWeights,
        device: &B::Device,
    ) -> crate::Result<Trainer<B, impl Optimizer<FaceEncoder<B>, B>>> {
        if weights.any_emotion() && emotion.is_none() {
            return Err(Error::MissingArtifact {
                path: "<emotion network>".into(),
            });
        }

        let dims = morphable.dims();
        let encoder = config.encoder.init::<B>(&dims, device);
        let renderer = Renderer::new(morphable, config.render.clone());
        let optim = AdamConfig::new().init();
        let learning_rate = config.learning_rate;

        Ok(Trainer {
            config,
            encoder,
            renderer,
            emotion,
            optim,
            weights,
            learning_rate,
            stage: Stage::Coarse,
            step: 0,
            stage_entered_at: 0,
            nan_streak: 0,
            recent_totals: Vec::new(),
            checkpoint_dir: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Convenience constructor loading both pretrained artifacts from their
    /// versioned paths. Fails with [`Error::MissingArtifact`] when either is
    /// absent.
    pub fn from_artifacts(
        config: TrainerConfig,
        face_model: impl AsRef<Path>,
        emotion_net: impl AsRef<Path>,
        device: &B::Device,
    ) -> crate::Result<Trainer<B, impl Optimizer<FaceEncoder<B>, B>>> {
        let morphable = Morphable::load(face_model, device)?;
        let emotion = EmotionNet::load(emotion_net, &config.emotion, device)?;
        let weights = LossWeights::coarse_defaults();
        Trainer::new(config, morphable, Some(emotion), weights, device)
    }
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<FaceEncoder<B>, B>,
{
    /// Enables periodic checkpoint emission into `dir`.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Replaces the active loss weights (e.g. to disable a term).
    pub fn set_weights(&mut self, weights: LossWeights) {
        self.weights = weights;
    }

    pub fn weights(&self) -> &LossWeights {
        &self.weights
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn encoder(&self) -> &FaceEncoder<B> {
        &self.encoder
    }

    /// A flag that interrupts [`Trainer::train`] at the next step boundary.
    /// In-flight steps always run to completion.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Runs one optimization step on a batch.
    pub fn step(&mut self, batch: &FaceBatch<B>) -> crate::Result<StepReport> {
        if self.stage == Stage::Stopped {
            return Ok(StepReport {
                step: self.step,
                stage: self.stage,
                outcome: StepOutcome::Stopped,
                total: 0.0,
                terms: Vec::new(),
            });
        }

        self.encoder.validate_input(&batch.images)?;

        // Encode. In the detail stage the coarse sub-vectors are detached
        // unless the coarse tower keeps training, so gradients only reach
        // the towers the stage declares trainable.
        let mut params = self.encoder.forward_coarse(batch.images.clone())?;
        if self.stage.uses_detail() {
            if !self.config.train_coarse_in_detail {
                params = params.detach_coarse();
            }
            params.detail = Some(self.encoder.forward_detail(batch.images.clone())?);
        }

        // Decode + render.
        let (mesh, displacement) = self.renderer.model().decode(&params)?;
        let rendered = self.renderer.render(
            &mesh,
            params.camera.clone(),
            params.sh_lighting(),
            Some(&batch.images),
        )?;

        // Aggregate the objective.
        let mirror_map = self.renderer.model().mirror_map();
        let ctx = LossContext {
            params: &params,
            displacement: displacement.as_ref(),
            mirror_map: Some(&mirror_map),
            input: &batch.images,
            rendered: &rendered,
            mask: batch.masks.as_ref(),
            landmarks: batch.landmarks.as_ref(),
            identities: batch.identities.as_deref(),
        };
        let breakdown = aggregate(&self.weights, self.emotion.as_ref(), &ctx)?;
        let total = breakdown.total_value();

        let this_step = self.step;
        self.step += 1;

        if !total.is_finite() {
            self.nan_streak += 1;
            log::warn!(
                "step {this_step} [{:?}]: non-finite loss ({total}), skipping update \
                 ({}/{} in a row)",
                self.stage,
                self.nan_streak,
                self.config.nan_window,
            );
            if self.nan_streak >= self.config.nan_window {
                return Err(Error::NumericalDivergence {
                    step: this_step,
                    streak: self.nan_streak,
                    threshold: self.config.nan_window,
                });
            }
            return Ok(StepReport {
                step: this_step,
                stage: self.stage,
                outcome: StepOutcome::SkippedNonFinite,
                total,
                terms: breakdown.terms,
            });
        }
        self.nan_streak = 0;

        // Backward + update. Frozen components contribute no gradients, so
        // the optimizer only ever touches encoder parameters.
        let grads = breakdown.total.backward();
        let grads = GradientsParams::from_grads(grads, &self.encoder);
        self.encoder = self.optim.step(self.learning_rate, self.encoder.clone(), grads);

        // Schedules.
        self.learning_rate *= self.config.learning_rate_decay;
        self.weights.decay_regularizers(self.config.regularizer_decay);
        self.recent_totals.push(total as f64);

        self.advance_stage();

        if let Some(dir) = self.checkpoint_dir.clone() {
            let every = self.config.checkpoint_every;
            if every > 0 && self.step % every == 0 {
                self.save_checkpoint(&dir)?;
            }
        }

        Ok(StepReport {
            step: this_step,
            stage: self.stage,
            outcome: StepOutcome::Applied,
            total,
            terms: breakdown.terms,
        })
    }

    /// Applies the stage transition rules after an applied step.
    fn advance_stage(&mut self) {
        let in_stage = self.step - self.stage_entered_at;
        match self.stage {
            Stage::Coarse => {
                let out_of_steps = in_stage >= self.config.coarse_steps;
                if out_of_steps || self.plateaued() {
                    log::info!(
                        "entering detail stage at step {} ({})",
                        self.step,
                        if out_of_steps { "step budget" } else { "loss plateau" },
                    );
                    self.stage = Stage::Detail;
                    self.stage_entered_at = self.step;
                    self.recent_totals.clear();
                    self.activate_detail_terms();
                }
            }
            Stage::Detail => {
                if in_stage >= self.config.detail_steps {
                    log::info!("training stopped at step {}", self.step);
                    self.stage = Stage::Stopped;
                    self.stage_entered_at = self.step;
                }
            }
            Stage::Stopped => {}
        }
    }

    /// Adds the detail-stage terms that are not already configured.
    fn activate_detail_terms(&mut self) {
        let defaults = LossWeights::detail_defaults();
        for term in [
            LossTerm::DetailReg,
            LossTerm::DetailMagnitude,
            LossTerm::DetailSymmetry,
        ] {
            if self.weights.get(term) == 0.0 {
                self.weights.set(term, defaults.get(term));
            }
        }
    }

    /// True when the running loss mean stopped improving across the window.
    fn plateaued(&self) -> bool {
        let window = self.config.plateau_window as usize;
        if window == 0 || self.recent_totals.len() < window * 2 {
            return false;
        }
        let tail = &self.recent_totals[self.recent_totals.len() - window..];
        let prev = &self.recent_totals[self.recent_totals.len() - window * 2..]
            [..window];
        let mean = |s: &[f64]| s.iter().sum::<f64>() / s.len() as f64;
        let (recent, earlier) = (mean(tail), mean(prev));
        if earlier <= 0.0 {
            return false;
        }
        (earlier - recent) / earlier < self.config.plateau_min_improvement
    }

    /// Pulls batches from the prefetcher until the stage machine stops, the
    /// dataset is exhausted, or the cancellation flag is raised.
    pub fn train(&mut self, prefetcher: &mut Prefetcher, device: &B::Device) -> crate::Result<()> {
        while self.stage != Stage::Stopped {
            if self.cancel.load(Ordering::Relaxed) {
                log::info!("training cancelled at step {}", self.step);
                return Ok(());
            }
            let Some(host) = prefetcher.next_batch() else {
                log::info!("dataset exhausted at step {}", self.step);
                return Ok(());
            };
            let batch = host?.to_device::<B>(device);
            let report = self.step(&batch)?;
            log_report(&report);
        }
        Ok(())
    }

    /// Persists the complete [`TrainingState`](crate#components) into `dir`.
    pub fn save_checkpoint(&self, dir: &Path) -> crate::Result<()> {
        std::fs::create_dir_all(dir)?;
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let corrupt = |e: burn::record::RecorderError| Error::CheckpointCorruption {
            path: dir.into(),
            reason: e.to_string(),
        };

        self.encoder
            .clone()
            .save_file(dir.join(ENCODER_FILE), &recorder)
            .map_err(corrupt)?;
        recorder
            .record(self.optim.to_record(), dir.join(OPTIMIZER_FILE))
            .map_err(corrupt)?;

        let dims = self.renderer.model().dims();
        let meta = CheckpointMeta {
            version: CHECKPOINT_VERSION,
            step: self.step,
            stage: self.stage,
            stage_entered_at: self.stage_entered_at,
            learning_rate: self.learning_rate,
            nan_streak: self.nan_streak,
            weights: self.weights.clone(),
            recent_totals: self.recent_totals.clone(),
            encoder: self.config.encoder.clone(),
            coarse_total: dims.coarse_total(),
            detail_dim: dims.detail,
        };
        let file = File::create(dir.join(META_FILE))?;
        serde_json::to_writer_pretty(file, &meta).map_err(|e| Error::CheckpointCorruption {
            path: dir.into(),
            reason: e.to_string(),
        })?;
        log::debug!("checkpoint written to {}", dir.display());
        Ok(())
    }

    /// Restores a trainer from a checkpoint directory.
    ///
    /// Resuming is exact: continuing from a checkpoint reproduces the same
    /// updates as an uninterrupted run on the same batch sequence. Anything
    /// unreadable or inconsistent with the current configuration is
    /// [`Error::CheckpointCorruption`].
    pub fn resume(mut self, dir: &Path, device: &B::Device) -> crate::Result<Self> {
        let corrupt = |reason: String| Error::CheckpointCorruption {
            path: dir.into(),
            reason,
        };

        let meta = load_checkpoint_meta(dir)?;
        let dims = self.renderer.model().dims();
        if meta.coarse_total != dims.coarse_total() || meta.detail_dim != dims.detail {
            return Err(corrupt(format!(
                "parameter layout {}+{} does not match the face model ({}+{})",
                meta.coarse_total,
                meta.detail_dim,
                dims.coarse_total(),
                dims.detail,
            )));
        }

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.encoder = self
            .encoder
            .clone()
            .load_file(dir.join(ENCODER_FILE), &recorder, device)
            .map_err(|e| corrupt(e.to_string()))?;
        let optim_record = recorder
            .load(dir.join(OPTIMIZER_FILE), device)
            .map_err(|e| corrupt(e.to_string()))?;
        self.optim = self.optim.load_record(optim_record);

        self.step = meta.step;
        self.stage = meta.stage;
        self.stage_entered_at = meta.stage_entered_at;
        self.learning_rate = meta.learning_rate;
        self.nan_streak = meta.nan_streak;
        self.weights = meta.weights;
        self.recent_totals = meta.recent_totals;
        Ok(self)
    }
}

fn log_report(report: &StepReport) {
    use std::fmt::Write;

    let mut breakdown = String::new();
    for (term, value) in &report.terms {
        let _ = write!(breakdown, " {}={value:.4}", term.name());
    }
    match report.outcome {
        StepOutcome::Applied => log::info!(
            "step {} [{:?}] loss {:.4}{breakdown}",
            report.step,
            report.stage,
            report.total,
        ),
        StepOutcome::SkippedNonFinite => {}
        StepOutcome::Stopped => {}
    }
}
