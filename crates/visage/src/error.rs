//! Error type shared by all pipeline components.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the capture pipeline.
///
/// Structural problems ([`Error::ShapeMismatch`], [`Error::MissingArtifact`],
/// [`Error::CheckpointCorruption`]) are never recovered from internally;
/// continuing past them would silently produce wrong results. Per-step
/// numerical problems are handled inside the training loop and only surface
/// as [`Error::NumericalDivergence`] once they recur beyond the configured
/// window.
#[derive(Error, Debug)]
pub enum Error {
    /// A tensor did not have the shape a component was configured for.
    #[error("{context}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A required pretrained artifact (face model, emotion network) is absent.
    #[error("missing pretrained artifact at '{}'", path.display())]
    MissingArtifact { path: PathBuf },

    /// A pretrained artifact exists but could not be understood.
    #[error("invalid artifact '{}': {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    /// Training diverged: the loss was NaN/Inf for too many consecutive steps.
    #[error(
        "loss was non-finite for {streak} consecutive steps (threshold {threshold}) at step {step}"
    )]
    NumericalDivergence {
        step: u64,
        streak: u32,
        threshold: u32,
    },

    /// Persisted training state is unreadable or incompatible with the
    /// current configuration.
    #[error("checkpoint at '{}' is corrupt or incompatible: {reason}", path.display())]
    CheckpointCorruption { path: PathBuf, reason: String },

    /// The data loader worker died before the dataset was exhausted.
    #[error("data loader worker exited unexpectedly")]
    DataLoaderDied,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn shape(
        context: &'static str,
        expected: impl Into<Vec<usize>>,
        actual: impl Into<Vec<usize>>,
    ) -> Self {
        Error::ShapeMismatch {
            context,
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
