//! Visage: emotion-preserving monocular 3D face capture.
//!
//! Visage reconstructs a parametric 3D face (shape, expression, pose, camera,
//! albedo, lighting, optional surface detail) from a single RGB image, and can
//! re-render the reconstruction with altered expression or pose. The defining
//! property of the pipeline is *emotion consistency*: a frozen emotion
//! recognition network judges the input photo and the rendered reconstruction,
//! and the training objective penalizes any disagreement between the two.
//!
//! # Components
//!
//! * [`encoder`] — the only trainable part: a convolutional regressor from
//!   images to [`params::FaceParameters`].
//! * [`morphable`] — the fixed linear face model that decodes parameters into
//!   a mesh and texture.
//! * [`render`] — a fixed, fully differentiable soft rasterizer.
//! * [`emotion`] — the frozen emotion feature extractor.
//! * [`losses`] — the weighted multi-term training objective.
//! * [`trainer`] — the staged (coarse → detail) optimization loop with
//!   checkpointing and NaN-resilient stepping.
//! * [`capture`] — the inference path (no losses, deterministic).
//!
//! # Coordinate conventions
//!
//! Mesh vertices live in a right-handed model space with Y up. After the
//! orthographic camera projection, X and Y are in normalized device
//! coordinates (`-1..=1`, Y pointing *down* to match image rows) and larger Z
//! means closer to the camera. Landmark tensors use the same NDC convention.

use log::LevelFilter;

pub mod capture;
pub mod data;
pub mod emotion;
pub mod encoder;
pub mod error;
pub mod losses;
pub mod morphable;
pub mod params;
pub mod render;
pub mod trainer;

#[cfg(test)]
mod test;

pub use error::{Error, Result};

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and visage will log at *debug* level; `RUST_LOG` can
/// override this. If a global logger is already registered, this macro does
/// nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
