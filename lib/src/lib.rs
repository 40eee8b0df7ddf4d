#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::similar_names,
    clippy::doc_markdown
)]
//! Satellite propagation under multi-body gravity, J2 and drag, with
//! sphere-of-influence bookkeeping and frame transformations.
//!
//! Units are kilometers, kilometers per second and seconds throughout,
//! angles are radians unless a function says otherwise.

pub mod apsis;
pub mod arena;
pub mod backend;
pub mod bodies;
pub mod config;
pub mod error;
pub mod forces;
pub mod frames;
pub mod integrator;
pub mod kepler;
pub mod maneuver;
pub mod propagation;
pub mod satellite;
pub mod sim;
pub mod soi;
pub mod time;

pub use error::{Error, PropagationError, Result};
