//! Two-body utilities: classical elements and analytic propagation.

pub mod orbits;
