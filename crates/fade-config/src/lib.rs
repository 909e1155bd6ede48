//! Process-wide runtime configuration shared by every fade crate.
//!
//! Determinism seeds, tracing setup, and the layered file loader live here so
//! the numeric crates never have to read the environment themselves.

pub mod determinism;
pub mod layered;
pub mod tracing;

pub use layered::{ConfigLayering, LayeredConfig, LayeredConfigError};
