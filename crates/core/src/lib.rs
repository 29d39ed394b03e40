//! stack-analyzer-core
//!
//! Core library for static worst-case stack usage analysis of firmware images.
//!
//! This crate defines the internal IR (model), the per-architecture instruction
//! analyzers, the annotation resolver and call-graph editor, the max-stack-usage
//! engine, report rendering, and the adapters for the external binutils tools.
//!
//! The goal is to keep all substantive logic here so it is fully testable and
//! reusable from multiple frontends (CLI, build integrations, etc.).

pub mod config;
pub mod model;
pub mod services;

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
