// THEORY:
// This file is the main entry point for the `shape_vision` library crate.
// It defines the public API exposed to session drivers such as `visual_tester`.
//
// The primary goal is to export the `TrackingPipeline` and its associated data
// structures (`PipelineConfig`, `FrameReport`, the trajectory stores) as the
// high-level interface for the whole engine, with `Session` as the ready-made
// frame loop around it. The layers underneath (`core_modules`) stay public so
// the detectors, the identity layer and the renderers can be used on their own.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod session;

pub use error::{Error, Result};
