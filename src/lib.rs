//! Style-baseline and authorship-drift engine for student writing.
//!
//! Text flows through [`features::FeatureExtractor`] into a per-student
//! [`baseline::BaselineModel`], is compared by the [`drift::DriftDetector`],
//! scored by the [`ensemble::DetectionEnsemble`] and fused by the
//! [`integrity::IntegrityScorer`]. [`engine::IntegrityEngine`] wires these to
//! storage and source matching.

pub mod baseline;
pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod drift;
pub mod engine;
pub mod ensemble;
pub mod error;
pub mod features;
pub mod integrity;
pub mod models;
pub mod report;
pub mod retry;
pub mod source;
pub mod store;
pub mod trend;

pub use config::EngineConfig;
pub use engine::IntegrityEngine;
pub use error::{EngineError, EngineResult, EngineWarning};
