// THEORY:
// This file is the main entry point for the `chain_vision` library crate.
// It follows the standard Rust convention of using `lib.rs` to define the public
// API that will be exposed to external consumers (the bundled CLI, or any program
// that wants to run feature-chain experiments).
//
// The primary goal is to export the `ClassifierJob` and the `PipelineOrchestrator`
// together with the chain-building operations as the high-level interface of the
// engine. The building blocks live in `core_modules` and stay usable on their own
// for callers that only need chains, extraction or the image cache.

pub mod classifier_job;
pub mod config;
pub mod core_modules;
pub mod orchestrator;
pub mod supervisor;

pub use crate::classifier_job::{
    ClassifierJob, JobHandle, JobReport, JobSpec, JobState, Partition, ScoreRecord,
};
pub use crate::config::{ConfigError, EngineConfig};
pub use crate::core_modules::errors::{ChainError, ImageDecodeError, PipelineError};
pub use crate::core_modules::extraction::{ExtractionConfig, grow_by_extraction};
pub use crate::core_modules::feature_map::feature_map::{FeatureMap, Reduction, Size};
pub use crate::core_modules::image_repository::{Image, ImageId, ImageRepository};
pub use crate::core_modules::loader::{FileImageLoader, ImageLoader};
pub use crate::core_modules::operator::{IdentityOperator, KernelOperator, TransformOperator};
pub use crate::core_modules::trainer::{CancelToken, CentroidTrainer, TrainedModel, Trainer};
pub use crate::core_modules::transform_chain::{ChainId, TransformChain};
pub use crate::orchestrator::{ChainSlot, PipelineOrchestrator};
pub use crate::supervisor::JobSupervisor;
