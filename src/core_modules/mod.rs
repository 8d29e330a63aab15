// THEORY:
// The `core_modules` are the building blocks of the engine, ordered roughly from
// leaves to roots: feature maps and operators, chains and their evaluation, the shared
// image cache, and the trainer contract that the job drives.

pub mod errors;
pub mod evaluator;
pub mod extraction;
pub mod feature_map;
pub mod image_cache;
pub mod image_repository;
pub mod loader;
pub mod operator;
pub mod pooling;
pub mod trainer;
pub mod transform_chain;
