// THEORY:
// `EngineConfig` gathers every tunable of the engine in one plain struct, the same way
// `PipelineConfig` does for a single pipeline. It can be built three ways: defaults,
// environment variables (prefixed `CHAIN_VISION_`), or a JSON document. Unset or
// unparsable environment values fall back to the default for that field.

use crate::core_modules::extraction::ExtractionConfig;
use crate::core_modules::feature_map::feature_map::Size;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const ENV_PREFIX: &str = "CHAIN_VISION_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Runtime configuration for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Evaluation workers in the orchestrator's pool.
    pub worker_count: usize,
    /// Upper bound on training images drawn per category.
    pub train_per_category: usize,
    /// Mean training error at which the trainer may stop.
    pub error_threshold: f64,
    /// Trainer time budget.
    pub max_seconds: f64,
    /// Size every chain output is pooled to before concatenation.
    pub canonical_size: Size,
    /// Take absolute values of pooled outputs.
    pub positive_only: bool,
    /// Prepend the identity slot (the resized base image) to every vector.
    pub include_raw: bool,
    /// Seed for training-set selection and extraction.
    pub seed: u64,
    pub extraction: ExtractionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            train_per_category: 5,
            error_threshold: 0.1,
            max_seconds: 60.0,
            canonical_size: Size::square(16),
            positive_only: false,
            include_raw: true,
            seed: 0,
            extraction: ExtractionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Builds a config from `CHAIN_VISION_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Keys carry the `CHAIN_VISION_` prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let canonical_edge = parse_or(read("CANONICAL_SIZE"), "CANONICAL_SIZE", defaults.canonical_size.width);
        Self {
            worker_count: parse_or(read("WORKERS"), "WORKERS", defaults.worker_count),
            train_per_category: parse_or(
                read("TRAIN_PER_CATEGORY"),
                "TRAIN_PER_CATEGORY",
                defaults.train_per_category,
            ),
            error_threshold: parse_or(read("ERROR_THRESHOLD"), "ERROR_THRESHOLD", defaults.error_threshold),
            max_seconds: parse_or(read("MAX_SECONDS"), "MAX_SECONDS", defaults.max_seconds),
            canonical_size: Size::square(canonical_edge),
            positive_only: parse_or(read("POSITIVE_ONLY"), "POSITIVE_ONLY", defaults.positive_only),
            include_raw: parse_or(read("INCLUDE_RAW"), "INCLUDE_RAW", defaults.include_raw),
            seed: parse_or(read("SEED"), "SEED", defaults.seed),
            extraction: ExtractionConfig {
                min_percent: parse_or(
                    read("EXTRACT_MIN_PERCENT"),
                    "EXTRACT_MIN_PERCENT",
                    defaults.extraction.min_percent,
                ),
                max_percent: parse_or(
                    read("EXTRACT_MAX_PERCENT"),
                    "EXTRACT_MAX_PERCENT",
                    defaults.extraction.max_percent,
                ),
                max_attempts: parse_or(
                    read("EXTRACT_ATTEMPTS"),
                    "EXTRACT_ATTEMPTS",
                    defaults.extraction.max_attempts,
                ),
                ..defaults.extraction
            },
        }
        .normalized()
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// At least one worker and a canonical size of at least 1x1.
    fn normalized(mut self) -> Self {
        self.worker_count = self.worker_count.max(1);
        self.canonical_size = Size::new(
            self.canonical_size.width.max(1),
            self.canonical_size.height.max(1),
        );
        self
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, name: &str, default: T) -> T {
    match raw {
        None => default,
        Some(text) => text.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring unparsable {ENV_PREFIX}{name}={text:?}");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(EngineConfig::from_lookup(|_| None), EngineConfig::default());
    }

    #[test]
    fn environment_overrides_and_falls_back() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("CHAIN_VISION_WORKERS", "3"),
            ("CHAIN_VISION_CANONICAL_SIZE", "10"),
            ("CHAIN_VISION_POSITIVE_ONLY", "true"),
            ("CHAIN_VISION_SEED", "not-a-number"),
            ("CHAIN_VISION_EXTRACT_ATTEMPTS", " 12 "),
        ]));
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.canonical_size, Size::new(10, 10));
        assert!(config.positive_only);
        assert_eq!(config.seed, 0);
        assert_eq!(config.extraction.max_attempts, 12);
        assert_eq!(config.extraction.min_percent, ExtractionConfig::default().min_percent);
    }

    #[test]
    fn zero_workers_is_clamped() {
        let config = EngineConfig::from_lookup(lookup(&[("CHAIN_VISION_WORKERS", "0")]));
        assert_eq!(config.worker_count, 1);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "train_per_category": 2, "canonical_size": { "width": 8, "height": 6 },
                 "extraction": { "max_attempts": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.train_per_category, 2);
        assert_eq!(config.canonical_size, Size::new(8, 6));
        assert_eq!(config.extraction.max_attempts, 3);
        assert_eq!(config.extraction.max_percent, 40.0);
        assert_eq!(config.error_threshold, EngineConfig::default().error_threshold);
    }

    #[test]
    fn json_degenerate_values_are_clamped() {
        let config = EngineConfig::from_json_str(
            r#"{ "worker_count": 0, "canonical_size": { "width": 0, "height": 0 } }"#,
        )
        .unwrap();
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.canonical_size, Size::new(1, 1));
    }

    #[test]
    fn zero_canonical_edge_from_environment_is_clamped() {
        let config = EngineConfig::from_lookup(lookup(&[("CHAIN_VISION_CANONICAL_SIZE", "0")]));
        assert_eq!(config.canonical_size, Size::new(1, 1));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            EngineConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            EngineConfig::load_from_file("/nonexistent/chain_vision.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
