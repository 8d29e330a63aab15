// THEORY:
// Extraction is how chains grow from data instead of from a fixed operator library.
// A patch is sampled from a source image (optionally pre-filtered through a parent
// chain), and that patch becomes a `KernelOperator` appended to the parent. Feeding
// the next image through the grown chain then measures how strongly each region
// resembles the patch.
//
// Key architectural principles:
// 1.  **Pluggable Randomness**: Every structural choice (patch shape, patch size,
//     patch position) goes through a caller-supplied `rand::Rng`, so tests drive
//     extraction with seeded or stepped generators.
// 2.  **Bounded Retries**: A patch that is all near-zero carries no information. The
//     extractor retries up to `max_attempts` before reporting `DegenerateExtract`.
// 3.  **Blank-Source Short Circuit**: On the very first attempt only, a blank source
//     aborts immediately instead of burning the retry budget. Later attempts do not
//     re-check the source.

use crate::core_modules::errors::ChainError;
use crate::core_modules::feature_map::feature_map::{FeatureMap, Size};
use crate::core_modules::operator::{KernelOperator, TransformOperator};
use crate::core_modules::transform_chain::TransformChain;
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tunables for chain growth by extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Smallest patch edge as a percentage of the source edge.
    pub min_percent: f64,
    /// Largest patch edge as a percentage of the source edge.
    pub max_percent: f64,
    /// Allow square patches.
    pub allow_square: bool,
    /// Allow rectangular patches (width and height drawn independently).
    pub allow_rectangle: bool,
    /// How many patches to try before giving up.
    pub max_attempts: usize,
    /// Values whose magnitude is at or below this count as zero.
    pub blank_threshold: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_percent: 10.0,
            max_percent: 40.0,
            allow_square: true,
            allow_rectangle: true,
            max_attempts: 8,
            blank_threshold: 1e-6,
        }
    }
}

/// Aspect of a sampled patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchShape {
    Square,
    Rectangle,
}

/// Grows `parent` (or starts a new chain at `source`'s size) by one kernel extracted
/// from `source`.
///
/// `source` is the base map at the parent's base size. When a parent is given the
/// patch is taken from the parent's output for `source`, so the new kernel sees what
/// the rest of the chain sees.
pub fn grow_by_extraction<R: Rng>(
    parent: Option<&TransformChain>,
    source: &FeatureMap,
    config: &ExtractionConfig,
    rng: &mut R,
) -> Result<TransformChain, ChainError> {
    let filtered = match parent {
        Some(chain) => chain.apply_uncached(source)?,
        None => source.clone(),
    };

    let max_attempts = config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        if attempt == 1 && filtered.is_blank(config.blank_threshold) {
            debug!("extraction source is blank, abandoning after first attempt");
            return Err(ChainError::DegenerateExtract { attempts: 1 });
        }

        let patch = sample_patch(&filtered, config, rng);
        if patch.is_blank(config.blank_threshold) {
            debug!("extraction attempt {attempt}/{max_attempts} produced a blank {} patch", patch.size());
            continue;
        }

        let operator: Arc<dyn TransformOperator> = Arc::new(KernelOperator::from_patch(patch));
        return match parent {
            Some(chain) => chain.grow(operator),
            None => TransformChain::compose(source.size(), vec![operator]),
        };
    }

    Err(ChainError::DegenerateExtract {
        attempts: max_attempts,
    })
}

/// Samples one patch from `source` according to `config`.
pub fn sample_patch<R: Rng>(
    source: &FeatureMap,
    config: &ExtractionConfig,
    rng: &mut R,
) -> FeatureMap {
    let shape = choose_shape(config, rng);
    let size = patch_size(source.size(), shape, config, rng);
    let x = rng.gen_range(0..=source.width() - size.width);
    let y = rng.gen_range(0..=source.height() - size.height);
    source.crop(x, y, size)
}

fn choose_shape<R: Rng>(config: &ExtractionConfig, rng: &mut R) -> PatchShape {
    match (config.allow_square, config.allow_rectangle) {
        (true, true) => {
            if rng.gen_bool(0.5) {
                PatchShape::Square
            } else {
                PatchShape::Rectangle
            }
        }
        (false, true) => PatchShape::Rectangle,
        _ => PatchShape::Square,
    }
}

fn patch_size<R: Rng>(
    source: Size,
    shape: PatchShape,
    config: &ExtractionConfig,
    rng: &mut R,
) -> Size {
    let (low, high) = if config.min_percent <= config.max_percent {
        (config.min_percent, config.max_percent)
    } else {
        (config.max_percent, config.min_percent)
    };
    let mut fraction = || rng.gen_range(low..=high).clamp(0.0, 100.0) / 100.0;
    let edge = |share: f64, limit: u32| ((share * limit as f64).round() as u32).clamp(1, limit);

    match shape {
        PatchShape::Square => {
            let side = edge(fraction(), source.width.min(source.height));
            Size::square(side)
        }
        PatchShape::Rectangle => {
            let width = edge(fraction(), source.width);
            let height = edge(fraction(), source.height);
            Size::new(width, height)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn gradient(size: Size) -> FeatureMap {
        FeatureMap::from_fn(size, |x, y| (x + y + 1) as f64)
    }

    #[test]
    fn extraction_starts_a_chain_at_source_size() {
        let mut rng = StdRng::seed_from_u64(7);
        let source = gradient(Size::new(20, 20));
        let chain = grow_by_extraction(None, &source, &ExtractionConfig::default(), &mut rng).unwrap();
        assert_eq!(chain.base_size(), Size::new(20, 20));
        assert_eq!(chain.len(), 1);
        let (dx, dy) = chain.operators()[0].reduction();
        assert_eq!(chain.final_size(), Size::new(20 - dx, 20 - dy));
    }

    #[test]
    fn extraction_grows_parent_by_one() {
        let mut rng = StdRng::seed_from_u64(11);
        let source = gradient(Size::new(24, 24));
        let config = ExtractionConfig::default();
        let parent = grow_by_extraction(None, &source, &config, &mut rng).unwrap();
        let child = grow_by_extraction(Some(&parent), &source, &config, &mut rng).unwrap();
        assert_eq!(parent.len(), 1);
        assert_eq!(child.len(), 2);
        assert_eq!(child.base_size(), parent.base_size());
    }

    #[test]
    fn blank_source_abandons_on_first_attempt() {
        let mut rng = StdRng::seed_from_u64(3);
        let source = FeatureMap::zeros(Size::new(16, 16));
        let config = ExtractionConfig {
            max_attempts: 50,
            ..ExtractionConfig::default()
        };
        assert_eq!(
            grow_by_extraction(None, &source, &config, &mut rng).unwrap_err(),
            ChainError::DegenerateExtract { attempts: 1 }
        );
    }

    #[test]
    fn mostly_blank_source_exhausts_retry_budget() {
        // Only the bottom-right cell is non-zero and patches stay small, so most
        // samples are blank; with a single allowed square of 1x1 every attempt misses
        // unless it lands exactly on that cell.
        let size = Size::new(40, 40);
        let source = FeatureMap::from_fn(size, |x, y| if x == 39 && y == 39 { 1.0 } else { 0.0 });
        let config = ExtractionConfig {
            min_percent: 1.0,
            max_percent: 1.0,
            allow_square: true,
            allow_rectangle: false,
            max_attempts: 3,
            blank_threshold: 1e-6,
        };
        // StepRng with zero increment always yields the lowest value, i.e. position (0, 0).
        let mut rng = rand::rngs::mock::StepRng::new(0, 0);
        assert_eq!(
            grow_by_extraction(None, &source, &config, &mut rng).unwrap_err(),
            ChainError::DegenerateExtract { attempts: 3 }
        );
    }

    #[test]
    fn square_only_config_yields_square_patches() {
        let mut rng = StdRng::seed_from_u64(5);
        let config = ExtractionConfig {
            allow_rectangle: false,
            ..ExtractionConfig::default()
        };
        let source = gradient(Size::new(30, 18));
        for _ in 0..20 {
            let patch = sample_patch(&source, &config, &mut rng);
            assert_eq!(patch.width(), patch.height());
            assert!(patch.width() <= 18);
        }
    }

    #[test]
    fn patch_sizes_respect_percent_range() {
        let mut rng = StdRng::seed_from_u64(9);
        let config = ExtractionConfig {
            min_percent: 20.0,
            max_percent: 50.0,
            allow_square: false,
            allow_rectangle: true,
            ..ExtractionConfig::default()
        };
        let source = gradient(Size::new(100, 100));
        for _ in 0..50 {
            let patch = sample_patch(&source, &config, &mut rng);
            assert!((20..=50).contains(&patch.width()));
            assert!((20..=50).contains(&patch.height()));
        }
    }

    #[test]
    fn parent_size_mismatch_is_fatal() {
        let mut rng = StdRng::seed_from_u64(1);
        let parent = TransformChain::empty(Size::new(10, 10)).unwrap();
        let source = gradient(Size::new(12, 10));
        assert!(matches!(
            grow_by_extraction(Some(&parent), &source, &ExtractionConfig::default(), &mut rng),
            Err(ChainError::SizeMismatch { .. })
        ));
    }
}
