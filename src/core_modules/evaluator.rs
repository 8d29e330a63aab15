// THEORY:
// The chain evaluator turns a chain plus a base feature map into the chain's output,
// and remembers the answer per image inside the chain instance.
//
// Key architectural principles:
// 1.  **Per-Chain Memoization**: Results live in the chain's own map, behind one lock
//     per chain. The lock only guards finding the image's slot; the computation runs
//     under that slot's once-cell, so different images of the same chain compute in
//     parallel and the same image is never computed twice.
// 2.  **Strict Sizes**: A chain is defined over exactly one base size. Handing it
//     anything else is a caller bug (`SizeMismatch`) and is never retried.
// 3.  **Uniform Post-Processing**: After a chain, every output goes through the same
//     canonicalization: max-pool to the canonical size when sizes differ, then
//     optionally rectify.

use crate::core_modules::errors::{ChainError, PipelineError};
use crate::core_modules::feature_map::feature_map::{FeatureMap, Size};
use crate::core_modules::image_repository::ImageId;
use crate::core_modules::pooling::max_pool;
use crate::core_modules::transform_chain::TransformChain;
use once_cell::sync::OnceCell;
use std::sync::{Arc, PoisonError};

/// Source of base feature maps keyed by (image, size).
pub trait BaseLookup: Send + Sync {
    fn base(&self, image_id: ImageId, size: Size) -> Result<Arc<FeatureMap>, PipelineError>;
}

impl TransformChain {
    /// Applies the chain to `image_id`'s base map, computing at most once per image.
    pub fn apply_cached(
        &self,
        image_id: ImageId,
        bases: &dyn BaseLookup,
    ) -> Result<Arc<FeatureMap>, PipelineError> {
        let slot = {
            let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
            results
                .entry(image_id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        slot.get_or_try_init(|| {
            let base = bases.base(image_id, self.base_size())?;
            let output = self.apply_uncached(&base)?;
            Ok::<_, PipelineError>(Arc::new(output))
        })
        .cloned()
    }

    /// Applies the chain without touching its cache. For previews where the caller
    /// already holds a correctly sized base map.
    pub fn apply_uncached(&self, base: &FeatureMap) -> Result<FeatureMap, ChainError> {
        if base.size() != self.base_size() {
            return Err(ChainError::SizeMismatch {
                expected: self.base_size(),
                actual: base.size(),
            });
        }

        let mut current = base.clone();
        for operator in self.operators() {
            current = operator.apply(&current);
        }
        Ok(current)
    }

    /// Number of images with a stored result.
    pub fn cached_len(&self) -> usize {
        let results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        results.values().filter(|slot| slot.get().is_some()).count()
    }

    pub fn clear_cache(&self) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Canonicalizes a chain output: max-pool to `canonical` if needed, then rectify
/// when `positive_only` is set.
pub fn postprocess(map: &FeatureMap, canonical: Size, positive_only: bool) -> FeatureMap {
    let pooled = if map.size() != canonical {
        max_pool(map, canonical)
    } else {
        map.clone()
    };
    if positive_only {
        pooled.rectified()
    } else {
        pooled
    }
}
