// THEORY:
// A `TransformChain` is an ordered, immutable composition of transform operators over
// a fixed base size. It is the unit the whole engine is organized around: the image
// cache is sized by chain base sizes, the evaluator memoizes per chain, and the
// classifier input vector is laid out chain by chain.
//
// Key architectural principles:
// 1.  **Size Invariant**: `final_size = base_size - sum(reduction)`, and both
//     dimensions stay at least 1 at every intermediate step. Construction checks this
//     operator by operator and refuses with `ChainTooSmall` rather than building a
//     chain that could never be evaluated.
// 2.  **Immutability**: A chain never changes after construction. "Growing" a chain
//     builds a brand new chain whose operator list is the parent's plus one.
// 3.  **Instance Identity**: Every chain instance gets its own `ChainId` and its own
//     result cache. Two structurally identical chains do not share cached results.

use crate::core_modules::errors::ChainError;
use crate::core_modules::feature_map::feature_map::{FeatureMap, Size};
use crate::core_modules::image_repository::ImageId;
use crate::core_modules::operator::TransformOperator;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a chain instance. Unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain-{}", self.0)
    }
}

/// Per-image memo slot. The map lock is only held to find or create the slot; the
/// computation itself runs under the slot's once-cell.
pub(crate) type ResultSlot = Arc<OnceCell<Arc<FeatureMap>>>;

pub struct TransformChain {
    id: ChainId,
    base_size: Size,
    final_size: Size,
    operators: Vec<Arc<dyn TransformOperator>>,
    /// Results of `apply_cached`, keyed by image. One lock per chain.
    pub(crate) results: Mutex<HashMap<ImageId, ResultSlot>>,
}

impl TransformChain {
    /// Builds a chain, checking the size invariant after every operator.
    pub fn compose(
        base_size: Size,
        operators: Vec<Arc<dyn TransformOperator>>,
    ) -> Result<Self, ChainError> {
        if base_size.width < 1 || base_size.height < 1 {
            return Err(ChainError::ChainTooSmall {
                base: base_size,
                step: 0,
                reduction: (0, 0),
            });
        }

        let mut current = base_size;
        let mut cumulative = (0u32, 0u32);
        for (step, operator) in operators.iter().enumerate() {
            let (dx, dy) = operator.reduction();
            cumulative = (cumulative.0.saturating_add(dx), cumulative.1.saturating_add(dy));
            current = current
                .shrink((dx, dy))
                .ok_or(ChainError::ChainTooSmall {
                    base: base_size,
                    step,
                    reduction: cumulative,
                })?;
        }

        Ok(Self {
            id: ChainId(NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed)),
            base_size,
            final_size: current,
            operators,
            results: Mutex::new(HashMap::new()),
        })
    }

    /// A chain with no operators; its output is its base map.
    pub fn empty(base_size: Size) -> Result<Self, ChainError> {
        Self::compose(base_size, Vec::new())
    }

    /// New chain = this chain's operators plus `operator`. `self` is untouched.
    pub fn grow(&self, operator: Arc<dyn TransformOperator>) -> Result<Self, ChainError> {
        let mut operators = self.operators.clone();
        operators.push(operator);
        Self::compose(self.base_size, operators)
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn base_size(&self) -> Size {
        self.base_size
    }

    /// Base size minus the cumulative reduction of every operator.
    pub fn final_size(&self) -> Size {
        self.final_size
    }

    pub fn operators(&self) -> &[Arc<dyn TransformOperator>] {
        &self.operators
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformChain")
            .field("id", &self.id)
            .field("base_size", &self.base_size)
            .field("final_size", &self.final_size)
            .field("operators", &self.operators)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::feature_map::feature_map::Reduction;

    #[derive(Debug)]
    struct Shrink(Reduction);

    impl TransformOperator for Shrink {
        fn reduction(&self) -> Reduction {
            self.0
        }

        fn apply(&self, input: &FeatureMap) -> FeatureMap {
            FeatureMap::zeros(input.size().shrink(self.0).unwrap())
        }
    }

    fn ops(reductions: &[Reduction]) -> Vec<Arc<dyn TransformOperator>> {
        reductions
            .iter()
            .map(|r| Arc::new(Shrink(*r)) as Arc<dyn TransformOperator>)
            .collect()
    }

    #[test]
    fn final_size_is_base_minus_cumulative_reduction() {
        let chain = TransformChain::compose(Size::new(20, 16), ops(&[(2, 2), (4, 0), (0, 5)])).unwrap();
        assert_eq!(chain.final_size(), Size::new(14, 9));
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn compose_fails_exactly_when_a_dimension_drops_below_one() {
        let ok = TransformChain::compose(Size::new(5, 5), ops(&[(2, 2), (2, 2)]));
        assert_eq!(ok.unwrap().final_size(), Size::new(1, 1));

        let err = TransformChain::compose(Size::new(5, 5), ops(&[(2, 2), (3, 0)])).unwrap_err();
        assert_eq!(
            err,
            ChainError::ChainTooSmall {
                base: Size::new(5, 5),
                step: 1,
                reduction: (5, 2),
            }
        );
    }

    #[test]
    fn intermediate_steps_are_checked() {
        // Every prefix is checked, so the failing operator index is reported even when
        // later operators have zero reduction.
        let err = TransformChain::compose(Size::new(3, 3), ops(&[(3, 0), (0, 0)])).unwrap_err();
        assert!(matches!(err, ChainError::ChainTooSmall { step: 0, .. }));
    }

    #[test]
    fn grow_leaves_parent_untouched() {
        let parent = TransformChain::compose(Size::new(10, 10), ops(&[(1, 1)])).unwrap();
        let child = parent.grow(Arc::new(Shrink((2, 3)))).unwrap();
        assert_eq!(parent.len(), 1);
        assert_eq!(parent.final_size(), Size::new(9, 9));
        assert_eq!(child.len(), 2);
        assert_eq!(child.final_size(), Size::new(7, 6));
        assert_ne!(parent.id(), child.id());
    }

    #[test]
    fn grow_reports_chain_too_small() {
        let parent = TransformChain::compose(Size::new(4, 4), ops(&[(2, 2)])).unwrap();
        assert!(matches!(
            parent.grow(Arc::new(Shrink((2, 0)))),
            Err(ChainError::ChainTooSmall { .. })
        ));
    }

    #[test]
    fn zero_base_size_is_rejected() {
        assert!(TransformChain::empty(Size::new(0, 4)).is_err());
    }
}
