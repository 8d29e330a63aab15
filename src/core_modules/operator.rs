// THEORY:
// A `TransformOperator` is an opaque capability. The engine only ever asks two
// things of it: how much does it shrink its input (`reduction`), and what does it
// produce for a given input (`apply`). Chains compose operators, caches memoize their
// output, but nothing in the core looks inside one.
//
// Two reference operators ship with the crate:
// - `IdentityOperator`: zero reduction, passes its input through. Useful as a
//   placeholder stage and in tests.
// - `KernelOperator`: valid-mode cross-correlation with a fixed kernel. This is what
//   chain growth by extraction produces, with the extracted patch as its kernel.
//   A kernel of kw x kh shrinks its input by (kw - 1, kh - 1).

use crate::core_modules::feature_map::feature_map::{FeatureMap, Reduction, Size};
use std::fmt;

/// A transform stage in a chain.
pub trait TransformOperator: Send + Sync + fmt::Debug {
    /// How many columns and rows this operator removes from its input.
    fn reduction(&self) -> Reduction;

    /// Produces the output for `input`. The output must be exactly `input` shrunk by
    /// `reduction()`.
    fn apply(&self, input: &FeatureMap) -> FeatureMap;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "operator"
    }
}

/// Zero-reduction pass-through.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityOperator;

impl TransformOperator for IdentityOperator {
    fn reduction(&self) -> Reduction {
        (0, 0)
    }

    fn apply(&self, input: &FeatureMap) -> FeatureMap {
        input.clone()
    }

    fn name(&self) -> &str {
        "identity"
    }
}

/// Valid-mode cross-correlation with a fixed kernel.
#[derive(Debug, Clone)]
pub struct KernelOperator {
    kernel: FeatureMap,
}

impl KernelOperator {
    pub fn new(kernel: FeatureMap) -> Self {
        Self { kernel }
    }

    /// Builds a kernel from an extracted patch, scaled so its largest magnitude is 1.
    pub fn from_patch(patch: FeatureMap) -> Self {
        let peak = patch.max_abs();
        if peak <= f64::EPSILON {
            return Self::new(patch);
        }
        let size = patch.size();
        let scaled = FeatureMap::from_fn(size, |x, y| patch.get(x, y) / peak);
        Self::new(scaled)
    }

    pub fn kernel(&self) -> &FeatureMap {
        &self.kernel
    }
}

impl TransformOperator for KernelOperator {
    fn reduction(&self) -> Reduction {
        (self.kernel.width() - 1, self.kernel.height() - 1)
    }

    fn apply(&self, input: &FeatureMap) -> FeatureMap {
        let (dx, dy) = self.reduction();
        let output_size = Size::new(
            input.width().saturating_sub(dx).max(1),
            input.height().saturating_sub(dy).max(1),
        );
        let kernel_width = self.kernel.width().min(input.width());
        let kernel_height = self.kernel.height().min(input.height());

        FeatureMap::from_fn(output_size, |x, y| {
            let mut sum = 0.0;
            for ky in 0..kernel_height {
                for kx in 0..kernel_width {
                    sum += input.get(x + kx, y + ky) * self.kernel.get(kx, ky);
                }
            }
            sum
        })
    }

    fn name(&self) -> &str {
        "kernel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_has_no_reduction() {
        let input = FeatureMap::from_fn(Size::new(3, 2), |x, y| (x + y) as f64);
        assert_eq!(IdentityOperator.reduction(), (0, 0));
        assert_eq!(IdentityOperator.apply(&input), input);
    }

    #[test]
    fn kernel_reduction_follows_kernel_size() {
        let operator = KernelOperator::new(FeatureMap::zeros(Size::new(3, 2)));
        assert_eq!(operator.reduction(), (2, 1));
    }

    #[test]
    fn kernel_apply_is_valid_cross_correlation() {
        // 3x3 input, 2x2 kernel of ones: each output is the sum of a 2x2 window.
        let input = FeatureMap::from_fn(Size::new(3, 3), |x, y| (y * 3 + x) as f64);
        let operator = KernelOperator::new(FeatureMap::new(2, 2, vec![1.0; 4]));
        let output = operator.apply(&input);
        assert_eq!(output.size(), Size::new(2, 2));
        assert_eq!(output.values(), &[8.0, 12.0, 20.0, 24.0]);
    }

    #[test]
    fn from_patch_normalizes_peak_to_one() {
        let operator = KernelOperator::from_patch(FeatureMap::new(2, 1, vec![-4.0, 2.0]));
        assert_eq!(operator.kernel().values(), &[-1.0, 0.5]);
    }
}
