// THEORY:
// The `FeatureMap` is the most fundamental unit of the feature engine. Every stage
// of the system speaks in feature maps: the image loader produces one per (image,
// size), every transform operator consumes one and produces one, and the final
// classifier input vector is nothing more than a set of feature maps laid end to end.
//
// Key architectural principles:
// 1.  **Data Purity**: It is a "dumb" data container. It holds a flattened, row-major
//     grid of `f64` values plus its dimensions and knows how to answer questions about
//     its own data (blankness, sub-regions, rectification). It knows nothing about
//     chains, caches or images.
// 2.  **Read-Only Once Produced**: Once an operator or the loader hands a map back, it
//     is wrapped in an `Arc` and shared by every reader. Nothing mutates a map in place
//     after that point; transformations always produce a new one.
// 3.  **Size Arithmetic**: `Size` carries the reduction rule used by transform chains.
//     Shrinking by an operator's reduction either yields a valid size (both dimensions
//     at least 1) or nothing at all.

pub mod feature_map {
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /// Per-axis shrink applied by a transform operator: (dx, dy).
    pub type Reduction = (u32, u32);

    /// The dimensions of a feature map or of a chain's base/output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct Size {
        /// Number of columns.
        pub width: u32,
        /// Number of rows.
        pub height: u32,
    }

    impl Size {
        pub const fn new(width: u32, height: u32) -> Self {
            Self { width, height }
        }

        pub const fn square(side: u32) -> Self {
            Self::new(side, side)
        }

        /// Number of cells in a map of this size.
        pub fn area(&self) -> usize {
            self.width as usize * self.height as usize
        }

        /// Applies a reduction. Returns `None` when either dimension would drop below 1.
        pub fn shrink(&self, reduction: Reduction) -> Option<Size> {
            let width = self.width.checked_sub(reduction.0)?;
            let height = self.height.checked_sub(reduction.1)?;
            if width < 1 || height < 1 {
                return None;
            }
            Some(Size::new(width, height))
        }
    }

    impl fmt::Display for Size {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}x{}", self.width, self.height)
        }
    }

    /// A dense width x height grid of values, stored row-major.
    #[derive(Debug, Clone, PartialEq)]
    pub struct FeatureMap {
        width: u32,
        height: u32,
        values: Vec<f64>,
    }

    impl FeatureMap {
        pub fn new(width: u32, height: u32, values: Vec<f64>) -> Self {
            debug_assert_eq!(values.len(), width as usize * height as usize);
            Self {
                width,
                height,
                values,
            }
        }

        pub fn zeros(size: Size) -> Self {
            Self::new(size.width, size.height, vec![0.0; size.area()])
        }

        /// Builds a map by evaluating `f(x, y)` for every cell.
        pub fn from_fn(size: Size, f: impl Fn(u32, u32) -> f64) -> Self {
            let mut values = Vec::with_capacity(size.area());
            for y in 0..size.height {
                for x in 0..size.width {
                    values.push(f(x, y));
                }
            }
            Self::new(size.width, size.height, values)
        }

        pub fn width(&self) -> u32 {
            self.width
        }

        pub fn height(&self) -> u32 {
            self.height
        }

        pub fn size(&self) -> Size {
            Size::new(self.width, self.height)
        }

        #[inline]
        pub fn get(&self, x: u32, y: u32) -> f64 {
            self.values[(y * self.width + x) as usize]
        }

        pub fn values(&self) -> &[f64] {
            &self.values
        }

        pub fn into_values(self) -> Vec<f64> {
            self.values
        }

        /// Largest absolute value in the map (0.0 for an empty map).
        pub fn max_abs(&self) -> f64 {
            self.values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
        }

        /// True when every value is within `threshold` of zero.
        pub fn is_blank(&self, threshold: f64) -> bool {
            self.values.iter().all(|v| v.abs() <= threshold)
        }

        /// Copies out the sub-region starting at (x, y). The region must lie inside the map.
        pub fn crop(&self, x: u32, y: u32, size: Size) -> FeatureMap {
            debug_assert!(x + size.width <= self.width && y + size.height <= self.height);
            FeatureMap::from_fn(size, |dx, dy| self.get(x + dx, y + dy))
        }

        /// Absolute value of every cell.
        pub fn rectified(mut self) -> FeatureMap {
            for value in &mut self.values {
                *value = value.abs();
            }
            self
        }
    }
}
