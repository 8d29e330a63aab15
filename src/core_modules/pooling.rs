// THEORY:
// Max-pooling is the bridge between a chain's natural output size and the fixed
// canonical size a classifier expects. Each output cell covers a rectangular window
// of the input and keeps the window's maximum. Windows are derived from the ratio of
// input to output size, so pooling works for any pair of sizes, including the
// degenerate case where the output is larger than the input (windows then overlap
// and a single input cell may feed several outputs).

use crate::core_modules::feature_map::feature_map::{FeatureMap, Size};

/// Reduces `input` to exactly `target` by taking the maximum of each window.
pub fn max_pool(input: &FeatureMap, target: Size) -> FeatureMap {
    if input.size() == target {
        return input.clone();
    }

    let in_width = input.width() as u64;
    let in_height = input.height() as u64;
    let out_width = target.width.max(1) as u64;
    let out_height = target.height.max(1) as u64;

    FeatureMap::from_fn(target, |ox, oy| {
        let (x0, x1) = window(ox as u64, in_width, out_width);
        let (y0, y1) = window(oy as u64, in_height, out_height);
        let mut best = f64::NEG_INFINITY;
        for y in y0..y1 {
            for x in x0..x1 {
                best = best.max(input.get(x as u32, y as u32));
            }
        }
        best
    })
}

/// Half-open input range covered by output cell `index`. Never empty.
fn window(index: u64, input_len: u64, output_len: u64) -> (u64, u64) {
    let start = index * input_len / output_len;
    let end = ((index + 1) * input_len).div_ceil(output_len);
    let end = end.max(start + 1).min(input_len);
    (start.min(input_len - 1), end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooling_to_same_size_is_a_copy() {
        let input = FeatureMap::from_fn(Size::new(3, 3), |x, y| (x * y) as f64);
        assert_eq!(max_pool(&input, Size::new(3, 3)), input);
    }

    #[test]
    fn pooling_halves_with_window_maximum() {
        let input = FeatureMap::from_fn(Size::new(4, 4), |x, y| (y * 4 + x) as f64);
        let pooled = max_pool(&input, Size::new(2, 2));
        assert_eq!(pooled.values(), &[5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn pooling_uneven_sizes_yields_exact_target() {
        let input = FeatureMap::from_fn(Size::new(7, 5), |x, y| (x + y) as f64);
        let pooled = max_pool(&input, Size::new(3, 2));
        assert_eq!(pooled.size(), Size::new(3, 2));
        // Bottom-right window always contains the global maximum.
        assert_eq!(pooled.get(2, 1), 10.0);
    }

    #[test]
    fn pooling_upward_repeats_cells() {
        let input = FeatureMap::new(1, 1, vec![3.0]);
        let pooled = max_pool(&input, Size::new(2, 2));
        assert_eq!(pooled.values(), &[3.0; 4]);
    }
}
