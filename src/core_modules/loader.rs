// THEORY:
// The loader is the boundary between the engine and real pixels. Given an image
// record and a target size it produces a feature map of exactly that size, or an
// error. The engine never decodes anything itself; it only asks an `ImageLoader`.
//
// `FileImageLoader` is the stock implementation: decode with the `image` crate,
// resize to the requested dimensions, collapse to luminance and scale into 0..1.

use crate::core_modules::errors::ImageDecodeError;
use crate::core_modules::feature_map::feature_map::{FeatureMap, Size};
use crate::core_modules::image_repository::Image;
use image::imageops::FilterType;

/// Decodes an image into a feature map of a given size.
pub trait ImageLoader: Send + Sync {
    fn load(&self, image: &Image, size: Size) -> Result<FeatureMap, ImageDecodeError>;
}

/// Loads images from disk through the `image` crate.
#[derive(Debug, Clone)]
pub struct FileImageLoader {
    filter: FilterType,
}

impl FileImageLoader {
    pub fn new(filter: FilterType) -> Self {
        Self { filter }
    }
}

impl Default for FileImageLoader {
    fn default() -> Self {
        Self::new(FilterType::Triangle)
    }
}

impl ImageLoader for FileImageLoader {
    fn load(&self, image: &Image, size: Size) -> Result<FeatureMap, ImageDecodeError> {
        if size.width == 0 || size.height == 0 {
            return Err(ImageDecodeError::Unsupported {
                message: format!("cannot load {} at {}", image.source().display(), size),
            });
        }
        let decoded = image::open(image.source())?;
        Ok(luma_feature_map(&decoded, size, self.filter))
    }
}

/// Resizes `image` to exactly `size` and converts it to luminance in 0..1.
pub fn luma_feature_map(image: &image::DynamicImage, size: Size, filter: FilterType) -> FeatureMap {
    let luma = image.resize_exact(size.width, size.height, filter).to_luma8();
    let values = luma.pixels().map(|p| p.0[0] as f64 / 255.0).collect();
    FeatureMap::new(size.width, size.height, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::image_repository::ImageId;
    use image::{DynamicImage, GrayImage, Luma};

    #[test]
    fn luma_map_has_requested_size_and_range() {
        let gray = GrayImage::from_fn(8, 6, |x, _| Luma([(x * 30) as u8]));
        let map = luma_feature_map(&DynamicImage::ImageLuma8(gray), Size::new(4, 3), FilterType::Nearest);
        assert_eq!(map.size(), Size::new(4, 3));
        assert!(map.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn missing_file_is_a_decode_error() {
        let image = Image::new(ImageId(0), "circle", "/nonexistent/circle.png");
        let result = FileImageLoader::default().load(&image, Size::new(4, 4));
        assert!(result.is_err());
    }

    #[test]
    fn round_trips_through_a_png_file() {
        let path = std::env::temp_dir().join(format!("chain_vision_loader_{}.png", std::process::id()));
        let gray = GrayImage::from_pixel(5, 5, Luma([255u8]));
        gray.save(&path).expect("Error Saving File.");

        let image = Image::new(ImageId(1), "square", &path);
        let map = FileImageLoader::default().load(&image, Size::new(5, 5)).unwrap();
        assert!(map.values().iter().all(|v| (*v - 1.0).abs() < 1e-9));

        let _ = std::fs::remove_file(path);
    }
}
