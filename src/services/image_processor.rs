// src/services/image_processor.rs
use crate::detection::DetectionImage;
use crate::errors::VeilpixError;
use image::{DynamicImage, GenericImageView, ImageOutputFormat, RgbaImage};

pub const MAX_INPUT_DIMENSION: u32 = 4096;
pub const DEFAULT_WORKING_DIMENSION: u32 = 1280;

#[derive(Debug, Clone)]
pub struct ImageProcessor {
    max_input: u32,
    working_max: u32,
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProcessor {
    pub fn new() -> Self {
        Self {
            max_input: MAX_INPUT_DIMENSION,
            working_max: DEFAULT_WORKING_DIMENSION,
        }
    }

    pub fn with_working_max(mut self, working_max: u32) -> Self {
        self.working_max = working_max.max(64);
        self
    }

    pub fn validate_image(&self, data: &[u8]) -> Result<(u32, u32), VeilpixError> {
        Ok(self.decode(data)?.dimensions())
    }

    pub fn decode(&self, data: &[u8]) -> Result<DynamicImage, VeilpixError> {
        if data.is_empty() {
            return Err(VeilpixError::ImageProcessing("Empty image upload".to_string()));
        }
        let img = image::load_from_memory(data)
            .map_err(|e| VeilpixError::ImageProcessing(format!("Invalid image format: {}", e)))?;

        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(VeilpixError::ImageProcessing("Image has no pixels".to_string()));
        }
        if width > self.max_input || height > self.max_input {
            return Err(VeilpixError::ImageProcessing(format!(
                "Image dimensions exceed {}x{}",
                self.max_input, self.max_input
            )));
        }
        Ok(img)
    }

    /// Detectors work on a copy no larger than `working_max` on its long
    /// side; the returned scale maps their boxes back to `img`.
    pub fn prepare_detection(&self, img: &DynamicImage) -> DetectionImage {
        let (width, height) = img.dimensions();
        let long_side = width.max(height);
        if long_side <= self.working_max {
            return DetectionImage::new(img.to_rgb8(), 1.0);
        }

        let ratio = self.working_max as f32 / long_side as f32;
        let new_width = ((width as f32 * ratio) as u32).max(1);
        let new_height = ((height as f32 * ratio) as u32).max(1);
        let resized = img.resize_exact(new_width, new_height, image::imageops::FilterType::Triangle);
        DetectionImage::new(resized.to_rgb8(), width as f32 / new_width as f32)
    }

    pub fn encode_png(&self, img: &RgbaImage) -> Result<Vec<u8>, VeilpixError> {
        let mut output = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut output), ImageOutputFormat::Png)
            .map_err(|e| VeilpixError::ImageProcessing(format!("Failed to encode image: {}", e)))?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([10, 20, 30])));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), ImageOutputFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn rejects_garbage_and_empty_uploads() {
        let processor = ImageProcessor::new();
        assert!(processor.decode(b"").is_err());
        assert!(processor.decode(b"not an image").is_err());
        assert_eq!(processor.validate_image(&png(30, 20)).unwrap(), (30, 20));
    }

    #[test]
    fn oversized_images_are_refused() {
        let processor = ImageProcessor::new();
        assert!(processor.decode(&png(MAX_INPUT_DIMENSION + 1, 2)).is_err());
    }

    #[test]
    fn large_images_are_scaled_for_detection() {
        let processor = ImageProcessor::new().with_working_max(100);
        let img = processor.decode(&png(400, 200)).unwrap();
        let working = processor.prepare_detection(&img);
        assert_eq!((working.width(), working.height()), (100, 50));
        assert_eq!(working.scale(), 4.0);

        let small = processor.decode(&png(80, 60)).unwrap();
        assert_eq!(processor.prepare_detection(&small).scale(), 1.0);
    }
}
