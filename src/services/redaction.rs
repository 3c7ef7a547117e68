// src/services/redaction.rs
use image::{Rgba, RgbaImage, imageops};
use log::debug;

use crate::errors::VeilpixError;
use crate::models::{DetectedRegion, RedactionMode, RedactionSettings};
use crate::services::image_processor::ImageProcessor;

pub const MAX_BLUR_RADIUS: f32 = 30.0;
pub const MIN_MOSAIC_CELL: u32 = 8;

/// A region after margin expansion and clamping, in image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedactionBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RedactionBox {
    /// Integer pixel rectangle covering the box: `(x, y, width, height)`.
    fn pixel_rect(&self) -> (u32, u32, u32, u32) {
        let x0 = self.x.floor().max(0.0) as u32;
        let y0 = self.y.floor().max(0.0) as u32;
        let x1 = (self.x + self.width).ceil().max(0.0) as u32;
        let y1 = (self.y + self.height).ceil().max(0.0) as u32;
        (x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }
}

/// Grows the region by its kind's margin on every side and clamps the result
/// to the image. Regions entirely outside the image come back empty.
pub fn expand_region(region: &DetectedRegion, image_width: u32, image_height: u32) -> RedactionBox {
    let c = &region.candidate;
    let margin = region.kind.expansion_margin();
    let (dx, dy) = (c.width * margin, c.height * margin);

    let x0 = (c.x - dx).clamp(0.0, image_width as f32);
    let y0 = (c.y - dy).clamp(0.0, image_height as f32);
    let x1 = (c.x + c.width + dx).clamp(0.0, image_width as f32);
    let y1 = (c.y + c.height + dy).clamp(0.0, image_height as f32);
    RedactionBox {
        x: x0,
        y: y0,
        width: (x1 - x0).max(0.0),
        height: (y1 - y0).max(0.0),
    }
}

pub fn blur_radius(blur_amount: u8) -> u32 {
    (blur_amount.min(100) as f32 / 100.0 * MAX_BLUR_RADIUS).round() as u32
}

pub struct RedactionEngine {
    processor: ImageProcessor,
}

impl RedactionEngine {
    pub fn new(processor: ImageProcessor) -> Self {
        Self { processor }
    }

    /// Decodes, redacts every enabled region in list order and re-encodes as
    /// PNG.
    pub fn apply(
        &self,
        data: &[u8],
        regions: &[DetectedRegion],
        settings: &RedactionSettings,
    ) -> Result<Vec<u8>, VeilpixError> {
        let mut image = self.processor.decode(data)?.to_rgba8();
        self.apply_in_place(&mut image, regions, settings);
        self.processor.encode_png(&image)
    }

    /// Returns the boxes that were actually painted.
    pub fn apply_in_place(
        &self,
        image: &mut RgbaImage,
        regions: &[DetectedRegion],
        settings: &RedactionSettings,
    ) -> Vec<RedactionBox> {
        let (width, height) = image.dimensions();
        let mut painted = Vec::new();
        for region in regions.iter().filter(|r| r.enabled) {
            let bounds = expand_region(region, width, height);
            let (x, y, w, h) = bounds.pixel_rect();
            let (w, h) = (w.min(width - x.min(width)), h.min(height - y.min(height)));
            if w == 0 || h == 0 {
                debug!("Region {} falls outside the image, skipped", region.id);
                continue;
            }
            match settings.mode {
                RedactionMode::Highlight => highlight(image, x, y, w, h, settings.highlight_color),
                RedactionMode::Blur => blur(image, x, y, w, h, blur_radius(settings.blur_amount)),
                RedactionMode::Mosaic => mosaic(image, x, y, w, h, settings.mosaic_amount),
            }
            painted.push(bounds);
        }
        debug!("Redacted {} of {} regions", painted.len(), regions.len());
        painted
    }
}

fn highlight(image: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: [u8; 4]) {
    for py in y..y + h {
        for px in x..x + w {
            image.put_pixel(px, py, Rgba(color));
        }
    }
}

fn blur(image: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, radius: u32) {
    if radius == 0 {
        return;
    }
    let crop = imageops::crop_imm(&*image, x, y, w, h).to_image();
    let blurred = imageops::blur(&crop, radius as f32);
    imageops::replace(image, &blurred, x as i64, y as i64);
}

fn mosaic(image: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, amount: u32) {
    let cell = amount.max(MIN_MOSAIC_CELL);
    let mut cy = y;
    while cy < y + h {
        let ch = cell.min(y + h - cy);
        let mut cx = x;
        while cx < x + w {
            let cw = cell.min(x + w - cx);
            let sample = *image.get_pixel(cx + cw / 2, cy + ch / 2);
            for py in cy..cy + ch {
                for px in cx..cx + cw {
                    image.put_pixel(px, py, sample);
                }
            }
            cx += cell;
        }
        cy += cell;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetectionCandidate, DetectionMethod};

    fn region(method: DetectionMethod, x: f32, y: f32, w: f32, h: f32) -> DetectedRegion {
        DetectedRegion::from_candidate(0, DetectionCandidate::new(method, x, y, w, h, 0.9))
    }

    fn engine() -> RedactionEngine {
        RedactionEngine::new(ImageProcessor::new())
    }

    fn checkerboard(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        })
    }

    #[test]
    fn face_box_grows_fifteen_percent_each_side() {
        let face = region(DetectionMethod::HeuristicFace, 100.0, 100.0, 50.0, 50.0);
        assert_eq!(
            expand_region(&face, 400, 400),
            RedactionBox { x: 92.5, y: 92.5, width: 65.0, height: 65.0 }
        );
    }

    #[test]
    fn plate_box_grows_ten_percent_and_is_clamped() {
        let plate = region(DetectionMethod::SimplePlate, 0.0, 90.0, 100.0, 20.0);
        assert_eq!(
            expand_region(&plate, 105, 100),
            RedactionBox { x: 0.0, y: 88.0, width: 105.0, height: 12.0 }
        );
    }

    #[test]
    fn blur_radius_maps_percent_to_pixels() {
        assert_eq!(blur_radius(0), 0);
        assert_eq!(blur_radius(50), 15);
        assert_eq!(blur_radius(100), 30);
        assert_eq!(blur_radius(255), 30);
    }

    #[test]
    fn highlight_fills_only_the_expanded_box() {
        let mut img = RgbaImage::new(40, 40);
        let settings = RedactionSettings {
            mode: RedactionMode::Highlight,
            ..RedactionSettings::default()
        };
        // 10% of 10px is one pixel each side: painted area is 9..21.
        let plate = region(DetectionMethod::SimplePlate, 10.0, 10.0, 10.0, 10.0);
        engine().apply_in_place(&mut img, &[plate], &settings);

        assert_eq!(img.get_pixel(9, 9).0, [255, 0, 0, 255]);
        assert_eq!(img.get_pixel(20, 20).0, [255, 0, 0, 255]);
        assert_eq!(img.get_pixel(8, 8).0, [0, 0, 0, 0]);
        assert_eq!(img.get_pixel(21, 21).0, [0, 0, 0, 0]);
    }

    #[test]
    fn disabled_regions_are_left_alone() {
        let mut img = checkerboard(32, 32);
        let before = img.clone();
        let mut face = region(DetectionMethod::HeuristicFace, 4.0, 4.0, 20.0, 20.0);
        face.enabled = false;
        let painted = engine().apply_in_place(&mut img, &[face], &RedactionSettings::default());
        assert!(painted.is_empty());
        assert_eq!(img, before);
    }

    #[test]
    fn mosaic_cells_are_flat() {
        let mut img = checkerboard(64, 64);
        let settings = RedactionSettings {
            mode: RedactionMode::Mosaic,
            mosaic_amount: 4,
            ..RedactionSettings::default()
        };
        // Mosaic cells never go below 8px.
        let plate = region(DetectionMethod::SimplePlate, 0.0, 0.0, 64.0, 64.0);
        engine().apply_in_place(&mut img, &[plate], &settings);
        let first = *img.get_pixel(0, 0);
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(*img.get_pixel(x, y), first);
            }
        }
        assert_eq!(first, Rgba([255, 255, 255, 255]));
        // Was black before; its cell samples a white centre.
        assert_eq!(*img.get_pixel(9, 0), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn blur_smooths_inside_and_keeps_outside() {
        let mut img = checkerboard(64, 64);
        let face = region(DetectionMethod::HeuristicFace, 20.0, 20.0, 20.0, 20.0);
        engine().apply_in_place(&mut img, &[face], &RedactionSettings::default());

        let centre = img.get_pixel(30, 30).0[0];
        assert!(centre > 60 && centre < 195, "centre pixel {} not smoothed", centre);
        assert_eq!(img.get_pixel(2, 2).0, [255, 255, 255, 255]);
        assert_eq!(img.get_pixel(60, 61).0, [0, 0, 0, 255]);
    }

    #[test]
    fn region_outside_image_is_skipped() {
        let mut img = checkerboard(16, 16);
        let far = region(DetectionMethod::SimplePlate, 100.0, 100.0, 10.0, 10.0);
        assert!(engine().apply_in_place(&mut img, &[far], &RedactionSettings::default()).is_empty());
    }
}
