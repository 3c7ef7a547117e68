// src/detection/mod.rs
use async_trait::async_trait;
use image::{ImageOutputFormat, RgbImage};
use std::io::Cursor;
use std::sync::Arc;

use crate::errors::VeilpixError;
use crate::models::{DetectionCandidate, DetectionMethod};

pub mod heuristics;
pub mod local;
pub mod merge;
pub mod model;
pub mod onnx;
pub mod orchestrator;
pub mod providers;
pub mod remote;
pub mod scan_worker;

pub use merge::merge;
pub use orchestrator::DetectionOrchestrator;

/// Decoded image handed to detectors. Detectors report boxes in the pixel
/// space of `pixels`; `scale` maps them back to the uploaded image.
#[derive(Debug, Clone)]
pub struct DetectionImage {
    pixels: Arc<RgbImage>,
    scale: f32,
}

impl DetectionImage {
    pub fn new(pixels: RgbImage, scale: f32) -> Self {
        Self {
            pixels: Arc::new(pixels),
            scale,
        }
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn shared_pixels(&self) -> Arc<RgbImage> {
        Arc::clone(&self.pixels)
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Original size / working size.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn encode_jpeg(&self) -> Result<Vec<u8>, VeilpixError> {
        let mut out = Vec::new();
        self.pixels
            .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Jpeg(90))?;
        Ok(out)
    }
}

/// Who is asking, for quota and key resolution.
#[derive(Debug, Clone)]
pub struct DetectionContext {
    pub user_id: String,
}

impl DetectionContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// One detector variant. `detect` never fails: internal errors are logged
/// and reported as an empty list.
#[async_trait]
pub trait CandidateDetector: Send + Sync {
    fn method(&self) -> DetectionMethod;

    async fn detect(
        &self,
        image: &DetectionImage,
        ctx: &DetectionContext,
    ) -> Vec<DetectionCandidate>;
}
