// src/detection/model.rs
use anyhow::Result;
use async_trait::async_trait;
use image::{RgbImage, imageops};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::detection::{CandidateDetector, DetectionContext, DetectionImage};
use crate::errors::VeilpixError;
use crate::models::{DetectionCandidate, DetectionMethod};

/// A located object in the pixel space of the image passed to the locator.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedObject {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub class_prob: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextReading {
    pub text: String,
    pub confidence: f32,
}

/// First stage: where are the plates.
pub trait ObjectLocator: Send + Sync {
    fn locate(&self, image: &RgbImage) -> Result<Vec<LocatedObject>>;
}

/// Second stage: what does a plate crop say.
pub trait TextReader: Send + Sync {
    fn read(&self, crop: &RgbImage) -> Result<Option<TextReading>>;
}

pub struct ModelPair {
    pub locator: Box<dyn ObjectLocator>,
    pub reader: Option<Box<dyn TextReader>>,
}

pub type ModelLoader = Arc<dyn Fn() -> Result<ModelPair> + Send + Sync>;

/// Two-stage local detector. Models load once, on first use; a failed load
/// is retried on the next call.
pub struct LocalModelDetector {
    loader: ModelLoader,
    models: OnceCell<Arc<ModelPair>>,
    min_confidence: f32,
}

impl LocalModelDetector {
    pub fn new(loader: ModelLoader, min_confidence: f32) -> Self {
        Self {
            loader,
            models: OnceCell::new(),
            min_confidence,
        }
    }

    pub async fn ensure_loaded(&self) -> Result<Arc<ModelPair>, VeilpixError> {
        let loader = Arc::clone(&self.loader);
        self.models
            .get_or_try_init(|| async move {
                let pair = tokio::task::spawn_blocking(move || (*loader)())
                    .await
                    .map_err(|e| VeilpixError::Model(format!("model loader panicked: {}", e)))?
                    .map_err(|e| VeilpixError::Model(format!("{:#}", e)))?;
                info!("Local plate models loaded");
                Ok(Arc::new(pair))
            })
            .await
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.models.initialized()
    }
}

/// Runs both stages on a blocking thread.
pub fn run_two_stage(
    models: &ModelPair,
    image: &RgbImage,
    min_confidence: f32,
) -> Result<Vec<DetectionCandidate>> {
    let mut candidates = Vec::new();
    for object in models.locator.locate(image)? {
        if object.confidence < min_confidence {
            continue;
        }
        let x = object.x.max(0.0);
        let y = object.y.max(0.0);
        let width = object.width.min(image.width() as f32 - x);
        let height = object.height.min(image.height() as f32 - y);
        if width < 1.0 || height < 1.0 {
            continue;
        }

        let mut candidate = DetectionCandidate::new(
            DetectionMethod::LocalModel,
            x,
            y,
            width,
            height,
            object.confidence,
        )
        .with_class_prob(object.class_prob);

        if let Some(reader) = &models.reader {
            let crop = imageops::crop_imm(
                image,
                x as u32,
                y as u32,
                width.ceil() as u32,
                height.ceil() as u32,
            )
            .to_image();
            match reader.read(&crop) {
                Ok(Some(reading)) => {
                    candidate.plate_text = Some(reading.text);
                    candidate.ocr_confidence = Some(reading.confidence);
                }
                Ok(None) => {}
                Err(e) => debug!("Text reader failed on a located plate: {:#}", e),
            }
        }
        candidates.push(candidate);
    }
    Ok(candidates)
}

#[async_trait]
impl CandidateDetector for LocalModelDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::LocalModel
    }

    async fn detect(
        &self,
        image: &DetectionImage,
        _ctx: &DetectionContext,
    ) -> Vec<DetectionCandidate> {
        let models = match self.ensure_loaded().await {
            Ok(models) => models,
            Err(e) => {
                warn!("{} unavailable: {}", self.method(), e);
                return Vec::new();
            }
        };
        let pixels = image.shared_pixels();
        let min_confidence = self.min_confidence;
        let outcome =
            tokio::task::spawn_blocking(move || run_two_stage(&models, &pixels, min_confidence))
                .await;
        match outcome {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                warn!("{} inference failed: {:#}", self.method(), e);
                Vec::new()
            }
            Err(e) => {
                warn!("{} inference task failed: {}", self.method(), e);
                Vec::new()
            }
        }
    }
}
