// src/pipeline.rs
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::detection::{DetectionContext, DetectionOrchestrator};
use crate::errors::VeilpixError;
use crate::models::{DetectedRegion, DetectionOutcome, DetectionSettings, RedactionSettings};
use crate::services::image_processor::ImageProcessor;
use crate::services::redaction::{RedactionBox, RedactionEngine};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedImage {
    #[serde(skip)]
    pub image: Vec<u8>,
    pub face_count: usize,
    pub plate_count: usize,
    pub regions: Vec<DetectedRegion>,
    #[serde(skip)]
    pub redacted: Vec<RedactionBox>,
}

/// decode → detect → redact → encode, for one image or a sequential batch.
pub struct RedactionPipeline {
    processor: ImageProcessor,
    orchestrator: Arc<DetectionOrchestrator>,
    engine: RedactionEngine,
    batch_delay: Duration,
}

impl RedactionPipeline {
    pub fn new(
        processor: ImageProcessor,
        orchestrator: Arc<DetectionOrchestrator>,
        batch_delay: Duration,
    ) -> Self {
        Self {
            engine: RedactionEngine::new(processor.clone()),
            processor,
            orchestrator,
            batch_delay,
        }
    }

    pub fn engine(&self) -> &RedactionEngine {
        &self.engine
    }

    pub async fn detect(
        &self,
        data: &[u8],
        user_id: &str,
        settings: &DetectionSettings,
    ) -> Result<DetectionOutcome, VeilpixError> {
        DetectionOrchestrator::validate(settings)?;
        let decoded = self.processor.decode(data)?;
        let working = self.processor.prepare_detection(&decoded);
        Ok(self
            .orchestrator
            .detect(&working, &DetectionContext::new(user_id), settings)
            .await)
    }

    pub async fn process(
        &self,
        data: &[u8],
        user_id: &str,
        detection: &DetectionSettings,
        redaction: &RedactionSettings,
    ) -> Result<ProcessedImage, VeilpixError> {
        DetectionOrchestrator::validate(detection)?;
        let decoded = self.processor.decode(data)?;
        let working = self.processor.prepare_detection(&decoded);
        let outcome = self
            .orchestrator
            .detect(&working, &DetectionContext::new(user_id), detection)
            .await;

        let mut pixels = decoded.to_rgba8();
        let redacted = self
            .engine
            .apply_in_place(&mut pixels, &outcome.regions, redaction);
        let image = self.processor.encode_png(&pixels)?;

        info!(
            "Processed image for {}: {} faces, {} plates, {} regions redacted",
            user_id,
            outcome.face_count,
            outcome.plate_count,
            redacted.len()
        );
        Ok(ProcessedImage {
            image,
            face_count: outcome.face_count,
            plate_count: outcome.plate_count,
            regions: outcome.regions,
            redacted,
        })
    }

    /// One image at a time with a pause in between. A failed image does not
    /// stop the batch.
    pub async fn process_batch(
        &self,
        images: &[Vec<u8>],
        user_id: &str,
        detection: &DetectionSettings,
        redaction: &RedactionSettings,
    ) -> Vec<Result<ProcessedImage, VeilpixError>> {
        let mut results = Vec::with_capacity(images.len());
        for (index, data) in images.iter().enumerate() {
            if index > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            let result = self.process(data, user_id, detection, redaction).await;
            match &result {
                Ok(_) => debug!("Batch image {}/{} done", index + 1, images.len()),
                Err(e) => warn!("Batch image {}/{} failed: {}", index + 1, images.len(), e),
            }
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::orchestrator::DetectorRegistry;
    use crate::detection::{CandidateDetector, DetectionImage};
    use crate::models::{DetectionCandidate, DetectionMethod};
    use async_trait::async_trait;
    use image::{DynamicImage, GenericImageView, ImageOutputFormat, Rgb, RgbImage};
    use tokio::time::Instant;

    struct FixedPlate;

    #[async_trait]
    impl CandidateDetector for FixedPlate {
        fn method(&self) -> DetectionMethod {
            DetectionMethod::BalancedPlate
        }

        async fn detect(
            &self,
            _image: &DetectionImage,
            _ctx: &DetectionContext,
        ) -> Vec<DetectionCandidate> {
            vec![DetectionCandidate::new(self.method(), 10.0, 10.0, 20.0, 10.0, 0.9)]
        }
    }

    fn pipeline(delay: Duration) -> RedactionPipeline {
        let orchestrator = DetectionOrchestrator::new(
            DetectorRegistry::new().register(Arc::new(FixedPlate)),
        );
        RedactionPipeline::new(ImageProcessor::new(), Arc::new(orchestrator), delay)
    }

    fn png() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([200, 10, 10])));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), ImageOutputFormat::Png)
            .unwrap();
        out
    }

    fn plates_only() -> DetectionSettings {
        DetectionSettings {
            detect_faces: false,
            ..DetectionSettings::default()
        }
    }

    #[tokio::test]
    async fn process_reports_counts_and_returns_png() {
        let result = pipeline(Duration::ZERO)
            .process(&png(), "u", &plates_only(), &RedactionSettings::default())
            .await
            .unwrap();
        assert_eq!((result.face_count, result.plate_count), (0, 1));
        assert_eq!(result.redacted.len(), 1);
        let decoded = image::load_from_memory(&result.image).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_runs_in_order_with_pauses_between_images() {
        let started = Instant::now();
        let results = pipeline(Duration::from_millis(250))
            .process_batch(
                &[png(), b"broken".to_vec(), png()],
                "u",
                &plates_only(),
                &RedactionSettings::default(),
            )
            .await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(750));
    }

    #[tokio::test]
    async fn mismatched_methods_fail_before_decoding() {
        let settings = DetectionSettings {
            plate_method: DetectionMethod::HeuristicFace,
            ..DetectionSettings::default()
        };
        let err = pipeline(Duration::ZERO)
            .detect(b"not even an image", "u", &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, VeilpixError::Validation(_)));
    }
}
