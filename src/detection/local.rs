// src/detection/local.rs
use async_trait::async_trait;
use log::{debug, warn};

use crate::detection::heuristics::{Aggressiveness, FaceRules, PlateRules, RgbFrame, ScanProfile};
use crate::detection::scan_worker::{ScanRequest, ScanWorkerHandle};
use crate::detection::{CandidateDetector, DetectionContext, DetectionImage};
use crate::models::{DetectionCandidate, DetectionMethod};

/// Plate scanner at one of three tuned aggressiveness levels.
pub struct HeuristicPlateDetector {
    level: Aggressiveness,
    worker: ScanWorkerHandle,
}

impl HeuristicPlateDetector {
    pub fn new(level: Aggressiveness, worker: ScanWorkerHandle) -> Self {
        Self { level, worker }
    }
}

/// Skin-tone window scanner for faces.
pub struct HeuristicFaceDetector {
    rules: FaceRules,
    worker: ScanWorkerHandle,
}

impl HeuristicFaceDetector {
    pub fn new(worker: ScanWorkerHandle) -> Self {
        Self {
            rules: FaceRules::default(),
            worker,
        }
    }
}

async fn run_scan(
    worker: &ScanWorkerHandle,
    method: DetectionMethod,
    image: &DetectionImage,
    profile: ScanProfile,
) -> Vec<DetectionCandidate> {
    let request = ScanRequest {
        frame: RgbFrame::from_image(image.pixels()),
        profile,
    };
    match worker.scan(request).await {
        Ok(response) => {
            debug!(
                "{}: {} windows over floor, {} regions",
                method,
                response.windows_scored,
                response.clusters.len()
            );
            response
                .clusters
                .into_iter()
                .map(|hit| {
                    DetectionCandidate::new(
                        method,
                        hit.x as f32,
                        hit.y as f32,
                        hit.width as f32,
                        hit.height as f32,
                        hit.score as f32,
                    )
                })
                .collect()
        }
        Err(e) => {
            warn!("{} failed: {}", method, e);
            Vec::new()
        }
    }
}

#[async_trait]
impl CandidateDetector for HeuristicPlateDetector {
    fn method(&self) -> DetectionMethod {
        match self.level {
            Aggressiveness::Simple => DetectionMethod::SimplePlate,
            Aggressiveness::Balanced => DetectionMethod::BalancedPlate,
            Aggressiveness::Aggressive => DetectionMethod::AggressivePlate,
        }
    }

    async fn detect(
        &self,
        image: &DetectionImage,
        _ctx: &DetectionContext,
    ) -> Vec<DetectionCandidate> {
        let profile = ScanProfile::Plate(PlateRules::for_level(self.level));
        run_scan(&self.worker, self.method(), image, profile).await
    }
}

#[async_trait]
impl CandidateDetector for HeuristicFaceDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::HeuristicFace
    }

    async fn detect(
        &self,
        image: &DetectionImage,
        _ctx: &DetectionContext,
    ) -> Vec<DetectionCandidate> {
        run_scan(
            &self.worker,
            self.method(),
            image,
            ScanProfile::Face(self.rules.clone()),
        )
        .await
    }
}
