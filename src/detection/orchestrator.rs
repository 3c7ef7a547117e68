// src/detection/orchestrator.rs
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::detection::{CandidateDetector, DetectionContext, DetectionImage, merge};
use crate::errors::VeilpixError;
use crate::models::{
    DetectedRegion, DetectionCandidate, DetectionMethod, DetectionOutcome, DetectionSettings,
    FallbackPolicy, RegionKind,
};

/// Lifecycle of one method run. `RunningFallback` is entered at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    RunningPrimary(DetectionMethod),
    RunningFallback(DetectionMethod),
    Done,
}

#[derive(Default)]
pub struct DetectorRegistry {
    detectors: HashMap<DetectionMethod, Arc<dyn CandidateDetector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers under the detector's own method; a later registration for
    /// the same method replaces the earlier one.
    pub fn register(mut self, detector: Arc<dyn CandidateDetector>) -> Self {
        let method = detector.method();
        if self.detectors.insert(method, detector).is_some() {
            warn!("Detector for {} registered twice, keeping the latest", method);
        }
        self
    }

    pub fn get(&self, method: DetectionMethod) -> Option<&Arc<dyn CandidateDetector>> {
        self.detectors.get(&method)
    }

    pub fn methods(&self) -> Vec<DetectionMethod> {
        DetectionMethod::ALL
            .into_iter()
            .filter(|m| self.detectors.contains_key(m))
            .collect()
    }
}

pub struct DetectionOrchestrator {
    registry: DetectorRegistry,
}

impl DetectionOrchestrator {
    pub fn new(registry: DetectorRegistry) -> Self {
        Self { registry }
    }

    pub fn validate(settings: &DetectionSettings) -> Result<(), VeilpixError> {
        if settings.face_method.kind() != RegionKind::Face {
            return Err(VeilpixError::Validation(format!(
                "{} does not detect faces",
                settings.face_method
            )));
        }
        if settings.plate_method.kind() != RegionKind::Plate {
            return Err(VeilpixError::Validation(format!(
                "{} does not detect plates",
                settings.plate_method
            )));
        }
        if !(0.0..=1.0).contains(&settings.iou_threshold) {
            return Err(VeilpixError::Validation(format!(
                "iou threshold must be within 0..=1, got {}",
                settings.iou_threshold
            )));
        }
        Ok(())
    }

    /// Face and plate passes run one after the other. Each pass is merged on
    /// its own, capped at `max_regions`, and mapped back to the uploaded
    /// image's pixel space. Never fails; worst case is an empty outcome.
    pub async fn detect(
        &self,
        image: &DetectionImage,
        ctx: &DetectionContext,
        settings: &DetectionSettings,
    ) -> DetectionOutcome {
        let mut methods_run = Vec::new();
        let mut faces = Vec::new();
        let mut plates = Vec::new();

        if settings.detect_faces {
            let found = self
                .run_with_fallback(settings.face_method, settings.fallback, image, ctx, &mut methods_run)
                .await;
            faces = self.finish(found, settings, image.scale());
        }
        if settings.detect_plates {
            let found = self
                .run_with_fallback(settings.plate_method, settings.fallback, image, ctx, &mut methods_run)
                .await;
            plates = self.finish(found, settings, image.scale());
        }

        let face_count = faces.len();
        let plate_count = plates.len();
        let regions = faces
            .into_iter()
            .enumerate()
            .chain(plates.into_iter().enumerate())
            .map(|(index, candidate)| DetectedRegion::from_candidate(index, candidate))
            .collect();

        info!(
            "Detection for {} finished: {} faces, {} plates via {:?}",
            ctx.user_id, face_count, plate_count, methods_run
        );
        DetectionOutcome {
            regions,
            face_count,
            plate_count,
            methods_run,
        }
    }

    async fn run_with_fallback(
        &self,
        method: DetectionMethod,
        policy: FallbackPolicy,
        image: &DetectionImage,
        ctx: &DetectionContext,
        methods_run: &mut Vec<DetectionMethod>,
    ) -> Vec<DetectionCandidate> {
        let mut state = RunState::Idle;
        let mut found = Vec::new();

        loop {
            state = match state {
                RunState::Idle => RunState::RunningPrimary(method),
                RunState::RunningPrimary(current) => {
                    found = self.run_one(current, image, ctx, methods_run).await;
                    match (found.is_empty(), policy, current.fallback()) {
                        (true, FallbackPolicy::SimpleOnEmpty, Some(next)) => {
                            debug!("{} found nothing, falling back to {}", current, next);
                            RunState::RunningFallback(next)
                        }
                        _ => RunState::Done,
                    }
                }
                RunState::RunningFallback(current) => {
                    found = self.run_one(current, image, ctx, methods_run).await;
                    RunState::Done
                }
                RunState::Done => return found,
            };
        }
    }

    async fn run_one(
        &self,
        method: DetectionMethod,
        image: &DetectionImage,
        ctx: &DetectionContext,
        methods_run: &mut Vec<DetectionMethod>,
    ) -> Vec<DetectionCandidate> {
        let Some(detector) = self.registry.get(method) else {
            warn!("No detector registered for {}", method);
            return Vec::new();
        };
        methods_run.push(method);
        let found = detector.detect(image, ctx).await;
        debug!("{} produced {} candidates", method, found.len());
        found
    }

    fn finish(
        &self,
        found: Vec<DetectionCandidate>,
        settings: &DetectionSettings,
        scale: f32,
    ) -> Vec<DetectionCandidate> {
        let mut kept = merge(found, settings.iou_threshold);
        kept.truncate(settings.max_regions);
        if scale != 1.0 {
            for c in &mut kept {
                c.x *= scale;
                c.y *= scale;
                c.width *= scale;
                c.height *= scale;
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubDetector {
        method: DetectionMethod,
        output: Vec<DetectionCandidate>,
        calls: AtomicUsize,
    }

    impl StubDetector {
        fn new(method: DetectionMethod, boxes: &[(f32, f32)]) -> Arc<Self> {
            Arc::new(Self {
                method,
                output: boxes
                    .iter()
                    .map(|&(x, y)| DetectionCandidate::new(method, x, y, 40.0, 12.0, 0.8))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CandidateDetector for StubDetector {
        fn method(&self) -> DetectionMethod {
            self.method
        }

        async fn detect(
            &self,
            _image: &DetectionImage,
            _ctx: &DetectionContext,
        ) -> Vec<DetectionCandidate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.output.clone()
        }
    }

    fn image(scale: f32) -> DetectionImage {
        DetectionImage::new(RgbImage::new(200, 200), scale)
    }

    fn plates_only(method: DetectionMethod, fallback: FallbackPolicy) -> DetectionSettings {
        DetectionSettings {
            detect_faces: false,
            plate_method: method,
            fallback,
            ..DetectionSettings::default()
        }
    }

    #[tokio::test]
    async fn empty_primary_runs_exactly_one_fallback() {
        let primary = StubDetector::new(DetectionMethod::AggressivePlate, &[]);
        let simple = StubDetector::new(DetectionMethod::SimplePlate, &[(0.0, 0.0), (100.0, 100.0)]);
        let bystander = StubDetector::new(DetectionMethod::BalancedPlate, &[(50.0, 50.0)]);
        let orchestrator = DetectionOrchestrator::new(
            DetectorRegistry::new()
                .register(primary.clone())
                .register(simple.clone())
                .register(bystander.clone()),
        );

        let outcome = orchestrator
            .detect(
                &image(1.0),
                &DetectionContext::new("u"),
                &plates_only(DetectionMethod::AggressivePlate, FallbackPolicy::SimpleOnEmpty),
            )
            .await;
        assert_eq!(outcome.plate_count, 2);
        assert_eq!(outcome.regions.len(), 2);
        assert!(outcome.regions.iter().all(|r| r.candidate.method == DetectionMethod::SimplePlate));
        assert_eq!(
            outcome.methods_run,
            vec![DetectionMethod::AggressivePlate, DetectionMethod::SimplePlate]
        );
        assert_eq!((primary.calls(), simple.calls(), bystander.calls()), (1, 1, 0));
    }

    #[tokio::test]
    async fn empty_fallback_ends_the_run() {
        let primary = StubDetector::new(DetectionMethod::BalancedPlate, &[]);
        let simple = StubDetector::new(DetectionMethod::SimplePlate, &[]);
        let orchestrator = DetectionOrchestrator::new(
            DetectorRegistry::new()
                .register(primary.clone())
                .register(simple.clone()),
        );
        let outcome = orchestrator
            .detect(
                &image(1.0),
                &DetectionContext::new("u"),
                &plates_only(DetectionMethod::BalancedPlate, FallbackPolicy::SimpleOnEmpty),
            )
            .await;
        assert!(outcome.regions.is_empty());
        assert_eq!((primary.calls(), simple.calls()), (1, 1));
    }

    #[tokio::test]
    async fn disabled_policy_returns_empty() {
        let primary = StubDetector::new(DetectionMethod::BalancedPlate, &[]);
        let simple = StubDetector::new(DetectionMethod::SimplePlate, &[(0.0, 0.0)]);
        let orchestrator = DetectionOrchestrator::new(
            DetectorRegistry::new()
                .register(primary.clone())
                .register(simple.clone()),
        );
        let outcome = orchestrator
            .detect(
                &image(1.0),
                &DetectionContext::new("u"),
                &plates_only(DetectionMethod::BalancedPlate, FallbackPolicy::Disabled),
            )
            .await;
        assert_eq!(outcome.plate_count, 0);
        assert_eq!(simple.calls(), 0);
    }

    #[tokio::test]
    async fn simple_detector_has_no_fallback_of_its_own() {
        let simple = StubDetector::new(DetectionMethod::SimplePlate, &[]);
        let orchestrator =
            DetectionOrchestrator::new(DetectorRegistry::new().register(simple.clone()));
        let outcome = orchestrator
            .detect(
                &image(1.0),
                &DetectionContext::new("u"),
                &plates_only(DetectionMethod::SimplePlate, FallbackPolicy::SimpleOnEmpty),
            )
            .await;
        assert!(outcome.regions.is_empty());
        assert_eq!(simple.calls(), 1);
    }

    #[tokio::test]
    async fn unregistered_method_yields_nothing() {
        let orchestrator = DetectionOrchestrator::new(DetectorRegistry::new());
        let outcome = orchestrator
            .detect(&image(1.0), &DetectionContext::new("u"), &DetectionSettings::default())
            .await;
        assert!(outcome.regions.is_empty());
        assert!(outcome.methods_run.is_empty());
    }

    #[tokio::test]
    async fn regions_are_merged_capped_and_rescaled() {
        let faces = StubDetector::new(DetectionMethod::HeuristicFace, &[(10.0, 10.0), (11.0, 10.0)]);
        let plates = StubDetector::new(
            DetectionMethod::BalancedPlate,
            &[(0.0, 100.0), (50.0, 100.0), (100.0, 100.0)],
        );
        let orchestrator = DetectionOrchestrator::new(
            DetectorRegistry::new().register(faces).register(plates),
        );
        let settings = DetectionSettings {
            max_regions: 2,
            ..DetectionSettings::default()
        };
        let outcome = orchestrator
            .detect(&image(2.0), &DetectionContext::new("u"), &settings)
            .await;

        assert_eq!((outcome.face_count, outcome.plate_count), (1, 2));
        let ids: Vec<&str> = outcome.regions.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["face-1", "plate-1", "plate-2"]);
        let face = &outcome.regions[0].candidate;
        assert_eq!((face.x, face.y, face.width, face.height), (20.0, 20.0, 80.0, 24.0));
        assert!(outcome.regions.iter().all(|r| r.enabled));
    }

    #[test]
    fn mismatched_methods_are_rejected() {
        let settings = DetectionSettings {
            face_method: DetectionMethod::SimplePlate,
            ..DetectionSettings::default()
        };
        assert!(DetectionOrchestrator::validate(&settings).is_err());
        assert!(DetectionOrchestrator::validate(&DetectionSettings::default()).is_ok());
    }
}
