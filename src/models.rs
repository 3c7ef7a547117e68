// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::VeilpixError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    Face,
    Plate,
}

impl RegionKind {
    /// Fraction of the box's own size added on every side before redaction.
    pub fn expansion_margin(self) -> f32 {
        match self {
            RegionKind::Face => 0.15,
            RegionKind::Plate => 0.10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegionKind::Face => "face",
            RegionKind::Plate => "plate",
        }
    }
}

/// Closed set of detector variants. Every variant is registered in the
/// orchestrator's lookup table; adding one forces the matches below to be
/// extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMethod {
    /// Low-cost plate scanner, also the designated fallback.
    SimplePlate,
    BalancedPlate,
    AggressivePlate,
    HeuristicFace,
    /// Two-stage local model: object locator followed by a text reader.
    LocalModel,
    /// Remote provider chosen at call time by the API selector.
    SmartRemote,
    PlateRecognizer,
    OpenAlpr,
    GoogleVision,
}

impl DetectionMethod {
    pub const ALL: [DetectionMethod; 9] = [
        DetectionMethod::SimplePlate,
        DetectionMethod::BalancedPlate,
        DetectionMethod::AggressivePlate,
        DetectionMethod::HeuristicFace,
        DetectionMethod::LocalModel,
        DetectionMethod::SmartRemote,
        DetectionMethod::PlateRecognizer,
        DetectionMethod::OpenAlpr,
        DetectionMethod::GoogleVision,
    ];

    pub fn kind(self) -> RegionKind {
        match self {
            DetectionMethod::HeuristicFace | DetectionMethod::GoogleVision => RegionKind::Face,
            DetectionMethod::SimplePlate
            | DetectionMethod::BalancedPlate
            | DetectionMethod::AggressivePlate
            | DetectionMethod::LocalModel
            | DetectionMethod::SmartRemote
            | DetectionMethod::PlateRecognizer
            | DetectionMethod::OpenAlpr => RegionKind::Plate,
        }
    }

    /// The single method that may run when this one yields nothing.
    pub fn fallback(self) -> Option<DetectionMethod> {
        match self {
            DetectionMethod::SimplePlate | DetectionMethod::HeuristicFace => None,
            DetectionMethod::BalancedPlate
            | DetectionMethod::AggressivePlate
            | DetectionMethod::LocalModel
            | DetectionMethod::SmartRemote
            | DetectionMethod::PlateRecognizer
            | DetectionMethod::OpenAlpr => Some(DetectionMethod::SimplePlate),
            DetectionMethod::GoogleVision => Some(DetectionMethod::HeuristicFace),
        }
    }

    pub fn is_remote(self) -> bool {
        matches!(
            self,
            DetectionMethod::SmartRemote
                | DetectionMethod::PlateRecognizer
                | DetectionMethod::OpenAlpr
                | DetectionMethod::GoogleVision
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMethod::SimplePlate => "simple-plate",
            DetectionMethod::BalancedPlate => "balanced-plate",
            DetectionMethod::AggressivePlate => "aggressive-plate",
            DetectionMethod::HeuristicFace => "heuristic-face",
            DetectionMethod::LocalModel => "local-model",
            DetectionMethod::SmartRemote => "smart-remote",
            DetectionMethod::PlateRecognizer => "plate-recognizer",
            DetectionMethod::OpenAlpr => "open-alpr",
            DetectionMethod::GoogleVision => "google-vision",
        }
    }

    pub fn parse(value: &str) -> Result<Self, VeilpixError> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == value)
            .ok_or_else(|| VeilpixError::Validation(format!("unknown detection method: {value}")))
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderId {
    PlateRecognizer,
    OpenAlpr,
    GoogleVision,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [
        ProviderId::PlateRecognizer,
        ProviderId::OpenAlpr,
        ProviderId::GoogleVision,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::PlateRecognizer => "plate-recognizer",
            ProviderId::OpenAlpr => "open-alpr",
            ProviderId::GoogleVision => "google-vision",
        }
    }

    pub fn method(self) -> DetectionMethod {
        match self {
            ProviderId::PlateRecognizer => DetectionMethod::PlateRecognizer,
            ProviderId::OpenAlpr => DetectionMethod::OpenAlpr,
            ProviderId::GoogleVision => DetectionMethod::GoogleVision,
        }
    }

    pub fn parse(value: &str) -> Result<Self, VeilpixError> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == value)
            .ok_or_else(|| VeilpixError::InvalidProvider(value.to_string()))
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned box produced by a detector. `x`/`y` are the top-left corner,
/// in pixel space of the image handed to the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionCandidate {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_prob: Option<f32>,
    pub method: DetectionMethod,
    pub kind: RegionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f32>,
}

impl DetectionCandidate {
    pub fn new(
        method: DetectionMethod,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        confidence: f32,
    ) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: confidence.clamp(0.0, 1.0),
            class_prob: None,
            method,
            kind: method.kind(),
            plate_text: None,
            ocr_confidence: None,
        }
    }

    pub fn with_class_prob(mut self, class_prob: f32) -> Self {
        self.class_prob = Some(class_prob.clamp(0.0, 1.0));
        self
    }

    pub fn class_prob(&self) -> f32 {
        self.class_prob.unwrap_or(self.confidence)
    }

    /// Ranking score used by non-maximum suppression.
    pub fn score(&self) -> f32 {
        self.confidence * self.class_prob()
    }
}

/// A merged candidate promoted for presentation; only `enabled` is mutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedRegion {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RegionKind,
    pub enabled: bool,
    #[serde(flatten)]
    pub candidate: DetectionCandidate,
}

impl DetectedRegion {
    pub fn from_candidate(index: usize, candidate: DetectionCandidate) -> Self {
        Self {
            id: format!("{}-{}", candidate.kind.as_str(), index + 1),
            kind: candidate.kind,
            enabled: true,
            candidate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider_id: ProviderId,
    /// 1..=10, ascending is tried first.
    pub priority: u8,
    pub is_active: bool,
    pub cost_per_request: f64,
    pub free_tier_limit: u64,
    pub max_requests_per_minute: u64,
    pub max_requests_per_month: u64,
}

impl ProviderConfig {
    pub fn defaults() -> Vec<ProviderConfig> {
        vec![
            ProviderConfig {
                provider_id: ProviderId::PlateRecognizer,
                priority: 1,
                is_active: true,
                cost_per_request: 0.0,
                free_tier_limit: 2_500,
                max_requests_per_minute: 8,
                max_requests_per_month: 2_500,
            },
            ProviderConfig {
                provider_id: ProviderId::OpenAlpr,
                priority: 2,
                is_active: true,
                cost_per_request: 0.004,
                free_tier_limit: 1_000,
                max_requests_per_minute: 30,
                max_requests_per_month: 50_000,
            },
            ProviderConfig {
                provider_id: ProviderId::GoogleVision,
                priority: 3,
                is_active: true,
                cost_per_request: 0.0015,
                free_tier_limit: 1_000,
                max_requests_per_minute: 60,
                max_requests_per_month: 100_000,
            },
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: String,
    pub provider_id: ProviderId,
    pub key_name: String,
    pub encrypted_key: String,
    pub key_hash: String,
    pub priority: u8,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
}

/// What the vault hands out to callers: everything except the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySummary {
    pub id: Uuid,
    pub provider_id: ProviderId,
    pub key_name: String,
    pub key_hash: String,
    pub priority: u8,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
}

impl From<&ApiKeyRecord> for ApiKeySummary {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            provider_id: record.provider_id,
            key_name: record.key_name.clone(),
            key_hash: record.key_hash.clone(),
            priority: record.priority,
            is_active: record.is_active,
            last_used_at: record.last_used_at,
            success_count: record.success_count,
            error_count: record.error_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionMode {
    /// Debug only: solid fill to check region geometry.
    Highlight,
    Blur,
    Mosaic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedactionSettings {
    pub mode: RedactionMode,
    /// 0..=100, mapped to a radius of up to 30px.
    pub blur_amount: u8,
    /// Mosaic cell edge in pixels, never below 8.
    pub mosaic_amount: u32,
    pub highlight_color: [u8; 4],
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self {
            mode: RedactionMode::Blur,
            blur_amount: 50,
            mosaic_amount: 16,
            highlight_color: [255, 0, 0, 255],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// A primary method returning nothing ends the run with nothing.
    Disabled,
    /// One run of the method's designated fallback when the primary is empty.
    SimpleOnEmpty,
}

impl FallbackPolicy {
    pub fn parse(value: &str) -> Result<Self, VeilpixError> {
        match value {
            "disabled" => Ok(FallbackPolicy::Disabled),
            "simple-on-empty" => Ok(FallbackPolicy::SimpleOnEmpty),
            other => Err(VeilpixError::Validation(format!(
                "unknown fallback policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionSettings {
    pub detect_faces: bool,
    pub detect_plates: bool,
    pub face_method: DetectionMethod,
    pub plate_method: DetectionMethod,
    pub fallback: FallbackPolicy,
    pub iou_threshold: f32,
    pub max_regions: usize,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            detect_faces: true,
            detect_plates: true,
            face_method: DetectionMethod::HeuristicFace,
            plate_method: DetectionMethod::BalancedPlate,
            fallback: FallbackPolicy::Disabled,
            iou_threshold: 0.4,
            max_regions: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionOutcome {
    pub regions: Vec<DetectedRegion>,
    pub face_count: usize,
    pub plate_count: usize,
    pub methods_run: Vec<DetectionMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub current: u64,
    pub remaining: u64,
    /// Milliseconds until the window closes.
    pub reset_in_ms: u64,
    pub reset_time: DateTime<Utc>,
    pub allowed: bool,
}
