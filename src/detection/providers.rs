// src/detection/providers.rs
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::Client;
use serde_json::{Value, json};

use crate::detection::DetectionImage;
use crate::errors::VeilpixError;
use crate::models::{DetectionCandidate, DetectionMethod, ProviderId};
use crate::services::vault::ProviderSecret;

pub const PLATE_RECOGNIZER_URL: &str = "https://api.platerecognizer.com/v1/plate-reader/";
pub const OPENALPR_URL: &str = "https://api.openalpr.com/v3/recognize_bytes";
pub const GOOGLE_VISION_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// One remote detection service. Adapters only speak HTTP; quota, key and
/// rate-limit bookkeeping belong to the caller.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> ProviderId;

    async fn detect(
        &self,
        image: &DetectionImage,
        secret: &ProviderSecret,
    ) -> Result<Vec<DetectionCandidate>, VeilpixError>;
}

async fn read_json(response: reqwest::Response, provider: ProviderId) -> Result<Value, VeilpixError> {
    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        return Err(VeilpixError::Provider(format!(
            "{} returned {}: {}",
            provider, status, error_text
        )));
    }
    response
        .json()
        .await
        .map_err(|e| VeilpixError::Provider(format!("Failed to parse {} response: {}", provider, e)))
}

pub struct PlateRecognizerAdapter {
    client: Client,
    endpoint: String,
}

impl PlateRecognizerAdapter {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint: PLATE_RECOGNIZER_URL.to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for PlateRecognizerAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::PlateRecognizer
    }

    async fn detect(
        &self,
        image: &DetectionImage,
        secret: &ProviderSecret,
    ) -> Result<Vec<DetectionCandidate>, VeilpixError> {
        let part = reqwest::multipart::Part::bytes(image.encode_jpeg()?)
            .file_name("upload.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| VeilpixError::Provider(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("upload", part);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Token {}", secret.expose()))
            .multipart(form)
            .send()
            .await
            .map_err(|e| VeilpixError::Provider(format!("Plate Recognizer request failed: {}", e)))?;

        let body = read_json(response, self.provider()).await?;
        Ok(parse_plate_recognizer(&body))
    }
}

/// `results[].box` holds corner coordinates; `score` is the read confidence
/// and `dscore` the detection confidence.
pub fn parse_plate_recognizer(body: &Value) -> Vec<DetectionCandidate> {
    let Some(results) = body["results"].as_array() else {
        return Vec::new();
    };
    results
        .iter()
        .filter_map(|result| {
            let bx = &result["box"];
            let xmin = bx["xmin"].as_f64()? as f32;
            let ymin = bx["ymin"].as_f64()? as f32;
            let xmax = bx["xmax"].as_f64()? as f32;
            let ymax = bx["ymax"].as_f64()? as f32;
            let detect_score = result["dscore"]
                .as_f64()
                .or_else(|| result["score"].as_f64())
                .unwrap_or(0.0) as f32;
            let mut candidate = DetectionCandidate::new(
                DetectionMethod::PlateRecognizer,
                xmin,
                ymin,
                xmax - xmin,
                ymax - ymin,
                detect_score,
            );
            candidate.plate_text = result["plate"].as_str().map(|p| p.to_uppercase());
            candidate.ocr_confidence = result["score"].as_f64().map(|s| s as f32);
            Some(candidate)
        })
        .filter(|c| c.width > 0.0 && c.height > 0.0)
        .collect()
}

pub struct OpenAlprAdapter {
    client: Client,
    endpoint: String,
    country: String,
}

impl OpenAlprAdapter {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint: OPENALPR_URL.to_string(),
            country: "us".to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAlprAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::OpenAlpr
    }

    async fn detect(
        &self,
        image: &DetectionImage,
        secret: &ProviderSecret,
    ) -> Result<Vec<DetectionCandidate>, VeilpixError> {
        let base64_image = general_purpose::STANDARD.encode(image.encode_jpeg()?);
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("secret_key", secret.expose()),
                ("country", self.country.as_str()),
                ("recognize_vehicle", "0"),
            ])
            .body(base64_image)
            .send()
            .await
            .map_err(|e| VeilpixError::Provider(format!("OpenALPR request failed: {}", e)))?;

        let body = read_json(response, self.provider()).await?;
        Ok(parse_openalpr(&body))
    }
}

/// `results[].coordinates` is a four-point polygon; confidence is 0..100.
pub fn parse_openalpr(body: &Value) -> Vec<DetectionCandidate> {
    let Some(results) = body["results"].as_array() else {
        return Vec::new();
    };
    results
        .iter()
        .filter_map(|result| {
            let (x, y, width, height) = polygon_bounds(result["coordinates"].as_array()?)?;
            let confidence = result["confidence"].as_f64().unwrap_or(0.0) as f32 / 100.0;
            let mut candidate =
                DetectionCandidate::new(DetectionMethod::OpenAlpr, x, y, width, height, confidence);
            candidate.plate_text = result["plate"].as_str().map(str::to_string);
            candidate.ocr_confidence = Some(candidate.confidence);
            Some(candidate)
        })
        .collect()
}

pub struct GoogleVisionAdapter {
    client: Client,
    endpoint: String,
    max_results: u32,
}

impl GoogleVisionAdapter {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint: GOOGLE_VISION_URL.to_string(),
            max_results: 20,
        }
    }
}

#[async_trait]
impl ProviderAdapter for GoogleVisionAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::GoogleVision
    }

    async fn detect(
        &self,
        image: &DetectionImage,
        secret: &ProviderSecret,
    ) -> Result<Vec<DetectionCandidate>, VeilpixError> {
        let base64_image = general_purpose::STANDARD.encode(image.encode_jpeg()?);
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", secret.expose())])
            .json(&json!({
                "requests": [{
                    "image": { "content": base64_image },
                    "features": [{ "type": "FACE_DETECTION", "maxResults": self.max_results }]
                }]
            }))
            .send()
            .await
            .map_err(|e| VeilpixError::Provider(format!("Google Vision request failed: {}", e)))?;

        let body = read_json(response, self.provider()).await?;
        if let Some(message) = body["responses"][0]["error"]["message"].as_str() {
            return Err(VeilpixError::Provider(format!("Google Vision error: {}", message)));
        }
        Ok(parse_google_vision(&body))
    }
}

/// Face boxes from `faceAnnotations[].boundingPoly`. Vision omits zero
/// coordinates from vertices.
pub fn parse_google_vision(body: &Value) -> Vec<DetectionCandidate> {
    let Some(faces) = body["responses"][0]["faceAnnotations"].as_array() else {
        return Vec::new();
    };
    faces
        .iter()
        .filter_map(|face| {
            let (x, y, width, height) = polygon_bounds(face["boundingPoly"]["vertices"].as_array()?)?;
            let confidence = face["detectionConfidence"].as_f64().unwrap_or(0.0) as f32;
            Some(DetectionCandidate::new(
                DetectionMethod::GoogleVision,
                x,
                y,
                width,
                height,
                confidence,
            ))
        })
        .collect()
}

fn polygon_bounds(points: &[Value]) -> Option<(f32, f32, f32, f32)> {
    if points.is_empty() {
        return None;
    }
    let xs = points.iter().map(|p| p["x"].as_f64().unwrap_or(0.0) as f32);
    let ys = points.iter().map(|p| p["y"].as_f64().unwrap_or(0.0) as f32);
    let (min_x, max_x) = xs.fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let (min_y, max_y) = ys.fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let (width, height) = (max_x - min_x, max_y - min_y);
    (width > 0.0 && height > 0.0).then_some((min_x, min_y, width, height))
}
