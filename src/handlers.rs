// src/handlers.rs
use crate::{
    AppState,
    errors::VeilpixError,
    models::*,
    services::ledger::DEFAULT_LOCK_TTL,
    services::vault::NewApiKey,
};
use actix_multipart::Multipart;
use actix_web::{HttpResponse, web};
use base64::{Engine as _, engine::general_purpose};
use futures_util::TryStreamExt;
use log::{debug, warn};
use serde::Deserialize;
use uuid::Uuid;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/detect", web::post().to(detect_regions))
            .route("/redact", web::post().to(redact_image))
            .route("/process", web::post().to(process_image))
            .route("/batch", web::post().to(process_batch))
            .route("/sessions/{session_id}", web::get().to(get_session))
            .route("/keys", web::post().to(add_api_key))
            .route("/keys/{user_id}", web::get().to(list_api_keys))
            .route("/usage/{user_id}/{provider}", web::get().to(get_usage))
            .route("/webhooks/{delivery_id}", web::post().to(acknowledge_webhook)),
    )
    .route("/health", web::get().to(health_check));
}

#[derive(Debug, Deserialize)]
pub struct DetectQuery {
    pub user_id: String,
    pub faces: Option<bool>,
    pub plates: Option<bool>,
    pub face_method: Option<String>,
    pub plate_method: Option<String>,
    pub fallback: Option<String>,
    pub mode: Option<RedactionMode>,
}

impl DetectQuery {
    fn detection_settings(&self, default_fallback: FallbackPolicy) -> Result<DetectionSettings, VeilpixError> {
        let mut settings = DetectionSettings {
            fallback: default_fallback,
            ..DetectionSettings::default()
        };
        if let Some(faces) = self.faces {
            settings.detect_faces = faces;
        }
        if let Some(plates) = self.plates {
            settings.detect_plates = plates;
        }
        if let Some(method) = &self.face_method {
            settings.face_method = DetectionMethod::parse(method)?;
        }
        if let Some(method) = &self.plate_method {
            settings.plate_method = DetectionMethod::parse(method)?;
        }
        if let Some(policy) = &self.fallback {
            settings.fallback = FallbackPolicy::parse(policy)?;
        }
        Ok(settings)
    }

    fn redaction_settings(&self) -> RedactionSettings {
        RedactionSettings {
            mode: self.mode.unwrap_or(RedactionMode::Blur),
            ..RedactionSettings::default()
        }
    }
}

fn require_user(user_id: &str) -> Result<(), VeilpixError> {
    if user_id.trim().is_empty() {
        return Err(VeilpixError::Validation("user_id is required".to_string()));
    }
    Ok(())
}

/// Per-user request limit. A store outage lets the request through.
async fn enforce_rate_limit(data: &AppState, user_id: &str) -> Result<(), VeilpixError> {
    let status = match data
        .ledger
        .check_rate_limit(
            &format!("ratelimit:api:{}", user_id),
            data.settings.rate_window_ms,
            data.settings.rate_limit,
        )
        .await
    {
        Ok(status) => status,
        Err(e) => {
            warn!("Rate limit check failed for {}, allowing: {}", user_id, e);
            return Ok(());
        }
    };
    if !status.allowed {
        return Err(VeilpixError::RateLimited {
            retry_after_ms: status.reset_in_ms,
        });
    }
    Ok(())
}

pub async fn detect_regions(
    body: web::Bytes,
    query: web::Query<DetectQuery>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, VeilpixError> {
    require_user(&query.user_id)?;
    enforce_rate_limit(&data, &query.user_id).await?;
    let settings = query.detection_settings(data.settings.fallback)?;

    let outcome = data.pipeline.detect(&body, &query.user_id, &settings).await?;

    // Regions are kept so the client can toggle them and come back for them.
    let session_id = Uuid::new_v4().to_string();
    if let Err(e) = data
        .ledger
        .put_session(&session_id, &serde_json::to_value(&outcome)?, None)
        .await
    {
        warn!("Could not store detection session {}: {}", session_id, e);
    }

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "sessionId": session_id,
        "regions": outcome.regions,
        "faceCount": outcome.face_count,
        "plateCount": outcome.plate_count,
        "methodsRun": outcome.methods_run
    })))
}

pub async fn get_session(
    path: web::Path<String>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, VeilpixError> {
    let session_id = path.into_inner();
    let session = data
        .ledger
        .get_session(&session_id)
        .await?
        .ok_or_else(|| VeilpixError::NotFound(format!("session {}", session_id)))?;
    Ok(HttpResponse::Ok().json(session))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactRequest {
    /// Base64 encoded image.
    pub image: String,
    pub regions: Vec<DetectedRegion>,
    #[serde(default)]
    pub settings: RedactionSettings,
}

pub async fn redact_image(
    body: web::Json<RedactRequest>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, VeilpixError> {
    let request = body.into_inner();
    let image_data = general_purpose::STANDARD
        .decode(request.image.trim())
        .map_err(|e| VeilpixError::Validation(format!("image is not base64: {}", e)))?;

    let redacted = data
        .pipeline
        .engine()
        .apply(&image_data, &request.regions, &request.settings)?;

    Ok(HttpResponse::Ok().content_type("image/png").body(redacted))
}

pub async fn process_image(
    body: web::Bytes,
    query: web::Query<DetectQuery>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, VeilpixError> {
    require_user(&query.user_id)?;
    enforce_rate_limit(&data, &query.user_id).await?;
    let detection = query.detection_settings(data.settings.fallback)?;

    let processed = data
        .pipeline
        .process(&body, &query.user_id, &detection, &query.redaction_settings())
        .await?;

    Ok(HttpResponse::Ok()
        .content_type("image/png")
        .insert_header(("x-face-count", processed.face_count.to_string()))
        .insert_header(("x-plate-count", processed.plate_count.to_string()))
        .body(processed.image))
}

pub async fn process_batch(
    mut payload: Multipart,
    query: web::Query<DetectQuery>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, VeilpixError> {
    require_user(&query.user_id)?;
    enforce_rate_limit(&data, &query.user_id).await?;
    let detection = query.detection_settings(data.settings.fallback)?;

    let mut filenames = Vec::new();
    let mut images = Vec::new();
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| VeilpixError::Validation(format!("bad multipart body: {}", e)))?
    {
        let filename = field
            .content_disposition()
            .get_filename()
            .map(str::to_string)
            .unwrap_or_else(|| format!("image-{}", images.len() + 1));

        let mut image_data = Vec::new();
        while let Some(chunk) = field
            .try_next()
            .await
            .map_err(|e| VeilpixError::Validation(format!("bad multipart body: {}", e)))?
        {
            image_data.extend_from_slice(&chunk);
        }
        filenames.push(filename);
        images.push(image_data);
    }
    if images.is_empty() {
        return Err(VeilpixError::Validation("no images uploaded".to_string()));
    }
    debug!("Batch of {} images for {}", images.len(), query.user_id);

    let results = data
        .pipeline
        .process_batch(&images, &query.user_id, &detection, &query.redaction_settings())
        .await;

    let items: Vec<serde_json::Value> = filenames
        .into_iter()
        .zip(results)
        .map(|(filename, result)| match result {
            Ok(processed) => serde_json::json!({
                "filename": filename,
                "faceCount": processed.face_count,
                "plateCount": processed.plate_count,
                "regions": processed.regions,
                "image": general_purpose::STANDARD.encode(&processed.image)
            }),
            Err(e) => serde_json::json!({
                "filename": filename,
                "error": e.to_string()
            }),
        })
        .collect();

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "results": items,
        "count": items.len()
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyRequest {
    pub user_id: String,
    pub provider_id: String,
    pub key_name: String,
    pub api_key: String,
    pub priority: Option<u8>,
}

pub async fn add_api_key(
    body: web::Json<AddKeyRequest>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, VeilpixError> {
    let request = body.into_inner();
    require_user(&request.user_id)?;
    let provider_id = ProviderId::parse(&request.provider_id)?;

    // Key changes for one user are serialised across instances.
    let lock = data
        .ledger
        .acquire_lock(&format!("keys:{}", request.user_id), DEFAULT_LOCK_TTL)
        .await?
        .ok_or_else(|| VeilpixError::Busy("another key change is in progress".to_string()))?;

    let user_id = request.user_id.clone();
    let added = data
        .vault
        .add_key(NewApiKey {
            user_id: request.user_id,
            provider_id,
            key_name: request.key_name,
            plaintext: request.api_key,
            priority: request.priority.unwrap_or(5),
        })
        .await;
    // The key is stored either way; an expired or failed release only delays
    // the next change until the lock TTL runs out.
    if let Err(e) = data.ledger.release_lock(lock).await {
        warn!("Could not release key lock for {}: {}", user_id, e);
    }

    Ok(HttpResponse::Created().json(added?))
}

pub async fn list_api_keys(
    path: web::Path<String>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, VeilpixError> {
    let user_id = path.into_inner();
    let keys = data.vault.list_keys(&user_id).await;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "userId": user_id,
        "keys": keys,
        "count": keys.len()
    })))
}

pub async fn get_usage(
    path: web::Path<(String, String)>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, VeilpixError> {
    let (user_id, provider) = path.into_inner();
    let provider = ProviderId::parse(&provider)?;
    let today = chrono::Utc::now().date_naive();
    let usage = data.ledger.usage_on(&user_id, provider, today).await?;
    let this_month = data.selector.usage_this_month(&user_id, provider).await;
    let provider_stats = data.selector.stats(provider).await;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "userId": user_id,
        "provider": provider,
        "date": today.to_string(),
        "userToday": usage.user_today,
        "userProviderToday": usage.user_provider_today,
        "providerToday": usage.provider_today,
        "userProviderThisMonth": this_month,
        "providerStats": provider_stats
    })))
}

pub async fn acknowledge_webhook(
    path: web::Path<String>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, VeilpixError> {
    let delivery_id = path.into_inner();
    let first = data.ledger.mark_processed(&delivery_id).await?;
    if !first {
        debug!("Duplicate webhook delivery {}", delivery_id);
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "deliveryId": delivery_id,
        "duplicate": !first
    })))
}

pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "veilpix",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
