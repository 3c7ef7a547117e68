// src/errors.rs
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VeilpixError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid provider: {0}")]
    InvalidProvider(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Vault error: {0}")]
    Vault(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Busy: {0}")]
    Busy(String),
}

impl From<redis::RedisError> for VeilpixError {
    fn from(e: redis::RedisError) -> Self {
        VeilpixError::Redis(e.to_string())
    }
}

impl From<serde_json::Error> for VeilpixError {
    fn from(e: serde_json::Error) -> Self {
        VeilpixError::Serialization(e.to_string())
    }
}

impl From<image::ImageError> for VeilpixError {
    fn from(e: image::ImageError) -> Self {
        VeilpixError::ImageProcessing(e.to_string())
    }
}

impl VeilpixError {
    fn label(&self) -> &'static str {
        match self {
            VeilpixError::Redis(_) | VeilpixError::Store(_) => "Database error",
            VeilpixError::ImageProcessing(_) => "Image processing error",
            VeilpixError::Serialization(_) => "Data processing error",
            VeilpixError::Validation(_) => "Validation error",
            VeilpixError::InvalidProvider(_) => "Invalid provider",
            VeilpixError::Provider(_) => "Detection provider error",
            VeilpixError::Vault(_) => "Credential vault error",
            VeilpixError::Model(_) => "Model error",
            VeilpixError::RateLimited { .. } => "Too many requests",
            VeilpixError::NotFound(_) => "Not found",
            VeilpixError::Busy(_) => "Resource busy",
        }
    }
}

impl ResponseError for VeilpixError {
    fn status_code(&self) -> StatusCode {
        match self {
            VeilpixError::Redis(_)
            | VeilpixError::Store(_)
            | VeilpixError::Serialization(_)
            | VeilpixError::Vault(_)
            | VeilpixError::Model(_) => StatusCode::INTERNAL_SERVER_ERROR,
            VeilpixError::ImageProcessing(_)
            | VeilpixError::Validation(_)
            | VeilpixError::InvalidProvider(_) => StatusCode::BAD_REQUEST,
            VeilpixError::Provider(_) => StatusCode::SERVICE_UNAVAILABLE,
            VeilpixError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            VeilpixError::NotFound(_) => StatusCode::NOT_FOUND,
            VeilpixError::Busy(_) => StatusCode::CONFLICT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if let VeilpixError::RateLimited { retry_after_ms } = self {
            builder.insert_header(("retry-after", retry_after_ms.div_ceil(1000).to_string()));
        }
        builder.json(serde_json::json!({
            "error": self.label(),
            "message": self.to_string()
        }))
    }
}
