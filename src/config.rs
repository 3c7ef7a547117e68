// src/config.rs
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::VeilpixError;
use crate::models::{FallbackPolicy, ProviderConfig, ProviderId};

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: String,
    pub redis_url: Option<String>,
    pub vault_master_key: Option<String>,
    pub fallback: FallbackPolicy,
    pub plate_model: Option<PathBuf>,
    pub text_model: Option<PathBuf>,
    pub batch_delay: Duration,
    pub rate_limit: u64,
    pub rate_window_ms: u64,
    pub disabled_providers: Vec<ProviderId>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            redis_url: None,
            vault_master_key: None,
            fallback: FallbackPolicy::Disabled,
            plate_model: None,
            text_model: None,
            batch_delay: Duration::from_millis(250),
            rate_limit: 30,
            rate_window_ms: 60_000,
            disabled_providers: Vec::new(),
        }
    }
}

fn parse_number(name: &str, value: String) -> Result<u64, VeilpixError> {
    value
        .trim()
        .parse()
        .map_err(|_| VeilpixError::Validation(format!("{} must be a whole number, got {:?}", name, value)))
}

fn disable_var(provider: ProviderId) -> String {
    format!(
        "VEILPIX_DISABLE_{}",
        provider.as_str().replace('-', "_").to_uppercase()
    )
}

impl Settings {
    pub fn from_env() -> Result<Self, VeilpixError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds settings from any variable source; unset variables keep their
    /// defaults and malformed ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, VeilpixError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(bind) = var("VEILPIX_BIND") {
            settings.bind = bind;
        }
        settings.redis_url = var("REDIS_URL");
        settings.vault_master_key = var("VAULT_MASTER_KEY");
        if let Some(policy) = var("VEILPIX_FALLBACK") {
            settings.fallback = FallbackPolicy::parse(policy.trim())?;
        }
        settings.plate_model = var("VEILPIX_PLATE_MODEL").map(PathBuf::from);
        settings.text_model = var("VEILPIX_TEXT_MODEL").map(PathBuf::from);
        if let Some(delay) = var("VEILPIX_BATCH_DELAY_MS") {
            settings.batch_delay = Duration::from_millis(parse_number("VEILPIX_BATCH_DELAY_MS", delay)?);
        }
        if let Some(limit) = var("VEILPIX_RATE_LIMIT") {
            settings.rate_limit = parse_number("VEILPIX_RATE_LIMIT", limit)?;
        }
        if let Some(window) = var("VEILPIX_RATE_WINDOW_MS") {
            let window = parse_number("VEILPIX_RATE_WINDOW_MS", window)?;
            if window == 0 {
                return Err(VeilpixError::Validation(
                    "VEILPIX_RATE_WINDOW_MS must be positive".to_string(),
                ));
            }
            settings.rate_window_ms = window;
        }
        settings.disabled_providers = ProviderId::ALL
            .into_iter()
            .filter(|p| {
                var(&disable_var(*p)).is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"))
            })
            .collect();
        Ok(settings)
    }

    pub fn provider_configs(&self) -> Vec<ProviderConfig> {
        let mut configs = ProviderConfig::defaults();
        for config in &mut configs {
            if self.disabled_providers.contains(&config.provider_id) {
                config.is_active = false;
            }
        }
        configs
    }
}
