// src/services/ledger.rs
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::VeilpixError;
use crate::models::{ProviderId, RateLimitStatus};
use crate::services::store::LedgerStore;

pub const USAGE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
pub const WEBHOOK_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(86_400);
/// Outlives the longest calendar month so a counter covers its whole month.
pub const MONTHLY_USAGE_TTL: Duration = Duration::from_secs(35 * 24 * 3600);
pub const PROVIDER_STATS_TTL: Duration = Duration::from_secs(35 * 24 * 3600);

/// Proof of lock ownership. Release only succeeds while the store still
/// holds this token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    owner: String,
}

/// Provider call health as recorded in the shared store. `error_count`
/// covers the current error window only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub user_today: u64,
    pub user_provider_today: u64,
    pub provider_today: u64,
}

/// Usage accounting, fixed-window rate limiting, idempotency marks and locks
/// over one shared [`LedgerStore`].
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn LedgerStore>,
}

fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn usage_keys(user_id: &str, provider: ProviderId, date: NaiveDate) -> [String; 3] {
    let day = day_key(date);
    [
        format!("api_usage:{}:{}", user_id, day),
        format!("api_usage:{}:{}:{}", user_id, provider, day),
        format!("api_usage:global:{}:{}", provider, day),
    ]
}

pub fn monthly_usage_key(user_id: &str, provider: ProviderId, at: DateTime<Utc>) -> String {
    format!(
        "api_usage:{}:{}:{:04}-{:02}",
        user_id,
        provider,
        at.year(),
        at.month()
    )
}

fn provider_stats_key(provider: ProviderId, field: &str) -> String {
    format!("provider_stats:{}:{}", provider, field)
}

impl UsageLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Best effort: a store failure is logged and swallowed so tracking never
    /// blocks the call it instruments.
    pub async fn track_usage(&self, user_id: &str, provider: ProviderId) {
        self.track_usage_on(user_id, provider, Utc::now().date_naive())
            .await
    }

    pub async fn track_usage_on(&self, user_id: &str, provider: ProviderId, date: NaiveDate) {
        let keys = usage_keys(user_id, provider, date);
        match self.store.incr_with_first_expiry(&keys, USAGE_TTL).await {
            Ok(counts) => debug!("Usage for {} on {}: {:?}", user_id, provider, counts),
            Err(e) => warn!(
                "Usage tracking failed for {} on {} (ignored): {}",
                user_id, provider, e
            ),
        }
    }

    pub async fn usage_on(
        &self,
        user_id: &str,
        provider: ProviderId,
        date: NaiveDate,
    ) -> Result<UsageSnapshot, VeilpixError> {
        let [user, user_provider, global] = usage_keys(user_id, provider, date);
        Ok(UsageSnapshot {
            user_today: self.store.get_counter(&user).await?,
            user_provider_today: self.store.get_counter(&user_provider).await?,
            provider_today: self.store.get_counter(&global).await?,
        })
    }

    /// Counts one call against the user's monthly quota for `provider`.
    pub async fn track_monthly_usage(
        &self,
        user_id: &str,
        provider: ProviderId,
        at: DateTime<Utc>,
    ) -> Result<u64, VeilpixError> {
        let counts = self
            .store
            .incr_with_first_expiry(&[monthly_usage_key(user_id, provider, at)], MONTHLY_USAGE_TTL)
            .await?;
        Ok(counts.first().copied().unwrap_or(0))
    }

    pub async fn monthly_usage(
        &self,
        user_id: &str,
        provider: ProviderId,
        at: DateTime<Utc>,
    ) -> Result<u64, VeilpixError> {
        self.store
            .get_counter(&monthly_usage_key(user_id, provider, at))
            .await
    }

    /// Bumps the success total and clears the error streak.
    pub async fn record_provider_success(
        &self,
        provider: ProviderId,
        error_window: Duration,
    ) -> Result<(), VeilpixError> {
        self.store
            .incr_with_first_expiry(&[provider_stats_key(provider, "success")], PROVIDER_STATS_TTL)
            .await?;
        self.store
            .set_with_expiry(&provider_stats_key(provider, "streak"), "0", error_window)
            .await?;
        self.touch_provider(provider).await
    }

    /// Counts an error in the provider's error window, which starts at the
    /// first error and expires on its own. Returns the errors in the window.
    pub async fn record_provider_failure(
        &self,
        provider: ProviderId,
        error_window: Duration,
    ) -> Result<u64, VeilpixError> {
        let (errors, _) = self
            .store
            .incr_fixed_window(&provider_stats_key(provider, "errors"), error_window)
            .await?;
        self.store
            .incr_with_first_expiry(&[provider_stats_key(provider, "streak")], error_window)
            .await?;
        self.touch_provider(provider).await?;
        Ok(errors)
    }

    async fn touch_provider(&self, provider: ProviderId) -> Result<(), VeilpixError> {
        self.store
            .set_with_expiry(
                &provider_stats_key(provider, "last_used"),
                &Utc::now().to_rfc3339(),
                PROVIDER_STATS_TTL,
            )
            .await
    }

    pub async fn provider_errors(&self, provider: ProviderId) -> Result<u64, VeilpixError> {
        self.store
            .get_counter(&provider_stats_key(provider, "errors"))
            .await
    }

    pub async fn provider_stats(&self, provider: ProviderId) -> Result<ProviderStats, VeilpixError> {
        let last_used_at = self
            .store
            .get(&provider_stats_key(provider, "last_used"))
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc));
        Ok(ProviderStats {
            success_count: self
                .store
                .get_counter(&provider_stats_key(provider, "success"))
                .await?,
            error_count: self.provider_errors(provider).await?,
            consecutive_errors: self
                .store
                .get_counter(&provider_stats_key(provider, "streak"))
                .await?,
            last_used_at,
        })
    }

    /// Fixed-window limiter anchored to the first request of the window.
    /// Bursts straddling a window boundary can reach twice `max_requests`.
    pub async fn check_rate_limit(
        &self,
        bucket: &str,
        window_ms: u64,
        max_requests: u64,
    ) -> Result<RateLimitStatus, VeilpixError> {
        let window = Duration::from_millis(window_ms);
        let (current, reset_in) = self.store.incr_fixed_window(bucket, window).await?;
        let reset_in_ms = reset_in.as_millis() as u64;
        Ok(RateLimitStatus {
            current,
            remaining: max_requests.saturating_sub(current),
            reset_in_ms,
            reset_time: Utc::now() + chrono::Duration::milliseconds(reset_in_ms as i64),
            allowed: current <= max_requests,
        })
    }

    /// Marks a delivery as processed. Returns true only for the first caller;
    /// check and mark are one atomic set-if-absent.
    pub async fn mark_processed(&self, delivery_id: &str) -> Result<bool, VeilpixError> {
        self.store
            .set_if_absent(&format!("webhook:{}", delivery_id), "1", WEBHOOK_TTL)
            .await
    }

    /// `Ok(None)` means someone else holds the lock. The TTL must outlast the
    /// critical section.
    pub async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, VeilpixError> {
        let token = LockToken {
            key: format!("lock:{}", name),
            owner: Uuid::new_v4().to_string(),
        };
        if self.store.set_if_absent(&token.key, &token.owner, ttl).await? {
            Ok(Some(token))
        } else {
            debug!("Lock {} is held elsewhere", token.key);
            Ok(None)
        }
    }

    /// Returns false when the lock expired or was taken over by another owner.
    pub async fn release_lock(&self, token: LockToken) -> Result<bool, VeilpixError> {
        let released = self
            .store
            .delete_if_equals(&token.key, &token.owner)
            .await?;
        if !released {
            warn!("Lock {} was no longer owned at release", token.key);
        }
        Ok(released)
    }

    pub async fn put_session(
        &self,
        session_id: &str,
        payload: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), VeilpixError> {
        let value = serde_json::to_string(payload)?;
        self.store
            .set_with_expiry(
                &format!("session:{}", session_id),
                &value,
                ttl.unwrap_or(DEFAULT_SESSION_TTL),
            )
            .await
    }

    pub async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<serde_json::Value>, VeilpixError> {
        match self.store.get(&format!("session:{}", session_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
