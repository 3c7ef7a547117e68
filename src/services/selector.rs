// src/services/selector.rs
use chrono::Utc;
use log::{debug, info, warn};
use std::time::Duration;

use crate::models::{ProviderConfig, ProviderId};
use crate::services::ledger::{ProviderStats, UsageLedger};

#[derive(Debug, Clone)]
pub struct SelectorPolicy {
    /// A provider with more errors than this in the current error window is
    /// skipped until the window resets.
    pub error_ceiling: u64,
    pub error_window: Duration,
    /// Paid requests beyond the free tier are acceptable up to this cost.
    pub max_cost_per_request: f64,
}

impl Default for SelectorPolicy {
    fn default() -> Self {
        Self {
            error_ceiling: 5,
            error_window: Duration::from_secs(300),
            max_cost_per_request: 0.0,
        }
    }
}

/// Chooses which remote provider to call next and records how calls went.
/// Quotas and error counts live in the shared ledger, so every instance on
/// the same store sees the same numbers.
pub struct SmartApiSelector {
    providers: Vec<ProviderConfig>,
    policy: SelectorPolicy,
    ledger: UsageLedger,
}

impl SmartApiSelector {
    pub fn new(providers: Vec<ProviderConfig>, policy: SelectorPolicy, ledger: UsageLedger) -> Self {
        Self {
            providers,
            policy,
            ledger,
        }
    }

    pub fn config(&self, provider: ProviderId) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.provider_id == provider)
    }

    pub async fn stats(&self, provider: ProviderId) -> ProviderStats {
        self.ledger
            .provider_stats(provider)
            .await
            .unwrap_or_else(|e| {
                warn!("Cannot read stats for {}: {}", provider, e);
                ProviderStats::default()
            })
    }

    pub async fn usage_this_month(&self, user_id: &str, provider: ProviderId) -> u64 {
        self.ledger
            .monthly_usage(user_id, provider, Utc::now())
            .await
            .unwrap_or_else(|e| {
                warn!("Cannot read monthly usage for {} on {}: {}", user_id, provider, e);
                0
            })
    }

    /// Qualifying providers among `candidates`, best first. Unreadable
    /// counters count as zero.
    pub async fn ranked_providers(
        &self,
        user_id: &str,
        candidates: &[ProviderId],
    ) -> Vec<ProviderConfig> {
        let mut survivors: Vec<(ProviderConfig, u64)> = Vec::new();
        for config in &self.providers {
            let provider = config.provider_id;
            if !candidates.contains(&provider) || !config.is_active {
                continue;
            }
            let errors = self.ledger.provider_errors(provider).await.unwrap_or_else(|e| {
                warn!("Cannot read error count for {}: {}", provider, e);
                0
            });
            if errors > self.policy.error_ceiling {
                debug!("{} degraded ({} errors), skipping", provider, errors);
                continue;
            }
            let used = self.usage_this_month(user_id, provider).await;
            if used >= config.max_requests_per_month {
                debug!("{} quota exhausted for {} ({} calls)", provider, user_id, used);
                continue;
            }
            let within_free_tier = used < config.free_tier_limit;
            if !within_free_tier && config.cost_per_request > self.policy.max_cost_per_request {
                debug!("{} past free tier and over cost ceiling", provider);
                continue;
            }
            survivors.push((config.clone(), errors));
        }

        survivors.sort_by_key(|(config, errors)| (config.priority, *errors));
        survivors.into_iter().map(|(config, _)| config).collect()
    }

    pub async fn select_provider(
        &self,
        user_id: &str,
        candidates: &[ProviderId],
    ) -> Option<ProviderConfig> {
        self.ranked_providers(user_id, candidates)
            .await
            .into_iter()
            .next()
    }

    async fn count_call(&self, user_id: &str, provider: ProviderId) {
        if let Err(e) = self
            .ledger
            .track_monthly_usage(user_id, provider, Utc::now())
            .await
        {
            warn!("Monthly usage not recorded for {} on {}: {}", user_id, provider, e);
        }
    }

    pub async fn record_success(&self, user_id: &str, provider: ProviderId) {
        self.count_call(user_id, provider).await;
        if let Err(e) = self
            .ledger
            .record_provider_success(provider, self.policy.error_window)
            .await
        {
            warn!("Success not recorded for {}: {}", provider, e);
        }
    }

    pub async fn record_failure(&self, user_id: &str, provider: ProviderId) {
        self.count_call(user_id, provider).await;
        match self
            .ledger
            .record_provider_failure(provider, self.policy.error_window)
            .await
        {
            Ok(errors) if errors == self.policy.error_ceiling + 1 => {
                info!("{} marked degraded after {} errors", provider, errors)
            }
            Ok(_) => {}
            Err(e) => warn!("Failure not recorded for {}: {}", provider, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryStore;
    use std::sync::Arc;

    fn provider(id: ProviderId, priority: u8) -> ProviderConfig {
        ProviderConfig {
            provider_id: id,
            priority,
            is_active: true,
            cost_per_request: 0.0,
            free_tier_limit: 100,
            max_requests_per_minute: 10,
            max_requests_per_month: 100,
        }
    }

    fn policy() -> SelectorPolicy {
        SelectorPolicy {
            error_ceiling: 2,
            error_window: Duration::from_secs(60),
            max_cost_per_request: 0.0,
        }
    }

    fn selector(providers: Vec<ProviderConfig>) -> SmartApiSelector {
        SmartApiSelector::new(
            providers,
            policy(),
            UsageLedger::new(Arc::new(MemoryStore::new())),
        )
    }

    #[tokio::test]
    async fn lowest_priority_wins() {
        let s = selector(vec![
            provider(ProviderId::OpenAlpr, 3),
            provider(ProviderId::PlateRecognizer, 1),
        ]);
        let chosen = s
            .select_provider("u", &[ProviderId::OpenAlpr, ProviderId::PlateRecognizer])
            .await
            .unwrap();
        assert_eq!(chosen.provider_id, ProviderId::PlateRecognizer);
    }

    #[tokio::test]
    async fn equal_priority_breaks_ties_on_error_count() {
        let s = selector(vec![
            provider(ProviderId::PlateRecognizer, 2),
            provider(ProviderId::OpenAlpr, 2),
        ]);
        s.record_failure("u", ProviderId::PlateRecognizer).await;
        let chosen = s
            .select_provider("u", &[ProviderId::PlateRecognizer, ProviderId::OpenAlpr])
            .await
            .unwrap();
        assert_eq!(chosen.provider_id, ProviderId::OpenAlpr);
    }

    #[tokio::test]
    async fn inactive_and_unlisted_providers_are_never_chosen() {
        let mut inactive = provider(ProviderId::PlateRecognizer, 1);
        inactive.is_active = false;
        let s = selector(vec![inactive, provider(ProviderId::GoogleVision, 2)]);
        assert!(s.select_provider("u", &[ProviderId::PlateRecognizer]).await.is_none());
        assert!(s.select_provider("u", &[ProviderId::OpenAlpr]).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_provider_returns_after_error_window() {
        let s = selector(vec![provider(ProviderId::PlateRecognizer, 1)]);
        for _ in 0..3 {
            s.record_failure("u", ProviderId::PlateRecognizer).await;
        }
        assert!(s.select_provider("u", &[ProviderId::PlateRecognizer]).await.is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(s.select_provider("u", &[ProviderId::PlateRecognizer]).await.is_some());
        assert_eq!(s.stats(ProviderId::PlateRecognizer).await.error_count, 0);
    }

    #[tokio::test]
    async fn success_resets_streak_but_not_error_total() {
        let s = selector(vec![provider(ProviderId::PlateRecognizer, 1)]);
        s.record_failure("u", ProviderId::PlateRecognizer).await;
        s.record_failure("u", ProviderId::PlateRecognizer).await;
        s.record_success("u", ProviderId::PlateRecognizer).await;
        let stats = s.stats(ProviderId::PlateRecognizer).await;
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.consecutive_errors, 0);
        assert!(stats.last_used_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_free_tier_needs_acceptable_cost() {
        let mut paid = provider(ProviderId::OpenAlpr, 1);
        paid.free_tier_limit = 1;
        paid.cost_per_request = 0.01;
        let s = selector(vec![paid]);
        assert!(s.select_provider("u", &[ProviderId::OpenAlpr]).await.is_some());
        s.record_success("u", ProviderId::OpenAlpr).await;
        assert!(s.select_provider("u", &[ProviderId::OpenAlpr]).await.is_none());
        // Other users have their own monthly budget.
        assert!(s.select_provider("v", &[ProviderId::OpenAlpr]).await.is_some());
    }

    #[tokio::test]
    async fn monthly_cap_is_a_hard_limit() {
        let mut capped = provider(ProviderId::GoogleVision, 1);
        capped.max_requests_per_month = 2;
        let s = SmartApiSelector::new(
            vec![capped],
            SelectorPolicy {
                max_cost_per_request: 1.0,
                ..SelectorPolicy::default()
            },
            UsageLedger::new(Arc::new(MemoryStore::new())),
        );
        s.record_success("u", ProviderId::GoogleVision).await;
        s.record_success("u", ProviderId::GoogleVision).await;
        assert_eq!(s.usage_this_month("u", ProviderId::GoogleVision).await, 2);
        assert!(s.select_provider("u", &[ProviderId::GoogleVision]).await.is_none());
    }

    #[tokio::test]
    async fn instances_on_one_store_share_quota_and_errors() {
        let mut capped = provider(ProviderId::OpenAlpr, 1);
        capped.max_requests_per_month = 1;
        let ledger = UsageLedger::new(Arc::new(MemoryStore::new()));
        let a = SmartApiSelector::new(vec![capped.clone()], policy(), ledger.clone());
        let b = SmartApiSelector::new(vec![capped], policy(), ledger);

        assert!(b.select_provider("u", &[ProviderId::OpenAlpr]).await.is_some());
        a.record_success("u", ProviderId::OpenAlpr).await;
        assert_eq!(b.usage_this_month("u", ProviderId::OpenAlpr).await, 1);
        assert!(b.select_provider("u", &[ProviderId::OpenAlpr]).await.is_none());

        a.record_failure("v", ProviderId::OpenAlpr).await;
        assert_eq!(b.stats(ProviderId::OpenAlpr).await.error_count, 1);
    }
}
