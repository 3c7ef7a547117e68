// src/detection/remote.rs
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::detection::providers::ProviderAdapter;
use crate::detection::{CandidateDetector, DetectionContext, DetectionImage};
use crate::errors::VeilpixError;
use crate::models::{DetectionCandidate, DetectionMethod, ProviderId, RegionKind};
use crate::services::ledger::UsageLedger;
use crate::services::selector::SmartApiSelector;
use crate::services::vault::ApiKeyVault;

pub const PROVIDER_RATE_WINDOW_MS: u64 = 60_000;

/// Why a provider was not called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    NotQualified,
    RateLimited,
    NoKey,
}

/// Bookkeeping shared by every remote call: who may be called, how often,
/// with which key, and what happened.
#[derive(Clone)]
pub struct RemoteGateway {
    selector: Arc<SmartApiSelector>,
    ledger: UsageLedger,
    vault: Arc<ApiKeyVault>,
}

impl RemoteGateway {
    pub fn new(selector: Arc<SmartApiSelector>, ledger: UsageLedger, vault: Arc<ApiKeyVault>) -> Self {
        Self {
            selector,
            ledger,
            vault,
        }
    }

    pub fn selector(&self) -> &Arc<SmartApiSelector> {
        &self.selector
    }

    pub async fn call(
        &self,
        adapter: &dyn ProviderAdapter,
        image: &DetectionImage,
        user_id: &str,
    ) -> Result<Result<Vec<DetectionCandidate>, Skip>, VeilpixError> {
        let provider = adapter.provider();

        if self
            .selector
            .ranked_providers(user_id, &[provider])
            .await
            .is_empty()
        {
            debug!("{} not qualified for {}", provider, user_id);
            return Ok(Err(Skip::NotQualified));
        }

        // Without a key nothing is called, so no rate budget is spent.
        let Some(key) = self.vault.resolve_key(user_id, provider).await? else {
            debug!("{} has no key for {}", user_id, provider);
            return Ok(Err(Skip::NoKey));
        };

        let per_minute = self
            .selector
            .config(provider)
            .map_or(0, |c| c.max_requests_per_minute);
        let limit = self
            .ledger
            .check_rate_limit(
                &format!("ratelimit:{}:{}", provider, user_id),
                PROVIDER_RATE_WINDOW_MS,
                per_minute,
            )
            .await?;
        if !limit.allowed {
            debug!(
                "{} rate limited for {}, window resets in {}ms",
                provider, user_id, limit.reset_in_ms
            );
            return Ok(Err(Skip::RateLimited));
        }

        let outcome = adapter.detect(image, &key.secret).await;
        self.ledger.track_usage(user_id, provider).await;
        match &outcome {
            Ok(found) => {
                info!("{} returned {} candidates for {}", provider, found.len(), user_id);
                self.selector.record_success(user_id, provider).await;
                self.vault.record_outcome(key.key_id, true).await;
            }
            Err(e) => {
                warn!("{} call failed for {}: {}", provider, user_id, e);
                self.selector.record_failure(user_id, provider).await;
                self.vault.record_outcome(key.key_id, false).await;
            }
        }
        outcome.map(Ok)
    }
}

/// A single fixed provider.
pub struct RemoteDetector {
    adapter: Arc<dyn ProviderAdapter>,
    gateway: RemoteGateway,
}

impl RemoteDetector {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, gateway: RemoteGateway) -> Self {
        Self { adapter, gateway }
    }
}

#[async_trait]
impl CandidateDetector for RemoteDetector {
    fn method(&self) -> DetectionMethod {
        self.adapter.provider().method()
    }

    async fn detect(
        &self,
        image: &DetectionImage,
        ctx: &DetectionContext,
    ) -> Vec<DetectionCandidate> {
        match self.gateway.call(self.adapter.as_ref(), image, &ctx.user_id).await {
            Ok(Ok(found)) => found,
            Ok(Err(skip)) => {
                debug!("{} skipped: {:?}", self.method(), skip);
                Vec::new()
            }
            Err(e) => {
                warn!("{} failed: {}", self.method(), e);
                Vec::new()
            }
        }
    }
}

/// Plate detection through whichever provider the selector ranks best and
/// the user can actually call right now.
pub struct SmartRemoteDetector {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    gateway: RemoteGateway,
}

impl SmartRemoteDetector {
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>, gateway: RemoteGateway) -> Self {
        Self {
            adapters: adapters
                .into_iter()
                .filter(|a| a.provider().method().kind() == RegionKind::Plate)
                .map(|a| (a.provider(), a))
                .collect(),
            gateway,
        }
    }
}

#[async_trait]
impl CandidateDetector for SmartRemoteDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::SmartRemote
    }

    async fn detect(
        &self,
        image: &DetectionImage,
        ctx: &DetectionContext,
    ) -> Vec<DetectionCandidate> {
        let candidates: Vec<ProviderId> = ProviderId::ALL
            .into_iter()
            .filter(|p| self.adapters.contains_key(p))
            .collect();
        let ranked = self
            .gateway
            .selector()
            .ranked_providers(&ctx.user_id, &candidates)
            .await;

        for config in ranked {
            let Some(adapter) = self.adapters.get(&config.provider_id) else {
                continue;
            };
            match self.gateway.call(adapter.as_ref(), image, &ctx.user_id).await {
                Ok(Ok(found)) => return found,
                Ok(Err(skip)) => debug!("{} skipped: {:?}", config.provider_id, skip),
                Err(e) => warn!("{} failed, trying next: {}", config.provider_id, e),
            }
        }
        debug!("No remote provider usable for {}", ctx.user_id);
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderConfig;
    use crate::services::selector::SelectorPolicy;
    use crate::services::store::MemoryStore;
    use crate::services::vault::{NewApiKey, ProviderSecret};
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAdapter {
        provider: ProviderId,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeAdapter {
        fn new(provider: ProviderId, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                provider,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn provider(&self) -> ProviderId {
            self.provider
        }

        async fn detect(
            &self,
            _image: &DetectionImage,
            secret: &ProviderSecret,
        ) -> Result<Vec<DetectionCandidate>, VeilpixError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(secret.expose(), format!("secret-{}", self.provider));
            if self.fail {
                return Err(VeilpixError::Provider("boom".to_string()));
            }
            Ok(vec![DetectionCandidate::new(
                self.provider.method(),
                1.0,
                2.0,
                30.0,
                10.0,
                0.9,
            )])
        }
    }

    fn image() -> DetectionImage {
        DetectionImage::new(RgbImage::new(64, 64), 1.0)
    }

    fn gateway(providers: Vec<ProviderConfig>) -> (RemoteGateway, UsageLedger, Arc<ApiKeyVault>) {
        gateway_on(providers, UsageLedger::new(Arc::new(MemoryStore::new())))
    }

    fn gateway_on(
        providers: Vec<ProviderConfig>,
        ledger: UsageLedger,
    ) -> (RemoteGateway, UsageLedger, Arc<ApiKeyVault>) {
        let vault = Arc::new(ApiKeyVault::ephemeral());
        let selector = Arc::new(SmartApiSelector::new(
            providers,
            SelectorPolicy::default(),
            ledger.clone(),
        ));
        (
            RemoteGateway::new(selector, ledger.clone(), Arc::clone(&vault)),
            ledger,
            vault,
        )
    }

    async fn add_key(vault: &ApiKeyVault, provider: ProviderId) {
        vault
            .add_key(NewApiKey {
                user_id: "u".to_string(),
                provider_id: provider,
                key_name: "main".to_string(),
                plaintext: format!("secret-{}", provider),
                priority: 1,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_call_is_tracked_everywhere() {
        let (gateway, ledger, vault) = gateway(ProviderConfig::defaults());
        add_key(&vault, ProviderId::PlateRecognizer).await;
        let adapter = FakeAdapter::new(ProviderId::PlateRecognizer, false);
        let detector = RemoteDetector::new(adapter.clone(), gateway.clone());

        let found = detector.detect(&image(), &DetectionContext::new("u")).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].method, DetectionMethod::PlateRecognizer);

        let usage = ledger
            .usage_on("u", ProviderId::PlateRecognizer, chrono::Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(usage.user_provider_today, 1);
        assert_eq!(
            gateway.selector().usage_this_month("u", ProviderId::PlateRecognizer).await,
            1
        );
        let key = vault.list_keys("u").await.remove(0);
        assert_eq!(key.success_count, 1);
    }

    #[tokio::test]
    async fn missing_key_means_no_call() {
        let (gateway, _, _) = gateway(ProviderConfig::defaults());
        let adapter = FakeAdapter::new(ProviderId::OpenAlpr, false);
        let outcome = gateway.call(adapter.as_ref(), &image(), "u").await.unwrap();
        assert_eq!(outcome.unwrap_err(), Skip::NoKey);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn keyless_attempts_leave_the_rate_budget_alone() {
        let mut configs = ProviderConfig::defaults();
        configs[0].max_requests_per_minute = 1;
        let (gateway, _, vault) = gateway(configs);
        let adapter = FakeAdapter::new(ProviderId::PlateRecognizer, false);

        for _ in 0..3 {
            let outcome = gateway.call(adapter.as_ref(), &image(), "u").await.unwrap();
            assert_eq!(outcome.unwrap_err(), Skip::NoKey);
        }
        add_key(&vault, ProviderId::PlateRecognizer).await;
        assert!(gateway.call(adapter.as_ref(), &image(), "u").await.unwrap().is_ok());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn monthly_cap_holds_across_gateways_on_one_store() {
        let mut configs = ProviderConfig::defaults();
        configs[0].max_requests_per_month = 1;
        let ledger = UsageLedger::new(Arc::new(MemoryStore::new()));
        let (first, _, first_vault) = gateway_on(configs.clone(), ledger.clone());
        let (second, _, second_vault) = gateway_on(configs, ledger);
        add_key(&first_vault, ProviderId::PlateRecognizer).await;
        add_key(&second_vault, ProviderId::PlateRecognizer).await;
        let adapter = FakeAdapter::new(ProviderId::PlateRecognizer, false);

        assert!(first.call(adapter.as_ref(), &image(), "u").await.unwrap().is_ok());
        let again = first.call(adapter.as_ref(), &image(), "u").await.unwrap();
        assert_eq!(again.unwrap_err(), Skip::NotQualified);
        let elsewhere = second.call(adapter.as_ref(), &image(), "u").await.unwrap();
        assert_eq!(elsewhere.unwrap_err(), Skip::NotQualified);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_minute_limit_stops_calls() {
        let mut configs = ProviderConfig::defaults();
        configs[0].max_requests_per_minute = 2;
        let (gateway, _, vault) = gateway(configs);
        add_key(&vault, ProviderId::PlateRecognizer).await;
        let adapter = FakeAdapter::new(ProviderId::PlateRecognizer, false);

        for _ in 0..2 {
            assert!(gateway.call(adapter.as_ref(), &image(), "u").await.unwrap().is_ok());
        }
        let third = gateway.call(adapter.as_ref(), &image(), "u").await.unwrap();
        assert_eq!(third.unwrap_err(), Skip::RateLimited);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_is_recorded_against_provider_and_key() {
        let (gateway, _, vault) = gateway(ProviderConfig::defaults());
        add_key(&vault, ProviderId::OpenAlpr).await;
        let adapter = FakeAdapter::new(ProviderId::OpenAlpr, true);

        assert!(gateway.call(adapter.as_ref(), &image(), "u").await.is_err());
        assert_eq!(gateway.selector().stats(ProviderId::OpenAlpr).await.error_count, 1);
        assert_eq!(vault.list_keys("u").await[0].error_count, 1);
    }

    #[tokio::test]
    async fn smart_detector_moves_past_unusable_providers() {
        let (gateway, _, vault) = gateway(ProviderConfig::defaults());
        // Best-ranked provider has no key; the next one fails; the face-only
        // provider is never considered for plates.
        add_key(&vault, ProviderId::OpenAlpr).await;
        add_key(&vault, ProviderId::GoogleVision).await;
        let first = FakeAdapter::new(ProviderId::PlateRecognizer, false);
        let second = FakeAdapter::new(ProviderId::OpenAlpr, true);
        let faces = FakeAdapter::new(ProviderId::GoogleVision, false);
        let detector = SmartRemoteDetector::new(
            vec![
                first.clone() as Arc<dyn ProviderAdapter>,
                second.clone(),
                faces.clone(),
            ],
            gateway,
        );

        let found = detector.detect(&image(), &DetectionContext::new("u")).await;
        assert!(found.is_empty());
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(faces.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn smart_detector_returns_first_success() {
        let (gateway, _, vault) = gateway(ProviderConfig::defaults());
        add_key(&vault, ProviderId::PlateRecognizer).await;
        add_key(&vault, ProviderId::OpenAlpr).await;
        let first = FakeAdapter::new(ProviderId::PlateRecognizer, false);
        let second = FakeAdapter::new(ProviderId::OpenAlpr, false);
        let detector = SmartRemoteDetector::new(
            vec![second.clone() as Arc<dyn ProviderAdapter>, first.clone()],
            gateway,
        );

        let found = detector.detect(&image(), &DetectionContext::new("u")).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].method, DetectionMethod::PlateRecognizer);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }
}
