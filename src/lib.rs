// src/lib.rs
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod detection;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod services;

use crate::config::Settings;
use crate::detection::heuristics::Aggressiveness;
use crate::detection::local::{HeuristicFaceDetector, HeuristicPlateDetector};
use crate::detection::model::{LocalModelDetector, ModelLoader, ModelPair, TextReader};
use crate::detection::onnx::{OnnxPlateLocator, OnnxTextReader};
use crate::detection::orchestrator::DetectorRegistry;
use crate::detection::providers::{
    GoogleVisionAdapter, OpenAlprAdapter, PlateRecognizerAdapter, ProviderAdapter,
};
use crate::detection::remote::{RemoteDetector, RemoteGateway, SmartRemoteDetector};
use crate::detection::scan_worker::ScanWorkerHandle;
use crate::detection::DetectionOrchestrator;
use crate::errors::VeilpixError;
use crate::pipeline::RedactionPipeline;
use crate::services::{
    ApiKeyVault, ImageProcessor, LedgerStore, SelectorPolicy, SmartApiSelector, UsageLedger,
};

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(15);
const LOCATOR_MIN_OBJECTNESS: f32 = 0.25;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub ledger: UsageLedger,
    pub vault: Arc<ApiKeyVault>,
    pub selector: Arc<SmartApiSelector>,
    pub pipeline: Arc<RedactionPipeline>,
}

impl AppState {
    /// Wires every service from explicitly constructed clients. The caller
    /// owns `store` and the scan worker behind `scans` and closes them.
    pub fn build(
        settings: Settings,
        store: Arc<dyn LedgerStore>,
        scans: ScanWorkerHandle,
    ) -> Result<Self, VeilpixError> {
        let vault = Arc::new(match &settings.vault_master_key {
            Some(key) => ApiKeyVault::from_base64(key)?,
            None => {
                warn!("VAULT_MASTER_KEY not set, stored provider keys will not survive a restart");
                ApiKeyVault::ephemeral()
            }
        });
        let ledger = UsageLedger::new(store);
        let selector = Arc::new(SmartApiSelector::new(
            settings.provider_configs(),
            SelectorPolicy::default(),
            ledger.clone(),
        ));
        let gateway = RemoteGateway::new(Arc::clone(&selector), ledger.clone(), Arc::clone(&vault));

        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| VeilpixError::Provider(format!("cannot build HTTP client: {}", e)))?;
        let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
            Arc::new(PlateRecognizerAdapter::new(client.clone())),
            Arc::new(OpenAlprAdapter::new(client.clone())),
            Arc::new(GoogleVisionAdapter::new(client)),
        ];

        let mut registry = DetectorRegistry::new()
            .register(Arc::new(HeuristicPlateDetector::new(Aggressiveness::Simple, scans.clone())))
            .register(Arc::new(HeuristicPlateDetector::new(Aggressiveness::Balanced, scans.clone())))
            .register(Arc::new(HeuristicPlateDetector::new(Aggressiveness::Aggressive, scans.clone())))
            .register(Arc::new(HeuristicFaceDetector::new(scans)))
            .register(Arc::new(SmartRemoteDetector::new(adapters.clone(), gateway.clone())));
        for adapter in adapters {
            registry = registry.register(Arc::new(RemoteDetector::new(adapter, gateway.clone())));
        }
        if let Some(loader) = onnx_loader(&settings) {
            registry = registry.register(Arc::new(LocalModelDetector::new(loader, LOCATOR_MIN_OBJECTNESS)));
        }
        info!("Detectors registered: {:?}", registry.methods());

        let pipeline = RedactionPipeline::new(
            ImageProcessor::new(),
            Arc::new(DetectionOrchestrator::new(registry)),
            settings.batch_delay,
        );

        Ok(Self {
            settings: Arc::new(settings),
            ledger,
            vault,
            selector,
            pipeline: Arc::new(pipeline),
        })
    }
}

fn onnx_loader(settings: &Settings) -> Option<ModelLoader> {
    let plate_model = settings.plate_model.clone()?;
    let text_model = settings.text_model.clone();
    let loader: ModelLoader = Arc::new(move || -> anyhow::Result<ModelPair> {
        let locator = OnnxPlateLocator::load(&plate_model, LOCATOR_MIN_OBJECTNESS)?;
        let reader = match &text_model {
            Some(path) => Some(Box::new(OnnxTextReader::load(path)?) as Box<dyn TextReader>),
            None => None,
        };
        Ok(ModelPair {
            locator: Box::new(locator),
            reader,
        })
    });
    Some(loader)
}
