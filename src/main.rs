// src/main.rs
use actix_web::{App, HttpServer, middleware, web};
use log::{info, warn};
use std::sync::Arc;

use veilpix::AppState;
use veilpix::config::Settings;
use veilpix::detection::scan_worker::ScanWorker;
use veilpix::handlers;
use veilpix::services::{LedgerStore, MemoryStore, RedisStore};

const SCAN_QUEUE_DEPTH: usize = 16;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    info!("Starting Veilpix service...");
    let settings = Settings::from_env()?;

    // Initialize services
    let store: Arc<dyn LedgerStore> = match &settings.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url).await?),
        None => {
            warn!("REDIS_URL not set, usage ledger is in-process only");
            Arc::new(MemoryStore::new())
        }
    };
    let worker = ScanWorker::spawn(SCAN_QUEUE_DEPTH)?;
    let bind = settings.bind.clone();
    let app_state = AppState::build(settings, Arc::clone(&store), worker.handle())?;

    info!("Starting HTTP server on {}", bind);

    let served = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::PayloadConfig::new(32 * 1024 * 1024))
            .app_data(web::JsonConfig::default().limit(48 * 1024 * 1024))
            .wrap(middleware::Logger::default())
            .configure(handlers::configure)
    })
    .bind(&bind)?
    .run()
    .await;

    info!("HTTP server stopped, closing clients");
    worker.close().await;
    store.close().await;
    served?;
    Ok(())
}
