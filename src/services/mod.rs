// src/services/mod.rs
pub mod image_processor;
pub mod ledger;
pub mod redaction;
pub mod redis_store;
pub mod selector;
pub mod store;
pub mod vault;

pub use image_processor::ImageProcessor;
pub use ledger::UsageLedger;
pub use redaction::RedactionEngine;
pub use redis_store::RedisStore;
pub use selector::{SelectorPolicy, SmartApiSelector};
pub use store::{LedgerStore, MemoryStore};
pub use vault::ApiKeyVault;
