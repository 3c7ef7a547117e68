// src/services/store.rs
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::VeilpixError;

/// Atomic primitives the usage ledger is built on. Every method is a single
/// atomic step against the shared store; callers never read-modify-write.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Increments every key by one in one atomic batch. A key's expiry is set
    /// only when its new value is 1.
    async fn incr_with_first_expiry(
        &self,
        keys: &[String],
        ttl: Duration,
    ) -> Result<Vec<u64>, VeilpixError>;

    /// Fixed-window increment: the expiry is set once, when the counter is
    /// created. Returns the new count and the time left in the window.
    async fn incr_fixed_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<(u64, Duration), VeilpixError>;

    /// Returns true when the key did not exist and now holds `value`.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, VeilpixError>;

    /// Deletes the key only when it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, VeilpixError>;

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), VeilpixError>;

    async fn get(&self, key: &str) -> Result<Option<String>, VeilpixError>;

    async fn get_counter(&self, key: &str) -> Result<u64, VeilpixError> {
        match self.get(key).await? {
            Some(raw) => raw
                .parse()
                .map_err(|_| VeilpixError::Store(format!("{key} does not hold a counter"))),
            None => Ok(0),
        }
    }

    async fn close(&self) {}
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store used when no Redis URL is configured, and in tests.
/// One mutex guards the whole map, so each primitive is atomic.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn incr(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Result<u64, VeilpixError> {
        match Self::live(entries, key, now) {
            Some(entry) => {
                let next = entry
                    .value
                    .parse::<u64>()
                    .map_err(|_| VeilpixError::Store(format!("{key} does not hold a counter")))?
                    + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn incr_with_first_expiry(
        &self,
        keys: &[String],
        ttl: Duration,
    ) -> Result<Vec<u64>, VeilpixError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let mut counts = Vec::with_capacity(keys.len());
        for key in keys {
            let count = Self::incr(&mut entries, key, now)?;
            if count == 1 {
                if let Some(entry) = entries.get_mut(key.as_str()) {
                    entry.expires_at = Some(now + ttl);
                }
            }
            counts.push(count);
        }
        Ok(counts)
    }

    async fn incr_fixed_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<(u64, Duration), VeilpixError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let count = Self::incr(&mut entries, key, now)?;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| VeilpixError::Store(format!("{key} vanished during increment")))?;
        if count == 1 {
            entry.expires_at = Some(now + window);
        }
        let remaining = entry
            .expires_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(window);
        Ok((count, remaining))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, VeilpixError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, VeilpixError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), VeilpixError> {
        let now = Instant::now();
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, VeilpixError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key, now).map(|e| e.value.clone()))
    }
}
