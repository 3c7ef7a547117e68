// src/services/vault.rs
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use log::{debug, warn};
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::VeilpixError;
use crate::models::{ApiKeyRecord, ApiKeySummary, ProviderId};

const NONCE_LEN: usize = 12;

/// Decrypted provider credential. Not serializable and never printed; it
/// lives for the duration of one remote call.
pub struct ProviderSecret(String);

impl ProviderSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProviderSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderSecret(***)")
    }
}

#[derive(Debug)]
pub struct ResolvedKey {
    pub key_id: Uuid,
    pub secret: ProviderSecret,
}

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub user_id: String,
    pub provider_id: ProviderId,
    pub key_name: String,
    pub plaintext: String,
    pub priority: u8,
}

/// Encrypted-at-rest storage of user-supplied provider keys (AES-256-GCM,
/// random nonce per key, `base64(nonce || ciphertext)` at rest).
pub struct ApiKeyVault {
    cipher: Aes256Gcm,
    records: RwLock<HashMap<Uuid, ApiKeyRecord>>,
}

impl ApiKeyVault {
    pub fn new(master_key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(master_key.into()),
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_base64(master_key: &str) -> Result<Self, VeilpixError> {
        let bytes = general_purpose::STANDARD
            .decode(master_key.trim())
            .map_err(|e| VeilpixError::Vault(format!("master key is not base64: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| VeilpixError::Vault("master key must be 32 bytes".to_string()))?;
        Ok(Self::new(&key))
    }

    /// Vault with a random master key; keys stored in it do not survive a restart.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(&key)
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, VeilpixError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| VeilpixError::Vault("encryption failed".to_string()))?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(sealed))
    }

    fn decrypt(&self, sealed: &str) -> Result<ProviderSecret, VeilpixError> {
        let raw = general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| VeilpixError::Vault(format!("corrupt key material: {}", e)))?;
        if raw.len() <= NONCE_LEN {
            return Err(VeilpixError::Vault("corrupt key material".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VeilpixError::Vault("decryption failed".to_string()))?;
        String::from_utf8(plaintext)
            .map(ProviderSecret)
            .map_err(|_| VeilpixError::Vault("key is not valid UTF-8".to_string()))
    }

    pub async fn add_key(&self, new_key: NewApiKey) -> Result<ApiKeySummary, VeilpixError> {
        if !(1..=10).contains(&new_key.priority) {
            return Err(VeilpixError::Validation(format!(
                "priority must be within 1..=10, got {}",
                new_key.priority
            )));
        }
        if new_key.plaintext.trim().is_empty() {
            return Err(VeilpixError::Validation("API key is empty".to_string()));
        }

        let mut records = self.records.write().await;
        let duplicate = records.values().any(|r| {
            r.user_id == new_key.user_id
                && r.provider_id == new_key.provider_id
                && r.key_name == new_key.key_name
        });
        if duplicate {
            return Err(VeilpixError::Validation(format!(
                "key '{}' already exists for {}",
                new_key.key_name, new_key.provider_id
            )));
        }

        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            user_id: new_key.user_id,
            provider_id: new_key.provider_id,
            key_name: new_key.key_name,
            encrypted_key: self.encrypt(&new_key.plaintext)?,
            key_hash: blake3::hash(new_key.plaintext.as_bytes()).to_hex().to_string(),
            priority: new_key.priority,
            is_active: true,
            last_used_at: None,
            success_count: 0,
            error_count: 0,
            created_at: Utc::now(),
        };
        let summary = ApiKeySummary::from(&record);
        records.insert(record.id, record);
        Ok(summary)
    }

    pub async fn list_keys(&self, user_id: &str) -> Vec<ApiKeySummary> {
        let records = self.records.read().await;
        let mut keys: Vec<ApiKeySummary> = records
            .values()
            .filter(|r| r.user_id == user_id)
            .map(ApiKeySummary::from)
            .collect();
        keys.sort_by(|a, b| {
            (a.provider_id.as_str(), a.priority, &a.key_name)
                .cmp(&(b.provider_id.as_str(), b.priority, &b.key_name))
        });
        keys
    }

    /// Picks the user's active key for `provider` with the lowest priority,
    /// tie-broken by fewest errors, and decrypts it.
    pub async fn resolve_key(
        &self,
        user_id: &str,
        provider: ProviderId,
    ) -> Result<Option<ResolvedKey>, VeilpixError> {
        let records = self.records.read().await;
        let best = records
            .values()
            .filter(|r| r.user_id == user_id && r.provider_id == provider && r.is_active)
            .min_by_key(|r| (r.priority, r.error_count, r.created_at));
        match best {
            Some(record) => {
                debug!("Resolved key {} for {} on {}", record.id, user_id, provider);
                Ok(Some(ResolvedKey {
                    key_id: record.id,
                    secret: self.decrypt(&record.encrypted_key)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn record_outcome(&self, key_id: Uuid, success: bool) {
        let mut records = self.records.write().await;
        match records.get_mut(&key_id) {
            Some(record) => {
                record.last_used_at = Some(Utc::now());
                if success {
                    record.success_count += 1;
                } else {
                    record.error_count += 1;
                }
            }
            None => warn!("Outcome recorded for unknown key {}", key_id),
        }
    }

    pub async fn set_active(&self, key_id: Uuid, active: bool) -> Result<(), VeilpixError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&key_id)
            .ok_or_else(|| VeilpixError::NotFound(format!("api key {}", key_id)))?;
        record.is_active = active;
        Ok(())
    }

    pub async fn record(&self, key_id: Uuid) -> Option<ApiKeyRecord> {
        self.records.read().await.get(&key_id).cloned()
    }
}
