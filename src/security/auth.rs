// ARCHITECTURE: Authentication Service - API Key Validation
//
// DESIGN:
// 1. BEARER KEYS: callers present an opaque secret, the service maps it to a client id
// 2. HASHED STORAGE: only SHA-256 digests of secrets are held in memory
// 3. LIFECYCLE: keys may expire and can be revoked without a restart
//
// KEY SOURCES:
// - Keys configured as `client_id:secret` pairs are registered at startup
// - With nothing configured, one key for client `operator` is generated and
//   logged once at WARN so a fresh install is usable
//
// Authentication only read-locks the key map; usage counters are per-key atomics.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const BOOTSTRAP_CLIENT_ID: &str = "operator";

/// A pre-shared key supplied through configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredKey {
    pub client_id: String,
    pub secret: String,
}

// CONFIGURATION: AuthConfig
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub keys: Vec<ConfiguredKey>,           // Seeded at start
    pub default_key_expiry_days: Option<u32>, // Expiry for generated keys (default: never)
}

// CREDENTIALS: ApiKey - Stored key record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub key_hash: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub is_active: bool,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }
}

// CLASSIFICATION: AuthDenialReason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthDenialReason {
    MissingCredential,
    InvalidCredential,
    ExpiredCredential,
    RevokedCredential,
}

impl AuthDenialReason {
    pub fn code(&self) -> &'static str {
        match self {
            AuthDenialReason::MissingCredential => "missing_credential",
            AuthDenialReason::InvalidCredential => "invalid_credential",
            AuthDenialReason::ExpiredCredential => "expired_credential",
            AuthDenialReason::RevokedCredential => "revoked_credential",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AuthDenialReason::MissingCredential => "API key is required",
            AuthDenialReason::InvalidCredential => "Invalid API key",
            AuthDenialReason::ExpiredCredential => "API key has expired",
            AuthDenialReason::RevokedCredential => "API key has been revoked",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthResult {
    Authenticated { client_id: String, key_id: String },
    Denied { reason: AuthDenialReason },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("API key with ID {0} not found")]
    KeyNotFound(String),

    #[error("an identical API key is already registered")]
    DuplicateKey,

    #[error("client id must not be empty")]
    EmptyClientId,
}

// METRICS: AuthMetrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthMetrics {
    pub successful_auths: u64,
    pub failed_auths: u64,
    pub active_api_keys: usize,
}

// STORAGE: StoredKey - Key record plus lock-free usage tracking
#[derive(Debug)]
struct StoredKey {
    record: ApiKey,
    usage_count: AtomicU64,
    last_used_ms: AtomicI64,  // Unix millis, 0 = never
}

impl StoredKey {
    fn new(record: ApiKey) -> Self {
        Self {
            record,
            usage_count: AtomicU64::new(0),
            last_used_ms: AtomicI64::new(0),
        }
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.usage_count.fetch_add(1, Ordering::Relaxed);
        self.last_used_ms.fetch_max(now.timestamp_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> ApiKey {
        let last_used = match self.last_used_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        };
        ApiKey {
            last_used,
            usage_count: self.usage_count.load(Ordering::Relaxed),
            ..self.record.clone()
        }
    }
}

/// Lowercase hex SHA-256 of a secret.
pub fn hash_key(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

// CORE SYSTEM: AuthService
pub struct AuthService {
    config: AuthConfig,
    api_keys: Arc<RwLock<HashMap<String, StoredKey>>>,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl AuthService {
    pub fn new() -> Self {
        Self::with_config(AuthConfig::default())
    }

    pub fn with_config(config: AuthConfig) -> Self {
        Self {
            config,
            api_keys: Arc::new(RwLock::new(HashMap::new())),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    // LIFECYCLE: Register configured keys, or bootstrap one when there are none.
    // Returns the generated secret when a bootstrap key was created.
    pub async fn start(&self) -> Result<Option<String>, AuthError> {
        for key in &self.config.keys {
            self.register_key(&key.client_id, &key.secret, None).await?;
        }

        let bootstrap = if self.api_keys.read().await.is_empty() {
            let (raw_key, api_key) = self
                .generate_api_key(BOOTSTRAP_CLIENT_ID, self.config.default_key_expiry_days)
                .await?;
            warn!(
                client_id = %api_key.client_id,
                api_key = %raw_key,
                "No API keys configured, generated a bootstrap key. Store it securely, it will not be shown again"
            );
            Some(raw_key)
        } else {
            None
        };

        info!(
            keys = self.api_keys.read().await.len(),
            "Authentication Service started"
        );
        Ok(bootstrap)
    }

    // CORE FUNCTION: Resolve a presented credential to a client id
    pub async fn authenticate(&self, credential: Option<&str>) -> AuthResult {
        let result = self.check(credential).await;
        match &result {
            AuthResult::Authenticated { client_id, key_id } => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                debug!(client_id = %client_id, key_id = %key_id, "Authenticated request");
            }
            AuthResult::Denied { reason } => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(reason = ?reason, "Authentication denied");
            }
        }
        result
    }

    async fn check(&self, credential: Option<&str>) -> AuthResult {
        let secret = match credential.map(str::trim) {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                return AuthResult::Denied {
                    reason: AuthDenialReason::MissingCredential,
                }
            }
        };

        let now = Utc::now();
        let api_keys = self.api_keys.read().await;
        let Some(stored) = api_keys.get(&hash_key(secret)) else {
            return AuthResult::Denied {
                reason: AuthDenialReason::InvalidCredential,
            };
        };

        let key = &stored.record;
        if !key.is_active {
            return AuthResult::Denied {
                reason: AuthDenialReason::RevokedCredential,
            };
        }
        if key.is_expired(now) {
            return AuthResult::Denied {
                reason: AuthDenialReason::ExpiredCredential,
            };
        }

        stored.touch(now);
        AuthResult::Authenticated {
            client_id: key.client_id.clone(),
            key_id: key.id.clone(),
        }
    }

    // KEY MANAGEMENT: Register a caller-chosen secret
    pub async fn register_key(
        &self,
        client_id: &str,
        secret: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey, AuthError> {
        if client_id.trim().is_empty() {
            return Err(AuthError::EmptyClientId);
        }

        let key_hash = hash_key(secret);
        let api_key = ApiKey {
            id: Uuid::new_v4().to_string(),
            key_hash: key_hash.clone(),
            client_id: client_id.trim().to_string(),
            created_at: Utc::now(),
            expires_at,
            last_used: None,
            usage_count: 0,
            is_active: true,
        };

        let mut api_keys = self.api_keys.write().await;
        if api_keys.contains_key(&key_hash) {
            return Err(AuthError::DuplicateKey);
        }
        api_keys.insert(key_hash, StoredKey::new(api_key.clone()));

        info!(key_id = %api_key.id, client_id = %api_key.client_id, "API key registered");
        Ok(api_key)
    }

    // KEY MANAGEMENT: Generate a random `sk-` secret for a client
    pub async fn generate_api_key(
        &self,
        client_id: &str,
        expiry_days: Option<u32>,
    ) -> Result<(String, ApiKey), AuthError> {
        let raw_key = format!("sk-{}", Uuid::new_v4().simple());
        let expires_at = expiry_days.map(|days| Utc::now() + Duration::days(days as i64));
        let api_key = self.register_key(client_id, &raw_key, expires_at).await?;
        Ok((raw_key, api_key))
    }

    pub async fn revoke_api_key(&self, key_id: &str) -> Result<(), AuthError> {
        let mut api_keys = self.api_keys.write().await;
        let key = api_keys
            .values_mut()
            .map(|stored| &mut stored.record)
            .find(|key| key.id == key_id)
            .ok_or_else(|| AuthError::KeyNotFound(key_id.to_string()))?;

        key.is_active = false;
        info!(key_id = %key.id, client_id = %key.client_id, "API key revoked");
        Ok(())
    }

    /// Current record for a key, including usage counters.
    pub async fn get_api_key(&self, key_id: &str) -> Option<ApiKey> {
        self.api_keys
            .read()
            .await
            .values()
            .find(|stored| stored.record.id == key_id)
            .map(StoredKey::snapshot)
    }

    pub async fn get_metrics(&self) -> AuthMetrics {
        let now = Utc::now();
        AuthMetrics {
            successful_auths: self.successes.load(Ordering::Relaxed),
            failed_auths: self.failures.load(Ordering::Relaxed),
            active_api_keys: self
                .api_keys
                .read()
                .await
                .values()
                .filter(|stored| stored.record.is_valid(now))
                .count(),
        }
    }
}

impl Default for AuthService {
    fn default() -> Self {
        Self::new()
    }
}
