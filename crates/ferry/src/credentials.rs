//! Credential resolution for source connections.
//!
//! A [`SecretStore`] answers "get secret by name". The [`CredentialProvider`]
//! maps connection parameters to secret names, resolves them, and caches the
//! resulting [`ConnectionParams`] bundle for a configured TTL. One provider is
//! created per source at startup and shared by the pools that need it.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use snafu::prelude::*;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{CredentialError, MissingSnafu, SecretFileSnafu};

/// Default cache lifetime for resolved credentials.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Opaque "get secret by name" capability.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Look up a secret. `Ok(None)` means the store has no such secret.
    async fn get_secret(&self, name: &str) -> Result<Option<String>, CredentialError>;
}

/// Secrets read from environment variables, optionally prefixed.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, CredentialError> {
        let key = format!("{}{}", self.prefix, name);
        match std::env::var(&key) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(CredentialError::Store {
                name: key,
                message: "value is not valid UTF-8".to_string(),
            }),
        }
    }
}

/// Secrets stored one per file in a directory (Docker/Kubernetes secret mounts).
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, CredentialError> {
        let path = self.dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(SecretFileSnafu { name }),
        }
    }
}

/// In-memory secrets.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.secrets.get(name).cloned())
    }
}

/// Resolved connection parameters, keyed by parameter name.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    values: IndexMap<String, String>,
}

impl ConnectionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.keys().map(|k| (k, "***")))
            .finish()
    }
}

struct CachedParams {
    params: ConnectionParams,
    fetched_at: Instant,
}

/// Resolves and caches connection parameters from a [`SecretStore`].
pub struct CredentialProvider {
    store: Arc<dyn SecretStore>,
    /// Parameter name to secret name; absence is fatal.
    required: IndexMap<String, String>,
    /// Parameter name to secret name; absence omits the parameter.
    optional: IndexMap<String, String>,
    ttl: Duration,
    cache: RwLock<Option<CachedParams>>,
}

impl CredentialProvider {
    pub fn new(store: Arc<dyn SecretStore>, ttl: Duration) -> Self {
        Self {
            store,
            required: IndexMap::new(),
            optional: IndexMap::new(),
            ttl,
            cache: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn require(mut self, param: impl Into<String>, secret: impl Into<String>) -> Self {
        self.required.insert(param.into(), secret.into());
        self
    }

    #[must_use]
    pub fn optional(mut self, param: impl Into<String>, secret: impl Into<String>) -> Self {
        self.optional.insert(param.into(), secret.into());
        self
    }

    /// Fetch a single secret, failing when it is absent or empty.
    pub async fn get_credential(&self, name: &str) -> Result<String, CredentialError> {
        match self.store.get_secret(name).await? {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => MissingSnafu { name }.fail(),
        }
    }

    /// Resolve every configured parameter, serving from cache while it is fresh.
    pub async fn connection_params(&self) -> Result<ConnectionParams, CredentialError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.ttl
            {
                return Ok(cached.params.clone());
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < self.ttl
        {
            return Ok(cached.params.clone());
        }

        let params = self.resolve().await?;
        *cache = Some(CachedParams {
            params: params.clone(),
            fetched_at: Instant::now(),
        });
        Ok(params)
    }

    /// Drop the cached bundle and resolve again.
    pub async fn refresh(&self) -> Result<ConnectionParams, CredentialError> {
        self.clear().await;
        self.connection_params().await
    }

    pub async fn clear(&self) {
        *self.cache.write().await = None;
    }

    async fn resolve(&self) -> Result<ConnectionParams, CredentialError> {
        let mut params = ConnectionParams::new();

        for (param, secret) in &self.required {
            let value = self.get_credential(secret).await?;
            params.insert(param.clone(), value);
        }

        for (param, secret) in &self.optional {
            match self.store.get_secret(secret).await? {
                Some(value) if !value.trim().is_empty() => params.insert(param.clone(), value),
                _ => info!(param = %param, secret = %secret, "Optional credential not set, using default"),
            }
        }

        debug!(params = params.len(), "Resolved connection parameters");
        Ok(params)
    }
}
