use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use iam_mcp_core::Sensitive;
use tokio::sync::Mutex;
use tracing::debug;

use crate::CredentialsError;
use crate::profile::ProfileFileProvider;

/// Cached credentials are refreshed this long before they expire.
const REFRESH_WINDOW_SECS: i64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: Sensitive<String>,
    pub session_token: Option<Sensitive<String>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: Sensitive(secret_access_key.into()),
            session_token: session_token.map(Sensitive),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    pub(crate) fn validate(self) -> Result<Self, CredentialsError> {
        if self.access_key_id.trim().is_empty() {
            return Err(CredentialsError::Invalid("empty access key id".to_string()));
        }
        if self.secret_access_key.expose().trim().is_empty() {
            return Err(CredentialsError::Invalid("empty secret access key".to_string()));
        }
        Ok(self)
    }
}

/// Source of signing credentials.
///
/// Implementations must be safe to call concurrently from several in-flight requests.
#[async_trait]
pub trait ProvideCredentials: Send + Sync {
    async fn provide_credentials(&self) -> Result<Credentials, CredentialsError>;
}

#[async_trait]
impl<P: ProvideCredentials + ?Sized> ProvideCredentials for Arc<P> {
    async fn provide_credentials(&self) -> Result<Credentials, CredentialsError> {
        (**self).provide_credentials().await
    }
}

#[derive(Debug, Clone)]
pub struct StaticProvider {
    credentials: Credentials,
}

impl StaticProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl ProvideCredentials for StaticProvider {
    async fn provide_credentials(&self) -> Result<Credentials, CredentialsError> {
        self.credentials.clone().validate()
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`.
#[derive(Clone)]
pub struct EnvironmentProvider {
    lookup: EnvLookup,
}

impl EnvironmentProvider {
    pub fn new() -> Self {
        Self {
            lookup: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            lookup: Arc::new(move |name| vars.get(name).cloned()),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }
}

impl Default for EnvironmentProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvideCredentials for EnvironmentProvider {
    async fn provide_credentials(&self) -> Result<Credentials, CredentialsError> {
        let Some(access_key_id) = self.var("AWS_ACCESS_KEY_ID") else {
            return Err(CredentialsError::NotFound(
                "AWS_ACCESS_KEY_ID not set".to_string(),
            ));
        };
        let Some(secret) = self.var("AWS_SECRET_ACCESS_KEY") else {
            return Err(CredentialsError::Invalid(
                "AWS_ACCESS_KEY_ID set without AWS_SECRET_ACCESS_KEY".to_string(),
            ));
        };
        let token = self.var("AWS_SESSION_TOKEN");
        Credentials::new(access_key_id, secret, token).validate()
    }
}

/// Tries each provider in order.
///
/// `NotFound` moves on to the next provider; any other error ends the chain.
#[derive(Clone, Default)]
pub struct ChainProvider {
    providers: Vec<Arc<dyn ProvideCredentials>>,
}

impl ChainProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl ProvideCredentials + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }
}

#[async_trait]
impl ProvideCredentials for ChainProvider {
    async fn provide_credentials(&self) -> Result<Credentials, CredentialsError> {
        let mut misses = Vec::new();
        for p in &self.providers {
            match p.provide_credentials().await {
                Ok(c) => return Ok(c),
                Err(CredentialsError::NotFound(why)) => {
                    debug!(reason = %why, "credential provider had nothing, trying next");
                    misses.push(why);
                }
                Err(e) => return Err(e),
            }
        }
        if misses.is_empty() {
            return Err(CredentialsError::NotFound(
                "no credential providers configured".to_string(),
            ));
        }
        Err(CredentialsError::NotFound(misses.join("; ")))
    }
}

/// Caches the inner provider's credentials until shortly before they expire.
pub struct CachingProvider {
    inner: Arc<dyn ProvideCredentials>,
    cached: Mutex<Option<Credentials>>,
    refresh_window: Duration,
}

impl CachingProvider {
    pub fn new(inner: impl ProvideCredentials + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            cached: Mutex::new(None),
            refresh_window: Duration::seconds(REFRESH_WINDOW_SECS),
        }
    }

    fn still_fresh(&self, c: &Credentials, now: DateTime<Utc>) -> bool {
        match c.expires_at {
            Some(t) => t - self.refresh_window > now,
            None => true,
        }
    }
}

#[async_trait]
impl ProvideCredentials for CachingProvider {
    async fn provide_credentials(&self) -> Result<Credentials, CredentialsError> {
        // Held across the refresh so concurrent callers share one fetch.
        let mut guard = self.cached.lock().await;
        let now = Utc::now();
        if let Some(c) = guard.as_ref()
            && self.still_fresh(c, now)
        {
            return Ok(c.clone());
        }

        let fresh = self.inner.provide_credentials().await?;
        if fresh.is_expired_at(now) {
            *guard = None;
            return Err(CredentialsError::Expired);
        }
        debug!(
            access_key_id = %fresh.access_key_id,
            expires_at = ?fresh.expires_at,
            "resolved signing credentials"
        );
        *guard = Some(fresh.clone());
        Ok(fresh)
    }
}

/// Environment first, then the shared credentials file, cached.
pub fn default_provider() -> CachingProvider {
    CachingProvider::new(
        ChainProvider::new()
            .with(EnvironmentProvider::new())
            .with(ProfileFileProvider::new()),
    )
}
