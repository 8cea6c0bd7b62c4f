//! OAuth credential storage for the webmail adapter.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use tokio::sync::Mutex;

/// Access tokens this close to expiry are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

/// The most recently obtained token pair.
#[derive(Debug, Clone)]
pub struct OAuthCredential {
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthCredential {
    /// A credential holding only a refresh token, e.g. seeded from config.
    pub fn from_refresh_token(token: SecretString) -> Self {
        Self {
            access_token: None,
            refresh_token: Some(token),
            expires_at: None,
        }
    }

    /// Access token present and not about to expire.
    pub fn has_usable_access_token(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_some()
            && self
                .expires_at
                .is_none_or(|at| at - Duration::seconds(EXPIRY_SKEW_SECS) > now)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

/// Where the adapter keeps its credential between calls.
///
/// Implementations must be safe under concurrent `save`s; the last write wins.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Option<OAuthCredential>;
    async fn save(&self, credential: OAuthCredential);
    async fn clear(&self);
}

/// Process-local store. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    inner: Mutex<Option<OAuthCredential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(credential: OAuthCredential) -> Self {
        Self {
            inner: Mutex::new(Some(credential)),
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self) -> Option<OAuthCredential> {
        self.inner.lock().await.clone()
    }

    async fn save(&self, credential: OAuthCredential) {
        *self.inner.lock().await = Some(credential);
    }

    async fn clear(&self) {
        *self.inner.lock().await = None;
    }
}
