//! Webmail API client: OAuth code exchange and refresh, message list and get.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::GmailConfig;
use crate::error::{AuthError, ProviderError};

const SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Provider-side ceiling on ids per list call.
pub const LIST_PAGE_LIMIT: u32 = 100;

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// A message in `format=full`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMessage {
    pub id: String,
    /// Epoch milliseconds, as a decimal string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<ApiPart>,
}

/// One node of the API's body-part tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<ApiHeader>,
    #[serde(default)]
    pub body: Option<ApiBody>,
    #[serde(default)]
    pub parts: Vec<ApiPart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiBody {
    /// base64url, padding optional.
    #[serde(default)]
    pub data: Option<String>,
}

// ── API seam ────────────────────────────────────────────────────────

/// Remote operations the webmail adapter depends on.
#[async_trait]
pub trait WebmailApi: Send + Sync {
    /// Consent URL, or `None` if it cannot be built.
    fn authorization_url(&self) -> Option<String>;

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, AuthError>;

    /// Fails with `AuthError::InvalidGrant` when the refresh token is dead.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError>;

    async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max: u32,
    ) -> Result<Vec<String>, ProviderError>;

    async fn get_message(&self, access_token: &str, id: &str) -> Result<ApiMessage, ProviderError>;
}

/// reqwest-backed [`WebmailApi`].
pub struct GmailClient {
    config: GmailConfig,
    client: reqwest::Client,
}

impl GmailClient {
    pub fn new(config: GmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, TokenFailure> {
        let resp = self
            .client
            .post(&self.config.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| TokenFailure::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<TokenResponse>()
                .await
                .map_err(|e| TokenFailure::Transport(format!("bad token response: {e}")));
        }

        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<OAuthErrorBody>(&body) {
            Ok(err) => Err(TokenFailure::Rejected {
                error: err.error,
                description: err.error_description.unwrap_or_default(),
            }),
            Err(_) => Err(TokenFailure::Transport(format!("{status}: {body}"))),
        }
    }

    async fn api_get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

/// Token endpoint outcome before it is mapped to an `AuthError`.
enum TokenFailure {
    Transport(String),
    Rejected { error: String, description: String },
}

#[async_trait]
impl WebmailApi for GmailClient {
    fn authorization_url(&self) -> Option<String> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ];
        match reqwest::Url::parse_with_params(&self.config.auth_url, &params) {
            Ok(url) => Some(url.into()),
            Err(e) => {
                warn!(auth_url = %self.config.auth_url, error = %e, "Cannot build authorization URL");
                None
            }
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, AuthError> {
        let secret = self.config.client_secret.expose_secret();
        let params = [
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", secret),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];
        match self.token_request(&params).await {
            Ok(token) => Ok(token),
            Err(TokenFailure::Rejected { error, description }) if error == "invalid_grant" => {
                Err(AuthError::InvalidCode(description))
            }
            Err(TokenFailure::Rejected { error, description }) => {
                Err(AuthError::ExchangeFailed(format!("{error}: {description}")))
            }
            Err(TokenFailure::Transport(reason)) => Err(AuthError::ExchangeFailed(reason)),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let secret = self.config.client_secret.expose_secret();
        let params = [
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", secret),
            ("grant_type", "refresh_token"),
        ];
        debug!("Refreshing webmail access token");
        match self.token_request(&params).await {
            Ok(token) => Ok(token),
            Err(TokenFailure::Rejected { error, .. }) if error == "invalid_grant" => {
                Err(AuthError::InvalidGrant)
            }
            Err(TokenFailure::Rejected { error, description }) => {
                Err(AuthError::RefreshFailed(format!("{error}: {description}")))
            }
            Err(TokenFailure::Transport(reason)) => Err(AuthError::RefreshFailed(reason)),
        }
    }

    async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max: u32,
    ) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/messages", self.config.api_base);
        let limit = max as usize;
        let mut ids = Vec::with_capacity(limit);
        let mut page_token: Option<String> = None;

        while ids.len() < limit {
            let remaining = (limit - ids.len()) as u32;
            let max_results = remaining.min(LIST_PAGE_LIMIT).to_string();
            let mut params = vec![("q", query), ("maxResults", max_results.as_str())];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let list: ListResponse = self.api_get(&url, access_token, &params).await?;

            let page_size = list.messages.len();
            let room = limit - ids.len();
            ids.extend(list.messages.into_iter().map(|m| m.id).take(room));
            debug!(page_size, total = ids.len(), "Listed message page");

            page_token = list.next_page_token;
            if page_token.is_none() || page_size == 0 {
                break;
            }
        }
        Ok(ids)
    }

    async fn get_message(&self, access_token: &str, id: &str) -> Result<ApiMessage, ProviderError> {
        let url = format!("{}/messages/{id}", self.config.api_base);
        self.api_get(&url, access_token, &[("format", "full")]).await
    }
}
