//! Webmail-API adapter (OAuth-backed).
//!
//! Holds no token state of its own: the injected [`CredentialStore`] is the
//! only place a credential lives between calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GmailConfig;
use crate::error::{AuthError, MessageParseError, ProviderError};
use crate::pipeline::types::{FetchWindow, MailProvider, NormalizedMessage, ProviderBatch, RawMessage};
use crate::providers::credentials::{CredentialStore, OAuthCredential};
use crate::providers::gmail_client::{ApiMessage, ApiPart, GmailClient, TokenResponse, WebmailApi};
use crate::providers::mime::{BodyPart, MAX_PART_DEPTH, bare_address, extract_text};

const PROVIDER: &str = "gmail";

/// Detail calls in flight at once.
pub const DETAIL_CONCURRENCY: usize = 6;

const NOT_CONFIGURED_HINT: &str = "Set GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET, then authorize.";
const AUTHORIZE_HINT: &str = "Authorize Gmail to proceed.";

const PADDING_INDIFFERENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, PADDING_INDIFFERENT);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, PADDING_INDIFFERENT);

/// Search query: an optional epoch-seconds lower bound ANDed with the inbox scope.
pub fn build_query(since: Option<DateTime<Utc>>) -> String {
    let mut terms = Vec::with_capacity(2);
    if let Some(since) = since {
        terms.push(format!("after:{}", since.timestamp()));
    }
    terms.push("in:inbox".to_string());
    terms.join(" ")
}

/// base64url body data, padded or not. Standard alphabet is accepted too.
pub fn decode_body_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_LENIENT
        .decode(data)
        .or_else(|_| STANDARD_LENIENT.decode(data))
}

// ── Raw message ─────────────────────────────────────────────────────

fn convert_part(part: &ApiPart, depth: usize) -> Result<BodyPart, base64::DecodeError> {
    if depth > MAX_PART_DEPTH {
        return Ok(BodyPart::default());
    }
    let data = part
        .body
        .as_ref()
        .and_then(|b| b.data.as_deref())
        .filter(|d| !d.is_empty())
        .map(decode_body_data)
        .transpose()?;
    let children = part
        .parts
        .iter()
        .map(|p| convert_part(p, depth + 1))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BodyPart {
        mime_type: part.mime_type.clone(),
        data,
        children,
    })
}

fn parse_header_date(raw: &str) -> Option<DateTime<Utc>> {
    // Drop a trailing comment such as "(UTC)".
    let raw = raw.split(" (").next().unwrap_or(raw).trim();
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

impl RawMessage for ApiMessage {
    fn raw_id(&self) -> String {
        self.id.clone()
    }

    fn normalize(self, default_recipient: &str) -> Result<NormalizedMessage, MessageParseError> {
        let payload = self.payload.unwrap_or_default();
        let headers: HashMap<String, String> = payload
            .headers
            .iter()
            .map(|h| (h.name.to_lowercase(), h.value.clone()))
            .collect();
        let header = |name: &str| headers.get(name).map(String::as_str).unwrap_or_default();

        let tree = convert_part(&payload, 0).map_err(|e| MessageParseError::BodyDecode {
            id: self.id.clone(),
            reason: e.to_string(),
        })?;

        let received_at = parse_header_date(header("date"))
            .or_else(|| {
                self.internal_date
                    .as_deref()
                    .and_then(|ms| ms.parse::<i64>().ok())
                    .and_then(DateTime::from_timestamp_millis)
            })
            .unwrap_or_else(Utc::now);

        let to_address = bare_address(header("to"));
        Ok(NormalizedMessage {
            id: self.id.clone(),
            external_message_id: self.id,
            from_address: bare_address(header("from")),
            to_address: if to_address.is_empty() {
                default_recipient.to_string()
            } else {
                to_address
            },
            subject: header("subject").to_string(),
            body_text: extract_text(&tree),
            received_at,
        })
    }
}

// ── Adapter ─────────────────────────────────────────────────────────

pub struct GmailAdapter {
    api: Option<Arc<dyn WebmailApi>>,
    store: Arc<dyn CredentialStore>,
    /// Held from load to save for every credential update.
    credential_lock: Mutex<()>,
    default_recipient: String,
}

impl GmailAdapter {
    /// `None` config leaves the adapter answering with a setup hint.
    pub fn new(
        config: Option<GmailConfig>,
        store: Arc<dyn CredentialStore>,
        default_recipient: impl Into<String>,
    ) -> Self {
        let api = config.map(|c| Arc::new(GmailClient::new(c)) as Arc<dyn WebmailApi>);
        Self {
            api,
            store,
            credential_lock: Mutex::new(()),
            default_recipient: default_recipient.into(),
        }
    }

    pub fn with_api(
        api: Arc<dyn WebmailApi>,
        store: Arc<dyn CredentialStore>,
        default_recipient: impl Into<String>,
    ) -> Self {
        Self {
            api: Some(api),
            store,
            credential_lock: Mutex::new(()),
            default_recipient: default_recipient.into(),
        }
    }

    pub fn authorization_url(&self) -> Option<String> {
        self.api.as_ref().and_then(|api| api.authorization_url())
    }

    /// Exchange a consent code and store the resulting credential.
    ///
    /// A response without a refresh token keeps the one already stored.
    pub async fn complete_authorization(&self, code: &str) -> Result<OAuthCredential, AuthError> {
        let api = self.api.as_ref().ok_or(AuthError::NotConfigured)?;
        let code = code.trim();
        if code.is_empty() {
            return Err(AuthError::InvalidCode("empty authorization code".into()));
        }

        let _guard = self.credential_lock.lock().await;
        let token = api.exchange_code(code).await?;
        let previous = self.store.load().await.and_then(|c| c.refresh_token);
        let credential = credential_from(token, previous);
        self.store.save(credential.clone()).await;
        info!(
            provider = PROVIDER,
            expires_at = ?credential.expires_at,
            has_refresh = credential.can_refresh(),
            "Authorization complete"
        );
        Ok(credential)
    }

    /// A usable access token, refreshing when needed.
    ///
    /// `None` means the caller has to authorize first.
    async fn access_token(&self, api: &dyn WebmailApi) -> Result<Option<SecretString>, ProviderError> {
        let _guard = self.credential_lock.lock().await;
        let Some(credential) = self.store.load().await else {
            return Ok(None);
        };
        if credential.has_usable_access_token(Utc::now()) {
            return Ok(credential.access_token);
        }
        let Some(refresh_token) = credential.refresh_token else {
            return Ok(None);
        };

        match api.refresh(refresh_token.expose_secret()).await {
            Ok(token) => {
                let refreshed = credential_from(token, Some(refresh_token));
                let access = refreshed.access_token.clone();
                self.store.save(refreshed).await;
                debug!(provider = PROVIDER, "Access token refreshed");
                Ok(access)
            }
            Err(AuthError::InvalidGrant) => {
                warn!(provider = PROVIDER, "Refresh token rejected, authorization required");
                let still_stored = self.store.load().await.is_some_and(|c| {
                    c.refresh_token
                        .is_some_and(|t| t.expose_secret() == refresh_token.expose_secret())
                });
                if still_stored {
                    self.store.clear().await;
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn credential_from(token: TokenResponse, fallback_refresh: Option<SecretString>) -> OAuthCredential {
    OAuthCredential {
        access_token: Some(SecretString::from(token.access_token)),
        refresh_token: token
            .refresh_token
            .map(SecretString::from)
            .or(fallback_refresh),
        expires_at: token.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
    }
}

#[async_trait]
impl MailProvider for GmailAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn fetch(&self, window: &FetchWindow) -> Result<ProviderBatch, ProviderError> {
        let Some(api) = self.api.as_deref() else {
            return Ok(ProviderBatch::hint(NOT_CONFIGURED_HINT));
        };
        let Some(token) = self.access_token(api).await? else {
            return Ok(match api.authorization_url() {
                Some(url) => ProviderBatch::authorization_required(url, AUTHORIZE_HINT),
                None => ProviderBatch::hint(AUTHORIZE_HINT),
            });
        };
        let token = token.expose_secret();

        let query = build_query(window.since());
        let ids = api.list_message_ids(token, &query, window.max()).await?;
        debug!(provider = PROVIDER, query = %query, listed = ids.len(), "Listed messages");

        let details: Vec<(String, Result<ApiMessage, ProviderError>)> = futures::stream::iter(ids)
            .map(|id| async move {
                let result = api.get_message(token, &id).await;
                (id, result)
            })
            .buffered(DETAIL_CONCURRENCY)
            .collect()
            .await;

        let mut batch = ProviderBatch::default();
        for (id, detail) in details {
            let message = match detail {
                Ok(message) => message,
                Err(ProviderError::Api { status: 404, .. }) => {
                    warn!(provider = PROVIDER, id = %id, "Message vanished between list and get");
                    batch.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match message.normalize(&self.default_recipient) {
                Ok(normalized) => batch.messages.push(normalized),
                Err(e) => {
                    warn!(provider = PROVIDER, id = %id, error = %e, "Skipping undecodable message");
                    batch.skipped += 1;
                }
            }
        }

        info!(
            provider = PROVIDER,
            count = batch.messages.len(),
            skipped = batch.skipped,
            "Webmail fetch complete"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    use crate::providers::credentials::InMemoryCredentialStore;
    use crate::providers::gmail_client::{ApiBody, ApiHeader};

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(s)
    }

    fn header(name: &str, value: &str) -> ApiHeader {
        ApiHeader {
            name: name.into(),
            value: value.into(),
        }
    }

    fn leaf(mime: &str, text: &str) -> ApiPart {
        ApiPart {
            mime_type: mime.into(),
            body: Some(ApiBody { data: Some(b64(text)) }),
            ..ApiPart::default()
        }
    }

    fn api_message(id: &str, headers: Vec<ApiHeader>, parts: Vec<ApiPart>) -> ApiMessage {
        ApiMessage {
            id: id.into(),
            internal_date: Some("1767225600000".into()),
            payload: Some(ApiPart {
                mime_type: "multipart/alternative".into(),
                headers,
                body: None,
                parts,
            }),
        }
    }

    // ── Query and decoding ──────────────────────────────────────────

    #[test]
    fn query_inbox_only() {
        assert_eq!(build_query(None), "in:inbox");
    }

    #[test]
    fn query_with_since_cutoff() {
        let since = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(build_query(Some(since)), "after:1767225600 in:inbox");
    }

    #[test]
    fn decodes_padded_and_unpadded() {
        assert_eq!(decode_body_data("aGVsbG8").unwrap(), b"hello");
        assert_eq!(decode_body_data("aGVsbG8=").unwrap(), b"hello");
        // '-' and '_' only exist in the URL-safe alphabet.
        assert_eq!(decode_body_data("-_8").unwrap(), vec![0xfb, 0xff]);
        assert!(decode_body_data("!!!").is_err());
    }

    // ── Normalization ───────────────────────────────────────────────

    #[test]
    fn normalizes_headers_case_insensitively() {
        let msg = api_message(
            "abc",
            vec![
                header("FROM", "Jane Doe <jane@example.com>"),
                header("to", "Support <help@company.com>"),
                header("Subject", "Refund"),
                header("Date", "Thu, 01 Jan 2026 09:30:00 +0100 (CET)"),
            ],
            vec![leaf("text/plain", "Please refund order #77")],
        )
        .normalize("support@company.com")
        .unwrap();

        assert_eq!(msg.id, "abc");
        assert_eq!(msg.external_message_id, "abc");
        assert_eq!(msg.from_address, "jane@example.com");
        assert_eq!(msg.to_address, "help@company.com");
        assert_eq!(msg.subject, "Refund");
        assert_eq!(msg.body_text, "Please refund order #77");
        assert_eq!(msg.received_at.to_rfc3339(), "2026-01-01T08:30:00+00:00");
    }

    #[test]
    fn falls_back_to_internal_date_and_default_recipient() {
        let msg = api_message(
            "m1",
            vec![header("From", "plain@example.com")],
            vec![leaf("text/html", "<p>Hi <b>there</b></p>")],
        )
        .normalize("support@company.com")
        .unwrap();

        assert_eq!(msg.from_address, "plain@example.com");
        assert_eq!(msg.to_address, "support@company.com");
        assert_eq!(msg.body_text, "Hi there");
        assert_eq!(msg.received_at.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn missing_payload_yields_empty_record() {
        let msg = ApiMessage {
            id: "bare".into(),
            ..ApiMessage::default()
        }
        .normalize("support@company.com")
        .unwrap();
        assert_eq!(msg.subject, "");
        assert_eq!(msg.body_text, "");
        assert_eq!(msg.from_address, "");
    }

    #[test]
    fn undecodable_body_is_parse_error() {
        let mut part = leaf("text/plain", "x");
        part.body = Some(ApiBody {
            data: Some("%%%".into()),
        });
        let err = api_message("bad", vec![], vec![part])
            .normalize("support@company.com")
            .unwrap_err();
        assert!(matches!(err, MessageParseError::BodyDecode { .. }));
    }

    // ── Adapter over a fake API ─────────────────────────────────────

    #[derive(Default)]
    struct FakeApi {
        messages: Vec<ApiMessage>,
        missing: Vec<String>,
        refresh_result: Option<Result<TokenResponse, ()>>,
        exchange_refresh_token: Option<String>,
        /// Park `refresh` until `release` is notified.
        gate_refresh: bool,
        refresh_entered: Notify,
        release: Notify,
        calls: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn token(access: &str, refresh: Option<&str>) -> TokenResponse {
        TokenResponse {
            access_token: access.into(),
            refresh_token: refresh.map(str::to_string),
            expires_in: Some(3600),
        }
    }

    #[async_trait]
    impl WebmailApi for FakeApi {
        fn authorization_url(&self) -> Option<String> {
            Some("https://auth.example/consent".into())
        }

        async fn exchange_code(&self, code: &str) -> Result<TokenResponse, AuthError> {
            self.calls.lock().unwrap().push(format!("exchange {code}"));
            if code == "bad" {
                return Err(AuthError::InvalidCode("bad".into()));
            }
            Ok(token("fresh-access", self.exchange_refresh_token.as_deref()))
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
            self.calls.lock().unwrap().push(format!("refresh {refresh_token}"));
            if self.gate_refresh {
                self.refresh_entered.notify_one();
                self.release.notified().await;
            }
            match &self.refresh_result {
                Some(Ok(t)) => Ok(t.clone()),
                _ => Err(AuthError::InvalidGrant),
            }
        }

        async fn list_message_ids(
            &self,
            access_token: &str,
            query: &str,
            max: u32,
        ) -> Result<Vec<String>, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("list {access_token} {query} {max}"));
            let mut ids: Vec<String> = self.messages.iter().map(|m| m.id.clone()).collect();
            ids.extend(self.missing.iter().cloned());
            Ok(ids)
        }

        async fn get_message(&self, _access_token: &str, id: &str) -> Result<ApiMessage, ProviderError> {
            self.messages
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| ProviderError::Api {
                    status: 404,
                    message: "Not Found".into(),
                })
        }
    }

    fn authorized_store(expires_in: i64, refresh: Option<&str>) -> Arc<InMemoryCredentialStore> {
        Arc::new(InMemoryCredentialStore::seeded(OAuthCredential {
            access_token: Some(SecretString::from("stored-access".to_string())),
            refresh_token: refresh.map(|r| SecretString::from(r.to_string())),
            expires_at: Some(Utc::now() + Duration::seconds(expires_in)),
        }))
    }

    #[tokio::test]
    async fn unconfigured_returns_setup_hint() {
        let adapter = GmailAdapter::new(None, Arc::new(InMemoryCredentialStore::new()), "support@company.com");
        let batch = adapter.fetch(&FetchWindow::default()).await.unwrap();
        assert_eq!(batch.hint.as_deref(), Some(NOT_CONFIGURED_HINT));
        assert!(batch.auth_url.is_none());
        assert!(adapter.authorization_url().is_none());
        assert!(matches!(
            adapter.complete_authorization("code").await,
            Err(AuthError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn no_credential_requires_authorization() {
        let api = Arc::new(FakeApi::default());
        let adapter = GmailAdapter::with_api(api.clone(), Arc::new(InMemoryCredentialStore::new()), "s@c.com");
        let batch = adapter.fetch(&FetchWindow::default()).await.unwrap();
        assert!(batch.messages.is_empty());
        assert_eq!(batch.auth_url.as_deref(), Some("https://auth.example/consent"));
        assert_eq!(batch.hint.as_deref(), Some(AUTHORIZE_HINT));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn fetches_with_stored_token() {
        let api = Arc::new(FakeApi {
            messages: vec![
                api_message("a", vec![header("Subject", "one")], vec![leaf("text/plain", "1")]),
                api_message("b", vec![header("Subject", "two")], vec![leaf("text/plain", "2")]),
            ],
            missing: vec!["gone".into()],
            ..FakeApi::default()
        });
        let adapter = GmailAdapter::with_api(api.clone(), authorized_store(3600, None), "s@c.com");
        let batch = adapter.fetch(&FetchWindow::new(10, None)).await.unwrap();

        let ids: Vec<&str> = batch.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(batch.skipped, 1);
        assert_eq!(api.calls(), vec!["list stored-access in:inbox 10"]);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_saved() {
        let api = Arc::new(FakeApi {
            refresh_result: Some(Ok(token("new-access", None))),
            ..FakeApi::default()
        });
        let store = authorized_store(-60, Some("keep-me"));
        let adapter = GmailAdapter::with_api(api.clone(), store.clone(), "s@c.com");
        adapter.fetch(&FetchWindow::default()).await.unwrap();

        assert_eq!(api.calls(), vec!["refresh keep-me", "list new-access in:inbox 20"]);
        let saved = store.load().await.unwrap();
        assert_eq!(saved.access_token.unwrap().expose_secret(), "new-access");
        assert_eq!(saved.refresh_token.unwrap().expose_secret(), "keep-me");
    }

    #[tokio::test]
    async fn revoked_refresh_token_requires_authorization() {
        let api = Arc::new(FakeApi::default());
        let store = authorized_store(-60, Some("dead"));
        let adapter = GmailAdapter::with_api(api.clone(), store.clone(), "s@c.com");
        let batch = adapter.fetch(&FetchWindow::default()).await.unwrap();

        assert!(batch.auth_url.is_some());
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn authorization_stores_credential() {
        let api = Arc::new(FakeApi {
            exchange_refresh_token: Some("first-refresh".into()),
            ..FakeApi::default()
        });
        let store = Arc::new(InMemoryCredentialStore::new());
        let adapter = GmailAdapter::with_api(api.clone(), store.clone(), "s@c.com");

        let credential = adapter.complete_authorization(" code-1 ").await.unwrap();
        assert!(credential.can_refresh());
        assert!(credential.expires_at.is_some());
        assert_eq!(api.calls(), vec!["exchange code-1"]);
        assert_eq!(
            store.load().await.unwrap().access_token.unwrap().expose_secret(),
            "fresh-access"
        );
    }

    #[tokio::test]
    async fn reauthorization_keeps_previous_refresh_token() {
        let api = Arc::new(FakeApi::default());
        let store = authorized_store(3600, Some("old-refresh"));
        let adapter = GmailAdapter::with_api(api, store.clone(), "s@c.com");
        adapter.complete_authorization("code-2").await.unwrap();
        let saved = store.load().await.unwrap();
        assert_eq!(saved.refresh_token.unwrap().expose_secret(), "old-refresh");
    }

    #[tokio::test]
    async fn rejected_code_is_auth_error() {
        let adapter = GmailAdapter::with_api(
            Arc::new(FakeApi::default()),
            Arc::new(InMemoryCredentialStore::new()),
            "s@c.com",
        );
        assert!(matches!(
            adapter.complete_authorization("bad").await,
            Err(AuthError::InvalidCode(_))
        ));
        assert!(matches!(
            adapter.complete_authorization("  ").await,
            Err(AuthError::InvalidCode(_))
        ));
    }

    #[tokio::test]
    async fn authorization_during_failed_refresh_survives() {
        let api = Arc::new(FakeApi {
            exchange_refresh_token: Some("fresh-refresh".into()),
            gate_refresh: true,
            ..FakeApi::default()
        });
        let store = authorized_store(-60, Some("dead"));
        let adapter = Arc::new(GmailAdapter::with_api(api.clone(), store.clone(), "s@c.com"));

        let fetch = tokio::spawn({
            let adapter = Arc::clone(&adapter);
            async move { adapter.fetch(&FetchWindow::default()).await }
        });
        api.refresh_entered.notified().await;

        let authorize = tokio::spawn({
            let adapter = Arc::clone(&adapter);
            async move { adapter.complete_authorization("fresh-code").await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        api.release.notify_one();

        assert!(fetch.await.unwrap().unwrap().auth_url.is_some());
        authorize.await.unwrap().unwrap();

        let saved = store.load().await.expect("new credential kept");
        assert_eq!(saved.access_token.unwrap().expose_secret(), "fresh-access");
        assert_eq!(saved.refresh_token.unwrap().expose_secret(), "fresh-refresh");
    }

    #[tokio::test]
    async fn rejected_refresh_keeps_a_credential_replaced_elsewhere() {
        let api = Arc::new(FakeApi {
            gate_refresh: true,
            ..FakeApi::default()
        });
        let store = authorized_store(-60, Some("dead"));
        let adapter = Arc::new(GmailAdapter::with_api(api.clone(), store.clone(), "s@c.com"));

        let fetch = tokio::spawn({
            let adapter = Arc::clone(&adapter);
            async move { adapter.fetch(&FetchWindow::default()).await }
        });
        api.refresh_entered.notified().await;

        // Another process sharing the store re-authorizes meanwhile.
        store
            .save(OAuthCredential::from_refresh_token(SecretString::from("other".to_string())))
            .await;
        api.release.notify_one();
        fetch.await.unwrap().unwrap();

        let saved = store.load().await.expect("replacement kept");
        assert_eq!(saved.refresh_token.unwrap().expose_secret(), "other");
    }
}
