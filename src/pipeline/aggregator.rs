//! Aggregator: dispatches a request to the matching provider, enriches the
//! normalized records, deduplicates batch-file input, and sorts the result.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AuthError, ProviderError};
use crate::pipeline::rules::EnrichmentEngine;
use crate::pipeline::types::{
    EnrichedMessage, FetchRequest, FetchResponse, FetchWindow, MailProvider, ProviderBatch,
};
use crate::providers::credentials::OAuthCredential;
use crate::providers::gmail::GmailAdapter;

/// Stable descending sort: priority rank, then score, then most recent first.
pub fn sort_messages(messages: &mut [EnrichedMessage]) {
    messages.sort_by(compare_for_review);
}

fn compare_for_review(a: &EnrichedMessage, b: &EnrichedMessage) -> Ordering {
    b.priority
        .rank()
        .cmp(&a.priority.rank())
        .then_with(|| b.priority_score.total_cmp(&a.priority_score))
        .then_with(|| b.message.received_at.cmp(&a.message.received_at))
}

/// Drop records whose lower-cased `(from, subject, body)` was already seen.
/// First occurrence wins.
pub fn dedup_messages(messages: Vec<EnrichedMessage>) -> Vec<EnrichedMessage> {
    let mut seen = HashSet::new();
    messages
        .into_iter()
        .filter(|m| {
            let key = (
                m.message.from_address.to_lowercase(),
                m.message.subject.to_lowercase(),
                m.message.body_text.to_lowercase(),
            );
            seen.insert(key)
        })
        .collect()
}

/// The core entry point an outer shell calls into.
pub struct Intake {
    providers: Vec<Arc<dyn MailProvider>>,
    gmail: Option<Arc<GmailAdapter>>,
    engine: EnrichmentEngine,
}

impl Intake {
    pub fn new(engine: EnrichmentEngine) -> Self {
        Self {
            providers: Vec::new(),
            gmail: None,
            engine,
        }
    }

    /// Register a provider under its `name()`.
    pub fn with_provider(mut self, provider: Arc<dyn MailProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Register the webmail adapter, which also backs the authorization calls.
    pub fn with_gmail(mut self, adapter: Arc<GmailAdapter>) -> Self {
        self.providers.push(Arc::clone(&adapter) as Arc<dyn MailProvider>);
        self.gmail = Some(adapter);
        self
    }

    fn provider(&self, id: &str) -> Option<&Arc<dyn MailProvider>> {
        let id = match id.to_lowercase().as_str() {
            "batch" => "csv".to_string(),
            other => other.to_string(),
        };
        self.providers.iter().find(|p| p.name() == id)
    }

    /// Fetch, enrich, and sort messages from one provider.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ProviderError> {
        let window = request.window();
        let provider_id = request.provider.to_lowercase();
        let request_id = Uuid::new_v4();

        let Some(provider) = self.provider(&provider_id) else {
            let hint = if provider_id == "outlook" {
                "Outlook adapter not configured yet."
            } else {
                "Unknown provider"
            };
            return Ok(self.respond(provider_id, &window, ProviderBatch::hint(hint)));
        };

        info!(
            request_id = %request_id,
            provider = %provider.name(),
            max = window.max(),
            since = ?window.since(),
            "Fetching messages"
        );

        let batch = provider.fetch(&window).await?;
        let mut response = self.respond(provider_id, &window, batch);
        if provider.deduplicates() {
            let before = response.messages.len();
            response.messages = dedup_messages(response.messages);
            let dropped = before - response.messages.len();
            if dropped > 0 {
                info!(request_id = %request_id, dropped, "Dropped duplicate messages");
            }
        }
        sort_messages(&mut response.messages);

        info!(
            request_id = %request_id,
            count = response.messages.len(),
            skipped = response.skipped,
            "Fetch complete"
        );
        Ok(response)
    }

    /// Like `fetch`, but gives up after `deadline`.
    ///
    /// The in-flight provider future is dropped on expiry, which aborts
    /// pending requests and signals mailbox sessions to log out.
    pub async fn fetch_with_deadline(
        &self,
        request: &FetchRequest,
        deadline: Duration,
    ) -> Result<FetchResponse, ProviderError> {
        match tokio::time::timeout(deadline, self.fetch(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(provider = %request.provider, ?deadline, "Fetch deadline exceeded");
                Err(ProviderError::Timeout {
                    provider: request.provider.to_lowercase(),
                    after: deadline,
                })
            }
        }
    }

    /// Authorization URL for the webmail provider, or `None` when unconfigured.
    pub fn authorization_url(&self) -> Option<String> {
        self.gmail.as_ref().and_then(|g| g.authorization_url())
    }

    /// Exchange an authorization code and store the resulting credential.
    pub async fn complete_authorization(&self, code: &str) -> Result<OAuthCredential, AuthError> {
        let gmail = self.gmail.as_ref().ok_or(AuthError::NotConfigured)?;
        gmail.complete_authorization(code).await
    }

    fn respond(&self, provider: String, window: &FetchWindow, batch: ProviderBatch) -> FetchResponse {
        let messages = batch
            .messages
            .into_iter()
            .map(|m| self.engine.enrich(m))
            .collect();
        FetchResponse {
            provider,
            messages,
            hint: batch.hint,
            auth_url: batch.auth_url,
            skipped: batch.skipped,
            max: window.max(),
            since: window.since(),
        }
    }
}
