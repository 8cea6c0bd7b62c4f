//! Shared types for the intake pipeline.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MessageParseError, ProviderError};

/// Default number of messages per fetch.
pub const DEFAULT_MAX: u32 = 20;

/// Hard ceiling on messages per fetch.
pub const MAX_FETCH: u32 = 200;

// ── Normalized message ──────────────────────────────────────────────

/// Provider-agnostic record produced by every adapter.
///
/// Adapters convert their native payloads into this struct; the
/// enrichment engine consumes it by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    /// Provider-local identifier (IMAP UID, API message id, row number).
    pub id: String,
    /// Message-ID header or provider id. Not guaranteed globally unique.
    pub external_message_id: String,
    /// Bare sender address.
    pub from_address: String,
    /// Bare recipient address, or the configured default recipient.
    pub to_address: String,
    /// Subject line (may be empty).
    pub subject: String,
    /// Plain-text body, never raw markup.
    pub body_text: String,
    /// When the message arrived. Falls back to "now" when unparsable.
    pub received_at: DateTime<Utc>,
}

/// Capability shared by every raw provider payload.
pub trait RawMessage {
    /// Provider-local id, used in skip diagnostics.
    fn raw_id(&self) -> String;

    /// Convert into the normalized shape.
    fn normalize(self, default_recipient: &str) -> Result<NormalizedMessage, MessageParseError>;
}

// ── Enrichment output ───────────────────────────────────────────────

/// Urgency tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    Medium,
    Low,
}

impl Priority {
    /// Sort rank: urgent=3 > medium=2 > low=1.
    pub fn rank(self) -> u8 {
        match self {
            Self::Urgent => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    /// Score floor for this tier before boosts.
    pub fn base_score(self) -> f64 {
        match self {
            Self::Urgent => 4.0,
            Self::Medium => 2.0,
            Self::Low => 1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// Review workflow state. Intake only ever produces `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Drafted,
    Sent,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Phone,
    Email,
    OrderId,
    Issue,
}

/// A value pulled out of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Sequential per message, starting at 1.
    pub id: u32,
    pub entity_type: EntityType,
    pub value: String,
}

/// A normalized message plus the derived review signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedMessage {
    #[serde(flatten)]
    pub message: NormalizedMessage,
    pub priority: Priority,
    pub sentiment: Sentiment,
    pub priority_score: f64,
    pub is_filtered: bool,
    pub status: MessageStatus,
    pub entities: Vec<Entity>,
}

impl EnrichedMessage {
    /// Default record shape every message starts from before enrichment.
    pub fn pending(message: NormalizedMessage) -> Self {
        Self {
            message,
            priority: Priority::Low,
            sentiment: Sentiment::Neutral,
            priority_score: 1.0,
            is_filtered: false,
            status: MessageStatus::Pending,
            entities: Vec::new(),
        }
    }
}

// ── Fetch window ────────────────────────────────────────────────────

/// Bounds for one retrieval call. Constructed per call, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    max: u32,
    since: Option<DateTime<Utc>>,
}

impl FetchWindow {
    /// `max` of 0 means "use the default"; anything above 200 is clamped.
    pub fn new(max: u32, since: Option<DateTime<Utc>>) -> Self {
        let max = if max == 0 { DEFAULT_MAX } else { max.min(MAX_FETCH) };
        Self { max, since }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }
}

impl Default for FetchWindow {
    fn default() -> Self {
        Self::new(DEFAULT_MAX, None)
    }
}

/// A caller's raw request, as it arrives from an outer shell.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchRequest {
    pub provider: String,
    #[serde(default)]
    pub max: Option<i64>,
    #[serde(default)]
    pub since: Option<String>,
}

impl FetchRequest {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            max: None,
            since: None,
        }
    }

    pub fn with_max(mut self, max: i64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    /// Resolve into a window. An unparsable `since` is dropped with a warning.
    pub fn window(&self) -> FetchWindow {
        let max = match self.max {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(MAX_FETCH),
            _ => DEFAULT_MAX,
        };
        let since = self.since.as_deref().and_then(|raw| {
            let parsed = parse_since(raw);
            if parsed.is_none() {
                tracing::warn!(since = %raw, "Ignoring unparsable since timestamp");
            }
            parsed
        });
        FetchWindow::new(max, since)
    }
}

/// Parse an ISO-8601 lower bound. A bare date means midnight UTC.
pub fn parse_since(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

// ── Provider contract ───────────────────────────────────────────────

/// What one adapter returns for one fetch.
#[derive(Debug, Clone, Default)]
pub struct ProviderBatch {
    pub messages: Vec<NormalizedMessage>,
    /// Human-readable explanation, e.g. which settings are missing.
    pub hint: Option<String>,
    /// Set when the caller must authorize before messages can be fetched.
    pub auth_url: Option<String>,
    /// Messages dropped because they could not be parsed.
    pub skipped: usize,
}

impl ProviderBatch {
    pub fn hint(hint: impl Into<String>) -> Self {
        Self {
            hint: Some(hint.into()),
            ..Self::default()
        }
    }

    pub fn authorization_required(auth_url: String, hint: impl Into<String>) -> Self {
        Self {
            hint: Some(hint.into()),
            auth_url: Some(auth_url),
            ..Self::default()
        }
    }
}

/// A mail source adapter: pure I/O plus normalization.
///
/// Enrichment, dedup, and ordering live in the aggregator.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Provider id, e.g. "imap".
    fn name(&self) -> &str;

    /// Whether the aggregator should drop duplicate records from this source.
    fn deduplicates(&self) -> bool {
        false
    }

    async fn fetch(&self, window: &FetchWindow) -> Result<ProviderBatch, ProviderError>;
}

// ── Response ────────────────────────────────────────────────────────

/// The enriched, sorted result handed back to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub provider: String,
    pub messages: Vec<EnrichedMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    pub skipped: usize,
    pub max: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}
