//! Batch-file provider: a CSV export with `sender,subject,body,sent_date`.
//!
//! The whole file is one batch, so `max` and `since` do not apply. Rows
//! missing a sender, subject or date are dropped before ids are assigned.

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{MessageParseError, ProviderError};
use crate::pipeline::types::{FetchWindow, MailProvider, NormalizedMessage, ProviderBatch, RawMessage};

const PROVIDER: &str = "csv";

static DATE_THEN_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2} ").expect("date pattern compiles"));
static HAS_ZONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[zZ]|[+-]\d{2}:?\d{2}$").expect("zone pattern compiles"));

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CsvRow {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub sent_date: String,
}

impl CsvRow {
    fn is_complete(&self) -> bool {
        !self.sender.trim().is_empty()
            && !self.subject.trim().is_empty()
            && !self.sent_date.trim().is_empty()
    }
}

/// A cleaned row and its 1-based position among cleaned rows.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub number: usize,
    pub row: CsvRow,
}

impl RawMessage for BatchRow {
    fn raw_id(&self) -> String {
        self.number.to_string()
    }

    fn normalize(self, default_recipient: &str) -> Result<NormalizedMessage, MessageParseError> {
        let received_at = parse_sent_date(&self.row.sent_date).unwrap_or_else(|| {
            debug!(row = self.number, sent_date = %self.row.sent_date, "Unparsable sent_date, using now");
            Utc::now()
        });
        Ok(NormalizedMessage {
            id: self.number.to_string(),
            external_message_id: format!("msg-{:03}", self.number),
            from_address: self.row.sender,
            to_address: default_recipient.to_string(),
            subject: self.row.subject,
            body_text: self.row.body,
            received_at,
        })
    }
}

/// Lenient timestamp for `sent_date`.
///
/// `2026-01-05 14:30` is read as `2026-01-05T14:30` and a missing zone
/// means UTC. Falls back to RFC 2822 and to a bare date.
pub fn parse_sent_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut iso = raw.to_string();
    if !iso.contains('T') && DATE_THEN_SPACE.is_match(&iso) {
        iso = iso.replacen(' ', "T", 1);
    }
    let zoned = HAS_ZONE.is_match(&iso);
    if !zoned {
        iso.push('Z');
    }

    DateTime::parse_from_rfc3339(&iso)
        .or_else(|_| DateTime::parse_from_str(&iso, "%Y-%m-%dT%H:%M:%S%z"))
        .or_else(|_| DateTime::parse_from_str(&iso, "%Y-%m-%dT%H:%M%z"))
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            let naive = iso.trim_end_matches('Z');
            (!zoned)
                .then(|| NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M").ok())
                .flatten()
                .map(|n| n.and_utc())
        })
        .or_else(|| {
            DateTime::parse_from_rfc2822(raw)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        })
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|n| n.and_utc())
        })
}

/// Parse a whole CSV export into normalized records.
pub fn parse_batch(data: &[u8], default_recipient: &str) -> Result<ProviderBatch, ProviderError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(data);

    let mut batch = ProviderBatch::default();
    let mut rows = Vec::new();
    let mut dropped = 0_usize;
    for (line, record) in reader.deserialize::<CsvRow>().enumerate() {
        match record {
            Ok(row) if row.is_complete() => rows.push(row),
            Ok(_) => dropped += 1,
            Err(e) => {
                warn!(provider = PROVIDER, record = line + 1, error = %e, "Skipping unreadable row");
                batch.skipped += 1;
            }
        }
    }
    if dropped > 0 {
        debug!(provider = PROVIDER, dropped, "Dropped incomplete rows");
    }

    for (index, row) in rows.into_iter().enumerate() {
        let raw = BatchRow {
            number: index + 1,
            row,
        };
        match raw.normalize(default_recipient) {
            Ok(message) => batch.messages.push(message),
            Err(e) => {
                warn!(provider = PROVIDER, error = %e, "Skipping row");
                batch.skipped += 1;
            }
        }
    }
    Ok(batch)
}

pub struct BatchFileProvider {
    path: Option<PathBuf>,
    default_recipient: String,
}

impl BatchFileProvider {
    pub fn new(path: Option<PathBuf>, default_recipient: impl Into<String>) -> Self {
        Self {
            path,
            default_recipient: default_recipient.into(),
        }
    }
}

#[async_trait]
impl MailProvider for BatchFileProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn deduplicates(&self) -> bool {
        true
    }

    async fn fetch(&self, _window: &FetchWindow) -> Result<ProviderBatch, ProviderError> {
        let Some(path) = &self.path else {
            return Ok(ProviderBatch::hint(
                "Set INTAKE_BATCH_FILE to a CSV export with sender,subject,body,sent_date columns.",
            ));
        };

        let data = tokio::fs::read(path).await.map_err(|e| ProviderError::BatchFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let batch = parse_batch(&data, &self.default_recipient)?;
        info!(
            provider = PROVIDER,
            path = %path.display(),
            count = batch.messages.len(),
            skipped = batch.skipped,
            "Batch file loaded"
        );
        Ok(batch)
    }
}
