//! Mailbox-protocol adapter.
//!
//! One connection per fetch: resolve the window to sequence numbers,
//! compact them into ranges, fetch each range in turn, normalize every
//! source, and log out whatever happened in between.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mail_parser::MessageParser;
use tracing::{debug, info, warn};

use crate::config::ImapConfig;
use crate::error::{MessageParseError, ProviderError};
use crate::pipeline::types::{FetchWindow, MailProvider, NormalizedMessage, ProviderBatch, RawMessage};
use crate::providers::imap_session::{FetchedSource, ImapSession};
use crate::providers::mime::{extract_text, part_tree};

const PROVIDER: &str = "imap";

/// Collapse sorted sequence numbers into `start:end` and singleton tokens.
///
/// `[10, 11, 12, 15, 16, 20]` becomes `["10:12", "15:16", "20"]`.
pub fn compact_ranges(seqs: &[u32]) -> Vec<String> {
    let mut ranges = Vec::new();
    let mut iter = seqs.iter().copied();
    let Some(first) = iter.next() else {
        return ranges;
    };

    let (mut start, mut end) = (first, first);
    for n in iter {
        if n == end + 1 {
            end = n;
        } else {
            ranges.push(range_token(start, end));
            (start, end) = (n, n);
        }
    }
    ranges.push(range_token(start, end));
    ranges
}

fn range_token(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}

// ── Session seam ────────────────────────────────────────────────────

/// The mailbox operations the adapter needs. Blocking.
pub trait MailboxSession {
    /// Open a mailbox read-only and return its message count.
    fn examine(&mut self, mailbox: &str) -> Result<u32, ProviderError>;
    fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, ProviderError>;
    fn fetch_sources(&mut self, range: &str) -> Result<Vec<FetchedSource>, ProviderError>;
    fn logout(&mut self) -> Result<(), ProviderError>;

    /// Socket handle to shut down when the fetch is abandoned.
    fn interrupt_handle(&self) -> Option<TcpStream> {
        None
    }
}

impl<S: std::io::Read + std::io::Write> MailboxSession for ImapSession<S> {
    fn examine(&mut self, mailbox: &str) -> Result<u32, ProviderError> {
        ImapSession::examine(self, mailbox)
    }

    fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, ProviderError> {
        ImapSession::search_since(self, since)
    }

    fn fetch_sources(&mut self, range: &str) -> Result<Vec<FetchedSource>, ProviderError> {
        ImapSession::fetch_sources(self, range)
    }

    fn logout(&mut self) -> Result<(), ProviderError> {
        ImapSession::logout(self)
    }

    fn interrupt_handle(&self) -> Option<TcpStream> {
        ImapSession::interrupt_handle(self)
    }
}

/// Opens authenticated sessions.
pub trait MailboxConnector: Send + Sync {
    fn connect(&self, config: &ImapConfig) -> Result<Box<dyn MailboxSession>, ProviderError>;
}

/// Connects over the network with [`ImapSession`].
pub struct NetworkConnector;

impl MailboxConnector for NetworkConnector {
    fn connect(&self, config: &ImapConfig) -> Result<Box<dyn MailboxSession>, ProviderError> {
        Ok(Box::new(ImapSession::connect(config)?))
    }
}

// ── Raw message ─────────────────────────────────────────────────────

/// One fetched source awaiting normalization.
#[derive(Debug, Clone)]
pub struct RawMailboxMessage {
    pub seq: u32,
    pub uid: Option<u32>,
    pub internal_date: Option<DateTime<Utc>>,
    pub source: Vec<u8>,
}

impl From<FetchedSource> for RawMailboxMessage {
    fn from(f: FetchedSource) -> Self {
        Self {
            seq: f.seq,
            uid: f.uid,
            internal_date: f.internal_date,
            source: f.source,
        }
    }
}

impl RawMessage for RawMailboxMessage {
    fn raw_id(&self) -> String {
        match self.uid {
            Some(uid) => uid.to_string(),
            None => format!("seq-{}", self.seq),
        }
    }

    fn normalize(self, default_recipient: &str) -> Result<NormalizedMessage, MessageParseError> {
        let id = self.raw_id();
        if self.source.is_empty() {
            return Err(MessageParseError::MissingSource { id });
        }
        let parsed = MessageParser::default()
            .parse(&self.source)
            .ok_or_else(|| MessageParseError::Unparseable { id: id.clone() })?;

        let received_at = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .or(self.internal_date)
            .unwrap_or_else(Utc::now);

        Ok(NormalizedMessage {
            external_message_id: parsed
                .message_id()
                .map(str::to_string)
                .unwrap_or_else(|| format!("imap-{id}")),
            from_address: first_address(parsed.from()).unwrap_or_default(),
            to_address: first_address(parsed.to())
                .unwrap_or_else(|| default_recipient.to_string()),
            subject: parsed.subject().unwrap_or_default().to_string(),
            body_text: extract_text(&part_tree(&parsed)),
            received_at,
            id,
        })
    }
}

fn first_address(addr: Option<&mail_parser::Address<'_>>) -> Option<String> {
    addr.and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(str::to_string)
}

// ── Adapter ─────────────────────────────────────────────────────────

pub struct ImapAdapter {
    config: Option<ImapConfig>,
    connector: Arc<dyn MailboxConnector>,
    default_recipient: String,
}

impl ImapAdapter {
    pub fn new(config: Option<ImapConfig>, default_recipient: impl Into<String>) -> Self {
        Self {
            config,
            connector: Arc::new(NetworkConnector),
            default_recipient: default_recipient.into(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn MailboxConnector>) -> Self {
        self.connector = connector;
        self
    }
}

/// Cancel signal shared between an async fetch and its blocking worker.
///
/// Cancelling raises the flag and shuts down the armed socket, so a read
/// already blocked in the worker returns at once.
#[derive(Debug, Default)]
pub struct Cancellation {
    flag: AtomicBool,
    socket: Mutex<Option<TcpStream>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        if let Ok(slot) = self.socket.lock()
            && let Some(socket) = slot.as_ref()
        {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    /// Register the socket to shut down. Shuts it at once if already cancelled.
    fn arm(&self, socket: TcpStream) {
        if let Ok(mut slot) = self.socket.lock() {
            if self.is_cancelled() {
                let _ = socket.shutdown(Shutdown::Both);
            }
            *slot = Some(socket);
        }
    }
}

/// Cancels when the owning future is dropped.
struct CancelOnDrop(Arc<Cancellation>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[async_trait]
impl MailProvider for ImapAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn fetch(&self, window: &FetchWindow) -> Result<ProviderBatch, ProviderError> {
        let Some(config) = self.config.clone() else {
            return Ok(ProviderBatch::hint(
                "Set IMAP_HOST, IMAP_USER, IMAP_PASS (and optionally IMAP_PORT, IMAP_SECURE) to enable IMAP.",
            ));
        };

        let cancel = Arc::new(Cancellation::new());
        let _guard = CancelOnDrop(Arc::clone(&cancel));
        let connector = Arc::clone(&self.connector);
        let recipient = self.default_recipient.clone();
        let window = *window;

        let batch = tokio::task::spawn_blocking(move || {
            fetch_blocking(connector.as_ref(), &config, &window, &recipient, &cancel)
        })
        .await
        .map_err(|e| ProviderError::Protocol {
            provider: PROVIDER.into(),
            reason: format!("mailbox worker failed: {e}"),
        })??;

        info!(
            provider = PROVIDER,
            count = batch.messages.len(),
            skipped = batch.skipped,
            "Mailbox fetch complete"
        );
        Ok(batch)
    }
}

/// Connect, collect, and always attempt a logout.
///
/// Once cancelled, any failure is reported as `Cancelled`.
pub fn fetch_blocking(
    connector: &dyn MailboxConnector,
    config: &ImapConfig,
    window: &FetchWindow,
    default_recipient: &str,
    cancel: &Cancellation,
) -> Result<ProviderBatch, ProviderError> {
    let mut session = connector.connect(config)?;
    if let Some(socket) = session.interrupt_handle() {
        cancel.arm(socket);
    }
    let result = collect(session.as_mut(), config, window, default_recipient, cancel);
    if let Err(e) = session.logout() {
        if cancel.is_cancelled() {
            debug!(provider = PROVIDER, error = %e, "Logout after cancellation failed");
        } else {
            warn!(provider = PROVIDER, error = %e, "Logout failed");
        }
    }
    match result {
        Err(e) if cancel.is_cancelled() => {
            debug!(provider = PROVIDER, error = %e, "Fetch abandoned");
            Err(ProviderError::Cancelled {
                provider: PROVIDER.into(),
            })
        }
        other => other,
    }
}

/// Sequence numbers for the window, ascending, at most `max` of them.
fn resolve_window(
    session: &mut dyn MailboxSession,
    count: u32,
    window: &FetchWindow,
) -> Result<Vec<u32>, ProviderError> {
    let max = window.max();
    let mut seqs = match window.since() {
        Some(since) => session.search_since(since.date_naive())?,
        None if count == 0 => Vec::new(),
        None => (count.saturating_sub(max) + 1..=count).collect(),
    };
    seqs.sort_unstable();
    seqs.dedup();
    let excess = seqs.len().saturating_sub(max as usize);
    seqs.drain(..excess);
    Ok(seqs)
}

fn collect(
    session: &mut dyn MailboxSession,
    config: &ImapConfig,
    window: &FetchWindow,
    default_recipient: &str,
    cancel: &Cancellation,
) -> Result<ProviderBatch, ProviderError> {
    let count = session.examine(&config.mailbox)?;
    let seqs = resolve_window(session, count, window)?;
    let ranges = compact_ranges(&seqs);
    debug!(provider = PROVIDER, count, selected = seqs.len(), ?ranges, "Resolved fetch window");

    let cancelled = || ProviderError::Cancelled {
        provider: PROVIDER.into(),
    };

    let mut batch = ProviderBatch::default();
    for range in &ranges {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        for fetched in session.fetch_sources(range)? {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            let raw = RawMailboxMessage::from(fetched);
            let seq = raw.seq;
            match raw.normalize(default_recipient) {
                Ok(message) => batch.messages.push(message),
                Err(e) => {
                    warn!(provider = PROVIDER, seq, error = %e, "Skipping unparseable message");
                    batch.skipped += 1;
                }
            }
        }
    }
    Ok(batch)
}
