//! Blocking IMAP4rev1 session over TCP or TLS.
//!
//! Speaks only what intake needs: LOGIN, EXAMINE, SEARCH SINCE,
//! FETCH (UID INTERNALDATE BODY.PEEK[]) and LOGOUT. Run it inside
//! `spawn_blocking`; the protocol is not multiplexed, so one session
//! issues one command at a time.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::ImapConfig;
use crate::error::ProviderError;

const PROVIDER: &str = "imap";

/// Largest `{N}` literal accepted from the server.
pub const MAX_LITERAL_BYTES: usize = 50 * 1024 * 1024;

static FETCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\* (\d+) FETCH ").expect("fetch pattern compiles"));
static UID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bUID (\d+)").expect("uid pattern compiles"));
static INTERNALDATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bINTERNALDATE "([^"]+)""#).expect("internaldate pattern compiles")
});
static EXISTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\* (\d+) EXISTS").expect("exists pattern compiles"));

/// Anything the session can talk over.
pub trait ImapStream: Read + Write + Send {}
impl<T: Read + Write + Send> ImapStream for T {}

/// One untagged or tagged response, with any literals it carried.
#[derive(Debug, Clone, Default)]
pub struct ResponseLine {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

/// A raw message as returned by FETCH.
#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub seq: u32,
    pub uid: Option<u32>,
    pub internal_date: Option<DateTime<Utc>>,
    pub source: Vec<u8>,
}

pub struct ImapSession<S: Read + Write> {
    reader: BufReader<S>,
    next_tag: u32,
    /// Second handle on the socket, used to abort a blocked read.
    socket: Option<TcpStream>,
}

impl ImapSession<Box<dyn ImapStream>> {
    /// Connect, read the greeting, and log in.
    pub fn connect(config: &ImapConfig) -> Result<Self, ProviderError> {
        let connect_err = |reason: String| ProviderError::Connect {
            provider: PROVIDER.into(),
            reason,
        };

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(format!("{} did not resolve: {e}", config.host)))?
            .next()
            .ok_or_else(|| connect_err(format!("{} did not resolve", config.host)))?;
        let tcp = TcpStream::connect_timeout(&addr, config.timeout)
            .map_err(|e| connect_err(format!("{addr}: {e}")))?;
        tcp.set_read_timeout(Some(config.timeout))?;
        tcp.set_write_timeout(Some(config.timeout))?;
        let socket = tcp.try_clone()?;

        let stream: Box<dyn ImapStream> = if config.secure {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map_err(|e| connect_err(format!("TLS setup failed: {e}")))?
            .with_root_certificates(root_store)
            .with_no_client_auth();
            let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
                .map_err(|e| connect_err(format!("Invalid server name: {e}")))?;
            let conn = rustls::ClientConnection::new(Arc::new(tls_config), server_name)
                .map_err(|e| connect_err(format!("TLS handshake failed: {e}")))?;
            Box::new(rustls::StreamOwned::new(conn, tcp))
        } else {
            Box::new(tcp)
        };

        let mut session = Self::new(stream);
        session.socket = Some(socket);
        session.read_greeting()?;
        session.login(&config.username, config.password.expose_secret())?;
        Ok(session)
    }
}

impl<S: Read + Write> ImapSession<S> {
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
            next_tag: 1,
            socket: None,
        }
    }

    /// A handle whose `shutdown` unblocks any read in progress.
    pub fn interrupt_handle(&self) -> Option<TcpStream> {
        self.socket.as_ref().and_then(|s| s.try_clone().ok())
    }

    pub fn read_greeting(&mut self) -> Result<(), ProviderError> {
        let greeting = self.read_response_line()?;
        if greeting.text.starts_with("* OK") || greeting.text.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(protocol(format!("unexpected greeting: {}", greeting.text)))
        }
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<(), ProviderError> {
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        self.command_redacted(&cmd, "LOGIN ***")
            .map(|_| ())
            .map_err(|e| ProviderError::Connect {
                provider: PROVIDER.into(),
                reason: format!("login failed: {e}"),
            })
    }

    /// Open `mailbox` read-only. Returns its message count.
    pub fn examine(&mut self, mailbox: &str) -> Result<u32, ProviderError> {
        let lines = self.command(&format!("EXAMINE {}", quote(mailbox)))?;
        Ok(lines
            .iter()
            .find_map(|l| EXISTS_RE.captures(&l.text))
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0))
    }

    /// Sequence numbers of messages with an internal date on or after `since`.
    pub fn search_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, ProviderError> {
        let lines = self.command(&format!("SEARCH SINCE {}", since.format("%d-%b-%Y")))?;
        Ok(lines
            .iter()
            .filter_map(|l| l.text.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .filter_map(|n| n.parse().ok())
            .collect())
    }

    /// Full sources for a sequence set such as `10:12`.
    pub fn fetch_sources(&mut self, range: &str) -> Result<Vec<FetchedSource>, ProviderError> {
        let lines = self.command(&format!("FETCH {range} (UID INTERNALDATE BODY.PEEK[])"))?;
        Ok(lines.into_iter().filter_map(parse_fetch).collect())
    }

    pub fn logout(&mut self) -> Result<(), ProviderError> {
        self.command("LOGOUT").map(|_| ())
    }

    fn command(&mut self, cmd: &str) -> Result<Vec<ResponseLine>, ProviderError> {
        self.command_redacted(cmd, cmd)
    }

    /// Send a tagged command and collect responses up to its completion.
    fn command_redacted(&mut self, cmd: &str, shown: &str) -> Result<Vec<ResponseLine>, ProviderError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        debug!(tag = %tag, command = %shown, "IMAP command");

        let stream = self.reader.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let prefix = format!("{tag} ");
        let mut lines = Vec::new();
        loop {
            let line = self.read_response_line()?;
            if let Some(status) = line.text.strip_prefix(&prefix) {
                if status.starts_with("OK") {
                    return Ok(lines);
                }
                return Err(protocol(format!("{shown}: {status}")));
            }
            lines.push(line);
        }
    }

    /// Read one logical response line, pulling in `{N}` literals.
    fn read_response_line(&mut self) -> Result<ResponseLine, ProviderError> {
        let mut response = ResponseLine::default();
        loop {
            let mut buf = Vec::new();
            if self.reader.read_until(b'\n', &mut buf)? == 0 {
                return Err(protocol("connection closed".into()));
            }
            let chunk = String::from_utf8_lossy(&buf);
            let chunk = chunk.trim_end_matches(['\r', '\n']);
            response.text.push_str(chunk);

            match literal_len(chunk) {
                Some(len) if len > MAX_LITERAL_BYTES => {
                    return Err(protocol(format!(
                        "literal of {len} bytes exceeds the {MAX_LITERAL_BYTES} byte limit"
                    )));
                }
                Some(len) => {
                    let mut literal = vec![0_u8; len];
                    self.reader.read_exact(&mut literal)?;
                    response.literals.push(literal);
                }
                None => return Ok(response),
            }
        }
    }
}

/// Length announced by a trailing `{N}` marker.
fn literal_len(chunk: &str) -> Option<usize> {
    let open = chunk.strip_suffix('}')?.rfind('{')?;
    chunk[open + 1..chunk.len() - 1].parse().ok()
}

fn parse_fetch(line: ResponseLine) -> Option<FetchedSource> {
    let seq = FETCH_RE.captures(&line.text)?[1].parse().ok()?;
    let source = line.literals.into_iter().next()?;
    let uid = UID_RE
        .captures(&line.text)
        .and_then(|c| c[1].parse().ok());
    let internal_date = INTERNALDATE_RE
        .captures(&line.text)
        .and_then(|c| parse_internal_date(&c[1]));
    Some(FetchedSource {
        seq,
        uid,
        internal_date,
        source,
    })
}

/// `17-Jul-1996 02:44:25 -0700`, day possibly space-padded.
pub fn parse_internal_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn protocol(reason: String) -> ProviderError {
    ProviderError::Protocol {
        provider: PROVIDER.into(),
        reason,
    }
}
