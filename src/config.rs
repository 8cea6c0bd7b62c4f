//! Configuration types, read from the environment.
//!
//! Each provider group is optional. A group whose anchor variable is unset
//! yields `None` and the provider answers with a hint instead of messages.
//! A group that is only partly set, or carries a malformed value, is a
//! `ConfigError`.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Recipient used when a message carries no `To`.
pub const DEFAULT_RECIPIENT: &str = "support@company.com";

pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8787/api/auth/google/callback";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Mailbox-protocol connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    /// TLS on connect. Plain TCP when false.
    pub secure: bool,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Connect, read and write timeout.
    pub timeout: Duration,
}

impl ImapConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 993,
            secure: true,
            username: username.into(),
            password: SecretString::from(password.into()),
            mailbox: "INBOX".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(&env_var)
    }

    pub fn from_lookup(var: &dyn Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let Some(host) = var("IMAP_HOST") else {
            return Ok(None);
        };
        let username = required(var, "IMAP_USER")?;
        let password = required(var, "IMAP_PASS")?;

        let mut config = Self::new(host, username, password);
        if let Some(port) = parsed(var, "IMAP_PORT")? {
            config.port = port;
        }
        if let Some(secure) = var("IMAP_SECURE") {
            config.secure = parse_bool("IMAP_SECURE", &secure)?;
        }
        if let Some(mailbox) = var("IMAP_MAILBOX") {
            config.mailbox = mailbox;
        }
        if let Some(secs) = parsed::<u64>(var, "IMAP_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        Ok(Some(config))
    }
}

/// OAuth client and endpoint settings for the webmail API.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub api_base: String,
    /// Seeds the credential store so a restart does not force re-consent.
    pub refresh_token: Option<SecretString>,
}

impl GmailConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            api_base: GMAIL_API_BASE.to_string(),
            refresh_token: None,
        }
    }

    /// Point every endpoint at one base URL. Used against local fakes.
    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.auth_url = format!("{base}/o/oauth2/v2/auth");
        self.token_url = format!("{base}/token");
        self.api_base = format!("{base}/gmail/v1/users/me");
        self
    }

    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(&env_var)
    }

    pub fn from_lookup(var: &dyn Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let Some(client_id) = var("GOOGLE_CLIENT_ID") else {
            return Ok(None);
        };
        let client_secret = required(var, "GOOGLE_CLIENT_SECRET")?;

        let mut config = Self::new(client_id, client_secret);
        if let Some(uri) = var("GOOGLE_REDIRECT_URI") {
            config.redirect_uri = uri;
        }
        config.refresh_token = var("GOOGLE_REFRESH_TOKEN").map(SecretString::from);
        Ok(Some(config))
    }
}

/// Everything the binary needs to wire up an `Intake`.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub default_recipient: String,
    pub imap: Option<ImapConfig>,
    pub gmail: Option<GmailConfig>,
    pub batch_file: Option<PathBuf>,
}

impl IntakeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_var)
    }

    pub fn from_lookup(var: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            default_recipient: var("INTAKE_DEFAULT_RECIPIENT")
                .unwrap_or_else(|| DEFAULT_RECIPIENT.to_string()),
            imap: ImapConfig::from_lookup(var)?,
            gmail: GmailConfig::from_lookup(var)?,
            batch_file: var("INTAKE_BATCH_FILE").map(PathBuf::from),
        })
    }
}

/// Unset and blank are the same thing.
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(var: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    var(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parsed<T>(var: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}
