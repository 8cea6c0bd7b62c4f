//! Mail source adapters. Each one is I/O plus normalization only.

pub mod batch;
pub mod credentials;
pub mod gmail;
pub mod gmail_client;
pub mod imap;
pub mod imap_session;
pub mod mime;

pub use batch::BatchFileProvider;
pub use credentials::{CredentialStore, InMemoryCredentialStore, OAuthCredential};
pub use gmail::GmailAdapter;
pub use imap::ImapAdapter;
