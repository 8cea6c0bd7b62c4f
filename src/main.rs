use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use mail_intake::config::IntakeConfig;
use mail_intake::pipeline::types::FetchRequest;
use mail_intake::pipeline::{EnrichmentEngine, Intake};
use mail_intake::providers::{
    BatchFileProvider, CredentialStore, GmailAdapter, ImapAdapter, InMemoryCredentialStore,
    OAuthCredential,
};

const USAGE: &str = "\
Usage:
  mail-intake fetch <imap|gmail|outlook|csv> [--max N] [--since ISO-8601]
  mail-intake auth-url
  mail-intake authorize <code>";

/// Upper bound on one fetch, connection setup included.
const FETCH_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug)]
enum Command {
    Fetch(FetchRequest),
    AuthUrl,
    Authorize(String),
    Help,
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    let mut iter = args.iter();
    match iter.next().map(String::as_str) {
        Some("fetch") => {
            let provider = iter.next().context("fetch needs a provider")?;
            let mut request = FetchRequest::new(provider.as_str());
            while let Some(flag) = iter.next() {
                match flag.as_str() {
                    "--max" => {
                        let value = iter.next().context("--max needs a value")?;
                        let max = value
                            .parse::<i64>()
                            .with_context(|| format!("invalid --max value {value:?}"))?;
                        request = request.with_max(max);
                    }
                    "--since" => {
                        let value = iter.next().context("--since needs a value")?;
                        request = request.with_since(value.as_str());
                    }
                    other => bail!("unknown option {other:?}\n\n{USAGE}"),
                }
            }
            Ok(Command::Fetch(request))
        }
        Some("auth-url") => Ok(Command::AuthUrl),
        Some("authorize") => {
            let code = iter.next().context("authorize needs the code from the consent redirect")?;
            Ok(Command::Authorize(code.clone()))
        }
        Some("help" | "--help" | "-h") | None => Ok(Command::Help),
        Some(other) => bail!("unknown command {other:?}\n\n{USAGE}"),
    }
}

async fn build_intake(config: &IntakeConfig) -> Intake {
    let store: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::new());
    if let Some(seed) = config.gmail.as_ref().and_then(|g| g.refresh_token.clone()) {
        store.save(OAuthCredential::from_refresh_token(seed)).await;
    }

    let recipient = config.default_recipient.as_str();
    Intake::new(EnrichmentEngine::default_rules())
        .with_provider(Arc::new(ImapAdapter::new(config.imap.clone(), recipient)))
        .with_provider(Arc::new(BatchFileProvider::new(config.batch_file.clone(), recipient)))
        .with_gmail(Arc::new(GmailAdapter::new(config.gmail.clone(), store, recipient)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Logs go to stderr; stdout carries only JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    let config = IntakeConfig::from_env().context("Invalid configuration")?;
    let intake = build_intake(&config).await;

    match command {
        Command::Help => eprintln!("{USAGE}"),
        Command::Fetch(request) => {
            let response = intake
                .fetch_with_deadline(&request, FETCH_DEADLINE)
                .await
                .inspect_err(|e| tracing::error!(provider = %request.provider, error = %e, "Fetch failed"))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::AuthUrl => match intake.authorization_url() {
            Some(url) => println!("{url}"),
            None => bail!("Gmail is not configured. Set GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET."),
        },
        Command::Authorize(code) => {
            let credential = intake.complete_authorization(&code).await?;
            match credential.expires_at {
                Some(at) => eprintln!("Authorized. Access token expires at {}", at.to_rfc3339()),
                None => eprintln!("Authorized."),
            }
            if !credential.can_refresh() {
                eprintln!("   No refresh token issued; consent will be needed again once it expires.");
            }
        }
    }
    Ok(())
}
