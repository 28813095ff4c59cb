use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nostr::{EventBuilder, Filter, Kind, PublicKey};
use nostr_net::{config, fetch, metrics, publish, AdapterContext, AuthManager, Pool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "nostr_net",
    version = "0.1.0",
    about = "Talks to Nostr relays through a pooled, auth-aware connection layer"
)]
struct Args {
    /// Path to config directory
    #[arg(short, long, default_value = "config")]
    config_dir: String,

    /// Relay to talk to, can be repeated. Overrides the configured relays
    #[arg(short, long = "relay")]
    relays: Vec<String>,

    /// Override the configured secret key (hex or nsec)
    #[arg(short, long)]
    secret_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch stored events matching a filter and print them as JSON
    Req {
        #[arg(short, long)]
        kinds: Vec<u16>,
        #[arg(short, long)]
        authors: Vec<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Publish a text note and print each relay's answer
    Publish { content: String },
    /// Authenticate against every relay and print the outcome
    Auth,
}

fn setup_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nostr_net=debug"));

    fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::SystemTime)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

fn build_filter(kinds: Vec<u16>, authors: Vec<String>, limit: usize) -> Result<Filter> {
    let mut filter = Filter::new().limit(limit);
    if !kinds.is_empty() {
        filter = filter.kinds(kinds.into_iter().map(Kind::from));
    }
    if !authors.is_empty() {
        let authors = authors
            .iter()
            .map(|author| PublicKey::parse(author))
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid author public key")?;
        filter = filter.authors(authors);
    }
    Ok(filter)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let args = Args::parse();
    let config =
        config::Config::new(&args.config_dir).context("Failed to load configuration")?;
    let mut settings = config.get_settings().context("Failed to get net settings")?;

    if !args.relays.is_empty() {
        settings.relays = args.relays;
    }

    if let Some(secret_key) = args.secret_key {
        settings.secret_key = Some(secret_key);
    }

    if settings.relays.is_empty() {
        bail!("No relays configured, pass --relay or set net.relays");
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("TLS crypto provider already installed");
    }
    metrics::describe_metrics();

    let signer = settings.signer().context("Invalid secret key")?;
    let mut policies = settings.policies();
    if let Some(auth_policy) = settings.auth_policy()? {
        debug!("Answering auth challenges eagerly");
        policies.push(auth_policy);
    }

    let pool = Arc::new(Pool::with_transport(
        Arc::new(settings.transport()),
        policies,
    ));
    let context = AdapterContext::new(pool.clone());

    info!("Using relays: {}", settings.relays.join(", "));

    match args.command {
        Command::Req {
            kinds,
            authors,
            limit,
        } => {
            let filter = build_filter(kinds, authors, limit)?;
            let mut options = settings.request_options();
            options.timeout = options.timeout.or(Some(DEFAULT_FETCH_TIMEOUT));

            let events = fetch(filter, &settings.relays, &context, options).await;
            info!("Fetched {} events", events.len());
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::Publish { content } => {
            let keys = settings
                .keys()?
                .context("A secret key is required to publish")?;
            let event = EventBuilder::text_note(content)
                .sign_with_keys(&keys)
                .context("Failed to sign note")?;
            info!("Publishing event {}", event.id);

            let statuses = publish(
                event,
                &settings.relays,
                &context,
                settings.publish_options(),
            )
            .await;
            for (relay, status) in statuses {
                println!("{relay}\t{status}");
            }
        }
        Command::Auth => {
            let Some(signer) = signer else {
                bail!("A secret key is required to authenticate");
            };
            for relay in &settings.relays {
                let manager = AuthManager::new(pool.get(relay), signer.clone(), false);
                let status = manager.attempt(settings.auth_timeout).await;
                let details = manager.socket().auth().details().unwrap_or_default();
                println!("{relay}\t{status}\t{details}");
            }
        }
    }

    pool.clear();

    Ok(())
}
