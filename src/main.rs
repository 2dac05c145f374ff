//! SIM relay CLI - relays local approval requests to remote devices.
//!
//! This is the main binary entry point. See the `sim_relay` library for
//! the core functionality.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use sim_relay::config::parse_devices;
use sim_relay::crypto::{self, SharedSecret};
use sim_relay::env::Environment;
use sim_relay::{
    Config, MultiWatcher, Orchestrator, RelayClient, ReplyStore, RequestEndpoint, RequestId,
    SessionContext, SessionSettings, UnixChannel,
};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "sim-relay")]
#[command(version = VERSION)]
#[command(about = "Relays local approval requests to remote devices over an untrusted store")]
struct Cli {
    /// Directory holding config.json
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Base URL of the relay functions
    #[arg(long, global = true)]
    relay_url: Option<String>,
    /// Directory where requesters create their endpoints
    #[arg(long, global = true)]
    sock_dir: Option<PathBuf>,
    /// Comma-separated device tokens
    #[arg(long, global = true)]
    devices: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the socket directory and relay requests until interrupted
    Run,
    /// Print the relay-store tag for a request id
    Tag {
        /// Request id ([A-Z0-9]+)
        id: String,
    },
    /// Decrypt sealed text from stdin
    Open,
    /// Seal a reply and store it under the request's tag
    Reply {
        /// Request id ([A-Z0-9]+)
        id: String,
        /// Reply text (read from stdin if absent)
        message: Option<String>,
    },
    /// Create a request endpoint and wait for its reply
    Request {
        /// Request payload (read from stdin if absent)
        payload: Option<String>,
        /// Seconds to wait for a reply
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
    /// Print the effective configuration
    Config,
}

impl Cli {
    /// Load config and apply command-line overrides on top.
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config_dir {
            Some(dir) => Config::load_from_dir(dir)?,
            None => Config::load()?,
        };
        if let Some(relay_url) = &self.relay_url {
            config.relay_url.clone_from(relay_url);
        }
        if let Some(sock_dir) = &self.sock_dir {
            config.sock_dir.clone_from(sock_dir);
        }
        if let Some(devices) = &self.devices {
            config.devices = parse_devices(devices);
        }
        Ok(config)
    }
}

fn init_logging() -> Result<()> {
    let filter = Environment::current().default_log_filter();
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter));
    builder.format_timestamp_secs();

    // Use SIM_LOG_FILE to keep logs off the terminal
    if let Ok(path) = std::env::var("SIM_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn derive_key() -> Result<crypto::DerivedKey> {
    let secret = SharedSecret::from_env()?;
    Ok(crypto::derive_key(&secret)?)
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read stdin")?;
    Ok(input)
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

/// Runs the relay daemon until interrupted.
async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let key = derive_key()?;
    crypto::self_test(&key).context("Crypto self-test failed, refusing to start")?;

    let relay = Arc::new(RelayClient::new(&config.relay_url)?);
    let ctx = SessionContext {
        key: Arc::new(key),
        channel: Arc::new(UnixChannel::new(&config.sock_dir)),
        dispatcher: Arc::clone(&relay) as Arc<dyn sim_relay::Dispatcher>,
        store: relay,
        devices: config.devices.clone().into(),
        settings: SessionSettings::from(&config),
    };

    let watcher = MultiWatcher::start(&config.sock_dir)?;
    let subscription = watcher.add_with_backlog()?;
    let orchestrator = Orchestrator::new(ctx, config.max_sessions);

    log::info!(
        "sim-relay v{} running: {} device(s), relay {}",
        VERSION,
        config.devices.len(),
        config.relay_url
    );

    tokio::select! {
        stats = orchestrator.run(subscription) => {
            log::warn!("Event stream ended unexpectedly: {stats:?}");
        }
        res = shutdown_signal() => {
            res?;
            log::info!("Shutting down...");
        }
    }

    watcher.shutdown();
    Ok(())
}

/// Requester side: serve a payload on a fresh endpoint and print the reply.
async fn request(config: &Config, payload: Vec<u8>, timeout: Duration) -> Result<()> {
    // A zero-length message reads as a closed peer on the relay side.
    if payload.is_empty() {
        anyhow::bail!("Request payload is empty");
    }
    let id = RequestId::generate();
    let endpoint = RequestEndpoint::bind(&config.sock_dir, id)?;
    eprintln!("Waiting for reply to {}", endpoint.id());

    let reply = tokio::time::timeout(timeout, endpoint.serve(&payload))
        .await
        .with_context(|| format!("No reply within {}s", timeout.as_secs()))??;

    let mut stdout = std::io::stdout();
    stdout.write_all(&reply)?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = cli.config()?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Tag { id } => {
            let id = RequestId::parse(&id)?;
            let tag = crypto::correlation_tag(&derive_key()?, id.as_str())?;
            println!("{tag}");
        }
        Commands::Open => {
            let plaintext = crypto::open(&derive_key()?, &read_stdin()?)?;
            let mut stdout = std::io::stdout();
            stdout.write_all(&plaintext)?;
            stdout.flush()?;
        }
        Commands::Reply { id, message } => {
            let id = RequestId::parse(&id)?;
            let message = match message {
                Some(message) => message,
                None => read_stdin()?,
            };
            let key = derive_key()?;
            let tag = crypto::correlation_tag(&key, id.as_str())?;
            let sealed = crypto::seal(&key, message.as_bytes())?;
            RelayClient::new(&config.relay_url)?
                .store(&tag, &sealed)
                .await?;
            println!("Stored reply for {id} under {tag}");
        }
        Commands::Request { payload, timeout } => {
            let payload = match payload {
                Some(payload) => payload,
                None => read_stdin()?,
            };
            request(&config, payload.into_bytes(), Duration::from_secs(timeout)).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
