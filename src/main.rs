mod console;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use riskrelay_backend::agent_client::SerenityClient;
use riskrelay_backend::auth::ApiKeyResolver;
use riskrelay_backend::config::RelayConfig;
use riskrelay_backend::session::RiskSession;
use riskrelay_backend::shutdown::shutdown_pair;
use riskrelay_backend::stream::{StreamClient, StreamMessage};

#[derive(Parser)]
#[command(name = "riskrelay", version, about = "Relay a chat agent and escalate risky turns to a risk evaluation agent")]
struct Cli {
    /// Config file (defaults to riskrelay.toml next to the executable)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// API key for both agents; takes precedence over every other source
    #[arg(long, global = true, env = "RISKRELAY_CLI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Store --api-key in the persisted key file for later runs
    #[arg(long, global = true)]
    persist_key: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive relay: each line is a user message, /new starts over, /quit exits
    Chat,
    /// Run one message over the streaming transport and print the result
    Probe {
        /// Message sent as the single user turn
        #[arg(long)]
        message: String,
        /// Agent to run (defaults to the primary agent)
        #[arg(long)]
        agent: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,riskrelay=debug,riskrelay_backend=debug")),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => RelayConfig::load_from(path)?,
        None => RelayConfig::load(),
    };

    let keys = ApiKeyResolver::from_config(&config).with_explicit(cli.api_key.clone());
    if cli.persist_key {
        let key = cli
            .api_key
            .as_deref()
            .context("--persist-key needs --api-key")?;
        keys.persist(key)?;
    }
    match keys.resolve_with_source() {
        Some((_, source)) => tracing::debug!("Using API key from {:?} source", source),
        None => tracing::warn!("No API key configured; agent calls will fail"),
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    match cli.command {
        Command::Chat => runtime.block_on(run_chat(config, keys)),
        Command::Probe { message, agent } => runtime.block_on(run_probe(config, keys, message, agent)),
    }
}

async fn run_chat(config: RelayConfig, keys: ApiKeyResolver) -> Result<()> {
    let client = SerenityClient::from_config(&config, &keys).context("failed to build agent client")?;
    tracing::info!(
        "Relaying {} via {} (risk agent {})",
        config.primary_agent_code,
        client.base_url(),
        config.risk_agent_code
    );

    let (mut session, events) = RiskSession::new(Arc::new(client), &config);
    let printer = tokio::spawn(console::print_events(events));

    session.start().await?;
    console::print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/new" => {
                if let Err(e) = session.new_chat().await {
                    tracing::warn!("New chat failed: {:#}", e);
                }
            }
            text => {
                tokio::select! {
                    result = session.send(text) => {
                        if let Err(e) = result {
                            tracing::warn!("Turn failed: {:#}", e);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    session.teardown();
    drop(session);
    printer.await.context("event printer panicked")?;
    Ok(())
}

async fn run_probe(
    config: RelayConfig,
    keys: ApiKeyResolver,
    message: String,
    agent: Option<String>,
) -> Result<()> {
    let client = StreamClient::from_config(&config, &keys).context("failed to build stream client")?;
    let agent = agent.unwrap_or_else(|| config.primary_agent_code.clone());

    let (handle, signal) = shutdown_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.trigger();
        }
    });

    let (updates_tx, updates_rx) = flume::unbounded();
    let printer = tokio::spawn(console::print_stream_updates(updates_rx));

    let outcome = client
        .run(&agent, &[StreamMessage::user(message)], Some(&updates_tx), &signal)
        .await;
    drop(updates_tx);
    printer.await.context("stream printer panicked")?;

    let outcome = outcome.with_context(|| format!("streaming run on {} failed", agent))?;
    println!("{}", console::render_stream_outcome(&outcome));
    Ok(())
}
