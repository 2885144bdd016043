//! # meshact CLI
//!
//! Runs relay nodes and makes one-off calls from the shell.
//!
//! ```bash
//! # Listen for HTTP calls on 10201 and send store calls to a stream peer
//! meshact relay -l 10201 -c '{"type":"tcp","port":10101,"pin":"role:store"}'
//!
//! # Make one call (prints raw JSON)
//! meshact call 'role:store,cmd:get,key:a' -c 10201
//!
//! # Ask a peer who it is
//! meshact ping -c '{"type":"tcp","port":10101}'
//! ```
//!
//! Transport options take a JSON transport configuration; a bare number is
//! an HTTP port on 127.0.0.1.

use anyhow::{Context, Result};
use argh::FromArgs;
use meshact_client::MeshClient;
use meshact_common::transport::Transports;
use meshact_common::{
    new_tx, Args, Call, Envelope, Message, Meta, Pattern, TransportConfig, DEFAULT_TIMEOUT_MS,
};
use meshact_server::{LoopGuardConfig, Node, DEFAULT_MAX_HOPS, PING_PATTERN};
use std::time::Duration;

#[derive(FromArgs)]
/// meshact - pattern-matched calls between nodes
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Relay(RelayArgs),
    Call(CallArgs),
    Ping(PingArgs),
}

/// Arguments for running a relay node.
///
/// A relay has no actions of its own besides ping: every call it receives
/// is forwarded to the client destination its pattern routes to.
#[derive(FromArgs)]
#[argh(subcommand, name = "relay")]
/// run a node that forwards calls between transports
struct RelayArgs {
    /// node tag used in message ids
    #[argh(option, short = 't')]
    tag: Option<String>,

    /// listener configuration, repeatable
    #[argh(option, short = 'l', long = "listen")]
    listen: Vec<String>,

    /// client destination configuration, repeatable
    #[argh(option, short = 'c', long = "client")]
    clients: Vec<String>,

    /// default call timeout in milliseconds
    #[argh(option, long = "timeout", default = "DEFAULT_TIMEOUT_MS")]
    timeout_ms: u64,

    /// hops a call may take before it is treated as a loop
    #[argh(option, long = "max-hops", default = "DEFAULT_MAX_HOPS")]
    max_hops: usize,

    /// deliver calls this node originated itself
    #[argh(switch, long = "no-own-message-check")]
    no_own_message_check: bool,

    /// deliver calls that already passed through this node
    #[argh(switch, long = "no-loop-check")]
    no_loop_check: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// make a single call and print the result as JSON
struct CallArgs {
    /// the message, textual (`a:1,b:{c:2}`) or JSON
    #[argh(positional)]
    message: String,

    /// client destination configuration, repeatable
    #[argh(option, short = 'c', long = "client")]
    clients: Vec<String>,

    /// call timeout in milliseconds
    #[argh(option, long = "timeout", default = "DEFAULT_TIMEOUT_MS")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "ping")]
/// ask a peer for its identity
struct PingArgs {
    /// destination configuration
    #[argh(option, short = 'c', long = "client")]
    client: String,

    /// timeout in milliseconds
    #[argh(option, long = "timeout", default = "5000")]
    timeout_ms: u64,
}

/// Parses a transport option: a JSON object or a bare HTTP port.
fn transport_config(text: &str) -> Result<TransportConfig> {
    let value: serde_json::Value = serde_json::from_str(text)
        .with_context(|| format!("transport configuration is not JSON: {}", text))?;
    Ok(TransportConfig::from_json(&value)?)
}

/// Parses a call message, JSON objects as-is, anything else as text.
fn message(text: &str) -> Result<Message> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return Ok(Message::from_value(value)?);
        }
    }
    Ok(Message::parse(text)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call prints raw JSON for piping, keep it free of logs
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Relay(args) => run_relay(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Ping(args) => run_ping(args).await,
    }
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    if args.listen.is_empty() {
        anyhow::bail!("a relay needs at least one --listen");
    }

    let mut builder = Node::builder()
        .timeout(Duration::from_millis(args.timeout_ms))
        .loop_guard(LoopGuardConfig {
            check_own_message: !args.no_own_message_check,
            check_message_loop: !args.no_loop_check,
            max_hops: args.max_hops,
        });
    if let Some(tag) = args.tag {
        builder = builder.tag(tag);
    }
    let node = builder.build()?;

    for text in &args.clients {
        node.client(transport_config(text)?).await?;
    }
    for text in &args.listen {
        let config = transport_config(text)?;
        let addr = node
            .listen(config.clone())
            .await
            .with_context(|| format!("cannot listen on {}", config.address()))?;
        if let Some(addr) = addr {
            tracing::info!("Relay {} listening on {} ({})", node.identity(), addr, config.kind);
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    node.close().await?;
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    if args.clients.is_empty() {
        anyhow::bail!("call needs at least one --client");
    }
    let node = Node::builder()
        .timeout(Duration::from_millis(args.timeout_ms))
        .build()?;
    for text in &args.clients {
        node.client(transport_config(text)?).await?;
    }

    let outcome = node.act(message(&args.message)?).await;
    node.close().await?;
    println!("{}", serde_json::to_string(&outcome?)?);
    Ok(())
}

async fn run_ping(args: PingArgs) -> Result<()> {
    let config = transport_config(&args.client)?;
    let timeout = Duration::from_millis(args.timeout_ms);
    // a node would answer the ping itself, so talk to the peer directly
    let client = MeshClient::new(Transports::default(), timeout);
    client.add_destination(config).await?;

    let meta = Meta::new(format!("{}/ping", meshact_common::random_id(10)), new_tx());
    let call = Call::new(Pattern::parse(PING_PATTERN)?, Args::new());
    let outcome = client.call(Envelope::act(meta, call), None).await;
    client.close().await?;

    match outcome? {
        Some(identity) => println!("{}", serde_json::to_string(&identity)?),
        None => tracing::warn!("peer is fire-and-forget, no identity returned"),
    }
    Ok(())
}
