use std::io::{self, BufRead};
use std::net::{IpAddr, SocketAddr};
use std::thread;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use punchline::coord::{CoordConfig, CoordServer, DEFAULT_PORT};
use punchline::nat_traversal::{ClientConfig, NatTraversal, TraversalSession};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Topic based peer discovery and UDP hole punching
#[derive(Parser, Debug)]
#[command(name = "punchline", version)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a topic and exchange messages with its members
    Client(ClientArgs),

    /// Run the coordination server
    Coord(CoordArgs),
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Topic to join
    topic: String,

    /// Name to register under, unique within the topic
    name: String,

    /// Coordination server base URL (http, https, ws or wss)
    #[arg(long, env = "COORDINATION_SERVER", default_value = "https://ssc0904-coord.natanbc.net")]
    coordination_server: String,

    /// STUN server (host:port)
    #[arg(long, env = "STUN_SERVER", default_value = "stun.l.google.com:19302")]
    stun_server: String,

    /// Accept self-signed certificates from the coordination server
    #[arg(long)]
    insecure_tls: bool,
}

#[derive(Args, Debug)]
struct CoordArgs {
    /// Listen port
    #[arg(short, long, env = "COORD_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("punchline={}", level)))
        .context("Invalid log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::Client(args) => run_client(args).await,
        Command::Coord(args) => run_coord(args).await,
    }
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let config = ClientConfig {
        coordination_url: args.coordination_server,
        stun_server: args.stun_server,
        topic: args.topic,
        name: args.name,
        accept_invalid_certs: args.insecure_tls,
    };

    info!(topic = %config.topic, name = %config.name, "Joining topic");

    let mut nat = NatTraversal::new(config);
    let session = nat.connect().await.context("Failed to join topic")?;

    let (tx, rx) = mpsc::channel(16);
    thread::spawn(move || read_stdin(tx));

    tokio::select! {
        _ = session.run() => {}
        _ = forward_lines(&session, rx) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    session.close().await;
    Ok(())
}

/// Blocking stdin reader; ends on EOF or when the receiver is gone
fn read_stdin(tx: mpsc::Sender<String>) {
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to read input");
                return;
            }
        };

        let text = line.trim_end_matches(['\n', '\r']);
        if text.is_empty() {
            continue;
        }

        if tx.blocking_send(text.to_string()).is_err() {
            return;
        }
    }

    info!("Input closed");
}

/// Broadcast every input line
async fn forward_lines(session: &TraversalSession, mut rx: mpsc::Receiver<String>) {
    while let Some(text) = rx.recv().await {
        info!(text = %text, "Sending message");
        session.broadcast(text.as_bytes()).await;
    }

    // keep receiving after the input ends
    std::future::pending::<()>().await
}

async fn run_coord(args: CoordArgs) -> Result<()> {
    let config = CoordConfig {
        listen_addr: SocketAddr::new(args.bind, args.port),
    };

    let server = CoordServer::bind(&config).await?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
