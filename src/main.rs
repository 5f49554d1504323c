use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use sigstar::{ChallengeSigner, Connection, DialOptions, Keypair, Listener, ListenerConfig, ListenerEvent, SignalAddr};

#[derive(Parser, Debug)]
#[command(name = "sigstar")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hex-encoded 32-byte Ed25519 secret key; a fresh one is generated if omitted.
    #[arg(short, long, global = true)]
    secret_key: Option<String>,

    /// Join without an identity (fails against servers that send a challenge).
    #[arg(long, global = true)]
    anonymous: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen on a rendezvous address and echo every inbound stream.
    Listen { addr: SignalAddr },
    /// Listen on `local`, dial `remote`, send `message` and print the reply.
    Dial {
        local: SignalAddr,
        remote: SignalAddr,
        message: String,
        #[arg(short, long, default_value = "10")]
        timeout_secs: u64,
    },
}

fn load_identity(args: &Args) -> Result<Option<Arc<dyn ChallengeSigner>>> {
    if args.anonymous {
        return Ok(None);
    }
    let keypair = match &args.secret_key {
        Some(hex_key) => {
            let bytes = hex::decode(hex_key).context("invalid hex secret key")?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("secret key must be 64 hex characters (32 bytes)"))?;
            Keypair::from_secret_key_bytes(&bytes)
        }
        None => Keypair::generate(),
    };
    info!("Identity: {}", keypair.identity());
    Ok(Some(Arc::new(keypair)))
}

fn echo(mut conn: Connection) {
    tokio::spawn(async move {
        info!(dial_id = %conn.dial_id(), remote = %conn.remote(), "inbound stream");
        while let Some(chunk) = conn.recv().await {
            if let Err(e) = conn.send(&chunk).await {
                warn!(error = %e, "echo failed");
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let identity = load_identity(&args)?;

    match args.command {
        Command::Listen { addr } => {
            let listener = Listener::new(ListenerConfig::default(), identity, echo);
            let mut events = listener.subscribe();
            listener.listen(&addr).await.context("listen failed")?;
            info!("Listening on {}", addr);

            // Graceful shutdown on Ctrl+C
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal, exiting gracefully");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(ListenerEvent::Peer(peer)) => info!(peer = %peer, "peer announced"),
                        Ok(ListenerEvent::Error(e)) => warn!(error = %e, "listener error"),
                        Ok(ListenerEvent::Closed) => break,
                        Ok(event) => info!(?event, "listener event"),
                        Err(_) => break,
                    }
                }
            }
            listener.close().await;
        }
        Command::Dial {
            local,
            remote,
            message,
            timeout_secs,
        } => {
            let listener = Listener::new(ListenerConfig::default(), identity, echo);
            listener.listen(&local).await.context("listen failed")?;

            let timeout = Duration::from_secs(timeout_secs);
            let mut conn = listener
                .dial(&remote, DialOptions::with_timeout(timeout))
                .await
                .context("dial failed")?;
            conn.send(message.as_bytes()).await?;

            let reply = tokio::time::timeout(timeout, conn.recv())
                .await
                .context("timed out waiting for reply")?
                .context("stream ended without a reply")?;
            println!("{}", String::from_utf8_lossy(&reply));

            listener.close().await;
        }
    }

    Ok(())
}
