use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use floodcast::{FloodCast, Host, TcpHost};

#[derive(Parser, Debug)]
#[command(name = "floodcast")]
#[command(author, version, about = "Flooding pub/sub node", long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: String,

    /// Peers to connect to (HOST:PORT), repeatable.
    #[arg(short, long = "connect", value_name = "ADDR")]
    connect: Vec<String>,

    /// Topic to join; stdin lines are published to it.
    #[arg(short, long, default_value = "lobby")]
    topic: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let host = TcpHost::bind(&args.bind, cancel.child_token()).await?;
    info!(peer = %host.local_peer().to_hex(), addr = %host.local_addr(), "node up");

    let fs = FloodCast::new(host.clone(), cancel.clone());

    for addr in &args.connect {
        match host.connect(addr).await {
            Ok(peer) => info!(peer = %peer, addr = %addr, "connected"),
            Err(e) => warn!(addr = %addr, error = %e, "connect failed"),
        }
    }

    let mut sub = fs.subscribe(&args.topic).await?;
    info!(topic = %args.topic, "subscribed; lines on stdin are published");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                cancel.cancel();
                break;
            }
            message = sub.next() => match message {
                Some(message) => {
                    println!(
                        "[{}] {}: {}",
                        args.topic,
                        message.source(),
                        String::from_utf8_lossy(&message.data),
                    );
                }
                None => {
                    info!("subscription ended");
                    break;
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(e) = fs.publish(&args.topic, line.into_bytes()).await {
                        warn!(error = %e, "publish failed");
                    }
                }
                Ok(None) => {
                    info!("stdin closed, shutting down");
                    cancel.cancel();
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                }
            },
        }
    }

    Ok(())
}
