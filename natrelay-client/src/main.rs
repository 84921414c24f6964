use anyhow::Context;
use clap::Parser;
use natrelay_client::{bridge, dial, BridgeOutcome, ConnectorConfig};
use natrelay_proto::PublicKey;
use natrelay_transport::TcpTransport;
use std::net::SocketAddr;

#[derive(Debug, Parser)]
#[command(about = "Bridges stdin/stdout to a natrelay relay")]
struct Opts {
    /// Public key of the relay, as printed when it started (hex).
    #[arg(long)]
    host: PublicKey,

    /// Socket address the relay listens on.
    #[arg(long, env = "NATRELAY_RELAY_ADDR")]
    addr: SocketAddr,

    /// Dial attempts before giving up.
    #[arg(long, env = "NATRELAY_CONNECT_ATTEMPTS")]
    max_attempts: Option<u32>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Opts::parse();

    let code = match run(opts).await {
        Ok(outcome) => {
            log::info!("bridge finished: {:?}", outcome);
            0
        }
        Err(e) => {
            log::error!("{:#}", e);
            1
        }
    };
    // Stdin is read on a blocking thread that would otherwise keep the
    // process alive.
    std::process::exit(code);
}

async fn run(opts: Opts) -> anyhow::Result<BridgeOutcome> {
    let mut config = ConnectorConfig::default();
    if let Some(n) = opts.max_attempts {
        config.backoff.max_attempts = n;
    }

    let transport = TcpTransport::dialer(opts.host, opts.addr);
    let conn = dial(&transport, &opts.host, &config)
        .await
        .context("connecting to relay")?;

    let outcome = bridge(
        conn.stream,
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown_signal(),
    )
    .await
    .context("relaying stdio")?;
    Ok(outcome)
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            log::warn!("cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
