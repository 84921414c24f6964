use anyhow::Context;
use clap::Parser;
use natrelay_proto::keys::random_token;
use natrelay_relay::{status, BackendConfig, ProcessBackend, Relay, RelayConfig};
use natrelay_transport::TcpTransport;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(about = "Shares one automation backend with peers that dial this relay's public key")]
struct Opts {
    /// Token handed to the backend. Generated when omitted.
    #[arg(short, long, env = "NATRELAY_TOKEN")]
    token: Option<String>,

    /// Seed for the relay key. Defaults to the token, so the same token
    /// always yields the same public key.
    #[arg(short, long, env = "NATRELAY_SEED")]
    seed: Option<String>,

    /// Address peers connect to.
    #[arg(long, env = "NATRELAY_LISTEN", default_value = "0.0.0.0:49737")]
    listen: SocketAddr,

    /// Serve /healthz and /status here.
    #[arg(long, env = "NATRELAY_STATUS_LISTEN")]
    status_listen: Option<SocketAddr>,

    /// Passed to the backend as --host.
    #[arg(long, env = "NATRELAY_BACKEND_HOST")]
    backend_host: Option<String>,

    /// Command line that launches the backend.
    #[arg(long, env = "NATRELAY_BACKEND_CMD")]
    backend_cmd: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Opts::parse();

    let (token, generated) = match opts.token.filter(|t| !t.trim().is_empty()) {
        Some(token) => (token, false),
        None => (random_token(), true),
    };

    let mut backend_config = BackendConfig::from_env();
    if let Some(cmd) = &opts.backend_cmd {
        backend_config = backend_config.with_command_line(cmd);
    }
    if let Some(host) = opts.backend_host {
        backend_config.host = host;
    }

    let relay = Relay::new(
        RelayConfig::from_env(),
        Arc::new(TcpTransport::new(opts.listen)),
        Arc::new(ProcessBackend::new(backend_config)),
    );
    let info = relay
        .start(&token, opts.seed.as_deref())
        .await
        .context("starting relay")?;

    if let Some(addr) = opts.status_listen {
        status::spawn(relay.clone(), addr).context("binding status endpoint")?;
    }

    if generated {
        println!("token:      {token}");
    }
    println!("public key: {}", info.public_key);
    if let Some(addr) = info.local_addr {
        println!("listening:  {addr}");
        println!(
            "connect:    natrelay-client --host {} --addr <this-host>:{}",
            info.public_key,
            addr.port()
        );
    }

    serve_until(&relay, shutdown_signal()).await
}

/// Runs until `signal` fires or the relay closes by itself. The second case
/// is an error so the process exits non-zero.
async fn serve_until(relay: &Relay, signal: impl Future<Output = ()>) -> anyhow::Result<()> {
    tokio::select! {
        _ = signal => {
            log::info!("signal received");
            relay.shutdown().await;
            Ok(())
        }
        _ = relay.wait_closed() => anyhow::bail!("relay stopped on its own"),
    }
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
