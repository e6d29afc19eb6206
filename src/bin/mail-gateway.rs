#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! HTTP gateway exposing IMAP mailboxes and SMTP submission as JSON

use clap::Parser;
use mail_gateway::{
    DRAIN_TIMEOUT, Gateway, GatewayConfig, reaper_interval, serve_until, shutdown_signal,
    spawn_idle_reaper,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mail-gateway")]
#[command(about = "Session-oriented JSON gateway to IMAP mailboxes")]
struct Args {
    /// Address to listen on (overrides GATEWAY_BIND)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = GatewayConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let listener = TcpListener::bind(&config.bind).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    let reaper_every = reaper_interval(config.session_idle);
    let gateway = Arc::new(Gateway::new(config));
    let reaper = spawn_idle_reaper(Arc::clone(&gateway), reaper_every);

    let served = serve_until(listener, Arc::clone(&gateway), shutdown_signal(), DRAIN_TIMEOUT).await;
    reaper.abort();
    served?;
    info!("Stopped");
    Ok(())
}
