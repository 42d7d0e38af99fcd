use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wiretap::{CaState, ProxyConfig, ProxyEvents, ProxyServer};

/// Intercepting HTTP/HTTPS proxy with on-demand certificate minting.
///
/// Accepts explicit (CONNECT-based) and transparent clients, terminates
/// TLS with certificates signed by a generated root CA, and forwards
/// sessions to the origin or through an upstream proxy.
#[derive(Parser, Debug)]
#[command(name = "wiretap")]
#[command(version, about)]
struct Args {
    /// Path to the proxy configuration file (YAML).
    /// If not specified, `wiretap.yaml` in the current directory is used.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Print the generated root CA certificate (PEM) to stdout at startup,
    /// for installing into client trust stores.
    #[arg(long)]
    print_ca: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(|| "wiretap.yaml".into());
    let config = ProxyConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;

    let ca = Arc::new(CaState::generate().context("failed to generate root CA")?);
    if args.print_ca {
        print!("{}", ca.ca_cert_pem());
    }

    let server = ProxyServer::bind(config, ProxyEvents::new(), ca)
        .await
        .context("failed to bind proxy endpoints")?;

    server.run().await.context("proxy server error")?;
    Ok(())
}
