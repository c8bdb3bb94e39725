//! Convoy CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{bail, Context, Result};
use clap::Parser;
use convoy::auth::{Credentials, IdentityToken, IdentityVerifier};
use convoy::server::{RelayConfig, RelayServer};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            public_dir,
            queue_capacity,
            handshake_timeout_secs,
        } => {
            let options = ServeOptions {
                host,
                port,
                public_dir,
                queue_capacity,
                handshake_timeout: Duration::from_secs(handshake_timeout_secs),
            };
            serve(&cli.credentials, options).await
        }
        Commands::Keygen { issuer, force } => keygen(&cli.credentials, issuer, force),
        Commands::Mint { subject, ttl_secs } => mint(&cli.credentials, subject, ttl_secs),
    }
}

struct ServeOptions {
    host: String,
    port: u16,
    public_dir: PathBuf,
    queue_capacity: usize,
    handshake_timeout: Duration,
}

async fn serve(credentials: &Path, options: ServeOptions) -> Result<()> {
    let verifier = IdentityVerifier::from_credentials_file(credentials)
        .context("Failed to initialize credential backend")?;

    let ip: IpAddr = options.host.parse().context("Invalid bind address")?;
    let config = RelayConfig::new(SocketAddr::new(ip, options.port))
        .with_public_dir(options.public_dir)
        .with_queue_capacity(options.queue_capacity)
        .with_handshake_timeout(options.handshake_timeout);

    if !config.public_dir.is_dir() {
        warn!(public_dir = %config.public_dir.display(), "Static asset directory not found");
    }

    info!("Starting Convoy relay...");
    RelayServer::new(config, verifier).run(shutdown_signal()).await
}

fn keygen(path: &Path, issuer: String, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let credentials = Credentials::generate(issuer);
    credentials.save(path)?;

    println!("Wrote credentials to {}", path.display());
    println!("Issuer: {}", credentials.issuer);

    Ok(())
}

fn mint(path: &Path, subject: String, ttl_secs: u64) -> Result<()> {
    let credentials = Credentials::load(path)?.with_context(|| {
        format!(
            "No credentials file at {} (run `convoy keygen` first)",
            path.display()
        )
    })?;

    let token = IdentityToken::create(
        subject.clone(),
        credentials.issuer.clone(),
        ttl_secs,
        credentials.secret.as_bytes(),
    )
    .context("Failed to sign token")?;

    println!("{}", token);
    println!();
    println!("Subject: {}", subject);
    println!("Issuer: {}", credentials.issuer);
    println!("Expires in: {}s", ttl_secs);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping relay");
}
