use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mirrorgate_relay::{router, AppState, RelayConfig};

#[derive(Parser)]
#[command(name = "mirrorgate-relay")]
#[command(author = "Mirrorgate Team")]
#[command(version = "0.1.0")]
#[command(about = "Serve a website through this host, with media relay and a fetch tunnel", long_about = None)]
struct Cli {
    /// Config file (defaults to mirrorgate.yml in the current or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<String>,

    /// Origin to mirror
    #[arg(short, long)]
    target: Option<String>,

    /// Externally visible origin of this relay
    #[arg(long)]
    public_origin: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "mirrorgate_relay=debug,tower_http=warn"
    } else {
        "mirrorgate_relay=info,tower_http=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let mut config = match cli.config.clone().or_else(RelayConfig::find_config) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            RelayConfig::load(&path)?
        }
        None => RelayConfig::default(),
    };
    config.apply_env()?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(target) = cli.target {
        config.target = target;
    }
    if let Some(origin) = cli.public_origin {
        config.public_origin = Some(origin);
    }

    let addr = config.listen_addr()?;
    let state = AppState::from_config(config.clone()).context("Invalid relay configuration")?;
    let app = router(state);

    info!(
        "Mirrorgate relay on {} (target: {}, mount: {})",
        addr,
        config.target,
        config.mount_path()
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}
