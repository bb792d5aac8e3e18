use anyhow::{Context, Result};
use clap::Parser;
use leadline_server::config::{expand_home, Settings};
use leadline_server::subscription_db::SubscriptionDb;
use leadline_server::{app, AppState};
use std::net::{IpAddr, SocketAddr};

#[derive(Parser)]
#[command(name = "leadline-server", about = "leadline notification API")]
struct Args {
    /// Path to server configuration TOML file
    #[arg(long, default_value = "~/.config/leadline/leadline-server.toml")]
    config: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config_path = expand_home(&args.config)?;
    let settings = Settings::from_file(&config_path)?;

    let data_dir = settings.storage.data_dir()?;
    let db = SubscriptionDb::open(&data_dir)
        .await
        .with_context(|| format!("Failed to open database in {}", data_dir.display()))?;
    let state = AppState::new(db, settings.auth.jwt_secret.as_bytes());

    let host = settings
        .server
        .host
        .parse::<IpAddr>()
        .with_context(|| format!("Invalid host {}", settings.server.host))?;
    let addr = SocketAddr::new(host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("leadline-server listening on http://{addr}");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping leadline-server");
        })
        .await
        .context("Server error")?;
    Ok(())
}
