use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use strider_server::config::config_path;
use strider_server::load_config;
use strider_server::{PlainTokenDecoder, SealedTokenDecoder, Services, TokenDecoder};
use strider_store::{Database, UserRepo};
use strider_upstream::UpstreamClient;

#[derive(Parser, Debug)]
#[command(name = "strider", about = "Location reporting emulator")]
struct Args {
    /// Config file (defaults to STRIDER_CONFIG or ~/.strider/config.json).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen port, overriding config and environment.
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database path.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = args.config.clone().unwrap_or_else(config_path);
    let mut config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db) = args.db {
        config.database_path = db.display().to_string();
    }

    let telemetry = strider_telemetry::init_telemetry(config.telemetry());
    tracing::info!(config = %path.display(), "starting strider");

    let db_path = PathBuf::from(&config.database_path);
    let db = Database::open(&db_path).context("opening user store")?;
    let users = UserRepo::new(db);
    let cleared = users.clear_stale_walking().context("clearing stale walking flags")?;
    if cleared > 0 {
        tracing::warn!(cleared, "cleared walking flags left by a previous process");
    }

    let upstream = UpstreamClient::new(&config.upstream()).context("building upstream client")?;

    let tokens: Arc<dyn TokenDecoder> = match &config.token_key_path {
        Some(key_path) => Arc::new(
            SealedTokenDecoder::from_key_file(Path::new(key_path)).context("loading token key")?,
        ),
        None => {
            tracing::warn!("no token key configured, accepting plain tokens");
            Arc::new(PlainTokenDecoder)
        }
    };

    let services = Services {
        upstream: Arc::new(upstream),
        store: Arc::new(users),
        tokens,
        counters: telemetry.counters(),
    };
    let handle = strider_server::start(&config, services)
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;
    tracing::info!(port = handle.port, "strider ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
