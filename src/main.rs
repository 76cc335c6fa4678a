use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, Level};

use mail_sync_engine::{Engine, EngineConfig, Storage, Vault};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mail_sync_engine=info".into()),
        )
        .with_max_level(Level::INFO)
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(error = %err, "engine exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let config = EngineConfig::load(&config_path)?;

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let vault = Arc::new(Vault::load_or_create(&config.data_dir)?);
    info!(key_fingerprint = %vault.fingerprint(), "vault unlocked");
    let storage = Storage::open(&config.database_path(), vault.clone())?;

    let engine = Engine::start(config, storage, vault).await?;
    let backlog = engine.enqueue_backlog().await?;
    if backlog > 0 {
        info!(backlog, "queued unclassified messages from previous run");
    }
    info!("engine running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    engine.shutdown().await;
    Ok(())
}
