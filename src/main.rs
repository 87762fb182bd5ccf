use clap::Parser;
use gateway_cr::config::Config;
use gateway_cr::services::{directory, server, AppState, AutomationCoordinator, LifecycleEngine};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let addr = config.bind_addr()?;

    let pool = gateway_cr::db::initialize(&config.database_path).await?;

    if let Some((username, email)) = config.bootstrap() {
        let admin = directory::ensure_user(&pool, &username, &email).await?;
        directory::bootstrap_super_manager(&pool, admin.user_id).await?;
    }

    let automation = config.automation();
    let handle = AutomationCoordinator::new(pool.clone(), automation.webhook)?
        .start(automation.queue_size);
    let engine = LifecycleEngine::new(pool, handle);

    let cancel_token = CancellationToken::new();
    let shutdown = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[main] Shutdown requested");
        }
        shutdown.cancel();
    });

    server::serve(addr, AppState { engine }, cancel_token).await?;
    Ok(())
}
