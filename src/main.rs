//! Tether router daemon entry point.

use log::{error, info};
use tokio::signal;

use tether::{ActivityLog, Config, Router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let cfg = Config::load()?;

    // Initialize logging, teed into the activity log controllers receive
    let activity = ActivityLog::new(&cfg.activity_log_path);
    let tee = activity.open_tee()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(tee)))
        .init();
    info!("Starting Tether router with config: {:?}", cfg);
    info!("Activity log: {}", activity.path().display());

    // Router
    let router = match Router::start(&cfg, activity).await {
        Ok(router) => router,
        Err(e) => {
            error!("Router failed to start: {}", e);
            return Err(e.into());
        }
    };

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    router.shutdown().await;
    Ok(())
}
