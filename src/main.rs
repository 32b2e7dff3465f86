use std::env;
use std::path::PathBuf;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use warden::config::{CONFIG_ENV, CONFIG_FILE};
use warden::{EnforcementEngine, EngineConfig, Error, logging};

/// Run one enforcement node until interrupted
async fn async_main() -> Result<(), Error> {
    let config_path = env::var(CONFIG_ENV).map_or_else(|_| PathBuf::from(CONFIG_FILE), PathBuf::from);
    let config = EngineConfig::load(&config_path).await?;
    if !config_path.exists() {
        config.save(&config_path).await?;
    }

    logging::init(&config.log_dir)?;
    logging::log_console(format!("Loaded configuration from {}", config_path.display()));

    let engine = EnforcementEngine::connect(config).await?;
    engine.start().await?;

    let mut notices = engine.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => info!(
                    subject_id = %notice.subject_id,
                    kind = %notice.kind,
                    record_id = %notice.record_id,
                    change = ?notice.change,
                    remote = notice.remote,
                    "Enforcement change"
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed = missed, "Change notices dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("Waiting for shutdown signal...");
    tokio::signal::ctrl_c().await?;
    logging::log_console("Shutting down");

    engine.stop().await?;
    drop(engine);
    watcher.abort();
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error building runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
