use anyhow::{Context, Result};
use lib_livedata::configs::config_sys::{self, EngineConfig};
use lib_livedata::configs::definitions::DefinitionsFile;
use lib_livedata::loggers::logger;
use tokio::runtime::Handle;
use tokio::signal;

mod live_logic;
use live_logic::{ingest, monitor};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config_sys::load_config()?;
    let log_path = logger::setup_logging("server_live", &config.log_dir(), config.log_level())?;
    log::info!("Logging to {}", log_path.display());

    let result = run(config).await;
    if let Err(e) = &result {
        log::error!("Fatal: {:#}", e);
    }
    result
}

async fn run(config: EngineConfig) -> Result<()> {
    let settings = config.context_settings()?;
    let definitions_path = config.definitions_path();
    let ctx = DefinitionsFile::load(&definitions_path)?
        .build_context(settings)
        .with_context(|| format!("invalid definitions in {}", definitions_path.display()))?;
    ctx.start(&Handle::current())?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let ingest_handle = tokio::spawn(ingest::run(
        ctx.clone(),
        config.events_path.clone(),
        shutdown_tx.subscribe(),
    ));
    let monitor_handle = tokio::spawn(monitor::run(
        ctx.clone(),
        config.monitor_interval(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    let _ = shutdown_tx.send(());
    let (ingested, _) = tokio::join!(ingest_handle, monitor_handle);
    if let Ok(count) = ingested {
        log::info!("Ingested {} events.", count);
    }

    // joins the dispatcher thread
    tokio::task::spawn_blocking(move || ctx.shutdown()).await?;
    log::info!("Shutdown complete.");
    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::warn!("Cannot install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}
