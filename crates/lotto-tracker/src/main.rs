use std::sync::Arc;

use lotto_tracker::{
    backend::HttpBackend,
    config::{self, AppConfig},
    error::format_error_chain,
    persistence::{FileStore, Persistence},
    service::TrackerService,
    sink::LogSink,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env();
    let backend = HttpBackend::new(&cfg.backend_url)?;
    let store = FileStore::new(&cfg.state_dir);
    tracing::info!(
        backend = %cfg.backend_url,
        state_dir = %store.dir().display(),
        "lotto-tracker starting"
    );

    let service = TrackerService::new(
        backend,
        Arc::new(LogSink),
        Persistence::new(Arc::new(store)),
        cfg.tracker,
    );

    match cfg.known_items_path.as_deref() {
        Some(path) => match config::load_known_items(path) {
            Ok(items) => {
                tracing::info!(count = items.len(), "loaded known items");
                service.set_known_items(items);
            }
            Err(err) => {
                tracing::warn!(error = %format_error_chain(&err), "known items unavailable");
            }
        },
        None => tracing::info!("LOTTO_KNOWN_ITEMS_PATH not set; reconciliation adopts nothing"),
    }

    let resumed = service.resume();
    tracing::info!(resumed, "resumed tracked downloads");

    let reconciler = service.spawn_reconciler();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    service.shutdown();
    reconciler.await?;

    Ok(())
}
