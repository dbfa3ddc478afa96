//! Boot, periodic snapshot, and signal-driven shutdown (spec §4.7).

use crate::bot_bundle::BotBundle;
use crate::config::Config;
use crate::output_store::OutputStore;
use crate::rate_limit::RateLimitConfig;
use crate::scheduler::Scheduler;
use crate::store::memory::MemStore;
use crate::store::sql::SqlStore;
use crate::store::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Root application state, owned by `main` and handed to every component
/// explicitly rather than reached for through a global (spec §9: "global
/// mutable caches become values owned by a root application struct").
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub output_store: Arc<OutputStore>,
    pub scheduler: Arc<Scheduler>,
    pub bot_bundle: Arc<BotBundle>,
    pub external_url: String,
    pub shutdown_token: CancellationToken,
    /// Opaque id minted once per process start, handed to bots as the bot
    /// group config version so a restart is visibly a new generation even
    /// though there is no real bot group config (spec §1 Non-goal).
    pub config_version: String,
}

pub fn open_store(config: &Config) -> crate::Result<Arc<dyn Store>> {
    match config.store.backend {
        crate::config::StoreBackend::Memory => {
            Ok(Arc::new(MemStore::open(&config.store.path)?))
        }
        crate::config::StoreBackend::Sql => Ok(Arc::new(SqlStore::open(&config.store.path)?)),
    }
}

pub fn build_state(config: &Config, store: Arc<dyn Store>, shutdown_token: CancellationToken) -> Arc<AppState> {
    let output_store = Arc::new(OutputStore::new(&config.output_store.root));
    let scheduler = Arc::new(Scheduler::new(store.clone()));
    let bot_bundle = Arc::new(BotBundle::new(base_bundle_bytes()));

    Arc::new(AppState {
        store,
        output_store,
        scheduler,
        bot_bundle,
        external_url: format!("http://{}:{}", config.api.host, config.api.port),
        shutdown_token,
        config_version: uuid::Uuid::new_v4().to_string(),
    })
}

/// Placeholder embedded worker bundle. The real worker agent binary is a
/// Non-goal (spec §1); this stands in so BotBundle has bytes to version and
/// serve.
fn base_bundle_bytes() -> Vec<u8> {
    let mut buffer = Vec::new();
    {
        let writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
        writer.finish().expect("empty zip always finishes");
    }
    buffer
}

/// Spawns the Scheduler re-scan loop, the OutputStore eviction loop, and
/// the periodic Store snapshot ticker. All three stop on `token`.
pub fn spawn_background_loops(
    state: Arc<AppState>,
    config: &Config,
    token: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let scheduler = state.scheduler.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run_loop(token).await;
        }));
    }

    {
        let output_store = state.output_store.clone();
        let cutoff = std::time::Duration::from_secs(config.output_store.idle_cutoff_secs);
        let max_open = config.output_store.max_open;
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            output_store.run_loop(cutoff, max_open, token).await;
        }));
    }

    {
        let store = state.store.clone();
        let interval_secs = config.store.snapshot_interval_secs;
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("snapshot ticker stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = store.snapshot().await {
                            tracing::error!(error = %e, "periodic snapshot failed");
                        }
                    }
                }
            }
        }));
    }

    handles
}

/// Watches the currently executing binary; on modification, cancels the
/// root token so the surrounding supervisor restarts the process.
pub fn spawn_self_restart_watch(token: CancellationToken) -> crate::Result<tokio::task::JoinHandle<()>> {
    let exe = std::env::current_exe()?;
    let (tx, mut rx) = tokio::sync::mpsc::channel(1);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if event.kind.is_modify() {
                let _ = tx.try_send(());
            }
        }
    })
    .map_err(|e| crate::error::MessError::Internal(anyhow::anyhow!("watcher init: {e}")))?;

    notify::Watcher::watch(&mut watcher, &exe, notify::RecursiveMode::NonRecursive)
        .map_err(|e| crate::error::MessError::Internal(anyhow::anyhow!("watch binary: {e}")))?;

    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        if rx.recv().await.is_some() {
            tracing::info!("executable modified on disk, signaling restart");
            token.cancel();
        }
    }))
}

/// Waits for ctrl_c (and SIGTERM on unix), then cancels `token`.
pub async fn wait_for_shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl_c"),
        _ = terminate => tracing::info!("received SIGTERM"),
        _ = token.cancelled() => {}
    }
    token.cancel();
}

pub fn build_rate_limit_config() -> Arc<RateLimitConfig> {
    Arc::new(RateLimitConfig::new())
}
