use clap::Parser;
use mess::auth::create_auth_state;
use mess::config::{Cli, Config};
use mess::lifecycle;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal error during startup or shutdown");
        std::process::exit(1);
    }
}

async fn run() -> mess::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load()?;
    config.apply_cli(&cli);
    info!(backend = ?config.store.backend, "loading store");

    let store = lifecycle::open_store(&config)?;
    let shutdown_token = CancellationToken::new();
    let state = lifecycle::build_state(&config, store.clone(), shutdown_token.clone());

    let auth_state = create_auth_state(config.api.clone());
    let rate_limit_config = lifecycle::build_rate_limit_config();
    let router = mess::api::build_router(
        state.clone(),
        auth_state,
        rate_limit_config,
        &config.api.allowed_origins,
    );

    let background = lifecycle::spawn_background_loops(state.clone(), &config, shutdown_token.clone());
    let _self_restart_watch = lifecycle::spawn_self_restart_watch(shutdown_token.clone())
        .map_err(|e| {
            tracing::warn!(error = %e, "self-restart watch not installed");
            e
        })
        .ok();

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .map_err(|e| mess::MessError::Configuration(format!("invalid bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(lifecycle::wait_for_shutdown_signal(shutdown_token.clone()));

    if let Err(e) = server.await {
        error!(error = %e, "server exited with error");
    }

    shutdown_token.cancel();
    for handle in background {
        let _ = handle.await;
    }

    match store.close().await {
        Ok(()) => {
            info!("store closed cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "store close failed: data loss");
            Err(e)
        }
    }
}
