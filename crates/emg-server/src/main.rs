use anyhow::Context;
use clap::Parser;
use emg_server::{router, AppState, Cli, ServerConfig};
use emg_source::{SignalSource, SyntheticSource};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emg_server=info,emg_source=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli).context("invalid configuration")?;

    let source = SyntheticSource::new(config.source.clone()).context("creating signal source")?;
    source.start().context("starting signal source")?;
    let source: Arc<dyn SignalSource> = Arc::new(source);

    let state = AppState::new(config.clone(), source).context("opening session store")?;
    let sweeper = state.spawn_sweeper();

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("Listening on http://{}", config.bind_addr);
    info!("Streaming endpoint: ws://{}/ws", config.bind_addr);
    info!("Sessions stored in {}", config.data_dir.display());

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal(state.cancel.clone()))
        .await
        .context("server error")?;

    state.shutdown();
    let _ = sweeper.await;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels every streaming loop
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown requested");
    cancel.cancel();
}
