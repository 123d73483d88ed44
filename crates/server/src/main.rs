use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use skaldi_core::config::Config;
use skaldi_history::HistorySink;
use skaldi_player::supervisor::UPDATE_BUFFER;
use skaldi_player::Manager;
use skaldi_resolver::Resolver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PORT: u16 = 8080;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Arc::new(Config::load().context("failed to load configuration")?);
    skaldi_server::bootstrap::prepare(&cfg).context("startup checks failed")?;

    let (history, history_task) = HistorySink::spawn(cfg.history_dir.clone());

    let manager = Manager::new(Arc::clone(&cfg));
    let (update_tx, update_rx) = tokio::sync::mpsc::channel(UPDATE_BUFFER);
    let player_task = tokio::spawn(Arc::clone(&manager).run(update_tx, history));

    let broadcaster = Arc::new(skaldi_server::broadcast::Broadcaster::new());
    let broadcast_task = tokio::spawn(Arc::clone(&broadcaster).run(update_rx));

    let (_discovery, mdns_active) = skaldi_server::discovery::register(PORT);

    let app_state = skaldi_server::state::AppState {
        player: Arc::clone(&manager),
        resolver: Arc::new(Resolver::new(Arc::clone(&cfg))),
        broadcaster,
        http: reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .context("failed to build http client")?,
    };

    let app = skaldi_server::routes::build_router(app_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", PORT))
        .await
        .context("failed to bind")?;
    skaldi_server::discovery::log_ready_message(PORT, mdns_active);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    manager.stop().await;

    let drain = async {
        let _ = player_task.await;
        let _ = broadcast_task.await;
        let _ = history_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown timed out, abandoning remaining tasks");
    }

    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
