use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use sbar_service::config::Config;
use sbar_service::firestore::FirestoreStore;
use sbar_service::gemini_client::GeminiClient;
use sbar_service::http::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    // Both clients are built once here and injected; a missing credential
    // is a deployment defect and fails startup.
    let model = GeminiClient::new(&config.gemini_api_key, &config.gemini_model)
        .context("failed to create Gemini client")?;
    let store = FirestoreStore::new(config.service_account.clone())
        .context("failed to create Firestore client")?;

    let state = AppState {
        model: Arc::new(model),
        store: Arc::new(store),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(
        "sbar-service listening on {} (model {})",
        config.bind_addr, config.gemini_model
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
