use devdeck_agent::{config::AgentConfig, http, state::AppState};
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown requested; managed scripts keep running");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AgentConfig::from_env()?;
    let state = AppState::new(config.clone());

    let http_listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    tracing::info!(addr = %config.http_addr, "devdeck-agent HTTP listening");
    let http_server = axum::serve(http_listener, http::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal());

    match config.ws_addr {
        Some(ws_addr) => {
            let ws_listener = tokio::net::TcpListener::bind(ws_addr).await?;
            tracing::info!(addr = %ws_addr, "devdeck-agent observer socket listening");
            let ws_server = axum::serve(ws_listener, http::ws_router(state))
                .with_graceful_shutdown(shutdown_signal());
            tokio::try_join!(
                async { http_server.await },
                async { ws_server.await },
            )?;
        }
        None => http_server.await?,
    }

    Ok(())
}
