use anyhow::Context;
use jobhub_server::{
    build_hub,
    routes::{router, AppState},
    settings, telemetry,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = settings::load().context("failed to load settings")?;
    telemetry::init(settings.log_format);

    let hub = build_hub(&settings).await?.start();
    let app = router(AppState::new(&hub));

    let listener = TcpListener::bind(&settings.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.http.bind))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hub.graceful_shutdown().await?;
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down, waiting for jobs in flight");
}
