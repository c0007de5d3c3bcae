use std::net::SocketAddr;

use crate::error::ServerError;
use crate::routes::{AppState, build_router};
use crate::services::Services;

/// Serve the operator endpoints until Ctrl+C, then close the services.
pub async fn run(services: Services, addr: SocketAddr) -> Result<(), ServerError> {
    let app = build_router(AppState::from_services(&services));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    tracing::info!("listening on {}", addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(ServerError::Serve);

    services.close().await;
    served
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
