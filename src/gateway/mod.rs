//! HTTP/WebSocket surface for observers and operators.
//!
//! Observers connect on `/ws/{client_id}` and receive violation notices as
//! JSON text frames; operators answer over the same socket or through the
//! HTTP fallback. The REST routes expose violation history, zone editing,
//! detector control, playback and the monitoring switch.

pub mod error;
pub mod handlers;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;

use crate::detect::Detector;
use crate::ingest::LatestFrameSource;
use crate::monitor::MonitoringLoop;
use crate::notify::NotificationHub;
use crate::zone::ZoneIndex;
use crate::ShutdownSignal;

pub use error::{ApiError, ApiResult};

const SHUTDOWN_POLL: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<NotificationHub>,
    pub monitor: Arc<MonitoringLoop>,
    pub detector: Arc<Detector>,
    pub zones: Arc<ZoneIndex>,
    pub source: Arc<LatestFrameSource>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/status", get(handlers::api_status))
        .route("/ws/{client_id}", get(ws::ws_handler))
        .route(
            "/api/notifications/response",
            post(handlers::notification_response),
        )
        .route(
            "/api/notifications/clients",
            get(handlers::notification_clients),
        )
        .route("/api/notifications/test", post(handlers::notification_test))
        .route("/api/violations", get(handlers::list_violations))
        .route(
            "/api/violations/statistics",
            get(handlers::violation_statistics),
        )
        .route("/api/violations/export", get(handlers::export_violations))
        .route(
            "/api/violations/{id}",
            get(handlers::get_violation).delete(handlers::delete_violation),
        )
        .route("/api/violations/{id}/image", get(handlers::violation_image))
        .route("/api/monitoring/start", post(handlers::monitoring_start))
        .route("/api/monitoring/stop", post(handlers::monitoring_stop))
        .route("/api/monitoring/status", get(handlers::monitoring_status))
        .route("/api/video/control", post(handlers::video_control))
        .route("/api/video/info", get(handlers::video_info))
        .route(
            "/api/zones",
            get(handlers::list_zones).post(handlers::create_zone),
        )
        .route(
            "/api/zones/{id}",
            get(handlers::get_zone)
                .put(handlers::update_zone)
                .delete(handlers::delete_zone),
        )
        .route("/api/models", get(handlers::list_models))
        .route("/api/models/current", get(handlers::current_model))
        .route("/api/models/set", post(handlers::set_model))
        .route("/api/models/config", post(handlers::set_model_config))
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: ShutdownSignal) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    log::info!("gateway listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !shutdown.is_triggered() {
                tokio::time::sleep(SHUTDOWN_POLL).await;
            }
            log::info!("gateway shutting down");
        })
        .await
        .context("gateway server failed")
}
