pub mod config;
pub mod handlers;
pub mod hub;
pub mod registry;
pub mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::handlers::{create_room, get_room, health_check, SharedHub};
use crate::websocket::websocket_handler;

pub fn router(hub: SharedHub) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/create-room", post(create_room))
        .route("/api/room/:room_id", get(get_room))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

/// Serves the signaling router on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, hub: Arc<hub::SignalingHub>) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
