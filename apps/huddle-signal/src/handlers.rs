use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use huddle_proto::{CreateRoomResponse, ErrorBody, HealthStatus, RoomInfo};
use std::sync::Arc;
use tracing::{debug, info};

use crate::hub::SignalingHub;

pub type SharedHub = Arc<SignalingHub>;

/// Reserve a room id without joining it.
pub async fn create_room(State(hub): State<SharedHub>) -> Json<CreateRoomResponse> {
    let room_id = hub.create_room();
    info!(room_id = %room_id, "room reserved over http");
    Json(CreateRoomResponse { room_id })
}

pub async fn get_room(
    Path(room_id): Path<String>,
    State(hub): State<SharedHub>,
) -> Result<Json<RoomInfo>, (StatusCode, Json<ErrorBody>)> {
    match hub.room_info(&room_id) {
        Some(info) => Ok(Json(info)),
        None => {
            debug!(room_id = %room_id, "room lookup missed");
            Err((
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: "Room not found".to_string(),
                }),
            ))
        }
    }
}

pub async fn health_check(State(hub): State<SharedHub>) -> Json<HealthStatus> {
    Json(hub.health())
}
