//! HTTP endpoints: health and the websocket upgrade.

use actix_web::{
    HttpResponse, Result, get, route,
    web::{self, Json},
};
use proximity_config::rooms::DEFAULT_ROOM_ID;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{AppState, ws::handler};

#[route("/health", method = "GET")]
pub async fn health_endpoint(data: web::Data<AppState>) -> Result<Json<Value>> {
    log::trace!("Healthy");
    Ok(Json(json!({
        "healthy": true,
        "connections": data.state.registry.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct WebsocketQuery {
    room: Option<String>,
}

/// Upgrades to the proximity socket of the `room` query parameter.
///
/// # Errors
///
/// * If the room is unknown
/// * If the WebSocket upgrade handshake fails
#[allow(clippy::future_not_send)]
#[get("/ws")]
pub async fn websocket(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    query: web::Query<WebsocketQuery>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let room_id = query.room.as_deref().unwrap_or(DEFAULT_ROOM_ID);
    let Some(room) = data.state.rooms.get(room_id) else {
        log::debug!("websocket: rejecting unknown room '{room_id}'");
        return Err(actix_web::error::ErrorNotFound(format!(
            "Unknown room '{room_id}'"
        )));
    };

    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    // spawn websocket handler (and don't await it) so that the response is returned immediately
    actix_web::rt::spawn(handler::handle_ws(
        data.ws_server.clone(),
        room,
        session,
        msg_stream,
    ));

    Ok(response)
}
