//! WebSocket connection handler
//!
//! Handles individual TCP connections: routes the WebSocket handshake on its
//! request path, then either creates a room or runs a session until both of
//! its pumps finish.
//!
//! Routes:
//! - `/create-room` replies with one `RoomCreated` frame and closes
//! - `/ws?room={id}&name={name}` joins an existing room

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info};
use url::form_urlencoded;

use crate::config::Config;
use crate::connection::{Connection, WsConnection};
use crate::error::AppError;
use crate::hub::Hub;
use crate::message::RoomCreated;
use crate::types::RoomId;

/// Path that creates a room
pub const CREATE_ROOM_PATH: &str = "/create-room";

/// Path that joins a room
pub const JOIN_PATH: &str = "/ws";

/// What a handshake asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    CreateRoom,
    Join { room_id: RoomId, name: String },
}

/// Decide what a handshake request is for
///
/// Rejects unknown paths, joins without a room id, and joins to rooms that
/// are not live.
pub fn route_request(request: &Request, hub: &Hub) -> Result<Route, ErrorResponse> {
    let uri = request.uri();
    match uri.path() {
        CREATE_ROOM_PATH => Ok(Route::CreateRoom),
        JOIN_PATH => {
            let mut room = None;
            let mut name = None;
            let query = uri.query().unwrap_or_default();
            for (key, value) in form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "room" => room = Some(value.into_owned()),
                    "name" => name = Some(value.into_owned()),
                    _ => {}
                }
            }

            let Some(room_id) = room.filter(|r| !r.is_empty()).map(RoomId) else {
                return Err(reject(StatusCode::BAD_REQUEST, "missing room param"));
            };
            if hub.get_room(&room_id).is_none() {
                return Err(reject(StatusCode::NOT_FOUND, "room not found or closed"));
            }
            Ok(Route::Join {
                room_id,
                name: name.unwrap_or_default(),
            })
        }
        _ => Err(reject(StatusCode::NOT_FOUND, "not found")),
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Transport limits applied during the handshake
pub fn websocket_config(config: &Config) -> WebSocketConfig {
    let mut ws = WebSocketConfig::default();
    ws.max_message_size = Some(config.max_message_size);
    ws.max_frame_size = Some(config.max_message_size);
    ws
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, then serves the requested route.
/// Rejected handshakes are not errors.
pub async fn handle_connection(stream: TcpStream, hub: Arc<Hub>) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let config = hub.config().clone();
    let mut route = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        route = Some(route_request(request, &hub)?);
        Ok(response)
    };

    // WebSocket handshake
    let ws_stream = match tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(websocket_config(&config)),
    )
    .await
    {
        Ok(ws_stream) => ws_stream,
        Err(WsError::Http(response)) => {
            info!("Rejected handshake from {}: {}", peer_addr, response.status());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let Some(route) = route else {
        return Ok(());
    };
    let connection: Arc<dyn Connection> = Arc::new(WsConnection::new(ws_stream, &config));

    match route {
        Route::CreateRoom => reply_room_created(&hub, &config, connection).await,
        Route::Join { room_id, name } => {
            match hub.join(&room_id, name, Arc::clone(&connection)).await {
                Ok(session) => {
                    info!("Client {} from {} joined room {}", session.id(), peer_addr, room_id);
                    session.wait().await;
                    debug!("Connection from {} finished", peer_addr);
                    Ok(())
                }
                Err(e) => {
                    // The room closed between handshake and join
                    if let Err(close_err) = connection.close().await {
                        debug!("close failed for {}: {}", peer_addr, close_err);
                    }
                    Err(e)
                }
            }
        }
    }
}

/// Create a room and tell the caller its id
async fn reply_room_created(
    hub: &Arc<Hub>,
    config: &Config,
    connection: Arc<dyn Connection>,
) -> Result<(), AppError> {
    let room = hub.create_room(config.room_lifetime);
    let reply = RoomCreated {
        room_id: room.id().to_string(),
        lifetime_minutes: config.room_lifetime.as_secs() / 60,
    };
    let frame = serde_json::to_string(&reply)?;

    let result = connection
        .write(frame, Instant::now() + config.write_wait)
        .await;
    if let Err(e) = connection.close().await {
        debug!("close after room created failed: {}", e);
    }
    result.map_err(AppError::from)
}
