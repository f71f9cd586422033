//! Error types for the relay
//!
//! Defines application-level errors and connection (transport) errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers fatal per-connection errors (handshake, IO) and
/// lookup failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal for the connection)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport error on an established connection
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Room id unknown or the room has already shut down
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The room stopped accepting requests
    #[error("Room closed")]
    RoomClosed,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Transport errors of a single connection
///
/// Always local to one session; never escalated to the room.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection was closed (by either side)
    #[error("Connection closed")]
    Closed,

    /// A read or write deadline elapsed
    #[error("Deadline elapsed")]
    Timeout,

    /// Underlying WebSocket failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
