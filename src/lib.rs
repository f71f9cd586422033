//! WebSocket Room Relay Library
//!
//! A relay for short-lived, named broadcast rooms built with
//! tokio-tungstenite using the Actor pattern for room state.
//!
//! # Features
//! - Room creation with random 12-character hex ids
//! - Bounded room lifetime with exactly-once teardown
//! - Fan-out of every message to all room members
//! - Eviction of members that cannot keep up
//! - Liveness probes and idle timeouts per connection
//!
//! # Architecture
//! - `Hub` maps room ids to rooms behind a read/write lock
//! - Each `Room` is an actor: one task owns its membership and fans out
//!   envelopes to per-member outboxes with non-blocking sends
//! - Each connection runs a read pump and a write pump that talk to the
//!   room only through channels
//!
//! # Example
//! ```ignore
//! use room_relay::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), room_relay::AppError> {
//!     let server = Server::bind(Config::default()).await?;
//!     server.run_until_ctrl_c().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod room;
pub mod server;
pub mod signal;
pub mod types;

// Re-export main types for convenience
pub use client::{join_room, Session, SessionState};
pub use config::Config;
pub use connection::{Connection, WsConnection};
pub use error::{AppError, ConnectionError};
pub use handler::handle_connection;
pub use hub::Hub;
pub use message::{Envelope, EnvelopeKind, RoomCreated};
pub use room::{Room, RoomDirectory};
pub use server::Server;
pub use types::{ClientId, RoomId};
