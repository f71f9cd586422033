//! Client session
//!
//! A session bridges one connection to one room with two pumps:
//! - the read pump wraps every inbound payload in an envelope and submits
//!   it to the room's inbox
//! - the write pump drains the session's outbox to the connection and sends
//!   periodic liveness probes
//!
//! Whichever pump stops first closes the connection, which in turn stops
//! the other one.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::AppError;
use crate::message::Envelope;
use crate::room::{Member, Room};
use crate::types::ClientId;

/// Display name used when a client does not pick one
pub const ANONYMOUS_NAME: &str = "anon";

/// Session lifecycle
///
/// Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Join request not yet accepted
    Connecting,
    /// Both pumps running
    Active,
    /// A pump stopped and teardown started
    Draining,
    /// Connection closed
    Closed,
}

/// State shared by the two pumps of a session
pub struct Client {
    /// Unique identifier for this session
    pub id: ClientId,
    /// Display name, fixed at connect time
    pub name: String,
    room: Room,
    connection: Arc<dyn Connection>,
    config: Config,
    state: Mutex<SessionState>,
}

impl Client {
    fn new(room: Room, name: String, connection: Arc<dyn Connection>, config: &Config) -> Self {
        let name = if name.trim().is_empty() {
            ANONYMOUS_NAME.to_string()
        } else {
            name
        };
        Self {
            id: ClientId::new(),
            name,
            room,
            connection,
            config: config.clone(),
            state: Mutex::new(SessionState::Connecting),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if next > *state {
            *state = next;
        }
    }

    /// Inbound pump: connection → room inbox
    async fn read_pump(self: Arc<Self>) {
        self.connection
            .set_read_deadline(Instant::now() + self.config.pong_wait);

        loop {
            let payload = match self.connection.read().await {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(client = %self.id, "read ended: {}", e);
                    break;
                }
            };

            let content = String::from_utf8_lossy(&payload).into_owned();
            let envelope =
                Envelope::message(self.name.clone(), content, self.config.max_message_size);

            match time::timeout(self.config.submit_timeout, self.room.submit(envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    debug!(client = %self.id, room = %self.room.id(), "room closed, ending read pump");
                    break;
                }
                Err(_) => {
                    warn!(client = %self.id, room = %self.room.id(), "room inbox saturated, dropping message");
                }
            }
        }

        self.advance(SessionState::Draining);
        self.room.leave(self.id).await;
        self.finish().await;
        debug!(client = %self.id, "read pump ended");
    }

    /// Outbound pump: outbox → connection, plus liveness probes
    async fn write_pump(self: Arc<Self>, mut outbox: mpsc::Receiver<Envelope>) {
        let period = self.config.ping_period;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                next = outbox.recv() => {
                    let Some(envelope) = next else {
                        debug!(client = %self.id, "outbox closed by room");
                        break;
                    };
                    let frame = match envelope.to_json() {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!("Failed to serialize envelope: {}", e);
                            continue;
                        }
                    };
                    let deadline = Instant::now() + self.config.write_wait;
                    if let Err(e) = self.connection.write(frame, deadline).await {
                        debug!(client = %self.id, "write failed: {}", e);
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let deadline = Instant::now() + self.config.write_wait;
                    if let Err(e) = self.connection.send_liveness_probe(deadline).await {
                        debug!(client = %self.id, "liveness probe failed: {}", e);
                        break;
                    }
                }
            }
        }

        self.advance(SessionState::Draining);
        self.finish().await;
        debug!(client = %self.id, "write pump ended");
    }

    async fn finish(&self) {
        if let Err(e) = self.connection.close().await {
            debug!(client = %self.id, "close failed: {}", e);
        }
        self.advance(SessionState::Closed);
    }
}

/// A running session
pub struct Session {
    client: Arc<Client>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    pub fn id(&self) -> ClientId {
        self.client.id
    }

    pub fn name(&self) -> &str {
        &self.client.name
    }

    pub fn state(&self) -> SessionState {
        self.client.state()
    }

    /// Wait for both pumps to finish
    pub async fn wait(self) {
        let (reader, writer) = tokio::join!(self.reader, self.writer);
        for result in [reader, writer] {
            if let Err(e) = result {
                error!(client = %self.client.id, "pump task failed: {}", e);
            }
        }
    }
}

/// Join `room` over `connection` and start both pumps
///
/// An empty name is replaced by `"anon"`. Fails with `RoomNotFound` if the
/// room is already closing.
pub async fn join_room(
    room: &Room,
    name: String,
    connection: Arc<dyn Connection>,
    config: &Config,
) -> Result<Session, AppError> {
    let client = Arc::new(Client::new(room.clone(), name, connection, config));
    let (outbox_tx, outbox_rx) = mpsc::channel(config.outbox_capacity);
    let member = Member::new(
        client.id,
        client.name.clone(),
        outbox_tx,
        Arc::clone(&client.connection),
    );

    if room.join(member).await.is_err() {
        return Err(AppError::RoomNotFound(room.id().to_string()));
    }
    client.advance(SessionState::Active);
    info!(client = %client.id, room = %room.id(), name = %client.name, "session started");

    let writer = tokio::spawn(Arc::clone(&client).write_pump(outbox_rx));
    let reader = tokio::spawn(Arc::clone(&client).read_pump());

    Ok(Session {
        client,
        reader,
        writer,
    })
}
