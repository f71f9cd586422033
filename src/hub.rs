//! Room registry
//!
//! Maps room ids to live rooms. Lookups take a read lock; creation and
//! removal take the write lock. Rooms remove their own entry as the last
//! step of shutdown.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::client::{self, Session};
use crate::config::Config;
use crate::connection::Connection;
use crate::error::AppError;
use crate::room::{Room, RoomDirectory};
use crate::types::RoomId;

/// How often `wait_empty` checks for remaining rooms
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Directory of live rooms
pub struct Hub {
    rooms: RwLock<HashMap<RoomId, Room>>,
    config: Config,
}

impl Hub {
    /// Create an empty hub
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create and start a room that closes itself after `lifetime`
    pub fn create_room(self: &Arc<Self>, lifetime: Duration) -> Room {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);

        // Generate unique room id
        let id = loop {
            let id = RoomId::generate();
            if !rooms.contains_key(&id) {
                break id;
            }
        };

        let directory = Arc::downgrade(self);
        let room = Room::spawn(id.clone(), lifetime, &self.config, directory);
        rooms.insert(id.clone(), room.clone());

        info!(room = %id, "room created");
        debug!("Total rooms: {}", rooms.len());
        room
    }

    /// Look up a live room
    ///
    /// Rooms that are already closing count as not found.
    pub fn get_room(&self, id: &RoomId) -> Option<Room> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .filter(|room| !room.is_closed())
            .cloned()
    }

    /// Remove a room entry; a no-op if it is already gone
    ///
    /// Called by rooms during their own shutdown.
    pub(crate) fn delete_room(&self, id: &RoomId) {
        let removed = self
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            debug!(room = %id, "room deregistered");
        }
    }

    /// Ask a room to shut down; returns false if it is unknown
    pub fn close_room(&self, id: &RoomId) -> bool {
        match self.get_room(id) {
            Some(room) => {
                room.close();
                true
            }
            None => false,
        }
    }

    /// Ask every room to shut down
    pub fn close_all(&self) {
        let rooms: Vec<Room> = self
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        info!("Closing {} rooms", rooms.len());
        for room in rooms {
            room.close();
        }
    }

    /// Number of registered rooms
    pub fn room_count(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait until every room has deregistered, giving up after `limit`
    ///
    /// Returns false if rooms were still registered at the deadline.
    pub async fn wait_empty(&self, limit: Duration) -> bool {
        let drained = async {
            while self.room_count() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }

    /// Join the room `room_id` as `name` over an established connection
    ///
    /// Starts the session's pumps on success.
    pub async fn join(
        &self,
        room_id: &RoomId,
        name: String,
        connection: Arc<dyn Connection>,
    ) -> Result<Session, AppError> {
        let room = self
            .get_room(room_id)
            .ok_or_else(|| AppError::RoomNotFound(room_id.to_string()))?;
        client::join_room(&room, name, connection, &self.config).await
    }
}

impl RoomDirectory for Hub {
    fn remove_room(&self, id: &RoomId) {
        self.delete_room(id);
    }
}
