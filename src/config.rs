//! Relay configuration
//!
//! Timing and capacity knobs shared by the hub, rooms, sessions and the
//! WebSocket transport.

use std::time::Duration;

use crate::error::AppError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Default room lifetime
pub const DEFAULT_ROOM_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Time allowed to write one frame to a peer
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between liveness acknowledgements from a peer
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Maximum inbound message size in bytes
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 5120;

/// Default capacity of a room inbox and of each member outbox
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address
    pub addr: String,
    /// Lifetime of rooms created through the network surface
    pub room_lifetime: Duration,
    /// Write deadline for a single frame
    pub write_wait: Duration,
    /// Idle read timeout, refreshed on every liveness acknowledgement
    pub pong_wait: Duration,
    /// Liveness probe interval, must be shorter than `pong_wait`
    pub ping_period: Duration,
    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
    /// Room inbox capacity
    pub inbox_capacity: usize,
    /// Per-member outbox capacity
    pub outbox_capacity: usize,
    /// How long an inbound pump waits on a saturated room inbox
    pub submit_timeout: Duration,
}

impl Config {
    /// Derive the probe interval from an idle timeout (9/10 of it)
    pub fn ping_period_for(pong_wait: Duration) -> Duration {
        pong_wait * 9 / 10
    }

    /// Set the idle timeout and re-derive the probe interval
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = Self::ping_period_for(pong_wait);
        self
    }

    /// Check invariants between fields
    pub fn validate(&self) -> Result<(), AppError> {
        if self.room_lifetime.is_zero() {
            return Err(AppError::Config("room lifetime must be positive".into()));
        }
        if self.ping_period.is_zero() || self.ping_period >= self.pong_wait {
            return Err(AppError::Config(format!(
                "ping period {:?} must be positive and shorter than pong wait {:?}",
                self.ping_period, self.pong_wait
            )));
        }
        if self.max_message_size == 0 {
            return Err(AppError::Config("max message size must be positive".into()));
        }
        if self.inbox_capacity == 0 || self.outbox_capacity == 0 {
            return Err(AppError::Config("queue capacities must be positive".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            room_lifetime: DEFAULT_ROOM_LIFETIME,
            write_wait: DEFAULT_WRITE_WAIT,
            pong_wait: DEFAULT_PONG_WAIT,
            ping_period: Self::ping_period_for(DEFAULT_PONG_WAIT),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            inbox_capacity: DEFAULT_QUEUE_CAPACITY,
            outbox_capacity: DEFAULT_QUEUE_CAPACITY,
            submit_timeout: DEFAULT_WRITE_WAIT,
        }
    }
}
