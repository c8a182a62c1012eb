//! reliable datagram delivery over a point-to-point radio link

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod address;
pub mod adapter;
pub mod framing;
pub mod link;
pub mod session;
pub mod simulated;
pub mod tracker;

pub use address::PeerAddress;
pub use adapter::{DriverEvent, DriverSink, RadioDriver, TransportAdapter, TxToken};
pub use framing::{Frame, FrameCodec, FrameKind, HEADER_LEN};
pub use link::{Link, LinkHandle};
pub use session::{Handlers, Outgoing, SessionCore, SessionStats};
pub use simulated::{AirStats, SimulatedAir, SimulatedRadio};
pub use tracker::{DeliveryTracker, RetryPolicy, SendHandle, SendState, TrackerEvent};

/// Longest timeout or backoff the link accepts.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("payload of {len} bytes exceeds the {max} bytes a frame can carry")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("radio transmission failed")]
    TransmitFailure,

    #[error("delivery of {0} failed after all attempts")]
    DeliveryFailed(SendHandle),

    #[error("peer {0} is not registered")]
    UnknownPeer(PeerAddress),

    #[error("{0} is already pending")]
    AlreadyPending(SendHandle),

    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("radio driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("link runtime is not running")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("packet too large for radio MTU")]
    PacketTooLarge,

    #[error("peer is not in the driver peer table")]
    UnknownPeer,

    #[error("driver peer table is full")]
    PeerTableFull,

    #[error("driver queue is full")]
    QueueFull,

    #[error("radio is unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Largest frame the radio carries, header included.
    pub mtu: usize,
    pub ack_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    /// How long to wait for the driver's send-complete callback.
    pub transmit_timeout: Duration,
    pub duplicate_window: usize,
    pub event_queue_capacity: usize,
    pub tick: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mtu: framing::DEFAULT_MTU,
            ack_timeout: Duration::from_millis(200),
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            max_attempts: 5,
            transmit_timeout: Duration::from_secs(1),
            duplicate_window: 32,
            event_queue_capacity: 256,
            tick: Duration::from_millis(10),
        }
    }
}

/// Channel model for the simulated radio medium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    pub mtu: usize,
    pub bandwidth_bps: u32,
    pub packet_loss: f32,
    pub latency: Duration,
    pub latency_jitter: Duration,
    pub peer_table_capacity: usize,
    pub tx_queue_capacity: usize,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            mtu: framing::DEFAULT_MTU,
            bandwidth_bps: 1_000_000,
            packet_loss: 0.05,
            latency: Duration::from_millis(5),
            latency_jitter: Duration::from_millis(2),
            peer_table_capacity: 20,
            tx_queue_capacity: 64,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.mtu <= HEADER_LEN {
            return Err(LinkError::InvalidConfig(format!(
                "mtu {} leaves no room after the {}-byte header",
                self.mtu, HEADER_LEN
            )));
        }
        if self.max_attempts == 0 {
            return Err(LinkError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.duplicate_window == 0 || self.event_queue_capacity == 0 {
            return Err(LinkError::InvalidConfig(
                "duplicate_window and event_queue_capacity must be non-zero".into(),
            ));
        }
        if self.tick.is_zero() || self.transmit_timeout.is_zero() {
            return Err(LinkError::InvalidConfig(
                "tick and transmit_timeout must be non-zero".into(),
            ));
        }
        let timings = [
            ("ack_timeout", self.ack_timeout),
            ("base_backoff", self.base_backoff),
            ("max_backoff", self.max_backoff),
            ("transmit_timeout", self.transmit_timeout),
            ("tick", self.tick),
        ];
        if let Some((name, value)) = timings.iter().find(|(_, value)| *value > MAX_TIMEOUT) {
            return Err(LinkError::InvalidConfig(format!(
                "{} {:?} exceeds the {:?} limit",
                name, value, MAX_TIMEOUT
            )));
        }
        if self.max_backoff < self.base_backoff {
            return Err(LinkError::InvalidConfig("max_backoff is below base_backoff".into()));
        }
        let min_timeout = self.ack_timeout.min(self.base_backoff);
        if self.tick > min_timeout {
            return Err(LinkError::InvalidConfig(format!(
                "tick {:?} is coarser than the smallest retry timeout {:?}",
                self.tick, min_timeout
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
            ack_timeout: self.ack_timeout,
            transmit_timeout: self.transmit_timeout,
        }
    }
}
