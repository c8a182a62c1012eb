//! Glue between the session core and a radio driver.
//!
//! Radio drivers report transmit completion as `(peer, status)` from their
//! own callback context, in transmission order per peer. The adapter keeps a
//! FIFO of outstanding tokens per peer to turn those callbacks back into the
//! frame they belong to. A token whose completion is overdue stays in the
//! FIFO as a tombstone so a late completion still lines up with its own
//! frame. [`DriverSink`] is what driver callbacks hold: it only ever
//! `try_send`s into the runtime's bounded driver queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, trace, warn};
use tokio::sync::mpsc;

use crate::session::Outgoing;
use crate::tracker::SendHandle;
use crate::{DriverError, PeerAddress};

/// Tombstones older than this many transmit timeouts are dropped for good.
const TOMBSTONE_LIFETIME: u32 = 10;

/// What a frame handed to the radio was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxToken {
    Data(SendHandle),
    Ack(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    SendComplete { peer: PeerAddress, success: bool },
    Received { source: PeerAddress, data: Bytes },
}

/// Radio driver capability consumed by the link.
#[async_trait]
pub trait RadioDriver: Send {
    async fn add_peer(&mut self, address: PeerAddress) -> Result<(), DriverError>;

    /// Queue a frame for transmission. Completion is reported later through
    /// the [`DriverSink`]; an error here means the frame never went out.
    async fn transmit(&mut self, destination: PeerAddress, frame: &[u8]) -> Result<(), DriverError>;
}

/// Callback-side handle into the link's event queue. Never blocks.
#[derive(Clone, Debug)]
pub struct DriverSink {
    tx: mpsc::Sender<DriverEvent>,
}

impl DriverSink {
    pub(crate) fn new(tx: mpsc::Sender<DriverEvent>) -> Self {
        Self { tx }
    }

    pub fn send_complete(&self, peer: PeerAddress, success: bool) -> bool {
        self.push(DriverEvent::SendComplete { peer, success })
    }

    pub fn received(&self, source: PeerAddress, data: &[u8]) -> bool {
        self.push(DriverEvent::Received {
            source,
            data: Bytes::copy_from_slice(data),
        })
    }

    fn push(&self, event: DriverEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Link driver queue full, dropping {:?}", event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Link driver queue closed, dropping driver event");
                false
            }
        }
    }
}

#[derive(Debug)]
struct InFlight {
    token: TxToken,
    sent_at: Instant,
    overdue: bool,
}

pub struct TransportAdapter<D> {
    driver: D,
    registered: HashSet<PeerAddress>,
    in_flight: HashMap<PeerAddress, VecDeque<InFlight>>,
}

impl<D: RadioDriver> TransportAdapter<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            registered: HashSet::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub async fn register_peer_at_driver(&mut self, address: PeerAddress) -> Result<(), DriverError> {
        if self.registered.contains(&address) {
            return Ok(());
        }
        self.driver.add_peer(address).await.map_err(|e| {
            error!("Driver refused peer {}: {}", address, e);
            e
        })?;
        debug!("Peer {} added to driver", address);
        self.registered.insert(address);
        Ok(())
    }

    /// Push a frame to the driver. Returns a failed transmit result when a
    /// data frame could not be handed over at all.
    pub async fn transmit(&mut self, out: Outgoing) -> Option<(SendHandle, bool)> {
        let Outgoing { destination, token, frame } = out;

        if let Err(e) = self.register_peer_at_driver(destination).await {
            warn!("Cannot transmit {:?} to {}: {}", token, destination, e);
            return Self::immediate_failure(token);
        }

        let queue = self.in_flight.entry(destination).or_default();
        queue.push_back(InFlight {
            token,
            sent_at: Instant::now(),
            overdue: false,
        });
        trace!("Transmitting {:?} to {} ({} bytes)", token, destination, frame.len());

        match self.driver.transmit(destination, &frame).await {
            Ok(()) => None,
            Err(e) => {
                if let Some(queue) = self.in_flight.get_mut(&destination) {
                    queue.pop_back();
                }
                warn!("Driver rejected {:?} to {}: {}", token, destination, e);
                Self::immediate_failure(token)
            }
        }
    }

    /// Map a driver send-complete callback to the frame it completes.
    pub fn on_send_complete(&mut self, peer: PeerAddress, success: bool) -> Option<(SendHandle, bool)> {
        let Some(entry) = self.in_flight.get_mut(&peer).and_then(|q| q.pop_front()) else {
            warn!("Send-complete from {} with nothing in flight", peer);
            return None;
        };
        if entry.overdue {
            debug!("Late send-complete for {:?} to {} absorbed", entry.token, peer);
            return None;
        }
        match entry.token {
            TxToken::Data(handle) => Some((handle, success)),
            TxToken::Ack(sequence) => {
                if !success {
                    debug!("Ack #{} to {} was not delivered", sequence, peer);
                }
                None
            }
        }
    }

    /// Mark tokens older than `max_age` as overdue and return how many were
    /// newly marked. An overdue token no longer maps to its frame but still
    /// absorbs one late completion, so the tokens behind it keep their
    /// alignment. Tombstones that outlive `TOMBSTONE_LIFETIME` timeouts are
    /// dropped.
    pub fn expire_stale(&mut self, now: Instant, max_age: Duration) -> usize {
        let horizon = max_age.saturating_mul(TOMBSTONE_LIFETIME);
        let mut expired = 0;
        for (peer, queue) in self.in_flight.iter_mut() {
            while queue
                .front()
                .is_some_and(|e| e.overdue && now.saturating_duration_since(e.sent_at) >= horizon)
            {
                queue.pop_front();
            }
            for entry in queue.iter_mut() {
                if now.saturating_duration_since(entry.sent_at) < max_age {
                    break;
                }
                if !entry.overdue {
                    warn!("No send-complete for {:?} to {} yet, marking it overdue", entry.token, peer);
                    entry.overdue = true;
                    expired += 1;
                }
            }
        }
        self.in_flight.retain(|_, queue| !queue.is_empty());
        expired
    }

    /// Tokens for `peer` still waiting on their completion.
    pub fn in_flight(&self, peer: PeerAddress) -> usize {
        self.in_flight
            .get(&peer)
            .map_or(0, |queue| queue.iter().filter(|e| !e.overdue).count())
    }

    fn immediate_failure(token: TxToken) -> Option<(SendHandle, bool)> {
        match token {
            TxToken::Data(handle) => Some((handle, false)),
            TxToken::Ack(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: PeerAddress = PeerAddress::new([0xC8, 0xC9, 0xA3, 0xC5, 0xFA, 0x98]);

    #[derive(Default)]
    struct MockDriver {
        peers: Vec<PeerAddress>,
        sent: Vec<(PeerAddress, Vec<u8>)>,
        reject_transmit: bool,
        reject_peers: bool,
    }

    #[async_trait]
    impl RadioDriver for MockDriver {
        async fn add_peer(&mut self, address: PeerAddress) -> Result<(), DriverError> {
            if self.reject_peers {
                return Err(DriverError::PeerTableFull);
            }
            self.peers.push(address);
            Ok(())
        }

        async fn transmit(&mut self, destination: PeerAddress, frame: &[u8]) -> Result<(), DriverError> {
            if self.reject_transmit {
                return Err(DriverError::Unavailable);
            }
            self.sent.push((destination, frame.to_vec()));
            Ok(())
        }
    }

    fn data(sequence: u16) -> Outgoing {
        Outgoing {
            destination: PEER,
            token: TxToken::Data(SendHandle::new(PEER, sequence)),
            frame: Bytes::from_static(b"frame"),
        }
    }

    fn ack(sequence: u16) -> Outgoing {
        Outgoing {
            destination: PEER,
            token: TxToken::Ack(sequence),
            frame: Bytes::from_static(b"ack"),
        }
    }

    #[tokio::test]
    async fn test_peer_registered_once() {
        let mut adapter = TransportAdapter::new(MockDriver::default());
        tokio_test::assert_ok!(adapter.register_peer_at_driver(PEER).await);
        tokio_test::assert_ok!(adapter.register_peer_at_driver(PEER).await);
        assert!(adapter.transmit(data(1)).await.is_none());
        assert_eq!(adapter.driver().peers, vec![PEER]);
        assert_eq!(adapter.driver().sent.len(), 1);
    }

    #[tokio::test]
    async fn test_completions_follow_transmission_order() {
        let mut adapter = TransportAdapter::new(MockDriver::default());
        adapter.transmit(data(1)).await;
        adapter.transmit(ack(7)).await;
        adapter.transmit(data(2)).await;
        assert_eq!(adapter.in_flight(PEER), 3);

        assert_eq!(adapter.on_send_complete(PEER, false), Some((SendHandle::new(PEER, 1), false)));
        assert_eq!(adapter.on_send_complete(PEER, true), None);
        assert_eq!(adapter.on_send_complete(PEER, true), Some((SendHandle::new(PEER, 2), true)));
        assert_eq!(adapter.on_send_complete(PEER, true), None);
    }

    #[tokio::test]
    async fn test_driver_rejection_is_immediate_failure() {
        let driver = MockDriver {
            reject_transmit: true,
            ..Default::default()
        };
        let mut adapter = TransportAdapter::new(driver);
        assert_eq!(adapter.transmit(data(4)).await, Some((SendHandle::new(PEER, 4), false)));
        assert_eq!(adapter.transmit(ack(4)).await, None);
        assert_eq!(adapter.in_flight(PEER), 0);
    }

    #[tokio::test]
    async fn test_peer_table_full_fails_data() {
        let driver = MockDriver {
            reject_peers: true,
            ..Default::default()
        };
        let mut adapter = TransportAdapter::new(driver);
        let err = tokio_test::assert_err!(adapter.register_peer_at_driver(PEER).await);
        assert_eq!(err, DriverError::PeerTableFull);
        assert_eq!(adapter.transmit(data(1)).await, Some((SendHandle::new(PEER, 1), false)));
    }

    #[tokio::test]
    async fn test_expire_stale_tokens() {
        let mut adapter = TransportAdapter::new(MockDriver::default());
        adapter.transmit(data(1)).await;
        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(adapter.expire_stale(later, Duration::from_secs(1)), 1);
        assert_eq!(adapter.in_flight(PEER), 0);
        assert_eq!(adapter.on_send_complete(PEER, true), None);
    }

    #[tokio::test]
    async fn test_late_completion_does_not_shift_later_frames() {
        let mut adapter = TransportAdapter::new(MockDriver::default());
        adapter.transmit(data(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        adapter.transmit(data(2)).await;

        assert_eq!(adapter.expire_stale(Instant::now(), Duration::from_millis(30)), 1);
        assert_eq!(adapter.in_flight(PEER), 1);

        // the overdue completion of #1 finally shows up
        assert_eq!(adapter.on_send_complete(PEER, false), None);
        assert_eq!(adapter.on_send_complete(PEER, true), Some((SendHandle::new(PEER, 2), true)));
    }

    #[tokio::test]
    async fn test_old_tombstones_are_dropped() {
        let mut adapter = TransportAdapter::new(MockDriver::default());
        adapter.transmit(data(1)).await;
        let max_age = Duration::from_secs(1);
        let now = Instant::now();

        assert_eq!(adapter.expire_stale(now + Duration::from_secs(2), max_age), 1);
        assert_eq!(adapter.expire_stale(now + Duration::from_secs(3), max_age), 0);
        assert_eq!(adapter.expire_stale(now + Duration::from_secs(60), max_age), 0);

        adapter.transmit(data(2)).await;
        assert_eq!(adapter.on_send_complete(PEER, true), Some((SendHandle::new(PEER, 2), true)));
    }

    #[tokio::test]
    async fn test_sink_drops_when_queue_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = DriverSink::new(tx);
        assert!(sink.send_complete(PEER, true));
        assert!(!sink.received(PEER, b"dropped"));

        match rx.recv().await {
            Some(DriverEvent::SendComplete { peer, success }) => {
                assert_eq!(peer, PEER);
                assert!(success);
            }
            _ => panic!("expected send-complete"),
        }
    }
}
