//! Session core: peers, send requests, inbound dispatch and acknowledgments.
//!
//! The core is sans-I/O. Frames that must go on air are queued as
//! [`Outgoing`] and drained with [`SessionCore::poll_transmit`]; driver
//! feedback comes back through [`SessionCore::on_transmit_result`] and
//! [`SessionCore::on_raw_received`].

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info, trace, warn};

use crate::adapter::TxToken;
use crate::framing::{Frame, FrameCodec, FrameKind};
use crate::tracker::{DeliveryTracker, SendHandle, TrackerEvent};
use crate::{LinkConfig, LinkError, PeerAddress};

type DataCallback = Box<dyn FnMut(PeerAddress, Bytes) + Send>;
type OutcomeCallback = Box<dyn FnMut(SendHandle) + Send>;

/// Application callbacks.
#[derive(Default)]
pub struct Handlers {
    on_data: Option<DataCallback>,
    on_delivered: Option<OutcomeCallback>,
    on_failed: Option<OutcomeCallback>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: FnMut(PeerAddress, Bytes) + Send + 'static,
    {
        self.on_data = Some(Box::new(f));
        self
    }

    pub fn on_delivered<F>(mut self, f: F) -> Self
    where
        F: FnMut(SendHandle) + Send + 'static,
    {
        self.on_delivered = Some(Box::new(f));
        self
    }

    pub fn on_failed<F>(mut self, f: F) -> Self
    where
        F: FnMut(SendHandle) + Send + 'static,
    {
        self.on_failed = Some(Box::new(f));
        self
    }
}

/// A frame waiting to be pushed to the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub destination: PeerAddress,
    pub token: TxToken,
    pub frame: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub retransmissions: u64,
    pub acks_sent: u64,
    pub data_received: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub(crate) struct PeerSession {
    address: PeerAddress,
    pub(crate) next_sequence: u16,
    seen: VecDeque<u16>,
    window: usize,
}

impl PeerSession {
    fn new(address: PeerAddress, window: usize) -> Self {
        Self {
            address,
            // random start so a rebooted sender does not collide with our window
            next_sequence: rand::random(),
            seen: VecDeque::with_capacity(window),
            window,
        }
    }

    fn has_seen(&self, sequence: u16) -> bool {
        self.seen.contains(&sequence)
    }

    fn record(&mut self, sequence: u16) {
        if self.seen.len() == self.window {
            self.seen.pop_front();
        }
        self.seen.push_back(sequence);
    }
}

pub struct SessionCore {
    codec: FrameCodec,
    tracker: DeliveryTracker,
    peers: HashMap<PeerAddress, PeerSession>,
    handlers: Handlers,
    outbox: VecDeque<Outgoing>,
    duplicate_window: usize,
    stats: SessionStats,
}

impl SessionCore {
    pub fn new(config: &LinkConfig, handlers: Handlers) -> Self {
        let codec = FrameCodec::new(config.mtu);
        Self {
            codec,
            tracker: DeliveryTracker::new(config.retry_policy(), codec),
            peers: HashMap::new(),
            handlers,
            outbox: VecDeque::new(),
            duplicate_window: config.duplicate_window,
            stats: SessionStats::default(),
        }
    }

    /// Returns `true` when the peer was not known yet.
    pub fn register_peer(&mut self, address: PeerAddress) -> bool {
        if self.peers.contains_key(&address) {
            return false;
        }
        info!("Registered peer {}", address);
        self.peers
            .insert(address, PeerSession::new(address, self.duplicate_window));
        true
    }

    pub fn is_registered(&self, address: PeerAddress) -> bool {
        self.peers.contains_key(&address)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerAddress> {
        self.peers.keys()
    }

    pub fn send(&mut self, destination: PeerAddress, payload: Bytes, now: Instant) -> Result<SendHandle, LinkError> {
        let max = self.codec.max_payload();
        if payload.len() > max {
            return Err(LinkError::PayloadTooLarge { len: payload.len(), max });
        }
        let peer = self
            .peers
            .get_mut(&destination)
            .ok_or(LinkError::UnknownPeer(destination))?;

        let sequence = self
            .tracker
            .next_free_sequence(destination, peer.next_sequence)
            .ok_or(LinkError::AlreadyPending(SendHandle::new(destination, peer.next_sequence)))?;
        peer.next_sequence = sequence.wrapping_add(1);

        let len = payload.len();
        self.tracker.register(destination, Frame::data(sequence, payload), now)?;
        let handle = SendHandle::new(destination, sequence);
        debug!("Sending {} bytes as {}", len, handle);

        self.process_tracker_events();
        Ok(handle)
    }

    pub fn on_raw_received(&mut self, source: PeerAddress, bytes: &[u8]) {
        let frame = match self.codec.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.malformed += 1;
                warn!("Discarding frame from {} ({} bytes): {}", source, bytes.len(), e);
                return;
            }
        };
        trace!("Received {:?} #{} from {}", frame.kind, frame.sequence, source);

        match frame.kind {
            FrameKind::Data => self.on_data_frame(source, frame),
            FrameKind::Ack => {
                self.tracker.on_ack(SendHandle::new(source, frame.sequence));
                self.process_tracker_events();
            }
        }
    }

    pub fn on_transmit_result(&mut self, handle: SendHandle, success: bool, now: Instant) {
        self.tracker.on_transmit_result(handle, success, now);
        self.process_tracker_events();
    }

    pub fn poll_timeouts(&mut self, now: Instant) {
        self.tracker.poll_timeouts(now);
        self.process_tracker_events();
    }

    pub fn cancel(&mut self, handle: SendHandle) -> bool {
        let cancelled = self.tracker.cancel(handle);
        if cancelled {
            // drop a queued retransmission that has not reached the radio yet
            self.outbox.retain(|out| out.token != TxToken::Data(handle));
        }
        cancelled
    }

    pub fn poll_transmit(&mut self) -> Option<Outgoing> {
        self.outbox.pop_front()
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    fn on_data_frame(&mut self, source: PeerAddress, frame: Frame) {
        let window = self.duplicate_window;
        let peer = self.peers.entry(source).or_insert_with(|| {
            debug!("First frame from unregistered peer {}", source);
            PeerSession::new(source, window)
        });

        if peer.has_seen(frame.sequence) {
            self.stats.duplicates += 1;
            debug!("Duplicate #{} from {}, re-acking", frame.sequence, peer.address);
        } else {
            peer.record(frame.sequence);
            self.stats.data_received += 1;
            if let Some(on_data) = self.handlers.on_data.as_mut() {
                on_data(source, frame.payload);
            }
        }
        self.queue_ack(source, frame.sequence);
    }

    fn queue_ack(&mut self, destination: PeerAddress, sequence: u16) {
        match self.codec.encode(FrameKind::Ack, sequence, &[]) {
            Ok(frame) => {
                self.stats.acks_sent += 1;
                self.outbox.push_back(Outgoing {
                    destination,
                    token: TxToken::Ack(sequence),
                    frame,
                });
            }
            Err(e) => warn!("Could not build ack for {}#{}: {}", destination, sequence, e),
        }
    }

    fn process_tracker_events(&mut self) {
        while let Some(event) = self.tracker.poll_event() {
            match event {
                TrackerEvent::Transmit { handle, frame } => {
                    if self.tracker.attempts(handle).unwrap_or(1) > 1 {
                        self.stats.retransmissions += 1;
                    } else {
                        self.stats.frames_sent += 1;
                    }
                    self.outbox.push_back(Outgoing {
                        destination: handle.destination,
                        token: TxToken::Data(handle),
                        frame,
                    });
                }
                TrackerEvent::Delivered(handle) => {
                    self.stats.delivered += 1;
                    if let Some(on_delivered) = self.handlers.on_delivered.as_mut() {
                        on_delivered(handle);
                    }
                }
                TrackerEvent::Failed(handle) => {
                    self.stats.failed += 1;
                    warn!("{}", LinkError::DeliveryFailed(handle));
                    if let Some(on_failed) = self.handlers.on_failed.as_mut() {
                        on_failed(handle);
                    }
                }
            }
        }
    }
}
