//! Delivery tracking for sent data frames.
//!
//! Every data frame handed to the radio gets a [`PendingSend`] entry keyed by
//! its [`SendHandle`]. The tracker never performs I/O: it queues
//! [`TrackerEvent`]s (transmit this frame, delivered, failed) which the
//! session core drains with [`DeliveryTracker::poll_event`].
//!
//! ```text
//! AwaitingTransmitResult --ok--> AwaitingAck --ack--> Delivered
//!          |                          |
//!      fail/timeout               deadline
//!          v                          v
//!    RetryScheduled <-----------------+  (or Failed once attempts run out)
//!          |
//!      deadline --> AwaitingTransmitResult
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace, warn};

use crate::framing::{Frame, FrameCodec};
use crate::{LinkError, PeerAddress, MAX_TIMEOUT};

/// Identity of one outstanding send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SendHandle {
    pub destination: PeerAddress,
    pub sequence: u16,
}

impl SendHandle {
    pub fn new(destination: PeerAddress, sequence: u16) -> Self {
        Self { destination, sequence }
    }
}

impl fmt::Display for SendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.destination, self.sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    AwaitingTransmitResult,
    RetryScheduled,
    AwaitingAck,
    Delivered,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub ack_timeout: Duration,
    pub transmit_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        crate::LinkConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Delay before the next transmission once `attempts` transmissions failed.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Transmit { handle: SendHandle, frame: Bytes },
    Delivered(SendHandle),
    Failed(SendHandle),
}

#[derive(Debug)]
struct PendingSend {
    frame: Bytes,
    attempts: u32,
    deadline: Instant,
    state: SendState,
}

pub struct DeliveryTracker {
    policy: RetryPolicy,
    codec: FrameCodec,
    pending: BTreeMap<SendHandle, PendingSend>,
    events: VecDeque<TrackerEvent>,
}

impl DeliveryTracker {
    pub fn new(policy: RetryPolicy, codec: FrameCodec) -> Self {
        Self {
            policy,
            codec,
            pending: BTreeMap::new(),
            events: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start tracking `frame` and queue its first transmission.
    ///
    /// The caller numbers the frame; use [`Self::next_free_sequence`] to pick
    /// a sequence that is not already pending for `destination`.
    pub fn register(&mut self, destination: PeerAddress, frame: Frame, now: Instant) -> Result<u16, LinkError> {
        let handle = SendHandle::new(destination, frame.sequence);
        if self.pending.contains_key(&handle) {
            return Err(LinkError::AlreadyPending(handle));
        }
        let bytes = self.codec.encode_frame(&frame)?;

        self.pending.insert(
            handle,
            PendingSend {
                frame: bytes.clone(),
                attempts: 1,
                deadline: later(now, self.policy.transmit_timeout),
                state: SendState::AwaitingTransmitResult,
            },
        );
        trace!("Tracking {} ({} bytes)", handle, bytes.len());
        self.events.push_back(TrackerEvent::Transmit { handle, frame: bytes });
        Ok(frame.sequence)
    }

    /// First sequence at or after `candidate` that is not pending for `destination`.
    pub fn next_free_sequence(&self, destination: PeerAddress, candidate: u16) -> Option<u16> {
        let mut sequence = candidate;
        for _ in 0..=u16::MAX as u32 {
            if !self.pending.contains_key(&SendHandle::new(destination, sequence)) {
                return Some(sequence);
            }
            sequence = sequence.wrapping_add(1);
        }
        None
    }

    pub fn on_transmit_result(&mut self, handle: SendHandle, success: bool, now: Instant) {
        let Some(entry) = self.pending.get_mut(&handle) else {
            trace!("Transmit result for untracked {}", handle);
            return;
        };
        if entry.state != SendState::AwaitingTransmitResult {
            trace!("Ignoring transmit result for {} in state {:?}", handle, entry.state);
            return;
        }

        if success {
            entry.state = SendState::AwaitingAck;
            entry.deadline = later(now, self.policy.ack_timeout);
            debug!("{} on air (attempt {}), awaiting ack", handle, entry.attempts);
        } else {
            debug!("{} transmit failed (attempt {})", handle, entry.attempts);
            self.retry_or_fail(handle, now);
        }
    }

    pub fn on_ack(&mut self, handle: SendHandle) {
        match self.pending.remove(&handle) {
            Some(entry) => {
                debug!("{} delivered after {} attempt(s)", handle, entry.attempts);
                self.events.push_back(TrackerEvent::Delivered(handle));
            }
            None => trace!("Unmatched ack for {}", handle),
        }
    }

    pub fn poll_timeouts(&mut self, now: Instant) {
        let expired: Vec<(SendHandle, SendState)> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(handle, entry)| (*handle, entry.state))
            .collect();

        for (handle, state) in expired {
            match state {
                SendState::RetryScheduled => self.retransmit(handle, now),
                SendState::AwaitingAck => {
                    debug!("{} ack timed out", handle);
                    self.retry_or_fail(handle, now);
                }
                SendState::AwaitingTransmitResult => {
                    warn!("{} transmit result never arrived", handle);
                    self.retry_or_fail(handle, now);
                }
                SendState::Delivered | SendState::Failed => {}
            }
        }
    }

    /// Drop a pending send without notifying anyone.
    pub fn cancel(&mut self, handle: SendHandle) -> bool {
        let removed = self.pending.remove(&handle).is_some();
        if removed {
            debug!("{} cancelled", handle);
        }
        removed
    }

    pub fn poll_event(&mut self) -> Option<TrackerEvent> {
        self.events.pop_front()
    }

    pub fn state(&self, handle: SendHandle) -> Option<SendState> {
        self.pending.get(&handle).map(|entry| entry.state)
    }

    pub fn attempts(&self, handle: SendHandle) -> Option<u32> {
        self.pending.get(&handle).map(|entry| entry.attempts)
    }

    pub fn deadline(&self, handle: SendHandle) -> Option<Instant> {
        self.pending.get(&handle).map(|entry| entry.deadline)
    }

    pub fn is_pending(&self, handle: SendHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn retry_or_fail(&mut self, handle: SendHandle, now: Instant) {
        let Some(entry) = self.pending.get_mut(&handle) else {
            return;
        };
        if entry.attempts < self.policy.max_attempts {
            let delay = self.policy.backoff(entry.attempts);
            entry.state = SendState::RetryScheduled;
            entry.deadline = later(now, delay);
            debug!("{} retry scheduled in {:?}", handle, delay);
        } else {
            let attempts = entry.attempts;
            self.pending.remove(&handle);
            warn!("{} failed after {} attempts", handle, attempts);
            self.events.push_back(TrackerEvent::Failed(handle));
        }
    }

    fn retransmit(&mut self, handle: SendHandle, now: Instant) {
        let Some(entry) = self.pending.get_mut(&handle) else {
            return;
        };
        entry.attempts += 1;
        entry.state = SendState::AwaitingTransmitResult;
        entry.deadline = later(now, self.policy.transmit_timeout);
        debug!("Retransmitting {} (attempt {})", handle, entry.attempts);
        self.events.push_back(TrackerEvent::Transmit {
            handle,
            frame: entry.frame.clone(),
        });
    }
}

// deadlines never overflow, whatever the policy says
fn later(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay.min(MAX_TIMEOUT)).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: PeerAddress = PeerAddress::new([0xC8, 0xC9, 0xA3, 0xC5, 0xFA, 0x98]);

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
            ack_timeout: Duration::from_millis(200),
            transmit_timeout: Duration::from_secs(1),
        }
    }

    fn tracker() -> DeliveryTracker {
        DeliveryTracker::new(policy(), FrameCodec::default())
    }

    fn drain(tracker: &mut DeliveryTracker) -> Vec<TrackerEvent> {
        std::iter::from_fn(|| tracker.poll_event()).collect()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_register_queues_first_transmission() {
        let mut tracker = tracker();
        let now = Instant::now();
        let seq = tracker.register(PEER, Frame::data(3, &b"HELLO"[..]), now).unwrap();
        assert_eq!(seq, 3);

        let handle = SendHandle::new(PEER, 3);
        assert_eq!(tracker.state(handle), Some(SendState::AwaitingTransmitResult));
        assert_eq!(tracker.attempts(handle), Some(1));
        match drain(&mut tracker).as_slice() {
            [TrackerEvent::Transmit { handle: h, frame }] => {
                assert_eq!(*h, handle);
                assert_eq!(frame.len(), crate::HEADER_LEN + 5);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.register(PEER, Frame::data(1, &b"a"[..]), now).unwrap();
        assert!(matches!(
            tracker.register(PEER, Frame::data(1, &b"b"[..]), now),
            Err(LinkError::AlreadyPending(_))
        ));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut tracker = tracker();
        let payload = vec![0u8; 300];
        assert!(matches!(
            tracker.register(PEER, Frame::data(1, payload), Instant::now()),
            Err(LinkError::PayloadTooLarge { .. })
        ));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_failures_retry_with_growing_backoff_then_deliver() {
        let mut tracker = tracker();
        let mut now = Instant::now();
        tracker.register(PEER, Frame::data(1, &b"abc"[..]), now).unwrap();
        let handle = SendHandle::new(PEER, 1);
        drain(&mut tracker);

        let mut retry_gaps = Vec::new();
        for _ in 0..3 {
            tracker.on_transmit_result(handle, false, now);
            assert_eq!(tracker.state(handle), Some(SendState::RetryScheduled));
            let deadline = tracker.deadline(handle).unwrap();
            retry_gaps.push(deadline - now);

            // nothing happens before the deadline
            tracker.poll_timeouts(deadline - Duration::from_millis(1));
            assert!(drain(&mut tracker).is_empty());

            now = deadline;
            tracker.poll_timeouts(now);
            assert!(matches!(
                drain(&mut tracker).as_slice(),
                [TrackerEvent::Transmit { .. }]
            ));
        }
        assert!(retry_gaps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(tracker.attempts(handle), Some(4));

        tracker.on_transmit_result(handle, true, now);
        assert_eq!(tracker.state(handle), Some(SendState::AwaitingAck));

        tracker.on_ack(handle);
        tracker.on_ack(handle);
        assert_eq!(drain(&mut tracker), vec![TrackerEvent::Delivered(handle)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_exhausted_attempts_fail_exactly_once() {
        let mut tracker = tracker();
        let mut now = Instant::now();
        tracker.register(PEER, Frame::data(1, &b"xyz"[..]), now).unwrap();
        let handle = SendHandle::new(PEER, 1);

        let mut transmissions = 0;
        let mut failures = 0;
        for _ in 0..20 {
            for event in drain(&mut tracker) {
                match event {
                    TrackerEvent::Transmit { .. } => transmissions += 1,
                    TrackerEvent::Failed(h) => {
                        assert_eq!(h, handle);
                        failures += 1;
                    }
                    TrackerEvent::Delivered(_) => panic!("unexpected delivery"),
                }
            }
            tracker.on_transmit_result(handle, false, now);
            now += Duration::from_secs(1);
            tracker.poll_timeouts(now);
        }
        for event in drain(&mut tracker) {
            if let TrackerEvent::Failed(_) = event {
                failures += 1;
            }
        }

        assert_eq!(transmissions, 5);
        assert_eq!(failures, 1);
        assert!(!tracker.is_pending(handle));
    }

    #[test]
    fn test_ack_timeout_retransmits() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.register(PEER, Frame::data(2, &b"x"[..]), now).unwrap();
        let handle = SendHandle::new(PEER, 2);
        drain(&mut tracker);

        tracker.on_transmit_result(handle, true, now);
        let ack_deadline = tracker.deadline(handle).unwrap();
        assert_eq!(ack_deadline - now, Duration::from_millis(200));

        tracker.poll_timeouts(ack_deadline);
        assert_eq!(tracker.state(handle), Some(SendState::RetryScheduled));

        let retry_at = tracker.deadline(handle).unwrap();
        tracker.poll_timeouts(retry_at);
        assert_eq!(tracker.attempts(handle), Some(2));
        assert!(matches!(drain(&mut tracker).as_slice(), [TrackerEvent::Transmit { .. }]));
    }

    #[test]
    fn test_missing_transmit_result_counts_as_failure() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.register(PEER, Frame::data(1, &b"x"[..]), now).unwrap();
        let handle = SendHandle::new(PEER, 1);

        tracker.poll_timeouts(now + Duration::from_secs(1));
        assert_eq!(tracker.state(handle), Some(SendState::RetryScheduled));
    }

    #[test]
    fn test_unmatched_ack_is_noop() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.register(PEER, Frame::data(1, &b"x"[..]), now).unwrap();
        drain(&mut tracker);

        tracker.on_ack(SendHandle::new(PEER, 99));
        tracker.on_ack(SendHandle::new(PeerAddress::new([0; 6]), 1));
        assert!(drain(&mut tracker).is_empty());
        assert_eq!(tracker.state(SendHandle::new(PEER, 1)), Some(SendState::AwaitingTransmitResult));
    }

    #[test]
    fn test_cancel_suppresses_retries() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.register(PEER, Frame::data(1, &b"x"[..]), now).unwrap();
        let handle = SendHandle::new(PEER, 1);
        drain(&mut tracker);

        tracker.on_transmit_result(handle, false, now);
        assert!(tracker.cancel(handle));
        assert!(!tracker.cancel(handle));

        tracker.poll_timeouts(now + Duration::from_secs(10));
        tracker.on_transmit_result(handle, false, now);
        assert!(drain(&mut tracker).is_empty());
    }

    #[test]
    fn test_oversized_policy_does_not_overflow() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::MAX,
            max_backoff: Duration::MAX,
            ack_timeout: Duration::MAX,
            transmit_timeout: Duration::MAX,
        };
        let mut tracker = DeliveryTracker::new(policy, FrameCodec::default());
        let now = Instant::now();
        tracker.register(PEER, Frame::data(1, &b"x"[..]), now).unwrap();
        let handle = SendHandle::new(PEER, 1);
        assert!(tracker.deadline(handle).unwrap() <= now + MAX_TIMEOUT);

        tracker.on_transmit_result(handle, true, now);
        assert!(tracker.deadline(handle).unwrap() <= now + MAX_TIMEOUT);
        tracker.poll_timeouts(now + MAX_TIMEOUT);
        assert_eq!(tracker.state(handle), Some(SendState::RetryScheduled));
    }

    #[test]
    fn test_next_free_sequence_skips_pending() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.register(PEER, Frame::data(u16::MAX, &b"x"[..]), now).unwrap();
        tracker.register(PEER, Frame::data(0, &b"y"[..]), now).unwrap();

        assert_eq!(tracker.next_free_sequence(PEER, u16::MAX), Some(1));
        assert_eq!(tracker.next_free_sequence(PEER, 5), Some(5));
        let other = PeerAddress::new([1; 6]);
        assert_eq!(tracker.next_free_sequence(other, u16::MAX), Some(u16::MAX));
    }
}
