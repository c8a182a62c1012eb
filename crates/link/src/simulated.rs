//! Simulated radio medium for testing

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace};
use rand::Rng;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;

use crate::adapter::{DriverSink, RadioDriver};
use crate::{DriverError, PeerAddress, RadioConfig};

struct AirPacket {
    from: PeerAddress,
    to: PeerAddress,
    frame: Bytes,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AirStats {
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_delivered: u64,
    pub bytes_sent: u64,
}

/// Shared medium every simulated station transmits into.
pub struct SimulatedAir {
    config: RadioConfig,
    stations: RwLock<HashMap<PeerAddress, DriverSink>>,
    stats: Mutex<AirStats>,
}

impl SimulatedAir {
    pub fn new(config: RadioConfig) -> Arc<Self> {
        info!("Simulated air initialized with config: {:?}", config);
        Arc::new(Self {
            config,
            stations: RwLock::new(HashMap::new()),
            stats: Mutex::new(AirStats::default()),
        })
    }

    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    /// Bring a station up at `address`. Its callbacks go to `sink`.
    pub async fn join(self: &Arc<Self>, address: PeerAddress, sink: DriverSink) -> SimulatedRadio {
        self.stations.write().await.insert(address, sink.clone());
        let (tx, rx) = mpsc::channel(self.config.tx_queue_capacity);
        tokio::spawn(transmitter(Arc::clone(self), sink, rx));
        debug!("Station {} joined the air", address);

        SimulatedRadio {
            address,
            air: Arc::clone(self),
            peers: HashSet::new(),
            tx,
        }
    }

    /// Take a station off the air; frames to it are no longer acknowledged.
    pub async fn leave(&self, address: PeerAddress) -> bool {
        let removed = self.stations.write().await.remove(&address).is_some();
        if removed {
            debug!("Station {} left the air", address);
        }
        removed
    }

    pub async fn get_stats(&self) -> AirStats {
        *self.stats.lock().await
    }

    /// Put one frame on air. Returns whether the destination acknowledged it
    /// at the MAC level.
    async fn carry(&self, packet: AirPacket) -> bool {
        let delay = {
            let airtime = Duration::from_secs_f64(
                (packet.frame.len() * 8) as f64 / self.config.bandwidth_bps.max(1) as f64,
            );
            let jitter_ms = self.config.latency_jitter.as_millis() as f64;
            let jitter = if jitter_ms > 0.0 {
                let mut rng = rand::rng();
                Duration::from_millis(rng.random_range(0.0..=jitter_ms) as u64)
            } else {
                Duration::ZERO
            };
            airtime + self.config.latency + jitter
        };
        sleep(delay).await;

        {
            let mut stats = self.stats.lock().await;
            stats.packets_sent += 1;
            stats.bytes_sent += packet.frame.len() as u64;
        }

        let loss_prob = loss_probability(self.config.packet_loss);
        let lost = loss_prob > 0.0 && rand::rng().random::<f64>() < loss_prob;
        if lost {
            self.stats.lock().await.packets_dropped += 1;
            debug!("Frame {} -> {} lost on air (p={:.3})", packet.from, packet.to, loss_prob);
            return false;
        }

        let stations = self.stations.read().await;
        match stations.get(&packet.to) {
            Some(sink) => {
                sink.received(packet.from, &packet.frame);
                self.stats.lock().await.packets_delivered += 1;
                trace!("Frame {} -> {} delivered ({} bytes)", packet.from, packet.to, packet.frame.len());
                true
            }
            None => {
                self.stats.lock().await.packets_dropped += 1;
                debug!("No station at {}, frame from {} unacknowledged", packet.to, packet.from);
                false
            }
        }
    }
}

// "bursty" loss: most frames see roughly the base rate, a few see much worse
fn loss_probability(base: f32) -> f64 {
    let base = base as f64;
    if base <= 0.0 {
        return 0.0;
    }
    if base >= 1.0 {
        return 1.0;
    }
    let r: f64 = rand::rng().random();
    let dynamic_factor = if r < 0.7 {
        0.8 + (r / 0.7) * 0.4
    } else if r < 0.95 {
        1.2 + ((r - 0.7) / 0.25) * 0.6
    } else {
        2.0 + ((r - 0.95) / 0.05) * 1.0
    };
    (base * dynamic_factor).min(1.0)
}

async fn transmitter(air: Arc<SimulatedAir>, sink: DriverSink, mut rx: mpsc::Receiver<AirPacket>) {
    while let Some(packet) = rx.recv().await {
        let to = packet.to;
        let acked = air.carry(packet).await;
        sink.send_complete(to, acked);
    }
}

/// Driver for one simulated station.
pub struct SimulatedRadio {
    address: PeerAddress,
    air: Arc<SimulatedAir>,
    peers: HashSet<PeerAddress>,
    tx: mpsc::Sender<AirPacket>,
}

impl SimulatedRadio {
    pub fn address(&self) -> PeerAddress {
        self.address
    }
}

#[async_trait]
impl RadioDriver for SimulatedRadio {
    async fn add_peer(&mut self, address: PeerAddress) -> Result<(), DriverError> {
        if self.peers.contains(&address) {
            return Ok(());
        }
        if self.peers.len() >= self.air.config.peer_table_capacity {
            return Err(DriverError::PeerTableFull);
        }
        self.peers.insert(address);
        Ok(())
    }

    async fn transmit(&mut self, destination: PeerAddress, frame: &[u8]) -> Result<(), DriverError> {
        if frame.len() > self.air.config.mtu {
            return Err(DriverError::PacketTooLarge);
        }
        if !self.peers.contains(&destination) {
            return Err(DriverError::UnknownPeer);
        }
        let packet = AirPacket {
            from: self.address,
            to: destination,
            frame: Bytes::copy_from_slice(frame),
        };
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DriverError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DriverError::Unavailable,
        })
    }
}
