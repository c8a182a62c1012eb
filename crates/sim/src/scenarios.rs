//! Simulation scenarios for the dust link

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use bytes::Bytes;
use dust_link::{
    AirStats, Handlers, Link, LinkConfig, LinkHandle, PeerAddress, RadioConfig, SendHandle, SessionStats,
    SimulatedAir,
};
use log::info;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::SimConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered(SendHandle),
    Failed(SendHandle),
}

impl Outcome {
    pub fn handle(&self) -> SendHandle {
        match self {
            Outcome::Delivered(h) | Outcome::Failed(h) => *h,
        }
    }
}

/// One link on the simulated air with its callbacks turned into channels.
pub struct Station {
    pub address: PeerAddress,
    pub handle: LinkHandle,
    pub task: JoinHandle<()>,
    pub received: mpsc::UnboundedReceiver<(PeerAddress, Bytes)>,
    pub outcomes: mpsc::UnboundedReceiver<Outcome>,
}

impl Station {
    pub async fn start(air: &Arc<SimulatedAir>, address: PeerAddress, config: LinkConfig) -> Result<Self> {
        let (data_tx, received) = mpsc::unbounded_channel();
        let (delivered_tx, outcomes) = mpsc::unbounded_channel();
        let failed_tx = delivered_tx.clone();

        let handlers = Handlers::new()
            .on_data(move |from, data: Bytes| {
                info!(
                    "recv mac={} len={} data={}",
                    from,
                    data.len(),
                    String::from_utf8_lossy(&data)
                );
                let _ = data_tx.send((from, data));
            })
            .on_delivered(move |h| {
                let _ = delivered_tx.send(Outcome::Delivered(h));
            })
            .on_failed(move |h| {
                let _ = failed_tx.send(Outcome::Failed(h));
            });

        let link = Link::new(config, handlers)?;
        let radio = air.join(address, link.driver_sink()).await;
        let (handle, task) = link.spawn(radio);
        Ok(Self {
            address,
            handle,
            task,
            received,
            outcomes,
        })
    }

    pub async fn stop(self) {
        self.handle.shutdown().await;
        let _ = self.task.await;
    }
}

/// Master side of the firmware pair: echo every payload back to its sender.
/// The echo task ends once the returned handle shuts the link down.
pub async fn start_echo_master(
    air: &Arc<SimulatedAir>,
    address: PeerAddress,
    config: LinkConfig,
) -> Result<(LinkHandle, JoinHandle<()>)> {
    let mut station = Station::start(air, address, config).await?;
    let handle = station.handle.clone();
    let echo = tokio::spawn(async move {
        while let Some((from, data)) = station.received.recv().await {
            if station.handle.register_peer(from).await.is_err() {
                break;
            }
            if let Err(e) = station.handle.send(from, data).await {
                info!("echo to {} rejected: {}", from, e);
            }
        }
        let _ = station.task.await;
    });
    Ok((handle, echo))
}

#[derive(Debug, Clone)]
pub struct HelloReport {
    pub outcome: Option<Outcome>,
    pub echo: Option<Bytes>,
    pub elapsed: Duration,
    pub stats: SessionStats,
    pub air: AirStats,
}

/// Register the master, say the message once and wait for the echo.
pub async fn hello_exchange(radio: RadioConfig, sim: &SimConfig) -> Result<HelloReport> {
    let link_config = sim.link.to_link_config();
    let air = SimulatedAir::new(radio);
    let (master, echo_task) = start_echo_master(&air, sim.peer, link_config.clone()).await?;
    let mut node = Station::start(&air, sim.node, link_config.clone()).await?;

    let started = Instant::now();
    node.handle.register_peer(sim.peer).await?;
    let sent = node.handle.send(sim.peer, sim.message.clone().into_bytes()).await?;
    println!("  sent {} ({} bytes) as {}", sim.message, sim.message.len(), sent);

    let patience = give_up_after(&link_config).saturating_mul(2);
    let outcome = timeout(patience, node.outcomes.recv()).await.ok().flatten();
    let echo = match outcome {
        Some(Outcome::Delivered(_)) => timeout(patience, node.received.recv())
            .await
            .ok()
            .flatten()
            .map(|(_, data)| data),
        _ => None,
    };
    let elapsed = started.elapsed();

    match outcome {
        Some(Outcome::Delivered(h)) => println!("  ✓ {} delivered in {:?}", h, elapsed),
        Some(Outcome::Failed(h)) => println!("  ✗ {} failed after {} attempts", h, link_config.max_attempts),
        None => println!("  ✗ no outcome within {:?}", patience),
    }
    match &echo {
        Some(data) => println!("  ✓ echo: {}", String::from_utf8_lossy(data)),
        None => println!("  ✗ no echo"),
    }

    let stats = node.handle.stats().await?;
    let air_stats = air.get_stats().await;
    node.stop().await;
    master.shutdown().await;
    let _ = echo_task.await;

    Ok(HelloReport {
        outcome,
        echo,
        elapsed,
        stats,
        air: air_stats,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct BurstReport {
    pub sent: usize,
    pub delivered: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub stats: SessionStats,
    pub air: AirStats,
}

impl BurstReport {
    pub fn goodput_bps(&self, payload_len: usize) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.delivered * payload_len * 8) as f64 / secs
    }
}

/// Fire `sim.burst` frames back to back and wait for every outcome.
pub async fn burst_test(radio: RadioConfig, sim: &SimConfig) -> Result<BurstReport> {
    let link_config = sim.link.to_link_config();
    let air = SimulatedAir::new(radio);
    let master = Station::start(&air, sim.peer, link_config.clone()).await?;
    let mut node = Station::start(&air, sim.node, link_config.clone()).await?;
    node.handle.register_peer(sim.peer).await?;

    let started = Instant::now();
    let mut sent = 0;
    for i in 0..sim.burst {
        let payload = format!("{} {}", sim.message, i);
        node.handle.send(sim.peer, payload.into_bytes()).await?;
        sent += 1;
    }

    let (mut delivered, mut failed) = (0, 0);
    let patience = give_up_after(&link_config).saturating_mul(4);
    while delivered + failed < sent {
        match timeout(patience, node.outcomes.recv()).await {
            Ok(Some(Outcome::Delivered(_))) => delivered += 1,
            Ok(Some(Outcome::Failed(_))) => failed += 1,
            Ok(None) => bail!("node link stopped during burst"),
            Err(_) => bail!("{} of {} outcomes missing", sent - delivered - failed, sent),
        }
    }
    let elapsed = started.elapsed();

    let report = BurstReport {
        sent,
        delivered,
        failed,
        elapsed,
        stats: node.handle.stats().await?,
        air: air.get_stats().await,
    };
    node.stop().await;
    master.stop().await;

    let payload_len = sim.message.len() + 3;
    println!("  Frames: {} sent, {} delivered, {} failed", report.sent, report.delivered, report.failed);
    println!(
        "  Retransmissions: {} ({:.1}% of first sends)",
        report.stats.retransmissions,
        report.stats.retransmissions as f64 / report.stats.frames_sent.max(1) as f64 * 100.0
    );
    println!(
        "  Air: {} packets, {} dropped, {} bytes",
        report.air.packets_sent, report.air.packets_dropped, report.air.bytes_sent
    );
    println!("  Goodput: ~{:.0} bps over {:?}", report.goodput_bps(payload_len), report.elapsed);
    Ok(report)
}

/// Send to a master that never came up; the link must give up exactly once.
pub async fn unreachable_master(radio: RadioConfig, sim: &SimConfig) -> Result<Outcome> {
    let link_config = sim.link.to_link_config();
    let air = SimulatedAir::new(radio);
    let mut node = Station::start(&air, sim.node, link_config.clone()).await?;
    node.handle.register_peer(sim.peer).await?;
    node.handle.send(sim.peer, sim.message.clone().into_bytes()).await?;

    let outcome = timeout(give_up_after(&link_config).saturating_mul(2), node.outcomes.recv()).await;
    let outcome = match outcome {
        Ok(Some(outcome)) => outcome,
        _ => bail!("no outcome for a send to an absent master"),
    };
    let air_stats = air.get_stats().await;
    println!(
        "  {:?} after {} transmissions, {} acknowledged",
        outcome, air_stats.packets_sent, air_stats.packets_delivered
    );
    node.stop().await;
    Ok(outcome)
}

// upper bound on how long one send can stay pending
fn give_up_after(config: &LinkConfig) -> Duration {
    let per_attempt = config
        .transmit_timeout
        .saturating_add(config.ack_timeout)
        .saturating_add(config.max_backoff);
    per_attempt.saturating_mul(config.max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lossless() -> RadioConfig {
        RadioConfig {
            packet_loss: 0.0,
            latency: Duration::from_millis(1),
            latency_jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    fn quick() -> SimConfig {
        let mut sim = SimConfig::default();
        sim.link.base_backoff_ms = 10;
        sim.link.max_backoff_ms = 40;
        sim.link.ack_timeout_ms = 50;
        sim.link.tick_ms = 5;
        sim.burst = 10;
        sim
    }

    #[tokio::test]
    async fn test_hello_is_echoed() {
        let report = hello_exchange(lossless(), &quick()).await.unwrap();
        assert!(matches!(report.outcome, Some(Outcome::Delivered(_))));
        assert_eq!(report.echo, Some(Bytes::from_static(b"HELLO")));
        assert_eq!(report.stats.delivered, 1);
        assert_eq!(report.stats.retransmissions, 0);
    }

    #[tokio::test]
    async fn test_burst_all_delivered_on_clean_air() {
        let report = burst_test(lossless(), &quick()).await.unwrap();
        assert_eq!((report.sent, report.delivered, report.failed), (10, 10, 0));
        // every data frame plus one ack each
        assert_eq!(report.air.packets_sent, 20);
    }

    #[tokio::test]
    async fn test_unreachable_master_fails() {
        let sim = quick();
        let outcome = unreachable_master(lossless(), &sim).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(h) if h.destination == sim.peer));
    }

    #[test]
    fn test_give_up_bound_covers_all_attempts() {
        let config = LinkConfig::default();
        assert!(give_up_after(&config) >= config.max_backoff * (config.max_attempts - 1));

        let huge = LinkConfig {
            transmit_timeout: Duration::MAX,
            max_attempts: u32::MAX,
            ..Default::default()
        };
        assert_eq!(give_up_after(&huge), Duration::MAX);
    }
}
