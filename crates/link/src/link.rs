//! Link runtime: the single owner of the session core.
//!
//! Driver callbacks, application commands and the retry timer are all
//! consumed by one tokio task, so every state change is serialized without
//! locking the core. Driver events and commands use separate bounded queues:
//! the runtime stops on `shutdown` or once every [`LinkHandle`] is dropped,
//! even while a driver still holds a [`DriverSink`].

use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::adapter::{DriverEvent, DriverSink, RadioDriver, TransportAdapter};
use crate::session::{Handlers, SessionCore, SessionStats};
use crate::tracker::SendHandle;
use crate::{LinkConfig, LinkError, PeerAddress};

pub(crate) enum Command {
    RegisterPeer {
        address: PeerAddress,
        reply: oneshot::Sender<Result<bool, LinkError>>,
    },
    Send {
        destination: PeerAddress,
        payload: Bytes,
        reply: oneshot::Sender<Result<SendHandle, LinkError>>,
    },
    Cancel {
        handle: SendHandle,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Shutdown,
}

/// A configured link that has not been attached to a driver yet.
pub struct Link {
    config: LinkConfig,
    handlers: Handlers,
    driver_tx: mpsc::Sender<DriverEvent>,
    driver_rx: mpsc::Receiver<DriverEvent>,
}

impl Link {
    pub fn new(config: LinkConfig, handlers: Handlers) -> Result<Self, LinkError> {
        config.validate()?;
        let (driver_tx, driver_rx) = mpsc::channel(config.event_queue_capacity);
        Ok(Self {
            config,
            handlers,
            driver_tx,
            driver_rx,
        })
    }

    /// Handle for the driver's send-complete and receive callbacks.
    pub fn driver_sink(&self) -> DriverSink {
        DriverSink::new(self.driver_tx.clone())
    }

    pub fn spawn<D>(self, driver: D) -> (LinkHandle, JoinHandle<()>)
    where
        D: RadioDriver + 'static,
    {
        let Link {
            config,
            handlers,
            driver_rx,
            ..
        } = self;
        let (command_tx, command_rx) = mpsc::channel(config.event_queue_capacity);
        let core = SessionCore::new(&config, handlers);
        let adapter = TransportAdapter::new(driver);
        info!(
            "Link runtime starting (mtu {}, {} attempts, tick {:?})",
            config.mtu, config.max_attempts, config.tick
        );
        let task = tokio::spawn(run(
            core,
            adapter,
            driver_rx,
            command_rx,
            config.tick,
            config.transmit_timeout,
        ));
        (LinkHandle { tx: command_tx }, task)
    }
}

async fn run<D: RadioDriver>(
    mut core: SessionCore,
    mut adapter: TransportAdapter<D>,
    mut driver_rx: mpsc::Receiver<DriverEvent>,
    mut command_rx: mpsc::Receiver<Command>,
    tick: Duration,
    transmit_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                None | Some(Command::Shutdown) => break,
                Some(command) => on_command(&mut core, &mut adapter, command).await,
            },
            Some(event) = driver_rx.recv() => on_driver_event(&mut core, &mut adapter, event),
            _ = ticker.tick() => {
                let now = Instant::now();
                adapter.expire_stale(now, transmit_timeout);
                core.poll_timeouts(now);
            }
        }
        flush(&mut core, &mut adapter).await;
    }

    let stats = core.stats();
    info!(
        "Link runtime stopped: {} sent, {} retransmitted, {} delivered, {} failed, {} received",
        stats.frames_sent, stats.retransmissions, stats.delivered, stats.failed, stats.data_received
    );
}

fn on_driver_event<D: RadioDriver>(core: &mut SessionCore, adapter: &mut TransportAdapter<D>, event: DriverEvent) {
    match event {
        DriverEvent::SendComplete { peer, success } => {
            if let Some((handle, success)) = adapter.on_send_complete(peer, success) {
                core.on_transmit_result(handle, success, Instant::now());
            }
        }
        DriverEvent::Received { source, data } => core.on_raw_received(source, &data),
    }
}

async fn on_command<D: RadioDriver>(core: &mut SessionCore, adapter: &mut TransportAdapter<D>, command: Command) {
    match command {
        Command::RegisterPeer { address, reply } => {
            let result = match adapter.register_peer_at_driver(address).await {
                Ok(()) => Ok(core.register_peer(address)),
                Err(e) => Err(LinkError::Driver(e)),
            };
            let _ = reply.send(result);
        }
        Command::Send {
            destination,
            payload,
            reply,
        } => {
            let result = core.send(destination, payload, Instant::now());
            if let Err(e) = &result {
                debug!("Send to {} rejected: {}", destination, e);
            }
            let _ = reply.send(result);
        }
        Command::Cancel { handle, reply } => {
            let _ = reply.send(core.cancel(handle));
        }
        Command::Stats { reply } => {
            let _ = reply.send(core.stats());
        }
        Command::Shutdown => {}
    }
}

async fn flush<D: RadioDriver>(core: &mut SessionCore, adapter: &mut TransportAdapter<D>) {
    while let Some(out) = core.poll_transmit() {
        if let Some((handle, success)) = adapter.transmit(out).await {
            core.on_transmit_result(handle, success, Instant::now());
        }
    }
}

/// Application-side handle to a running link.
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<Command>,
}

impl LinkHandle {
    /// Returns `true` when the peer was new.
    pub async fn register_peer(&self, address: PeerAddress) -> Result<bool, LinkError> {
        self.request(|reply| Command::RegisterPeer { address, reply }).await?
    }

    /// Queue `payload` for reliable delivery. The outcome is reported through
    /// the `on_delivered` / `on_failed` handlers.
    pub async fn send(&self, destination: PeerAddress, payload: impl Into<Bytes>) -> Result<SendHandle, LinkError> {
        let payload = payload.into();
        self.request(|reply| Command::Send {
            destination,
            payload,
            reply,
        })
        .await?
    }

    pub async fn cancel(&self, handle: SendHandle) -> Result<bool, LinkError> {
        self.request(|reply| Command::Cancel { handle, reply }).await
    }

    pub async fn stats(&self) -> Result<SessionStats, LinkError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn shutdown(&self) {
        if self.tx.send(Command::Shutdown).await.is_err() {
            warn!("Link runtime already stopped");
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, LinkError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| LinkError::Closed)?;
        response.await.map_err(|_| LinkError::Closed)
    }
}
