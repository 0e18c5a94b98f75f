//! TCP acceptor: one delivery agent per accepted connection, all fed by the
//! same scheduler.

use dashmap::DashMap;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::agent::DeliveryAgent;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::stats::ReplayStats;

/// Port the replay service listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 5678;

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub addr: SocketAddr,
    /// Start playback at this speed when the first client becomes ready.
    pub autostart_speed: Option<u32>,
    pub send_buffer_size: Option<usize>,
    pub nodelay: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            autostart_speed: None,
            send_buffer_size: None,
            nodelay: true,
        }
    }
}

/// Bind a non-blocking listener with address reuse enabled.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let listener = TcpListener::from_std(socket.into())?;
    info!("Listening on TCP {}", listener.local_addr()?);
    Ok(listener)
}

pub struct ReplayServer {
    listener: TcpListener,
    scheduler: Arc<Scheduler>,
    config: ServeConfig,
    clients: Arc<DashMap<u64, SocketAddr>>,
    stats: Arc<ReplayStats>,
    next_id: AtomicU64,
}

impl ReplayServer {
    pub fn bind(config: ServeConfig, scheduler: Arc<Scheduler>) -> Result<Self> {
        let listener = bind_listener(config.addr)?;
        Ok(Self::from_listener(listener, config, scheduler))
    }

    pub fn from_listener(listener: TcpListener, config: ServeConfig, scheduler: Arc<Scheduler>) -> Self {
        Self {
            listener,
            scheduler,
            config,
            clients: Arc::new(DashMap::new()),
            stats: Arc::new(ReplayStats::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ReplayStats> {
        self.stats.clone()
    }

    /// Live clients keyed by connection id.
    pub fn clients(&self) -> Arc<DashMap<u64, SocketAddr>> {
        self.clients.clone()
    }

    /// Accept connections until the task is cancelled. Accept failures are
    /// logged and skipped.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => self.spawn_agent(stream, peer),
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    fn spawn_agent(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tune_socket(&stream) {
            warn!("Client {} ({}): socket tuning failed: {}", id, peer, e);
        }

        info!("Client {} connected from {}", id, peer);
        self.clients.insert(id, peer);
        self.stats.record_connect();

        let mut agent = DeliveryAgent::new(id, stream, self.scheduler.subscribe(), self.stats.clone());
        if let Some(speed) = self.config.autostart_speed {
            let scheduler = self.scheduler.clone();
            agent = agent.on_ready(move || {
                if scheduler.start_if_idle(speed) {
                    info!("First client ready, playback started at {}x", speed);
                }
            });
        }

        let clients = self.clients.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            match agent.run().await {
                Ok(report) => debug!(
                    "Client {} finished: {} packets, {} bytes",
                    id, report.packets_sent, report.bytes_sent
                ),
                Err(e) => {
                    stats.record_fault();
                    warn!("Client {} ({}) dropped: {}", id, peer, e);
                }
            }
            clients.remove(&id);
            stats.record_disconnect();
            info!("Client {} disconnected", id);
        });
    }

    fn tune_socket(&self, stream: &TcpStream) -> Result<()> {
        stream.set_nodelay(self.config.nodelay)?;
        if let Some(size) = self.config.send_buffer_size {
            SockRef::from(stream).set_send_buffer_size(size)?;
        }
        Ok(())
    }
}

/// Log playback progress and delivery counters every `interval`.
pub async fn report_status(
    scheduler: Arc<Scheduler>,
    stats: Arc<ReplayStats>,
    clients: Arc<DashMap<u64, SocketAddr>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let status = scheduler.status();
        let counters = stats.snapshot();
        info!(
            "Progress: {:.1}% ({}/{}) - Clock: {} ms - Speed: {}x - State: {:?} - Clients: {} - Sent: {} packets / {} bytes - Faults: {}",
            status.progress_percent(),
            status.cursor,
            status.len,
            status.virtual_clock_ms,
            status.speed,
            status.state,
            clients.len(),
            counters.packets_sent,
            counters.bytes_sent,
            counters.faults
        );
    }
}
