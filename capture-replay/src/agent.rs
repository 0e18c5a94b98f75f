//! Per-client delivery.
//!
//! A [`DeliveryAgent`] stays silent until its client sends anything. From then
//! on it writes every revealed payload exactly once, in index order: first a
//! catch-up to the cursor as it stands at activation, then each range exposed
//! by later cursor notifications. Once active, the inbound side only matters
//! as a readiness signal: closing it does not stop delivery, a failed write
//! does.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, trace};

use crate::capture::PacketStore;
use crate::error::{ReplayError, Result};
use crate::scheduler::PlaybackFeed;
use crate::stats::ReplayStats;

const INBOUND_BUFFER: usize = 4096;

/// What a finished agent delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub activated: bool,
    pub packets_sent: usize,
    pub bytes_sent: u64,
}

pub struct DeliveryAgent<S> {
    id: u64,
    stream: S,
    feed: PlaybackFeed,
    stats: Arc<ReplayStats>,
    on_ready: Option<Box<dyn FnOnce() + Send>>,
    last_sent: usize,
}

impl<S> DeliveryAgent<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: u64, stream: S, feed: PlaybackFeed, stats: Arc<ReplayStats>) -> Self {
        Self {
            id,
            stream,
            feed,
            stats,
            on_ready: None,
            last_sent: 0,
        }
    }

    /// Run `hook` once, when the client first signals readiness.
    pub fn on_ready(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_ready = Some(Box::new(hook));
        self
    }

    /// Serve the client until a write fails or playback is torn down.
    pub async fn run(self) -> Result<DeliveryReport> {
        let DeliveryAgent {
            id,
            stream,
            feed,
            stats,
            on_ready,
            mut last_sent,
        } = self;
        let PlaybackFeed { store, mut cursor } = feed;

        let (mut reader, writer) = tokio::io::split(stream);
        let mut writer = BufWriter::new(writer);
        let mut inbound = vec![0u8; INBOUND_BUFFER];
        let mut report = DeliveryReport::default();

        let n = reader
            .read(&mut inbound)
            .await
            .map_err(ReplayError::ConnectionFault)?;
        if n == 0 {
            debug!("Client {} closed before signalling readiness", id);
            return Ok(report);
        }

        report.activated = true;
        if let Some(hook) = on_ready {
            hook();
        }

        let target = *cursor.borrow_and_update();
        info!("Client {} ready, catching up {} packets", id, target - last_sent);
        deliver(&mut writer, &store, &mut last_sent, target, &stats, &mut report).await?;

        let mut inbound_open = true;
        loop {
            tokio::select! {
                changed = cursor.changed() => {
                    if changed.is_err() {
                        debug!("Client {}: playback dropped", id);
                        break;
                    }
                    let target = *cursor.borrow_and_update();
                    deliver(&mut writer, &store, &mut last_sent, target, &stats, &mut report).await?;
                }
                read = reader.read(&mut inbound), if inbound_open => {
                    match read {
                        Ok(0) => {
                            debug!("Client {} closed its sending side", id);
                            inbound_open = false;
                        }
                        Ok(n) => trace!("Client {}: discarded {} inbound bytes", id, n),
                        Err(e) => return Err(ReplayError::ConnectionFault(e)),
                    }
                }
            }
        }

        Ok(report)
    }
}

/// Write payloads `[last_sent, target)` in order and flush. Advances
/// `last_sent` only after the whole range is on the wire.
async fn deliver<W>(
    writer: &mut W,
    store: &PacketStore,
    last_sent: &mut usize,
    target: usize,
    stats: &ReplayStats,
    report: &mut DeliveryReport,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if target <= *last_sent {
        return Ok(());
    }

    let mut bytes = 0u64;
    for index in *last_sent..target {
        let payload = store.payload(index);
        writer
            .write_all(payload)
            .await
            .map_err(ReplayError::ConnectionFault)?;
        bytes += payload.len() as u64;
    }
    writer.flush().await.map_err(ReplayError::ConnectionFault)?;

    let packets = target - *last_sent;
    trace!("Delivered packets {}..{} ({} bytes)", *last_sent, target, bytes);
    *last_sent = target;
    report.packets_sent += packets;
    report.bytes_sent += bytes;
    stats.record_delivery(packets as u64, bytes);
    Ok(())
}
