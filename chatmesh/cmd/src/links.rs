//! TCP link adapter for the mesh node harness.
//!
//! Each accepted or dialed socket is one transport link. Frames on the
//! socket are u16 big-endian length-prefixed; the prefix is a link-layer
//! detail and never reaches the protocol core.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chatmesh_core::{LinkId, Transport, TransportError, TransportEvent};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Writers = Arc<Mutex<HashMap<LinkId, mpsc::Sender<Bytes>>>>;

/// Manages TCP sockets as transport links
pub struct TcpLinks {
    events: mpsc::Sender<TransportEvent>,
    writers: Writers,
    next_link: AtomicU64,
}

impl TcpLinks {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events,
            writers: Arc::new(Mutex::new(HashMap::new())),
            next_link: AtomicU64::new(1),
        }
    }

    /// Bind and accept inbound links.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening for mesh links");

        let links = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!(%peer, "accepted link");
                        links.register(socket).await;
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Dial a peer, redialing with backoff whenever the link drops.
    pub fn dial(self: &Arc<Self>, addr: SocketAddr) {
        let links = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match TcpStream::connect(addr).await {
                    Ok(socket) => {
                        info!(%addr, "connected");
                        backoff = Duration::from_secs(1);
                        let closed = links.register(socket).await;
                        closed.await.ok();
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(error) => {
                        warn!(%addr, %error, ?backoff, "connect failed, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
            }
        });
    }

    /// Returns a receiver resolved when the link's socket task ends.
    async fn register(&self, socket: TcpStream) -> oneshot::Receiver<()> {
        let link = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (write_tx, write_rx) = mpsc::channel::<Bytes>(64);
        self.writers.lock().unwrap().insert(link, write_tx);
        self.events
            .send(TransportEvent::Connected { link })
            .await
            .ok();

        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(run_link(
            link,
            socket,
            write_rx,
            self.events.clone(),
            Arc::clone(&self.writers),
            closed_tx,
        ));
        closed_rx
    }
}

#[async_trait]
impl Transport for TcpLinks {
    async fn write(&self, link: LinkId, bytes: Bytes) -> Result<(), TransportError> {
        let sender = self.writers.lock().unwrap().get(&link).cloned();
        match sender {
            Some(sender) => sender.send(bytes).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn disconnect(&self, link: LinkId) {
        // Dropping the write handle ends the link task
        self.writers.lock().unwrap().remove(&link);
    }
}

async fn run_link(
    link: LinkId,
    socket: TcpStream,
    mut outgoing: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<TransportEvent>,
    writers: Writers,
    _closed: oneshot::Sender<()>,
) {
    let (mut reader, mut writer) = socket.into_split();

    // Writes run on their own task so a stalled read never blocks them
    let write_task = tokio::spawn(async move {
        while let Some(bytes) = outgoing.recv().await {
            if bytes.len() > u16::MAX as usize {
                warn!(link, len = bytes.len(), "frame exceeds link framing, dropped");
                continue;
            }
            if writer.write_u16(bytes.len() as u16).await.is_err() {
                break;
            }
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
        writer.shutdown().await.ok();
    });

    while let Ok(bytes) = read_frame(&mut reader).await {
        if events
            .send(TransportEvent::BytesReceived { link, bytes })
            .await
            .is_err()
        {
            break;
        }
    }

    write_task.abort();
    writers.lock().unwrap().remove(&link);
    debug!(link, "link closed");
    events
        .send(TransportEvent::Disconnected { link })
        .await
        .ok();
    // Dropping _closed wakes the dialer for a reconnect
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Bytes> {
    let len = reader.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
