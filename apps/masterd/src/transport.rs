use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use frameio::frame::{FrameReader, FrameWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What the control loop sees from the transport. `clean` distinguishes an
/// orderly peer EOF from a lost connection; the dispatch layer treats both
/// as instance death but logs them differently.
#[derive(Debug)]
pub enum PeerEvent {
    Frame { peer: SocketAddr, payload: Bytes },
    Disconnected { peer: SocketAddr, clean: bool },
}

enum ConnEvent {
    Connected {
        peer: SocketAddr,
        tx: mpsc::Sender<Bytes>,
    },
    Frame {
        peer: SocketAddr,
        payload: Bytes,
    },
    Disconnected {
        peer: SocketAddr,
        clean: bool,
    },
}

/// Outbound messages staged during dispatch and flushed once per tick.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<Outgoing>,
}

#[derive(Debug)]
pub enum Outgoing {
    To(SocketAddr, Bytes),
    Broadcast(Bytes),
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, peer: SocketAddr, payload: Bytes) {
        self.queue.push(Outgoing::To(peer, payload));
    }

    pub fn broadcast(&mut self, payload: Bytes) {
        self.queue.push(Outgoing::Broadcast(payload));
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Outgoing> {
        self.queue.drain(..)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The master's side of the fleet control channel: one TCP listener, one
/// reader and one writer task per peer. All peer-map mutation happens on
/// the control-loop task via `poll`.
pub struct Transport {
    events: mpsc::Receiver<ConnEvent>,
    peers: HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    local_addr: SocketAddr,
}

pub async fn bind(addr: SocketAddr, max_clients: usize) -> anyhow::Result<Transport> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let local_addr = listener.local_addr()?;

    let (tx, rx) = mpsc::channel(4096);
    tokio::spawn(accept_loop(listener, tx, max_clients));

    Ok(Transport {
        events: rx,
        peers: HashMap::new(),
        local_addr,
    })
}

impl Transport {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Non-blocking receive. Peer registration is folded in here so the
    /// peer map only ever changes on the caller's task.
    pub fn poll(&mut self) -> Option<PeerEvent> {
        loop {
            match self.events.try_recv() {
                Ok(ConnEvent::Connected { peer, tx }) => {
                    debug!(peer = %peer, "peer connected");
                    self.peers.insert(peer, tx);
                }
                Ok(ConnEvent::Frame { peer, payload }) => {
                    return Some(PeerEvent::Frame { peer, payload });
                }
                Ok(ConnEvent::Disconnected { peer, clean }) => {
                    self.peers.remove(&peer);
                    return Some(PeerEvent::Disconnected { peer, clean });
                }
                Err(_) => return None,
            }
        }
    }

    /// Hand staged messages to the per-peer writer tasks. A full or gone
    /// writer drops the message; the peer is either about to die (its
    /// Disconnected event is in flight) or hopelessly backlogged.
    pub fn flush(&mut self, outbox: &mut Outbox) {
        for out in outbox.drain() {
            match out {
                Outgoing::To(peer, payload) => {
                    if let Some(tx) = self.peers.get(&peer) {
                        if tx.try_send(payload).is_err() {
                            warn!(peer = %peer, "dropping outbound message");
                        }
                    }
                }
                Outgoing::Broadcast(payload) => {
                    for (peer, tx) in &self.peers {
                        if tx.try_send(payload.clone()).is_err() {
                            warn!(peer = %peer, "dropping broadcast for peer");
                        }
                    }
                }
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::Sender<ConnEvent>, max_clients: usize) {
    let live = Arc::new(AtomicUsize::new(0));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, "accept failed");
                continue;
            }
        };

        if live.load(Ordering::Relaxed) >= max_clients {
            warn!(peer = %peer, "connection limit reached, dropping peer");
            continue;
        }

        let (wtx, wrx) = mpsc::channel::<Bytes>(256);
        if events
            .send(ConnEvent::Connected { peer, tx: wtx })
            .await
            .is_err()
        {
            return;
        }

        live.fetch_add(1, Ordering::Relaxed);
        let (rd, wr) = stream.into_split();
        tokio::spawn(write_peer(wr, wrx));
        tokio::spawn(read_peer(rd, peer, events.clone(), live.clone()));
    }
}

async fn read_peer(
    rd: OwnedReadHalf,
    peer: SocketAddr,
    events: mpsc::Sender<ConnEvent>,
    live: Arc<AtomicUsize>,
) {
    let mut fr = FrameReader::new(rd);
    let clean = loop {
        match fr.read_frame().await {
            Ok(Some(payload)) => {
                if events.send(ConnEvent::Frame { peer, payload }).await.is_err() {
                    break true;
                }
            }
            Ok(None) => break true,
            Err(e) => {
                debug!(peer = %peer, err = %e, "peer read error");
                break false;
            }
        }
    };

    live.fetch_sub(1, Ordering::Relaxed);
    let _ = events.send(ConnEvent::Disconnected { peer, clean }).await;
}

async fn write_peer(wr: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    let mut fw = FrameWriter::new(wr);
    while let Some(payload) = rx.recv().await {
        if fw.write_frame(&payload).await.is_err() {
            break;
        }
        if fw.flush().await.is_err() {
            break;
        }
    }
}
