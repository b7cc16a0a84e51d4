//! TCP listener and per-connection scanner tasks.
//!
//! The server owns nothing but sockets. It accepts connections, turns each
//! line a miner sends into a [`Message`], and publishes it together with the
//! connection on a channel. Connects, disconnects and accept errors travel on
//! their own channels so the pool can multiplex all four in one `select!`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::conn::Conn;
use crate::error::{Error, Result};
use crate::rpc::Message;
use crate::tracing::prelude::*;

const CHANNEL_DEPTH: usize = 1024;

/// A frame read from a miner.
#[derive(Debug)]
pub struct Inbound {
    pub conn: Arc<Conn>,
    pub msg: Message,
}

/// The server's four output streams.
pub struct Streams {
    pub messages: mpsc::Receiver<Inbound>,
    pub connects: mpsc::Receiver<u64>,
    pub disconnects: mpsc::Receiver<u64>,
    pub errors: mpsc::Receiver<Error>,
}

#[derive(Clone)]
struct Senders {
    messages: mpsc::Sender<Inbound>,
    connects: mpsc::Sender<u64>,
    disconnects: mpsc::Sender<u64>,
    errors: mpsc::Sender<Error>,
}

/// Monotonic 64-bit id allocator. Wraps from `u64::MAX` back to 1, never 0.
#[derive(Debug)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// The next id handed out will be `last + 1` (or 1 at the wrap).
    pub fn starting_after(last: u64) -> Self {
        Self(AtomicU64::new(last))
    }

    pub fn next(&self) -> u64 {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(if cur == u64::MAX { 1 } else { cur + 1 })
            })
            .unwrap_or_default();
        if prev == u64::MAX {
            1
        } else {
            prev + 1
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Stratum TCP server.
pub struct Server {
    addr: SocketAddr,
    handshake_timeout: Duration,
    ids: IdAllocator,
    conns: RwLock<HashMap<u64, Arc<Conn>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    senders: parking_lot::Mutex<Option<Senders>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(addr: SocketAddr, handshake_timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            addr,
            handshake_timeout,
            ids: IdAllocator::new(),
            conns: RwLock::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown,
            senders: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Create the output channels without binding; connections are fed in
    /// with [`Server::serve`]. [`Server::start`] calls this.
    pub fn streams(&self) -> Streams {
        let (messages_tx, messages) = mpsc::channel(CHANNEL_DEPTH);
        let (connects_tx, connects) = mpsc::channel(CHANNEL_DEPTH);
        let (disconnects_tx, disconnects) = mpsc::channel(CHANNEL_DEPTH);
        let (errors_tx, errors) = mpsc::channel(CHANNEL_DEPTH);
        *self.senders.lock() = Some(Senders {
            messages: messages_tx,
            connects: connects_tx,
            disconnects: disconnects_tx,
            errors: errors_tx,
        });
        Streams {
            messages,
            connects,
            disconnects,
            errors,
        }
    }

    /// Bind the listener and start accepting.
    ///
    /// A bind failure is returned; everything after that is reported on the
    /// error stream.
    pub async fn start(self: &Arc<Self>) -> Result<Streams> {
        let listener = TcpListener::bind(self.addr).await?;
        let local = listener.local_addr()?;
        let port = local.port();
        *self.local_addr.lock() = Some(local);
        info!(addr = %self.addr, port, "Stratum server listening");

        let streams = self.streams();
        let server = Arc::clone(self);
        self.tracker.spawn(async move {
            server.accept_loop(listener, port).await;
        });
        Ok(streams)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, port: u16) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let (r, w) = stream.into_split();
                        self.serve(peer.ip(), port, r, w);
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        self.report(Error::Io(e)).await;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            }
        }
        trace!("Accept loop stopped.");
    }

    async fn report(&self, error: Error) {
        let tx = self.senders.lock().as_ref().map(|s| s.errors.clone());
        if let Some(tx) = tx {
            let _ = tx.send(error).await;
        }
    }

    /// Register a connection and spawn its scanner. Returns the connection.
    pub fn serve(
        self: &Arc<Self>,
        ip: IpAddr,
        port: u16,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Arc<Conn> {
        let id = self.ids.next();
        let conn = Arc::new(Conn::new(id, ip, port, reader, writer));
        conn.set_read_deadline(Some(Instant::now() + self.handshake_timeout));
        self.conns.write().insert(id, Arc::clone(&conn));
        debug!(conn_id = id, ip = %ip, port, "Connection accepted");

        let server = Arc::clone(self);
        let scanned = Arc::clone(&conn);
        self.tracker.spawn(async move {
            server.scan(scanned).await;
        });
        conn
    }

    async fn scan(self: Arc<Self>, conn: Arc<Conn>) {
        let Some(senders) = self.senders.lock().clone() else {
            warn!(conn_id = conn.id(), "Server streams not set up; dropping connection");
            conn.close().await;
            return;
        };
        let _ = senders.connects.send(conn.id()).await;

        let Some(mut scanner) = conn.new_scanner() else {
            return;
        };
        let mut deadline = conn.read_deadline();

        loop {
            let current = *deadline.borrow_and_update();
            let expiry = async move {
                match current {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                line = scanner.next() => match line {
                    Some(Ok(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        trace!(conn_id = conn.id(), rx = %line, "Received frame");
                        match Message::parse(line.as_bytes()) {
                            Ok(msg) => {
                                let inbound = Inbound { conn: Arc::clone(&conn), msg };
                                if senders.messages.send(inbound).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(conn_id = conn.id(), error = %e, "Undecodable frame");
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!(conn_id = conn.id(), error = %e, "Read failed");
                        break;
                    }
                    None => break,
                },
                changed = deadline.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = expiry => {
                    debug!(conn_id = conn.id(), "Handshake deadline expired");
                    break;
                }
                _ = conn.closed() => break,
                _ = self.shutdown.cancelled() => break,
            }
        }

        conn.close().await;
        self.conns.write().remove(&conn.id());
        let _ = senders.disconnects.send(conn.id()).await;
        debug!(conn_id = conn.id(), "Connection closed");
    }

    /// The bound address, once [`Server::start`] has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn get(&self, id: u64) -> Option<Arc<Conn>> {
        self.conns.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    /// Wait for the accept loop and every scanner to finish. Call after
    /// cancelling the shutdown token.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
