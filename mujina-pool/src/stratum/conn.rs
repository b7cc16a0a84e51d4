//! Per-connection session state.
//!
//! A [`Conn`] is shared between the server's scanner task, the job
//! manager's delivery task and whichever handler tasks are working on the
//! connection's requests. Every field is readable and writable through `&self`:
//! scalars are atomics and strings sit behind [`ArcSwap`].

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::node::ClientType;
use crate::tracing::prelude::*;

/// Longest line a miner may send. Anything longer closes the connection.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Longest [`Conn::close`] waits for the socket shutdown.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream of newline-delimited frames read from the miner.
pub type Scanner = FramedRead<Reader, LinesCodec>;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// One live miner session.
pub struct Conn {
    id: u64,
    ip: IpAddr,
    port: u16,

    reader: parking_lot::Mutex<Option<Reader>>,
    writer: Mutex<Writer>,
    deadline: watch::Sender<Option<Instant>>,
    closed: CancellationToken,

    miner_id: AtomicU64,
    worker_id: AtomicU64,
    compound_id: ArcSwap<String>,
    miner: ArcSwap<String>,
    worker: ArcSwap<String>,
    client: ArcSwap<String>,
    extranonce: ArcSwap<String>,

    subscribed: AtomicBool,
    extranonce_subscribed: AtomicBool,
    authorized: AtomicBool,
    is_solo: AtomicBool,
    client_type: AtomicU8,

    diff_factor: AtomicU64,
    last_diff_factor: AtomicU64,
    last_diff_factor_at: AtomicI64,
    last_share_at: AtomicI64,
    last_error_at: AtomicI64,
    error_count: AtomicU64,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("compound_id", &self.compound_id())
            .field("authorized", &self.authorized())
            .field("diff_factor", &self.diff_factor())
            .finish()
    }
}

impl Conn {
    /// Wrap the two halves of a socket.
    ///
    /// `port` is the pool's listening port the miner connected to; it selects
    /// the starting difficulty factor.
    pub fn new(
        id: u64,
        ip: IpAddr,
        port: u16,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let (deadline, _) = watch::channel(None);
        Self {
            id,
            ip,
            port,
            reader: parking_lot::Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            deadline,
            closed: CancellationToken::new(),
            miner_id: AtomicU64::new(0),
            worker_id: AtomicU64::new(0),
            compound_id: ArcSwap::from_pointee(String::new()),
            miner: ArcSwap::from_pointee(String::new()),
            worker: ArcSwap::from_pointee(String::new()),
            client: ArcSwap::from_pointee(String::new()),
            extranonce: ArcSwap::from_pointee(String::new()),
            subscribed: AtomicBool::new(false),
            extranonce_subscribed: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
            is_solo: AtomicBool::new(false),
            client_type: AtomicU8::new(ClientType::Standard as u8),
            diff_factor: AtomicU64::new(1),
            last_diff_factor: AtomicU64::new(1),
            last_diff_factor_at: AtomicI64::new(0),
            last_share_at: AtomicI64::new(0),
            last_error_at: AtomicI64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Write one frame, appending the newline. Resolves once the socket has
    /// taken all of it, or with `NotConnected` as soon as the connection is
    /// closed, even if the peer has stopped reading.
    pub async fn write(&self, frame: &[u8]) -> std::io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(std::io::ErrorKind::NotConnected.into());
        }
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(std::io::ErrorKind::NotConnected.into()),
            result = write => result,
        }
    }

    /// Take the read half as a stream of lines. Only the first call gets it.
    pub fn new_scanner(&self) -> Option<Scanner> {
        let reader = self.reader.lock().take()?;
        Some(FramedRead::new(
            reader,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        ))
    }

    /// Close the connection if no frame has been read by `deadline`.
    /// `None` clears the deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadline.send_replace(deadline);
    }

    pub fn read_deadline(&self) -> watch::Receiver<Option<Instant>> {
        self.deadline.subscribe()
    }

    /// Ask every task serving this connection to stop and shut the socket.
    ///
    /// Pending writes are abandoned, so this never waits on a peer that has
    /// stopped reading for longer than [`CLOSE_TIMEOUT`].
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            debug!(conn = self.id, "Socket shutdown timed out");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn miner_id(&self) -> u64 {
        self.miner_id.load(Ordering::Acquire)
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id.load(Ordering::Acquire)
    }

    /// Set the miner's and worker's accounting ids and names, recomputing the
    /// compound id in the same step.
    pub fn set_identity(&self, miner_id: u64, miner: &str, worker_id: u64, worker: &str) {
        self.miner_id.store(miner_id, Ordering::Release);
        self.worker_id.store(worker_id, Ordering::Release);
        self.miner.store(Arc::new(miner.to_string()));
        self.worker.store(Arc::new(worker.to_string()));
        self.compound_id
            .store(Arc::new(format!("{}:{}", miner, worker)));
    }

    /// `"<miner>:<worker>"`, empty until authorized.
    pub fn compound_id(&self) -> Arc<String> {
        self.compound_id.load_full()
    }

    pub fn miner(&self) -> Arc<String> {
        self.miner.load_full()
    }

    pub fn worker(&self) -> Arc<String> {
        self.worker.load_full()
    }

    /// Software fingerprint from `mining.subscribe`.
    pub fn client(&self) -> Arc<String> {
        self.client.load_full()
    }

    pub fn set_client(&self, client: &str) {
        self.client.store(Arc::new(client.to_string()));
    }

    pub fn extranonce(&self) -> Arc<String> {
        self.extranonce.load_full()
    }

    pub fn set_extranonce(&self, extranonce: String) {
        self.extranonce.store(Arc::new(extranonce));
    }

    pub fn subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    pub fn set_subscribed(&self, v: bool) {
        self.subscribed.store(v, Ordering::Release);
    }

    pub fn extranonce_subscribed(&self) -> bool {
        self.extranonce_subscribed.load(Ordering::Acquire)
    }

    pub fn set_extranonce_subscribed(&self, v: bool) {
        self.extranonce_subscribed.store(v, Ordering::Release);
    }

    pub fn authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }

    pub fn set_authorized(&self, v: bool) {
        self.authorized.store(v, Ordering::Release);
    }

    pub fn is_solo(&self) -> bool {
        self.is_solo.load(Ordering::Acquire)
    }

    pub fn set_is_solo(&self, v: bool) {
        self.is_solo.store(v, Ordering::Release);
    }

    pub fn client_type(&self) -> ClientType {
        ClientType::from_repr(self.client_type.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_client_type(&self, client_type: ClientType) {
        self.client_type.store(client_type as u8, Ordering::Release);
    }

    pub fn diff_factor(&self) -> u64 {
        self.diff_factor.load(Ordering::Acquire)
    }

    /// Set the difficulty factor without touching the retarget history.
    /// Values below 1 are raised to 1.
    pub fn init_diff_factor(&self, factor: u64) {
        self.diff_factor.store(factor.max(1), Ordering::Release);
    }

    /// Change the difficulty factor, remembering the previous one and when
    /// it changed. Returns the previous factor.
    pub fn set_diff_factor(&self, factor: u64) -> u64 {
        let previous = self.diff_factor.swap(factor.max(1), Ordering::AcqRel);
        self.last_diff_factor.store(previous, Ordering::Release);
        self.last_diff_factor_at
            .store(unix_millis(), Ordering::Release);
        previous
    }

    /// The factor in force before the last retarget, and when the retarget
    /// happened (Unix millis, 0 if never).
    pub fn last_diff_factor(&self) -> (u64, i64) {
        (
            self.last_diff_factor.load(Ordering::Acquire),
            self.last_diff_factor_at.load(Ordering::Acquire),
        )
    }

    pub fn last_share_at(&self) -> i64 {
        self.last_share_at.load(Ordering::Acquire)
    }

    pub fn set_last_share_at(&self, at: i64) {
        self.last_share_at.store(at, Ordering::Release);
    }

    /// Count a miner-side error. Returns the running total.
    pub fn record_error(&self) -> u64 {
        self.last_error_at.store(unix_millis(), Ordering::Release);
        self.error_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_error_at(&self) -> i64 {
        self.last_error_at.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use tokio::io::DuplexStream;

    /// A connection backed by an in-memory pipe. The returned stream is the
    /// miner's end.
    pub fn pipe_conn(id: u64) -> (Arc<Conn>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(ours);
        let conn = Conn::new(id, "127.0.0.1".parse().unwrap(), 3333, r, w);
        (Arc::new(conn), theirs)
    }
}
