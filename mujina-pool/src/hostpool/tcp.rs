//! JSON-RPC over a persistent TCP connection.
//!
//! Requests and responses are matched by id. Frames the node pushes on its
//! own (new work notifications) are forwarded to the host pool's broadcast
//! channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::Transport;
use crate::error::{Error, Result};
use crate::rpc::{Message, Request};
use crate::tracing::prelude::*;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_LINE_LENGTH: usize = 1024 * 1024;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Message>>>>;

struct Link {
    writer: OwnedWriteHalf,
    /// Waiters for responses on this connection only.
    pending: Pending,
    closed: CancellationToken,
}

/// One persistent TCP JSON-RPC endpoint.
pub struct TcpTransport {
    addr: String,
    timeout: Duration,
    link: tokio::sync::Mutex<Option<Link>>,
    notify: broadcast::Sender<Message>,
}

impl TcpTransport {
    /// `notify` receives every frame the node pushes unprompted.
    pub fn new(addr: impl Into<String>, notify: broadcast::Sender<Message>) -> Self {
        Self::with_timeout(addr, notify, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        addr: impl Into<String>,
        notify: broadcast::Sender<Message>,
        timeout: Duration,
    ) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            link: tokio::sync::Mutex::new(None),
            notify,
        }
    }

    async fn connect(&self) -> Result<Link> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let closed = CancellationToken::new();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let waiters = Arc::clone(&pending);
        let notify = self.notify.clone();
        let addr = self.addr.clone();
        let done = closed.clone();
        tokio::spawn(async move {
            let mut lines =
                FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            loop {
                tokio::select! {
                    line = lines.next() => match line {
                        Some(Ok(line)) => dispatch(&addr, &line, &waiters, &notify),
                        Some(Err(e)) => {
                            debug!(host = %addr, error = %e, "Upstream read failed");
                            break;
                        }
                        None => break,
                    },
                    _ = done.cancelled() => break,
                }
            }
            done.cancel();
            // Dropping the senders fails every outstanding request.
            waiters.lock().clear();
            debug!(host = %addr, "Upstream connection closed");
        });

        info!(host = %self.addr, "Connected to upstream");
        Ok(Link {
            writer,
            pending,
            closed,
        })
    }

    /// Register a waiter for `id` and write the frame, connecting first if
    /// needed.
    async fn write(&self, id: u64, frame: &[u8]) -> Result<oneshot::Receiver<Message>> {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(|l| l.closed.is_cancelled()) {
            *link = None;
        }
        if link.is_none() {
            *link = Some(self.connect().await?);
        }
        let Some(active) = link.as_mut() else {
            return Err(Error::Disconnected);
        };

        let (tx, rx) = oneshot::channel();
        active.pending.lock().insert(id, tx);

        let written = async {
            active.writer.write_all(frame).await?;
            active.writer.write_all(b"\n").await?;
            active.writer.flush().await
        };
        let error = match tokio::time::timeout(self.timeout, written).await {
            Ok(Ok(())) => return Ok(rx),
            Ok(Err(e)) => Error::Io(e),
            Err(_) => Error::Timeout,
        };
        active.closed.cancel();
        *link = None;
        Err(error)
    }
}

fn dispatch(
    addr: &str,
    line: &str,
    pending: &Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    notify: &broadcast::Sender<Message>,
) {
    let msg = match Message::parse(line.as_bytes()) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(host = %addr, error = %e, "Undecodable upstream frame");
            return;
        }
    };

    let waiter = match msg.numeric_id() {
        Some(id) if id != 0 && !msg.is_request() => pending.lock().remove(&id),
        _ => None,
    };
    match waiter {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => {
            trace!(host = %addr, method = ?msg.method, "Upstream notification");
            let _ = notify.send(msg);
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn id(&self) -> &str {
        &self.addr
    }

    async fn send(&self, req: &Request) -> Result<Message> {
        let id = req
            .numeric_id()
            .filter(|id| *id != 0)
            .ok_or_else(|| Error::Protocol("TCP requests need a nonzero numeric id".into()))?;
        let frame = serde_json::to_vec(req)?;
        let rx = self.write(id, &frame).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                if let Some(link) = self.link.lock().await.as_ref() {
                    link.pending.lock().remove(&id);
                }
                Err(Error::Timeout)
            }
        }
    }

    async fn on_failure(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.closed.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// A node that echoes each request's params, pushing a notification
    /// ahead of every response. `silent` requests get no answer.
    async fn spawn_node() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (r, mut w) = stream.into_split();
                    let mut lines = BufReader::new(r).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let req: Value = serde_json::from_str(&line).unwrap();
                        if req["method"] == "silent" {
                            continue;
                        }
                        let push = json!({"id": 0, "method": "mining.notify", "params": ["0xabc"]});
                        let resp = json!({"id": req["id"], "jsonrpc": "2.0", "result": req["params"]});
                        w.write_all(format!("{push}\n{resp}\n").as_bytes()).await.unwrap();
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn matches_responses_and_forwards_notifications() {
        let addr = spawn_node().await;
        let (notify, mut notifications) = broadcast::channel(8);
        let transport = TcpTransport::new(addr, notify);

        let msg = transport
            .send(&Request::new(9, "echo", json!([42])))
            .await
            .unwrap();
        assert_eq!(msg.numeric_id(), Some(9));
        assert_eq!(msg.into_result().unwrap(), json!([42]));

        let pushed = notifications.recv().await.unwrap();
        assert_eq!(pushed.method.as_deref(), Some("mining.notify"));
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let addr = spawn_node().await;
        let (notify, _) = broadcast::channel(8);
        let transport = TcpTransport::with_timeout(addr, notify, Duration::from_millis(200));

        let err = transport
            .send(&Request::new(1, "silent", json!([])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        let link = transport.link.lock().await;
        assert!(link.as_ref().unwrap().pending.lock().is_empty());
    }

    #[tokio::test]
    async fn reconnects_after_failure() {
        let addr = spawn_node().await;
        let (notify, _) = broadcast::channel(8);
        let transport = TcpTransport::new(addr, notify);

        transport
            .send(&Request::new(1, "echo", json!([])))
            .await
            .unwrap();
        transport.on_failure().await;
        let msg = transport
            .send(&Request::new(2, "echo", json!(["again"])))
            .await
            .unwrap();
        assert_eq!(msg.into_result().unwrap(), json!(["again"]));
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let (notify, _) = broadcast::channel(8);
        let transport = TcpTransport::new(addr, notify);
        let err = transport
            .send(&Request::new(1, "echo", json!([])))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn zero_id_is_refused() {
        let (notify, _) = broadcast::channel(8);
        let transport = TcpTransport::new("127.0.0.1:1", notify);
        assert!(matches!(
            transport.send(&Request::notification("x", json!([]))).await,
            Err(Error::Protocol(_))
        ));
    }
}
