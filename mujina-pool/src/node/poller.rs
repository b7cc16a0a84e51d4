//! Polling upstream for work.
//!
//! Most nodes only answer "what should I mine?" when asked, so adapters poll.
//! [`poll_jobs`] asks on every tick (or as soon as a host pushes a
//! notification) and yields a job whenever the upstream work changed or the
//! last job has grown older than the refresh interval.

use std::future::Future;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::Job;
use crate::rpc::Message;
use crate::tracing::prelude::*;

/// Timing of a [`poll_jobs`] loop.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Delay between fetches.
    pub period: Duration,
    /// Re-emit unchanged work this often.
    pub refresh: Duration,
}

/// Drive `fetch` until `shutdown`, yielding new work.
///
/// `fetch` returns `Ok(None)` when the node has nothing to offer yet.
/// Messages on `wake` trigger an immediate fetch.
pub fn poll_jobs<F, Fut>(
    chain: String,
    mut fetch: F,
    config: PollConfig,
    shutdown: CancellationToken,
    mut wake: Option<broadcast::Receiver<Message>>,
) -> BoxStream<'static, Job>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<Job>>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut last: Option<(String, u64)> = None;
        let mut last_emit = Instant::now();
        let mut failing = false;

        loop {
            match fetch().await {
                Ok(Some(job)) => {
                    if failing {
                        info!(chain = %chain, "Upstream work available again");
                        failing = false;
                    }
                    let key = (job.header_hash.clone(), job.height);
                    let changed = last.as_ref() != Some(&key);
                    if changed || last_emit.elapsed() >= config.refresh {
                        if changed {
                            debug!(chain = %chain, height = job.height, header = %job.header_hash, "New upstream work");
                        }
                        last = Some(key);
                        last_emit = Instant::now();
                        tokio::select! {
                            sent = tx.send(job) => if sent.is_err() { break },
                            _ = shutdown.cancelled() => break,
                        }
                    }
                }
                Ok(None) => trace!(chain = %chain, "No upstream work yet"),
                Err(e) => {
                    if !failing {
                        warn!(chain = %chain, error = %e, "Failed to fetch upstream work");
                        failing = true;
                    } else {
                        debug!(chain = %chain, error = %e, "Failed to fetch upstream work");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(config.period) => {}
                woken = recv_wake(&mut wake) => {
                    if matches!(woken, Err(broadcast::error::RecvError::Closed)) {
                        wake = None;
                    }
                }
                _ = tx.closed() => break,
                _ = shutdown.cancelled() => break,
            }
        }
        trace!(chain = %chain, "Job poller stopped.");
    });

    ReceiverStream::new(rx).boxed()
}

async fn recv_wake(
    wake: &mut Option<broadcast::Receiver<Message>>,
) -> std::result::Result<Message, broadcast::error::RecvError> {
    match wake {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
