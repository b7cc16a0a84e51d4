//! Job fan-out to subscribed connections.
//!
//! Connections are bucketed by (client type, difficulty factor) so a job is
//! marshalled once per bucket, not once per miner. Each connection has a
//! single-slot mailbox: publishing overwrites whatever is still queued, so a
//! slow miner only ever receives the newest job and never holds up the
//! producer.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{Appended, Job, JobList};
use crate::error::Result;
use crate::node::{ClientType, MiningNode};
use crate::rpc::{notify_id, Outbound};
use crate::stratum::conn::Conn;
use crate::tracing::prelude::*;

type Mailbox = watch::Sender<Option<Bytes>>;

/// client type -> difficulty factor -> connection id -> mailbox
type Subscriptions = HashMap<ClientType, HashMap<u64, HashMap<u64, Mailbox>>>;

/// Owns a chain's job list and its subscribers.
pub struct JobManager {
    jobs: JobList,
    node: Arc<dyn MiningNode>,
    subs: RwLock<Subscriptions>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl JobManager {
    pub fn new(jobs: JobList, node: Arc<dyn MiningNode>, shutdown: CancellationToken) -> Self {
        Self {
            jobs,
            node,
            subs: RwLock::new(HashMap::new()),
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    pub fn jobs(&self) -> &JobList {
        &self.jobs
    }

    pub fn get_job(&self, id: &str) -> Option<(Arc<Job>, bool)> {
        self.jobs.get(id)
    }

    pub fn get_prior_job(&self, id: &str) -> Option<(Arc<Job>, bool)> {
        self.jobs.get_prior(id)
    }

    pub fn latest(&self) -> Option<Arc<Job>> {
        self.jobs.latest()
    }

    pub fn oldest(&self) -> Option<Arc<Job>> {
        self.jobs.oldest()
    }

    pub fn height(&self) -> u64 {
        self.jobs.height()
    }

    /// The latest job marshalled for one connection, if there is a job yet.
    pub fn latest_for(&self, conn: &Conn) -> Result<Option<Outbound>> {
        let Some(job) = self.jobs.latest() else {
            return Ok(None);
        };
        let id = notify_id();
        self.node
            .marshal_job(&id, &job, true, conn.client_type(), conn.diff_factor())
            .map(Some)
    }

    /// Subscribe `conn` to new jobs and start its delivery task. The task
    /// first sends the latest job, if there is one; the snapshot is taken
    /// under the subscription lock so no job published meanwhile is lost.
    /// Returns `false` if the connection was already subscribed.
    ///
    /// The task ends when the pool shuts down, the connection closes, the
    /// connection is removed, or a write fails.
    pub fn add_conn(&self, conn: Arc<Conn>) -> bool {
        let (tx, mut rx) = watch::channel(None::<Bytes>);
        {
            let mut subs = self.subs.write();
            let subscribed = subs
                .values()
                .flat_map(|diffs| diffs.values())
                .any(|mailboxes| mailboxes.contains_key(&conn.id()));
            if subscribed {
                return false;
            }
            let latest = self
                .latest_for(&conn)
                .and_then(|msg| msg.map(|msg| msg.to_bytes()).transpose());
            match latest {
                Ok(Some(frame)) => {
                    tx.send_replace(Some(frame));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(conn_id = conn.id(), error = %e, "Failed to marshal latest job");
                }
            }
            subs.entry(conn.client_type())
                .or_default()
                .entry(conn.diff_factor())
                .or_default()
                .insert(conn.id(), tx);
        }

        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = conn.closed() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let frame = rx.borrow_and_update().clone();
                        let Some(frame) = frame else {
                            continue;
                        };
                        if let Err(e) = conn.write(&frame).await {
                            debug!(conn_id = conn.id(), error = %e, "Job delivery failed");
                            break;
                        }
                    }
                }
            }
            trace!(conn_id = conn.id(), "Job delivery stopped");
        });
        true
    }

    /// Unsubscribe a connection, ending its delivery task.
    ///
    /// A connection lives in exactly one bucket, so the search stops at the
    /// first hit.
    pub fn remove_conn(&self, conn_id: u64) -> bool {
        let mut subs = self.subs.write();
        for diffs in subs.values_mut() {
            for mailboxes in diffs.values_mut() {
                if mailboxes.remove(&conn_id).is_some() {
                    return true;
                }
            }
        }
        false
    }

    /// Move a subscribed connection to the bucket for a new difficulty
    /// factor, keeping its delivery task.
    pub fn move_conn(&self, conn_id: u64, client_type: ClientType, from: u64, to: u64) -> bool {
        if from == to {
            return true;
        }
        let mut subs = self.subs.write();
        let Some(diffs) = subs.get_mut(&client_type) else {
            return false;
        };
        let Some(mailbox) = diffs.get_mut(&from).and_then(|m| m.remove(&conn_id)) else {
            return false;
        };
        diffs.entry(to).or_default().insert(conn_id, mailbox);
        true
    }

    /// Number of subscribed connections.
    pub fn subscribers(&self) -> usize {
        self.subs
            .read()
            .values()
            .flat_map(|diffs| diffs.values())
            .map(HashMap::len)
            .sum()
    }

    /// Append `job` and publish it to every subscriber.
    ///
    /// Returns `None` when the job list refused the job as a duplicate; in
    /// that case nothing is published.
    pub fn update(&self, job: Job) -> Option<Appended> {
        let appended = self.jobs.append(job)?;
        let id = notify_id();

        let mut subs = self.subs.write();
        for (client_type, diffs) in subs.iter_mut() {
            for (diff_factor, mailboxes) in diffs.iter_mut() {
                if mailboxes.is_empty() {
                    continue;
                }
                let frame = self
                    .node
                    .marshal_job(
                        &id,
                        &appended.job,
                        appended.clean_jobs,
                        *client_type,
                        *diff_factor,
                    )
                    .and_then(|msg| msg.to_bytes());
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(
                            job_id = %appended.job.id,
                            client_type = %client_type,
                            diff_factor,
                            error = %e,
                            "Failed to marshal job"
                        );
                        continue;
                    }
                };

                // A failed send means the delivery task is gone.
                mailboxes.retain(|_, tx| tx.send(Some(frame.clone())).is_ok());
            }
            diffs.retain(|_, mailboxes| !mailboxes.is_empty());
        }
        subs.retain(|_, diffs| !diffs.is_empty());

        Some(appended)
    }

    /// Wait for every delivery task to finish. Call after shutdown.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
