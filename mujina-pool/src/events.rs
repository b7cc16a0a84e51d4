//! Per-miner event stream.
//!
//! Dashboards that want to follow a miner live subscribe to that miner's
//! channel on the aggregator and keep sending `ack|<miner id>` on the control
//! channel. Events are only published for miners acked within the last
//! [`ACK_WINDOW`]; everything else is dropped on the floor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::accounting::Aggregator;
use crate::error::{Error, Result};
use crate::stratum::conn::Conn;
use crate::tracing::prelude::*;

/// Channel listeners ack on.
pub const CONTROL_CHANNEL: &str = "events:control";

/// How long an ack keeps a miner's stream open.
pub const ACK_WINDOW: Duration = Duration::from_secs(15);

/// Acks older than this are forgotten.
pub const PURGE_AGE: Duration = Duration::from_secs(60);

pub const PURGE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Connect,
    Share,
    Retarget,
}

/// Wire shape of one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub chain: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub worker: String,
    pub client: String,
    pub port: u16,
    #[serde(rename = "isSolo")]
    pub is_solo: bool,
    pub data: Value,
}

impl Event {
    /// An event describing `conn`.
    pub fn for_conn(chain: &str, kind: EventKind, conn: &Conn, data: Value) -> Self {
        Self {
            chain: chain.to_string(),
            kind,
            worker: conn.worker().to_string(),
            client: conn.client().to_string(),
            port: conn.port(),
            is_solo: conn.is_solo(),
            data,
        }
    }
}

/// The channel a miner's events go to.
pub fn miner_channel(miner_id: u64) -> String {
    format!("events:{miner_id}")
}

/// Parse `ack|<miner id>`.
fn parse_ack(msg: &str) -> Option<u64> {
    let (verb, miner_id) = msg.split_once('|')?;
    if verb != "ack" {
        return None;
    }
    miner_id.trim().parse().ok()
}

pub struct EventWriter {
    aggregator: Arc<dyn Aggregator>,
    acks: Mutex<HashMap<u64, Instant>>,
}

impl EventWriter {
    pub fn new(aggregator: Arc<dyn Aggregator>) -> Self {
        Self {
            aggregator,
            acks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ack(&self, miner_id: u64, now: Instant) {
        self.acks.lock().insert(miner_id, now);
    }

    /// Handle one control message. Returns whether it was an ack.
    pub fn handle_control(&self, msg: &str, now: Instant) -> bool {
        match parse_ack(msg) {
            Some(miner_id) => {
                self.ack(miner_id, now);
                true
            }
            None => {
                debug!(msg, "Ignoring control message");
                false
            }
        }
    }

    pub fn is_live(&self, miner_id: u64, now: Instant) -> bool {
        self.acks
            .lock()
            .get(&miner_id)
            .is_some_and(|at| now.saturating_duration_since(*at) <= ACK_WINDOW)
    }

    /// Drop acks older than [`PURGE_AGE`].
    pub fn purge(&self, now: Instant) -> usize {
        let mut acks = self.acks.lock();
        let before = acks.len();
        acks.retain(|_, at| now.saturating_duration_since(*at) <= PURGE_AGE);
        before - acks.len()
    }

    /// Publish `event` to the miner's channel if someone is listening.
    /// Returns whether it was sent.
    pub async fn write(&self, miner_id: u64, event: &Event) -> Result<bool> {
        if !self.is_live(miner_id, Instant::now()) {
            return Ok(false);
        }
        let payload = serde_json::to_string(event)?;
        self.aggregator
            .publish(&miner_channel(miner_id), &payload)
            .await?;
        Ok(true)
    }

    /// Like [`EventWriter::write`], logging instead of returning failures.
    pub async fn emit(&self, miner_id: u64, event: Event) {
        if let Err(e) = self.write(miner_id, &event).await {
            debug!(miner_id, kind = %event.kind, error = %e, "Event dropped");
        }
    }

    /// Follow the control channel and purge stale acks until shutdown.
    /// Fails if the channel cannot be subscribed or closes early, so the
    /// caller can start it again.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut control = self.aggregator.subscribe(CONTROL_CHANNEL).await?;
        let mut purge = tokio::time::interval(PURGE_PERIOD);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = control.next() => match msg {
                    Some(msg) => {
                        self.handle_control(&msg, Instant::now());
                    }
                    None if shutdown.is_cancelled() => return Ok(()),
                    None => {
                        return Err(Error::Aggregator("event control channel closed".into()));
                    }
                },
                _ = purge.tick() => {
                    let purged = self.purge(Instant::now());
                    if purged > 0 {
                        trace!(purged, "Purged stale event acks");
                    }
                }
            }
        }
    }
}
