//! The pool: one chain, one stratum port.
//!
//! [`Pool`] wires the stratum server, the chain adapter, the job manager and
//! the collaborators together. It runs a handful of long-lived loops
//! (upstream pings, job notifications, share-index cleanup, miner stats) and
//! a dispatcher that routes each inbound request to a handler task.

pub mod interval;
pub mod login;
pub mod router;
pub mod submit;
pub mod supervise;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::accounting::{
    Accounting, Aggregator, LogNotifier, MemoryAccounting, MemoryAggregator, MinerStat, Notifier,
};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::events::EventWriter;
use crate::job::{Job, JobList, JobManager};
use crate::node::MiningNode;
use crate::rpc::{ErrorCode, Message, Outbound};
use crate::stratum::conn::Conn;
use crate::stratum::server::{Inbound, Server, Streams};
use crate::tracing::prelude::*;
use crate::vardiff::VarDiffManager;

use interval::Intervals;
use router::{route, ChainFamily, Handler};
use supervise::{catch_panic, supervise};

/// Warn when upstream has produced no job for this long.
pub const JOB_DEAD_MAN: Duration = Duration::from_secs(10 * 60);

pub const SHARE_INDEX_CLEAN_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Heights below the oldest job that keep their duplicate index.
pub const MIN_SHARE_INDEX_AGE: u64 = 3;

pub const MINER_STATS_PERIOD: Duration = Duration::from_secs(60);

/// The external services a pool reports to.
#[derive(Clone)]
pub struct Collaborators {
    pub accounting: Arc<dyn Accounting>,
    pub aggregator: Arc<dyn Aggregator>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            accounting: Arc::new(MemoryAccounting::new()),
            aggregator: Arc::new(MemoryAggregator::new()),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Hands out extranonce-1 values: `2 * size` hex digits, never zero.
#[derive(Debug)]
pub struct ExtranonceAllocator {
    last: AtomicU64,
    max: u64,
    width: usize,
}

impl ExtranonceAllocator {
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, 8);
        let max = if size == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * size)) - 1
        };
        Self {
            last: AtomicU64::new(0),
            max,
            width: size * 2,
        }
    }

    pub fn next(&self) -> String {
        let max = self.max;
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(if cur >= max { 1 } else { cur + 1 })
            })
            .unwrap_or_default();
        let n = if prev >= max { 1 } else { prev + 1 };
        format!("{:0width$x}", n, width = self.width)
    }
}

/// A stratum pool for one chain.
pub struct Pool {
    config: PoolConfig,
    family: ChainFamily,
    node: Arc<dyn MiningNode>,
    jobs: JobManager,
    vardiff: VarDiffManager,
    collab: Collaborators,
    events: Arc<EventWriter>,
    intervals: Arc<Intervals>,
    extranonces: ExtranonceAllocator,
    stats: Mutex<HashMap<u64, MinerStat>>,
    connections: AtomicI64,
    server: Arc<Server>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        node: Arc<dyn MiningNode>,
        collab: Collaborators,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let family = ChainFamily::of(&config.chain)
            .ok_or_else(|| Error::Config(format!("unsupported chain {}", config.chain)))?;
        let server = Arc::new(Server::new(
            config.listen_addr()?,
            config.handshake_timeout(),
            shutdown.clone(),
        ));
        let jobs = JobManager::new(
            JobList::new(config.job_list_size, config.job_list_age_limit),
            Arc::clone(&node),
            shutdown.clone(),
        );
        Ok(Arc::new(Self {
            family,
            jobs,
            vardiff: VarDiffManager::new(),
            events: Arc::new(EventWriter::new(Arc::clone(&collab.aggregator))),
            intervals: Arc::new(Intervals::new()),
            extranonces: ExtranonceAllocator::new(config.extranonce1_size),
            stats: Mutex::new(HashMap::new()),
            connections: AtomicI64::new(0),
            server,
            shutdown,
            tracker: TaskTracker::new(),
            node,
            collab,
            config,
        }))
    }

    pub fn chain(&self) -> &str {
        &self.config.chain
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    /// Live stratum connections.
    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Acquire)
    }

    /// Bind the stratum port and start every loop. Returns the bound
    /// address. A bind failure is fatal.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let streams = self.server.start().await?;
        let addr = self
            .server
            .local_addr()
            .ok_or_else(|| Error::Config("listener has no address".into()))?;
        info!(chain = %self.chain(), addr = %addr, "Pool started");

        let events = Arc::clone(&self.events);
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(supervise("events", self.shutdown.clone(), move || {
            Arc::clone(&events).run(shutdown.clone())
        }));

        let pool = Arc::clone(self);
        self.tracker.spawn(supervise("ping_hosts", self.shutdown.clone(), move || {
            Arc::clone(&pool).ping_loop()
        }));

        let pool = Arc::clone(self);
        self.tracker.spawn(supervise("job_notify", self.shutdown.clone(), move || {
            Arc::clone(&pool).job_notify_loop()
        }));

        let pool = Arc::clone(self);
        self.tracker
            .spawn(supervise("share_index_cleaner", self.shutdown.clone(), move || {
                Arc::clone(&pool).share_index_loop()
            }));

        let pool = Arc::clone(self);
        self.tracker
            .spawn(supervise("miner_stats", self.shutdown.clone(), move || {
                Arc::clone(&pool).miner_stats_loop()
            }));

        let pool = Arc::clone(self);
        self.tracker.spawn(async move {
            pool.stratum_loop(streams).await;
        });

        Ok(addr)
    }

    /// Wait for every task to finish. Call after cancelling the shutdown
    /// token.
    pub async fn wait(&self) {
        self.server.wait().await;
        self.jobs.wait().await;
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Start, run until shutdown, and wait for everything to stop.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.start().await?;
        self.shutdown.cancelled().await;
        self.wait().await;
        info!(chain = %self.chain(), "Pool stopped");
        Ok(())
    }

    async fn ping_loop(self: Arc<Self>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.pinging_period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => self.node.ping_hosts().await,
            }
        }
    }

    /// Feed jobs from the node into the job manager. Fails when the node's
    /// job stream ends before shutdown.
    async fn job_notify_loop(self: Arc<Self>) -> Result<()> {
        let mut jobs = Arc::clone(&self.node)
            .job_notify(self.shutdown.clone(), self.config.polling_period());
        let dead_man = tokio::time::sleep(JOB_DEAD_MAN);
        tokio::pin!(dead_man);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                job = jobs.next() => match job {
                    Some(job) => {
                        dead_man.as_mut().reset(Instant::now() + JOB_DEAD_MAN);
                        self.on_job(job).await;
                    }
                    None if self.shutdown.is_cancelled() => return Ok(()),
                    None => return Err(Error::Node("job stream ended".into())),
                },
                _ = &mut dead_man => {
                    warn!(chain = %self.chain(), "No new jobs in 10 minutes");
                    dead_man.as_mut().reset(Instant::now() + JOB_DEAD_MAN);
                }
            }
        }
    }

    async fn on_job(&self, job: Job) {
        let Some(appended) = self.jobs.update(job) else {
            trace!(chain = %self.chain(), "Duplicate job ignored");
            return;
        };
        debug!(
            chain = %self.chain(),
            job_id = %appended.job.id,
            height = appended.job.height,
            clean_jobs = appended.clean_jobs,
            subscribers = self.jobs.subscribers(),
            "New job"
        );
        if appended.new_height {
            info!(chain = %self.chain(), height = appended.job.height, "New height");
            if let Err(e) = self
                .collab
                .aggregator
                .add_share_index_height(self.chain(), appended.job.height)
                .await
            {
                warn!(height = appended.job.height, error = %e, "Failed to index height");
            }
        }
    }

    async fn share_index_loop(self: Arc<Self>) -> Result<()> {
        let mut ticker = tokio::time::interval(SHARE_INDEX_CLEAN_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.clean_share_index().await {
                        warn!(error = %e, "Share index cleanup failed");
                    }
                }
            }
        }
    }

    /// Drop duplicate-share indexes for heights no job can reach any more.
    /// Returns how many heights were removed.
    pub async fn clean_share_index(&self) -> Result<usize> {
        let Some(oldest) = self.jobs.oldest() else {
            return Ok(0);
        };
        let keep = MIN_SHARE_INDEX_AGE.max(self.config.job_list_age_limit.max(0) as u64);
        let aggregator = &self.collab.aggregator;

        let mut removed = 0;
        for height in aggregator.share_index_heights(self.chain()).await? {
            if height.saturating_add(keep) < oldest.height {
                aggregator
                    .remove_share_index_height(self.chain(), height)
                    .await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, oldest = oldest.height, "Cleaned share index");
        }
        Ok(removed)
    }

    async fn miner_stats_loop(self: Arc<Self>) -> Result<()> {
        let mut ticker = tokio::time::interval(MINER_STATS_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_miner_stats().await {
                        warn!(error = %e, "Failed to push miner stats");
                    }
                }
            }
        }
    }

    /// Swap out the accumulated per-miner stats and push them in one call.
    pub async fn flush_miner_stats(&self) -> Result<usize> {
        let stats: Vec<MinerStat> = std::mem::take(&mut *self.stats.lock())
            .into_values()
            .collect();
        if stats.is_empty() {
            return Ok(0);
        }
        self.collab
            .aggregator
            .set_miner_stats(self.chain(), &stats)
            .await?;
        Ok(stats.len())
    }

    fn record_request(&self, conn: &Conn, elapsed: Duration) {
        let miner_id = conn.miner_id();
        if miner_id == 0 {
            return;
        }
        let mut stats = self.stats.lock();
        let stat = stats.entry(miner_id).or_insert(MinerStat {
            miner_id,
            last_share_at: 0,
            latency_us: 0,
            requests: 0,
        });
        stat.last_share_at = stat.last_share_at.max(conn.last_share_at());
        stat.latency_us += elapsed.as_micros() as u64;
        stat.requests += 1;
    }

    async fn stratum_loop(self: Arc<Self>, mut streams: Streams) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(conn_id) = streams.connects.recv() => {
                    let live = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
                    trace!(conn_id, live, "Miner connected");
                }
                Some(conn_id) = streams.disconnects.recv() => {
                    let live = self.connections.fetch_sub(1, Ordering::AcqRel) - 1;
                    trace!(conn_id, live, "Miner disconnected");
                    let pool = Arc::clone(&self);
                    self.tracker.spawn(async move {
                        pool.jobs.remove_conn(conn_id);
                        pool.vardiff.remove(conn_id);
                    });
                }
                Some(inbound) = streams.messages.recv() => self.dispatch(inbound),
                Some(e) = streams.errors.recv() => {
                    warn!(error = %e, "Stratum server error");
                }
                else => break,
            }
        }
        trace!("Stratum loop stopped.");
    }

    fn dispatch(self: &Arc<Self>, inbound: Inbound) {
        let Inbound { conn, msg } = inbound;
        let Some(method) = msg.method.as_deref() else {
            trace!(conn_id = conn.id(), "Ignoring frame without method");
            return;
        };
        let Some(handler) = route(self.family, method) else {
            debug!(conn_id = conn.id(), method, "Dropping unknown method");
            return;
        };

        let pool = Arc::clone(self);
        self.tracker.spawn(async move {
            let started = Instant::now();
            catch_panic(handler.into(), pool.handle(handler, &conn, &msg)).await;
            pool.record_request(&conn, started.elapsed());
        });
    }

    /// Run one handler and write its replies.
    pub(crate) async fn handle(&self, handler: Handler, conn: &Arc<Conn>, msg: &Message) {
        let replies = match handler {
            Handler::Subscribe => self.handle_subscribe(conn, msg),
            Handler::Login => self.handle_login(conn, msg).await,
            Handler::Submit => self.handle_submit(conn, msg).await,
            Handler::ExtranonceSubscribe => {
                conn.set_extranonce_subscribed(true);
                Ok(vec![self.ack(msg, true)])
            }
            Handler::SubmitHashrate => Ok(vec![self.ack(msg, true)]),
            Handler::GetWork => self.handle_get_work(conn, msg),
        };
        let replies = replies.unwrap_or_else(|e| {
            warn!(conn_id = conn.id(), handler = %handler, error = %e, "Handler failed");
            conn.record_error();
            vec![Outbound::error(msg.reply_id(), ErrorCode::InvalidRequest)]
        });
        self.write_all(conn, &replies).await;

        // Subscribing only after the login replies are out keeps job
        // notifications behind them.
        if handler == Handler::Login && conn.authorized() && !conn.is_closed() {
            self.jobs.add_conn(Arc::clone(conn));
        }
    }

    async fn write_all(&self, conn: &Conn, replies: &[Outbound]) {
        for reply in replies {
            let frame = match reply.to_bytes() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(conn_id = conn.id(), error = %e, "Failed to encode reply");
                    continue;
                }
            };
            if let Err(e) = conn.write(&frame).await {
                debug!(conn_id = conn.id(), error = %e, "Write failed");
                return;
            }
        }
    }

    /// A boolean result in the configured response shape.
    fn ack(&self, msg: &Message, ok: bool) -> Outbound {
        Outbound::response(
            msg.reply_id(),
            json!(ok),
            self.config.force_error_on_response,
        )
    }

    fn handle_subscribe(&self, conn: &Conn, msg: &Message) -> Result<Vec<Outbound>> {
        let client = msg.string_param(0).unwrap_or_default();
        conn.set_client(client);
        conn.set_client_type(self.node.client_type(client));

        let extranonce = self.extranonces.next();
        conn.set_extranonce(extranonce.clone());
        conn.set_subscribed(true);
        debug!(
            conn_id = conn.id(),
            client,
            client_type = %conn.client_type(),
            extranonce = %extranonce,
            "Subscribed"
        );

        let id = msg.reply_id();
        self.node
            .subscribe_responses(&id, &format!("{:016x}", conn.id()), &extranonce)
    }

    fn handle_get_work(&self, conn: &Conn, msg: &Message) -> Result<Vec<Outbound>> {
        if !conn.authorized() {
            return Ok(vec![Outbound::error(msg.reply_id(), ErrorCode::InvalidAuth)]);
        }
        let Some(job) = self.jobs.latest() else {
            return Ok(vec![Outbound::error(
                msg.reply_id(),
                ErrorCode::InvalidRequest,
            )]);
        };
        let id = msg.reply_id();
        let work = self.node.marshal_job(
            &id,
            &job,
            false,
            conn.client_type(),
            conn.diff_factor(),
        )?;
        Ok(vec![work])
    }

    /// Chain key shares from `conn` are accounted under.
    fn accounting_chain(&self, conn: &Conn) -> &str {
        if conn.is_solo() {
            self.config.solo_chain()
        } else {
            self.chain()
        }
    }
}
