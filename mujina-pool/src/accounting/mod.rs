//! Collaborators the share pipeline reports to.
//!
//! The pool does not own payout, storage or alerting. It talks to them
//! through three traits:
//!
//! - [`Accounting`]: the durable store of miners, workers, rounds and
//!   round shares.
//! - [`Aggregator`]: the fast, write-heavy store of id caches, per-interval
//!   share counters, duplicate detection and pub/sub.
//! - [`Notifier`]: out-of-band alerts when a block is found.
//!
//! [`memory`] provides in-process implementations of all three.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::node::{Round, ShareStatus};

pub use memory::{LogNotifier, MemoryAccounting, MemoryAggregator};

/// One share outcome, as counted per interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRecord {
    pub miner_id: u64,
    pub worker_id: u64,
    pub status: ShareStatus,
    pub is_solo: bool,
    /// Difficulty factor the share was judged at.
    pub diff_factor: u64,
}

/// A found block, ready for the rounds table.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundRecord {
    pub round: Round,
    pub miner_id: u64,
    pub worker_id: u64,
    pub is_solo: bool,
    /// Accepted shares in the round, the winning one excluded.
    pub accepted_shares: u64,
    /// `100 * round difficulty / (share difficulty * (accepted + 1))`
    pub luck: f64,
}

/// Shares one miner contributed to a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundShare {
    pub round_id: u64,
    pub miner_id: u64,
    pub shares: u64,
}

/// Per-miner activity flushed once a minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinerStat {
    pub miner_id: u64,
    /// Unix milliseconds of the last share.
    pub last_share_at: i64,
    /// Summed handler latency, microseconds.
    pub latency_us: u64,
    pub requests: u64,
}

/// Durable store.
#[async_trait]
pub trait Accounting: Send + Sync + 'static {
    async fn get_miner_id(&self, chain: &str, address: &str) -> Result<Option<u64>>;

    async fn insert_miner(&self, chain: &str, address: &str) -> Result<u64>;

    async fn get_worker_id(&self, miner_id: u64, name: &str) -> Result<Option<u64>>;

    async fn insert_worker(&self, miner_id: u64, name: &str) -> Result<u64>;

    /// Store a found block; returns the round id.
    async fn insert_round(&self, round: &RoundRecord) -> Result<u64>;

    async fn insert_round_shares(&self, shares: &[RoundShare]) -> Result<()>;
}

/// Fast shared state.
#[async_trait]
pub trait Aggregator: Send + Sync + 'static {
    async fn get_miner_id(&self, chain: &str, address: &str) -> Result<Option<u64>>;

    async fn set_miner_id(&self, chain: &str, address: &str, miner_id: u64) -> Result<()>;

    async fn get_worker_id(&self, miner_id: u64, name: &str) -> Result<Option<u64>>;

    async fn set_worker_id(&self, miner_id: u64, name: &str, worker_id: u64) -> Result<()>;

    /// Register a height whose shares are tracked for duplicates.
    async fn add_share_index_height(&self, chain: &str, height: u64) -> Result<()>;

    async fn share_index_heights(&self, chain: &str) -> Result<Vec<u64>>;

    /// Forget a height and every share hash indexed under it.
    async fn remove_share_index_height(&self, chain: &str, height: u64) -> Result<()>;

    /// Record a share hash; `false` if it was already seen at this height.
    async fn add_unique_share(&self, chain: &str, height: u64, hash: &str) -> Result<bool>;

    /// Announce an interval, once per interval per chain.
    async fn add_interval(&self, chain: &str, interval: &str) -> Result<()>;

    async fn add_share(&self, chain: &str, interval: &str, share: &ShareRecord) -> Result<()>;

    /// Accepted shares in the current round.
    async fn round_shares(&self, chain: &str) -> Result<u64>;

    /// Accepted shares in the current round, per miner.
    async fn miner_round_shares(&self, chain: &str) -> Result<HashMap<u64, u64>>;

    /// Start a new round after a block.
    async fn reset_round(&self, chain: &str) -> Result<()>;

    async fn set_miner_stats(&self, chain: &str, stats: &[MinerStat]) -> Result<()>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}

/// Block alerts.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn block_found(&self, round: &RoundRecord, miner: &str) -> Result<()>;
}
