//! In-process collaborators.
//!
//! Everything lives in hash maps behind one lock per store. Good enough for
//! a single pool process and for tests; state is lost on restart.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    Accounting, Aggregator, MinerStat, Notifier, RoundRecord, RoundShare, ShareRecord,
};
use crate::error::{Error, Result};
use crate::node::ShareStatus;
use crate::tracing::prelude::*;

const PUBSUB_DEPTH: usize = 256;

#[derive(Debug, Default)]
struct Tables {
    miners: HashMap<(String, String), u64>,
    workers: HashMap<(u64, String), u64>,
    rounds: Vec<RoundRecord>,
    round_shares: Vec<RoundShare>,
    next_id: u64,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Accounting tables in memory.
#[derive(Debug, Default)]
pub struct MemoryAccounting {
    tables: Mutex<Tables>,
}

impl MemoryAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rounds(&self) -> Vec<RoundRecord> {
        self.tables.lock().rounds.clone()
    }

    pub fn round_shares(&self) -> Vec<RoundShare> {
        self.tables.lock().round_shares.clone()
    }
}

#[async_trait]
impl Accounting for MemoryAccounting {
    async fn get_miner_id(&self, chain: &str, address: &str) -> Result<Option<u64>> {
        let key = (chain.to_string(), address.to_string());
        Ok(self.tables.lock().miners.get(&key).copied())
    }

    async fn insert_miner(&self, chain: &str, address: &str) -> Result<u64> {
        let mut tables = self.tables.lock();
        let key = (chain.to_string(), address.to_string());
        if let Some(id) = tables.miners.get(&key) {
            return Ok(*id);
        }
        let id = tables.next_id();
        tables.miners.insert(key, id);
        Ok(id)
    }

    async fn get_worker_id(&self, miner_id: u64, name: &str) -> Result<Option<u64>> {
        let key = (miner_id, name.to_string());
        Ok(self.tables.lock().workers.get(&key).copied())
    }

    async fn insert_worker(&self, miner_id: u64, name: &str) -> Result<u64> {
        let mut tables = self.tables.lock();
        let key = (miner_id, name.to_string());
        if let Some(id) = tables.workers.get(&key) {
            return Ok(*id);
        }
        let id = tables.next_id();
        tables.workers.insert(key, id);
        Ok(id)
    }

    async fn insert_round(&self, round: &RoundRecord) -> Result<u64> {
        let mut tables = self.tables.lock();
        tables.rounds.push(round.clone());
        Ok(tables.rounds.len() as u64)
    }

    async fn insert_round_shares(&self, shares: &[RoundShare]) -> Result<()> {
        self.tables.lock().round_shares.extend_from_slice(shares);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Store {
    miner_ids: HashMap<(String, String), u64>,
    worker_ids: HashMap<(u64, String), u64>,
    /// chain -> heights
    share_index: HashMap<String, BTreeSet<u64>>,
    /// (chain, height) -> share hashes
    unique: HashMap<(String, u64), HashSet<String>>,
    intervals: HashMap<String, Vec<String>>,
    shares: HashMap<(String, String), Vec<ShareRecord>>,
    round: HashMap<String, HashMap<u64, u64>>,
    miner_stats: HashMap<String, HashMap<u64, MinerStat>>,
}

/// Aggregator state in memory, with pub/sub over broadcast channels.
#[derive(Debug, Default)]
pub struct MemoryAggregator {
    store: Mutex<Store>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares recorded for one interval.
    pub fn shares(&self, chain: &str, interval: &str) -> Vec<ShareRecord> {
        let key = (chain.to_string(), interval.to_string());
        self.store
            .lock()
            .shares
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// Intervals announced for a chain, oldest first.
    pub fn intervals(&self, chain: &str) -> Vec<String> {
        self.store
            .lock()
            .intervals
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }

    pub fn miner_stats(&self, chain: &str, miner_id: u64) -> Option<MinerStat> {
        self.store
            .lock()
            .miner_stats
            .get(chain)
            .and_then(|stats| stats.get(&miner_id))
            .copied()
    }

    fn topic(&self, channel: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(PUBSUB_DEPTH).0)
            .clone()
    }
}

#[async_trait]
impl Aggregator for MemoryAggregator {
    async fn get_miner_id(&self, chain: &str, address: &str) -> Result<Option<u64>> {
        let key = (chain.to_string(), address.to_string());
        Ok(self.store.lock().miner_ids.get(&key).copied())
    }

    async fn set_miner_id(&self, chain: &str, address: &str, miner_id: u64) -> Result<()> {
        let key = (chain.to_string(), address.to_string());
        self.store.lock().miner_ids.insert(key, miner_id);
        Ok(())
    }

    async fn get_worker_id(&self, miner_id: u64, name: &str) -> Result<Option<u64>> {
        let key = (miner_id, name.to_string());
        Ok(self.store.lock().worker_ids.get(&key).copied())
    }

    async fn set_worker_id(&self, miner_id: u64, name: &str, worker_id: u64) -> Result<()> {
        let key = (miner_id, name.to_string());
        self.store.lock().worker_ids.insert(key, worker_id);
        Ok(())
    }

    async fn add_share_index_height(&self, chain: &str, height: u64) -> Result<()> {
        self.store
            .lock()
            .share_index
            .entry(chain.to_string())
            .or_default()
            .insert(height);
        Ok(())
    }

    async fn share_index_heights(&self, chain: &str) -> Result<Vec<u64>> {
        let store = self.store.lock();
        Ok(store
            .share_index
            .get(chain)
            .map(|heights| heights.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn remove_share_index_height(&self, chain: &str, height: u64) -> Result<()> {
        let mut store = self.store.lock();
        if let Some(heights) = store.share_index.get_mut(chain) {
            heights.remove(&height);
        }
        store.unique.remove(&(chain.to_string(), height));
        Ok(())
    }

    async fn add_unique_share(&self, chain: &str, height: u64, hash: &str) -> Result<bool> {
        Ok(self
            .store
            .lock()
            .unique
            .entry((chain.to_string(), height))
            .or_default()
            .insert(hash.to_string()))
    }

    async fn add_interval(&self, chain: &str, interval: &str) -> Result<()> {
        let mut store = self.store.lock();
        let intervals = store.intervals.entry(chain.to_string()).or_default();
        if intervals.last().map(String::as_str) != Some(interval) {
            intervals.push(interval.to_string());
        }
        Ok(())
    }

    async fn add_share(&self, chain: &str, interval: &str, share: &ShareRecord) -> Result<()> {
        let mut store = self.store.lock();
        store
            .shares
            .entry((chain.to_string(), interval.to_string()))
            .or_default()
            .push(share.clone());
        if share.status == ShareStatus::Accepted {
            *store
                .round
                .entry(chain.to_string())
                .or_default()
                .entry(share.miner_id)
                .or_default() += 1;
        }
        Ok(())
    }

    async fn round_shares(&self, chain: &str) -> Result<u64> {
        let store = self.store.lock();
        Ok(store
            .round
            .get(chain)
            .map(|miners| miners.values().sum())
            .unwrap_or_default())
    }

    async fn miner_round_shares(&self, chain: &str) -> Result<HashMap<u64, u64>> {
        Ok(self
            .store
            .lock()
            .round
            .get(chain)
            .cloned()
            .unwrap_or_default())
    }

    async fn reset_round(&self, chain: &str) -> Result<()> {
        self.store.lock().round.remove(chain);
        Ok(())
    }

    async fn set_miner_stats(&self, chain: &str, stats: &[MinerStat]) -> Result<()> {
        let mut store = self.store.lock();
        let table = store.miner_stats.entry(chain.to_string()).or_default();
        for stat in stats {
            table.insert(stat.miner_id, *stat);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No subscribers is not an error; the message is simply lost.
        let _ = self.topic(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let rx = self.topic(channel).subscribe();
        let channel = channel.to_string();
        Ok(BroadcastStream::new(rx)
            .filter_map(move |msg| {
                let msg = match msg {
                    Ok(msg) => Some(msg),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Subscriber fell behind");
                        None
                    }
                };
                futures::future::ready(msg)
            })
            .boxed())
    }
}

/// Logs found blocks.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn block_found(&self, round: &RoundRecord, miner: &str) -> Result<()> {
        if round.round.chain.is_empty() {
            return Err(Error::Accounting("round without chain".into()));
        }
        info!(
            chain = %round.round.chain,
            height = round.round.height,
            hash = %round.round.hash,
            miner,
            luck = round.luck,
            solo = round.is_solo,
            "Block found"
        );
        Ok(())
    }
}
