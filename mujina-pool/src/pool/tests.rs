//! End-to-end tests: a real pool on loopback, a scripted chain, and the
//! in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use ruint::aliases::U256;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::accounting::{MemoryAccounting, MemoryAggregator};
use crate::node::test_util::{nonce_hex, ScriptedNode};
use crate::node::ShareStatus;
use crate::stratum::conn::test_util::pipe_conn;

/// Share difficulty at factor 1.
const SHARE_BASE: u64 = 1000;

const ETC_ADDR: &str = "0xae8c89152d34206b5bbaaebee2a50e163466f73d";

/// Blocks need a hash at or below 2^128.
fn block_difficulty() -> U256 {
    U256::from(1u64) << 128
}

/// A share that meets the share target but is not a block.
fn share_nonce(n: u64) -> U256 {
    (U256::from(1u64) << 200) + U256::from(n)
}

pub(crate) struct Harness {
    pub pool: Arc<Pool>,
    pub node: Arc<ScriptedNode>,
    pub upstream: mpsc::Sender<Job>,
    pub accounting: Arc<MemoryAccounting>,
    pub aggregator: Arc<MemoryAggregator>,
    pub shutdown: CancellationToken,
}

impl Harness {
    /// A job whose id is its header, as the scripted chain expects.
    pub fn job(&self, header: &str, height: u64) -> Job {
        Job::new(header, height, block_difficulty()).with_id(header)
    }

    async fn push(&self, header: &str, height: u64) {
        self.upstream.send(self.job(header, height)).await.unwrap();
        eventually(|| {
            self.pool
                .jobs()
                .latest()
                .is_some_and(|job| job.header_hash == header)
        })
        .await;
    }
}

pub(crate) fn harness(chain: &str, configure: impl FnOnce(&mut PoolConfig)) -> Harness {
    let mut config = PoolConfig {
        chain: chain.into(),
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    };
    configure(&mut config);

    let (node, upstream) = ScriptedNode::new(chain, SHARE_BASE);
    let accounting = Arc::new(MemoryAccounting::new());
    let aggregator = Arc::new(MemoryAggregator::new());
    let collab = Collaborators {
        accounting: accounting.clone(),
        aggregator: aggregator.clone(),
        notifier: Arc::new(LogNotifier),
    };
    let shutdown = CancellationToken::new();
    let pool = Pool::new(config, node.clone(), collab, shutdown.clone()).unwrap();
    Harness {
        pool,
        node,
        upstream,
        accounting,
        aggregator,
        shutdown,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

struct Miner {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Miner {
    async fn connect(addr: SocketAddr) -> Self {
        let (r, w) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(r).lines(),
            writer: w,
        }
    }

    async fn send(&mut self, msg: Value) {
        let mut line = serde_json::to_vec(&msg).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("no reply")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    /// The next frame that is not a notification.
    async fn reply(&mut self) -> Value {
        loop {
            let frame = self.recv().await;
            if !frame["method"].is_string() {
                return frame;
            }
        }
    }

    async fn login_etc(&mut self) {
        self.send(json!({
            "id": 1,
            "method": "eth_submitLogin",
            "params": [format!("ETC:{ETC_ADDR}.worker1")],
        }))
        .await;
        let reply = self.recv().await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"], true);
        let set_difficulty = self.recv().await;
        assert_eq!(set_difficulty["method"], "mining.set_difficulty");
    }

    async fn submit(&mut self, id: u64, nonce: U256, header: &str) -> Value {
        self.send(json!({
            "id": id,
            "method": "eth_submitWork",
            "params": [nonce_hex(nonce), header, "mix"],
        }))
        .await;
        let reply = self.reply().await;
        assert_eq!(reply["id"], id);
        reply["result"].clone()
    }
}

#[tokio::test]
async fn authorize_then_submit() {
    let h = harness("ETC", |_| {});
    let addr = h.pool.start().await.unwrap();
    h.push("0xaa", 100).await;

    let mut miner = Miner::connect(addr).await;
    miner.login_etc().await;
    let job = miner.recv().await;
    assert_eq!(job["id"], 0);
    assert_eq!(job["method"], "mining.notify");
    assert_eq!(job["params"][1], "0xaa");

    assert_eq!(miner.submit(2, share_nonce(0), "0xaa").await, true);
    assert_eq!(miner.submit(3, U256::MAX, "0xaa").await, false);

    eventually(|| {
        h.aggregator
            .intervals("ETC")
            .last()
            .map(|key| h.aggregator.shares("ETC", key))
            .is_some_and(|shares| {
                shares.len() == 2
                    && shares
                        .iter()
                        .filter(|s| s.status == ShareStatus::Accepted)
                        .count()
                        == 1
            })
    })
    .await;
    let key = h.aggregator.intervals("ETC").pop().unwrap();
    let shares = h.aggregator.shares("ETC", &key);
    assert!(shares.iter().all(|s| s.miner_id != 0 && s.worker_id != 0));
    assert!(h.node.blocks.lock().is_empty());

    h.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), h.pool.wait())
        .await
        .expect("pool did not stop");
}

#[tokio::test]
async fn duplicate_share_is_rejected() {
    let h = harness("ETC", |_| {});
    let addr = h.pool.start().await.unwrap();
    h.push("0xaa", 100).await;

    let mut miner = Miner::connect(addr).await;
    miner.login_etc().await;
    miner.recv().await;

    assert_eq!(miner.submit(2, share_nonce(7), "0xaa").await, true);
    assert_eq!(miner.submit(3, share_nonce(7), "0xaa").await, false);
    assert_eq!(miner.submit(4, share_nonce(8), "0xaa").await, true);
    h.shutdown.cancel();
}

#[tokio::test]
async fn stale_job_is_not_submitted_upstream() {
    let h = harness("ETC", |c| {
        c.job_list_size = 2;
        c.job_list_age_limit = 0;
    });
    let addr = h.pool.start().await.unwrap();
    h.push("0xaa", 100).await;

    let mut miner = Miner::connect(addr).await;
    miner.login_etc().await;
    miner.recv().await;

    h.push("0xbb", 101).await;
    h.push("0xcc", 102).await;
    assert!(h.pool.jobs().get_job("0xaa").is_none());

    // A block-grade nonce: any upstream check would have recorded it.
    assert_eq!(miner.submit(2, U256::from(1u64), "0xaa").await, false);
    assert!(h.node.blocks.lock().is_empty());

    // Still known but more than the age limit behind.
    assert_eq!(miner.submit(3, U256::from(1u64), "0xbb").await, false);
    assert!(h.node.blocks.lock().is_empty());

    assert_eq!(miner.submit(4, U256::from(1u64), "0xcc").await, true);
    assert_eq!(h.node.blocks.lock().len(), 1);
    h.shutdown.cancel();
}

#[tokio::test]
async fn clean_jobs_follow_height() {
    let h = harness("ETC", |_| {});
    let addr = h.pool.start().await.unwrap();
    h.push("0xaa", 100).await;

    let mut miner = Miner::connect(addr).await;
    miner.login_etc().await;
    miner.recv().await;
    eventually(|| h.pool.jobs().subscribers() == 1).await;

    h.push("0xbb", 100).await;
    let second = miner.recv().await;
    h.push("0xcc", 101).await;
    let third = miner.recv().await;

    assert_eq!(second["params"][1], "0xbb");
    assert_eq!(second["params"][3], false);
    assert_eq!(third["params"][1], "0xcc");
    assert_eq!(third["params"][3], true);
    h.shutdown.cancel();
}

#[tokio::test]
async fn btc_style_handshake() {
    let h = harness("RVN", |_| {});
    let addr = h.pool.start().await.unwrap();
    h.push("0xaa", 100).await;

    let mut miner = Miner::connect(addr).await;
    miner
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["BzMiner/v19.3"]}))
        .await;
    let subscribed = miner.recv().await;
    assert_eq!(subscribed["id"], 1);
    assert_eq!(subscribed["result"][1], "0001");

    miner
        .send(json!({"id": 2, "method": "mining.extranonce.subscribe", "params": []}))
        .await;
    assert_eq!(miner.recv().await["result"], true);

    miner
        .send(json!({
            "id": 3,
            "method": "mining.authorize",
            "params": [format!("rvn:{ETC_ADDR}.rig"), "x"],
        }))
        .await;
    assert_eq!(miner.recv().await["result"], true);
    assert_eq!(miner.recv().await["method"], "mining.set_difficulty");
    let job = miner.recv().await;
    assert_eq!(job["params"][4], "BzMiner");

    miner
        .send(json!({"id": 4, "method": "eth_submitHashrate", "params": ["0x1", "0x2"]}))
        .await;
    assert_eq!(miner.recv().await["result"], true);
    h.shutdown.cancel();
}

#[tokio::test]
async fn login_errors_keep_the_connection() {
    let h = harness("ETC", |_| {});
    let addr = h.pool.start().await.unwrap();
    let mut miner = Miner::connect(addr).await;

    let cases = [
        (json!(["nochain"]), ErrorCode::InvalidAddressFormat),
        (json!([format!("RVN:{ETC_ADDR}")]), ErrorCode::InvalidChain),
        (json!(["ETC:0x1234"]), ErrorCode::InvalidAddress),
        (
            json!([format!("ETC:{ETC_ADDR}.{}", "w".repeat(33))]),
            ErrorCode::WorkerNameTooLong,
        ),
    ];
    for (n, (params, code)) in cases.into_iter().enumerate() {
        miner
            .send(json!({"id": n, "method": "eth_submitLogin", "params": params}))
            .await;
        let reply = miner.recv().await;
        assert_eq!(reply["id"], n);
        assert_eq!(reply["error"]["code"], code.code(), "{code}");
    }

    miner.login_etc().await;
    miner
        .send(json!({"id": 9, "method": "eth_submitLogin", "params": [format!("ETC:{ETC_ADDR}")]}))
        .await;
    assert_eq!(
        miner.recv().await["error"]["code"],
        ErrorCode::InvalidAuth.code()
    );
    // The rejected second login must not subscribe the connection twice.
    eventually(|| h.pool.jobs().subscribers() == 1).await;
    h.push("0xee", 3).await;
    assert_eq!(miner.recv().await["params"][1], "0xee");
    h.shutdown.cancel();
}

#[tokio::test]
async fn login_reply_precedes_latest_job() {
    let h = harness("ETC", |_| {});
    let addr = h.pool.start().await.unwrap();
    h.push("0xa1", 10).await;

    let mut miner = Miner::connect(addr).await;
    miner.login_etc().await;
    let first = miner.recv().await;
    assert_eq!(first["method"], "mining.notify");
    assert_eq!(first["params"][1], "0xa1");

    h.push("0xa2", 11).await;
    let next = miner.recv().await;
    assert_eq!(next["params"][1], "0xa2");
    assert_eq!(h.pool.jobs().subscribers(), 1);
    h.shutdown.cancel();
}

#[tokio::test]
async fn unknown_methods_are_dropped() {
    let h = harness("ETC", |c| c.force_error_on_response = true);
    let addr = h.pool.start().await.unwrap();
    let mut miner = Miner::connect(addr).await;

    miner
        .send(json!({"id": 5, "method": "mining.subscribe", "params": []}))
        .await;
    miner
        .send(json!({"id": 6, "method": "eth_submitHashrate", "params": []}))
        .await;
    let reply = miner.recv().await;
    assert_eq!(reply["id"], 6);
    assert_eq!(reply["result"], true);
    assert!(reply.as_object().unwrap().contains_key("error"));
    assert!(reply["error"].is_null());
    h.shutdown.cancel();
}

#[tokio::test]
async fn get_work_returns_latest_job() {
    let h = harness("ETC", |_| {});
    let addr = h.pool.start().await.unwrap();
    let mut miner = Miner::connect(addr).await;

    miner
        .send(json!({"id": 1, "method": "eth_getWork", "params": []}))
        .await;
    assert_eq!(
        miner.recv().await["error"]["code"],
        ErrorCode::InvalidAuth.code()
    );

    miner.login_etc().await;
    h.push("0xdd", 7).await;
    miner.recv().await;
    miner
        .send(json!({"id": 2, "method": "eth_getWork", "params": []}))
        .await;
    let work = miner.recv().await;
    assert_eq!(work["id"], 2);
    assert_eq!(work["params"][1], "0xdd");
    h.shutdown.cancel();
}

#[tokio::test]
async fn disconnect_unsubscribes() {
    let h = harness("ETC", |c| c.var_diff_enabled = true);
    let addr = h.pool.start().await.unwrap();
    h.push("0xaa", 1).await;

    let mut miner = Miner::connect(addr).await;
    miner.login_etc().await;
    miner.recv().await;
    eventually(|| h.pool.connections() == 1 && h.pool.jobs().subscribers() == 1).await;
    assert_eq!(h.pool.vardiff.len(), 1);

    drop(miner);
    eventually(|| h.pool.connections() == 0 && h.pool.jobs().subscribers() == 0).await;
    eventually(|| h.pool.vardiff.is_empty()).await;
    h.shutdown.cancel();
}

#[tokio::test]
async fn new_heights_are_indexed_and_cleaned() {
    let h = harness("ETC", |c| c.job_list_size = 2);
    h.pool.start().await.unwrap();
    for height in 1..=10 {
        h.push(&format!("0x{height:02x}"), height).await;
    }
    for _ in 0..200 {
        if h.aggregator.share_index_heights("ETC").await.unwrap().len() == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Oldest job is at height 9; heights below 6 go.
    assert_eq!(h.pool.clean_share_index().await.unwrap(), 5);
    assert_eq!(
        h.aggregator.share_index_heights("ETC").await.unwrap(),
        vec![6, 7, 8, 9, 10]
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn miner_stats_are_flushed() {
    let h = harness("ETC", |_| {});
    let (conn, _end) = pipe_conn(1);
    h.pool.record_request(&conn, Duration::from_micros(10));
    assert_eq!(h.pool.flush_miner_stats().await.unwrap(), 0);

    conn.set_identity(42, ETC_ADDR, 43, "rig");
    conn.set_last_share_at(1234);
    h.pool.record_request(&conn, Duration::from_micros(10));
    h.pool.record_request(&conn, Duration::from_micros(5));
    assert_eq!(h.pool.flush_miner_stats().await.unwrap(), 1);
    assert_eq!(h.pool.flush_miner_stats().await.unwrap(), 0);

    let stat = h.aggregator.miner_stats("ETC", 42).unwrap();
    assert_eq!(stat.latency_us, 15);
    assert_eq!(stat.requests, 2);
    assert_eq!(stat.last_share_at, 1234);
}

#[test]
fn unsupported_chain_is_a_config_error() {
    let (node, _upstream) = ScriptedNode::new("DOGE", SHARE_BASE);
    let config = PoolConfig {
        chain: "DOGE".into(),
        ..Default::default()
    };
    let result = Pool::new(
        config,
        node,
        Collaborators::in_memory(),
        CancellationToken::new(),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn extranonces_are_fixed_width() {
    let alloc = ExtranonceAllocator::new(2);
    assert_eq!(alloc.next(), "0001");
    assert_eq!(alloc.next(), "0002");
    assert_eq!(ExtranonceAllocator::new(8).next(), "0000000000000001");
}

#[test]
fn extranonces_wrap_to_one() {
    let alloc = ExtranonceAllocator::new(1);
    for _ in 0..254 {
        alloc.next();
    }
    assert_eq!(alloc.next(), "ff");
    assert_eq!(alloc.next(), "01");
}
