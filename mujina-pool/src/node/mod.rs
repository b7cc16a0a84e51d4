//! Chain adapters.
//!
//! A [`MiningNode`] is everything the pool needs to know about one chain:
//! where jobs come from, how miners of that chain expect them on the wire,
//! how shares are checked, and where winning blocks go. The pool itself never
//! looks inside a job.

pub mod eth;
pub mod nexa;
pub mod poller;
pub mod pow;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use ruint::aliases::U256;
use serde_json::value::RawValue;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::Job;
use crate::rpc::Outbound;

/// A 256-bit proof-of-work hash, big-endian.
pub type Hash = [u8; 32];

/// Miner software dialects. Jobs are marshalled once per dialect.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::FromRepr,
    strum::EnumIter,
)]
#[repr(u8)]
pub enum ClientType {
    #[default]
    Standard = 0,
    BzMiner = 1,
    WildRig = 2,
}

/// Outcome of share validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ShareStatus {
    /// Meets the share target.
    Accepted,
    /// Well-formed but below the share target.
    Rejected,
    /// Malformed, or does not belong to the job.
    Invalid,
}

/// A decoded share submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Work {
    pub job_id: String,
    /// Full nonce as hex, extranonce included.
    pub nonce: String,
    /// Extranonce the connection was assigned, for dialects that embed it.
    pub extranonce: Option<String>,
    pub header_hash: Option<String>,
    pub mix_digest: Option<String>,
    pub ntime: Option<String>,
    /// Worker name, when the submit carries one.
    pub worker: Option<String>,
}

/// A block found by a share.
#[derive(Debug, Clone, PartialEq)]
pub struct Round {
    pub chain: String,
    pub height: u64,
    pub hash: String,
    pub nonce: String,
    pub solution: Option<String>,
    /// Network difficulty of the block.
    pub difficulty: U256,
    pub pending: bool,
    pub mature: bool,
    pub uncle: bool,
    pub orphan: bool,
}

impl Round {
    /// A freshly found block awaiting confirmation.
    pub fn pending(chain: &str, job: &Job, hash: String, nonce: String) -> Self {
        Self {
            chain: chain.to_string(),
            height: job.height,
            hash,
            nonce,
            solution: None,
            difficulty: job.difficulty,
            pending: true,
            mature: false,
            uncle: false,
            orphan: false,
        }
    }
}

/// What [`MiningNode::submit_work`] found.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub status: ShareStatus,
    /// The share's hash, when it could be computed.
    pub hash: Option<Hash>,
    /// Set iff the share also met the network target.
    pub round: Option<Round>,
}

impl Submission {
    pub fn invalid() -> Self {
        Self {
            status: ShareStatus::Invalid,
            hash: None,
            round: None,
        }
    }
}

/// One supported chain.
#[async_trait]
pub trait MiningNode: Send + Sync + 'static {
    /// Ticker, e.g. `ETC`.
    fn chain(&self) -> &str;

    fn name(&self) -> &str;

    /// Scale between the chain's base unit and its display unit.
    fn units(&self) -> u64;

    /// Difficulty a share must meet at difficulty factor `factor`.
    fn share_difficulty(&self, factor: u64) -> U256;

    /// Difficulty 1 target; `target = max / difficulty`.
    fn max_difficulty(&self) -> U256;

    /// Share difficulty at factor 1 in hashes, for hashrate and luck.
    fn adjusted_share_difficulty(&self) -> f64;

    fn validate_address(&self, address: &str) -> bool;

    /// Prefix some addresses carry in their serialized form.
    fn address_prefix(&self) -> Option<&str> {
        None
    }

    /// Pick the wire dialect for a `mining.subscribe` fingerprint.
    fn client_type(&self, client: &str) -> ClientType;

    /// Frames answering `mining.subscribe`.
    fn subscribe_responses(
        &self,
        id: &RawValue,
        client_id: &str,
        extranonce: &str,
    ) -> Result<Vec<Outbound>>;

    /// Frames sent after a successful authorize.
    fn authorize_responses(&self, diff_factor: u64) -> Result<Vec<Outbound>>;

    /// Notification announcing a retarget, if the dialect has one.
    fn set_difficulty_response(&self, _diff_factor: u64) -> Option<Outbound> {
        None
    }

    /// Jobs from upstream until `shutdown` fires. A new job is produced when
    /// the upstream work changes or the refresh interval elapses.
    fn job_notify(
        self: Arc<Self>,
        shutdown: CancellationToken,
        poll: Duration,
    ) -> BoxStream<'static, Job>;

    /// Decode a submit's params.
    fn parse_work(&self, params: &Value, extranonce: &str) -> Result<Work>;

    /// Check a share against `job` and, if it is a block, submit it upstream.
    async fn submit_work(&self, job: &Job, work: &Work, diff_factor: u64) -> Result<Submission>;

    /// The job notification frame for one dialect and difficulty factor.
    fn marshal_job(
        &self,
        id: &RawValue,
        job: &Job,
        clean_jobs: bool,
        client_type: ClientType,
        diff_factor: u64,
    ) -> Result<Outbound>;

    async fn ping_hosts(&self);
}

/// `max / difficulty`, or `max` for a zero difficulty.
pub fn target(max: U256, difficulty: U256) -> U256 {
    if difficulty.is_zero() {
        max
    } else {
        max / difficulty
    }
}

/// Whether `hash` meets `difficulty`.
pub fn meets_difficulty(hash: &Hash, max: U256, difficulty: U256) -> bool {
    U256::from_be_bytes(*hash) <= target(max, difficulty)
}

/// Difficulty whose target is `target`.
pub fn difficulty_from_target(max: U256, target: U256) -> U256 {
    if target.is_zero() {
        max
    } else {
        max / target
    }
}

/// Nearest `f64`, for hashrate and luck arithmetic.
pub fn to_f64(v: U256) -> f64 {
    v.as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64)
}

/// `0x`-prefixed, zero-padded 64-digit hex.
pub fn hex_target(target: U256) -> String {
    format!("0x{}", hex::encode(target.to_be_bytes::<32>()))
}

/// Parse hex with or without a `0x` prefix.
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| crate::error::Error::Protocol(format!("bad hex {s:?}: {e}")))
}

/// Parse a 32-byte hash.
pub fn decode_hash(s: &str) -> Result<Hash> {
    decode_hex(s)?
        .try_into()
        .map_err(|_| crate::error::Error::Protocol(format!("{s:?} is not 32 bytes")))
}

#[cfg(test)]
pub(crate) mod test_util {
    //! A chain whose proof of work is the nonce itself.

    use super::*;
    use crate::error::Error;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    /// Hashes are the nonce, big-endian, so tests choose share outcomes by
    /// choosing nonces. A mix digest of `"bad"` makes the share invalid, and
    /// `"only:<header>"` rejects it on every job but that one.
    pub struct ScriptedNode {
        chain: String,
        base: u64,
        jobs: Mutex<Option<mpsc::Receiver<Job>>>,
        pub blocks: Mutex<Vec<Work>>,
        pub pings: std::sync::atomic::AtomicU64,
    }

    impl ScriptedNode {
        /// The node and the sender tests push upstream jobs into.
        pub fn new(chain: &str, base: u64) -> (Arc<Self>, mpsc::Sender<Job>) {
            let (tx, rx) = mpsc::channel(16);
            let node = Self {
                chain: chain.to_string(),
                base,
                jobs: Mutex::new(Some(rx)),
                blocks: Mutex::new(Vec::new()),
                pings: Default::default(),
            };
            (Arc::new(node), tx)
        }

        /// The largest nonce that still meets the share target at `factor`.
        pub fn boundary_nonce(&self, factor: u64) -> U256 {
            target(self.max_difficulty(), self.share_difficulty(factor))
        }
    }

    pub fn nonce_hex(nonce: U256) -> String {
        format!("0x{:x}", nonce)
    }

    #[async_trait]
    impl MiningNode for ScriptedNode {
        fn chain(&self) -> &str {
            &self.chain
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn units(&self) -> u64 {
            1
        }

        fn share_difficulty(&self, factor: u64) -> U256 {
            U256::from(self.base) * U256::from(factor.max(1))
        }

        fn max_difficulty(&self) -> U256 {
            U256::MAX
        }

        fn adjusted_share_difficulty(&self) -> f64 {
            self.base as f64
        }

        fn validate_address(&self, address: &str) -> bool {
            address.starts_with("0x") && address.len() == 42
        }

        fn client_type(&self, client: &str) -> ClientType {
            if client.to_ascii_lowercase().starts_with("bzminer") {
                ClientType::BzMiner
            } else {
                ClientType::Standard
            }
        }

        fn subscribe_responses(
            &self,
            id: &RawValue,
            client_id: &str,
            extranonce: &str,
        ) -> Result<Vec<Outbound>> {
            Ok(vec![Outbound::response(
                id.to_owned(),
                json!([["mining.notify", client_id], extranonce]),
                false,
            )])
        }

        fn authorize_responses(&self, diff_factor: u64) -> Result<Vec<Outbound>> {
            Ok(self.set_difficulty_response(diff_factor).into_iter().collect())
        }

        fn set_difficulty_response(&self, diff_factor: u64) -> Option<Outbound> {
            Some(Outbound::notification(
                "mining.set_difficulty",
                json!([diff_factor]),
            ))
        }

        fn job_notify(
            self: Arc<Self>,
            shutdown: CancellationToken,
            _poll: Duration,
        ) -> BoxStream<'static, Job> {
            let rx = self.jobs.lock().take();
            match rx {
                Some(rx) => ReceiverStream::new(rx)
                    .take_until(shutdown.cancelled_owned())
                    .boxed(),
                None => futures::stream::empty().boxed(),
            }
        }

        fn parse_work(&self, params: &Value, _extranonce: &str) -> Result<Work> {
            let params = params
                .as_array()
                .ok_or_else(|| Error::Protocol("params is not an array".into()))?;
            let field = |n: usize| {
                params
                    .get(n)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| Error::Protocol(format!("missing param {n}")))
            };
            let header = field(1)?;
            Ok(Work {
                job_id: header.clone(),
                nonce: field(0)?,
                header_hash: Some(header),
                mix_digest: Some(field(2)?),
                ..Default::default()
            })
        }

        async fn submit_work(
            &self,
            job: &Job,
            work: &Work,
            diff_factor: u64,
        ) -> Result<Submission> {
            if work.mix_digest.as_deref() == Some("bad") {
                return Ok(Submission::invalid());
            }
            let digits = work.nonce.trim_start_matches("0x");
            let nonce = U256::from_str_radix(digits, 16)
                .map_err(|e| Error::Protocol(e.to_string()))?;
            let hash = nonce.to_be_bytes::<32>();

            // `only:<header>` binds the share to one job.
            let wrong_job = work
                .mix_digest
                .as_deref()
                .and_then(|mix| mix.strip_prefix("only:"))
                .is_some_and(|header| header != job.header_hash);

            let max = self.max_difficulty();
            if wrong_job || !meets_difficulty(&hash, max, self.share_difficulty(diff_factor)) {
                return Ok(Submission {
                    status: ShareStatus::Rejected,
                    hash: Some(hash),
                    round: None,
                });
            }
            let round = meets_difficulty(&hash, max, job.difficulty).then(|| {
                self.blocks.lock().push(work.clone());
                Round::pending(&self.chain, job, hex::encode(hash), work.nonce.clone())
            });
            Ok(Submission {
                status: ShareStatus::Accepted,
                hash: Some(hash),
                round,
            })
        }

        fn marshal_job(
            &self,
            id: &RawValue,
            job: &Job,
            clean_jobs: bool,
            client_type: ClientType,
            diff_factor: u64,
        ) -> Result<Outbound> {
            Ok(Outbound::Request(crate::rpc::Request {
                id: id.to_owned(),
                jsonrpc: crate::rpc::VERSION,
                method: "mining.notify".into(),
                params: json!([
                    job.id,
                    job.header_hash,
                    job.height,
                    clean_jobs,
                    client_type.to_string(),
                    diff_factor
                ]),
            }))
        }

        async fn ping_hosts(&self) {
            self.pings
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}
