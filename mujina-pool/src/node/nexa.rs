//! Nexa.
//!
//! Miners follow the BTC-style handshake (`mining.subscribe`,
//! `mining.authorize`, `mining.submit`). Work is a header commitment from
//! `getminingcandidate`; the miner searches an 8-byte nonce whose leading
//! bytes are the connection's extranonce. Winning nonces go back to the host
//! that issued the candidate with `submitminingsolution`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::pow::{CompactTarget, Target};
use futures::stream::BoxStream;
use regex::Regex;
use ruint::aliases::U256;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::poller::{poll_jobs, PollConfig};
use super::pow::{PowInput, PowVerifier};
use super::{
    decode_hash, decode_hex, difficulty_from_target, meets_difficulty, to_f64, ClientType,
    MiningNode, Round, ShareStatus, Submission, Work,
};
use crate::error::{Error, Result};
use crate::hostpool::{HostPool, Probe};
use crate::job::Job;
use crate::rpc::Outbound;
use crate::tracing::prelude::*;

/// Bytes in the nonce miners search, extranonce included.
pub const NONCE_SIZE: usize = 8;

/// Difficulty 1 in the units `mining.set_difficulty` uses.
const DIFF1: f64 = 4_294_967_296.0;

const ADDRESS_PREFIX: &str = "nexa";

/// `getblockchaininfo` reports `initialblockdownload: false` once synced.
pub fn probe() -> Probe {
    Probe::new("getblockchaininfo", json!([]), |v| {
        match v.get("initialblockdownload").and_then(Value::as_bool) {
            Some(ibd) => !ibd,
            None => v
                .get("verificationprogress")
                .and_then(Value::as_f64)
                .is_some_and(|p| p >= 0.9999),
        }
    })
}

/// Decode compact `nBits` hex into a difficulty against `U256::MAX`.
pub fn difficulty_from_bits(bits: &str) -> Result<U256> {
    let raw = u32::from_str_radix(bits.trim_start_matches("0x"), 16)
        .map_err(|e| Error::Node(format!("bad nBits {bits:?}: {e}")))?;
    let target = Target::from_compact(CompactTarget::from_consensus(raw));
    Ok(difficulty_from_target(
        U256::MAX,
        U256::from_be_bytes(target.to_be_bytes()),
    ))
}

pub struct NexaNode {
    chain: String,
    hosts: Arc<HostPool>,
    pow: Box<dyn PowVerifier>,
    share_difficulty: U256,
    refresh: Duration,
    address: Regex,
}

impl NexaNode {
    pub fn new(
        hosts: Arc<HostPool>,
        pow: Box<dyn PowVerifier>,
        share_difficulty: U256,
        refresh: Duration,
    ) -> Result<Self> {
        let address = Regex::new("^nexa:[qpzry9x8gf2tvdw0s3jn54khce6mua7l]{40,100}$")
            .map_err(|e| Error::Node(format!("address pattern: {e}")))?;
        Ok(Self {
            chain: "NEXA".into(),
            hosts,
            pow,
            share_difficulty,
            refresh,
            address,
        })
    }

    /// `mining.set_difficulty` value at a difficulty factor.
    fn stratum_difficulty(&self, diff_factor: u64) -> f64 {
        to_f64(self.share_difficulty(diff_factor)) / DIFF1
    }
}

async fn fetch_candidate(hosts: &HostPool) -> Result<Option<Job>> {
    let (host, candidate) = hosts
        .exec_with_host(None, "getminingcandidate", json!([]), true)
        .await?;
    let commitment = candidate
        .get("headerCommitment")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Node(format!("candidate lacks headerCommitment: {candidate}")))?;
    let bits = candidate
        .get("nBits")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Node(format!("candidate lacks nBits: {candidate}")))?;
    let id = candidate
        .get("id")
        .cloned()
        .ok_or_else(|| Error::Node(format!("candidate lacks id: {candidate}")))?;

    let height = match candidate.get("height").and_then(Value::as_u64) {
        Some(h) => h,
        None => {
            let count = hosts
                .exec(Some(&host), "getblockcount", json!([]), true)
                .await?;
            count
                .as_u64()
                .ok_or_else(|| Error::Node(format!("bad getblockcount result {count}")))?
                + 1
        }
    };

    let job = Job::new(commitment.to_ascii_lowercase(), height, difficulty_from_bits(bits)?)
        .with_host(host)
        .with_data(json!({"candidate": id, "nbits": bits}));
    Ok(Some(job))
}

#[async_trait]
impl MiningNode for NexaNode {
    fn chain(&self) -> &str {
        &self.chain
    }

    fn name(&self) -> &str {
        "nexa"
    }

    fn units(&self) -> u64 {
        100
    }

    fn share_difficulty(&self, factor: u64) -> U256 {
        self.share_difficulty.saturating_mul(U256::from(factor.max(1)))
    }

    fn max_difficulty(&self) -> U256 {
        U256::MAX
    }

    fn adjusted_share_difficulty(&self) -> f64 {
        to_f64(self.share_difficulty)
    }

    fn validate_address(&self, address: &str) -> bool {
        self.address.is_match(address)
    }

    fn address_prefix(&self) -> Option<&str> {
        Some(ADDRESS_PREFIX)
    }

    fn client_type(&self, client: &str) -> ClientType {
        let client = client.to_ascii_lowercase();
        if client.contains("bzminer") {
            ClientType::BzMiner
        } else if client.contains("wildrig") {
            ClientType::WildRig
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
        let extranonce2_size = NONCE_SIZE.saturating_sub(extranonce.len() / 2);
        Ok(vec![Outbound::response(
            id.to_owned(),
            json!([
                [
                    ["mining.set_difficulty", client_id],
                    ["mining.notify", client_id]
                ],
                extranonce,
                extranonce2_size
            ]),
            false,
        )])
    }

    fn authorize_responses(&self, diff_factor: u64) -> Result<Vec<Outbound>> {
        Ok(self.set_difficulty_response(diff_factor).into_iter().collect())
    }

    fn set_difficulty_response(&self, diff_factor: u64) -> Option<Outbound> {
        Some(Outbound::notification(
            "mining.set_difficulty",
            json!([self.stratum_difficulty(diff_factor)]),
        ))
    }

    fn job_notify(
        self: Arc<Self>,
        shutdown: CancellationToken,
        poll: Duration,
    ) -> BoxStream<'static, Job> {
        let hosts = Arc::clone(&self.hosts);
        let fetch = move || {
            let hosts = Arc::clone(&hosts);
            async move { fetch_candidate(&hosts).await }
        };
        let config = PollConfig {
            period: poll,
            refresh: self.refresh,
        };
        poll_jobs(
            self.chain.clone(),
            fetch,
            config,
            shutdown,
            Some(self.hosts.notifications()),
        )
    }

    fn parse_work(&self, params: &Value, extranonce: &str) -> Result<Work> {
        let params = params
            .as_array()
            .ok_or_else(|| Error::Protocol("params is not an array".into()))?;
        let field = |n: usize| {
            params
                .get(n)
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Protocol(format!("missing param {n}")))
        };

        let worker = field(0)?;
        let job_id = field(1)?;
        let nonce = field(2)?.trim_start_matches("0x").to_ascii_lowercase();
        // Most miners send only their part of the nonce.
        let nonce = if nonce.len() == NONCE_SIZE * 2 {
            nonce
        } else {
            format!("{extranonce}{nonce}")
        };
        if nonce.len() != NONCE_SIZE * 2 {
            return Err(Error::Protocol(format!("nonce is not {NONCE_SIZE} bytes")));
        }
        decode_hex(&nonce)?;

        Ok(Work {
            job_id: job_id.to_string(),
            nonce,
            extranonce: Some(extranonce.to_string()),
            worker: worker.split_once('.').map(|(_, w)| w.to_string()),
            ..Default::default()
        })
    }

    async fn submit_work(&self, job: &Job, work: &Work, diff_factor: u64) -> Result<Submission> {
        if let Some(extranonce) = &work.extranonce {
            if !work.nonce.starts_with(extranonce.as_str()) {
                debug!(job = %job.id, nonce = %work.nonce, "Nonce outside the assigned extranonce");
                return Ok(Submission::invalid());
            }
        }
        let header = decode_hash(&job.header_hash)?;
        let nonce = decode_hex(&work.nonce)?;
        let out = self.pow.compute(&PowInput {
            header: &header,
            nonce: &nonce,
            height: job.height,
        })?;

        let max = self.max_difficulty();
        if !meets_difficulty(&out.hash, max, self.share_difficulty(diff_factor)) {
            return Ok(Submission {
                status: ShareStatus::Rejected,
                hash: Some(out.hash),
                round: None,
            });
        }

        let mut round = None;
        if meets_difficulty(&out.hash, max, job.difficulty) {
            let candidate = job
                .data
                .as_ref()
                .and_then(|d| d.get("candidate"))
                .cloned()
                .unwrap_or(Value::Null);
            let params = json!([{"id": candidate, "nonce": work.nonce}]);
            match self
                .hosts
                .exec(job.host_id.as_deref(), "submitminingsolution", params, false)
                .await
            {
                Ok(Value::Null) => {
                    info!(chain = %self.chain, height = job.height, nonce = %work.nonce, "Block found");
                    round = Some(Round::pending(
                        &self.chain,
                        job,
                        hex::encode(out.hash),
                        work.nonce.clone(),
                    ));
                }
                Ok(reason) => {
                    warn!(chain = %self.chain, height = job.height, reason = %reason, "Upstream refused block");
                }
                Err(e) => {
                    error!(chain = %self.chain, height = job.height, error = %e, "Failed to submit block");
                }
            }
        }

        Ok(Submission {
            status: ShareStatus::Accepted,
            hash: Some(out.hash),
            round,
        })
    }

    fn marshal_job(
        &self,
        id: &RawValue,
        job: &Job,
        clean_jobs: bool,
        client_type: ClientType,
        _diff_factor: u64,
    ) -> Result<Outbound> {
        let bits = job.data_str("nbits").unwrap_or_default();
        let params = match client_type {
            ClientType::BzMiner | ClientType::WildRig => {
                json!([job.id, job.header_hash, bits, job.height, clean_jobs])
            }
            ClientType::Standard => json!([job.id, job.header_hash, bits, clean_jobs]),
        };
        Ok(Outbound::Request(crate::rpc::Request {
            id: id.to_owned(),
            jsonrpc: crate::rpc::VERSION,
            method: "mining.notify".into(),
            params,
        }))
    }

    async fn ping_hosts(&self) {
        self.hosts.health_check().await;
    }
}
