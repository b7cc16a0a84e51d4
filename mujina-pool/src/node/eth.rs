//! Ethereum-family chains (ETH, ETC) in the eth-proxy dialect.
//!
//! Work comes from `eth_getWork` as `[header, seed, boundary, height]`; the
//! header hash doubles as the job id. Miners log in with `eth_submitLogin`,
//! fetch work with `eth_getWork` and submit `[nonce, header, mix]`. New work
//! is pushed as a response with id 0.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use regex::Regex;
use ruint::aliases::U256;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::poller::{poll_jobs, PollConfig};
use super::pow::{PowInput, PowVerifier};
use super::{
    decode_hash, decode_hex, difficulty_from_target, hex_target, meets_difficulty, target, to_f64,
    ClientType, MiningNode, Round, ShareStatus, Submission, Work,
};
use crate::error::{Error, Result};
use crate::hostpool::{HostPool, Probe};
use crate::job::Job;
use crate::rpc::Outbound;
use crate::tracing::prelude::*;

const WEI: u64 = 1_000_000_000_000_000_000;

/// `eth_syncing` answers `false` once the node has caught up.
pub fn probe() -> Probe {
    Probe::new("eth_syncing", json!([]), |v| v == &Value::Bool(false))
}

/// ETH or ETC.
pub struct EthNode {
    chain: String,
    hosts: Arc<HostPool>,
    pow: Box<dyn PowVerifier>,
    share_difficulty: U256,
    refresh: Duration,
    address: Regex,
}

impl EthNode {
    pub fn new(
        chain: impl Into<String>,
        hosts: Arc<HostPool>,
        pow: Box<dyn PowVerifier>,
        share_difficulty: U256,
        refresh: Duration,
    ) -> Result<Self> {
        let address = Regex::new("^0x[0-9a-fA-F]{40}$")
            .map_err(|e| Error::Node(format!("address pattern: {e}")))?;
        Ok(Self {
            chain: chain.into(),
            hosts,
            pow,
            share_difficulty,
            refresh,
            address,
        })
    }

    /// The `eth_getWork` result for a job at a difficulty factor.
    pub fn work_package(&self, job: &Job, diff_factor: u64) -> Value {
        let share_target = target(self.max_difficulty(), self.share_difficulty(diff_factor));
        json!([
            job.header_hash,
            job.seed_hash.as_deref().unwrap_or_default(),
            hex_target(share_target),
            format!("0x{:x}", job.height),
        ])
    }
}

/// Turn an `eth_getWork` result into a job.
fn parse_work_package(host: String, result: &Value) -> Result<Job> {
    let fields = result
        .as_array()
        .ok_or_else(|| Error::Node(format!("unexpected eth_getWork result {result}")))?;
    let field = |n: usize| {
        fields
            .get(n)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Node(format!("eth_getWork result lacks field {n}")))
    };

    let header = field(0)?.to_ascii_lowercase();
    let seed = field(1)?.to_ascii_lowercase();
    let boundary = U256::from_be_bytes(decode_hash(field(2)?)?);
    let height = match fields.get(3).and_then(Value::as_str) {
        Some(h) => u64::from_str_radix(h.trim_start_matches("0x"), 16)
            .map_err(|e| Error::Node(format!("bad height {h:?}: {e}")))?,
        None => 0,
    };

    Ok(Job::new(header.clone(), height, difficulty_from_target(U256::MAX, boundary))
        .with_id(header)
        .with_seed(seed)
        .with_host(host))
}

fn hex_field(params: &[Value], n: usize, bytes: usize) -> Result<String> {
    let s = params
        .get(n)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol(format!("missing param {n}")))?;
    if decode_hex(s)?.len() != bytes {
        return Err(Error::Protocol(format!("param {n} is not {bytes} bytes")));
    }
    let digits = s.strip_prefix("0x").unwrap_or(s);
    Ok(format!("0x{}", digits.to_ascii_lowercase()))
}

#[async_trait]
impl MiningNode for EthNode {
    fn chain(&self) -> &str {
        &self.chain
    }

    fn name(&self) -> &str {
        "eth-proxy"
    }

    fn units(&self) -> u64 {
        WEI
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

    fn client_type(&self, _client: &str) -> ClientType {
        ClientType::Standard
    }

    fn subscribe_responses(
        &self,
        _id: &RawValue,
        _client_id: &str,
        _extranonce: &str,
    ) -> Result<Vec<Outbound>> {
        Ok(Vec::new())
    }

    fn authorize_responses(&self, _diff_factor: u64) -> Result<Vec<Outbound>> {
        Ok(Vec::new())
    }

    fn job_notify(
        self: Arc<Self>,
        shutdown: CancellationToken,
        poll: Duration,
    ) -> BoxStream<'static, Job> {
        let hosts = Arc::clone(&self.hosts);
        let fetch = move || {
            let hosts = Arc::clone(&hosts);
            async move {
                let (host, result) = hosts
                    .exec_with_host(None, "eth_getWork", json!([]), true)
                    .await?;
                parse_work_package(host, &result).map(Some)
            }
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

    fn parse_work(&self, params: &Value, _extranonce: &str) -> Result<Work> {
        let params = params
            .as_array()
            .ok_or_else(|| Error::Protocol("params is not an array".into()))?;
        let header = hex_field(params, 1, 32)?;
        Ok(Work {
            job_id: header.clone(),
            nonce: hex_field(params, 0, 8)?,
            header_hash: Some(header),
            mix_digest: Some(hex_field(params, 2, 32)?),
            ..Default::default()
        })
    }

    async fn submit_work(&self, job: &Job, work: &Work, diff_factor: u64) -> Result<Submission> {
        let header = decode_hash(&job.header_hash)?;
        let nonce = decode_hex(&work.nonce)?;
        let claimed_mix = match work.mix_digest.as_deref().map(decode_hash) {
            Some(Ok(mix)) => mix,
            _ => return Ok(Submission::invalid()),
        };

        let out = self.pow.compute(&PowInput {
            header: &header,
            nonce: &nonce,
            height: job.height,
        })?;
        if out.mix_digest != claimed_mix {
            debug!(chain = %self.chain, job = %job.id, "Mix digest mismatch");
            return Ok(Submission::invalid());
        }

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
            let mix = format!("0x{}", hex::encode(out.mix_digest));
            let params = json!([work.nonce, job.header_hash, mix]);
            match self
                .hosts
                .exec(job.host_id.as_deref(), "eth_submitWork", params, false)
                .await
            {
                Ok(Value::Bool(true)) => {
                    info!(chain = %self.chain, height = job.height, nonce = %work.nonce, "Block found");
                    let mut found = Round::pending(
                        &self.chain,
                        job,
                        format!("0x{}", hex::encode(out.hash)),
                        work.nonce.clone(),
                    );
                    found.solution = Some(mix);
                    round = Some(found);
                }
                Ok(other) => {
                    warn!(chain = %self.chain, height = job.height, result = %other, "Upstream refused block");
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
        _clean_jobs: bool,
        _client_type: ClientType,
        diff_factor: u64,
    ) -> Result<Outbound> {
        Ok(Outbound::response(
            id.to_owned(),
            self.work_package(job, diff_factor),
            false,
        ))
    }

    async fn ping_hosts(&self) {
        self.hosts.health_check().await;
    }
}
