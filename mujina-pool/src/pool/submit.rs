//! `mining.submit` and `eth_submitWork`.

use std::sync::Arc;

use ruint::aliases::U256;
use serde_json::json;
use tokio::time::Instant;

use super::interval::unix_secs;
use super::Pool;
use crate::accounting::{RoundRecord, RoundShare, ShareRecord};
use crate::error::Result;
use crate::events::{Event, EventKind};
use crate::node::{meets_difficulty, to_f64, Round, ShareStatus, Submission, Work};
use crate::rpc::{ErrorCode, Message, Outbound};
use crate::stratum::conn::{unix_millis, Conn};
use crate::tracing::prelude::*;

/// A share below the current difficulty still counts at the previous one
/// if the retarget happened this recently.
pub const FORGIVENESS_WINDOW_MS: i64 = 30_000;

/// Prior jobs tried for a rejected KAS share.
pub const KAS_PRIOR_RETRIES: usize = 2;

pub const REASON_STALE: &str = "job too old";
pub const REASON_DUPLICATE: &str = "duplicate share";
pub const REASON_LOW_DIFFICULTY: &str = "difficulty too low";
pub const REASON_INVALID: &str = "invalid share";
pub const REASON_UPSTREAM: &str = "upstream error";

/// What the pool decided about one share.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: ShareStatus,
    /// Difficulty factor the share was credited at.
    pub diff_factor: u64,
    /// Height of the job the share was judged against.
    pub height: u64,
    pub round: Option<Round>,
    pub reason: Option<&'static str>,
}

impl Verdict {
    fn rejected(diff_factor: u64, reason: &'static str) -> Self {
        Self {
            status: ShareStatus::Rejected,
            diff_factor,
            height: 0,
            round: None,
            reason: Some(reason),
        }
    }
}

/// Share index key for the submitted work itself, independent of its hash.
fn work_key(work: &Work) -> String {
    let hex = |s: &str| {
        let s = s.trim().trim_start_matches("0x").trim_start_matches("0X");
        s.to_ascii_lowercase()
    };
    let nonce = hex(&work.nonce);
    let nonce = match nonce.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };
    format!(
        "work:{}:{}:{}:{}",
        work.job_id,
        nonce,
        work.mix_digest.as_deref().map(hex).unwrap_or_default(),
        work.ntime.as_deref().map(hex).unwrap_or_default(),
    )
}

/// `100 * round difficulty / (share difficulty * (accepted + 1))`
pub fn luck(round_difficulty: U256, share_difficulty: f64, accepted_shares: u64) -> f64 {
    let expected = share_difficulty * (accepted_shares + 1) as f64;
    if expected <= 0.0 {
        return 0.0;
    }
    100.0 * to_f64(round_difficulty) / expected
}

impl Pool {
    pub(crate) async fn handle_submit(
        &self,
        conn: &Arc<Conn>,
        msg: &Message,
    ) -> Result<Vec<Outbound>> {
        let work = match self.node.parse_work(&msg.params, &conn.extranonce()) {
            Ok(work) => work,
            Err(e) => {
                conn.record_error();
                debug!(conn_id = conn.id(), error = %e, "Malformed submit");
                return Ok(vec![Outbound::error(msg.reply_id(), ErrorCode::InvalidRequest)]);
            }
        };
        if !conn.authorized() {
            trace!(conn_id = conn.id(), "Submit before authorize ignored");
            return Ok(Vec::new());
        }

        let submitted_at = unix_millis();
        let verdict = self.judge(conn, &work, submitted_at).await;
        match verdict.status {
            ShareStatus::Accepted => {
                trace!(conn_id = conn.id(), job_id = %work.job_id, "Share accepted");
            }
            status => debug!(
                conn_id = conn.id(),
                miner = %conn.compound_id(),
                job_id = %work.job_id,
                status = %status,
                reason = verdict.reason.unwrap_or_default(),
                "Share not accepted"
            ),
        }

        let mut replies = vec![self.ack(msg, verdict.status == ShareStatus::Accepted)];

        if verdict.status == ShareStatus::Invalid {
            conn.record_error();
        } else {
            conn.set_last_share_at(submitted_at);
            if self.config.var_diff_enabled {
                replies.extend(self.retarget(conn));
            }
        }

        if let Some(round) = verdict.round.clone() {
            self.record_round(conn, round);
        }
        self.record_share(conn, &verdict);

        Ok(replies)
    }

    /// Validate a share against its job.
    pub(crate) async fn judge(&self, conn: &Conn, work: &Work, now_ms: i64) -> Verdict {
        let diff_factor = conn.diff_factor();
        let (job, active) = match self.jobs.get_job(&work.job_id) {
            Some(found) => found,
            None => return Verdict::rejected(diff_factor, REASON_STALE),
        };
        if !active {
            return Verdict::rejected(diff_factor, REASON_STALE);
        }

        // Resubmitted work is turned away before it can reach the node again.
        match self
            .collab
            .aggregator
            .add_unique_share(self.chain(), job.height, &work_key(work))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return Verdict {
                    height: job.height,
                    ..Verdict::rejected(diff_factor, REASON_DUPLICATE)
                };
            }
            Err(e) => warn!(error = %e, "Duplicate check unavailable"),
        }

        let mut judged = job;
        let mut credited = diff_factor;
        let mut sub = match self.node.submit_work(&judged, work, diff_factor).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(conn_id = conn.id(), job_id = %work.job_id, error = %e, "Share check failed");
                return Verdict::rejected(diff_factor, REASON_UPSTREAM);
            }
        };

        if self.config.var_diff_enabled {
            if let Some(previous) = self.forgive(conn, &sub, diff_factor, now_ms) {
                sub.status = ShareStatus::Accepted;
                credited = previous;
            }
        }

        if self.chain().eq_ignore_ascii_case("KAS") {
            for _ in 0..KAS_PRIOR_RETRIES {
                if sub.status != ShareStatus::Rejected {
                    break;
                }
                let Some((prior, true)) = self.jobs.get_prior_job(&judged.id) else {
                    break;
                };
                match self.node.submit_work(&prior, work, diff_factor).await {
                    Ok(retried) => sub = retried,
                    Err(e) => {
                        debug!(job_id = %prior.id, error = %e, "Prior job retry failed");
                        break;
                    }
                }
                judged = prior;
            }
        }

        let mut reason = match sub.status {
            ShareStatus::Accepted => None,
            ShareStatus::Rejected => Some(REASON_LOW_DIFFICULTY),
            ShareStatus::Invalid => Some(REASON_INVALID),
        };

        if sub.status == ShareStatus::Accepted {
            if let Some(hash) = sub.hash {
                match self
                    .collab
                    .aggregator
                    .add_unique_share(self.chain(), judged.height, &hex::encode(hash))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        sub.status = ShareStatus::Rejected;
                        sub.round = None;
                        reason = Some(REASON_DUPLICATE);
                    }
                    Err(e) => warn!(error = %e, "Duplicate check unavailable"),
                }
            }
        }

        Verdict {
            status: sub.status,
            diff_factor: credited,
            height: judged.height,
            round: sub.round,
            reason,
        }
    }

    /// The previous difficulty factor, if a rejected share meets it and the
    /// retarget that raised it is recent enough.
    fn forgive(&self, conn: &Conn, sub: &Submission, current: u64, now_ms: i64) -> Option<u64> {
        if sub.status != ShareStatus::Rejected {
            return None;
        }
        let hash = sub.hash?;
        let (previous, changed_at) = conn.last_diff_factor();
        let recent = changed_at > 0 && now_ms - changed_at <= FORGIVENESS_WINDOW_MS;
        let easier = self.node.share_difficulty(previous);
        (previous < current && recent && meets_difficulty(&hash, self.node.max_difficulty(), easier))
            .then_some(previous)
    }

    /// Feed the share time to the connection's vardiff and apply any
    /// retarget. Returns the notification for the miner, if any.
    fn retarget(&self, conn: &Arc<Conn>) -> Option<Outbound> {
        let change = self.vardiff.submit(conn.id(), Instant::now())?;
        conn.set_diff_factor(change.to);
        self.jobs
            .move_conn(conn.id(), conn.client_type(), change.from, change.to);
        debug!(conn_id = conn.id(), from = change.from, to = change.to, "Retarget");

        let events = Arc::clone(&self.events);
        let event = Event::for_conn(
            self.accounting_chain(conn),
            EventKind::Retarget,
            conn,
            json!({ "from": change.from, "to": change.to }),
        );
        let miner_id = conn.miner_id();
        self.tracker.spawn(async move {
            events.emit(miner_id, event).await;
        });

        self.node.set_difficulty_response(change.to)
    }

    /// Count the share in the current interval, in the background.
    fn record_share(&self, conn: &Conn, verdict: &Verdict) {
        let chain = self.accounting_chain(conn).to_string();
        let observed = self.intervals.observe(&chain, unix_secs());
        let share = ShareRecord {
            miner_id: conn.miner_id(),
            worker_id: conn.worker_id(),
            status: verdict.status,
            is_solo: conn.is_solo(),
            diff_factor: verdict.diff_factor,
        };
        let event = Event::for_conn(
            &chain,
            EventKind::Share,
            conn,
            json!({
                "status": verdict.status.to_string(),
                "diff": verdict.diff_factor,
                "height": verdict.height,
            }),
        );

        let aggregator = Arc::clone(&self.collab.aggregator);
        let intervals = Arc::clone(&self.intervals);
        let events = Arc::clone(&self.events);
        self.tracker.spawn(async move {
            if observed.announce {
                if let Err(e) = aggregator.add_interval(&chain, &observed.key).await {
                    warn!(chain = %chain, interval = %observed.key, error = %e, "Interval announce failed");
                    intervals.unannounce(&chain, &observed.key);
                }
            }
            if let Err(e) = aggregator.add_share(&chain, &observed.key, &share).await {
                warn!(chain = %chain, error = %e, "Failed to record share");
            }
            events.emit(share.miner_id, event).await;
        });
    }

    /// Store a found block and its round shares, then alert, in the
    /// background.
    fn record_round(&self, conn: &Conn, round: Round) {
        let chain = self.accounting_chain(conn).to_string();
        let miner = conn.compound_id().to_string();
        let (miner_id, worker_id, is_solo) = (conn.miner_id(), conn.worker_id(), conn.is_solo());
        let share_difficulty = self.node.adjusted_share_difficulty();
        let collab = self.collab.clone();
        info!(chain = %chain, height = round.height, hash = %round.hash, miner = %miner, "Block candidate accepted");

        self.tracker.spawn(async move {
            let accepted_shares = collab
                .aggregator
                .round_shares(&chain)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Round share count unavailable");
                    0
                });
            let per_miner = collab
                .aggregator
                .miner_round_shares(&chain)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Per-miner round shares unavailable");
                    Default::default()
                });

            let record = RoundRecord {
                luck: luck(round.difficulty, share_difficulty, accepted_shares),
                round,
                miner_id,
                worker_id,
                is_solo,
                accepted_shares,
            };
            match collab.accounting.insert_round(&record).await {
                Ok(round_id) => {
                    let rows: Vec<RoundShare> = per_miner
                        .into_iter()
                        .map(|(miner_id, shares)| RoundShare {
                            round_id,
                            miner_id,
                            shares,
                        })
                        .collect();
                    if let Err(e) = collab.accounting.insert_round_shares(&rows).await {
                        error!(round_id, error = %e, "Failed to store round shares");
                    }
                }
                Err(e) => error!(height = record.round.height, error = %e, "Failed to store round"),
            }
            if let Err(e) = collab.aggregator.reset_round(&chain).await {
                warn!(error = %e, "Failed to reset round");
            }
            if let Err(e) = collab.notifier.block_found(&record, &miner).await {
                warn!(error = %e, "Block notification failed");
            }
        });
    }
}
