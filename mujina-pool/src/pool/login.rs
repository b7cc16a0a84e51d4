//! `mining.authorize`, `eth_submitLogin` and CFX's login-by-subscribe.
//!
//! Usernames look like `[solo:]<chain>:<address>[.<worker>]`.

use std::sync::Arc;

use serde_json::json;
use tokio::time::Instant;

use super::Pool;
use crate::error::Result;
use crate::events::{Event, EventKind};
use crate::rpc::{ErrorCode, Message, Outbound};
use crate::stratum::conn::Conn;
use crate::tracing::prelude::*;

pub const SOLO_PREFIX: &str = "solo:";

pub const MAX_WORKER_NAME: usize = 32;

/// Worker name when the miner gives none.
pub const DEFAULT_WORKER: &str = "default";

/// Old chain names still seen in usernames.
const CHAIN_ALIASES: &[(&str, &str)] = &[("ERGO", "ERG")];

/// A parsed username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub chain: String,
    pub address: String,
    pub worker: String,
    pub is_solo: bool,
}

/// Split a username into its parts.
///
/// `node_chain` and `prefix` describe the adapter: when the username's chain
/// is really the adapter's address prefix (`nexa:nqt...`), the prefix is put
/// back on the address and the chain becomes the adapter's.
pub fn parse_username(
    username: &str,
    worker_field: Option<&str>,
    solo_enabled: bool,
    node_chain: &str,
    prefix: Option<&str>,
) -> std::result::Result<Credentials, ErrorCode> {
    let mut username = username.trim();
    let mut is_solo = false;
    if solo_enabled
        && username.len() >= SOLO_PREFIX.len()
        && username[..SOLO_PREFIX.len()].eq_ignore_ascii_case(SOLO_PREFIX)
    {
        username = &username[SOLO_PREFIX.len()..];
        is_solo = true;
    }

    let (chain, rest) = username
        .split_once(':')
        .ok_or(ErrorCode::InvalidAddressFormat)?;
    if chain.is_empty() || rest.is_empty() {
        return Err(ErrorCode::InvalidAddressFormat);
    }

    let (address, worker) = match rest.split_once('.') {
        Some((address, worker)) => (address, worker),
        None => (rest, worker_field.unwrap_or(DEFAULT_WORKER)),
    };
    let worker = if worker.is_empty() { DEFAULT_WORKER } else { worker };

    let mut chain = chain.to_ascii_uppercase();
    let mut address = address.to_string();
    if let Some(prefix) = prefix {
        if chain.eq_ignore_ascii_case(prefix) {
            let tagged = format!("{prefix}:");
            if !address.starts_with(&tagged) {
                address = format!("{tagged}{address}");
            }
            chain = node_chain.to_ascii_uppercase();
        }
    }
    if let Some((_, canonical)) = CHAIN_ALIASES.iter().find(|(alias, _)| *alias == chain) {
        chain = canonical.to_string();
    }

    Ok(Credentials {
        chain,
        address,
        worker: worker.to_string(),
        is_solo,
    })
}

impl Pool {
    pub(crate) async fn handle_login(
        &self,
        conn: &Arc<Conn>,
        msg: &Message,
    ) -> Result<Vec<Outbound>> {
        let reject = |code: ErrorCode| -> Result<Vec<Outbound>> {
            conn.record_error();
            debug!(conn_id = conn.id(), reason = %code, "Login rejected");
            Ok(vec![Outbound::error(msg.reply_id(), code)])
        };

        if conn.authorized() {
            return reject(ErrorCode::InvalidAuth);
        }
        let Some(username) = msg.string_param(0) else {
            return reject(ErrorCode::InvalidRequest);
        };
        let creds = match parse_username(
            username,
            msg.worker.as_deref(),
            self.config.solo_enabled,
            self.node.chain(),
            self.node.address_prefix(),
        ) {
            Ok(creds) => creds,
            Err(code) => return reject(code),
        };

        if !creds.chain.eq_ignore_ascii_case(self.chain())
            && !creds.chain.eq_ignore_ascii_case(self.node.chain())
        {
            return reject(ErrorCode::InvalidChain);
        }
        if !self.node.validate_address(&creds.address) {
            return reject(ErrorCode::InvalidAddress);
        }
        if creds.worker.chars().count() > MAX_WORKER_NAME {
            return reject(ErrorCode::WorkerNameTooLong);
        }

        let miner_id = self.resolve_miner_id(&creds.address).await?;
        let worker_id = self.resolve_worker_id(miner_id, &creds.worker).await?;

        let diff_factor = self.config.port_diff(conn.port());
        conn.set_identity(miner_id, &creds.address, worker_id, &creds.worker);
        conn.set_is_solo(creds.is_solo);
        conn.init_diff_factor(diff_factor);
        conn.set_subscribed(true);
        conn.set_authorized(true);
        conn.set_read_deadline(None);
        if self.config.var_diff_enabled {
            self.vardiff.add(conn.id(), diff_factor, Instant::now());
        }
        info!(
            conn_id = conn.id(),
            miner = %creds.address,
            worker = %creds.worker,
            solo = creds.is_solo,
            diff_factor,
            "Miner authorized"
        );

        self.events
            .emit(
                miner_id,
                Event::for_conn(
                    self.accounting_chain(conn),
                    EventKind::Connect,
                    conn,
                    json!({ "diff": diff_factor }),
                ),
            )
            .await;

        // The latest job follows once these are written; see `Pool::handle`.
        let mut replies = vec![self.ack(msg, true)];
        replies.extend(self.node.authorize_responses(diff_factor)?);
        Ok(replies)
    }

    /// Cache, then database, then a new row.
    async fn resolve_miner_id(&self, address: &str) -> Result<u64> {
        let chain = self.chain();
        let cache = &self.collab.aggregator;
        if let Some(id) = cache.get_miner_id(chain, address).await? {
            return Ok(id);
        }
        let db = &self.collab.accounting;
        let id = match db.get_miner_id(chain, address).await? {
            Some(id) => id,
            None => {
                let id = db.insert_miner(chain, address).await?;
                debug!(miner = address, miner_id = id, "New miner");
                id
            }
        };
        cache.set_miner_id(chain, address, id).await?;
        Ok(id)
    }

    async fn resolve_worker_id(&self, miner_id: u64, worker: &str) -> Result<u64> {
        let cache = &self.collab.aggregator;
        if let Some(id) = cache.get_worker_id(miner_id, worker).await? {
            return Ok(id);
        }
        let db = &self.collab.accounting;
        let id = match db.get_worker_id(miner_id, worker).await? {
            Some(id) => id,
            None => db.insert_worker(miner_id, worker).await?,
        };
        cache.set_worker_id(miner_id, worker, id).await?;
        Ok(id)
    }
}
