//! Configuration management for mujina-pool.
//!
//! One TOML file per pool process: a `[pool]` table describing the stratum
//! side and a `[node]` table describing the chain and its upstream hosts.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure for the pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub node: NodeConfig,
}

/// Stratum-side options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Chain miners name in their username, e.g. `ETC`.
    pub chain: String,

    /// Address to listen on.
    pub host: String,

    /// Stratum port.
    pub port: u16,

    /// Shares kept for PPLNS.
    pub window_size: u64,

    /// Extranonce-1 size in bytes.
    pub extranonce1_size: usize,

    pub job_list_size: usize,

    /// Heights behind the newest a job stays valid; -1 keeps every stored
    /// job valid.
    pub job_list_age_limit: i64,

    /// Include `"error": null` in successful responses.
    pub force_error_on_response: bool,

    pub polling_period_secs: u64,
    pub pinging_period_secs: u64,
    pub handshake_timeout_secs: u64,

    pub solo_enabled: bool,

    /// Chain key solo shares are accounted under.
    pub solo_chain: String,

    pub var_diff_enabled: bool,

    /// Listening port (as a TOML key) to starting difficulty factor.
    pub port_diff_idx: HashMap<String, u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chain: String::new(),
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 3333,
            window_size: 0,
            extranonce1_size: 2,
            job_list_size: 25,
            job_list_age_limit: 2,
            force_error_on_response: false,
            polling_period_secs: 1,
            pinging_period_secs: 30,
            handshake_timeout_secs: 60,
            solo_enabled: false,
            solo_chain: String::new(),
            var_diff_enabled: false,
            port_diff_idx: HashMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("bad listen address {}: {e}", self.host)))
    }

    pub fn polling_period(&self) -> Duration {
        Duration::from_secs(self.polling_period_secs)
    }

    pub fn pinging_period(&self) -> Duration {
        Duration::from_secs(self.pinging_period_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Starting difficulty factor for connections on `port`.
    pub fn port_diff(&self, port: u16) -> u64 {
        self.port_diff_idx
            .get(&port.to_string())
            .copied()
            .unwrap_or(1)
            .max(1)
    }

    /// Chain key solo shares are accounted under.
    pub fn solo_chain(&self) -> &str {
        if self.solo_chain.is_empty() {
            &self.chain
        } else {
            &self.solo_chain
        }
    }
}

/// Upstream transport kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    #[default]
    Http,
    Tcp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// `http://host:port` for HTTP, `host:port` for TCP.
    pub url: String,

    #[serde(default)]
    pub kind: HostKind,

    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Chain adapter options.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Adapter to use, e.g. `ETC` or `NEXA`.
    pub chain: String,

    /// Share difficulty at difficulty factor 1.
    pub share_difficulty: u64,

    /// Re-announce unchanged work after this many seconds.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

fn default_refresh_secs() -> u64 {
    30
}

impl NodeConfig {
    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

impl Config {
    /// Load configuration from a specific file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.chain.trim().is_empty() {
            return Err(Error::Config("pool.chain is empty".into()));
        }
        if self.node.chain.trim().is_empty() {
            return Err(Error::Config("node.chain is empty".into()));
        }
        if self.node.hosts.is_empty() {
            return Err(Error::Config("node.hosts is empty".into()));
        }
        if self.node.share_difficulty == 0 {
            return Err(Error::Config("node.share_difficulty must be at least 1".into()));
        }
        if self.pool.job_list_size == 0 {
            return Err(Error::Config("pool.job_list_size must be at least 1".into()));
        }
        if self.pool.job_list_age_limit < -1 {
            return Err(Error::Config("pool.job_list_age_limit must be -1 or more".into()));
        }
        if !(1..=8).contains(&self.pool.extranonce1_size) {
            return Err(Error::Config("pool.extranonce1_size must be 1 to 8".into()));
        }
        for (port, diff) in &self.pool.port_diff_idx {
            if port.parse::<u16>().is_err() {
                return Err(Error::Config(format!(
                    "pool.port_diff_idx key {port:?} is not a port"
                )));
            }
            if *diff == 0 {
                return Err(Error::Config(format!(
                    "pool.port_diff_idx.{port} must be at least 1"
                )));
            }
        }
        self.pool.listen_addr()?;
        Ok(())
    }
}
