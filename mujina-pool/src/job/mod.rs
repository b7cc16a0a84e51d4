//! Jobs and their distribution to miners.

pub mod list;
pub mod manager;

use ruint::aliases::U256;
use serde_json::Value;

pub use list::{Appended, JobList};
pub use manager::JobManager;

/// A unit of work handed to miners. Immutable once appended to a
/// [`JobList`].
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Identifier sent to miners. Empty until the job list assigns one.
    pub id: String,

    /// Upstream host the job came from; blocks are submitted back to it.
    pub host_id: Option<String>,

    /// Header commitment the miner hashes.
    pub header_hash: String,

    pub seed_hash: Option<String>,

    pub height: u64,

    /// Network difficulty a share must meet to be a block.
    pub difficulty: U256,

    /// Chain-specific extras (nBits, candidate id, timestamps).
    pub data: Option<Value>,
}

impl Job {
    /// A job without a pool-assigned id.
    pub fn new(header_hash: impl Into<String>, height: u64, difficulty: U256) -> Self {
        Self {
            id: String::new(),
            host_id: None,
            header_hash: header_hash.into(),
            seed_hash: None,
            height,
            difficulty,
            data: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_host(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn with_seed(mut self, seed_hash: impl Into<String>) -> Self {
        self.seed_hash = Some(seed_hash.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// A string field of [`Job::data`].
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }
}
