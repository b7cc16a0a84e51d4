//! Fifteen-minute share intervals.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Interval length in seconds.
pub const INTERVAL_SECS: u64 = 900;

/// Key of the interval containing `unix_secs`.
pub fn interval_key(unix_secs: u64) -> String {
    (unix_secs / INTERVAL_SECS * INTERVAL_SECS).to_string()
}

pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct Current {
    key: String,
    announced: bool,
}

/// Current interval per chain, with a one-shot announcement flag.
#[derive(Debug, Default)]
pub struct Intervals {
    chains: Mutex<HashMap<String, Current>>,
}

/// Result of [`Intervals::observe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub key: String,
    /// The caller must announce this interval to the aggregator.
    pub announce: bool,
}

impl Intervals {
    pub fn new() -> Self {
        Self::default()
    }

    /// The interval for `chain` at `unix_secs`. `announce` is set exactly
    /// once per chain per interval.
    pub fn observe(&self, chain: &str, unix_secs: u64) -> Observed {
        let key = interval_key(unix_secs);
        let mut chains = self.chains.lock();
        let current = chains.entry(chain.to_string()).or_default();
        if current.key != key {
            current.key = key.clone();
            current.announced = false;
        }
        let announce = !current.announced;
        current.announced = true;
        Observed { key, announce }
    }

    /// Clear the flag after a failed announcement so the next share retries.
    pub fn unannounce(&self, chain: &str, key: &str) {
        if let Some(current) = self.chains.lock().get_mut(chain) {
            if current.key == key {
                current.announced = false;
            }
        }
    }

    pub fn current(&self, chain: &str) -> Option<String> {
        self.chains.lock().get(chain).map(|c| c.key.clone())
    }
}
