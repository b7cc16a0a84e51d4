//! Per-connection variable difficulty.
//!
//! Each connection aims for one share every [`TARGET_TIME`]. The controller
//! keeps a ring of recent inter-share times and, at most once every
//! [`RETARGET_TIME`], halves or doubles the difficulty factor when the
//! average falls outside `TARGET_TIME ± VARIANCE`. The factor never moves
//! more than 8x away from where the connection started, nor outside
//! `1..=256`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub const TARGET_TIME: Duration = Duration::from_secs(15);
pub const VARIANCE: Duration = Duration::from_millis(7500);
pub const RETARGET_TIME: Duration = Duration::from_secs(90);

/// Samples kept between retargets.
pub const BUFFER_SIZE: usize = (RETARGET_TIME.as_secs() / TARGET_TIME.as_secs()) as usize * 4;

pub const MIN_DIFF: u64 = 1;
pub const MAX_DIFF: u64 = 256;

/// Difficulty controller for one connection.
#[derive(Debug, Clone)]
pub struct VarDiff {
    current: u64,
    previous: u64,
    min: u64,
    max: u64,
    last_share: Instant,
    last_retarget: Instant,
    samples: VecDeque<Duration>,
}

impl VarDiff {
    pub fn new(start: u64, now: Instant) -> Self {
        let start = start.max(MIN_DIFF);
        Self {
            current: start,
            previous: start,
            min: (start / 8).max(MIN_DIFF),
            max: start.saturating_mul(8).min(MAX_DIFF),
            last_share: now,
            last_retarget: now,
            samples: VecDeque::with_capacity(BUFFER_SIZE),
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn previous(&self) -> u64 {
        self.previous
    }

    pub fn bounds(&self) -> (u64, u64) {
        (self.min, self.max)
    }

    /// Record a share seen at `now` and return the difficulty to use next.
    pub fn submit(&mut self, now: Instant) -> u64 {
        if self.samples.len() == BUFFER_SIZE {
            self.samples.pop_front();
        }
        self.samples
            .push_back(now.saturating_duration_since(self.last_share));
        self.last_share = now;

        if now.saturating_duration_since(self.last_retarget) < RETARGET_TIME {
            return self.current;
        }

        let total: Duration = self.samples.iter().sum();
        let average = total / self.samples.len().max(1) as u32;

        let next = if average > TARGET_TIME + VARIANCE && self.current > self.min {
            (self.current / 2).max(self.min)
        } else if average < TARGET_TIME - VARIANCE && self.current < self.max {
            (self.current * 2).min(self.max)
        } else {
            return self.current;
        };

        self.previous = self.current;
        self.current = next;
        self.samples.clear();
        self.last_retarget = now;
        next
    }
}

/// A retarget that happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retarget {
    pub from: u64,
    pub to: u64,
}

/// Controllers for every authorized connection.
#[derive(Debug, Default)]
pub struct VarDiffManager {
    conns: Mutex<HashMap<u64, VarDiff>>,
}

impl VarDiffManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn_id: u64, start: u64, now: Instant) {
        self.conns.lock().insert(conn_id, VarDiff::new(start, now));
    }

    pub fn remove(&self, conn_id: u64) {
        self.conns.lock().remove(&conn_id);
    }

    /// Feed a share; returns the change if the difficulty moved.
    pub fn submit(&self, conn_id: u64, now: Instant) -> Option<Retarget> {
        let mut conns = self.conns.lock();
        let vardiff = conns.get_mut(&conn_id)?;
        let from = vardiff.current();
        let to = vardiff.submit(now);
        (from != to).then_some(Retarget { from, to })
    }

    pub fn current(&self, conn_id: u64) -> Option<u64> {
        self.conns.lock().get(&conn_id).map(VarDiff::current)
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.lock().is_empty()
    }
}
