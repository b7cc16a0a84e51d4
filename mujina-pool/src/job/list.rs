//! Bounded, newest-first store of outstanding jobs for one chain.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use super::Job;

/// Pool-assigned ids are 40-bit counters rendered as ten hex digits.
const MAX_JOB_COUNTER: u64 = 0xff_ffff_ffff;

/// Result of a successful [`JobList::append`].
#[derive(Debug, Clone)]
pub struct Appended {
    /// The stored job, with its id assigned.
    pub job: Arc<Job>,

    /// Miners must drop all earlier work.
    pub clean_jobs: bool,

    /// The job's height differs from the previously tracked height.
    pub new_height: bool,
}

#[derive(Debug)]
struct Inner {
    size: usize,
    age_limit: i64,
    /// Ids, newest at the front.
    order: VecDeque<String>,
    index: HashMap<String, Arc<Job>>,
    height: u64,
    counter: u64,
}

/// Jobs a miner may still submit against.
///
/// Holds at most `size` jobs. A job stays *active* while its height is within
/// `age_limit` blocks of the newest height seen; `age_limit == -1` keeps
/// every stored job active.
#[derive(Debug)]
pub struct JobList {
    inner: RwLock<Inner>,
}

impl JobList {
    pub fn new(size: usize, age_limit: i64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                size: size.max(1),
                age_limit,
                order: VecDeque::with_capacity(size + 1),
                index: HashMap::with_capacity(size + 1),
                height: 0,
                counter: 0,
            }),
        }
    }

    /// Store `job` as the newest entry, assigning an id if it has none.
    ///
    /// Returns `None` if a job with the same id is already stored.
    pub fn append(&self, mut job: Job) -> Option<Appended> {
        let mut inner = self.inner.write();

        if job.id.is_empty() {
            inner.counter = if inner.counter >= MAX_JOB_COUNTER {
                1
            } else {
                inner.counter + 1
            };
            job.id = format!("{:010x}", inner.counter);
        }
        if inner.index.contains_key(&job.id) {
            return None;
        }

        let job = Arc::new(job);
        let new_height = job.height != inner.height;
        inner.order.push_front(job.id.clone());
        inner.index.insert(job.id.clone(), Arc::clone(&job));
        inner.height = job.height;

        // Evicting work at the incoming height would leave miners holding
        // jobs the pool no longer knows, so make them start over.
        let mut forced = false;
        while inner.order.len() > inner.size {
            let Some(evicted) = inner.order.pop_back() else {
                break;
            };
            if let Some(old) = inner.index.remove(&evicted) {
                forced |= old.height == job.height;
            }
        }

        Some(Appended {
            job,
            clean_jobs: new_height || forced,
            new_height,
        })
    }

    /// The job with `id` and whether shares for it are still accepted.
    pub fn get(&self, id: &str) -> Option<(Arc<Job>, bool)> {
        let inner = self.inner.read();
        let job = inner.index.get(id)?;
        Some((Arc::clone(job), inner.is_active(job)))
    }

    /// The job issued just before `id`.
    pub fn get_prior(&self, id: &str) -> Option<(Arc<Job>, bool)> {
        let inner = self.inner.read();
        let mut previous: Option<&String> = None;
        for current in inner.order.iter().rev() {
            if current == id {
                let job = inner.index.get(previous?)?;
                return Some((Arc::clone(job), inner.is_active(job)));
            }
            previous = Some(current);
        }
        None
    }

    pub fn latest(&self) -> Option<Arc<Job>> {
        let inner = self.inner.read();
        inner.order.front().and_then(|id| inner.index.get(id)).cloned()
    }

    pub fn oldest(&self) -> Option<Arc<Job>> {
        let inner = self.inner.read();
        inner.order.back().and_then(|id| inner.index.get(id)).cloned()
    }

    /// Height of the most recently appended job.
    pub fn height(&self) -> u64 {
        self.inner.read().height
    }

    pub fn age_limit(&self) -> i64 {
        self.inner.read().age_limit
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }

    #[cfg(test)]
    fn set_counter(&self, counter: u64) {
        self.inner.write().counter = counter;
    }
}

impl Inner {
    fn is_active(&self, job: &Job) -> bool {
        if self.age_limit == -1 || job.height >= self.height {
            return true;
        }
        self.height - job.height <= self.age_limit.max(0) as u64
    }
}
