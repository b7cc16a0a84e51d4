//! Upstream node endpoints with health-checked routing.
//!
//! A [`HostPool`] keeps an ordered list of hosts. Requests go to the first
//! host that is enabled, healthy and, when the request needs it, synced.
//! A transport failure marks the host unhealthy and the request moves on to
//! the next one. Errors the node itself returns are passed straight back.
//!
//! [`HostPool::health_check`] probes every host in parallel and reorders the
//! list by latency. The current favourite keeps its place unless another host
//! is more than 20% faster, so routing does not flap between similar hosts.

pub mod http;
pub mod tcp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::rpc::{Message, Request};
use crate::tracing::prelude::*;

pub use http::HttpTransport;
pub use tcp::TcpTransport;

/// Host id meaning "try only the first usable host".
pub const ONCE: &str = "once";

/// Default bound on each health probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const NOTIFICATION_DEPTH: usize = 64;

/// The favourite keeps its place unless the fastest host beats it by more
/// than this ratio.
const STICKINESS: (u64, u64) = (12, 10);

/// A way of talking JSON-RPC to one upstream host.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stable identifier, usually the URL.
    fn id(&self) -> &str;

    async fn send(&self, req: &Request) -> Result<Message>;

    /// Send several requests, returning responses in request order.
    async fn send_batch(&self, reqs: &[Request]) -> Result<Vec<Message>> {
        let mut out = Vec::with_capacity(reqs.len());
        for req in reqs {
            out.push(self.send(req).await?);
        }
        Ok(out)
    }

    /// Called after a transport failure. Persistent transports drop their
    /// connection here so the next request reconnects.
    async fn on_failure(&self) {}
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    fn id(&self) -> &str {
        (**self).id()
    }

    async fn send(&self, req: &Request) -> Result<Message> {
        (**self).send(req).await
    }

    async fn send_batch(&self, reqs: &[Request]) -> Result<Vec<Message>> {
        (**self).send_batch(reqs).await
    }

    async fn on_failure(&self) {
        (**self).on_failure().await
    }
}

/// How [`HostPool::health_check`] probes a host.
#[derive(Debug, Clone)]
pub struct Probe {
    pub method: String,
    pub params: Value,
    /// Reads the sync state from the probe's result.
    pub synced: fn(&Value) -> bool,
}

impl Probe {
    pub fn new(method: impl Into<String>, params: Value, synced: fn(&Value) -> bool) -> Self {
        Self {
            method: method.into(),
            params,
            synced,
        }
    }
}

/// One host and its health.
pub struct HostConn<T> {
    transport: T,
    enabled: AtomicBool,
    healthy: AtomicBool,
    synced: AtomicBool,
    errors: AtomicU64,
    successes: AtomicU64,
    latency_us: AtomicU64,
}

impl<T: Transport> HostConn<T> {
    fn new(transport: T, enabled: bool) -> Self {
        Self {
            transport,
            enabled: AtomicBool::new(enabled),
            healthy: AtomicBool::new(true),
            synced: AtomicBool::new(true),
            errors: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        self.transport.id()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Acquire)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Acquire)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Acquire))
    }

    fn usable(&self, needs_synced: bool) -> bool {
        self.enabled() && self.healthy() && (!needs_synced || self.synced())
    }

    async fn mark_failed(&self, error: &Error) {
        let errors = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
        self.healthy.store(false, Ordering::Release);
        warn!(host = self.id(), errors, error = %error, "Upstream host failed");
        self.transport.on_failure().await;
    }
}

struct Registry<T> {
    order: Vec<String>,
    conns: HashMap<String, Arc<HostConn<T>>>,
}

/// An ordered set of upstream hosts.
pub struct HostPool<T = Box<dyn Transport>> {
    registry: RwLock<Registry<T>>,
    probe: Probe,
    probe_timeout: Duration,
    next_id: AtomicU64,
    notify: broadcast::Sender<Message>,
}

impl<T: Transport> HostPool<T> {
    pub fn new(probe: Probe, probe_timeout: Duration) -> Self {
        let (notify, _) = broadcast::channel(NOTIFICATION_DEPTH);
        Self {
            registry: RwLock::new(Registry {
                order: Vec::new(),
                conns: HashMap::new(),
            }),
            probe,
            probe_timeout,
            next_id: AtomicU64::new(1),
            notify,
        }
    }

    /// Add a host at the end of the order.
    pub fn add(&self, transport: T, enabled: bool) {
        let id = transport.id().to_string();
        let mut registry = self.registry.write();
        if registry.conns.contains_key(&id) {
            warn!(host = %id, "Duplicate upstream host ignored");
            return;
        }
        registry.order.push(id.clone());
        registry
            .conns
            .insert(id, Arc::new(HostConn::new(transport, enabled)));
    }

    /// Sender persistent transports forward server-pushed messages to.
    pub fn notify_sender(&self) -> broadcast::Sender<Message> {
        self.notify.clone()
    }

    /// Server-pushed messages from any host.
    pub fn notifications(&self) -> broadcast::Receiver<Message> {
        self.notify.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Arc<HostConn<T>>> {
        self.registry.read().conns.get(id).cloned()
    }

    /// Host ids, preferred first.
    pub fn order(&self) -> Vec<String> {
        self.registry.read().order.clone()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) {
        if let Some(conn) = self.get(id) {
            conn.enabled.store(enabled, Ordering::Release);
        }
    }

    fn next_request(&self, method: &str, params: Value) -> Request {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Request::new(id, method, params)
    }

    /// Hosts to try, in order. A requested usable host goes first.
    fn candidates(&self, host_id: Option<&str>, needs_synced: bool) -> Vec<Arc<HostConn<T>>> {
        let registry = self.registry.read();
        let mut out: Vec<Arc<HostConn<T>>> = Vec::with_capacity(registry.order.len());

        let preferred = host_id
            .filter(|id| *id != ONCE)
            .and_then(|id| registry.conns.get(id))
            .filter(|conn| conn.usable(needs_synced));
        if let Some(conn) = preferred {
            out.push(Arc::clone(conn));
        }

        for id in &registry.order {
            let Some(conn) = registry.conns.get(id) else {
                continue;
            };
            if !conn.usable(needs_synced) || out.iter().any(|c| Arc::ptr_eq(c, conn)) {
                continue;
            }
            out.push(Arc::clone(conn));
        }

        if host_id == Some(ONCE) {
            out.truncate(1);
        }
        out
    }

    /// Send `method` to the best host, failing over on transport errors.
    ///
    /// `host_id` asks for a particular host when it is usable; [`ONCE`]
    /// tries a single host without failover.
    pub async fn exec(
        &self,
        host_id: Option<&str>,
        method: &str,
        params: Value,
        needs_synced: bool,
    ) -> Result<Value> {
        self.exec_with_host(host_id, method, params, needs_synced)
            .await
            .map(|(_, value)| value)
    }

    /// Like [`HostPool::exec`], also naming the host that answered.
    pub async fn exec_with_host(
        &self,
        host_id: Option<&str>,
        method: &str,
        params: Value,
        needs_synced: bool,
    ) -> Result<(String, Value)> {
        let req = self.next_request(method, params);
        let candidates = self.candidates(host_id, needs_synced);
        if candidates.is_empty() {
            return Err(Error::NoHealthyHosts);
        }

        let mut last = Error::NoHealthyHosts;
        for conn in candidates {
            match conn.transport.send(&req).await {
                Ok(msg) => {
                    conn.successes.fetch_add(1, Ordering::AcqRel);
                    return msg.into_result().map(|value| (conn.id().to_string(), value));
                }
                Err(e) if e.is_transport() => {
                    conn.mark_failed(&e).await;
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Send several calls to one host in a single round trip.
    ///
    /// Results come back in call order. The first response carrying an
    /// error aborts the whole batch.
    pub async fn exec_bulk(
        &self,
        calls: Vec<(String, Value)>,
        needs_synced: bool,
    ) -> Result<Vec<Value>> {
        let reqs: Vec<Request> = calls
            .into_iter()
            .map(|(method, params)| self.next_request(&method, params))
            .collect();
        let candidates = self.candidates(None, needs_synced);
        if candidates.is_empty() {
            return Err(Error::NoHealthyHosts);
        }

        let mut last = Error::NoHealthyHosts;
        for conn in candidates {
            match conn.transport.send_batch(&reqs).await {
                Ok(msgs) => {
                    conn.successes.fetch_add(1, Ordering::AcqRel);
                    return msgs.into_iter().map(Message::into_result).collect();
                }
                Err(e) if e.is_transport() => {
                    conn.mark_failed(&e).await;
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Probe every enabled host and reorder by latency.
    pub async fn health_check(&self) {
        let conns: Vec<Arc<HostConn<T>>> = {
            let registry = self.registry.read();
            registry.conns.values().cloned().collect()
        };

        let probes = conns
            .iter()
            .filter(|conn| conn.enabled())
            .map(|conn| self.probe_one(conn));
        futures::future::join_all(probes).await;

        let mut registry = self.registry.write();
        let stats: HashMap<String, HostStats> = registry
            .conns
            .iter()
            .map(|(id, conn)| {
                (
                    id.clone(),
                    HostStats {
                        latency: conn.latency(),
                        successes: conn.successes(),
                    },
                )
            })
            .collect();
        let order = reorder(&registry.order, &stats);
        if order.first() != registry.order.first() {
            info!(
                from = ?registry.order.first(),
                to = ?order.first(),
                "Preferred upstream host changed"
            );
        }
        registry.order = order;
    }

    async fn probe_one(&self, conn: &HostConn<T>) {
        let req = self.next_request(&self.probe.method, self.probe.params.clone());
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.probe_timeout, conn.transport.send(&req)).await;

        let result = match outcome {
            Ok(Ok(msg)) => msg.into_result(),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout),
        };

        match result {
            Ok(value) => {
                let latency = started.elapsed();
                conn.latency_us
                    .store(latency.as_micros() as u64, Ordering::Release);
                conn.successes.fetch_add(1, Ordering::AcqRel);
                conn.healthy.store(true, Ordering::Release);
                let synced = (self.probe.synced)(&value);
                if conn.synced.swap(synced, Ordering::AcqRel) != synced {
                    info!(host = conn.id(), synced, "Upstream sync state changed");
                }
                trace!(host = conn.id(), latency_ms = latency.as_millis() as u64, "Probe ok");
            }
            Err(e) => {
                conn.latency_us
                    .store((self.probe_timeout * 2).as_micros() as u64, Ordering::Release);
                if e.is_transport() {
                    conn.mark_failed(&e).await;
                } else {
                    // The host answered, so it is reachable, but the probe
                    // itself is broken.
                    conn.healthy.store(true, Ordering::Release);
                    warn!(host = conn.id(), error = %e, "Probe returned an error");
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HostStats {
    latency: Duration,
    successes: u64,
}

/// New host order after a health check.
fn reorder(order: &[String], stats: &HashMap<String, HostStats>) -> Vec<String> {
    let any_success = stats.values().any(|s| s.successes > 0);
    let (mut alive, blacklist): (Vec<&String>, Vec<&String>) = order
        .iter()
        .filter(|id| stats.contains_key(*id))
        .partition(|id| !(any_success && stats[*id].successes == 0));

    alive.sort_by_key(|id| stats[*id].latency);

    if let (Some(previous), Some(fastest)) = (order.first(), alive.first().copied()) {
        if let Some(pos) = alive.iter().position(|id| *id == previous) {
            let l0 = stats[previous].latency.as_micros() as u64;
            let lmin = stats[fastest].latency.as_micros() as u64;
            if lmin * STICKINESS.0 >= l0 * STICKINESS.1 {
                let prev = alive.remove(pos);
                alive.insert(0, prev);
            }
        }
    }

    alive.into_iter().chain(blacklist).cloned().collect()
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    /// A host answering every request with a fixed result.
    pub struct FakeTransport {
        id: String,
        pub result: Mutex<Value>,
        pub down: AtomicBool,
        pub delay: Mutex<Duration>,
        pub calls: AtomicU64,
        pub failures_seen: AtomicU64,
    }

    impl FakeTransport {
        pub fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                result: Mutex::new(json!(false)),
                down: AtomicBool::new(false),
                delay: Mutex::new(Duration::ZERO),
                calls: AtomicU64::new(0),
                failures_seen: AtomicU64::new(0),
            })
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::Release);
        }
    }

    #[async_trait]
    impl Transport for Arc<FakeTransport> {
        fn id(&self) -> &str {
            &self.id
        }

        async fn send(&self, req: &Request) -> Result<Message> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.down.load(Ordering::Acquire) {
                return Err(Error::Disconnected);
            }
            if req.method == "broken" {
                return Ok(Message {
                    id: Some(req.id.clone()),
                    error: Some(json!({"code": -32601, "message": "method not found"})),
                    ..Default::default()
                });
            }
            Ok(Message {
                id: Some(req.id.clone()),
                result: Some(self.result.lock().clone()),
                ..Default::default()
            })
        }

        async fn on_failure(&self) {
            self.failures_seen.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn probe() -> Probe {
        Probe::new("eth_syncing", json!([]), |v| v == &json!(false))
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn pool(hosts: &[&Arc<FakeTransport>]) -> HostPool<Arc<FakeTransport>> {
        let pool = HostPool::new(probe(), Duration::from_secs(1));
        for host in hosts {
            pool.add(Arc::clone(host), true);
        }
        pool
    }

    #[tokio::test]
    async fn empty_pool_has_no_healthy_hosts() {
        let pool: HostPool<Arc<FakeTransport>> = HostPool::new(probe(), Duration::from_secs(1));
        assert!(matches!(
            pool.exec(None, "x", json!([]), false).await,
            Err(Error::NoHealthyHosts)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failover_then_reorder() {
        let a = FakeTransport::new("A");
        let b = FakeTransport::new("B");
        *a.result.lock() = json!("from A");
        *b.result.lock() = json!("from B");
        let pool = pool(&[&a, &b]);

        assert_eq!(pool.exec(None, "x", json!([]), false).await.unwrap(), json!("from A"));

        a.set_down(true);
        assert_eq!(pool.exec(None, "x", json!([]), false).await.unwrap(), json!("from B"));
        let host_a = pool.get("A").unwrap();
        assert_eq!(host_a.errors(), 1);
        assert!(!host_a.healthy());
        assert_eq!(a.failures_seen.load(Ordering::Acquire), 1);

        *b.delay.lock() = Duration::from_millis(10);
        pool.health_check().await;
        assert_eq!(pool.order(), vec!["B".to_string(), "A".to_string()]);
    }

    #[tokio::test]
    async fn rpc_errors_do_not_fail_over() {
        let a = FakeTransport::new("A");
        let b = FakeTransport::new("B");
        let pool = pool(&[&a, &b]);

        match pool.exec(None, "broken", json!([]), false).await {
            Err(Error::Rpc { code, .. }) => assert_eq!(code, -32601),
            other => panic!("expected rpc error, got {other:?}"),
        }
        assert_eq!(b.calls.load(Ordering::Acquire), 0);
        assert!(pool.get("A").unwrap().healthy());
    }

    #[tokio::test]
    async fn once_tries_a_single_host() {
        let a = FakeTransport::new("A");
        let b = FakeTransport::new("B");
        a.set_down(true);
        let pool = pool(&[&a, &b]);

        assert!(matches!(
            pool.exec(Some(ONCE), "x", json!([]), false).await,
            Err(Error::Disconnected)
        ));
        assert_eq!(b.calls.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn requested_host_goes_first() {
        let a = FakeTransport::new("A");
        let b = FakeTransport::new("B");
        *b.result.lock() = json!("from B");
        let pool = pool(&[&a, &b]);

        assert_eq!(
            pool.exec(Some("B"), "x", json!([]), false).await.unwrap(),
            json!("from B")
        );
        assert_eq!(a.calls.load(Ordering::Acquire), 0);

        let (host, _) = pool
            .exec_with_host(None, "x", json!([]), false)
            .await
            .unwrap();
        assert_eq!(host, "A");
    }

    #[tokio::test]
    async fn synced_requests_skip_syncing_hosts() {
        let a = FakeTransport::new("A");
        let b = FakeTransport::new("B");
        *a.result.lock() = json!({"currentBlock": "0x1"});
        let pool = pool(&[&a, &b]);

        pool.health_check().await;
        assert!(!pool.get("A").unwrap().synced());
        assert!(pool.get("B").unwrap().synced());

        *b.result.lock() = json!("from B");
        assert_eq!(pool.exec(None, "x", json!([]), true).await.unwrap(), json!("from B"));
    }

    #[tokio::test]
    async fn disabled_hosts_are_skipped() {
        let a = FakeTransport::new("A");
        let pool = pool(&[&a]);
        pool.set_enabled("A", false);
        assert!(matches!(
            pool.exec(None, "x", json!([]), false).await,
            Err(Error::NoHealthyHosts)
        ));
    }

    #[tokio::test]
    async fn bulk_returns_results_in_order() {
        let a = FakeTransport::new("A");
        *a.result.lock() = json!(7);
        let pool = pool(&[&a]);
        let out = pool
            .exec_bulk(vec![("x".into(), json!([])), ("y".into(), json!([]))], false)
            .await
            .unwrap();
        assert_eq!(out, vec![json!(7), json!(7)]);

        assert!(pool
            .exec_bulk(vec![("x".into(), json!([])), ("broken".into(), json!([]))], false)
            .await
            .is_err());
    }

    fn stats(entries: &[(&str, u64, u64)]) -> HashMap<String, HostStats> {
        entries
            .iter()
            .map(|(id, ms, ok)| {
                (
                    id.to_string(),
                    HostStats {
                        latency: Duration::from_millis(*ms),
                        successes: *ok,
                    },
                )
            })
            .collect()
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test_case(100, 90, &["A", "B"] ; "within twenty percent stays")]
    #[test_case(100, 84, &["A", "B"] ; "at the stickiness boundary stays")]
    #[test_case(100, 80, &["B", "A"] ; "much faster takes over")]
    #[test_case(100, 100, &["A", "B"] ; "tie keeps favourite")]
    fn stickiness(a_ms: u64, b_ms: u64, expected: &[&str]) {
        let order = reorder(&ids(&["A", "B"]), &stats(&[("A", a_ms, 1), ("B", b_ms, 1)]));
        assert_eq!(order, ids(expected));
    }

    #[test]
    fn zero_success_hosts_go_last() {
        let order = reorder(
            &ids(&["A", "B", "C"]),
            &stats(&[("A", 1, 0), ("B", 50, 3), ("C", 30, 2)]),
        );
        assert_eq!(order, ids(&["C", "B", "A"]));
    }

    #[test]
    fn no_blacklist_when_nobody_succeeded() {
        let order = reorder(&ids(&["A", "B"]), &stats(&[("A", 50, 0), ("B", 10, 0)]));
        assert_eq!(order, ids(&["B", "A"]));
    }
}
