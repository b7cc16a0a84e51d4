//! JSON-RPC over HTTP.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};

use super::Transport;
use crate::error::{Error, Result};
use crate::rpc::{Message, Request};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: Option<String>,
}

/// One HTTP JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    credentials: Option<Credentials>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(Self {
            url: url.into(),
            client,
            headers,
            credentials: None,
        })
    }

    /// Authenticate with HTTP Basic auth.
    pub fn basic_auth(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password,
        });
        self
    }

    async fn post(&self, body: Vec<u8>) -> Result<bytes::Bytes> {
        let mut builder = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body);
        if let Some(creds) = &self.credentials {
            builder = builder.basic_auth(&creds.username, creds.password.as_deref());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn id(&self) -> &str {
        &self.url
    }

    async fn send(&self, req: &Request) -> Result<Message> {
        let body = serde_json::to_vec(req)?;
        let bytes = self.post(body).await?;
        Message::parse(&bytes)
    }

    async fn send_batch(&self, reqs: &[Request]) -> Result<Vec<Message>> {
        let body = serde_json::to_vec(reqs)?;
        let bytes = self.post(body).await?;
        let responses: Vec<Message> = serde_json::from_slice(&bytes)?;

        // Servers may answer a batch in any order.
        let mut by_id: HashMap<String, Message> = responses
            .into_iter()
            .filter_map(|msg| {
                let key = msg.id.as_ref()?.get().to_string();
                Some((key, msg))
            })
            .collect();
        reqs.iter()
            .map(|req| {
                by_id.remove(req.id.get()).ok_or_else(|| {
                    Error::Protocol(format!("no response for request {}", req.id.get()))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostpool::{HostPool, Probe};
    use axum::{
        extract::State,
        http::{HeaderMap as AxumHeaders, StatusCode},
        routing::post,
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct NodeState {
        down: AtomicBool,
    }

    async fn handler(
        State(state): State<Arc<NodeState>>,
        headers: AxumHeaders,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        if state.down.load(Ordering::Acquire) {
            return (StatusCode::BAD_GATEWAY, Json(json!("down")));
        }
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let answer = |req: &Value| {
            let method = req["method"].as_str().unwrap_or_default();
            match method {
                "eth_syncing" => json!({"id": req["id"], "jsonrpc": "2.0", "result": false}),
                "whoami" => json!({"id": req["id"], "jsonrpc": "2.0", "result": auth}),
                "fail" => json!({
                    "id": req["id"],
                    "jsonrpc": "2.0",
                    "error": {"code": -32000, "message": "nope"}
                }),
                _ => json!({"id": req["id"], "jsonrpc": "2.0", "result": req["params"]}),
            }
        };
        let out = match &body {
            Value::Array(reqs) => Value::Array(reqs.iter().rev().map(answer).collect()),
            req => answer(req),
        };
        (StatusCode::OK, Json(out))
    }

    async fn spawn_node() -> (String, Arc<NodeState>) {
        let state = Arc::new(NodeState::default());
        let app = Router::new()
            .route("/", post(handler))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, state)
    }

    #[tokio::test]
    async fn sends_request_and_parses_response() {
        let (url, _state) = spawn_node().await;
        let transport = HttpTransport::new(url).unwrap();
        let msg = transport
            .send(&Request::new(5, "echo", json!(["a", 1])))
            .await
            .unwrap();
        assert_eq!(msg.numeric_id(), Some(5));
        assert_eq!(msg.into_result().unwrap(), json!(["a", 1]));
    }

    #[tokio::test]
    async fn applies_basic_auth() {
        let (url, _state) = spawn_node().await;
        let transport = HttpTransport::new(url)
            .unwrap()
            .basic_auth("user", Some("pass".into()));
        let msg = transport
            .send(&Request::new(1, "whoami", json!([])))
            .await
            .unwrap();
        // base64("user:pass")
        assert_eq!(msg.into_result().unwrap(), json!("Basic dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn bad_status_is_a_transport_error() {
        let (url, state) = spawn_node().await;
        state.down.store(true, Ordering::Release);
        let transport = HttpTransport::new(url).unwrap();
        let err = transport
            .send(&Request::new(1, "echo", json!([])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 502, .. }));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn batch_responses_are_matched_by_id() {
        let (url, _state) = spawn_node().await;
        let transport = HttpTransport::new(url).unwrap();
        let reqs = vec![
            Request::new(1, "echo", json!(["one"])),
            Request::new(2, "echo", json!(["two"])),
        ];
        let out = transport.send_batch(&reqs).await.unwrap();
        assert_eq!(out[0].numeric_id(), Some(1));
        assert_eq!(out[1].numeric_id(), Some(2));
    }

    #[tokio::test]
    async fn pool_fails_over_between_http_hosts() {
        let (url_a, state_a) = spawn_node().await;
        let (url_b, _state_b) = spawn_node().await;
        let pool: HostPool<HttpTransport> = HostPool::new(
            Probe::new("eth_syncing", json!([]), |v| v == &json!(false)),
            Duration::from_secs(1),
        );
        pool.add(HttpTransport::new(url_a.clone()).unwrap(), true);
        pool.add(HttpTransport::new(url_b.clone()).unwrap(), true);

        assert_eq!(
            pool.exec(None, "echo", json!(["x"]), false).await.unwrap(),
            json!(["x"])
        );

        state_a.down.store(true, Ordering::Release);
        assert_eq!(
            pool.exec(None, "echo", json!(["y"]), false).await.unwrap(),
            json!(["y"])
        );
        assert_eq!(pool.get(&url_a).unwrap().errors(), 1);

        pool.health_check().await;
        assert_eq!(pool.order(), vec![url_b, url_a]);

        let bulk = pool
            .exec_bulk(vec![("echo".into(), json!([1])), ("fail".into(), json!([]))], false)
            .await;
        assert!(matches!(bulk, Err(Error::Rpc { code: -32000, .. })));
    }
}
