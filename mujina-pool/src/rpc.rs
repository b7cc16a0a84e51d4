//! Line-delimited JSON-RPC framing.
//!
//! Miners speak a loose mix of JSON-RPC 1.x and 2.0 over TCP, one JSON
//! object per line. Upstream nodes do the same over HTTP and persistent TCP.
//! Inbound frames are parsed into a single [`Message`] that accepts the union
//! of the request and response shapes, because peers multiplex both on one
//! stream. Outbound frames are one of the [`Outbound`] variants.
//!
//! Message ids are kept as raw JSON so that whatever the peer sent (number,
//! string, something larger than 64 bits) is echoed back byte-for-byte.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::error::{Error, Result};

/// A JSON-RPC id, preserved verbatim.
pub type RawId = Box<RawValue>;

/// Version tag written on every outbound frame.
pub const VERSION: &str = "2.0";

/// Build a numeric id.
pub fn id(n: u64) -> RawId {
    serde_json::value::to_raw_value(&n).unwrap_or_else(|_| RawValue::NULL.to_owned())
}

/// The id carried by pushed notifications.
pub fn notify_id() -> RawId {
    id(0)
}

/// Inbound frame: the union of request, notification and response shapes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RawId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,

    /// Some miners put the worker name here instead of in the username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Message {
    /// Parse one frame.
    pub fn parse(line: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(line)?)
    }

    /// The id to answer with; `null` when the peer sent none.
    pub fn reply_id(&self) -> RawId {
        match &self.id {
            Some(id) => id.clone(),
            None => RawValue::NULL.to_owned(),
        }
    }

    /// The id as an integer, for peers we assigned numeric ids to.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id
            .as_ref()
            .and_then(|raw| serde_json::from_str::<u64>(raw.get()).ok())
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// Positional parameters.
    pub fn params_array(&self) -> Result<&[Value]> {
        self.params
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Protocol("params is not an array".into()))
    }

    /// Positional parameter `n` as a string.
    pub fn string_param(&self, n: usize) -> Option<&str> {
        self.params.as_array()?.get(n)?.as_str()
    }

    /// The upstream error carried by this response, if any.
    ///
    /// Nodes report errors as `{code, message}` objects, Stratum v1 style
    /// `[code, message, data]` arrays, or bare strings.
    pub fn rpc_error(&self) -> Option<Error> {
        let error = self.error.as_ref()?;
        match error {
            Value::Null => None,
            Value::Object(obj) => Some(Error::Rpc {
                code: obj.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            Value::Array(arr) => Some(Error::Rpc {
                code: arr.first().and_then(Value::as_i64).unwrap_or(-1),
                message: arr
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Some(Error::Rpc {
                code: -1,
                message: other.as_str().map(str::to_string).unwrap_or_else(|| other.to_string()),
            }),
        }
    }

    /// The result value, or the upstream error.
    pub fn into_result(self) -> Result<Value> {
        if let Some(e) = self.rpc_error() {
            return Err(e);
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Error codes reported to miners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum ErrorCode {
    #[strum(serialize = "invalid request")]
    InvalidRequest = 1,
    #[strum(serialize = "invalid auth")]
    InvalidAuth = 2,
    #[strum(serialize = "invalid format, expected chain:address")]
    InvalidAddressFormat = 3,
    #[strum(serialize = "invalid chain")]
    InvalidChain = 4,
    #[strum(serialize = "invalid address")]
    InvalidAddress = 5,
    #[strum(serialize = "worker name too long")]
    WorkerNameTooLong = 6,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

impl From<ErrorCode> for ErrorObject {
    fn from(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.to_string(),
        }
    }
}

/// `{id, jsonrpc, result}`
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: RawId,
    pub jsonrpc: &'static str,
    pub result: Value,
}

/// Like [`Response`] but with an explicit `"error": null`; some miners
/// reject responses without the key.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseForced {
    pub id: RawId,
    pub jsonrpc: &'static str,
    pub result: Value,
    pub error: Option<ErrorObject>,
}

/// `{id, jsonrpc, error: {code, message}}`
#[derive(Debug, Clone, Serialize)]
pub struct ResponseWithError {
    pub id: RawId,
    pub jsonrpc: &'static str,
    pub error: ErrorObject,
}

/// `{id, jsonrpc, method, params}`, for notifications pushed to miners and
/// requests sent upstream.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: RawId,
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: self::id(id),
            jsonrpc: VERSION,
            method: method.into(),
            params,
        }
    }

    /// A pushed notification (`id` = 0).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self::new(0, method, params)
    }

    pub fn numeric_id(&self) -> Option<u64> {
        serde_json::from_str(self.id.get()).ok()
    }
}

/// Anything the pool writes to a socket.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Response(Response),
    ResponseForced(ResponseForced),
    Error(ResponseWithError),
    Request(Request),
}

impl Outbound {
    /// A successful response, in the forced-error shape when `forced`.
    pub fn response(id: RawId, result: Value, forced: bool) -> Self {
        if forced {
            Outbound::ResponseForced(ResponseForced {
                id,
                jsonrpc: VERSION,
                result,
                error: None,
            })
        } else {
            Outbound::Response(Response {
                id,
                jsonrpc: VERSION,
                result,
            })
        }
    }

    pub fn error(id: RawId, error: impl Into<ErrorObject>) -> Self {
        Outbound::Error(ResponseWithError {
            id,
            jsonrpc: VERSION,
            error: error.into(),
        })
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Outbound::Request(Request::notification(method, params))
    }

    /// Encode without the trailing newline; the connection adds it.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl From<Request> for Outbound {
    fn from(req: Request) -> Self {
        Outbound::Request(req)
    }
}
