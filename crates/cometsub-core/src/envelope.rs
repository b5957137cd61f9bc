//! JSON-RPC 2.0 envelopes for the Tendermint/CometBFT subscription protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subscription RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Subscribe,
    Unsubscribe,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe => write!(f, "subscribe"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// `params` object of a subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    pub query: String,
}

/// Outbound subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: Method,
    pub params: QueryParams,
}

impl SubscriptionRequest {
    pub fn new(id: u64, method: Method, query: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method,
            params: QueryParams { query: query.into() },
        }
    }

    pub fn subscribe(id: u64, query: impl Into<String>) -> Self {
        Self::new(id, Method::Subscribe, query)
    }

    pub fn unsubscribe(id: u64, query: impl Into<String>) -> Self {
        Self::new(id, Method::Unsubscribe, query)
    }

    pub fn query(&self) -> &str {
        &self.params.query
    }
}

/// The `error` member of a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Human-readable detail, preferring the structured `data` field.
    ///
    /// Tendermint puts the useful part (e.g. the query parse failure) in
    /// `data` and a generic "Internal error" in `message`.
    pub fn detail(&self) -> String {
        match &self.data {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Null) | None => self.message.clone(),
            Some(Value::String(_)) => self.message.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// A parsed inbound frame.
///
/// The full JSON value is kept because dispatched events hand the complete
/// envelope to the subscription handler.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    value: Value,
}

impl InboundEnvelope {
    /// Parse a raw frame. Returns `None` for anything that is not a JSON object.
    pub fn parse(raw: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Object(_)) => Some(Self { value }),
            _ => None,
        }
    }

    /// Numeric request id, if any.
    pub fn id(&self) -> Option<u64> {
        self.value.get("id").and_then(Value::as_u64)
    }

    /// Returns `true` if a non-null `result` member is present.
    pub fn has_result(&self) -> bool {
        self.value.get("result").is_some_and(|r| !r.is_null())
    }

    /// The `error` member, if present and well-formed.
    pub fn error(&self) -> Option<RpcErrorObject> {
        let err = self.value.get("error")?;
        if err.is_null() {
            return None;
        }
        serde_json::from_value(err.clone()).ok()
    }

    /// `result.query` of an event notification.
    pub fn query(&self) -> Option<&str> {
        self.value
            .get("result")?
            .get("query")?
            .as_str()
            .filter(|q| !q.is_empty())
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}
