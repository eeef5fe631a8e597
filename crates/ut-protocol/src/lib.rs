// ut-protocol: utran wire protocol types and serialization.
//
// Every body is a JSON object with a top-level `requestType` (requests) or
// `responseType` (responses) field used for discriminated deserialization.
// The raw-stream transport wraps bodies in the frame layout of [`codec`];
// the WebSocket transport carries bodies directly as text messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;

pub mod codec;

// ---------------------------------------------------------------------------
// Heartbeat literals
// ---------------------------------------------------------------------------

/// Client-to-server heartbeat. Transmitted outside any frame and recognized
/// by exact byte equality before any parse.
pub const PING: &[u8; 4] = b"PING";
/// Server-to-client heartbeat reply, same out-of-band rule as [`PING`].
pub const PONG: &[u8; 4] = b"PONG";

// ---------------------------------------------------------------------------
// Discriminators
// ---------------------------------------------------------------------------

/// Kind discriminator shared by requests, responses and frame headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtKind {
    Rpc,
    Subscribe,
    Unsubscribe,
    Publish,
    Multicall,
}

impl UtKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UtKind::Rpc => "rpc",
            UtKind::Subscribe => "subscribe",
            UtKind::Unsubscribe => "unsubscribe",
            UtKind::Publish => "publish",
            UtKind::Multicall => "multicall",
        }
    }

    /// Parse a header kind line. Unknown kinds fail the frame parse.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "rpc" => Ok(UtKind::Rpc),
            "subscribe" => Ok(UtKind::Subscribe),
            "unsubscribe" => Ok(UtKind::Unsubscribe),
            "publish" => Ok(UtKind::Publish),
            "multicall" => Ok(UtKind::Multicall),
            other => Err(ProtocolError::UnknownKind(other.to_owned())),
        }
    }
}

impl std::fmt::Display for UtKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome flag carried by every response. Wire encoding: 0 failed, 1 success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum UtState {
    Failed = 0,
    Success = 1,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Remote procedure invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    #[serde(rename = "methodName")]
    pub method_name: String,
    /// Ordered positional arguments; absent on the wire means empty.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyed arguments; absent on the wire means empty.
    #[serde(default)]
    pub dicts: Map<String, Value>,
}

/// Join one or more topics. The server normalizes case and whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub id: u64,
    pub topics: Vec<String>,
}

/// Leave one or more topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub id: u64,
    pub topics: Vec<String>,
}

/// Push `msg` to every subscriber of each topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub id: u64,
    pub topics: Vec<String>,
    #[serde(default)]
    pub msg: Value,
}

/// A batch of non-multicall requests answered as one ordered batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MulticallRequest {
    pub id: u64,
    pub multiple: Vec<UtRequest>,
}

/// All request kinds, tagged by the `requestType` field.
///
/// ```json
/// { "id": 1, "requestType": "rpc", "methodName": "add", "args": [], "dicts": {} }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "requestType", rename_all = "lowercase")]
pub enum UtRequest {
    Rpc(RpcRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Publish(PublishRequest),
    Multicall(MulticallRequest),
}

impl UtRequest {
    pub fn id(&self) -> u64 {
        match self {
            UtRequest::Rpc(r) => r.id,
            UtRequest::Subscribe(r) => r.id,
            UtRequest::Unsubscribe(r) => r.id,
            UtRequest::Publish(r) => r.id,
            UtRequest::Multicall(r) => r.id,
        }
    }

    pub fn kind(&self) -> UtKind {
        match self {
            UtRequest::Rpc(_) => UtKind::Rpc,
            UtRequest::Subscribe(_) => UtKind::Subscribe,
            UtRequest::Unsubscribe(_) => UtKind::Unsubscribe,
            UtRequest::Publish(_) => UtKind::Publish,
            UtRequest::Multicall(_) => UtKind::Multicall,
        }
    }
}

// ---------------------------------------------------------------------------
// Response body
// ---------------------------------------------------------------------------

/// One response body. `method_name` is only present for rpc responses and
/// `error` is omitted on the wire when empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtResponse {
    pub id: u64,
    #[serde(rename = "responseType")]
    pub response_type: UtKind,
    pub state: UtState,
    #[serde(
        rename = "methodName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub method_name: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl UtResponse {
    pub fn success(id: u64, response_type: UtKind, result: Value) -> Self {
        UtResponse {
            id,
            response_type,
            state: UtState::Success,
            method_name: None,
            result,
            error: String::new(),
        }
    }

    pub fn failed(id: u64, response_type: UtKind, error: impl Into<String>) -> Self {
        UtResponse {
            id,
            response_type,
            state: UtState::Failed,
            method_name: None,
            result: Value::Null,
            error: error.into(),
        }
    }

    pub fn with_method(mut self, method_name: impl Into<String>) -> Self {
        self.method_name = Some(method_name.into());
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    pub fn is_success(&self) -> bool {
        self.state == UtState::Success
    }
}

// ---------------------------------------------------------------------------
// Typed result views
// ---------------------------------------------------------------------------

/// `result` of a subscribe response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResult {
    /// Every topic the subscriber now holds.
    #[serde(rename = "allTopics")]
    pub all_topics: Vec<String>,
    /// The subset actually added by this request.
    #[serde(rename = "subTopics")]
    pub sub_topics: Vec<String>,
}

/// `result` of an unsubscribe response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeResult {
    #[serde(rename = "allTopics")]
    pub all_topics: Vec<String>,
    /// The subset actually removed by this request.
    #[serde(rename = "unSubTopics")]
    pub un_sub_topics: Vec<String>,
}

/// `result` of a server-initiated publish push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishPayload {
    pub topic: String,
    #[serde(default)]
    pub msg: Value,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Framing-level failures. Fatal for the connection that produced them.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame header: {0}")]
    BadHeader(String),
    #[error("unknown kind \"{0}\"")]
    UnknownKind(String),
    #[error("payload of {got} bytes exceeds limit of {limit}")]
    Oversize { got: usize, limit: usize },
    #[error("body is not a structured object: {0}")]
    BadBody(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rpc_request_wire_field_names_are_stable() {
        let req = UtRequest::Rpc(RpcRequest {
            id: 1,
            method_name: "add".to_owned(),
            args: vec![],
            dicts: serde_json::from_value(json!({"a": 2, "b": 3})).unwrap(),
        });
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 1,
                "requestType": "rpc",
                "methodName": "add",
                "args": [],
                "dicts": {"a": 2, "b": 3}
            })
        );
    }

    #[test]
    fn request_args_and_dicts_default_when_absent() {
        let req: UtRequest =
            serde_json::from_value(json!({"id": 7, "requestType": "rpc", "methodName": "f"}))
                .unwrap();
        match req {
            UtRequest::Rpc(rpc) => {
                assert!(rpc.args.is_empty());
                assert!(rpc.dicts.is_empty());
            }
            other => panic!("expected rpc, got {other:?}"),
        }
    }

    #[test]
    fn state_serializes_as_integer() {
        let resp = UtResponse::success(1, UtKind::Rpc, json!(5)).with_method("add");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["state"], json!(1));
        assert_eq!(value["methodName"], json!("add"));
        assert!(value.get("error").is_none(), "empty error must be omitted");

        let failed = UtResponse::failed(2, UtKind::Subscribe, "boom");
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["state"], json!(0));
        assert_eq!(value["error"], json!("boom"));
        assert!(value.get("methodName").is_none());
    }

    #[test]
    fn multicall_carries_inner_request_bodies() {
        let req: UtRequest = serde_json::from_value(json!({
            "id": 9,
            "requestType": "multicall",
            "multiple": [
                {"id": 10, "requestType": "rpc", "methodName": "a", "args": [], "dicts": {}},
                {"id": 11, "requestType": "subscribe", "topics": ["orders"]}
            ]
        }))
        .unwrap();
        match req {
            UtRequest::Multicall(mc) => {
                assert_eq!(mc.multiple.len(), 2);
                assert_eq!(mc.multiple[0].kind(), UtKind::Rpc);
                assert_eq!(mc.multiple[1].id(), 11);
            }
            other => panic!("expected multicall, got {other:?}"),
        }
    }

    #[test]
    fn unknown_request_type_fails_deserialization() {
        let res = serde_json::from_value::<UtRequest>(json!({"id": 1, "requestType": "get"}));
        assert!(res.is_err());
    }

    #[test]
    fn typed_result_views_match_wire_names() {
        let result: SubscribeResult = serde_json::from_value(json!({
            "allTopics": ["orders", "fills"],
            "subTopics": ["fills"]
        }))
        .unwrap();
        assert_eq!(result.all_topics, ["orders", "fills"]);
        assert_eq!(result.sub_topics, ["fills"]);

        let push: PublishPayload =
            serde_json::from_value(json!({"topic": "orders", "msg": {"qty": 1}})).unwrap();
        assert_eq!(push.topic, "orders");
        assert_eq!(push.msg, json!({"qty": 1}));
    }
}
