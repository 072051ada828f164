//! Jupyter protocol message envelope.
//!
//! Every message on the execution channel is an envelope of `header`,
//! `parent_header`, `metadata`, and `content`. Replies carry the request's
//! header as their `parent_header`; `parent_id()` is the sole correlation
//! mechanism between a request and everything the kernel emits for it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{MsgId, SessionId};

/// Protocol version we speak.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Message type. Unknown types are kept verbatim in `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MsgType {
    ExecuteRequest,
    ExecuteReply,
    ExecuteInput,
    ExecuteResult,
    DisplayData,
    Stream,
    Error,
    Status,
    KernelInfoRequest,
    KernelInfoReply,
    Other(String),
}

impl MsgType {
    pub fn as_str(&self) -> &str {
        match self {
            MsgType::ExecuteRequest => "execute_request",
            MsgType::ExecuteReply => "execute_reply",
            MsgType::ExecuteInput => "execute_input",
            MsgType::ExecuteResult => "execute_result",
            MsgType::DisplayData => "display_data",
            MsgType::Stream => "stream",
            MsgType::Error => "error",
            MsgType::Status => "status",
            MsgType::KernelInfoRequest => "kernel_info_request",
            MsgType::KernelInfoReply => "kernel_info_reply",
            MsgType::Other(s) => s,
        }
    }
}

impl From<&str> for MsgType {
    fn from(s: &str) -> Self {
        match s {
            "execute_request" => MsgType::ExecuteRequest,
            "execute_reply" => MsgType::ExecuteReply,
            "execute_input" => MsgType::ExecuteInput,
            "execute_result" => MsgType::ExecuteResult,
            "display_data" => MsgType::DisplayData,
            "stream" => MsgType::Stream,
            "error" => MsgType::Error,
            "status" => MsgType::Status,
            "kernel_info_request" => MsgType::KernelInfoRequest,
            "kernel_info_reply" => MsgType::KernelInfoReply,
            other => MsgType::Other(other.to_string()),
        }
    }
}

impl From<String> for MsgType {
    fn from(s: String) -> Self {
        match MsgType::from(s.as_str()) {
            MsgType::Other(_) => MsgType::Other(s),
            known => known,
        }
    }
}

impl From<MsgType> for String {
    fn from(t: MsgType) -> Self {
        match t {
            MsgType::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel socket a message travels on, as multiplexed by the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
    Control,
    #[serde(rename = "hb")]
    Heartbeat,
}

/// Message header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: MsgId,
    pub msg_type: MsgType,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Header {
    fn new(msg_type: MsgType, session: &str) -> Self {
        Self {
            msg_id: MsgId::new(),
            msg_type,
            session: session.to_string(),
            username: "kernelgate".to_string(),
            date: Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)),
            version: default_version(),
        }
    }
}

/// One envelope on the execution channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub header: Header,
    /// `{}` on the wire when absent.
    #[serde(default, with = "parent_header")]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Value>,
}

impl ProtocolMessage {
    /// A fresh message with a newly minted msg_id.
    pub fn new(msg_type: MsgType, channel: Channel, session: &SessionId, content: Value) -> Self {
        Self {
            header: Header::new(msg_type, &session.to_hex()),
            parent_header: None,
            metadata: Map::new(),
            content,
            channel: Some(channel),
            buffers: Vec::new(),
        }
    }

    /// An `execute_request` carrying `code` on the shell channel.
    pub fn execute_request(session: &SessionId, code: &str) -> Self {
        Self::new(
            MsgType::ExecuteRequest,
            Channel::Shell,
            session,
            serde_json::json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        )
    }

    /// A `kernel_info_request`, used as the readiness handshake.
    pub fn kernel_info_request(session: &SessionId) -> Self {
        Self::new(
            MsgType::KernelInfoRequest,
            Channel::Shell,
            session,
            Value::Object(Map::new()),
        )
    }

    /// A message emitted in response to `parent`, the way a kernel would.
    pub fn reply_to(parent: &ProtocolMessage, msg_type: MsgType, channel: Channel, content: Value) -> Self {
        Self {
            header: Header::new(msg_type, &parent.header.session),
            parent_header: Some(parent.header.clone()),
            metadata: Map::new(),
            content,
            channel: Some(channel),
            buffers: Vec::new(),
        }
    }

    /// A `status` message for `parent` with the given execution state.
    pub fn status_for(parent: &ProtocolMessage, execution_state: &str) -> Self {
        Self::reply_to(
            parent,
            MsgType::Status,
            Channel::Iopub,
            serde_json::json!({ "execution_state": execution_state }),
        )
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn msg_id(&self) -> &MsgId {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &MsgType {
        &self.header.msg_type
    }

    /// The msg_id of the request this message answers, if any.
    pub fn parent_id(&self) -> Option<&MsgId> {
        self.parent_header.as_ref().map(|h| &h.msg_id)
    }

    pub fn is_reply_to(&self, msg_id: &MsgId) -> bool {
        self.parent_id() == Some(msg_id)
    }

    /// `content.execution_state` of a `status` message.
    pub fn execution_state(&self) -> Option<&str> {
        if self.header.msg_type != MsgType::Status {
            return None;
        }
        self.content.get("execution_state").and_then(Value::as_str)
    }

    /// True for the `status: idle` marker that ends a request's output.
    pub fn is_idle(&self) -> bool {
        self.execution_state() == Some("idle")
    }
}

mod parent_header {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    use super::Header;

    pub fn serialize<S: Serializer>(value: &Option<Header>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(h) => h.serialize(s),
            None => serde_json::Map::new().serialize(s),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Header>, D::Error> {
        let raw = Value::deserialize(d)?;
        match &raw {
            Value::Null => Ok(None),
            Value::Object(map) if map.is_empty() => Ok(None),
            _ => serde_json::from_value(raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
