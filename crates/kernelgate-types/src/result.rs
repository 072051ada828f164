//! Aggregated outcome of one execute request.
//!
//! The kernel answers an `execute_request` with a burst of messages on
//! several channels. `ExecutionResult::apply` folds one correlated message
//! into the result; the caller decides which messages are correlated and
//! when the burst is over.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::{MsgType, ProtocolMessage};

/// MIME bundle (`{"text/plain": ..., "image/png": ...}`).
pub type MimeBundle = Map<String, Value>;

/// Which output stream a chunk was written to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// One `stream` message worth of text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub name: StreamName,
    pub text: String,
}

/// A code-level error reported by the kernel. Not a client fault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Exception class name (`ename`).
    pub name: String,
    /// Exception message (`evalue`).
    pub message: String,
    pub traceback: Vec<String>,
}

impl ExecutionError {
    fn from_content(content: &Value) -> Self {
        let text = |key: &str| {
            content
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let traceback = content
            .get("traceback")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: text("ename"),
            message: text("evalue"),
            traceback,
        }
    }
}

/// Everything one execute request produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Stream output in gateway-arrival order.
    pub stream: Vec<StreamChunk>,
    /// Structured value of the `execute_result`, if any.
    pub return_value: Option<Value>,
    /// Full MIME bundle of the `execute_result`.
    pub data: Option<MimeBundle>,
    /// `display_data` bundles in arrival order.
    pub displays: Vec<MimeBundle>,
    pub error: Option<ExecutionError>,
    pub execution_count: Option<u64>,
}

impl ExecutionResult {
    /// Fold one correlated message into the result.
    ///
    /// Once an error has been recorded, further output is ignored; only the
    /// execution count from the reply is still taken.
    pub fn apply(&mut self, msg: &ProtocolMessage) {
        let content = &msg.content;

        if let MsgType::ExecuteReply = msg.msg_type() {
            if let Some(count) = content.get("execution_count").and_then(Value::as_u64) {
                self.execution_count = Some(count);
            }
        }

        if self.error.is_some() {
            return;
        }

        match msg.msg_type() {
            MsgType::Stream => {
                let name = match content.get("name").and_then(Value::as_str) {
                    Some("stderr") => StreamName::Stderr,
                    _ => StreamName::Stdout,
                };
                let text = content
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.stream.push(StreamChunk {
                    name,
                    text: text.to_string(),
                });
            }
            MsgType::ExecuteResult => {
                if let Some(bundle) = content.get("data").and_then(Value::as_object) {
                    self.return_value = return_value_from_bundle(bundle);
                    self.data = Some(bundle.clone());
                }
                if let Some(count) = content.get("execution_count").and_then(Value::as_u64) {
                    self.execution_count = Some(count);
                }
            }
            MsgType::DisplayData => {
                if let Some(bundle) = content.get("data").and_then(Value::as_object) {
                    self.displays.push(bundle.clone());
                }
            }
            MsgType::Error => {
                self.error = Some(ExecutionError::from_content(content));
            }
            MsgType::ExecuteReply => match content.get("status").and_then(Value::as_str) {
                Some("error") => self.error = Some(ExecutionError::from_content(content)),
                Some("aborted") => {
                    self.error = Some(ExecutionError {
                        name: "Aborted".into(),
                        message: "execution aborted by the kernel".into(),
                        traceback: Vec::new(),
                    })
                }
                _ => {}
            },
            _ => {}
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// All stream text joined in arrival order.
    pub fn text(&self) -> String {
        self.stream.iter().map(|c| c.text.as_str()).collect()
    }

    pub fn stdout(&self) -> String {
        self.joined(StreamName::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.joined(StreamName::Stderr)
    }

    fn joined(&self, name: StreamName) -> String {
        self.stream
            .iter()
            .filter(|c| c.name == name)
            .map(|c| c.text.as_str())
            .collect()
    }
}

/// Prefer `application/json`; else parse `text/plain` as JSON; else keep the text.
fn return_value_from_bundle(bundle: &MimeBundle) -> Option<Value> {
    if let Some(json) = bundle.get("application/json") {
        return Some(json.clone());
    }
    let plain = bundle.get("text/plain")?.as_str()?;
    Some(serde_json::from_str(plain).unwrap_or_else(|_| Value::String(plain.to_string())))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;
    use crate::message::Channel;
    use serde_json::json;

    fn reply(req: &ProtocolMessage, t: MsgType, content: Value) -> ProtocolMessage {
        ProtocolMessage::reply_to(req, t, Channel::Iopub, content)
    }

    fn request() -> ProtocolMessage {
        ProtocolMessage::execute_request(&SessionId::new(), "code")
    }

    #[test]
    fn test_plain_text_number_becomes_json_number() {
        let req = request();
        let mut result = ExecutionResult::default();
        result.apply(&reply(
            &req,
            MsgType::ExecuteResult,
            json!({"data": {"text/plain": "4"}, "execution_count": 1}),
        ));
        assert_eq!(result.return_value, Some(json!(4)));
        assert_eq!(result.execution_count, Some(1));
        assert!(result.stream.is_empty());
        assert!(result.is_ok());
    }

    #[test]
    fn test_non_json_text_stays_string() {
        let req = request();
        let mut result = ExecutionResult::default();
        result.apply(&reply(
            &req,
            MsgType::ExecuteResult,
            json!({"data": {"text/plain": "array([1, 2])"}}),
        ));
        assert_eq!(result.return_value, Some(json!("array([1, 2])")));
    }

    #[test]
    fn test_application_json_is_preferred() {
        let req = request();
        let mut result = ExecutionResult::default();
        result.apply(&reply(
            &req,
            MsgType::ExecuteResult,
            json!({"data": {"text/plain": "{'a': 1}", "application/json": {"a": 1}}}),
        ));
        assert_eq!(result.return_value, Some(json!({"a": 1})));
    }

    #[test]
    fn test_stream_order_is_arrival_order() {
        let req = request();
        let mut result = ExecutionResult::default();
        for (name, text) in [("stdout", "a"), ("stderr", "b"), ("stdout", "c")] {
            result.apply(&reply(&req, MsgType::Stream, json!({"name": name, "text": text})));
        }
        assert_eq!(result.text(), "abc");
        assert_eq!(result.stdout(), "ac");
        assert_eq!(result.stderr(), "b");
    }

    #[test]
    fn test_error_short_circuits_output() {
        let req = request();
        let mut result = ExecutionResult::default();
        result.apply(&reply(&req, MsgType::Stream, json!({"name": "stdout", "text": "before"})));
        result.apply(&reply(
            &req,
            MsgType::Error,
            json!({"ename": "ZeroDivisionError", "evalue": "division by zero", "traceback": ["tb1", "tb2"]}),
        ));
        result.apply(&reply(&req, MsgType::Stream, json!({"name": "stdout", "text": "after"})));
        result.apply(&reply(
            &req,
            MsgType::ExecuteReply,
            json!({"status": "error", "execution_count": 7, "ename": "Other", "evalue": "x", "traceback": []}),
        ));

        let err = result.error.as_ref().unwrap();
        assert_eq!(err.name, "ZeroDivisionError");
        assert_eq!(err.message, "division by zero");
        assert_eq!(err.traceback, vec!["tb1", "tb2"]);
        assert_eq!(result.text(), "before");
        assert_eq!(result.execution_count, Some(7));
        assert!(result.return_value.is_none());
    }

    #[test]
    fn test_reply_error_without_iopub_error() {
        let req = request();
        let mut result = ExecutionResult::default();
        result.apply(&reply(
            &req,
            MsgType::ExecuteReply,
            json!({"status": "error", "ename": "NameError", "evalue": "name 'x' is not defined", "traceback": []}),
        ));
        assert_eq!(result.error.as_ref().map(|e| e.name.as_str()), Some("NameError"));
    }

    #[test]
    fn test_aborted_reply_is_an_error() {
        let req = request();
        let mut result = ExecutionResult::default();
        result.apply(&reply(&req, MsgType::ExecuteReply, json!({"status": "aborted"})));
        assert_eq!(result.error.as_ref().map(|e| e.name.as_str()), Some("Aborted"));
    }

    #[test]
    fn test_display_data_is_collected() {
        let req = request();
        let mut result = ExecutionResult::default();
        result.apply(&reply(&req, MsgType::DisplayData, json!({"data": {"image/png": "iVBOR"}})));
        assert_eq!(result.displays.len(), 1);
        assert!(result.return_value.is_none());
    }
}
