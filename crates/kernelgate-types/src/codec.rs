//! Wire codec for the execution channel.
//!
//! The gateway multiplexes all kernel sockets onto one WebSocket and frames
//! each message as a JSON text frame. Decoding is tolerant of fields we do
//! not model; unknown message types survive a decode/encode cycle.

use crate::message::ProtocolMessage;

/// Errors from encoding or decoding a protocol message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not valid UTF-8")]
    NotUtf8,
}

/// Encode a message as a JSON text frame.
pub fn encode(msg: &ProtocolMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode a JSON text frame.
pub fn decode(frame: &str) -> Result<ProtocolMessage, CodecError> {
    Ok(serde_json::from_str(frame)?)
}

/// Decode a frame delivered as raw bytes.
pub fn decode_bytes(frame: &[u8]) -> Result<ProtocolMessage, CodecError> {
    let text = std::str::from_utf8(frame).map_err(|_| CodecError::NotUtf8)?;
    decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MsgId;
    use crate::message::{Channel, MsgType};

    const GATEWAY_STREAM: &str = r#"{
        "header": {"msg_id": "a1b2_3", "msg_type": "stream", "session": "s",
                   "username": "u", "date": "2024-01-01T00:00:00Z", "version": "5.3"},
        "parent_header": {"msg_id": "req-1", "msg_type": "execute_request",
                          "session": "s", "username": "u", "version": "5.3"},
        "metadata": {},
        "content": {"name": "stdout", "text": "hello\n"},
        "channel": "iopub",
        "buffers": [],
        "msg_id": "a1b2_3",
        "msg_type": "stream"
    }"#;

    #[test]
    fn test_decode_gateway_frame() {
        let msg = decode(GATEWAY_STREAM).unwrap();
        assert_eq!(msg.msg_type(), &MsgType::Stream);
        assert_eq!(msg.channel, Some(Channel::Iopub));
        assert_eq!(msg.parent_id(), Some(&MsgId::from("req-1")));
        assert_eq!(msg.content["text"], "hello\n");
    }

    #[test]
    fn test_empty_parent_header_means_none() {
        let frame = r#"{"header": {"msg_id": "x", "msg_type": "status"},
                        "parent_header": {}, "content": {"execution_state": "starting"}}"#;
        let msg = decode(frame).unwrap();
        assert!(msg.parent_id().is_none());
        assert_eq!(msg.execution_state(), Some("starting"));

        let json: serde_json::Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(json["parent_header"], serde_json::json!({}));
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(matches!(decode("not json"), Err(CodecError::Json(_))));
        assert!(matches!(decode(r#"{"content": {}}"#), Err(CodecError::Json(_))));
        assert!(matches!(decode_bytes(&[0xff, 0xfe]), Err(CodecError::NotUtf8)));
    }
}
