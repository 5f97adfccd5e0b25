//! Push protocol frames
//!
//! Clients send frames with an opaque `id`; every server response carries
//! `replyTo` equal to that id and an optional `error` with `code` and `msg`.
//! Bus-to-socket payloads travel as [`PushEnvelope`] on the channel
//! `{resourceId}#{streamType}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ErrorResponse,
    model::Activity,
    signing::ExpiringSignature,
};

/// Pub/sub channel of one stream
#[must_use]
pub fn push_channel(resource_id: &str, stream_type: &str) -> String {
    format!("{}#{}", resource_id, stream_type)
}

/// A frame sent by the client
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    /// Opaque id chosen by the client, echoed as `replyTo`
    pub id: Value,

    /// Frame name: `authentication` or `subscribe`
    pub name: String,

    /// Frame payload
    #[serde(default)]
    pub payload: Value,
}

/// Payload of the `authentication` frame
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationPayload {
    /// The authenticating user
    pub user_id: String,

    /// The user's tenant
    pub tenant_alias: String,

    /// Expiring signature over the user id
    pub signature: ExpiringSignature,
}

/// One stream reference inside a `subscribe` frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRef {
    /// Feed owner
    pub resource_id: String,

    /// Stream type, possibly visibility-suffixed
    pub stream_type: String,
}

/// Payload of the `subscribe` frame
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    /// The stream to subscribe to
    pub stream: StreamRef,

    /// Requested activity format; a socket may subscribe to the same stream
    /// in several formats
    #[serde(default)]
    pub format: Option<String>,

    /// Opaque token handed to the stream's authorization handler
    #[serde(default)]
    pub token: Option<Value>,
}

/// A response to a client frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    /// The client frame's id, or `0` for responses with no triggering frame
    pub reply_to: Value,

    /// Present when the frame was rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

impl ServerFrame {
    /// Acknowledge a frame
    #[must_use]
    pub fn ok(reply_to: Value) -> Self {
        Self {
            reply_to,
            error: None,
        }
    }

    /// Reject a frame
    #[must_use]
    pub fn error(reply_to: Value, code: u16, msg: impl Into<String>) -> Self {
        Self {
            reply_to,
            error: Some(ErrorResponse::new(code, msg)),
        }
    }
}

/// A stream update crossing the pub/sub bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    /// Feed owner
    pub resource_id: String,

    /// Stream type, possibly visibility-suffixed
    pub stream_type: String,

    /// The activities to push
    pub activities: Vec<Activity>,

    /// For aggregation-phase pushes, how many activities are newly created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_new_activities: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_parsing() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "id": "frame-7",
            "name": "subscribe",
            "payload": {
                "stream": {"resourceId": "u:cam:alice", "streamType": "activity"},
                "format": "internal"
            }
        }))
        .unwrap();
        assert_eq!(frame.name, "subscribe");

        let payload: SubscribePayload = serde_json::from_value(frame.payload).unwrap();
        assert_eq!(payload.stream.resource_id, "u:cam:alice");
        assert_eq!(payload.format.as_deref(), Some("internal"));
        assert!(payload.token.is_none());
    }

    #[test]
    fn test_server_frame_error_shape() {
        let frame = ServerFrame::error(json!(0), 400, "authentication timeout");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["replyTo"], 0);
        assert_eq!(value["error"]["code"], 400);
        assert_eq!(value["error"]["msg"], "authentication timeout");
    }

    #[test]
    fn test_server_frame_ok_has_no_error_field() {
        let value = serde_json::to_value(ServerFrame::ok(json!("7"))).unwrap();
        assert_eq!(value["replyTo"], "7");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_push_channel_shape() {
        assert_eq!(
            push_channel("u:cam:alice", "notification"),
            "u:cam:alice#notification"
        );
    }
}
