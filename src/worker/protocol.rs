//! Wire protocol for the translation worker.
//!
//! The worker speaks JSON text frames over a websocket at `ws://host:port/ws`.
//! Every request is answered by exactly one response on the same connection,
//! in request order; there are no correlation IDs, so clients must serialize
//! write+read per connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound frame: `{"type": <string>, "data": <object>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub data: Value,
}

/// Inbound frame: `{"type", "code", "msg", "data"?}`.
///
/// `code == 200` means the transport-level request succeeded; anything else
/// is surfaced as an error carrying the code and message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub code: i64,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload for `trans` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransRequest {
    pub text: String,
    pub html: bool,
}

/// Payload for `exit` requests: shut down within `time` seconds, or
/// immediately when `force` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRequest {
    pub time: i64,
    pub force: bool,
}

/// `health` response payload. `ready` reports whether the translation engine
/// has finished loading its model; the transport being alive is conveyed by
/// `code == 200` alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ready: bool,
}

/// `trans` response payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransResponse {
    pub translated_text: String,
}

/// `exit` response payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_round_trip() {
        let msg = WsMessage {
            msg_type: "trans".to_string(),
            data: serde_json::to_value(TransRequest {
                text: "hello".to_string(),
                html: false,
            })
            .unwrap(),
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"type\":\"trans\""));

        let decoded: WsMessage = serde_json::from_str(&encoded).unwrap();
        let req: TransRequest = serde_json::from_value(decoded.data).unwrap();
        assert_eq!(req.text, "hello");
        assert!(!req.html);
    }

    #[test]
    fn response_frame_with_data() {
        let raw = r#"{"type":"trans","code":200,"msg":"success","data":{"translated_text":"hallo"}}"#;
        let resp: WsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.code, 200);
        let data: TransResponse = serde_json::from_value(resp.data.unwrap()).unwrap();
        assert_eq!(data.translated_text, "hallo");
    }

    #[test]
    fn response_frame_without_data() {
        let raw = r#"{"type":"health","code":503,"msg":"Translation engine not ready"}"#;
        let resp: WsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.code, 503);
        assert!(resp.data.is_none());
    }

    #[test]
    fn health_response_defaults_to_not_ready() {
        let data: HealthResponse = serde_json::from_str("{}").unwrap_or_default();
        assert!(!data.ready);
    }

    #[test]
    fn exit_request_shape() {
        let req = ExitRequest { time: 5, force: true };
        let encoded = serde_json::to_string(&req).unwrap();
        assert_eq!(encoded, r#"{"time":5,"force":true}"#);
    }
}
