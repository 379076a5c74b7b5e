//! Message types for the wssocks wire protocol

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A protocol frame exchanged over a WebSocket connection.
///
/// Every frame is a UTF-8 JSON object tagged by a `type` field. Frames with
/// an unrecognized tag deserialize to [`Envelope::Unknown`] so the
/// dispatcher can drop them without failing the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame sent by a connecting client
    Auth {
        /// Authentication token
        token: String,

        /// Whether this is a reverse proxy client
        reverse: bool,
    },

    /// Server reply to `auth`
    AuthResponse {
        /// Whether authentication was successful
        success: bool,
    },

    /// Request to open an outbound TCP connection
    Connect {
        /// Correlation id; doubles as the channel id for the data stream
        connect_id: String,

        /// Target host (IP literal or domain name)
        address: String,

        /// Target port
        port: u16,
    },

    /// Reply to `connect`
    ConnectResponse {
        /// Correlation id of the `connect` this answers
        connect_id: String,

        /// Whether the connection was established
        success: bool,

        /// Error description when `success` is false
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Relay payload bytes for an established channel
    Data {
        /// Channel id this data belongs to
        channel_id: String,

        /// Base64-encoded payload
        data: String,
    },

    /// Any frame with an unrecognized `type` tag
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Build a `data` frame from raw payload bytes
    pub fn data(channel_id: &str, payload: &[u8]) -> Self {
        Envelope::Data {
            channel_id: channel_id.to_string(),
            data: BASE64.encode(payload),
        }
    }

    /// Parse a frame from its JSON text
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Serialize the frame to JSON text
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Generate a fresh channel id
pub fn new_channel_id() -> String {
    Uuid::new_v4().to_string()
}

/// Decode a `data` frame payload
pub fn decode_payload(data: &str) -> Result<Bytes, base64::DecodeError> {
    BASE64.decode(data).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_round_trip() {
        let msg = Envelope::Auth {
            token: "abcd1234abcd1234".to_string(),
            reverse: true,
        };
        let text = msg.to_text().unwrap();
        assert!(text.contains("\"type\":\"auth\""));
        assert_eq!(Envelope::parse(&text).unwrap(), msg);
    }

    #[test]
    fn parses_literal_connect_frame() {
        // connect_id is an opaque string, not necessarily a UUID
        let msg = Envelope::parse(
            r#"{"type":"connect","connect_id":"x","address":"example.com","port":80}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Envelope::Connect {
                connect_id: "x".to_string(),
                address: "example.com".to_string(),
                port: 80,
            }
        );
    }

    #[test]
    fn parses_connect_response_without_error_field() {
        let msg =
            Envelope::parse(r#"{"type":"connect_response","connect_id":"x","success":true}"#)
                .unwrap();
        assert_eq!(
            msg,
            Envelope::ConnectResponse {
                connect_id: "x".to_string(),
                success: true,
                error: None,
            }
        );
    }

    #[test]
    fn data_payload_round_trip() {
        let msg = Envelope::data("chan", b"hello world");
        match &msg {
            Envelope::Data { channel_id, data } => {
                assert_eq!(channel_id, "chan");
                assert_eq!(decode_payload(data).unwrap().as_ref(), b"hello world");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let msg = Envelope::parse(r#"{"type":"hello","whatever":1}"#).unwrap();
        assert_eq!(msg, Envelope::Unknown);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        assert!(Envelope::parse(r#"{"type":"data","channel_id":"c"}"#).is_err());
    }
}
