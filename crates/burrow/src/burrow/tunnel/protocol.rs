//! Tunnel wire protocol.
//!
//! Every WebSocket message carries exactly one JSON frame tagged by `"type"`:
//!
//! ```text
//! {"type":"request","id":7,"method":"GET","path":"/","headers":[["accept","*/*"]],"query":"","body":""}
//! {"type":"response","id":7,"status":200,"headers":[],"body":"aGk="}
//! {"type":"control","kind":"ping","payload":null}
//! ```
//!
//! Bodies are base64 so arbitrary bytes survive text frames unchanged.

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type CorrelationId = u64;

/// Ordered header multi-map, kept as `[name, value]` pairs.
pub type HeaderList = Vec<(String, String)>;

/// Request headers never forwarded to the local service.
pub const HOP_BY_HOP_REQUEST_HEADERS: &[&str] = &["host", "connection", "content-length"];

/// Response headers dropped before answering the public caller.
pub const HOP_BY_HOP_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding", "keep-alive"];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not utf-8")]
    NotUtf8,
    #[error("invalid status code: {0}")]
    BadStatus(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Control(ControlFrame),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: CorrelationId,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default)]
    pub query: String,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: CorrelationId,
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
}

impl ResponseFrame {
    /// Response synthesized when the local service could not be reached.
    pub fn bad_gateway(id: CorrelationId, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self {
            id,
            status: 502,
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            body: Bytes::from(message),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Ping,
    Pong,
    Register,
    RegisterAck,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    pub kind: ControlKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ControlFrame {
    #[cfg(test)]
    pub fn ping() -> Self {
        Self {
            kind: ControlKind::Ping,
            payload: serde_json::Value::Null,
        }
    }

    pub fn pong(echo: serde_json::Value) -> Self {
        Self {
            kind: ControlKind::Pong,
            payload: echo,
        }
    }

    pub fn register(req: &RegisterRequest) -> Self {
        Self::with_payload(ControlKind::Register, req)
    }

    pub fn register_ack(ack: &RegisterAck) -> Self {
        Self::with_payload(ControlKind::RegisterAck, ack)
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::with_payload(
            ControlKind::Error,
            &ControlError {
                code,
                message: message.into(),
            },
        )
    }

    fn with_payload<T: Serialize>(kind: ControlKind, payload: &T) -> Self {
        Self {
            kind,
            // Plain structs of strings and integers always serialize.
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Registration request, sent either as a `control.register` payload or as the
/// JSON body of `POST /register`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub project_name: String,
    pub local_url: String,
    #[serde(default)]
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    /// Largest body the relay accepts in either direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlError {
    pub code: u16,
    pub message: String,
}

impl Frame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
        let frame: Frame = serde_json::from_str(text)?;
        if let Frame::Response(r) = &frame {
            if !(100..=599).contains(&r.status) {
                return Err(ProtocolError::BadStatus(r.status));
            }
        }
        Ok(frame)
    }

    pub fn decode_bytes(data: &[u8]) -> Result<Frame, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
        Self::decode(text)
    }
}

/// Drops entries whose (case-insensitive) name is listed in `names`.
pub fn strip_headers(headers: HeaderList, names: &[&str]) -> HeaderList {
    headers
        .into_iter()
        .filter(|(k, _)| !names.iter().any(|n| k.eq_ignore_ascii_case(n)))
        .collect()
}

mod base64_body {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_body_survives_text_encoding() {
        let body: Vec<u8> = (0u8..=255).collect();
        let f = Frame::Response(ResponseFrame {
            id: 42,
            status: 200,
            headers: vec![("X-Dup".into(), "a".into()), ("x-dup".into(), "b".into())],
            body: Bytes::from(body.clone()),
        });

        let text = f.encode().unwrap();
        assert!(text.contains(r#""type":"response""#));
        let Frame::Response(back) = Frame::decode(&text).unwrap() else {
            panic!("expected response frame");
        };
        assert_eq!(back.body.as_ref(), body.as_slice());
        // Duplicate header names keep their order.
        assert_eq!(back.headers[0], ("X-Dup".to_string(), "a".to_string()));
        assert_eq!(back.headers[1], ("x-dup".to_string(), "b".to_string()));
    }

    #[test]
    fn request_defaults_missing_fields() {
        let f = Frame::decode(r#"{"type":"request","id":1,"method":"GET","path":"/x"}"#).unwrap();
        let Frame::Request(r) = f else {
            panic!("expected request frame");
        };
        assert!(r.headers.is_empty());
        assert!(r.body.is_empty());
        assert_eq!(r.query, "");
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(Frame::decode("not json").is_err());
        assert!(Frame::decode(r#"{"type":"mystery"}"#).is_err());
        assert!(Frame::decode(r#"{"type":"response","id":1,"status":200,"body":"!!!"}"#).is_err());
        assert!(matches!(
            Frame::decode(r#"{"type":"response","id":1,"status":42}"#),
            Err(ProtocolError::BadStatus(42))
        ));
        assert!(matches!(
            Frame::decode_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::NotUtf8)
        ));
    }

    #[test]
    fn control_payloads_are_typed() {
        let req = RegisterRequest {
            username: None,
            password: None,
            project_name: "demo".into(),
            local_url: "localhost:3000".into(),
            protocol: "http".into(),
        };
        let text = Frame::Control(ControlFrame::register(&req)).encode().unwrap();
        assert!(!text.contains("username"));

        let Frame::Control(c) = Frame::decode(&text).unwrap() else {
            panic!("expected control frame");
        };
        assert_eq!(c.kind, ControlKind::Register);
        assert_eq!(c.payload_as::<RegisterRequest>().unwrap(), req);

        let err = ControlFrame::error(409, "taken");
        let e: ControlError = err.payload_as().unwrap();
        assert_eq!(e.code, 409);
    }

    #[test]
    fn strip_headers_is_case_insensitive() {
        let h = vec![
            ("Host".to_string(), "relay".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
            ("CONNECTION".to_string(), "keep-alive".to_string()),
            ("Content-Length".to_string(), "3".to_string()),
        ];
        let out = strip_headers(h, HOP_BY_HOP_REQUEST_HEADERS);
        assert_eq!(out, vec![("Accept".to_string(), "*/*".to_string())]);
    }
}
