// Copyright 2026 Highway RPC Developers

//! Control headers and the request/response values built from them.
//!
//! The control header travels as a small JSON object. Missing fields take
//! their defaults and unknown fields are ignored, so peers can add fields
//! without breaking older decoders.

use std::collections::HashMap;

use bytes::Bytes;
use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};

use crate::error::{HighwayError, Result};
use crate::protocol::Frame;

pub const PROTOCOL_NAME: &str = "highway";

pub const STATUS_OK: i32 = 200;
pub const STATUS_SERVER_ERROR: i32 = 505;

pub type Attachments = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum MessageKind {
    Login = 0,
    Request = 1,
    Response = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginHeader {
    pub protocol: String,
    pub zip_name: String,
    /// Peer understands structured attachment maps.
    pub use_map_attachments: bool,
}

impl Default for LoginHeader {
    fn default() -> LoginHeader {
        LoginHeader {
            protocol: String::from(PROTOCOL_NAME),
            zip_name: String::new(),
            use_map_attachments: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeader {
    pub service: String,
    pub schema_id: String,
    pub operation: String,
    pub attachments: Attachments,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: i32,
    pub reason: String,
    pub attachments: Attachments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Login(LoginHeader),
    Request(RequestHeader),
    Response(ResponseHeader),
}

#[derive(Serialize, Deserialize, Default)]
struct WireHeader {
    #[serde(rename = "type")]
    msg_type: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    protocol: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    zip_name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    use_map_attachments: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    schema_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    reason: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    attachments: Attachments,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::Login(_) => MessageKind::Login,
            ControlMessage::Request(_) => MessageKind::Request,
            ControlMessage::Response(_) => MessageKind::Response,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let kind = ToPrimitive::to_u8(&self.kind())
            .ok_or_else(|| HighwayError::framing("invalid message kind"))?;
        let mut wire = WireHeader {
            msg_type: kind,
            ..WireHeader::default()
        };
        match self {
            ControlMessage::Login(login) => {
                wire.protocol = login.protocol.clone();
                wire.zip_name = login.zip_name.clone();
                wire.use_map_attachments = login.use_map_attachments;
            }
            ControlMessage::Request(req) => {
                wire.service = req.service.clone();
                wire.schema_id = req.schema_id.clone();
                wire.operation = req.operation.clone();
                wire.attachments = req.attachments.clone();
            }
            ControlMessage::Response(resp) => {
                wire.status = Some(resp.status);
                wire.reason = resp.reason.clone();
                wire.attachments = resp.attachments.clone();
            }
        }
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn decode(buf: &[u8]) -> Result<ControlMessage> {
        let wire: WireHeader = serde_json::from_slice(buf).map_err(|e| {
            HighwayError::framing(format!("failed to parse control header: {}", e))
        })?;
        let kind: MessageKind = FromPrimitive::from_u8(wire.msg_type).ok_or_else(|| {
            HighwayError::framing(format!("unknown message kind {}", wire.msg_type))
        })?;

        let msg = match kind {
            MessageKind::Login => ControlMessage::Login(LoginHeader {
                protocol: wire.protocol,
                zip_name: wire.zip_name,
                use_map_attachments: wire.use_map_attachments,
            }),
            MessageKind::Request => ControlMessage::Request(RequestHeader {
                service: wire.service,
                schema_id: wire.schema_id,
                operation: wire.operation,
                attachments: wire.attachments,
            }),
            MessageKind::Response => ControlMessage::Response(ResponseHeader {
                status: wire.status.unwrap_or_default(),
                reason: wire.reason,
                attachments: wire.attachments,
            }),
        };
        Ok(msg)
    }

    pub fn into_frame<B: Into<Bytes>>(self, correlation_id: u64, body: B) -> Result<Frame> {
        Ok(Frame::new(correlation_id, self.encode()?, body))
    }
}

/// An outgoing call, or an incoming one as handed to a dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub service: String,
    pub schema_id: String,
    pub operation: String,
    pub attachments: Attachments,
    pub body: Bytes,
}

impl Request {
    pub fn new<B: Into<Bytes>>(
        service: &str,
        schema_id: &str,
        operation: &str,
        body: B,
    ) -> Request {
        Request {
            service: String::from(service),
            schema_id: String::from(schema_id),
            operation: String::from(operation),
            attachments: Attachments::new(),
            body: body.into(),
        }
    }

    pub fn with_attachment(mut self, key: &str, value: &str) -> Request {
        self.attachments
            .insert(String::from(key), String::from(value));
        self
    }

    pub fn to_frame(&self, correlation_id: u64) -> Result<Frame> {
        ControlMessage::Request(RequestHeader {
            service: self.service.clone(),
            schema_id: self.schema_id.clone(),
            operation: self.operation.clone(),
            attachments: self.attachments.clone(),
        })
        .into_frame(correlation_id, self.body.clone())
    }

    pub fn from_parts(header: RequestHeader, body: Bytes) -> Request {
        Request {
            service: header.service,
            schema_id: header.schema_id,
            operation: header.operation,
            attachments: header.attachments,
            body,
        }
    }
}

/// The answer to a two-way call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: i32,
    pub reason: String,
    pub attachments: Attachments,
    pub body: Bytes,
}

impl Response {
    pub fn ok<B: Into<Bytes>>(body: B) -> Response {
        Response {
            status: STATUS_OK,
            reason: String::new(),
            attachments: Attachments::new(),
            body: body.into(),
        }
    }

    pub fn error(status: i32, reason: &str) -> Response {
        Response {
            status,
            reason: String::from(reason),
            attachments: Attachments::new(),
            body: Bytes::new(),
        }
    }

    /// Only 200 is success; every other status is a failure.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn into_result(self) -> Result<Bytes> {
        if self.is_ok() {
            Ok(self.body)
        } else {
            Err(HighwayError::Remote {
                status: self.status,
                reason: self.reason,
            })
        }
    }

    pub fn to_frame(&self, correlation_id: u64) -> Result<Frame> {
        ControlMessage::Response(ResponseHeader {
            status: self.status,
            reason: self.reason.clone(),
            attachments: self.attachments.clone(),
        })
        .into_frame(correlation_id, self.body.clone())
    }

    pub fn from_parts(header: ResponseHeader, body: Bytes) -> Response {
        Response {
            status: header.status,
            reason: header.reason,
            attachments: header.attachments,
            body,
        }
    }

    /// Decodes a response frame. Any other message kind is a framing error.
    pub fn from_frame(frame: Frame) -> Result<Response> {
        match ControlMessage::decode(&frame.header)? {
            ControlMessage::Response(header) => Ok(Response::from_parts(header, frame.body)),
            other => Err(HighwayError::framing(format!(
                "expected a response, got {:?}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_attachments_decode_as_empty() {
        let msg = ControlMessage::decode(br#"{"type":1,"service":"calc","operation":"add"}"#)
            .unwrap();
        match msg {
            ControlMessage::Request(req) => {
                assert_eq!(req.service, "calc");
                assert_eq!(req.operation, "add");
                assert!(req.schema_id.is_empty());
                assert!(req.attachments.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg = ControlMessage::decode(br#"{"type":2,"status":200,"extra":[1,2]}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Response(ResponseHeader {
                status: 200,
                ..ResponseHeader::default()
            })
        );
    }

    #[test]
    fn unknown_kind_and_garbage_are_framing_errors() {
        assert!(matches!(
            ControlMessage::decode(br#"{"type":9}"#),
            Err(HighwayError::Framing(_))
        ));
        assert!(matches!(
            ControlMessage::decode(b"\x00\x01not json"),
            Err(HighwayError::Framing(_))
        ));
    }

    #[test]
    fn request_frame_carries_attachments() {
        let req = Request::new("calc", "calc.v1", "add", &b"[1,2]"[..])
            .with_attachment("trace-id", "abc");
        let frame = req.to_frame(11).unwrap();
        assert_eq!(frame.correlation_id, 11);
        match ControlMessage::decode(&frame.header).unwrap() {
            ControlMessage::Request(header) => {
                let decoded = Request::from_parts(header, frame.body);
                assert_eq!(decoded, req);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn non_success_status_is_an_error() {
        let resp = Response::error(STATUS_SERVER_ERROR, "not found");
        assert!(!resp.is_ok());
        match resp.into_result() {
            Err(HighwayError::Remote { status, reason }) => {
                assert_eq!(status, 505);
                assert_eq!(reason, "not found");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Response::error(201, "").into_result().is_err());
    }

    #[test]
    fn login_round_trip() {
        let login = ControlMessage::Login(LoginHeader::default());
        let decoded = ControlMessage::decode(&login.encode().unwrap()).unwrap();
        assert_eq!(decoded, login);
    }
}
