//! Call headers and request/response descriptors.

use crate::error::ProtocolError;
use crate::payload::PayloadCodec;
use serde::{Deserialize, Serialize};

/// Header record as it travels on the wire.
///
/// Every field is optional so that a decoder can tell a missing field from
/// a default one. Use [`Header`] outside of the codec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Header preceding every request and response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Target method, `"Service.Method"`.
    pub method: String,
    /// Caller-assigned sequence number.
    pub seq: u64,
    /// Failure reason; only ever set on responses.
    pub error: Option<String>,
}

impl Header {
    pub fn request(method: impl Into<String>, seq: u64) -> Self {
        Self {
            method: method.into(),
            seq,
            error: None,
        }
    }

    pub fn response(method: impl Into<String>, seq: u64, error: Option<String>) -> Self {
        Self {
            method: method.into(),
            seq,
            error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Encodes the header record with `codec`.
    pub fn encode<P: PayloadCodec>(&self, codec: &P) -> Result<Vec<u8>, ProtocolError> {
        codec.encode(&WireHeader::from(self))
    }

    /// Decodes a header record, requiring `method` and `seq`.
    ///
    /// Any failure here is a `MalformedHeader`: the peer is not speaking the
    /// protocol and the stream cannot be trusted any more.
    pub fn decode<P: PayloadCodec>(codec: &P, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireHeader = codec.decode(bytes).map_err(|e| match e {
            ProtocolError::PayloadDecode(detail) => ProtocolError::MalformedHeader(detail),
            other => other,
        })?;
        Self::try_from(wire)
    }
}

impl From<&Header> for WireHeader {
    fn from(header: &Header) -> Self {
        Self {
            method: Some(header.method.clone()),
            seq: Some(header.seq),
            error: header.error.clone(),
        }
    }
}

impl TryFrom<WireHeader> for Header {
    type Error = ProtocolError;

    fn try_from(wire: WireHeader) -> Result<Self, Self::Error> {
        let method = wire
            .method
            .ok_or_else(|| ProtocolError::MalformedHeader("header missing method".into()))?;
        let seq = wire
            .seq
            .ok_or_else(|| ProtocolError::MalformedHeader("header missing seq".into()))?;
        Ok(Self {
            method,
            seq,
            error: wire.error,
        })
    }
}

/// Identity of an incoming or outgoing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub seq: u64,
}

impl Request {
    pub fn new(method: impl Into<String>, seq: u64) -> Self {
        Self {
            method: method.into(),
            seq,
        }
    }
}

impl From<Header> for Request {
    fn from(header: Header) -> Self {
        Self {
            method: header.method,
            seq: header.seq,
        }
    }
}

/// Outcome of a call as carried by the response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub method: String,
    pub seq: u64,
    pub error: Option<String>,
}

impl Response {
    pub fn ok(method: impl Into<String>, seq: u64) -> Self {
        Self {
            method: method.into(),
            seq,
            error: None,
        }
    }

    pub fn error(method: impl Into<String>, seq: u64, error: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            seq,
            error: Some(error.into()),
        }
    }

    /// Builds the response skeleton for `request`.
    pub fn for_request(request: &Request) -> Self {
        Self::ok(request.method.clone(), request.seq)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl From<Header> for Response {
    fn from(header: Header) -> Self {
        Self {
            method: header.method,
            seq: header.seq,
            error: header.error,
        }
    }
}

/// Body written after a response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBody<'a> {
    /// Encoded result payload.
    Payload(&'a [u8]),
    /// No body. Written as a zero-length frame; the header's error field
    /// explains why.
    Invalid,
}

impl<'a> ResponseBody<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        match *self {
            ResponseBody::Payload(bytes) => bytes,
            ResponseBody::Invalid => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::JsonCodec;

    #[test]
    fn test_request_header_serialization() {
        let header = Header::request("Echo.Say", 1);
        let bytes = header.encode(&JsonCodec).unwrap();
        assert_eq!(bytes, br#"{"method":"Echo.Say","seq":1}"#);
    }

    #[test]
    fn test_error_header_serialization() {
        let header = Header::response("Echo.Say", 7, Some("not found".into()));
        let bytes = header.encode(&JsonCodec).unwrap();
        assert_eq!(bytes, br#"{"method":"Echo.Say","seq":7,"error":"not found"}"#);
    }

    #[test]
    fn test_header_roundtrip() {
        for header in [
            Header::request("Arith.Add", 0),
            Header::response("Arith.Add", u64::MAX, None),
            Header::response("Arith.Divide", 42, Some("divide by zero".into())),
            Header::response("Arith.Divide", 43, Some(String::new())),
        ] {
            let bytes = header.encode(&JsonCodec).unwrap();
            let decoded = Header::decode(&JsonCodec, &bytes).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_empty_error_is_not_absent() {
        let header = Header::response("Echo.Say", 1, Some(String::new()));
        let decoded = Header::decode(&JsonCodec, &header.encode(&JsonCodec).unwrap()).unwrap();
        assert!(decoded.is_error());
    }

    #[test]
    fn test_header_missing_method() {
        let result = Header::decode(&JsonCodec, br#"{"seq":1}"#);
        match result {
            Err(ProtocolError::MalformedHeader(msg)) => assert!(msg.contains("method")),
            other => panic!("expected MalformedHeader, got {:?}", other),
        }
    }

    #[test]
    fn test_header_missing_seq() {
        let result = Header::decode(&JsonCodec, br#"{"method":"Echo.Say","seq":null}"#);
        match result {
            Err(ProtocolError::MalformedHeader(msg)) => assert!(msg.contains("seq")),
            other => panic!("expected MalformedHeader, got {:?}", other),
        }
    }

    #[test]
    fn test_header_garbage() {
        let result = Header::decode(&JsonCodec, b"\x01\x02not a header");
        assert!(matches!(result, Err(ProtocolError::MalformedHeader(_))));
        assert!(result.unwrap_err().is_fatal());
    }

    #[test]
    fn test_header_ignores_unknown_fields() {
        let header =
            Header::decode(&JsonCodec, br#"{"method":"Echo.Say","seq":3,"trace":"x"}"#).unwrap();
        assert_eq!(header, Header::request("Echo.Say", 3));
    }

    #[test]
    fn test_response_helpers() {
        let request = Request::new("Echo.Say", 9);
        let resp = Response::for_request(&request);
        assert!(resp.is_ok());
        assert_eq!(resp.seq, 9);

        let resp = resp.with_error("boom");
        assert!(resp.is_error());
        assert_eq!(resp.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_response_body_bytes() {
        assert_eq!(ResponseBody::Payload(b"abc").as_bytes(), b"abc");
        assert!(ResponseBody::Invalid.as_bytes().is_empty());
    }
}
