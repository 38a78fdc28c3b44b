use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 128-bit identifier correlating a request with its progress, intermediate, and
/// terminal responses. Minted independently by both peers, so a sequential
/// counter (as a bare JSON-RPC id would use) is not safe here.
pub type RequestId = Uuid;

/// Discriminates the kind of frame carried by a [`Message`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum MessageType {
    Request,
    SuccessResponse,
    ErrorResponse,
    IntermediateResultResponse,
    ProgressResponse,
    Cancel,
    Close,
}

impl MessageType {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageType::SuccessResponse | MessageType::ErrorResponse)
    }

    pub(crate) fn from_wire_str(raw: &str) -> Option<Self> {
        match raw {
            "Request" => Some(Self::Request),
            "SuccessResponse" => Some(Self::SuccessResponse),
            "ErrorResponse" => Some(Self::ErrorResponse),
            "IntermediateResultResponse" => Some(Self::IntermediateResultResponse),
            "ProgressResponse" => Some(Self::ProgressResponse),
            "Cancel" => Some(Self::Cancel),
            "Close" => Some(Self::Close),
            _ => None,
        }
    }
}

/// Header fields common to every frame. Carried verbatim on the wire in
/// PascalCase, matching the wire protocol's field naming.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "MessageType")]
    pub message_type: MessageType,
    #[serde(rename = "Method", default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(rename = "RequestId")]
    pub request_id: RequestId,
    /// Only meaningful to the line-delimited codec variant; the JSON-stream
    /// variant relies on value boundaries instead and leaves this unset.
    #[serde(rename = "ContentLength", default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
}

impl Header {
    pub fn new(message_type: MessageType, request_id: RequestId) -> Self {
        Self { message_type, method: None, request_id, content_length: None }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}

/// An immutable `(Header, Payload)` pair. The payload is carried opaquely as
/// JSON; handlers and waiters are responsible for interpreting it.
#[derive(Clone, Debug)]
pub struct Message {
    pub header: Header,
    pub payload: Value,
}

impl Message {
    pub fn new(header: Header, payload: Value) -> Self {
        Self { header, payload }
    }

    pub fn request(request_id: RequestId, method: impl Into<String>, payload: Value) -> Self {
        Self::new(Header::new(MessageType::Request, request_id).with_method(method), payload)
    }

    pub fn success(request_id: RequestId, payload: Value) -> Self {
        Self::new(Header::new(MessageType::SuccessResponse, request_id), payload)
    }

    pub fn error(request_id: RequestId, fault: &RpcFault) -> Self {
        Self::new(
            Header::new(MessageType::ErrorResponse, request_id),
            serde_json::to_value(fault).unwrap_or(Value::Null),
        )
    }

    pub fn intermediate_result(request_id: RequestId, payload: Value) -> Self {
        Self::new(Header::new(MessageType::IntermediateResultResponse, request_id), payload)
    }

    pub fn progress(request_id: RequestId) -> Self {
        Self::new(Header::new(MessageType::ProgressResponse, request_id), Value::Null)
    }

    pub fn cancel(request_id: RequestId) -> Self {
        Self::new(Header::new(MessageType::Cancel, request_id), Value::Null)
    }

    pub fn close() -> Self {
        Self::new(Header::new(MessageType::Close, RequestId::new_v4()), Value::Null)
    }
}

/// Wire shape of an `ErrorResponse` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcFault {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcFault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), data: None }
    }
}

/// Parameters carried by the mandatory `Handshake` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeRequest {
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Response produced by the built-in `Handshake` handler.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeResponse {
    #[serde(default)]
    pub protocol_version: Option<u32>,
}
