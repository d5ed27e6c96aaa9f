//! Records exchanged with the proxy over a bridge connection.
//!
//! Every record is one JSON document on its own line. Inbound records are
//! tagged by message kind; the server answers each with exactly one
//! [`ProcessingResponse`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header map with lowercased names.
pub type Headers = BTreeMap<String, String>;

pub const STATUS_HEADER: &str = ":status";
pub const PATH_HEADER: &str = ":path";
pub const METHOD_HEADER: &str = ":method";
pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const CONTENT_LENGTH_HEADER: &str = "content-length";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingRequest {
    RequestHeaders(HttpHeaders),
    RequestBody(HttpBody),
    ResponseHeaders(HttpHeaders),
    ResponseBody(HttpBody),
}

impl ProcessingRequest {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::RequestHeaders(_) => MessageKind::RequestHeaders,
            Self::RequestBody(_) => MessageKind::RequestBody,
            Self::ResponseHeaders(_) => MessageKind::ResponseHeaders,
            Self::ResponseBody(_) => MessageKind::ResponseBody,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RequestHeaders,
    RequestBody,
    ResponseHeaders,
    ResponseBody,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestHeaders => "request_headers",
            Self::RequestBody => "request_body",
            Self::ResponseHeaders => "response_headers",
            Self::ResponseBody => "response_body",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaders {
    #[serde(default)]
    pub headers: Vec<HeaderValue>,
    #[serde(default)]
    pub end_of_stream: bool,
}

impl HttpHeaders {
    /// Flattens the record into a lowercase-keyed map. Raw values that are not
    /// valid UTF-8 are decoded lossily.
    pub fn to_map(&self) -> Headers {
        self.headers
            .iter()
            .map(|header| (header.key.to_ascii_lowercase(), header.value_string()))
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderValue {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes_opt"
    )]
    pub raw_value: Option<Vec<u8>>,
}

impl HeaderValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            raw_value: None,
        }
    }

    pub fn value_string(&self) -> String {
        match (&self.value, &self.raw_value) {
            (Some(value), _) => value.clone(),
            (None, Some(raw)) => String::from_utf8_lossy(raw).into_owned(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpBody {
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub end_of_stream: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMutation {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_headers: Vec<HeaderValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_headers: Vec<String>,
}

impl HeaderMutation {
    /// Sets `key`, replacing an earlier set of the same header.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        self.remove_headers
            .retain(|existing| !existing.eq_ignore_ascii_case(&key));
        if let Some(existing) = self
            .set_headers
            .iter_mut()
            .find(|header| header.key.eq_ignore_ascii_case(&key))
        {
            existing.value = Some(value);
            existing.raw_value = None;
            return;
        }
        self.set_headers.push(HeaderValue::new(key, value));
    }

    pub fn remove(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.set_headers
            .retain(|header| !header.key.eq_ignore_ascii_case(&key));
        if !self
            .remove_headers
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(&key))
        {
            self.remove_headers.push(key);
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.set_headers
            .iter()
            .find(|header| header.key.eq_ignore_ascii_case(key))
            .map(HeaderValue::value_string)
    }

    /// Applies `other` on top of `self`; later sets win.
    pub fn merge(&mut self, other: HeaderMutation) {
        for key in other.remove_headers {
            self.remove(key);
        }
        for header in other.set_headers {
            let value = header.value_string();
            self.set(header.key, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set_headers.is_empty() && self.remove_headers.is_empty()
    }
}

/// Full replacement of the message body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyMutation {
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl BodyMutation {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_mutation: Option<HeaderMutation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_mutation: Option<BodyMutation>,
}

impl CommonResponse {
    pub fn new(header_mutation: Option<HeaderMutation>, body_mutation: Option<BodyMutation>) -> Self {
        Self {
            header_mutation: header_mutation.filter(|mutation| !mutation.is_empty()),
            body_mutation,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodySendMode {
    Buffered,
    Streamed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderSendMode {
    Send,
}

/// Per-exchange override of how the proxy delivers the remaining messages.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingMode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body_mode: Option<BodySendMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_header_mode: Option<HeaderSendMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body_mode: Option<BodySendMode>,
}

impl ProcessingMode {
    pub fn buffered_request_body() -> Self {
        Self {
            request_body_mode: Some(BodySendMode::Buffered),
            ..Self::default()
        }
    }

    pub fn streamed_response() -> Self {
        Self {
            request_body_mode: None,
            response_header_mode: Some(HeaderSendMode::Send),
            response_body_mode: Some(BodySendMode::Streamed),
        }
    }
}

/// Answers the client directly instead of continuing to the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmediateResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderMutation>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub details: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorCode {
    InvalidArgument,
    Internal,
}

/// Sent once before the server closes a connection on a protocol violation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    pub code: StreamErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    RequestHeaders(CommonResponse),
    RequestBody(CommonResponse),
    ResponseHeaders(CommonResponse),
    ResponseBody(CommonResponse),
    ImmediateResponse(ImmediateResponse),
    Error(StreamError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResponse {
    #[serde(flatten)]
    pub kind: ResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_override: Option<ProcessingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_metadata: Option<serde_json::Value>,
}

impl ProcessingResponse {
    pub fn new(kind: ResponseKind) -> Self {
        Self {
            kind,
            mode_override: None,
            dynamic_metadata: None,
        }
    }

    pub fn with_mode_override(mut self, mode: Option<ProcessingMode>) -> Self {
        self.mode_override = mode;
        self
    }

    pub fn with_dynamic_metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.dynamic_metadata = metadata;
        self
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer
                .serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        base64::engine::general_purpose::STANDARD
            .decode(raw.as_bytes())
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
