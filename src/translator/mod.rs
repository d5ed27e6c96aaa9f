//! Schema translators.
//!
//! One translator instance serves exactly one exchange. It is created by the
//! [`TranslatorFactory`] resolved for the selected backend and may keep
//! streaming state between calls.

mod bedrock;
mod gcp_anthropic;
mod openai;
pub mod usage;
mod vertex;

use std::fmt::Write as _;

use serde_json::Value;

use crate::config::{ApiSchemaName, VersionedApiSchema};
use crate::protocol::{
    BodyMutation, CONTENT_LENGTH_HEADER, CONTENT_TYPE_HEADER, HeaderMutation, Headers,
    ProcessingMode, STATUS_HEADER,
};
use crate::{ExtProcError, Result};

pub use bedrock::BedrockTranslator;
pub use gcp_anthropic::{DEFAULT_ANTHROPIC_VERSION, GcpAnthropicTranslator};
pub use openai::{OpenAiTarget, OpenAiTranslator};
pub use usage::TokenUsage;
pub use vertex::VertexTranslator;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

pub(crate) const OPENAI_BACKEND_ERROR: &str = "OpenAIBackendError";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TranslatorOptions {
    /// Replaces the client's model on the way to the backend.
    pub model_name_override: Option<String>,
    /// Forces `stream_options.include_usage` on streamed OpenAI-shaped calls.
    pub force_include_usage: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestHeadersOutput {
    pub header_mutation: HeaderMutation,
    pub mode_override: Option<ProcessingMode>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestBodyOutput {
    pub header_mutation: HeaderMutation,
    pub body_mutation: Option<BodyMutation>,
    /// Model sent to the backend (the override when configured).
    pub model: String,
    pub mode_override: Option<ProcessingMode>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseBodyOutput {
    pub header_mutation: HeaderMutation,
    pub body_mutation: Option<BodyMutation>,
    /// Present only on the end-of-stream call.
    pub token_usage: Option<TokenUsage>,
    /// Present only on the end-of-stream call.
    pub response_model: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseErrorOutput {
    pub header_mutation: HeaderMutation,
    pub body_mutation: Option<BodyMutation>,
}

pub trait Translator: Send + std::fmt::Debug {
    fn request_headers(&mut self, headers: &Headers) -> Result<RequestHeadersOutput>;

    fn request_body(&mut self, body: &[u8]) -> Result<RequestBodyOutput>;

    fn response_headers(&mut self, headers: &Headers) -> Result<HeaderMutation>;

    fn response_body(&mut self, chunk: &[u8], end_of_stream: bool)
    -> Result<ResponseBodyOutput>;

    fn response_error(&mut self, headers: &Headers, body: &[u8]) -> Result<ResponseErrorOutput>;
}

/// Whether a translator exists for the (client, backend) schema pair.
pub fn is_supported(input: ApiSchemaName, output: ApiSchemaName) -> bool {
    matches!(
        (input, output),
        (ApiSchemaName::OpenAi, ApiSchemaName::OpenAi)
            | (ApiSchemaName::OpenAi, ApiSchemaName::AzureOpenAi)
            | (ApiSchemaName::OpenAi, ApiSchemaName::AwsBedrock)
            | (ApiSchemaName::OpenAi, ApiSchemaName::GcpVertexAi)
            | (ApiSchemaName::OpenAi, ApiSchemaName::GcpAnthropic)
    )
}

/// Creates translator instances for one backend; resolved at config load.
#[derive(Clone, Debug)]
pub struct TranslatorFactory {
    output: VersionedApiSchema,
    options: TranslatorOptions,
}

impl TranslatorFactory {
    pub fn new(
        input: &VersionedApiSchema,
        output: &VersionedApiSchema,
        options: TranslatorOptions,
    ) -> Result<Self> {
        if !is_supported(input.name, output.name) {
            return Err(ExtProcError::Config(format!(
                "unsupported schema pair {} -> {}",
                input.name, output.name
            )));
        }
        if output.name == ApiSchemaName::AzureOpenAi && output.version().is_none() {
            return Err(ExtProcError::Config(
                "AzureOpenAI schema requires a version".to_string(),
            ));
        }
        Ok(Self {
            output: output.clone(),
            options,
        })
    }

    pub fn output_schema(&self) -> &VersionedApiSchema {
        &self.output
    }

    pub fn build(&self) -> Box<dyn Translator> {
        let options = self.options.clone();
        let version = self.output.version().map(str::to_string);
        match self.output.name {
            ApiSchemaName::OpenAi => Box::new(OpenAiTranslator::new(
                OpenAiTarget::OpenAi { version },
                options,
            )),
            ApiSchemaName::AzureOpenAi => Box::new(OpenAiTranslator::new(
                OpenAiTarget::Azure {
                    api_version: version.unwrap_or_default(),
                },
                options,
            )),
            ApiSchemaName::AwsBedrock => Box::new(BedrockTranslator::new(options)),
            ApiSchemaName::GcpVertexAi => Box::new(VertexTranslator::new(options)),
            ApiSchemaName::GcpAnthropic => Box::new(GcpAnthropicTranslator::new(version, options)),
        }
    }
}

/// `id` and `created` shared by every object of one synthesized completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CompletionStamp {
    pub id: String,
    pub created: i64,
}

impl CompletionStamp {
    pub fn new() -> Self {
        let now = time::OffsetDateTime::now_utc();
        let mut bytes = [0u8; 12];
        if getrandom::fill(&mut bytes).is_err() {
            bytes.copy_from_slice(&now.unix_timestamp_nanos().to_le_bytes()[..12]);
        }
        let mut id = String::from("chatcmpl-");
        for byte in bytes {
            let _ = write!(id, "{byte:02x}");
        }
        Self {
            id,
            created: now.unix_timestamp(),
        }
    }
}

/// Every backend needs the whole request JSON before it can be rewritten.
pub(crate) fn buffered_request_headers() -> RequestHeadersOutput {
    RequestHeadersOutput {
        header_mutation: HeaderMutation::default(),
        mode_override: Some(ProcessingMode::buffered_request_body()),
    }
}

/// Parses a chat completions request; it must be an object with a model.
pub(crate) fn parse_chat_request(body: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(body).map_err(|err| {
        ExtProcError::InvalidRequest(format!("request body is not valid JSON: {err}"))
    })?;
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if !value.is_object() || model.is_empty() {
        return Err(ExtProcError::InvalidRequest(
            "request body must be an object with a model".to_string(),
        ));
    }
    Ok(value)
}

/// Vertex AI model path, relative to the project and location prefix the
/// backend's GCP auth adds.
pub(crate) fn gcp_model_path(publisher: &str, model: &str, method: &str) -> String {
    format!("publishers/{publisher}/models/{model}:{method}")
}

pub(crate) fn request_model(request: &Value) -> &str {
    request.get("model").and_then(Value::as_str).unwrap_or_default()
}

pub(crate) fn is_stream_request(request: &Value) -> bool {
    request.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn set_content_length(mutation: &mut HeaderMutation, body: &[u8]) {
    mutation.set(CONTENT_LENGTH_HEADER, body.len().to_string());
}

pub(crate) fn is_json_content_type(headers: &Headers) -> bool {
    headers
        .get(CONTENT_TYPE_HEADER)
        .is_some_and(|value| value.trim().starts_with(JSON_CONTENT_TYPE))
}

pub(crate) fn status_code(headers: &Headers) -> String {
    headers.get(STATUS_HEADER).cloned().unwrap_or_default()
}

pub fn is_good_status_code(status: u16) -> bool {
    (200..300).contains(&status)
}

/// OpenAI error envelope with the upstream status as `code`.
pub fn openai_error_body(error_type: &str, message: &str, code: &str) -> Vec<u8> {
    serde_json::json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message,
            "code": code,
        }
    })
    .to_string()
    .into_bytes()
}

/// Replaces the body with `body` and fixes the framing headers.
pub(crate) fn json_error_output(body: Vec<u8>) -> ResponseErrorOutput {
    let mut header_mutation = HeaderMutation::default();
    header_mutation.set(CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE);
    set_content_length(&mut header_mutation, &body);
    ResponseErrorOutput {
        header_mutation,
        body_mutation: Some(BodyMutation::new(body)),
    }
}

/// Formats one OpenAI SSE event.
pub(crate) fn sse_event_bytes(payload: &Value, out: &mut Vec<u8>) {
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(payload.to_string().as_bytes());
    out.extend_from_slice(b"\n\n");
}

pub(crate) const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_unsupported_pairs() {
        let bedrock = VersionedApiSchema::new(ApiSchemaName::AwsBedrock);
        let openai = VersionedApiSchema::new(ApiSchemaName::OpenAi);
        assert!(TranslatorFactory::new(&bedrock, &openai, TranslatorOptions::default()).is_err());
        assert!(TranslatorFactory::new(&openai, &bedrock, TranslatorOptions::default()).is_ok());
    }

    #[test]
    fn factory_builds_fresh_instances() {
        let openai = VersionedApiSchema::new(ApiSchemaName::OpenAi);
        let factory =
            TranslatorFactory::new(&openai, &openai, TranslatorOptions::default()).expect("factory");
        let mut first = factory.build();
        let mut second = factory.build();
        first
            .request_body(br#"{"model":"a","stream":true}"#)
            .expect("first");
        let out = second.request_body(br#"{"model":"b"}"#).expect("second");
        assert_eq!(out.model, "b");
        assert!(out.mode_override.is_none());
    }

    #[test]
    fn chat_request_requires_model() {
        assert!(parse_chat_request(br#"{"messages":[]}"#).is_err());
        assert!(parse_chat_request(b"not json").is_err());
        assert!(parse_chat_request(br#"{"model":"m"}"#).is_ok());
    }

    #[test]
    fn completion_stamps_are_unique_and_current() {
        let first = CompletionStamp::new();
        let second = CompletionStamp::new();
        assert!(first.id.starts_with("chatcmpl-"));
        assert_eq!(first.id.len(), "chatcmpl-".len() + 24);
        assert_ne!(first.id, second.id);
        assert!(first.created > 1_700_000_000);
    }

    #[test]
    fn error_envelope_carries_status_code() {
        let body = openai_error_body("ThrottlingException", "slow down", "429");
        let value: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["code"], "429");
        assert_eq!(value["error"]["type"], "ThrottlingException");
    }
}
