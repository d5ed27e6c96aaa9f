use serde_json::Value;

use super::usage::parse_openai_usage;
use super::{
    OPENAI_BACKEND_ERROR, RequestBodyOutput, RequestHeadersOutput, ResponseBodyOutput,
    ResponseErrorOutput, TokenUsage, Translator, TranslatorOptions, buffered_request_headers,
    is_json_content_type, is_stream_request, json_error_output, openai_error_body,
    parse_chat_request, request_model, set_content_length, status_code,
};
use crate::protocol::{BodyMutation, HeaderMutation, Headers, PATH_HEADER, ProcessingMode};
use crate::utils::sse::{SseBuffer, SseEvent};
use crate::{ExtProcError, Result};

/// Where an OpenAI-shaped request is sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenAiTarget {
    /// `/{version}/chat/completions`, version defaulting to `v1`.
    OpenAi { version: Option<String> },
    /// `/openai/deployments/{model}/chat/completions?api-version={api_version}`.
    Azure { api_version: String },
}

impl OpenAiTarget {
    fn path(&self, model: &str) -> String {
        match self {
            Self::OpenAi { version } => {
                let version = version
                    .as_deref()
                    .map(|v| v.trim_matches('/'))
                    .filter(|v| !v.is_empty())
                    .unwrap_or("v1");
                format!("/{version}/chat/completions")
            }
            Self::Azure { api_version } => {
                format!("/openai/deployments/{model}/chat/completions?api-version={api_version}")
            }
        }
    }
}

/// Passthrough translator for OpenAI-compatible backends, Azure included.
///
/// The wire body is left untouched unless a model override or forced usage
/// reporting applies; responses are only inspected for usage and model.
#[derive(Debug)]
pub struct OpenAiTranslator {
    target: OpenAiTarget,
    options: TranslatorOptions,
    stream: bool,
    request_model: Option<String>,
    response_model: Option<String>,
    usage: Option<TokenUsage>,
    sse: SseBuffer,
    buffered: Vec<u8>,
}

impl OpenAiTranslator {
    pub fn new(target: OpenAiTarget, options: TranslatorOptions) -> Self {
        Self {
            target,
            options,
            stream: false,
            request_model: None,
            response_model: None,
            usage: None,
            sse: SseBuffer::new(),
            buffered: Vec::new(),
        }
    }

    fn observe_chunk(&mut self, data: &str) -> Result<()> {
        // Keepalives and other non-JSON payloads are skipped.
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Ok(());
        };
        self.observe_response(&event)
    }

    fn observe_response(&mut self, response: &Value) -> Result<()> {
        if self.response_model.is_none() {
            self.response_model = response
                .get("model")
                .and_then(Value::as_str)
                .filter(|model| !model.trim().is_empty())
                .map(str::to_string);
        }
        if let Some(usage) = parse_openai_usage(response.get("usage"))? {
            self.usage = Some(usage);
        }
        Ok(())
    }

    fn final_output(&self) -> ResponseBodyOutput {
        ResponseBodyOutput {
            token_usage: self.usage.map(TokenUsage::finalized),
            response_model: self
                .response_model
                .clone()
                .or_else(|| self.request_model.clone()),
            ..ResponseBodyOutput::default()
        }
    }
}

impl Translator for OpenAiTranslator {
    fn request_headers(&mut self, _headers: &Headers) -> Result<RequestHeadersOutput> {
        Ok(buffered_request_headers())
    }

    fn request_body(&mut self, body: &[u8]) -> Result<RequestBodyOutput> {
        let mut request = parse_chat_request(body)?;
        self.stream = is_stream_request(&request);

        let mut rewritten = false;
        if let Some(model) = self.options.model_name_override.as_deref() {
            if request_model(&request) != model {
                request["model"] = Value::String(model.to_string());
                rewritten = true;
            }
        }
        if self.stream && self.options.force_include_usage {
            let include_usage = request
                .pointer("/stream_options/include_usage")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !include_usage {
                match request.get_mut("stream_options").and_then(Value::as_object_mut) {
                    Some(options) => {
                        options.insert("include_usage".to_string(), Value::Bool(true));
                    }
                    None => {
                        request["stream_options"] = serde_json::json!({ "include_usage": true });
                    }
                }
                rewritten = true;
            }
        }

        let model = request_model(&request).to_string();
        self.request_model = Some(model.clone());

        let mut header_mutation = HeaderMutation::default();
        header_mutation.set(PATH_HEADER, self.target.path(&model));

        let body_mutation = if rewritten {
            let body = serde_json::to_vec(&request)?;
            set_content_length(&mut header_mutation, &body);
            Some(BodyMutation::new(body))
        } else {
            None
        };

        Ok(RequestBodyOutput {
            header_mutation,
            body_mutation,
            model,
            mode_override: self.stream.then(ProcessingMode::streamed_response),
        })
    }

    fn response_headers(&mut self, _headers: &Headers) -> Result<HeaderMutation> {
        Ok(HeaderMutation::default())
    }

    fn response_body(&mut self, chunk: &[u8], end_of_stream: bool) -> Result<ResponseBodyOutput> {
        if self.stream {
            for event in self.sse.push(chunk)? {
                if let SseEvent::Data(data) = event {
                    self.observe_chunk(&data)?;
                }
            }
            if !end_of_stream {
                return Ok(ResponseBodyOutput::default());
            }
            for event in self.sse.finish()? {
                if let SseEvent::Data(data) = event {
                    self.observe_chunk(&data)?;
                }
            }
            return Ok(self.final_output());
        }

        self.buffered.extend_from_slice(chunk);
        if !end_of_stream {
            return Ok(ResponseBodyOutput::default());
        }
        let response: Value = serde_json::from_slice(&self.buffered).map_err(|err| {
            ExtProcError::Translation(format!("failed to parse backend response: {err}"))
        })?;
        self.observe_response(&response)?;
        Ok(self.final_output())
    }

    fn response_error(&mut self, headers: &Headers, body: &[u8]) -> Result<ResponseErrorOutput> {
        // OpenAI-shaped backends already speak the client's error format.
        if is_json_content_type(headers) {
            return Ok(ResponseErrorOutput::default());
        }
        let message = String::from_utf8_lossy(body);
        Ok(json_error_output(openai_error_body(
            OPENAI_BACKEND_ERROR,
            &message,
            &status_code(headers),
        )))
    }
}
