use std::collections::HashMap;

use serde_json::{Map, Value};

use super::usage::openai_usage_value;
use super::{
    CompletionStamp, EVENT_STREAM_CONTENT_TYPE, RequestBodyOutput, RequestHeadersOutput,
    ResponseBodyOutput, ResponseErrorOutput, SSE_DONE, TokenUsage, Translator, TranslatorOptions,
    buffered_request_headers, gcp_model_path, is_stream_request, json_error_output,
    openai_error_body, parse_chat_request, request_model, set_content_length, sse_event_bytes,
    status_code,
};
use crate::protocol::{
    BodyMutation, CONTENT_LENGTH_HEADER, CONTENT_TYPE_HEADER, HeaderMutation, Headers,
    PATH_HEADER, ProcessingMode,
};
use crate::utils::sse::{SseBuffer, SseEvent};
use crate::{ExtProcError, Result};

pub const DEFAULT_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";
const GCP_ANTHROPIC_BACKEND_ERROR: &str = "GCPAnthropicBackendError";

/// OpenAI chat completions to Anthropic Messages served by Vertex AI
/// (`rawPredict` / `streamRawPredict`).
#[derive(Debug)]
pub struct GcpAnthropicTranslator {
    anthropic_version: String,
    options: TranslatorOptions,
    stream: bool,
    model: String,
    response_model: Option<String>,
    sse: SseBuffer,
    /// Anthropic content block index to OpenAI tool call index.
    tool_indexes: HashMap<u64, usize>,
    input_tokens: Option<Value>,
    output_tokens: Option<Value>,
    stop_reason: Option<String>,
    buffered: Vec<u8>,
    stamp: CompletionStamp,
}

impl GcpAnthropicTranslator {
    pub fn new(anthropic_version: Option<String>, options: TranslatorOptions) -> Self {
        Self {
            anthropic_version: anthropic_version
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_VERSION.to_string()),
            options,
            stream: false,
            model: String::new(),
            response_model: None,
            sse: SseBuffer::new(),
            tool_indexes: HashMap::new(),
            input_tokens: None,
            output_tokens: None,
            stop_reason: None,
            buffered: Vec::new(),
            stamp: CompletionStamp::new(),
        }
    }

    fn reported_model(&self) -> String {
        self.response_model
            .clone()
            .unwrap_or_else(|| self.model.clone())
    }

    fn usage(&self) -> Result<Option<TokenUsage>> {
        if self.input_tokens.is_none() && self.output_tokens.is_none() {
            return Ok(None);
        }
        TokenUsage::from_counts(self.input_tokens.as_ref(), self.output_tokens.as_ref(), None)
            .map(Some)
    }

    fn delta_chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        let mut choice = serde_json::json!({ "index": 0, "delta": delta });
        if let Some(reason) = finish_reason {
            choice["finish_reason"] = Value::String(reason.to_string());
        }
        serde_json::json!({
            "id": self.stamp.id,
            "object": "chat.completion.chunk",
            "created": self.stamp.created,
            "model": self.reported_model(),
            "choices": [choice],
        })
    }

    fn translate_event(&mut self, data: &str, out: &mut Vec<u8>) -> Result<()> {
        let event: Value = serde_json::from_str(data).map_err(|err| {
            ExtProcError::Translation(format!("anthropic stream event is not JSON: {err}"))
        })?;
        match event.get("type").and_then(Value::as_str).unwrap_or_default() {
            "message_start" => {
                let message = event.get("message");
                if let Some(model) = message
                    .and_then(|message| message.get("model"))
                    .and_then(Value::as_str)
                    .filter(|model| !model.trim().is_empty())
                {
                    self.response_model = Some(model.to_string());
                }
                if let Some(usage) = message.and_then(|message| message.get("usage")) {
                    self.input_tokens = usage.get("input_tokens").cloned();
                }
                let chunk = self.delta_chunk(
                    serde_json::json!({ "role": "assistant", "content": "" }),
                    None,
                );
                sse_event_bytes(&chunk, out);
            }
            "content_block_start" => {
                let block = event.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(Value::as_str) != Some("tool_use") {
                    return Ok(());
                }
                let block_index = event.get("index").and_then(Value::as_u64).unwrap_or_default();
                let index = self.tool_indexes.len();
                self.tool_indexes.insert(block_index, index);
                let chunk = self.delta_chunk(
                    serde_json::json!({ "tool_calls": [{
                        "index": index,
                        "id": block.and_then(|b| b.get("id")).cloned().unwrap_or(Value::Null),
                        "type": "function",
                        "function": {
                            "name": block.and_then(|b| b.get("name")).cloned().unwrap_or(Value::Null),
                            "arguments": "",
                        },
                    }]}),
                    None,
                );
                sse_event_bytes(&chunk, out);
            }
            "content_block_delta" => {
                let Some(delta) = event.get("delta") else {
                    return Ok(());
                };
                let chunk = match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => self.delta_chunk(
                        serde_json::json!({
                            "content": delta.get("text").and_then(Value::as_str).unwrap_or_default(),
                        }),
                        None,
                    ),
                    Some("input_json_delta") => {
                        let block_index =
                            event.get("index").and_then(Value::as_u64).unwrap_or_default();
                        let index = self.tool_indexes.get(&block_index).copied().ok_or_else(|| {
                            ExtProcError::Translation(format!(
                                "input_json_delta for unknown tool block {block_index}"
                            ))
                        })?;
                        self.delta_chunk(
                            serde_json::json!({ "tool_calls": [{
                                "index": index,
                                "function": {
                                    "arguments": delta
                                        .get("partial_json")
                                        .and_then(Value::as_str)
                                        .unwrap_or_default(),
                                },
                            }]}),
                            None,
                        )
                    }
                    _ => return Ok(()),
                };
                sse_event_bytes(&chunk, out);
            }
            "message_delta" => {
                if let Some(output) = event.pointer("/usage/output_tokens") {
                    self.output_tokens = Some(output.clone());
                }
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
            }
            "message_stop" => {
                let reason = map_stop_reason(self.stop_reason.as_deref());
                let chunk = self.delta_chunk(Value::Object(Map::new()), Some(reason));
                sse_event_bytes(&chunk, out);
            }
            "error" => {
                let error = event.get("error");
                let payload = serde_json::json!({
                    "type": "error",
                    "error": {
                        "type": error
                            .and_then(|e| e.get("type"))
                            .and_then(Value::as_str)
                            .unwrap_or(GCP_ANTHROPIC_BACKEND_ERROR),
                        "message": error
                            .and_then(|e| e.get("message"))
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                    },
                });
                sse_event_bytes(&payload, out);
            }
            // ping, content_block_stop
            _ => {}
        }
        Ok(())
    }

    fn streaming_body(&mut self, chunk: &[u8], end_of_stream: bool) -> Result<ResponseBodyOutput> {
        let mut out = Vec::new();
        let mut events = self.sse.push(chunk)?;
        if end_of_stream {
            events.extend(self.sse.finish()?);
        }
        for event in events {
            if let SseEvent::Data(data) = event {
                self.translate_event(&data, &mut out)?;
            }
        }

        let mut output = ResponseBodyOutput::default();
        if end_of_stream {
            let usage = self.usage()?;
            if let Some(usage) = usage.as_ref() {
                let mut chunk = self.delta_chunk(Value::Object(Map::new()), None);
                chunk["choices"] = Value::Array(Vec::new());
                chunk["usage"] = openai_usage_value(usage);
                sse_event_bytes(&chunk, &mut out);
            }
            out.extend_from_slice(SSE_DONE);
            output.token_usage = usage.map(TokenUsage::finalized);
            output.response_model = Some(self.reported_model());
        }
        output.body_mutation = Some(BodyMutation::new(out));
        Ok(output)
    }

    fn unary_body(&mut self, chunk: &[u8], end_of_stream: bool) -> Result<ResponseBodyOutput> {
        self.buffered.extend_from_slice(chunk);
        if !end_of_stream {
            return Ok(ResponseBodyOutput {
                body_mutation: Some(BodyMutation::new(Vec::new())),
                ..ResponseBodyOutput::default()
            });
        }

        let response: Value = serde_json::from_slice(&self.buffered).map_err(|err| {
            ExtProcError::Translation(format!("failed to parse anthropic response: {err}"))
        })?;
        if let Some(model) = response
            .get("model")
            .and_then(Value::as_str)
            .filter(|model| !model.trim().is_empty())
        {
            self.response_model = Some(model.to_string());
        }
        self.input_tokens = response.pointer("/usage/input_tokens").cloned();
        self.output_tokens = response.pointer("/usage/output_tokens").cloned();
        let usage = self.usage()?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in response
            .get("content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    text.push_str(block.get("text").and_then(Value::as_str).unwrap_or_default());
                }
                Some("tool_use") => {
                    let input = block
                        .get("input")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Map::new()));
                    tool_calls.push(serde_json::json!({
                        "id": block.get("id").cloned().unwrap_or(Value::Null),
                        "type": "function",
                        "function": {
                            "name": block.get("name").cloned().unwrap_or(Value::Null),
                            "arguments": input.to_string(),
                        },
                    }));
                }
                _ => {}
            }
        }

        let mut message = Map::new();
        message.insert("role".to_string(), Value::String("assistant".to_string()));
        message.insert(
            "content".to_string(),
            if text.is_empty() && !tool_calls.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            },
        );
        if !tool_calls.is_empty() {
            message.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        let mut body = serde_json::json!({
            "id": self.stamp.id,
            "object": "chat.completion",
            "created": self.stamp.created,
            "model": self.reported_model(),
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": map_stop_reason(response.get("stop_reason").and_then(Value::as_str)),
            }],
        });
        if let Some(usage) = usage.as_ref() {
            body["usage"] = openai_usage_value(usage);
        }

        let body = serde_json::to_vec(&body)?;
        let mut header_mutation = HeaderMutation::default();
        set_content_length(&mut header_mutation, &body);
        Ok(ResponseBodyOutput {
            header_mutation,
            body_mutation: Some(BodyMutation::new(body)),
            token_usage: usage.map(TokenUsage::finalized),
            response_model: Some(self.reported_model()),
        })
    }
}

impl Translator for GcpAnthropicTranslator {
    fn request_headers(&mut self, _headers: &Headers) -> Result<RequestHeadersOutput> {
        Ok(buffered_request_headers())
    }

    fn request_body(&mut self, body: &[u8]) -> Result<RequestBodyOutput> {
        let request = parse_chat_request(body)?;
        self.stream = is_stream_request(&request);
        self.model = self
            .options
            .model_name_override
            .clone()
            .unwrap_or_else(|| request_model(&request).to_string());

        let messages = messages_request(&request, &self.anthropic_version)?;
        let body = serde_json::to_vec(&messages)?;
        let method = if self.stream {
            "streamRawPredict"
        } else {
            "rawPredict"
        };
        let mut header_mutation = HeaderMutation::default();
        header_mutation.set(PATH_HEADER, gcp_model_path("anthropic", &self.model, method));
        set_content_length(&mut header_mutation, &body);

        Ok(RequestBodyOutput {
            header_mutation,
            body_mutation: Some(BodyMutation::new(body)),
            model: self.model.clone(),
            mode_override: self.stream.then(ProcessingMode::streamed_response),
        })
    }

    fn response_headers(&mut self, _headers: &Headers) -> Result<HeaderMutation> {
        let mut mutation = HeaderMutation::default();
        if self.stream {
            mutation.set(CONTENT_TYPE_HEADER, EVENT_STREAM_CONTENT_TYPE);
            mutation.remove(CONTENT_LENGTH_HEADER);
        }
        Ok(mutation)
    }

    fn response_body(&mut self, chunk: &[u8], end_of_stream: bool) -> Result<ResponseBodyOutput> {
        if self.stream {
            self.streaming_body(chunk, end_of_stream)
        } else {
            self.unary_body(chunk, end_of_stream)
        }
    }

    fn response_error(&mut self, headers: &Headers, body: &[u8]) -> Result<ResponseErrorOutput> {
        let code = status_code(headers);
        let parsed = serde_json::from_slice::<Value>(body).ok();
        let error = parsed.as_ref().and_then(|value| value.get("error"));
        let envelope = match error.and_then(|error| error.get("message").and_then(Value::as_str)) {
            Some(message) => {
                let error_type = error
                    .and_then(|error| error.get("type"))
                    .and_then(Value::as_str)
                    .filter(|kind| !kind.is_empty())
                    .unwrap_or(GCP_ANTHROPIC_BACKEND_ERROR);
                openai_error_body(error_type, message, &code)
            }
            None => openai_error_body(
                GCP_ANTHROPIC_BACKEND_ERROR,
                &String::from_utf8_lossy(body),
                &code,
            ),
        };
        Ok(json_error_output(envelope))
    }
}

fn map_stop_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        Some("refusal") => "content_filter",
        _ => "stop",
    }
}

/// Builds the Messages body; the model travels in the path.
fn messages_request(request: &Value, anthropic_version: &str) -> Result<Value> {
    let max_tokens = request
        .get("max_completion_tokens")
        .or_else(|| request.get("max_tokens"))
        .filter(|value| !value.is_null())
        .ok_or_else(|| {
            ExtProcError::InvalidRequest("anthropic models require max_tokens".to_string())
        })?;

    let mut system = Vec::<String>::new();
    let mut messages = Vec::<Value>::new();
    for message in request
        .get("messages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let (role, blocks) = match message.get("role").and_then(Value::as_str).unwrap_or_default() {
            "system" | "developer" => {
                let text = content_text(message.get("content"))?;
                if !text.is_empty() {
                    system.push(text);
                }
                continue;
            }
            "user" => ("user", user_blocks(message.get("content"))?),
            "assistant" => ("assistant", assistant_blocks(message)?),
            "tool" => (
                "user",
                vec![serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
                    "content": content_text(message.get("content"))?,
                })],
            ),
            other => {
                return Err(ExtProcError::InvalidRequest(format!(
                    "unsupported message role {other:?}"
                )));
            }
        };
        // Roles must alternate, so consecutive turns of one role are merged.
        let previous = messages
            .last_mut()
            .filter(|last| last["role"] == role)
            .and_then(|last| last["content"].as_array_mut());
        match previous {
            Some(content) => content.extend(blocks),
            None => messages.push(serde_json::json!({ "role": role, "content": blocks })),
        }
    }

    let mut out = Map::new();
    out.insert(
        "anthropic_version".to_string(),
        Value::String(anthropic_version.to_string()),
    );
    out.insert("messages".to_string(), Value::Array(messages));
    out.insert("max_tokens".to_string(), max_tokens.clone());
    if !system.is_empty() {
        out.insert("system".to_string(), Value::String(system.join("\n")));
    }
    for (from, to) in [("temperature", "temperature"), ("top_p", "top_p")] {
        if let Some(value) = request.get(from).filter(|value| !value.is_null()) {
            out.insert(to.to_string(), value.clone());
        }
    }
    match request.get("stop") {
        Some(Value::String(stop)) => {
            out.insert("stop_sequences".to_string(), serde_json::json!([stop]));
        }
        Some(Value::Array(stops)) if !stops.is_empty() => {
            out.insert("stop_sequences".to_string(), Value::Array(stops.clone()));
        }
        _ => {}
    }
    if is_stream_request(request) {
        out.insert("stream".to_string(), Value::Bool(true));
    }

    let tools = request
        .get("tools")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if !tools.is_empty() {
        let mut converted = Vec::with_capacity(tools.len());
        for tool in tools {
            let function = tool.get("function").ok_or_else(|| {
                ExtProcError::InvalidRequest("only function tools are supported".to_string())
            })?;
            let mut entry = Map::new();
            entry.insert(
                "name".to_string(),
                function.get("name").cloned().unwrap_or(Value::Null),
            );
            if let Some(description) = function.get("description") {
                entry.insert("description".to_string(), description.clone());
            }
            entry.insert(
                "input_schema".to_string(),
                function
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
            );
            converted.push(Value::Object(entry));
        }
        out.insert("tools".to_string(), Value::Array(converted));
    }
    let tool_choice = match request.get("tool_choice") {
        Some(Value::String(choice)) => match choice.as_str() {
            "auto" => Some(serde_json::json!({ "type": "auto" })),
            "required" => Some(serde_json::json!({ "type": "any" })),
            "none" => Some(serde_json::json!({ "type": "none" })),
            _ => None,
        },
        Some(value @ Value::Object(_)) => value
            .pointer("/function/name")
            .map(|name| serde_json::json!({ "type": "tool", "name": name })),
        _ => None,
    };
    if let Some(tool_choice) = tool_choice {
        out.insert("tool_choice".to_string(), tool_choice);
    }
    Ok(Value::Object(out))
}

fn content_text(content: Option<&Value>) -> Result<String> {
    match content {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(parts)) => Ok(parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect()),
        Some(other) => Err(ExtProcError::InvalidRequest(format!(
            "unsupported message content {other}"
        ))),
    }
}

fn user_blocks(content: Option<&Value>) -> Result<Vec<Value>> {
    let Some(Value::Array(parts)) = content else {
        return Ok(vec![
            serde_json::json!({ "type": "text", "text": content_text(content)? }),
        ]);
    };
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => out.push(serde_json::json!({
                "type": "text",
                "text": part.get("text").and_then(Value::as_str).unwrap_or_default(),
            })),
            Some("image_url") => {
                let url = part
                    .pointer("/image_url/url")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                out.push(image_block(url)?);
            }
            other => {
                return Err(ExtProcError::InvalidRequest(format!(
                    "unsupported user content part {other:?}"
                )));
            }
        }
    }
    Ok(out)
}

fn image_block(url: &str) -> Result<Value> {
    let Some(rest) = url.strip_prefix("data:") else {
        if url.trim().is_empty() {
            return Err(ExtProcError::InvalidRequest(
                "image_url without url".to_string(),
            ));
        }
        return Ok(serde_json::json!({ "type": "image", "source": { "type": "url", "url": url } }));
    };
    let (meta, data) = rest.split_once(',').ok_or_else(|| {
        ExtProcError::InvalidRequest("malformed image data URI".to_string())
    })?;
    let media_type = meta.strip_suffix(";base64").ok_or_else(|| {
        ExtProcError::InvalidRequest("image data URI must be base64".to_string())
    })?;
    Ok(serde_json::json!({
        "type": "image",
        "source": { "type": "base64", "media_type": media_type, "data": data.trim() },
    }))
}

fn assistant_blocks(message: &Value) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    let text = content_text(message.get("content"))?;
    if !text.is_empty() {
        out.push(serde_json::json!({ "type": "text", "text": text }));
    }
    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let arguments = call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .filter(|args| !args.trim().is_empty())
            .unwrap_or("{}");
        let input: Value = serde_json::from_str(arguments).map_err(|err| {
            ExtProcError::InvalidRequest(format!("tool call arguments are not JSON: {err}"))
        })?;
        out.push(serde_json::json!({
            "type": "tool_use",
            "id": call.get("id").cloned().unwrap_or(Value::Null),
            "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
            "input": input,
        }));
    }
    Ok(out)
}
