use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value};

use super::usage::openai_usage_value;
use super::{
    CompletionStamp, EVENT_STREAM_CONTENT_TYPE, RequestBodyOutput, RequestHeadersOutput,
    ResponseBodyOutput, ResponseErrorOutput, SSE_DONE, TokenUsage, Translator, TranslatorOptions,
    buffered_request_headers, is_stream_request, json_error_output, openai_error_body,
    parse_chat_request, request_model, set_content_length, sse_event_bytes, status_code,
};
use crate::protocol::{
    BodyMutation, CONTENT_LENGTH_HEADER, CONTENT_TYPE_HEADER, HeaderMutation, Headers,
    PATH_HEADER, ProcessingMode,
};
use crate::utils::eventstream::{EventStreamDecoder, EventStreamMessage};
use crate::{ExtProcError, Result};

const AMAZON_EVENTSTREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";
const ERROR_TYPE_HEADER: &str = "x-amzn-errortype";
const BEDROCK_BACKEND_ERROR: &str = "AWSBedrockBackendError";

/// OpenAI chat completions to the Bedrock Converse API.
#[derive(Debug)]
pub struct BedrockTranslator {
    options: TranslatorOptions,
    stream: bool,
    model: String,
    decoder: EventStreamDecoder,
    /// Converse content block index to OpenAI tool call index.
    tool_indexes: HashMap<u64, usize>,
    usage: Option<TokenUsage>,
    buffered: Vec<u8>,
    stamp: CompletionStamp,
}

impl BedrockTranslator {
    pub fn new(options: TranslatorOptions) -> Self {
        Self {
            options,
            stream: false,
            model: String::new(),
            decoder: EventStreamDecoder::default(),
            tool_indexes: HashMap::new(),
            usage: None,
            buffered: Vec::new(),
            stamp: CompletionStamp::new(),
        }
    }

    fn chunk(&self, choices: Value) -> Value {
        serde_json::json!({
            "id": self.stamp.id,
            "object": "chat.completion.chunk",
            "created": self.stamp.created,
            "model": self.model,
            "choices": choices,
        })
    }

    fn delta_chunk(&self, delta: Value) -> Value {
        self.chunk(serde_json::json!([{ "index": 0, "delta": delta }]))
    }

    fn translate_event(&mut self, message: &EventStreamMessage, out: &mut Vec<u8>) -> Result<()> {
        let payload: Value = if message.payload.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice(&message.payload).map_err(|err| {
                ExtProcError::Translation(format!("bedrock stream payload is not JSON: {err}"))
            })?
        };

        if message.message_type() == Some("exception") {
            let error_type = message.exception_type().unwrap_or(BEDROCK_BACKEND_ERROR);
            let text = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let event = serde_json::json!({
                "type": "error",
                "error": { "type": error_type, "message": text },
            });
            sse_event_bytes(&event, out);
            return Ok(());
        }

        let block_index = payload.get("contentBlockIndex").and_then(Value::as_u64);
        match message.event_type().unwrap_or_default() {
            "messageStart" => {
                let role = payload
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("assistant");
                let chunk = self.delta_chunk(serde_json::json!({ "role": role, "content": "" }));
                sse_event_bytes(&chunk, out);
            }
            "contentBlockStart" => {
                let Some(tool_use) = payload.pointer("/start/toolUse") else {
                    return Ok(());
                };
                let index = self.tool_indexes.len();
                self.tool_indexes.insert(block_index.unwrap_or_default(), index);
                let chunk = self.delta_chunk(serde_json::json!({
                    "tool_calls": [{
                        "index": index,
                        "id": tool_use.get("toolUseId").and_then(Value::as_str).unwrap_or_default(),
                        "type": "function",
                        "function": {
                            "name": tool_use.get("name").and_then(Value::as_str).unwrap_or_default(),
                            "arguments": "",
                        },
                    }],
                }));
                sse_event_bytes(&chunk, out);
            }
            "contentBlockDelta" => {
                let Some(delta) = payload.get("delta") else {
                    return Ok(());
                };
                if let Some(text) = delta.get("text").and_then(Value::as_str) {
                    let chunk = self.delta_chunk(serde_json::json!({ "content": text }));
                    sse_event_bytes(&chunk, out);
                } else if let Some(input) = delta.pointer("/toolUse/input").and_then(Value::as_str)
                {
                    let index = block_index
                        .and_then(|block| self.tool_indexes.get(&block).copied())
                        .unwrap_or_default();
                    let chunk = self.delta_chunk(serde_json::json!({
                        "tool_calls": [{ "index": index, "function": { "arguments": input } }],
                    }));
                    sse_event_bytes(&chunk, out);
                }
            }
            "messageStop" => {
                let reason = stop_reason_to_finish_reason(
                    payload.get("stopReason").and_then(Value::as_str),
                );
                let chunk = self.chunk(serde_json::json!([{
                    "index": 0,
                    "delta": {},
                    "finish_reason": reason,
                }]));
                sse_event_bytes(&chunk, out);
            }
            "metadata" => {
                if let Some(usage) = parse_converse_usage(payload.get("usage"))? {
                    self.usage = Some(usage);
                    let mut chunk = self.chunk(Value::Array(Vec::new()));
                    chunk["usage"] = openai_usage_value(&usage);
                    sse_event_bytes(&chunk, out);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn streaming_body(&mut self, chunk: &[u8], end_of_stream: bool) -> Result<ResponseBodyOutput> {
        self.decoder.push(chunk);
        let mut out = Vec::new();
        for message in self.decoder.drain_messages()? {
            self.translate_event(&message, &mut out)?;
        }

        let mut output = ResponseBodyOutput::default();
        if end_of_stream {
            if self.decoder.buffered_len() > 0 {
                return Err(ExtProcError::Translation(format!(
                    "bedrock stream ended inside a frame ({} bytes left)",
                    self.decoder.buffered_len()
                )));
            }
            out.extend_from_slice(SSE_DONE);
            output.token_usage = self.usage.map(TokenUsage::finalized);
            output.response_model = Some(self.model.clone());
        }
        // Raw eventstream bytes must never reach the client.
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
            ExtProcError::Translation(format!("failed to parse bedrock response: {err}"))
        })?;
        let usage = parse_converse_usage(response.get("usage"))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let blocks = response
            .pointer("/output/message/content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for block in blocks {
            if let Some(part) = block.get("text").and_then(Value::as_str) {
                text.push_str(part);
            } else if let Some(tool_use) = block.get("toolUse") {
                let input = tool_use.get("input").cloned().unwrap_or(Value::Null);
                tool_calls.push(serde_json::json!({
                    "id": tool_use.get("toolUseId").and_then(Value::as_str).unwrap_or_default(),
                    "type": "function",
                    "function": {
                        "name": tool_use.get("name").and_then(Value::as_str).unwrap_or_default(),
                        "arguments": input.to_string(),
                    },
                }));
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
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": stop_reason_to_finish_reason(
                    response.get("stopReason").and_then(Value::as_str),
                ),
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
            response_model: Some(self.model.clone()),
        })
    }
}

impl Translator for BedrockTranslator {
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

        let converse = converse_request(&request)?;
        let body = serde_json::to_vec(&converse)?;

        let mut header_mutation = HeaderMutation::default();
        let action = if self.stream {
            "converse-stream"
        } else {
            "converse"
        };
        header_mutation.set(PATH_HEADER, format!("/model/{}/{action}", self.model));
        set_content_length(&mut header_mutation, &body);

        Ok(RequestBodyOutput {
            header_mutation,
            body_mutation: Some(BodyMutation::new(body)),
            model: self.model.clone(),
            mode_override: self.stream.then(ProcessingMode::streamed_response),
        })
    }

    fn response_headers(&mut self, headers: &Headers) -> Result<HeaderMutation> {
        let mut mutation = HeaderMutation::default();
        if !self.stream {
            return Ok(mutation);
        }
        let content_type = headers
            .get(CONTENT_TYPE_HEADER)
            .map(String::as_str)
            .unwrap_or_default();
        if !content_type.trim().starts_with(AMAZON_EVENTSTREAM_CONTENT_TYPE) {
            return Err(ExtProcError::Translation(format!(
                "unexpected bedrock stream content type {content_type:?}"
            )));
        }
        mutation.set(CONTENT_TYPE_HEADER, EVENT_STREAM_CONTENT_TYPE);
        mutation.remove(CONTENT_LENGTH_HEADER);
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
        let message = serde_json::from_slice::<Value>(body).ok().and_then(|value| {
            value
                .get("message")
                .or_else(|| value.get("Message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let envelope = match message {
            Some(message) => {
                // The header may carry a `:namespace` suffix after the type.
                let error_type = headers
                    .get(ERROR_TYPE_HEADER)
                    .and_then(|value| value.split(':').next())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .unwrap_or(BEDROCK_BACKEND_ERROR);
                openai_error_body(error_type, &message, &code)
            }
            None => openai_error_body(
                BEDROCK_BACKEND_ERROR,
                &String::from_utf8_lossy(body),
                &code,
            ),
        };
        Ok(json_error_output(envelope))
    }
}

fn stop_reason_to_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("max_tokens") => "length",
        Some("content_filtered") | Some("guardrail_intervened") => "content_filter",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
}

fn parse_converse_usage(value: Option<&Value>) -> Result<Option<TokenUsage>> {
    let Some(obj) = value.and_then(Value::as_object) else {
        return Ok(None);
    };
    TokenUsage::from_counts(
        obj.get("inputTokens"),
        obj.get("outputTokens"),
        obj.get("totalTokens"),
    )
    .map(Some)
}

/// Builds the Converse body; the model travels in the path, not the body.
fn converse_request(request: &Value) -> Result<Value> {
    let mut system = Vec::<Value>::new();
    let mut messages = Vec::<Value>::new();

    let input = request
        .get("messages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for message in input {
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match role {
            "system" | "developer" => {
                let text = content_text(message.get("content"))?;
                if !text.is_empty() {
                    system.push(serde_json::json!({ "text": text }));
                }
            }
            "user" => {
                let content = user_content_blocks(message.get("content"))?;
                messages.push(serde_json::json!({ "role": "user", "content": content }));
            }
            "assistant" => {
                let content = assistant_content_blocks(message)?;
                messages.push(serde_json::json!({ "role": "assistant", "content": content }));
            }
            "tool" => {
                let tool_use_id = message
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ExtProcError::InvalidRequest("tool message without tool_call_id".to_string())
                    })?;
                let text = content_text(message.get("content"))?;
                let block = serde_json::json!({
                    "toolResult": {
                        "toolUseId": tool_use_id,
                        "content": [{ "text": text }],
                    }
                });
                // Consecutive tool results belong to one user turn.
                let previous = messages.last_mut().filter(|last| {
                    last.get("role").and_then(Value::as_str) == Some("user")
                        && last
                            .get("content")
                            .and_then(Value::as_array)
                            .and_then(|blocks| blocks.first())
                            .is_some_and(|first| first.get("toolResult").is_some())
                });
                match previous.and_then(|last| last.get_mut("content")?.as_array_mut()) {
                    Some(blocks) => blocks.push(block),
                    None => messages.push(serde_json::json!({ "role": "user", "content": [block] })),
                }
            }
            other => {
                return Err(ExtProcError::InvalidRequest(format!(
                    "unsupported message role {other:?}"
                )));
            }
        }
    }

    let mut out = Map::new();
    out.insert("messages".to_string(), Value::Array(messages));
    if !system.is_empty() {
        out.insert("system".to_string(), Value::Array(system));
    }

    let mut inference = Map::new();
    if let Some(max_tokens) = request
        .get("max_completion_tokens")
        .or_else(|| request.get("max_tokens"))
        .filter(|value| !value.is_null())
    {
        inference.insert("maxTokens".to_string(), max_tokens.clone());
    }
    match request.get("stop") {
        Some(Value::String(stop)) => {
            inference.insert("stopSequences".to_string(), serde_json::json!([stop]));
        }
        Some(Value::Array(stops)) if !stops.is_empty() => {
            inference.insert("stopSequences".to_string(), Value::Array(stops.clone()));
        }
        _ => {}
    }
    for (from, to) in [("temperature", "temperature"), ("top_p", "topP")] {
        if let Some(value) = request.get(from).filter(|value| !value.is_null()) {
            inference.insert(to.to_string(), value.clone());
        }
    }
    if !inference.is_empty() {
        out.insert("inferenceConfig".to_string(), Value::Object(inference));
    }

    if let Some(tool_config) = tool_config(request)? {
        out.insert("toolConfig".to_string(), tool_config);
    }
    Ok(Value::Object(out))
}

fn tool_config(request: &Value) -> Result<Option<Value>> {
    let tools = request
        .get("tools")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if tools.is_empty() {
        return Ok(None);
    }

    let mut specs = Vec::with_capacity(tools.len());
    for tool in tools {
        let function = tool.get("function").ok_or_else(|| {
            ExtProcError::InvalidRequest("only function tools are supported".to_string())
        })?;
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ExtProcError::InvalidRequest("tool function without name".to_string()))?;
        let mut spec = Map::new();
        spec.insert("name".to_string(), Value::String(name.to_string()));
        if let Some(description) = function.get("description").and_then(Value::as_str) {
            spec.insert(
                "description".to_string(),
                Value::String(description.to_string()),
            );
        }
        let parameters = function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} }));
        spec.insert(
            "inputSchema".to_string(),
            serde_json::json!({ "json": parameters }),
        );
        specs.push(serde_json::json!({ "toolSpec": spec }));
    }

    let mut config = Map::new();
    config.insert("tools".to_string(), Value::Array(specs));
    let choice = match request.get("tool_choice") {
        Some(Value::String(choice)) if choice == "auto" => Some(serde_json::json!({ "auto": {} })),
        Some(Value::String(choice)) if choice == "required" => {
            Some(serde_json::json!({ "any": {} }))
        }
        Some(value @ Value::Object(_)) => value
            .pointer("/function/name")
            .and_then(Value::as_str)
            .map(|name| serde_json::json!({ "tool": { "name": name } })),
        _ => None,
    };
    if let Some(choice) = choice {
        config.insert("toolChoice".to_string(), choice);
    }
    Ok(Some(Value::Object(config)))
}

/// Flattens string or text-part content into one string.
fn content_text(content: Option<&Value>) -> Result<String> {
    match content {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(parts)) => {
            let mut out = String::new();
            for part in parts {
                let text = part
                    .get("text")
                    .or_else(|| part.get("refusal"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ExtProcError::InvalidRequest("expected a text content part".to_string())
                    })?;
                out.push_str(text);
            }
            Ok(out)
        }
        Some(other) => Err(ExtProcError::InvalidRequest(format!(
            "unsupported message content {other}"
        ))),
    }
}

fn user_content_blocks(content: Option<&Value>) -> Result<Vec<Value>> {
    let Some(Value::Array(parts)) = content else {
        return Ok(vec![serde_json::json!({ "text": content_text(content)? })]);
    };
    let mut blocks = Vec::with_capacity(parts.len());
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
                blocks.push(serde_json::json!({ "text": text }));
            }
            Some("image_url") => {
                let url = part
                    .pointer("/image_url/url")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                blocks.push(image_block(url)?);
            }
            other => {
                return Err(ExtProcError::InvalidRequest(format!(
                    "unsupported user content part {other:?}"
                )));
            }
        }
    }
    Ok(blocks)
}

fn image_block(url: &str) -> Result<Value> {
    let invalid = || {
        ExtProcError::InvalidRequest("image_url must be a base64 data URI".to_string())
    };
    let rest = url.strip_prefix("data:").ok_or_else(invalid)?;
    let (meta, data) = rest.split_once(',').ok_or_else(invalid)?;
    let media_type = meta.strip_suffix(";base64").ok_or_else(invalid)?;
    let format = match media_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpeg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        other => {
            return Err(ExtProcError::InvalidRequest(format!(
                "unsupported image media type {other:?}"
            )));
        }
    };
    let bytes = BASE64.decode(data.trim()).map_err(|err| {
        ExtProcError::InvalidRequest(format!("image data is not valid base64: {err}"))
    })?;
    Ok(serde_json::json!({
        "image": {
            "format": format,
            "source": { "bytes": BASE64.encode(bytes) },
        }
    }))
}

fn assistant_content_blocks(message: &Value) -> Result<Vec<Value>> {
    let mut blocks = Vec::new();
    let text = content_text(message.get("content"))?;
    if !text.is_empty() {
        blocks.push(serde_json::json!({ "text": text }));
    }
    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for call in tool_calls {
        let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
        let name = call
            .pointer("/function/name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let arguments = call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .filter(|args| !args.trim().is_empty())
            .unwrap_or("{}");
        let input: Value = serde_json::from_str(arguments).map_err(|err| {
            ExtProcError::InvalidRequest(format!("tool call {id} arguments are not JSON: {err}"))
        })?;
        blocks.push(serde_json::json!({
            "toolUse": { "toolUseId": id, "name": name, "input": input }
        }));
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_support::encode_eventstream_message;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn event(event_type: &str, payload: &str) -> Vec<u8> {
        encode_eventstream_message(
            &[
                (":message-type", "event"),
                (":event-type", event_type),
                (":content-type", "application/json"),
            ],
            payload.as_bytes(),
        )
    }

    fn streaming_translator() -> BedrockTranslator {
        let mut translator = BedrockTranslator::new(TranslatorOptions::default());
        translator
            .request_body(br#"{"model":"anthropic.claude-3","stream":true,"messages":[]}"#)
            .expect("request");
        translator
    }

    #[test]
    fn request_moves_model_into_path() {
        let mut translator = BedrockTranslator::new(TranslatorOptions::default());
        let out = translator
            .request_body(
                br#"{"model":"gpt-4","messages":[{"role":"system","content":"be brief"},{"role":"user","content":"hi"}],"max_tokens":64,"stop":"END","temperature":0.2}"#,
            )
            .expect("request");
        assert_eq!(
            out.header_mutation.get(PATH_HEADER).as_deref(),
            Some("/model/gpt-4/converse")
        );
        let body = out.body_mutation.expect("body").body;
        assert_eq!(
            out.header_mutation.get(CONTENT_LENGTH_HEADER),
            Some(body.len().to_string())
        );
        let value: Value = serde_json::from_slice(&body).expect("json");
        assert!(value.get("model").is_none());
        assert_eq!(value["system"][0]["text"], "be brief");
        assert_eq!(value["messages"][0]["content"][0]["text"], "hi");
        assert_eq!(value["inferenceConfig"]["maxTokens"], 64);
        assert_eq!(value["inferenceConfig"]["stopSequences"][0], "END");
        assert_eq!(out.model, "gpt-4");
        assert!(out.mode_override.is_none());
    }

    #[test]
    fn model_override_and_stream_pick_stream_path() {
        let mut translator = BedrockTranslator::new(TranslatorOptions {
            model_name_override: Some("anthropic.claude-3-5-sonnet".to_string()),
            force_include_usage: false,
        });
        let out = translator
            .request_body(br#"{"model":"claude","stream":true,"messages":[]}"#)
            .expect("request");
        assert_eq!(
            out.header_mutation.get(PATH_HEADER).as_deref(),
            Some("/model/anthropic.claude-3-5-sonnet/converse-stream")
        );
        assert_eq!(out.model, "anthropic.claude-3-5-sonnet");
        assert_eq!(out.mode_override, Some(ProcessingMode::streamed_response()));
    }

    #[test]
    fn tools_and_tool_results_map_to_converse_blocks() {
        let request = serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "look"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGVsbG8="}}
                ]},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}},
                    {"id": "call_2", "type": "function", "function": {"name": "lookup", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "one"},
                {"role": "tool", "tool_call_id": "call_2", "content": "two"}
            ],
            "tools": [{"type": "function", "function": {"name": "lookup", "parameters": {"type": "object"}}}],
            "tool_choice": "required"
        });
        let converse = converse_request(&request).expect("converse");
        let messages = converse["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"][1]["image"]["format"], "png");
        assert_eq!(messages[1]["content"][0]["toolUse"]["input"]["q"], "x");
        assert_eq!(messages[2]["content"].as_array().expect("blocks").len(), 2);
        assert_eq!(messages[2]["content"][1]["toolResult"]["toolUseId"], "call_2");
        assert_eq!(
            converse["toolConfig"]["tools"][0]["toolSpec"]["inputSchema"]["json"]["type"],
            "object"
        );
        assert!(converse["toolConfig"]["toolChoice"].get("any").is_some());
    }

    #[test]
    fn rejects_remote_image_urls() {
        let request = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
            ]}]
        });
        assert!(matches!(
            converse_request(&request),
            Err(ExtProcError::InvalidRequest(_))
        ));
    }

    #[test]
    fn stream_headers_require_eventstream() {
        let mut translator = streaming_translator();
        let mutation = translator
            .response_headers(&headers(&[
                (":status", "200"),
                ("content-type", AMAZON_EVENTSTREAM_CONTENT_TYPE),
            ]))
            .expect("headers");
        assert_eq!(
            mutation.get(CONTENT_TYPE_HEADER).as_deref(),
            Some(EVENT_STREAM_CONTENT_TYPE)
        );
        assert!(mutation.remove_headers.contains(&CONTENT_LENGTH_HEADER.to_string()));

        let mut translator = streaming_translator();
        assert!(
            translator
                .response_headers(&headers(&[("content-type", "application/json")]))
                .is_err()
        );
    }

    #[test]
    fn streamed_usage_is_reported_once_at_end() {
        let mut stream = Vec::new();
        stream.extend(event("messageStart", r#"{"role":"assistant"}"#));
        stream.extend(event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":0,"delta":{"text":"Hello"}}"#,
        ));
        stream.extend(event("messageStop", r#"{"stopReason":"end_turn"}"#));
        stream.extend(event(
            "metadata",
            r#"{"usage":{"inputTokens":10,"outputTokens":20},"metrics":{"latencyMs":5}}"#,
        ));

        let mut whole = streaming_translator();
        let whole_out = whole.response_body(&stream, true).expect("whole");
        assert_eq!(
            whole_out.token_usage,
            Some(TokenUsage::new(10, 20, 30).finalized())
        );
        assert_eq!(whole_out.response_model.as_deref(), Some("anthropic.claude-3"));
        let whole_body = whole_out.body_mutation.expect("body").body;
        let text = String::from_utf8(whole_body.clone()).expect("utf8");
        assert!(text.contains(r#""content":"Hello""#));
        assert!(text.contains(r#""finish_reason":"stop""#));
        assert!(text.ends_with("data: [DONE]\n\n"));

        let mut split = streaming_translator();
        split.stamp = whole.stamp.clone();
        let mut body = Vec::new();
        let mut reported = Vec::new();
        for (idx, byte) in stream.iter().enumerate() {
            let out = split
                .response_body(std::slice::from_ref(byte), idx + 1 == stream.len())
                .expect("chunk");
            body.extend(out.body_mutation.expect("body").body);
            reported.extend(out.token_usage);
        }
        assert_eq!(body, whole_body);
        assert_eq!(reported, vec![TokenUsage::new(10, 20, 30).finalized()]);
    }

    #[test]
    fn streamed_tool_calls_use_openai_indexes() {
        let mut stream = Vec::new();
        stream.extend(event(
            "contentBlockStart",
            r#"{"contentBlockIndex":1,"start":{"toolUse":{"toolUseId":"tool_a","name":"lookup"}}}"#,
        ));
        stream.extend(event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":1,"delta":{"toolUse":{"input":"{\"q\":"}}}"#,
        ));
        stream.extend(event("messageStop", r#"{"stopReason":"tool_use"}"#));

        let mut translator = streaming_translator();
        let out = translator.response_body(&stream, true).expect("stream");
        let text = String::from_utf8(out.body_mutation.expect("body").body).expect("utf8");
        let events: Vec<Value> = text
            .split("\n\n")
            .filter_map(|record| record.strip_prefix("data: "))
            .filter(|data| *data != "[DONE]")
            .map(|data| serde_json::from_str(data).expect("json"))
            .collect();
        assert_eq!(events.len(), 3);
        let start = &events[0]["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(start["index"], 0);
        assert_eq!(start["id"], "tool_a");
        assert_eq!(start["function"]["name"], "lookup");
        assert_eq!(
            events[1]["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            "{\"q\":"
        );
        assert_eq!(events[2]["choices"][0]["finish_reason"], "tool_calls");
        for event in &events {
            assert_eq!(event["id"], translator.stamp.id.as_str());
            assert_eq!(event["created"], translator.stamp.created);
            assert_eq!(event["object"], "chat.completion.chunk");
        }
        assert!(out.token_usage.is_none());
    }

    #[test]
    fn exception_frames_become_sse_errors() {
        let frame = encode_eventstream_message(
            &[
                (":message-type", "exception"),
                (":exception-type", "throttlingException"),
            ],
            br#"{"message":"Too many requests"}"#,
        );
        let mut translator = streaming_translator();
        let out = translator.response_body(&frame, false).expect("stream");
        let text = String::from_utf8(out.body_mutation.expect("body").body).expect("utf8");
        assert!(text.contains(r#""type":"throttlingException""#));
        assert!(text.contains("Too many requests"));
    }

    #[test]
    fn truncated_stream_fails_at_end() {
        let frame = event("messageStart", r#"{"role":"assistant"}"#);
        let mut translator = streaming_translator();
        assert!(matches!(
            translator.response_body(&frame[..frame.len() - 3], true),
            Err(ExtProcError::Translation(_))
        ));
    }

    #[test]
    fn unary_response_becomes_chat_completion() {
        let mut translator = BedrockTranslator::new(TranslatorOptions::default());
        translator
            .request_body(br#"{"model":"gpt-4","messages":[]}"#)
            .expect("request");
        let response = br#"{"output":{"message":{"role":"assistant","content":[{"text":"Hi"},{"toolUse":{"toolUseId":"t1","name":"f","input":{"a":1}}}]}},"stopReason":"tool_use","usage":{"inputTokens":3,"outputTokens":4,"totalTokens":7}}"#;
        let out = translator.response_body(response, true).expect("response");
        let body = out.body_mutation.expect("body").body;
        let value: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["model"], "gpt-4");
        assert!(value["id"].as_str().is_some_and(|id| id.starts_with("chatcmpl-")));
        assert_eq!(value["created"], translator.stamp.created);
        assert_eq!(value["choices"][0]["message"]["content"], "Hi");
        assert_eq!(
            value["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"],
            r#"{"a":1}"#
        );
        assert_eq!(value["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(value["usage"]["total_tokens"], 7);
        assert_eq!(out.token_usage, Some(TokenUsage::new(3, 4, 7).finalized()));
    }

    #[test]
    fn throttling_error_keeps_status_and_type() {
        let mut translator = BedrockTranslator::new(TranslatorOptions::default());
        let out = translator
            .response_error(
                &headers(&[
                    (":status", "429"),
                    ("x-amzn-errortype", "ThrottlingException:http://internal.amazon.com/"),
                ]),
                br#"{"message":"Too many requests"}"#,
            )
            .expect("error");
        let value: Value =
            serde_json::from_slice(&out.body_mutation.expect("body").body).expect("json");
        assert_eq!(value["error"]["code"], "429");
        assert_eq!(value["error"]["type"], "ThrottlingException");
        assert_eq!(value["error"]["message"], "Too many requests");

        let out = translator
            .response_error(&headers(&[(":status", "502")]), b"bad gateway")
            .expect("error");
        let value: Value =
            serde_json::from_slice(&out.body_mutation.expect("body").body).expect("json");
        assert_eq!(value["error"]["type"], "AWSBedrockBackendError");
        assert_eq!(value["error"]["message"], "bad gateway");
    }
}
