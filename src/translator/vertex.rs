use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
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

const VERTEX_BACKEND_ERROR: &str = "GCPVertexAIBackendError";

/// OpenAI chat completions to Vertex AI Gemini `generateContent`.
#[derive(Debug)]
pub struct VertexTranslator {
    options: TranslatorOptions,
    stream: bool,
    model: String,
    response_model: Option<String>,
    sse: SseBuffer,
    role_sent: bool,
    tool_calls: usize,
    usage: Option<TokenUsage>,
    buffered: Vec<u8>,
    stamp: CompletionStamp,
}

impl VertexTranslator {
    pub fn new(options: TranslatorOptions) -> Self {
        Self {
            options,
            stream: false,
            model: String::new(),
            response_model: None,
            sse: SseBuffer::new(),
            role_sent: false,
            tool_calls: 0,
            usage: None,
            buffered: Vec::new(),
            stamp: CompletionStamp::new(),
        }
    }

    fn reported_model(&self) -> String {
        self.response_model
            .clone()
            .unwrap_or_else(|| self.model.clone())
    }

    fn observe(&mut self, response: &Value) -> Result<()> {
        if self.response_model.is_none() {
            self.response_model = response
                .get("modelVersion")
                .and_then(Value::as_str)
                .filter(|model| !model.trim().is_empty())
                .map(str::to_string);
        }
        if let Some(usage) = parse_usage_metadata(response.get("usageMetadata"))? {
            self.usage = Some(usage);
        }
        Ok(())
    }

    fn chunk(&self, choices: Value) -> Value {
        serde_json::json!({
            "id": self.stamp.id,
            "object": "chat.completion.chunk",
            "created": self.stamp.created,
            "model": self.reported_model(),
            "choices": choices,
        })
    }

    fn translate_event(&mut self, data: &str, out: &mut Vec<u8>) -> Result<()> {
        let Ok(response) = serde_json::from_str::<Value>(data) else {
            return Ok(());
        };
        self.observe(&response)?;
        let Some(candidate) = response.pointer("/candidates/0") else {
            return Ok(());
        };

        let mut delta = Map::new();
        if !self.role_sent {
            delta.insert("role".to_string(), Value::String("assistant".to_string()));
            self.role_sent = true;
        }
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in candidate_parts(candidate) {
            if let Some(part_text) = part.get("text").and_then(Value::as_str) {
                text.push_str(part_text);
            } else if let Some(call) = part.get("functionCall") {
                let index = self.tool_calls;
                self.tool_calls += 1;
                let mut tool_call = function_call_to_tool_call(call, index);
                tool_call["index"] = Value::from(index);
                tool_calls.push(tool_call);
            }
        }
        if !text.is_empty() {
            delta.insert("content".to_string(), Value::String(text));
        }
        if !tool_calls.is_empty() {
            delta.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }

        let finish_reason = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .map(|reason| map_finish_reason(reason, self.tool_calls > 0));
        if delta.is_empty() && finish_reason.is_none() {
            return Ok(());
        }
        let mut choice = serde_json::json!({ "index": 0, "delta": delta });
        if let Some(reason) = finish_reason {
            choice["finish_reason"] = Value::String(reason.to_string());
        }
        let chunk = self.chunk(Value::Array(vec![choice]));
        sse_event_bytes(&chunk, out);
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
            if let Some(usage) = self.usage.as_ref() {
                let mut chunk = self.chunk(Value::Array(Vec::new()));
                chunk["usage"] = openai_usage_value(usage);
                sse_event_bytes(&chunk, &mut out);
            }
            out.extend_from_slice(SSE_DONE);
            output.token_usage = self.usage.map(TokenUsage::finalized);
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
            ExtProcError::Translation(format!("failed to parse vertex response: {err}"))
        })?;
        self.observe(&response)?;

        let mut choices = Vec::new();
        let candidates = response
            .get("candidates")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for (index, candidate) in candidates.iter().enumerate() {
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            for part in candidate_parts(candidate) {
                if let Some(part_text) = part.get("text").and_then(Value::as_str) {
                    text.push_str(part_text);
                } else if let Some(call) = part.get("functionCall") {
                    tool_calls.push(function_call_to_tool_call(call, tool_calls.len()));
                }
            }
            let reason = map_finish_reason(
                candidate
                    .get("finishReason")
                    .and_then(Value::as_str)
                    .unwrap_or("STOP"),
                !tool_calls.is_empty(),
            );
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
            choices.push(serde_json::json!({
                "index": index,
                "message": message,
                "finish_reason": reason,
            }));
        }

        let mut body = serde_json::json!({
            "id": self.stamp.id,
            "object": "chat.completion",
            "created": self.stamp.created,
            "model": self.reported_model(),
            "choices": choices,
        });
        if let Some(usage) = self.usage.as_ref() {
            body["usage"] = openai_usage_value(usage);
        }
        let body = serde_json::to_vec(&body)?;
        let mut header_mutation = HeaderMutation::default();
        set_content_length(&mut header_mutation, &body);
        Ok(ResponseBodyOutput {
            header_mutation,
            body_mutation: Some(BodyMutation::new(body)),
            token_usage: self.usage.map(TokenUsage::finalized),
            response_model: Some(self.reported_model()),
        })
    }
}

impl Translator for VertexTranslator {
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

        let gemini = gemini_request(&request)?;
        let body = serde_json::to_vec(&gemini)?;

        let method = if self.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let mut header_mutation = HeaderMutation::default();
        header_mutation.set(PATH_HEADER, gcp_model_path("google", &self.model, method));
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
        // Some endpoints wrap the error object in a one-element array.
        let error = parsed
            .as_ref()
            .map(|value| value.get(0).unwrap_or(value))
            .and_then(|value| value.get("error"));
        let envelope = match error.and_then(|error| error.get("message").and_then(Value::as_str)) {
            Some(message) => {
                let error_type = error
                    .and_then(|error| error.get("status"))
                    .and_then(Value::as_str)
                    .filter(|status| !status.is_empty())
                    .unwrap_or(VERTEX_BACKEND_ERROR);
                openai_error_body(error_type, message, &code)
            }
            None => openai_error_body(VERTEX_BACKEND_ERROR, &String::from_utf8_lossy(body), &code),
        };
        Ok(json_error_output(envelope))
    }
}

fn candidate_parts(candidate: &Value) -> &[Value] {
    candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn function_call_to_tool_call(call: &Value, index: usize) -> Value {
    let args = call.get("args").cloned().unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::json!({
        "id": format!("call_{index}"),
        "type": "function",
        "function": {
            "name": call.get("name").and_then(Value::as_str).unwrap_or_default(),
            "arguments": args.to_string(),
        },
    })
}

fn map_finish_reason(reason: &str, has_tool_calls: bool) -> &'static str {
    match reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
        | "IMAGE_SAFETY" => "content_filter",
        _ if has_tool_calls => "tool_calls",
        _ => "stop",
    }
}

fn parse_usage_metadata(value: Option<&Value>) -> Result<Option<TokenUsage>> {
    let Some(obj) = value.and_then(Value::as_object) else {
        return Ok(None);
    };
    TokenUsage::from_counts(
        obj.get("promptTokenCount"),
        obj.get("candidatesTokenCount"),
        obj.get("totalTokenCount"),
    )
    .map(Some)
}

/// Builds the Gemini body; the model travels in the path.
fn gemini_request(request: &Value) -> Result<Value> {
    let input = request
        .get("messages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    // Function responses are keyed by name, tool messages only carry the id.
    let mut tool_names = HashMap::<&str, &str>::new();
    for message in input {
        for call in message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            if let (Some(id), Some(name)) = (
                call.get("id").and_then(Value::as_str),
                call.pointer("/function/name").and_then(Value::as_str),
            ) {
                tool_names.insert(id, name);
            }
        }
    }

    let mut system = Vec::<Value>::new();
    let mut contents = Vec::<Value>::new();
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
                let parts = user_parts(message.get("content"))?;
                contents.push(serde_json::json!({ "role": "user", "parts": parts }));
            }
            "assistant" => {
                let mut parts = Vec::new();
                let text = content_text(message.get("content"))?;
                if !text.is_empty() {
                    parts.push(serde_json::json!({ "text": text }));
                }
                for call in message
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                {
                    let name = call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let arguments = call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .filter(|args| !args.trim().is_empty())
                        .unwrap_or("{}");
                    let args: Value = serde_json::from_str(arguments).map_err(|err| {
                        ExtProcError::InvalidRequest(format!(
                            "tool call arguments are not JSON: {err}"
                        ))
                    })?;
                    parts.push(serde_json::json!({ "functionCall": { "name": name, "args": args } }));
                }
                contents.push(serde_json::json!({ "role": "model", "parts": parts }));
            }
            "tool" => {
                let id = message
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let name = tool_names.get(id).copied().ok_or_else(|| {
                    ExtProcError::InvalidRequest(format!(
                        "tool message references unknown tool_call_id {id:?}"
                    ))
                })?;
                let text = content_text(message.get("content"))?;
                contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": { "name": name, "response": { "content": text } }
                    }],
                }));
            }
            other => {
                return Err(ExtProcError::InvalidRequest(format!(
                    "unsupported message role {other:?}"
                )));
            }
        }
    }

    let mut out = Map::new();
    out.insert("contents".to_string(), Value::Array(contents));
    if !system.is_empty() {
        out.insert(
            "systemInstruction".to_string(),
            serde_json::json!({ "parts": system }),
        );
    }

    let mut generation = Map::new();
    if let Some(max_tokens) = request
        .get("max_completion_tokens")
        .or_else(|| request.get("max_tokens"))
        .filter(|value| !value.is_null())
    {
        generation.insert("maxOutputTokens".to_string(), max_tokens.clone());
    }
    for (from, to) in [
        ("temperature", "temperature"),
        ("top_p", "topP"),
        ("n", "candidateCount"),
        ("seed", "seed"),
        ("presence_penalty", "presencePenalty"),
        ("frequency_penalty", "frequencyPenalty"),
    ] {
        if let Some(value) = request.get(from).filter(|value| !value.is_null()) {
            generation.insert(to.to_string(), value.clone());
        }
    }
    match request.get("stop") {
        Some(Value::String(stop)) => {
            generation.insert("stopSequences".to_string(), serde_json::json!([stop]));
        }
        Some(Value::Array(stops)) if !stops.is_empty() => {
            generation.insert("stopSequences".to_string(), Value::Array(stops.clone()));
        }
        _ => {}
    }
    if !generation.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(generation));
    }

    let tools = request
        .get("tools")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if !tools.is_empty() {
        let mut declarations = Vec::with_capacity(tools.len());
        for tool in tools {
            let function = tool.get("function").ok_or_else(|| {
                ExtProcError::InvalidRequest("only function tools are supported".to_string())
            })?;
            let mut declaration = Map::new();
            declaration.insert(
                "name".to_string(),
                function.get("name").cloned().unwrap_or(Value::Null),
            );
            if let Some(description) = function.get("description") {
                declaration.insert("description".to_string(), description.clone());
            }
            if let Some(parameters) = function.get("parameters") {
                declaration.insert("parameters".to_string(), parameters.clone());
            }
            declarations.push(Value::Object(declaration));
        }
        out.insert(
            "tools".to_string(),
            serde_json::json!([{ "functionDeclarations": declarations }]),
        );
    }

    let tool_config = match request.get("tool_choice") {
        Some(Value::String(choice)) => match choice.as_str() {
            "auto" => Some(serde_json::json!({ "functionCallingConfig": { "mode": "AUTO" } })),
            "none" => Some(serde_json::json!({ "functionCallingConfig": { "mode": "NONE" } })),
            "required" => Some(serde_json::json!({ "functionCallingConfig": { "mode": "ANY" } })),
            _ => None,
        },
        Some(value @ Value::Object(_)) => value.pointer("/function/name").map(|name| {
            serde_json::json!({
                "functionCallingConfig": { "mode": "ANY", "allowedFunctionNames": [name] }
            })
        }),
        _ => None,
    };
    if let Some(tool_config) = tool_config {
        out.insert("toolConfig".to_string(), tool_config);
    }
    Ok(Value::Object(out))
}

fn content_text(content: Option<&Value>) -> Result<String> {
    match content {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(parts)) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part
                    .get("text")
                    .or_else(|| part.get("refusal"))
                    .and_then(Value::as_str)
                {
                    out.push_str(text);
                }
            }
            Ok(out)
        }
        Some(other) => Err(ExtProcError::InvalidRequest(format!(
            "unsupported message content {other}"
        ))),
    }
}

fn user_parts(content: Option<&Value>) -> Result<Vec<Value>> {
    let Some(Value::Array(parts)) = content else {
        return Ok(vec![serde_json::json!({ "text": content_text(content)? })]);
    };
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
                out.push(serde_json::json!({ "text": text }));
            }
            Some("image_url") => {
                let url = part
                    .pointer("/image_url/url")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                out.push(image_part(url)?);
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

/// Data URIs become inline data; other URLs are passed as file references.
fn image_part(url: &str) -> Result<Value> {
    let Some(rest) = url.strip_prefix("data:") else {
        if url.trim().is_empty() {
            return Err(ExtProcError::InvalidRequest(
                "image_url without url".to_string(),
            ));
        }
        let mime_type = mime_type_from_extension(url);
        return Ok(serde_json::json!({ "fileData": { "mimeType": mime_type, "fileUri": url } }));
    };
    let (meta, data) = rest.split_once(',').ok_or_else(|| {
        ExtProcError::InvalidRequest("malformed image data URI".to_string())
    })?;
    let mime_type = meta.strip_suffix(";base64").ok_or_else(|| {
        ExtProcError::InvalidRequest("image data URI must be base64".to_string())
    })?;
    BASE64.decode(data.trim()).map_err(|err| {
        ExtProcError::InvalidRequest(format!("image data is not valid base64: {err}"))
    })?;
    Ok(serde_json::json!({ "inlineData": { "mimeType": mime_type, "data": data.trim() } }))
}

fn mime_type_from_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    match path.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}
