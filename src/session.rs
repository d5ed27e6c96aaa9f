//! Per-connection interception state.
//!
//! A [`Session`] lives as long as one bridge connection and runs one
//! [`Exchange`] at a time. Records must arrive in HTTP order:
//! request headers, request body, response headers, response body.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::auth::SignableRequest;
use crate::config::RequestCostKind;
use crate::protocol::{
    BodyMutation, CONTENT_TYPE_HEADER, CommonResponse, HeaderMutation, Headers, HttpBody,
    HttpHeaders, ImmediateResponse, METHOD_HEADER, PATH_HEADER, ProcessingRequest,
    ProcessingResponse, ResponseKind, STATUS_HEADER,
};
use crate::router::RouteSelection;
use crate::runtime::{ConfigHandle, ResolvedBackend, RuntimeConfig};
use crate::translator::{
    self, CHAT_COMPLETIONS_PATH, JSON_CONTENT_TYPE, TokenUsage, Translator, openai_error_body,
};
use crate::{ExtProcError, Result};

pub const ORIGINAL_PATH_HEADER: &str = "x-ai-eg-original-path";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    AwaitRequestBody,
    AwaitResponseHeaders,
    AwaitResponseBody,
    Complete,
}

/// One HTTP exchange, pinned to the config snapshot it started with.
pub struct Exchange {
    runtime: Arc<RuntimeConfig>,
    phase: Phase,
    request_headers: Headers,
    request_body: Vec<u8>,
    selection: Option<RouteSelection>,
    translator: Option<Box<dyn Translator>>,
    requested_model: Option<String>,
    response_headers: Headers,
    response_status: Option<u16>,
    error_body: Vec<u8>,
    error_chunks: usize,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("phase", &self.phase)
            .field("selection", &self.selection)
            .field("requested_model", &self.requested_model)
            .field("response_status", &self.response_status)
            .finish_non_exhaustive()
    }
}

impl Exchange {
    fn new(runtime: Arc<RuntimeConfig>, request_headers: Headers) -> Self {
        Self {
            runtime,
            phase: Phase::AwaitRequestBody,
            request_headers,
            request_body: Vec::new(),
            selection: None,
            translator: None,
            requested_model: None,
            response_headers: Headers::new(),
            response_status: None,
            error_body: Vec::new(),
            error_chunks: 0,
        }
    }

    fn backend(&self) -> Result<&ResolvedBackend> {
        self.selection
            .and_then(|selection| self.runtime.backend(selection))
            .ok_or_else(|| ExtProcError::Protocol("exchange has no selected backend".to_string()))
    }

    fn translator(&mut self) -> Result<&mut Box<dyn Translator>> {
        self.translator
            .as_mut()
            .ok_or_else(|| ExtProcError::Protocol("exchange has no translator".to_string()))
    }

    fn expect_phase(&self, expected: Phase, got: &str) -> Result<()> {
        if self.phase != expected {
            return Err(ExtProcError::Protocol(format!(
                "unexpected {got} while exchange is in {:?}",
                self.phase
            )));
        }
        Ok(())
    }

    fn request_headers(&mut self) -> Result<ProcessingResponse> {
        let path = self
            .request_headers
            .get(PATH_HEADER)
            .map(String::as_str)
            .unwrap_or_default();
        let route = path.split('?').next().unwrap_or_default();
        if route != CHAT_COMPLETIONS_PATH {
            return Err(ExtProcError::UnsupportedPath(path.to_string()));
        }
        let out = translator::buffered_request_headers();
        Ok(ProcessingResponse::new(ResponseKind::RequestHeaders(
            CommonResponse::new(Some(out.header_mutation), None),
        ))
        .with_mode_override(out.mode_override))
    }

    fn request_body(&mut self, body: HttpBody) -> Result<ProcessingResponse> {
        self.expect_phase(Phase::AwaitRequestBody, "request_body")?;
        let limit = self.runtime.config.max_request_body_bytes;
        if self.request_body.len().saturating_add(body.body.len()) > limit {
            return Err(ExtProcError::PayloadTooLarge { limit });
        }
        self.request_body.extend_from_slice(&body.body);
        if !body.end_of_stream {
            return Ok(ProcessingResponse::new(ResponseKind::RequestBody(
                CommonResponse::default(),
            )));
        }

        let request = translator::parse_chat_request(&self.request_body)?;
        let model = translator::request_model(&request).to_string();
        let config = &self.runtime.config;
        let mut routing_headers = self.request_headers.clone();
        routing_headers.insert(config.model_name_header_key.to_ascii_lowercase(), model.clone());

        let selection = self.runtime.router().select(&routing_headers)?;
        self.selection = Some(selection);
        self.requested_model = Some(model.clone());
        let runtime = Arc::clone(&self.runtime);
        let backend = runtime
            .backend(selection)
            .ok_or(ExtProcError::NoRouteMatched)?;

        let mut translator = backend.factory.build();
        let mut header_mutation = translator.request_headers(&self.request_headers)?.header_mutation;
        let out = translator.request_body(&self.request_body)?;
        self.translator = Some(translator);
        header_mutation.merge(out.header_mutation);

        let config = &runtime.config;
        header_mutation.set(config.model_name_header_key.as_str(), model.as_str());
        header_mutation.set(config.selected_backend_header_key.as_str(), backend.name.as_str());
        if let Some(path) = self.request_headers.get(PATH_HEADER) {
            header_mutation.set(ORIGINAL_PATH_HEADER, path.as_str());
        }

        // Auth is merged last: it signs the final path and may prefix it.
        if let Some(auth) = backend.auth.as_ref() {
            let path = header_mutation
                .get(PATH_HEADER)
                .or_else(|| self.request_headers.get(PATH_HEADER).cloned())
                .unwrap_or_default();
            let method = self
                .request_headers
                .get(METHOD_HEADER)
                .map(String::as_str)
                .unwrap_or("POST");
            let body = out
                .body_mutation
                .as_ref()
                .map(|mutation| mutation.body.as_slice())
                .unwrap_or(self.request_body.as_slice());
            header_mutation.merge(auth.apply(&SignableRequest {
                method,
                path: &path,
                body,
            })?);
        }

        tracing::debug!(
            backend = backend.name.as_str(),
            schema = %backend.factory.output_schema().name,
            requested_model = model.as_str(),
            backend_model = out.model.as_str(),
            "request routed"
        );
        self.phase = Phase::AwaitResponseHeaders;
        Ok(ProcessingResponse::new(ResponseKind::RequestBody(CommonResponse::new(
            Some(header_mutation),
            out.body_mutation,
        )))
        .with_mode_override(out.mode_override))
    }

    fn response_headers(&mut self, headers: HttpHeaders) -> Result<ProcessingResponse> {
        self.expect_phase(Phase::AwaitResponseHeaders, "response_headers")?;
        self.response_headers = headers.to_map();
        let status = self
            .response_headers
            .get(STATUS_HEADER)
            .and_then(|status| status.trim().parse::<u16>().ok())
            .unwrap_or(200);
        self.response_status = Some(status);
        self.phase = if headers.end_of_stream {
            Phase::Complete
        } else {
            Phase::AwaitResponseBody
        };

        if !translator::is_good_status_code(status) {
            return Ok(ProcessingResponse::new(ResponseKind::ResponseHeaders(
                CommonResponse::default(),
            )));
        }
        let response_headers = self.response_headers.clone();
        let mutation = self.translator()?.response_headers(&response_headers)?;
        let mut response = ProcessingResponse::new(ResponseKind::ResponseHeaders(
            CommonResponse::new(Some(mutation), None),
        ));
        // A bodiless success still completes the exchange with zero usage.
        if headers.end_of_stream {
            let model = self.requested_model.clone().unwrap_or_default();
            response = response.with_dynamic_metadata(Some(self.completion_metadata(
                &TokenUsage::default(),
                &model,
            )?));
        }
        Ok(response)
    }

    fn response_body(&mut self, body: HttpBody) -> Result<ProcessingResponse> {
        self.expect_phase(Phase::AwaitResponseBody, "response_body")?;
        let status = self.response_status.unwrap_or(200);
        if !translator::is_good_status_code(status) {
            return self.error_body(body);
        }

        let out = self
            .translator()?
            .response_body(&body.body, body.end_of_stream)?;
        let mut response = ProcessingResponse::new(ResponseKind::ResponseBody(
            CommonResponse::new(Some(out.header_mutation), out.body_mutation),
        ));
        if body.end_of_stream {
            self.phase = Phase::Complete;
            let usage = out.token_usage.unwrap_or_default();
            let model = out
                .response_model
                .or_else(|| self.requested_model.clone())
                .unwrap_or_default();
            response = response.with_dynamic_metadata(Some(self.completion_metadata(&usage, &model)?));
        }
        Ok(response)
    }

    /// Non-2xx bodies are held back and rewritten once complete.
    fn error_body(&mut self, body: HttpBody) -> Result<ProcessingResponse> {
        self.error_body.extend_from_slice(&body.body);
        self.error_chunks += 1;
        if !body.end_of_stream {
            return Ok(ProcessingResponse::new(ResponseKind::ResponseBody(
                CommonResponse::new(None, Some(BodyMutation::new(Vec::new()))),
            )));
        }

        self.phase = Phase::Complete;
        let headers = self.response_headers.clone();
        let error_body = std::mem::take(&mut self.error_body);
        let out = self.translator()?.response_error(&headers, &error_body)?;
        // Earlier chunks were swallowed, so an untouched body must be replayed.
        let body_mutation = match out.body_mutation {
            Some(mutation) => Some(mutation),
            None if self.error_chunks > 1 => Some(BodyMutation::new(error_body)),
            None => None,
        };
        tracing::info!(
            status = self.response_status.unwrap_or_default(),
            backend = self.backend().map(|backend| backend.name.as_str()).unwrap_or_default(),
            "backend returned an error"
        );
        Ok(ProcessingResponse::new(ResponseKind::ResponseBody(
            CommonResponse::new(Some(out.header_mutation), body_mutation),
        )))
    }

    fn completion_metadata(&self, usage: &TokenUsage, model: &str) -> Result<Value> {
        let backend = self.backend()?;
        tracing::info!(
            backend = backend.name.as_str(),
            model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            total_tokens = usage.total_tokens,
            "exchange completed"
        );
        Ok(self.dynamic_metadata(backend, usage, model))
    }

    fn dynamic_metadata(&self, backend: &ResolvedBackend, usage: &TokenUsage, model: &str) -> Value {
        let config = &self.runtime.config;
        let mut fields = Map::new();
        for cost in &config.request_costs {
            let value = match cost.kind {
                RequestCostKind::InputToken => usage.input_tokens,
                RequestCostKind::OutputToken => usage.output_tokens,
                RequestCostKind::TotalToken => usage.total_tokens,
            };
            fields.insert(cost.metadata_key.clone(), Value::from(value));
        }
        fields.insert("backend_name".to_string(), Value::from(backend.name.as_str()));
        fields.insert("model_name".to_string(), Value::from(model));
        if !backend.rate_limits.is_empty() {
            fields.insert(
                "rate_limits".to_string(),
                Value::from(backend.rate_limits.clone()),
            );
        }
        let mut metadata = Map::new();
        metadata.insert(config.metadata_namespace.clone(), Value::Object(fields));
        Value::Object(metadata)
    }
}

/// Interception state of one bridge connection.
#[derive(Debug)]
pub struct Session {
    config: Arc<ConfigHandle>,
    exchange: Option<Exchange>,
}

impl Session {
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self {
            config,
            exchange: None,
        }
    }

    /// Handles one inbound record. Exchange errors end the current exchange
    /// and are returned for the caller to answer; protocol errors are fatal
    /// to the connection.
    pub fn process(&mut self, request: ProcessingRequest) -> Result<ProcessingResponse> {
        let result = self.dispatch(request);
        if let Err(err) = &result {
            if err.is_exchange_error() {
                self.exchange = None;
            }
        }
        result
    }

    fn dispatch(&mut self, request: ProcessingRequest) -> Result<ProcessingResponse> {
        if let ProcessingRequest::RequestHeaders(headers) = request {
            if self
                .exchange
                .as_ref()
                .is_some_and(|exchange| exchange.phase != Phase::Complete)
            {
                return Err(ExtProcError::Protocol(
                    "request_headers while an exchange is in flight".to_string(),
                ));
            }
            if headers.end_of_stream {
                return Err(ExtProcError::InvalidRequest(
                    "chat completions request has no body".to_string(),
                ));
            }
            let exchange = self
                .exchange
                .insert(Exchange::new(self.config.load(), headers.to_map()));
            return exchange.request_headers();
        }

        let exchange = self
            .exchange
            .as_mut()
            .ok_or_else(|| ExtProcError::Protocol("record before request_headers".to_string()))?;
        match request {
            ProcessingRequest::RequestBody(body) => exchange.request_body(body),
            ProcessingRequest::ResponseHeaders(headers) => exchange.response_headers(headers),
            ProcessingRequest::ResponseBody(body) => exchange.response_body(body),
            ProcessingRequest::RequestHeaders(_) => Err(ExtProcError::Protocol(
                "duplicate request_headers".to_string(),
            )),
        }
    }
}

/// Answers an exchange error directly with the OpenAI error envelope.
pub fn immediate_error_response(err: &ExtProcError) -> ProcessingResponse {
    let status = err.http_status();
    let error_type = match status {
        400 | 413 => "invalid_request_error",
        404 => "not_found_error",
        _ => "internal_error",
    };
    let mut headers = HeaderMutation::default();
    headers.set(CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE);
    ProcessingResponse::new(ResponseKind::ImmediateResponse(ImmediateResponse {
        status,
        headers: Some(headers),
        body: openai_error_body(error_type, &err.to_string(), &status.to_string()),
        details: err.to_string(),
    }))
}
