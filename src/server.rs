//! Bridge server: one [`Session`] per accepted connection.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::observability::{CounterKind, MetricsSnapshot, ProcessMetrics};
use crate::protocol::{
    ProcessingRequest, ProcessingResponse, ResponseKind, StreamError, StreamErrorCode,
};
use crate::runtime::ConfigHandle;
use crate::session::{Session, immediate_error_response};
use crate::{ExtProcError, Result};

/// Longest accepted record line.
pub const MAX_RECORD_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ExtProcServer {
    config: Arc<ConfigHandle>,
    metrics: Arc<ProcessMetrics>,
    shutdown: CancellationToken,
}

impl ExtProcServer {
    pub fn new(config: Arc<ConfigHandle>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            metrics: Arc::new(ProcessMetrics::default()),
            shutdown,
        }
    }

    pub fn metrics(&self) -> Arc<ProcessMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Accepts connections until the shutdown token fires.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let server = self.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = server.process(stream).await {
                        tracing::warn!(error = %err, "bridge connection closed with error");
                    }
                }
                .instrument(tracing::info_span!("extproc_stream", peer = %peer)),
            );
        }
    }

    /// Serves one connection. Returns `Ok` when the peer closes or shutdown
    /// fires, and the protocol error after it was reported to the peer.
    pub async fn process<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_RECORD_BYTES));
        let mut session = Session::new(Arc::clone(&self.config));

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                next = framed.next() => next,
            };
            let line = match next {
                None => return Ok(()),
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    self.metrics.record_failure(CounterKind::ReceiveStreamRequest);
                    let err = ExtProcError::from(err);
                    self.send_stream_error(&mut framed, StreamErrorCode::Internal, &err)
                        .await;
                    return Err(err);
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let request: ProcessingRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(err) => {
                    self.metrics.record_failure(CounterKind::ReceiveStreamRequest);
                    let err = ExtProcError::Protocol(format!("undecodable record: {err}"));
                    self.send_stream_error(&mut framed, StreamErrorCode::InvalidArgument, &err)
                        .await;
                    return Err(err);
                }
            };

            let kind = request.kind();
            self.metrics.record_processed(kind);
            let response = match session.process(request) {
                Ok(response) => response,
                Err(err) if err.is_exchange_error() => {
                    self.metrics.record_failure(kind);
                    tracing::info!(kind = kind.as_str(), error = %err, "exchange rejected");
                    immediate_error_response(&err)
                }
                Err(err) => {
                    self.metrics.record_failure(kind);
                    let code = match err {
                        ExtProcError::Protocol(_) => StreamErrorCode::InvalidArgument,
                        _ => StreamErrorCode::Internal,
                    };
                    self.send_stream_error(&mut framed, code, &err).await;
                    return Err(err);
                }
            };

            if let Err(err) = send_record(&mut framed, &response).await {
                self.metrics.record_failure(CounterKind::SendStreamResponse);
                return Err(err);
            }
        }
    }

    async fn send_stream_error<S>(
        &self,
        framed: &mut Framed<S, LinesCodec>,
        code: StreamErrorCode,
        err: &ExtProcError,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::warn!(error = %err, "closing bridge connection");
        let response = ProcessingResponse::new(ResponseKind::Error(StreamError {
            code,
            message: err.to_string(),
        }));
        if send_record(framed, &response).await.is_err() {
            self.metrics.record_failure(CounterKind::SendStreamResponse);
        }
    }
}

async fn send_record<S>(
    framed: &mut Framed<S, LinesCodec>,
    response: &ProcessingResponse,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = serde_json::to_string(response)?;
    framed.send(line).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "SERVING" })
}

async fn metrics(State(metrics): State<Arc<ProcessMetrics>>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}

/// `GET /healthz` and `GET /metrics` for the separate health listener.
pub fn health_router(metrics: Arc<ProcessMetrics>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(self::metrics))
        .with_state(metrics)
}
