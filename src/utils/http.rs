use futures_util::StreamExt;
use serde::de::DeserializeOwned;

use crate::{ExtProcError, Result};

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;
const MAX_RESPONSE_BODY_BYTES: usize = 1024 * 1024;

/// Reads at most `max_bytes` of the body; the rest is dropped.
async fn read_body_capped(response: reqwest::Response, max_bytes: usize) -> (Vec<u8>, bool) {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if chunk.len() > remaining {
            out.extend_from_slice(&chunk[..remaining]);
            return (out, true);
        }
        out.extend_from_slice(&chunk);
    }
    (out, false)
}

async fn body_text(response: reqwest::Response, max_bytes: usize) -> String {
    let (bytes, truncated) = read_body_capped(response, max_bytes).await;
    let mut body = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        body.push_str("...(truncated)");
    }
    body
}

/// Sends the request and turns a non-2xx answer into [`ExtProcError::Api`].
pub(crate) async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = req.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = body_text(response, MAX_ERROR_BODY_BYTES).await;
        return Err(ExtProcError::Api { status, body });
    }
    Ok(response)
}

pub(crate) async fn send_checked_json<T: DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T> {
    let response = send_checked(req).await?;
    Ok(response.json::<T>().await?)
}

pub(crate) async fn send_checked_text(req: reqwest::RequestBuilder) -> Result<String> {
    let response = send_checked(req).await?;
    let (bytes, truncated) = read_body_capped(response, MAX_RESPONSE_BODY_BYTES).await;
    if truncated {
        return Err(ExtProcError::Credential(format!(
            "response body exceeds {MAX_RESPONSE_BODY_BYTES} bytes"
        )));
    }
    String::from_utf8(bytes)
        .map_err(|err| ExtProcError::Credential(format!("response body is not utf-8: {err}")))
}
