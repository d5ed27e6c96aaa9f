use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtProcError {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no route matched the request")]
    NoRouteMatched,
    #[error("unsupported path: {0}")]
    UnsupportedPath(String),
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("translation failed: {0}")]
    Translation(String),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "config-yaml")]
    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("frame error: {0}")]
    Frame(#[from] tokio_util::codec::LinesCodecError),
}

impl ExtProcError {
    /// Errors scoped to one exchange. The connection answers them with an
    /// immediate response and keeps serving.
    pub fn is_exchange_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::NoRouteMatched
                | Self::UnsupportedPath(_)
                | Self::PayloadTooLarge { .. }
                | Self::Translation(_)
                | Self::Credential(_)
                | Self::Json(_)
        )
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::Json(_) => 400,
            Self::NoRouteMatched | Self::UnsupportedPath(_) => 404,
            Self::PayloadTooLarge { .. } => 413,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtProcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_errors_map_to_client_or_server_status() {
        assert_eq!(ExtProcError::NoRouteMatched.http_status(), 404);
        assert_eq!(
            ExtProcError::InvalidRequest("bad".to_string()).http_status(),
            400
        );
        assert_eq!(
            ExtProcError::Translation("bad".to_string()).http_status(),
            500
        );
        let too_large = ExtProcError::PayloadTooLarge { limit: 16 };
        assert_eq!(too_large.http_status(), 413);
        assert!(too_large.is_exchange_error());
        assert!(ExtProcError::NoRouteMatched.is_exchange_error());
        assert!(!ExtProcError::Protocol("eof".to_string()).is_exchange_error());
    }
}
