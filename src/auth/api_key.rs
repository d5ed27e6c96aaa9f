use std::path::Path;

use super::{BackendAuthHandler, SignableRequest};
use crate::protocol::HeaderMutation;
use crate::{ExtProcError, Result};

/// Static bearer token read once from a file.
#[derive(Clone)]
pub struct ApiKeyHandler {
    key: String,
}

impl std::fmt::Debug for ApiKeyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyHandler")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl ApiKeyHandler {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let raw = key.into();
        let key = raw.trim();
        if key.is_empty() {
            return Err(ExtProcError::Config("api key is empty".to_string()));
        }
        if key.len() != raw.len() {
            tracing::debug!("trimmed whitespace around api key");
        }
        Ok(Self {
            key: key.to_string(),
        })
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            ExtProcError::Config(format!("failed to read api key {}: {err}", path.display()))
        })?;
        Self::new(raw)
    }
}

impl BackendAuthHandler for ApiKeyHandler {
    fn apply(&self, _request: &SignableRequest<'_>) -> Result<HeaderMutation> {
        let mut mutation = HeaderMutation::default();
        mutation.set("authorization", format!("Bearer {}", self.key));
        Ok(mutation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_and_trims_key_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("key");
        std::fs::write(&path, "sk-test\n")?;

        let handler = ApiKeyHandler::from_file(&path).await?;
        let mutation = handler.apply(&SignableRequest {
            method: "POST",
            path: "/v1/chat/completions",
            body: b"{}",
        })?;
        assert_eq!(
            mutation.get("authorization").as_deref(),
            Some("Bearer sk-test")
        );
        assert!(!format!("{handler:?}").contains("sk-test"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_blank_key_is_a_config_error() {
        assert!(matches!(
            ApiKeyHandler::from_file(Path::new("/nonexistent/key")).await,
            Err(ExtProcError::Config(_))
        ));
        assert!(ApiKeyHandler::new("  \n").is_err());
    }
}
