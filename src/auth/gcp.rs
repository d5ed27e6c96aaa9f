use super::{BackendAuthHandler, SignableRequest};
use crate::config::GcpCredentialsAuth;
use crate::protocol::{HeaderMutation, PATH_HEADER};
use crate::{ExtProcError, Result};

/// Vertex AI bearer token plus the project/location path prefix.
///
/// Vertex translators emit only the model path suffix
/// (`publishers/{publisher}/models/{model}:{method}`); this handler owns the
/// `/v1/projects/{project}/locations/{region}/` prefix.
#[derive(Clone)]
pub struct GcpTokenHandler {
    token: String,
    prefix: String,
}

impl std::fmt::Debug for GcpTokenHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpTokenHandler")
            .field("token", &"<redacted>")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl GcpTokenHandler {
    pub fn new(token: &str, region: &str, project_name: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ExtProcError::Config("gcp access token is empty".to_string()));
        }
        Ok(Self {
            token: token.to_string(),
            prefix: format!(
                "/v1/projects/{}/locations/{}/",
                project_name.trim(),
                region.trim()
            ),
        })
    }

    pub async fn from_config(config: &GcpCredentialsAuth) -> Result<Self> {
        let raw = tokio::fs::read_to_string(&config.access_token_file)
            .await
            .map_err(|err| {
                ExtProcError::Config(format!(
                    "failed to read gcp access token {}: {err}",
                    config.access_token_file.display()
                ))
            })?;
        Self::new(&raw, &config.region, &config.project_name)
    }
}

impl BackendAuthHandler for GcpTokenHandler {
    fn apply(&self, request: &SignableRequest<'_>) -> Result<HeaderMutation> {
        let mut mutation = HeaderMutation::default();
        mutation.set("authorization", format!("Bearer {}", self.token));
        mutation.set(
            PATH_HEADER,
            format!("{}{}", self.prefix, request.path.trim_start_matches('/')),
        );
        Ok(mutation)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[tokio::test]
    async fn prefixes_model_path_and_sets_bearer() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("token");
        std::fs::write(&path, "ya29.token\n")?;

        let handler = GcpTokenHandler::from_config(&GcpCredentialsAuth {
            access_token_file: path,
            region: "europe-west4".to_string(),
            project_name: "acme".to_string(),
        })
        .await?;
        let mutation = handler.apply(&SignableRequest {
            method: "POST",
            path: "publishers/google/models/gemini-1.5-pro:streamGenerateContent?alt=sse",
            body: b"{}",
        })?;
        assert_eq!(
            mutation.get(PATH_HEADER).as_deref(),
            Some(
                "/v1/projects/acme/locations/europe-west4/publishers/google/models/gemini-1.5-pro:streamGenerateContent?alt=sse"
            )
        );
        assert_eq!(
            mutation.get("authorization").as_deref(),
            Some("Bearer ya29.token")
        );
        assert!(!format!("{handler:?}").contains("ya29"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_blank_token_is_a_config_error() {
        let missing = GcpCredentialsAuth {
            access_token_file: PathBuf::from("/nonexistent/token"),
            region: "us-central1".to_string(),
            project_name: "p".to_string(),
        };
        assert!(matches!(
            GcpTokenHandler::from_config(&missing).await,
            Err(ExtProcError::Config(_))
        ));
        assert!(GcpTokenHandler::new(" \n", "us-central1", "p").is_err());
    }
}
