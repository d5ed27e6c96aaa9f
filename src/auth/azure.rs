use std::path::Path;

use super::{BackendAuthHandler, SignableRequest};
use crate::protocol::HeaderMutation;
use crate::{ExtProcError, Result};

const TOKEN_KEY: &str = "azure_access_token";

/// Azure Entra access token taken from a `key=value` file.
#[derive(Clone)]
pub struct AzureTokenHandler {
    token: String,
}

impl std::fmt::Debug for AzureTokenHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureTokenHandler")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl AzureTokenHandler {
    pub fn parse(contents: &str) -> Result<Self> {
        let token = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .find(|(key, _)| key.trim() == TOKEN_KEY)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ExtProcError::Config(format!("missing {TOKEN_KEY} entry")))?;
        Ok(Self {
            token: token.to_string(),
        })
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|err| {
            ExtProcError::Config(format!(
                "failed to read azure token file {}: {err}",
                path.display()
            ))
        })?;
        Self::parse(&contents)
    }
}

impl BackendAuthHandler for AzureTokenHandler {
    fn apply(&self, _request: &SignableRequest<'_>) -> Result<HeaderMutation> {
        let mut mutation = HeaderMutation::default();
        mutation.set("authorization", format!("Bearer {}", self.token));
        Ok(mutation)
    }
}
