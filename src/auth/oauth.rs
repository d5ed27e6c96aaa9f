use serde::Deserialize;

use crate::config::OidcConfig;
use crate::{ExtProcError, Result};

/// Client-credentials grant whose access token is traded with STS.
#[derive(Clone)]
pub struct OidcClientCredentials {
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    audience: Option<String>,
}

impl std::fmt::Debug for OidcClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

impl OidcClientCredentials {
    pub fn from_config(config: &OidcConfig, client_secret: &str) -> Result<Self> {
        let client_secret = client_secret.trim();
        if client_secret.is_empty() {
            return Err(ExtProcError::Config("oidc client secret is empty".to_string()));
        }
        let scope = config
            .scopes
            .iter()
            .map(|scope| scope.trim())
            .filter(|scope| !scope.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Self {
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: client_secret.to_string(),
            scope: (!scope.is_empty()).then_some(scope),
            audience: config
                .audience
                .clone()
                .filter(|audience| !audience.trim().is_empty()),
        })
    }

    pub async fn fetch_access_token(&self, http: &reqwest::Client) -> Result<String> {
        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(scope) = self.scope.as_deref() {
            params.push(("scope", scope));
        }
        if let Some(audience) = self.audience.as_deref() {
            params.push(("audience", audience));
        }
        let parsed = crate::utils::http::send_checked_json::<TokenResponse>(
            http.post(self.token_url.as_str()).form(&params),
        )
        .await?;
        parsed
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| ExtProcError::Credential("oidc response missing access_token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use httpmock::{Method::POST, MockServer};

    use super::*;

    fn oidc_config(token_url: String) -> OidcConfig {
        OidcConfig {
            token_url,
            client_id: "gateway".to_string(),
            client_secret_file: "/etc/oidc/secret".into(),
            scopes: vec!["openid".to_string(), " ".to_string(), "sts".to_string()],
            audience: Some("sts.amazonaws.com".to_string()),
        }
    }

    #[tokio::test]
    async fn posts_client_credentials_form() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_includes("grant_type=client_credentials")
                    .body_includes("client_id=gateway")
                    .body_includes("scope=openid+sts")
                    .body_includes("audience=sts.amazonaws.com");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"access_token":"tok-123","expires_in":3600}"#);
            })
            .await;

        let oidc = OidcClientCredentials::from_config(&oidc_config(server.url("/token")), "hunter2\n")?;
        assert_eq!(oidc.fetch_access_token(&reqwest::Client::new()).await?, "tok-123");
        mock.assert_async().await;
        assert!(!format!("{oidc:?}").contains("hunter2"));
        Ok(())
    }

    #[test]
    fn blank_secret_is_a_config_error() {
        let err = OidcClientCredentials::from_config(&oidc_config("https://idp/token".to_string()), " ")
            .expect_err("blank secret");
        assert!(matches!(err, ExtProcError::Config(_)));
    }
}
