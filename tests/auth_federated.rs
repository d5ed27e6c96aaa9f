use ditto_extproc::Result;
use ditto_extproc::auth::{SignableRequest, build_auth_handler};
use ditto_extproc::config::{AwsOidcExchangeAuth, BackendAuth, OidcConfig};
use httpmock::{Method::POST, MockServer};
use tokio_util::sync::CancellationToken;

const STS_RESPONSE: &str = r#"<AssumeRoleWithWebIdentityResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <AssumeRoleWithWebIdentityResult>
    <Credentials>
      <AccessKeyId>ASIAFEDERATED</AccessKeyId>
      <SecretAccessKey>federated-secret</SecretAccessKey>
      <SessionToken>federated-session</SessionToken>
      <Expiration>2099-01-01T00:00:00Z</Expiration>
    </Credentials>
  </AssumeRoleWithWebIdentityResult>
</AssumeRoleWithWebIdentityResponse>"#;

fn oidc_auth(server: &MockServer, secret_file: std::path::PathBuf) -> BackendAuth {
    BackendAuth::AwsOidcExchange(AwsOidcExchangeAuth {
        region: "us-east-1".to_string(),
        role_arn: "arn:aws:iam::123456789012:role/gateway".to_string(),
        oidc: OidcConfig {
            token_url: server.url("/oauth/token"),
            client_id: "gateway".to_string(),
            client_secret_file: secret_file,
            scopes: vec!["sts".to_string()],
            audience: Some("sts.amazonaws.com".to_string()),
        },
        sts_endpoint: Some(server.url("/sts")),
        refresh_interval_secs: Some(3600),
    })
}

#[tokio::test]
async fn oidc_token_is_exchanged_for_signing_credentials() -> Result<()> {
    if ditto_extproc::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    let token_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/oauth/token")
                .body_includes("grant_type=client_credentials")
                .body_includes("client_id=gateway")
                .body_includes("client_secret=oidc-secret")
                .body_includes("audience=sts.amazonaws.com");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"access_token":"web-identity","token_type":"Bearer","expires_in":3600}"#);
        })
        .await;
    let sts_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/sts")
                .body_includes("Action=AssumeRoleWithWebIdentity")
                .body_includes("RoleSessionName=ditto-extproc-bedrock")
                .body_includes("WebIdentityToken=web-identity");
            then.status(200)
                .header("content-type", "text/xml")
                .body(STS_RESPONSE);
        })
        .await;

    let dir = tempfile::tempdir()?;
    let secret_file = dir.path().join("secret");
    std::fs::write(&secret_file, "oidc-secret\n")?;

    let shutdown = CancellationToken::new();
    let handler = build_auth_handler("bedrock", &oidc_auth(&server, secret_file), &shutdown).await?;
    token_mock.assert_async().await;
    sts_mock.assert_async().await;

    let mutation = handler.apply(&SignableRequest {
        method: "POST",
        path: "/model/anthropic.claude-3-sonnet/converse",
        body: b"{}",
    })?;
    let authorization = mutation.get("authorization").expect("authorization");
    assert!(authorization.contains("Credential=ASIAFEDERATED/"), "{authorization}");
    assert_eq!(
        mutation.get("x-amz-security-token").as_deref(),
        Some("federated-session")
    );
    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn failed_initial_exchange_leaves_backend_unsigned() -> Result<()> {
    if ditto_extproc::utils::test_support::should_skip_httpmock() {
        return Ok(());
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(401).body("invalid_client");
        })
        .await;

    let dir = tempfile::tempdir()?;
    let secret_file = dir.path().join("secret");
    std::fs::write(&secret_file, "wrong")?;

    let shutdown = CancellationToken::new();
    let handler = build_auth_handler("bedrock", &oidc_auth(&server, secret_file), &shutdown).await?;
    let err = handler
        .apply(&SignableRequest {
            method: "POST",
            path: "/model/m/converse",
            body: b"{}",
        })
        .expect_err("no credential yet");
    assert!(err.is_exchange_error());
    assert_eq!(err.http_status(), 500);
    shutdown.cancel();
    Ok(())
}
