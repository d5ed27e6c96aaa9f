use std::path::PathBuf;

use ditto_extproc::Result;
use ditto_extproc::auth::{SignableRequest, build_auth_handler};
use ditto_extproc::config::{
    ApiKeyAuth, AwsCredentialsAuth, AzureAccessTokenAuth, BackendAuth,
};
use tokio_util::sync::CancellationToken;

fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> Result<PathBuf> {
    let path = dir.path().join(name);
    std::fs::write(&path, contents)?;
    Ok(path)
}

fn request(body: &[u8]) -> SignableRequest<'_> {
    SignableRequest {
        method: "POST",
        path: "/model/anthropic.claude-3-sonnet/converse",
        body,
    }
}

#[tokio::test]
async fn api_key_file_becomes_bearer_header() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let filename = write_file(&dir, "key", "sk-test\n")?;
    let handler = build_auth_handler(
        "openai",
        &BackendAuth::ApiKey(ApiKeyAuth { filename }),
        &CancellationToken::new(),
    )
    .await?;

    let mutation = handler.apply(&request(b"{}"))?;
    assert_eq!(mutation.get("authorization").as_deref(), Some("Bearer sk-test"));
    assert!(!format!("{handler:?}").contains("sk-test"));
    Ok(())
}

#[tokio::test]
async fn azure_token_file_becomes_bearer_header() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let filename = write_file(&dir, "azure", "# rotated hourly\nazure_access_token=eyJ0\n")?;
    let handler = build_auth_handler(
        "azure",
        &BackendAuth::AzureAccessToken(AzureAccessTokenAuth { filename }),
        &CancellationToken::new(),
    )
    .await?;

    let mutation = handler.apply(&request(b"{}"))?;
    assert_eq!(mutation.get("authorization").as_deref(), Some("Bearer eyJ0"));
    Ok(())
}

#[tokio::test]
async fn missing_key_file_is_a_config_error() {
    let err = build_auth_handler(
        "openai",
        &BackendAuth::ApiKey(ApiKeyAuth {
            filename: PathBuf::from("/nonexistent/ditto-extproc/key"),
        }),
        &CancellationToken::new(),
    )
    .await
    .expect_err("missing file");
    assert!(matches!(err, ditto_extproc::ExtProcError::Config(_)), "{err}");
}

#[tokio::test]
async fn aws_credentials_file_signs_for_bedrock() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let credential_file = write_file(
        &dir,
        "credentials",
        "[default]\naws_access_key_id = AKIDDEFAULT\naws_secret_access_key = s1\n\n\
         [profile bedrock]\naws_access_key_id = AKIDBEDROCK\naws_secret_access_key = s2\n\
         aws_session_token = tok\n",
    )?;
    let handler = build_auth_handler(
        "bedrock",
        &BackendAuth::AwsCredentials(AwsCredentialsAuth {
            region: "us-west-2".to_string(),
            credential_file,
            profile: Some("bedrock".to_string()),
        }),
        &CancellationToken::new(),
    )
    .await?;

    let mutation = handler.apply(&request(br#"{"messages":[]}"#))?;
    let authorization = mutation.get("authorization").expect("authorization");
    assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDBEDROCK/"));
    assert!(authorization.contains("/us-west-2/bedrock/aws4_request"));
    assert_eq!(mutation.get("x-amz-security-token").as_deref(), Some("tok"));
    assert!(mutation.get("x-amz-date").is_some());
    assert!(mutation.get("x-amz-content-sha256").is_some());
    Ok(())
}
