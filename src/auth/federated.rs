use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::aws::CredentialSlot;
use super::oauth::OidcClientCredentials;
use super::sigv4::AwsCredential;
use crate::{ExtProcError, Result};

pub(crate) const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;
/// Credentials expiring within this window are replaced ahead of time.
pub(crate) const REFRESH_WINDOW: time::Duration = time::Duration::minutes(5);

const STS_API_VERSION: &str = "2011-06-15";

#[async_trait]
pub trait CredentialSource: Send + Sync + std::fmt::Debug {
    async fn fetch(&self) -> Result<AwsCredential>;
}

/// OIDC client-credentials token traded for a role via
/// `AssumeRoleWithWebIdentity`.
#[derive(Debug)]
pub struct StsWebIdentitySource {
    http: reqwest::Client,
    oidc: OidcClientCredentials,
    role_arn: String,
    session_name: String,
    sts_endpoint: String,
}

impl StsWebIdentitySource {
    pub fn new(
        http: reqwest::Client,
        oidc: OidcClientCredentials,
        role_arn: impl Into<String>,
        session_name: impl Into<String>,
        sts_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            http,
            oidc,
            role_arn: role_arn.into(),
            session_name: session_name.into(),
            sts_endpoint: sts_endpoint.into(),
        }
    }

    pub async fn assume_role(&self, web_identity_token: &str) -> Result<AwsCredential> {
        let params = [
            ("Action", "AssumeRoleWithWebIdentity"),
            ("Version", STS_API_VERSION),
            ("RoleArn", self.role_arn.as_str()),
            ("RoleSessionName", self.session_name.as_str()),
            ("WebIdentityToken", web_identity_token),
        ];
        let body = crate::utils::http::send_checked_text(
            self.http.post(self.sts_endpoint.as_str()).form(&params),
        )
        .await?;
        parse_assume_role_response(&body)
    }
}

#[async_trait]
impl CredentialSource for StsWebIdentitySource {
    async fn fetch(&self) -> Result<AwsCredential> {
        let token = self.oidc.fetch_access_token(&self.http).await?;
        self.assume_role(&token).await
    }
}

fn xml_field(xml: &str, tag: &str) -> Result<Option<String>> {
    let pattern = Regex::new(&format!(r"<{tag}>\s*([^<]*?)\s*</{tag}>"))
        .map_err(|err| ExtProcError::Credential(format!("bad sts field pattern: {err}")))?;
    Ok(pattern
        .captures(xml)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().to_string())
        .filter(|value| !value.is_empty()))
}

/// Pulls the credential out of an `AssumeRoleWithWebIdentityResponse`.
pub(crate) fn parse_assume_role_response(xml: &str) -> Result<AwsCredential> {
    let required = |tag: &str| {
        xml_field(xml, tag)?
            .ok_or_else(|| ExtProcError::Credential(format!("sts response missing {tag}")))
    };
    let mut credential = AwsCredential::new(
        required("AccessKeyId")?,
        required("SecretAccessKey")?,
        xml_field(xml, "SessionToken")?,
    )?;
    if let Some(expiration) = xml_field(xml, "Expiration")? {
        let expires_at = OffsetDateTime::parse(&expiration, &Rfc3339).map_err(|err| {
            ExtProcError::Credential(format!("invalid sts expiration {expiration:?}: {err}"))
        })?;
        credential = credential.with_expiry(expires_at);
    }
    Ok(credential)
}

fn needs_refresh(slot: &CredentialSlot) -> Result<bool> {
    let guard = slot
        .read()
        .map_err(|_| ExtProcError::Credential("aws credential lock poisoned".to_string()))?;
    Ok(match guard.as_ref() {
        None => true,
        Some(credential) => credential.expires_within(OffsetDateTime::now_utc(), REFRESH_WINDOW),
    })
}

/// Fetches a new credential when the slot is empty or about to expire.
/// Returns whether the slot was replaced.
pub(crate) async fn refresh_if_needed(
    source: &dyn CredentialSource,
    slot: &CredentialSlot,
) -> Result<bool> {
    if !needs_refresh(slot)? {
        return Ok(false);
    }
    let credential = source.fetch().await?;
    let expires_at = credential.expires_at;
    let mut guard = slot
        .write()
        .map_err(|_| ExtProcError::Credential("aws credential lock poisoned".to_string()))?;
    *guard = Some(credential);
    drop(guard);
    tracing::info!(?expires_at, "aws credential refreshed");
    Ok(true)
}

/// Re-checks the slot every `interval` until `shutdown` fires or the
/// returned guard is dropped.
pub fn spawn_refresh_loop(
    source: Arc<dyn CredentialSource>,
    slot: CredentialSlot,
    interval: Duration,
    shutdown: &CancellationToken,
) -> DropGuard {
    let token = shutdown.child_token();
    let cancelled = token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(err) = refresh_if_needed(source.as_ref(), &slot).await {
                tracing::warn!(error = %err, "aws credential refresh failed");
            }
        }
        tracing::debug!("aws credential refresh loop stopped");
    });
    token.drop_guard()
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const STS_RESPONSE: &str = r#"<AssumeRoleWithWebIdentityResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <AssumeRoleWithWebIdentityResult>
    <Credentials>
      <AccessKeyId>ASIAEXAMPLE</AccessKeyId>
      <SecretAccessKey>secret/example</SecretAccessKey>
      <SessionToken>session-token</SessionToken>
      <Expiration>2030-01-01T00:00:00Z</Expiration>
    </Credentials>
  </AssumeRoleWithWebIdentityResult>
</AssumeRoleWithWebIdentityResponse>"#;

    #[derive(Debug)]
    struct CountingSource {
        calls: AtomicUsize,
        expires_in: time::Duration,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn fetch(&self) -> Result<AwsCredential> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AwsCredential::new(format!("AKID{call}"), "secret", None)?
                .with_expiry(OffsetDateTime::now_utc() + self.expires_in))
        }
    }

    #[test]
    fn parses_sts_credentials() -> Result<()> {
        let credential = parse_assume_role_response(STS_RESPONSE)?;
        assert_eq!(credential.access_key_id, "ASIAEXAMPLE");
        assert_eq!(credential.secret_access_key, "secret/example");
        assert_eq!(credential.session_token.as_deref(), Some("session-token"));
        assert_eq!(credential.expires_at.map(|at| at.year()), Some(2030));
        assert!(parse_assume_role_response("<Error><Code>AccessDenied</Code></Error>").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn refreshes_only_inside_the_window() -> Result<()> {
        let slot: CredentialSlot = Arc::new(RwLock::new(None));
        let fresh = CountingSource {
            calls: AtomicUsize::new(0),
            expires_in: time::Duration::hours(1),
        };
        assert!(refresh_if_needed(&fresh, &slot).await?);
        assert!(!refresh_if_needed(&fresh, &slot).await?);
        assert_eq!(fresh.calls.load(Ordering::SeqCst), 1);

        let expiring = CountingSource {
            calls: AtomicUsize::new(0),
            expires_in: time::Duration::minutes(2),
        };
        assert!(refresh_if_needed(&expiring, &slot).await?);
        assert!(refresh_if_needed(&expiring, &slot).await?);
        assert_eq!(expiring.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_stops_when_guard_drops() -> Result<()> {
        let slot: CredentialSlot = Arc::new(RwLock::new(None));
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            expires_in: time::Duration::minutes(1),
        });
        let shutdown = CancellationToken::new();
        let guard = spawn_refresh_loop(
            source.clone(),
            slot.clone(),
            Duration::from_secs(60),
            &shutdown,
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(source.calls.load(Ordering::SeqCst) >= 1);
        assert!(slot.read().expect("lock").is_some());

        drop(guard);
        tokio::task::yield_now().await;
        let calls = source.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), calls);
        assert!(!shutdown.is_cancelled());
        Ok(())
    }
}
