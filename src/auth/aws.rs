use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, DropGuard};

use super::federated::{self, StsWebIdentitySource};
use super::oauth::OidcClientCredentials;
use super::sigv4::{AwsCredential, SigV4Signer, SigV4Timestamp};
use super::{BackendAuthHandler, SignableRequest};
use crate::config::{AwsCredentialsAuth, AwsOidcExchangeAuth};
use crate::protocol::HeaderMutation;
use crate::{ExtProcError, Result};

const BEDROCK_SERVICE: &str = "bedrock";
const DEFAULT_PROFILE: &str = "default";

/// Current credential of one backend. Writers hold the lock only to swap.
pub type CredentialSlot = Arc<RwLock<Option<AwsCredential>>>;

/// SigV4 signing for Bedrock with a static or rotating credential.
#[derive(Debug)]
pub struct AwsSigningHandler {
    signer: SigV4Signer,
    endpoint: String,
    slot: CredentialSlot,
    _refresh: Option<DropGuard>,
}

impl AwsSigningHandler {
    pub fn new(region: &str, slot: CredentialSlot) -> Result<Self> {
        Ok(Self {
            signer: SigV4Signer::new(region, BEDROCK_SERVICE)?,
            endpoint: format!("https://bedrock-runtime.{region}.amazonaws.com"),
            slot,
            _refresh: None,
        })
    }

    pub async fn from_credentials_file(config: &AwsCredentialsAuth) -> Result<Self> {
        let contents = tokio::fs::read_to_string(&config.credential_file)
            .await
            .map_err(|err| {
                ExtProcError::Config(format!(
                    "failed to read aws credential file {}: {err}",
                    config.credential_file.display()
                ))
            })?;
        let profile = config.profile.as_deref().unwrap_or(DEFAULT_PROFILE);
        let credential = parse_credentials_file(&contents, profile)?;
        Self::new(&config.region, Arc::new(RwLock::new(Some(credential))))
    }

    /// OIDC client credentials exchanged for STS web-identity credentials.
    /// The first exchange runs here; a failure is logged and left to the
    /// refresh loop.
    pub async fn federated(
        backend_name: &str,
        config: &AwsOidcExchangeAuth,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let secret = tokio::fs::read_to_string(&config.oidc.client_secret_file)
            .await
            .map_err(|err| {
                ExtProcError::Config(format!(
                    "failed to read oidc client secret {}: {err}",
                    config.oidc.client_secret_file.display()
                ))
            })?;
        let oidc = OidcClientCredentials::from_config(&config.oidc, &secret)?;

        let sts_endpoint = config
            .sts_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sts.{}.amazonaws.com/", config.region));
        let source = Arc::new(StsWebIdentitySource::new(
            reqwest::Client::new(),
            oidc,
            config.role_arn.as_str(),
            format!("ditto-extproc-{backend_name}"),
            sts_endpoint,
        ));

        let mut handler = Self::new(&config.region, Arc::new(RwLock::new(None)))?;
        if let Err(err) = federated::refresh_if_needed(source.as_ref(), &handler.slot).await {
            tracing::warn!(backend = backend_name, error = %err, "initial aws credential exchange failed");
        }
        let interval = Duration::from_secs(
            config
                .refresh_interval_secs
                .unwrap_or(federated::DEFAULT_REFRESH_INTERVAL_SECS),
        );
        handler._refresh = Some(federated::spawn_refresh_loop(
            source,
            handler.slot.clone(),
            interval,
            shutdown,
        ));
        Ok(handler)
    }

    fn current_credential(&self) -> Result<AwsCredential> {
        let guard = self
            .slot
            .read()
            .map_err(|_| ExtProcError::Credential("aws credential lock poisoned".to_string()))?;
        guard
            .clone()
            .ok_or_else(|| ExtProcError::Credential("no aws credential available yet".to_string()))
    }
}

impl BackendAuthHandler for AwsSigningHandler {
    fn apply(&self, request: &SignableRequest<'_>) -> Result<HeaderMutation> {
        let credential = self.current_credential()?;
        let url = format!("{}{}", self.endpoint, request.path);
        let signed = self.signer.sign(
            &credential,
            request.method,
            &url,
            &BTreeMap::new(),
            request.body,
            SigV4Timestamp::now()?,
        )?;
        Ok(signed.header_mutation())
    }
}

/// Reads one profile of a shared credentials INI file.
pub fn parse_credentials_file(contents: &str, profile: &str) -> Result<AwsCredential> {
    let mut section: Option<&str> = None;
    let mut values = BTreeMap::<&str, &str>::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            let name = name.trim();
            section = Some(name.strip_prefix("profile ").map(str::trim).unwrap_or(name));
            continue;
        }
        if section != Some(profile) {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim(), value.trim());
        }
    }

    let access_key_id = values.get("aws_access_key_id").copied().ok_or_else(|| {
        ExtProcError::Config(format!("profile {profile:?} has no aws_access_key_id"))
    })?;
    let secret_access_key = values.get("aws_secret_access_key").copied().ok_or_else(|| {
        ExtProcError::Config(format!("profile {profile:?} has no aws_secret_access_key"))
    })?;
    AwsCredential::new(
        access_key_id,
        secret_access_key,
        values.get("aws_session_token").map(|token| token.to_string()),
    )
    .map_err(|err| ExtProcError::Config(err.to_string()))
}
