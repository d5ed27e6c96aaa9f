//! Backend authentication.
//!
//! Each backend with an `auth` block gets one handler, built when the config
//! snapshot is loaded. Handlers are shared by every exchange routed to the
//! backend and only ever produce header mutations.

mod api_key;
mod aws;
mod azure;
mod federated;
mod gcp;
mod oauth;
pub mod sigv4;

use std::fmt::Debug;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::BackendAuth;
use crate::protocol::HeaderMutation;

pub use api_key::ApiKeyHandler;
pub use aws::{AwsSigningHandler, CredentialSlot, parse_credentials_file};
pub use azure::AzureTokenHandler;
pub use federated::{CredentialSource, StsWebIdentitySource, spawn_refresh_loop};
pub use gcp::GcpTokenHandler;
pub use oauth::OidcClientCredentials;
pub use sigv4::{AwsCredential, SigV4Signer, SigV4Timestamp, SignedRequest};

/// The outgoing request as the backend will see it.
#[derive(Clone, Copy, Debug)]
pub struct SignableRequest<'a> {
    pub method: &'a str,
    /// Backend path including the query string.
    pub path: &'a str,
    pub body: &'a [u8],
}

pub trait BackendAuthHandler: Send + Sync + Debug {
    fn apply(&self, request: &SignableRequest<'_>) -> Result<HeaderMutation>;
}

/// Resolves the handler for one backend. Static material is read here and a
/// failure is a config error; federated credentials refresh in the
/// background until `shutdown` fires or the handler is dropped.
pub async fn build_auth_handler(
    backend_name: &str,
    auth: &BackendAuth,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn BackendAuthHandler>> {
    let handler: Arc<dyn BackendAuthHandler> = match auth {
        BackendAuth::ApiKey(config) => Arc::new(ApiKeyHandler::from_file(&config.filename).await?),
        BackendAuth::AzureAccessToken(config) => {
            Arc::new(AzureTokenHandler::from_file(&config.filename).await?)
        }
        BackendAuth::AwsCredentials(config) => {
            Arc::new(AwsSigningHandler::from_credentials_file(config).await?)
        }
        BackendAuth::AwsOidcExchange(config) => {
            Arc::new(AwsSigningHandler::federated(backend_name, config, shutdown).await?)
        }
        BackendAuth::GcpCredentials(config) => Arc::new(GcpTokenHandler::from_config(config).await?),
    };
    Ok(handler)
}
