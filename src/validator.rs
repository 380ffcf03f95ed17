//! Credential validation against the external identity service

use crate::config::AuthConfig;
use crate::tenant::TenantId;
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

/// Why a credential could not be confirmed
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The identity service answered and said no
    #[error("credential rejected (status {0})")]
    Unauthorized(u16),
    /// The identity service could not give an answer
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Confirms that a credential is currently valid.
///
/// Implementations must not cache results: a revoked credential has to be
/// rejected on the very next request.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, credential: &str) -> Result<TenantId, ValidationError>;
}

/// Validator that asks an HTTP identity endpoint on every call.
///
/// The credential is sent as a bearer token with an empty JSON body.
pub struct HttpCredentialValidator {
    client: reqwest::Client,
    url: String,
}

impl HttpCredentialValidator {
    pub fn new(config: &AuthConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.identity_timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create identity HTTP client: {}", e))?;

        Ok(Self {
            client,
            url: config.identity_url.clone(),
        })
    }
}

#[async_trait]
impl CredentialValidator for HttpCredentialValidator {
    async fn validate(&self, credential: &str) -> Result<TenantId, ValidationError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(credential)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| {
                warn!(url = %self.url, error = %e, "Identity service request failed");
                ValidationError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        classify_status(status)?;

        let tenant = TenantId::from_credential(credential);
        debug!(tenant = %tenant, "Credential validated");
        Ok(tenant)
    }
}

/// Map an identity service status onto the validation outcome.
///
/// 2xx accepts, any other 4xx rejects the credential, everything else means
/// the service itself is unhealthy.
fn classify_status(status: StatusCode) -> Result<(), ValidationError> {
    if status.is_success() {
        Ok(())
    } else if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        Err(ValidationError::Unauthorized(status.as_u16()))
    } else {
        Err(ValidationError::Unavailable(format!(
            "identity service returned {}",
            status
        )))
    }
}
