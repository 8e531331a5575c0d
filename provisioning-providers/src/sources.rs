use async_trait::async_trait;
use provisioning_common::{Error, ProviderType};
use std::fmt;
use thiserror::Error;

/// Credential set resolved from the sources registry.
#[derive(Clone)]
pub struct Authentication {
    pub source_id: String,
    pub provider: ProviderType,
    /// Role ARN for AWS, JSON service credentials for GCP and Azure.
    pub payload: String,
}

impl Authentication {
    pub fn new(source_id: impl Into<String>, provider: ProviderType, payload: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            provider,
            payload: payload.into(),
        }
    }

    /// Builds an authentication from the registry's raw provider name, rejecting names
    /// that do not map to a known provider.
    pub fn from_sources(
        source_id: impl Into<String>,
        provider_name: &str,
        payload: impl Into<String>,
    ) -> Result<Self, Error> {
        let provider = provider_name.parse::<ProviderType>()?;
        Ok(Self::new(source_id, provider, payload))
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authentication")
            .field("source_id", &self.source_id)
            .field("provider", &self.provider)
            .field("payload", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum SourcesError {
    #[error("application not found for source {0}")]
    ApplicationNotFound(String),

    #[error("authentication not found for source {0}")]
    AuthenticationNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<SourcesError> for Error {
    fn from(err: SourcesError) -> Self {
        match err {
            SourcesError::ApplicationNotFound(_) | SourcesError::AuthenticationNotFound(_) => {
                Error::not_found(format!("sources: {err}"))
            }
            SourcesError::Other(source) => Error::upstream("sources", source),
        }
    }
}

/// Credential-resolution collaborator (the external sources registry).
#[async_trait]
pub trait SourcesClient: Send + Sync {
    async fn get_authentication(
        &self,
        account_id: i64,
        source_id: &str,
    ) -> Result<Authentication, SourcesError>;
}
