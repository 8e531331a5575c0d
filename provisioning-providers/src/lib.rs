use anyhow::Result;
use async_trait::async_trait;
use provisioning_common::ProviderType;

pub mod aws;
pub mod azure;
pub mod clients;
pub mod dispatch;
pub mod gcp;
pub mod instance_types;
pub mod sources;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use clients::ProviderClients;
pub use dispatch::check_status;
pub use instance_types::{list_instance_types, normalize, InstanceTypeSource, NativeInstanceType};
pub use sources::{Authentication, SourcesClient, SourcesError};

/// Cheap read-only call proving a credential set still grants access.
///
/// Implementations perform exactly one outbound request, never mutate provider
/// state and never retry: retry policy belongs to the caller.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    fn provider(&self) -> ProviderType;

    async fn status(&self) -> Result<()>;
}

/// Builds the status probe for a resolved credential set.
///
/// Only called for providers that have a capability (AWS, GCP, Azure); dispatch
/// handles Noop and Unknown itself.
#[async_trait]
pub trait ProbeFactory: Send + Sync {
    async fn probe(&self, auth: &Authentication) -> Result<Box<dyn StatusProbe>>;
}
