use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use provisioning_common::ProviderType;
use reqwest::Client;
use std::time::Duration;

use crate::azure::AzureClient;
use crate::gcp::GcpClient;
use crate::sources::Authentication;
use crate::{aws, ProbeFactory, StatusProbe};

/// Builds real provider clients from resolved credentials.
pub struct ProviderClients {
    http: Client,
    aws_default_region: String,
}

impl ProviderClients {
    pub fn new(aws_default_region: impl Into<String>) -> Result<Self> {
        // Default reqwest client has no overall timeout; a stalled provider would hang the probe.
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            http,
            aws_default_region: aws_default_region.into(),
        })
    }

    pub fn gcp(&self, auth: &Authentication) -> Result<GcpClient> {
        GcpClient::new(self.http.clone(), auth)
    }

    /// GCP client able to list the machine types offered in `zone`.
    pub fn gcp_in_zone(&self, auth: &Authentication, zone: &str) -> Result<GcpClient> {
        Ok(self.gcp(auth)?.in_zone(zone))
    }

    #[cfg(feature = "aws")]
    pub async fn ec2(&self, auth: &Authentication, region: Option<&str>) -> Result<aws::Ec2Client> {
        let arn = aws::role_arn(auth)?;
        aws::Ec2Client::assume_role(arn, region.unwrap_or(&self.aws_default_region)).await
    }

    #[cfg(feature = "aws")]
    async fn aws_probe(&self, auth: &Authentication) -> Result<Box<dyn StatusProbe>> {
        Ok(Box::new(self.ec2(auth, None).await?))
    }

    #[cfg(not(feature = "aws"))]
    async fn aws_probe(&self, auth: &Authentication) -> Result<Box<dyn StatusProbe>> {
        aws::role_arn(auth)?;
        bail!(
            "AWS support is not compiled in (region {}); enable the `aws` feature",
            self.aws_default_region
        )
    }
}

#[async_trait]
impl ProbeFactory for ProviderClients {
    async fn probe(&self, auth: &Authentication) -> Result<Box<dyn StatusProbe>> {
        match auth.provider {
            ProviderType::Aws => self.aws_probe(auth).await,
            ProviderType::Gcp => Ok(Box::new(self.gcp(auth)?)),
            ProviderType::Azure => Ok(Box::new(AzureClient::new(self.http.clone(), auth)?)),
            other => bail!("provider {other} has no status capability"),
        }
    }
}
