use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use provisioning_common::ProviderType;
use reqwest::Client;
use serde::Deserialize;

use crate::sources::Authentication;
use crate::StatusProbe;

const MANAGEMENT_API: &str = "https://management.azure.com";
const RESOURCE_GROUPS_API_VERSION: &str = "2021-04-01";

#[derive(Deserialize)]
pub struct AzureCredentials {
    pub subscription_id: String,
    pub access_token: String,
}

impl AzureCredentials {
    pub fn parse(auth: &Authentication) -> Result<Self> {
        let creds: AzureCredentials = serde_json::from_str(&auth.payload)
            .with_context(|| format!("malformed Azure credentials for source {}", auth.source_id))?;
        if creds.subscription_id.trim().is_empty() || creds.access_token.trim().is_empty() {
            bail!("incomplete Azure credentials for source {}", auth.source_id);
        }
        Ok(creds)
    }
}

pub struct AzureClient {
    client: Client,
    credentials: AzureCredentials,
}

impl AzureClient {
    pub fn new(client: Client, auth: &Authentication) -> Result<Self> {
        Ok(Self {
            client,
            credentials: AzureCredentials::parse(auth)?,
        })
    }
}

#[async_trait]
impl StatusProbe for AzureClient {
    fn provider(&self) -> ProviderType {
        ProviderType::Azure
    }

    /// Lists at most one resource group of the subscription.
    async fn status(&self) -> Result<()> {
        let url = format!(
            "{}/subscriptions/{}/resourcegroups?api-version={}&%24top=1",
            MANAGEMENT_API, self.credentials.subscription_id, RESOURCE_GROUPS_API_VERSION
        );
        self.client
            .get(&url)
            .bearer_auth(&self.credentials.access_token)
            .send()
            .await
            .context("list resource groups")?
            .error_for_status()
            .context("list resource groups")?;
        Ok(())
    }
}
