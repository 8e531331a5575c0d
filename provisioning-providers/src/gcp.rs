use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use provisioning_common::ProviderType;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::instance_types::{InstanceTypeSource, NativeInstanceType};
use crate::sources::Authentication;
use crate::StatusProbe;

const COMPUTE_API: &str = "https://compute.googleapis.com/compute/v1";

#[derive(Deserialize)]
pub struct GcpCredentials {
    pub project_id: String,
    pub access_token: String,
}

impl GcpCredentials {
    pub fn parse(auth: &Authentication) -> Result<Self> {
        let creds: GcpCredentials = serde_json::from_str(&auth.payload)
            .with_context(|| format!("malformed GCP credentials for source {}", auth.source_id))?;
        if creds.project_id.trim().is_empty() || creds.access_token.trim().is_empty() {
            bail!("incomplete GCP credentials for source {}", auth.source_id);
        }
        Ok(creds)
    }
}

/// Compute Engine machine type as returned by `machineTypes.list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpMachineType {
    pub name: String,
    pub guest_cpus: Option<i32>,
    /// Compute Engine reports MB meaning MiB.
    pub memory_mb: Option<i64>,
    /// `X86_64` or `ARM64`; older machine families omit it.
    #[serde(default)]
    pub architecture: Option<String>,
}

impl NativeInstanceType for GcpMachineType {
    fn type_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn architecture_tags(&self) -> Vec<String> {
        let raw = self.architecture.as_deref().unwrap_or("X86_64");
        vec![raw.to_ascii_lowercase()]
    }

    fn vcpus(&self) -> Option<i32> {
        self.guest_cpus
    }

    // Compute Engine exposes vCPUs only.
    fn cores(&self) -> Option<i32> {
        self.guest_cpus
    }

    fn memory_mib(&self) -> Option<i64> {
        self.memory_mb
    }

    fn local_storage_gb(&self) -> Option<i64> {
        None
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MachineTypeList {
    #[serde(default)]
    items: Vec<GcpMachineType>,
    next_page_token: Option<String>,
}

pub struct GcpClient {
    client: Client,
    credentials: GcpCredentials,
    zone: Option<String>,
}

impl GcpClient {
    pub fn new(client: Client, auth: &Authentication) -> Result<Self> {
        Ok(Self {
            client,
            credentials: GcpCredentials::parse(auth)?,
            zone: None,
        })
    }

    /// Zone used for listing machine types.
    pub fn in_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    fn project_url(&self) -> String {
        format!("{}/projects/{}", COMPUTE_API, self.credentials.project_id)
    }

    fn machine_types_url(&self) -> Result<String> {
        let Some(zone) = self.zone.as_deref() else {
            bail!("listing GCP machine types requires a zone");
        };
        Ok(format!("{}/zones/{}/machineTypes", self.project_url(), zone))
    }
}

#[async_trait]
impl StatusProbe for GcpClient {
    fn provider(&self) -> ProviderType {
        ProviderType::Gcp
    }

    async fn status(&self) -> Result<()> {
        let url = format!("{}/regions?maxResults=1", self.project_url());
        self.client
            .get(&url)
            .bearer_auth(&self.credentials.access_token)
            .send()
            .await
            .context("list regions")?
            .error_for_status()
            .context("list regions")?;
        Ok(())
    }
}

#[async_trait]
impl InstanceTypeSource for GcpClient {
    type Native = GcpMachineType;

    fn provider(&self) -> ProviderType {
        ProviderType::Gcp
    }

    async fn fetch_instance_types(&self) -> Result<Vec<GcpMachineType>> {
        let url = self.machine_types_url()?;

        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(&self.credentials.access_token);
            if let Some(token) = page_token.take() {
                request = request.query(&[("pageToken", token)]);
            }
            let page: MachineTypeList = request
                .send()
                .await
                .context("list machine types")?
                .error_for_status()
                .context("list machine types")?
                .json()
                .await
                .context("decode machine types")?;
            out.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(zone = ?self.zone, count = out.len(), "fetched GCP machine types");
        Ok(out)
    }
}
