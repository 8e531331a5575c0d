use anyhow::{bail, Result};
use provisioning_common::ProviderType;
use serde::{Deserialize, Serialize};

use crate::instance_types::NativeInstanceType;
use crate::sources::Authentication;

/// EC2 `InstanceTypeInfo`, reduced to the fields the normalizer reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ec2InstanceTypeInfo {
    pub instance_type: Option<String>,
    pub supported_architectures: Vec<String>,
    pub default_vcpus: Option<i32>,
    pub default_cores: Option<i32>,
    pub memory_size_mib: Option<i64>,
    /// Absent when the type has no instance store.
    pub instance_storage_total_gb: Option<i64>,
}

impl NativeInstanceType for Ec2InstanceTypeInfo {
    fn type_name(&self) -> Option<&str> {
        self.instance_type.as_deref()
    }

    fn architecture_tags(&self) -> Vec<String> {
        self.supported_architectures.clone()
    }

    fn vcpus(&self) -> Option<i32> {
        self.default_vcpus
    }

    fn cores(&self) -> Option<i32> {
        self.default_cores
    }

    fn memory_mib(&self) -> Option<i64> {
        self.memory_size_mib
    }

    fn local_storage_gb(&self) -> Option<i64> {
        self.instance_storage_total_gb
    }
}

/// Role ARN stored in the sources registry for an AWS account.
pub fn role_arn(auth: &Authentication) -> Result<&str> {
    if auth.provider != ProviderType::Aws {
        bail!("authentication for source {} is not an AWS credential", auth.source_id);
    }
    let arn = auth.payload.trim();
    let mut parts = arn.split(':');
    let well_formed = parts.next() == Some("arn")
        && parts.next().is_some_and(|p| p.starts_with("aws"))
        && parts.next() == Some("iam")
        && parts.next() == Some("")
        && parts.next().is_some_and(|account| !account.is_empty())
        && parts.next().is_some_and(|resource| resource.starts_with("role/"));
    if !well_formed {
        bail!("malformed role ARN for source {}", auth.source_id);
    }
    Ok(arn)
}

#[cfg(feature = "aws")]
pub use sdk::Ec2Client;

#[cfg(feature = "aws")]
mod sdk {
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use aws_config::sts::AssumeRoleProvider;
    use aws_config::BehaviorVersion;
    use aws_sdk_ec2::config::Region;
    use aws_sdk_ec2::types::InstanceTypeInfo;
    use provisioning_common::ProviderType;
    use tracing::debug;

    use super::Ec2InstanceTypeInfo;
    use crate::instance_types::InstanceTypeSource;
    use crate::StatusProbe;

    const SESSION_NAME: &str = "provisioning-backend";

    /// EC2 client acting in the customer account through an assumed role.
    pub struct Ec2Client {
        client: aws_sdk_ec2::Client,
    }

    impl Ec2Client {
        pub async fn assume_role(role_arn: &str, region: &str) -> Result<Self> {
            let region = Region::new(region.to_string());
            let base = aws_config::defaults(BehaviorVersion::latest())
                .region(region.clone())
                .load()
                .await;
            let credentials = AssumeRoleProvider::builder(role_arn)
                .session_name(SESSION_NAME)
                .region(region.clone())
                .configure(&base)
                .build()
                .await;
            let config = aws_sdk_ec2::config::Builder::from(&base)
                .credentials_provider(credentials)
                .region(region)
                .build();
            Ok(Self {
                client: aws_sdk_ec2::Client::from_conf(config),
            })
        }
    }

    fn from_sdk(info: &InstanceTypeInfo) -> Ec2InstanceTypeInfo {
        Ec2InstanceTypeInfo {
            instance_type: info.instance_type().map(|t| t.as_str().to_string()),
            supported_architectures: info
                .processor_info()
                .map(|p| {
                    p.supported_architectures()
                        .iter()
                        .map(|a| a.as_str().to_string())
                        .collect()
                })
                .unwrap_or_default(),
            default_vcpus: info.v_cpu_info().and_then(|v| v.default_v_cpus()),
            default_cores: info.v_cpu_info().and_then(|v| v.default_cores()),
            memory_size_mib: info.memory_info().and_then(|m| m.size_in_mib()),
            instance_storage_total_gb: info
                .instance_storage_info()
                .and_then(|s| s.total_size_in_gb()),
        }
    }

    #[async_trait]
    impl StatusProbe for Ec2Client {
        fn provider(&self) -> ProviderType {
            ProviderType::Aws
        }

        async fn status(&self) -> Result<()> {
            self.client
                .describe_key_pairs()
                .send()
                .await
                .context("describe key pairs")?;
            Ok(())
        }
    }

    #[async_trait]
    impl InstanceTypeSource for Ec2Client {
        type Native = Ec2InstanceTypeInfo;

        fn provider(&self) -> ProviderType {
            ProviderType::Aws
        }

        async fn fetch_instance_types(&self) -> Result<Vec<Ec2InstanceTypeInfo>> {
            let mut out = Vec::new();
            let mut next_token: Option<String> = None;
            loop {
                let page = self
                    .client
                    .describe_instance_types()
                    .set_next_token(next_token.take())
                    .send()
                    .await
                    .context("describe instance types")?;
                out.extend(page.instance_types().iter().map(from_sdk));
                match page.next_token() {
                    Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                    _ => break,
                }
            }
            debug!(count = out.len(), "fetched EC2 instance types");
            Ok(out)
        }
    }
}
