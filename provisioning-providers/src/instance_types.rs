use async_trait::async_trait;
use provisioning_common::supported_types::SupportedTypes;
use provisioning_common::{Architecture, Error, InstanceType, ProviderType, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

// Stands in for the name in errors about a descriptor that has none.
const UNNAMED: &str = "<unnamed>";

/// Provider-native machine type descriptor.
pub trait NativeInstanceType {
    /// `None` when the provider omitted the name.
    fn type_name(&self) -> Option<&str>;

    /// Raw architecture tags in declaration order.
    fn architecture_tags(&self) -> Vec<String>;

    fn vcpus(&self) -> Option<i32>;

    fn cores(&self) -> Option<i32>;

    fn memory_mib(&self) -> Option<i64>;

    /// `None` when the type has no instance-local storage.
    fn local_storage_gb(&self) -> Option<i64>;
}

/// Provider read API returning its native machine type list in one logical call.
#[async_trait]
pub trait InstanceTypeSource: Send + Sync {
    type Native: NativeInstanceType + Send;

    fn provider(&self) -> ProviderType;

    async fn fetch_instance_types(&self) -> anyhow::Result<Vec<Self::Native>>;
}

fn required<T>(instance_type: &str, field: &'static str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| Error::MissingField {
        instance_type: instance_type.to_string(),
        field,
    })
}

/// Expands native descriptors into one normalized record per (type, architecture).
///
/// An unmapped architecture aborts the whole batch; nothing is returned for the
/// descriptors that did map.
pub fn normalize<T: NativeInstanceType>(
    native: &[T],
    supported: &SupportedTypes,
) -> Result<Vec<InstanceType>> {
    let mut list = Vec::with_capacity(native.len());
    for it in native {
        let name = required(UNNAMED, "name", it.type_name().filter(|n| !n.is_empty()))?;
        let tags = it.architecture_tags();
        if tags.is_empty() {
            return Err(Error::MissingField {
                instance_type: name.to_string(),
                field: "architectures",
            });
        }
        let vcpus = required(name, "vcpus", it.vcpus())?;
        let cores = required(name, "cores", it.cores())?;
        let memory_mib = required(name, "memory", it.memory_mib())?;
        let is_supported = supported.is_supported(name);

        for tag in &tags {
            list.push(InstanceType {
                name: name.to_string(),
                vcpus,
                cores,
                memory_mib,
                architecture: Architecture::from_provider_tag(tag)?,
                ephemeral_storage_gb: it.local_storage_gb().unwrap_or(0),
                supported: is_supported,
            });
        }
    }
    Ok(list)
}

/// Fetches and normalizes a provider catalog. Cancelling `cancel` abandons the
/// fetch with `Cancelled`.
pub async fn list_instance_types<S: InstanceTypeSource>(
    source: &S,
    supported: &SupportedTypes,
    cancel: &CancellationToken,
) -> Result<Vec<InstanceType>> {
    let provider = source.provider();
    let native = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        res = source.fetch_instance_types() => {
            res.map_err(|e| Error::upstream(format!("{provider} list instance types"), e))?
        }
    };
    let list = normalize(&native, supported)?;
    debug!(%provider, native = native.len(), normalized = list.len(), "instance types listed");
    Ok(list)
}
