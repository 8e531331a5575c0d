use provisioning_common::{Error, Result};
use provisioning_providers::{check_status, ProbeFactory, SourcesClient};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Checks that the credentials registered for `source_id` still grant access to the
/// provider account. Resolution failures keep their not-found classification so the
/// transport layer can answer 404; everything else is an internal error.
pub async fn sources_status(
    sources: &dyn SourcesClient,
    probes: &dyn ProbeFactory,
    account_id: i64,
    source_id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let auth = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        resolved = sources.get_authentication(account_id, source_id) => resolved?,
    };

    check_status(probes, &auth, cancel).await?;
    info!(account_id, source_id, provider = %auth.provider, "source status ok");
    Ok(())
}
