use provisioning_common::{Error, ProviderType, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sources::Authentication;
use crate::ProbeFactory;

/// Routes a credential health check to the capability of its provider.
///
/// Noop credentials pass without building a probe. Unknown providers are an error,
/// distinct from an intentional skip. Probe failures are wrapped with provider
/// context and returned as-is, without retrying.
pub async fn check_status(
    factory: &dyn ProbeFactory,
    auth: &Authentication,
    cancel: &CancellationToken,
) -> Result<()> {
    let provider = auth.provider;
    match provider {
        ProviderType::Noop => {
            debug!(source_id = %auth.source_id, "noop provider, skipping status probe");
            return Ok(());
        }
        ProviderType::Unknown => {
            return Err(Error::UnknownProvider(provider.to_string()));
        }
        ProviderType::Aws | ProviderType::Gcp | ProviderType::Azure => {}
    }

    let probe = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        built = factory.probe(auth) => {
            built.map_err(|e| Error::client_initialization(provider, e))?
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        outcome = probe.status() => outcome,
    };

    match outcome {
        Ok(()) => {
            debug!(source_id = %auth.source_id, %provider, "status probe passed");
            Ok(())
        }
        Err(e) => {
            warn!(source_id = %auth.source_id, %provider, error = %e, "status probe failed");
            Err(Error::upstream(format!("{provider} status"), e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockOutcome, MockProbeFactory};

    fn auth(provider: ProviderType) -> Authentication {
        Authentication::new("42", provider, "payload")
    }

    #[tokio::test]
    async fn noop_succeeds_without_building_a_probe() {
        let factory = MockProbeFactory::healthy();
        check_status(&factory, &auth(ProviderType::Noop), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(factory.probes_built(), 0);
        assert_eq!(factory.probes_run(), 0);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let factory = MockProbeFactory::healthy();
        let err = check_status(&factory, &auth(ProviderType::Unknown), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProvider(_)));
        assert_eq!(factory.probes_built(), 0);
    }

    #[tokio::test]
    async fn registered_providers_run_exactly_one_probe() {
        let factory = MockProbeFactory::healthy();
        for provider in [ProviderType::Aws, ProviderType::Gcp, ProviderType::Azure] {
            check_status(&factory, &auth(provider), &CancellationToken::new())
                .await
                .unwrap();
        }
        assert_eq!(factory.probes_built(), 3);
        assert_eq!(factory.probes_run(), 3);
    }

    #[tokio::test]
    async fn probe_failure_is_wrapped_with_provider() {
        let factory = MockProbeFactory::healthy()
            .with_outcome(ProviderType::Gcp, MockOutcome::Failing("403 permission denied".into()));
        let err = check_status(&factory, &auth(ProviderType::Gcp), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Upstream { context, source } => {
                assert_eq!(context, "gcp status");
                assert_eq!(source.to_string(), "403 permission denied");
            }
            other => panic!("expected upstream, got {other:?}"),
        }
        assert_eq!(factory.probes_run(), 1);
    }

    #[tokio::test]
    async fn construction_failure_is_client_initialization() {
        let factory = MockProbeFactory::healthy()
            .with_outcome(ProviderType::Azure, MockOutcome::InitFailure("bad json".into()));
        let err = check_status(&factory, &auth(ProviderType::Azure), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ClientInitialization { provider: ProviderType::Azure, .. }
        ));
        assert_eq!(factory.probes_run(), 0);
    }

    #[tokio::test]
    async fn cancelled_context_reports_cancellation() {
        let factory = MockProbeFactory::healthy();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = check_status(&factory, &auth(ProviderType::Aws), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(factory.probes_run(), 0);
    }
}
