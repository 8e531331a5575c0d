use provisioning_common::{Account, Error, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dao::AccountDao;

/// Tenant identity as forwarded by the gateway. Either part may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Identity {
    pub org_id: Option<String>,
    pub account_number: Option<String>,
}

/// Maps a caller identity to the account id every scoped repository call takes,
/// creating the account on first sight.
pub async fn resolve_account(
    accounts: &dyn AccountDao,
    identity: &Identity,
    cancel: &CancellationToken,
) -> Result<Account> {
    let account = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        res = accounts.get_or_create_by_identity(
            identity.org_id.as_deref(),
            identity.account_number.as_deref(),
        ) => res?,
    };
    debug!(
        account_id = account.id,
        org_id = identity.org_id.as_deref(),
        "identity resolved"
    );
    Ok(account)
}
