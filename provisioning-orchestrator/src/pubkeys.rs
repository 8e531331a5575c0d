//! Tenant SSH keys and their per-provider imports.

use provisioning_common::{Error, ProviderType, Pubkey, PubkeyResource, Result};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dao::PubkeyDao;

/// Page size of `list` when the caller does not page.
pub const DEFAULT_PAGE: i64 = 100;

#[derive(Clone)]
pub struct PubkeyService {
    dao: Arc<dyn PubkeyDao>,
    cancel: CancellationToken,
}

impl PubkeyService {
    pub fn new(dao: Arc<dyn PubkeyDao>) -> Self {
        Self {
            dao,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            dao: Arc::clone(&self.dao),
            cancel,
        }
    }

    async fn run<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = op => res,
        }
    }

    pub async fn create(&self, account_id: i64, name: &str, body: &str) -> Result<Pubkey> {
        let pubkey = self.run(self.dao.create(account_id, name, body)).await?;
        info!(pubkey_id = pubkey.id, account_id, "pubkey created");
        Ok(pubkey)
    }

    pub async fn list(&self, account_id: i64) -> Result<Vec<Pubkey>> {
        self.run(self.dao.list(account_id, DEFAULT_PAGE, 0)).await
    }

    pub async fn get(&self, account_id: i64, id: i64) -> Result<Pubkey> {
        self.run(self.dao.get_by_id(account_id, id)).await
    }

    pub async fn update(&self, account_id: i64, pubkey: &Pubkey) -> Result<()> {
        self.run(self.dao.update(account_id, pubkey)).await
    }

    /// A key that is missing or owned by another account is `NotFound`.
    pub async fn delete(&self, account_id: i64, id: i64) -> Result<()> {
        match self.run(self.dao.delete(account_id, id)).await {
            Ok(()) => {
                info!(pubkey_id = id, account_id, "pubkey deleted");
                Ok(())
            }
            Err(Error::MismatchAffected { .. }) => Err(Error::not_found(format!("pubkey {id}"))),
            Err(e) => Err(e),
        }
    }

    /// Records that the key was imported into `provider` under `handle`.
    pub async fn record_import(
        &self,
        account_id: i64,
        pubkey_id: i64,
        provider: ProviderType,
        handle: &str,
        tag: &str,
    ) -> Result<PubkeyResource> {
        // Ownership check first; the resource table itself is unscoped.
        self.get(account_id, pubkey_id).await?;
        let resource = self
            .run(self.dao.unscoped_create_resource(pubkey_id, provider, handle, tag))
            .await?;
        debug!(pubkey_id, %provider, handle, "pubkey import recorded");
        Ok(resource)
    }

    /// Import of the key into `provider`, `NotFound` when it was never imported there.
    pub async fn import_for(
        &self,
        account_id: i64,
        pubkey_id: i64,
        provider: ProviderType,
    ) -> Result<PubkeyResource> {
        self.get(account_id, pubkey_id).await?;
        self.run(self.dao.unscoped_get_resource_by_provider(pubkey_id, provider))
            .await
    }

    pub async fn imports(&self, account_id: i64, pubkey_id: i64) -> Result<Vec<PubkeyResource>> {
        self.get(account_id, pubkey_id).await?;
        self.run(self.dao.unscoped_list_resources(pubkey_id)).await
    }

    pub async fn forget_import(&self, account_id: i64, pubkey_id: i64, provider: ProviderType) -> Result<()> {
        let resource = self.import_for(account_id, pubkey_id, provider).await?;
        self.run(self.dao.unscoped_delete_resource(resource.id)).await?;
        debug!(pubkey_id, %provider, "pubkey import forgotten");
        Ok(())
    }
}
