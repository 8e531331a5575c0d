//! Repositories: reservations, accounts and pubkeys.
//!
//! Every reservation and pubkey read is scoped to an account: a row owned by another
//! account is reported as `NotFound`, never as a permission error. Mutations keyed by
//! reservation id alone are internal to the background workers and are not scoped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisioning_common::{
    Account, AwsReservation, GcpReservation, ProviderType, Pubkey, PubkeyResource, Reservation,
    ReservationDetail, ReservationInstance, Result,
};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryAccountDao, MemoryPubkeyDao, MemoryReservationDao};
pub use postgres::{PgAccountDao, PgPubkeyDao, PgReservationDao};

#[async_trait]
pub trait ReservationDao: Send + Sync {
    /// Inserts the parent row and its detail row atomically. The new reservation is
    /// pending, at step 0, with the initial status label.
    async fn create(&self, account_id: i64, detail: ReservationDetail) -> Result<Reservation>;

    async fn create_instance(&self, reservation_id: i64, instance_id: &str) -> Result<()>;

    async fn get_by_id(&self, account_id: i64, id: i64) -> Result<Reservation>;

    /// `NotFound` also when the reservation exists but is not an AWS one.
    async fn get_aws_by_id(&self, account_id: i64, id: i64) -> Result<AwsReservation>;

    async fn get_gcp_by_id(&self, account_id: i64, id: i64) -> Result<GcpReservation>;

    /// Ordered by creation time, then id.
    async fn list(&self, account_id: i64, limit: i64, offset: i64) -> Result<Vec<Reservation>>;

    async fn list_instances(
        &self,
        reservation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReservationInstance>>;

    /// Pending reservations with no progress since `cutoff`.
    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>>;

    /// Replaces the status label and adds `add_steps` to the step counter.
    /// Concurrent calls serialize; no increment is lost.
    async fn update_status(&self, id: i64, status: &str, add_steps: u32) -> Result<()>;

    async fn update_reservation_id_for_aws(&self, id: i64, aws_reservation_id: &str) -> Result<()>;

    async fn update_operation_name_for_gcp(&self, id: i64, operation_name: &str) -> Result<()>;

    async fn finish_with_success(&self, id: i64) -> Result<()>;

    async fn finish_with_error(&self, id: i64, message: &str) -> Result<()>;

    /// Fails the reservation only if it is still pending and idle since before
    /// `cutoff`, checked in the same write. `Ok(false)` when it finished, moved
    /// on, or disappeared since it was listed.
    async fn finish_stale_with_error(
        &self,
        id: i64,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<bool>;

    /// Removes the reservation together with its detail and instance rows.
    async fn delete(&self, id: i64) -> Result<()>;
}

#[async_trait]
pub trait AccountDao: Send + Sync {
    async fn create(&self, org_id: Option<&str>, account_number: Option<&str>) -> Result<Account>;

    async fn get_by_id(&self, id: i64) -> Result<Account>;

    async fn get_by_org_id(&self, org_id: &str) -> Result<Account>;

    async fn get_by_account_number(&self, account_number: &str) -> Result<Account>;

    /// Resolves the tenant behind a caller identity: by org id first, then by
    /// account number, creating the account when neither matches. Blank values
    /// count as absent; both absent is `MissingIdentity`.
    async fn get_or_create_by_identity(
        &self,
        org_id: Option<&str>,
        account_number: Option<&str>,
    ) -> Result<Account>;

    /// Ordered by id.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Account>>;
}

/// Pubkeys are scoped like reservations. The `unscoped_*` resource operations
/// are keyed by ids obtained through a scoped call.
#[async_trait]
pub trait PubkeyDao: Send + Sync {
    /// `AlreadyExists` when the account already has a key with this name.
    async fn create(&self, account_id: i64, name: &str, body: &str) -> Result<Pubkey>;

    /// Replaces name and body.
    async fn update(&self, account_id: i64, pubkey: &Pubkey) -> Result<()>;

    async fn get_by_id(&self, account_id: i64, id: i64) -> Result<Pubkey>;

    /// Ordered by id.
    async fn list(&self, account_id: i64, limit: i64, offset: i64) -> Result<Vec<Pubkey>>;

    /// Removes the key together with its provider resources.
    async fn delete(&self, account_id: i64, id: i64) -> Result<()>;

    /// `AlreadyExists` when the key is already imported into `provider`.
    async fn unscoped_create_resource(
        &self,
        pubkey_id: i64,
        provider: ProviderType,
        handle: &str,
        tag: &str,
    ) -> Result<PubkeyResource>;

    async fn unscoped_get_resource_by_provider(
        &self,
        pubkey_id: i64,
        provider: ProviderType,
    ) -> Result<PubkeyResource>;

    async fn unscoped_list_resources(&self, pubkey_id: i64) -> Result<Vec<PubkeyResource>>;

    async fn unscoped_delete_resource(&self, id: i64) -> Result<()>;
}

/// Trims and drops blank identity parts.
pub(crate) fn identity_part(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|v| !v.is_empty())
}
