use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisioning_common::{
    Account, AwsReservation, Error, GcpReservation, ProviderType, Pubkey, PubkeyResource,
    Reservation, ReservationDetail, ReservationInstance, Result, INITIAL_STATUS,
};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::{identity_part, AccountDao, PubkeyDao, ReservationDao};

/// Process-local repository with the same guarantees as the Postgres one.
/// Used by unit tests and by local runs without a database.
#[derive(Default)]
pub struct MemoryReservationDao {
    store: Mutex<Store>,
}

#[derive(Default)]
struct Store {
    last_id: i64,
    // Ids grow monotonically, so key order is creation order.
    reservations: BTreeMap<i64, Reservation>,
    instances: Vec<ReservationInstance>,
}

impl Store {
    fn pending_mut(&mut self, operation: &'static str, id: i64) -> Result<&mut Reservation> {
        match self.reservations.get_mut(&id) {
            None => Err(Error::MismatchAffected {
                operation,
                expected: 1,
                affected: 0,
            }),
            Some(r) if r.is_finished() => Err(Error::AlreadyFinished(id)),
            Some(r) => Ok(r),
        }
    }

    fn scoped(&self, account_id: i64, id: i64) -> Result<&Reservation> {
        self.reservations
            .get(&id)
            .filter(|r| r.account_id == account_id)
            .ok_or_else(|| Error::not_found(format!("reservation {id}")))
    }
}

fn page<T: Clone>(items: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    items.skip(offset).take(limit).collect()
}

impl MemoryReservationDao {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReservationDao for MemoryReservationDao {
    async fn create(&self, account_id: i64, detail: ReservationDetail) -> Result<Reservation> {
        let mut store = self.store.lock().await;
        store.last_id += 1;
        let reservation = Reservation {
            id: store.last_id,
            account_id,
            provider: detail.provider(),
            status: INITIAL_STATUS.to_string(),
            step: 0,
            success: None,
            error: None,
            created_at: Utc::now(),
            updated_at: None,
            finished_at: None,
            detail,
        };
        store.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    async fn create_instance(&self, reservation_id: i64, instance_id: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        if !store.reservations.contains_key(&reservation_id) {
            return Err(Error::not_found(format!("reservation {reservation_id}")));
        }
        store.instances.push(ReservationInstance {
            reservation_id,
            instance_id: instance_id.to_string(),
        });
        Ok(())
    }

    async fn get_by_id(&self, account_id: i64, id: i64) -> Result<Reservation> {
        let store = self.store.lock().await;
        store.scoped(account_id, id).cloned()
    }

    async fn get_aws_by_id(&self, account_id: i64, id: i64) -> Result<AwsReservation> {
        self.get_by_id(account_id, id)
            .await?
            .into_aws()
            .ok_or_else(|| Error::not_found(format!("aws reservation {id}")))
    }

    async fn get_gcp_by_id(&self, account_id: i64, id: i64) -> Result<GcpReservation> {
        self.get_by_id(account_id, id)
            .await?
            .into_gcp()
            .ok_or_else(|| Error::not_found(format!("gcp reservation {id}")))
    }

    async fn list(&self, account_id: i64, limit: i64, offset: i64) -> Result<Vec<Reservation>> {
        let store = self.store.lock().await;
        let owned = store
            .reservations
            .values()
            .filter(|r| r.account_id == account_id)
            .cloned();
        Ok(page(owned, limit, offset))
    }

    async fn list_instances(
        &self,
        reservation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReservationInstance>> {
        let store = self.store.lock().await;
        let matching = store
            .instances
            .iter()
            .filter(|i| i.reservation_id == reservation_id)
            .cloned();
        Ok(page(matching, limit, offset))
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        let store = self.store.lock().await;
        let stale = store
            .reservations
            .values()
            .filter(|r| !r.is_finished() && r.updated_at.unwrap_or(r.created_at) < cutoff)
            .map(|r| r.id);
        Ok(page(stale, limit, 0))
    }

    async fn update_status(&self, id: i64, status: &str, add_steps: u32) -> Result<()> {
        let mut store = self.store.lock().await;
        let reservation = store.pending_mut("update reservation status", id)?;
        reservation.status = status.to_string();
        reservation.step += i64::from(add_steps);
        reservation.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn update_reservation_id_for_aws(&self, id: i64, aws_reservation_id: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        match store.reservations.get_mut(&id).map(|r| &mut r.detail) {
            Some(ReservationDetail::Aws(detail)) => {
                detail.aws_reservation_id = Some(aws_reservation_id.to_string());
                Ok(())
            }
            _ => Err(Error::MismatchAffected {
                operation: "update aws reservation id",
                expected: 1,
                affected: 0,
            }),
        }
    }

    async fn update_operation_name_for_gcp(&self, id: i64, operation_name: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        match store.reservations.get_mut(&id).map(|r| &mut r.detail) {
            Some(ReservationDetail::Gcp(detail)) => {
                detail.gcp_operation_name = Some(operation_name.to_string());
                Ok(())
            }
            _ => Err(Error::MismatchAffected {
                operation: "update gcp operation name",
                expected: 1,
                affected: 0,
            }),
        }
    }

    async fn finish_with_success(&self, id: i64) -> Result<()> {
        let mut store = self.store.lock().await;
        let reservation = store.pending_mut("finish reservation", id)?;
        reservation.success = Some(true);
        reservation.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn finish_with_error(&self, id: i64, message: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        let reservation = store.pending_mut("finish reservation", id)?;
        reservation.success = Some(false);
        reservation.error = Some(message.to_string());
        reservation.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn finish_stale_with_error(
        &self,
        id: i64,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<bool> {
        let mut store = self.store.lock().await;
        match store.reservations.get_mut(&id) {
            Some(r) if !r.is_finished() && r.updated_at.unwrap_or(r.created_at) < cutoff => {
                r.success = Some(false);
                r.error = Some(message.to_string());
                r.finished_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut store = self.store.lock().await;
        if store.reservations.remove(&id).is_none() {
            return Err(Error::MismatchAffected {
                operation: "delete reservation",
                expected: 1,
                affected: 0,
            });
        }
        store.instances.retain(|i| i.reservation_id != id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAccountDao {
    store: Mutex<AccountStore>,
}

#[derive(Default)]
struct AccountStore {
    last_id: i64,
    accounts: BTreeMap<i64, Account>,
}

impl AccountStore {
    fn by_org_id(&self, org_id: &str) -> Option<&Account> {
        self.accounts
            .values()
            .find(|a| a.org_id.as_deref() == Some(org_id))
    }

    fn by_account_number(&self, number: &str) -> Option<&Account> {
        self.accounts
            .values()
            .find(|a| a.account_number.as_deref() == Some(number))
    }

    fn insert(&mut self, org_id: Option<&str>, account_number: Option<&str>) -> Result<Account> {
        if org_id.is_none() && account_number.is_none() {
            return Err(Error::MissingIdentity);
        }
        if let Some(org_id) = org_id.filter(|o| self.by_org_id(o).is_some()) {
            return Err(Error::AlreadyExists(format!("account for org {org_id}")));
        }
        if let Some(number) = account_number.filter(|n| self.by_account_number(n).is_some()) {
            return Err(Error::AlreadyExists(format!("account {number}")));
        }
        self.last_id += 1;
        let account = Account {
            id: self.last_id,
            org_id: org_id.map(str::to_string),
            account_number: account_number.map(str::to_string),
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }
}

impl MemoryAccountDao {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountDao for MemoryAccountDao {
    async fn create(&self, org_id: Option<&str>, account_number: Option<&str>) -> Result<Account> {
        let mut store = self.store.lock().await;
        store.insert(identity_part(org_id), identity_part(account_number))
    }

    async fn get_by_id(&self, id: i64) -> Result<Account> {
        let store = self.store.lock().await;
        store
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("account {id}")))
    }

    async fn get_by_org_id(&self, org_id: &str) -> Result<Account> {
        let store = self.store.lock().await;
        store
            .by_org_id(org_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("account for org {org_id}")))
    }

    async fn get_by_account_number(&self, account_number: &str) -> Result<Account> {
        let store = self.store.lock().await;
        store
            .by_account_number(account_number)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("account {account_number}")))
    }

    async fn get_or_create_by_identity(
        &self,
        org_id: Option<&str>,
        account_number: Option<&str>,
    ) -> Result<Account> {
        let org_id = identity_part(org_id);
        let account_number = identity_part(account_number);
        let mut store = self.store.lock().await;
        let found = org_id
            .and_then(|o| store.by_org_id(o))
            .or_else(|| account_number.and_then(|n| store.by_account_number(n)))
            .cloned();
        match found {
            Some(account) => Ok(account),
            None => store.insert(org_id, account_number),
        }
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Account>> {
        let store = self.store.lock().await;
        Ok(page(store.accounts.values().cloned(), limit, offset))
    }
}

#[derive(Default)]
pub struct MemoryPubkeyDao {
    store: Mutex<PubkeyStore>,
}

#[derive(Default)]
struct PubkeyStore {
    last_key_id: i64,
    last_resource_id: i64,
    keys: BTreeMap<i64, Pubkey>,
    resources: BTreeMap<i64, PubkeyResource>,
}

impl PubkeyStore {
    fn name_taken(&self, account_id: i64, name: &str, except: Option<i64>) -> bool {
        self.keys
            .values()
            .any(|k| k.account_id == account_id && k.name == name && Some(k.id) != except)
    }
}

impl MemoryPubkeyDao {
    pub fn new() -> Self {
        Self::default()
    }
}

fn no_row(operation: &'static str) -> Error {
    Error::MismatchAffected {
        operation,
        expected: 1,
        affected: 0,
    }
}

#[async_trait]
impl PubkeyDao for MemoryPubkeyDao {
    async fn create(&self, account_id: i64, name: &str, body: &str) -> Result<Pubkey> {
        let mut store = self.store.lock().await;
        if store.name_taken(account_id, name, None) {
            return Err(Error::AlreadyExists(format!("pubkey {name}")));
        }
        store.last_key_id += 1;
        let pubkey = Pubkey {
            id: store.last_key_id,
            account_id,
            name: name.to_string(),
            body: body.to_string(),
        };
        store.keys.insert(pubkey.id, pubkey.clone());
        Ok(pubkey)
    }

    async fn update(&self, account_id: i64, pubkey: &Pubkey) -> Result<()> {
        let mut store = self.store.lock().await;
        if store.name_taken(account_id, &pubkey.name, Some(pubkey.id)) {
            return Err(Error::AlreadyExists(format!("pubkey {}", pubkey.name)));
        }
        match store
            .keys
            .get_mut(&pubkey.id)
            .filter(|k| k.account_id == account_id)
        {
            Some(stored) => {
                stored.name = pubkey.name.clone();
                stored.body = pubkey.body.clone();
                Ok(())
            }
            None => Err(no_row("update pubkey")),
        }
    }

    async fn get_by_id(&self, account_id: i64, id: i64) -> Result<Pubkey> {
        let store = self.store.lock().await;
        store
            .keys
            .get(&id)
            .filter(|k| k.account_id == account_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pubkey {id}")))
    }

    async fn list(&self, account_id: i64, limit: i64, offset: i64) -> Result<Vec<Pubkey>> {
        let store = self.store.lock().await;
        let owned = store
            .keys
            .values()
            .filter(|k| k.account_id == account_id)
            .cloned();
        Ok(page(owned, limit, offset))
    }

    async fn delete(&self, account_id: i64, id: i64) -> Result<()> {
        let mut store = self.store.lock().await;
        if !store.keys.get(&id).is_some_and(|k| k.account_id == account_id) {
            return Err(no_row("delete pubkey"));
        }
        store.keys.remove(&id);
        store.resources.retain(|_, r| r.pubkey_id != id);
        Ok(())
    }

    async fn unscoped_create_resource(
        &self,
        pubkey_id: i64,
        provider: ProviderType,
        handle: &str,
        tag: &str,
    ) -> Result<PubkeyResource> {
        let mut store = self.store.lock().await;
        if !store.keys.contains_key(&pubkey_id) {
            return Err(Error::not_found(format!("pubkey {pubkey_id}")));
        }
        if store
            .resources
            .values()
            .any(|r| r.pubkey_id == pubkey_id && r.provider == provider)
        {
            return Err(Error::AlreadyExists(format!(
                "pubkey {pubkey_id} resource for {provider}"
            )));
        }
        store.last_resource_id += 1;
        let resource = PubkeyResource {
            id: store.last_resource_id,
            pubkey_id,
            provider,
            handle: handle.to_string(),
            tag: tag.to_string(),
        };
        store.resources.insert(resource.id, resource.clone());
        Ok(resource)
    }

    async fn unscoped_get_resource_by_provider(
        &self,
        pubkey_id: i64,
        provider: ProviderType,
    ) -> Result<PubkeyResource> {
        let store = self.store.lock().await;
        store
            .resources
            .values()
            .find(|r| r.pubkey_id == pubkey_id && r.provider == provider)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pubkey {pubkey_id} resource for {provider}")))
    }

    async fn unscoped_list_resources(&self, pubkey_id: i64) -> Result<Vec<PubkeyResource>> {
        let store = self.store.lock().await;
        Ok(store
            .resources
            .values()
            .filter(|r| r.pubkey_id == pubkey_id)
            .cloned()
            .collect())
    }

    async fn unscoped_delete_resource(&self, id: i64) -> Result<()> {
        let mut store = self.store.lock().await;
        match store.resources.remove(&id) {
            Some(_) => Ok(()),
            None => Err(no_row("delete pubkey resource")),
        }
    }
}
