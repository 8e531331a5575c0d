// Integration tests for the Postgres account and pubkey repositories.
// Skipped unless TEST_DATABASE_URL points at a disposable database.
mod common;

use common::{fresh_account, get_test_db_pool};
use futures_util::future::join_all;
use provisioning_common::{Error, ProviderType};
use provisioning_orchestrator::{AccountDao, PgAccountDao, PgPubkeyDao, PubkeyService};
use std::sync::Arc;

macro_rules! pool_or_skip {
    () => {
        match get_test_db_pool().await {
            Some(pool) => pool,
            None => {
                eprintln!("TEST_DATABASE_URL not set, skipping");
                return;
            }
        }
    };
}

#[tokio::test]
async fn test_identity_resolves_to_one_account() {
    let pool = pool_or_skip!();
    let dao = PgAccountDao::new(pool);
    let org = format!("org-{}", fresh_account());
    let number = format!("acct-{}", fresh_account());

    let created = dao
        .get_or_create_by_identity(Some(org.as_str()), Some(number.as_str()))
        .await
        .unwrap();
    assert_eq!(created.org_id.as_deref(), Some(org.as_str()));
    assert_eq!(created.account_number.as_deref(), Some(number.as_str()));

    let by_org = dao.get_or_create_by_identity(Some(org.as_str()), None).await.unwrap();
    let by_number = dao.get_or_create_by_identity(None, Some(number.as_str())).await.unwrap();
    assert_eq!(by_org, created);
    assert_eq!(by_number, created);
    assert_eq!(dao.get_by_id(created.id).await.unwrap(), created);

    assert!(matches!(
        dao.create(Some(org.as_str()), None).await,
        Err(Error::AlreadyExists(_))
    ));
    assert!(matches!(
        dao.get_or_create_by_identity(Some(" "), None).await,
        Err(Error::MissingIdentity)
    ));
}

#[tokio::test]
async fn test_concurrent_first_sight_creates_one_account() {
    let pool = pool_or_skip!();
    let dao = Arc::new(PgAccountDao::new(pool));
    let org = format!("org-{}", fresh_account());

    let attempts = (0..8).map(|_| {
        let dao = Arc::clone(&dao);
        let org = org.clone();
        tokio::spawn(async move { dao.get_or_create_by_identity(Some(org.as_str()), None).await })
    });
    let ids: Vec<i64> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().id)
        .collect();

    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(dao.get_by_org_id(&org).await.unwrap().id, ids[0]);
}

#[tokio::test]
async fn test_pubkey_lifecycle() {
    let pool = pool_or_skip!();
    let svc = PubkeyService::new(Arc::new(PgPubkeyDao::new(pool.clone())));
    let account = fresh_account();
    let other = fresh_account();

    let key = svc
        .create(account, "lzap", "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 lzap")
        .await
        .unwrap();
    assert!(matches!(
        svc.create(account, "lzap", "ssh-ed25519 BBBB").await,
        Err(Error::AlreadyExists(_))
    ));
    assert!(svc.get(other, key.id).await.unwrap_err().is_not_found());
    assert_eq!(svc.list(account).await.unwrap(), vec![key.clone()]);

    svc.record_import(account, key.id, ProviderType::Aws, "key-0abc", "pk-lzap")
        .await
        .unwrap();
    assert!(matches!(
        svc.record_import(account, key.id, ProviderType::Aws, "key-0def", "pk-lzap")
            .await,
        Err(Error::AlreadyExists(_))
    ));
    let found = svc.import_for(account, key.id, ProviderType::Aws).await.unwrap();
    assert_eq!(found.handle, "key-0abc");

    assert!(matches!(svc.delete(other, key.id).await, Err(Error::NotFound(_))));
    svc.delete(account, key.id).await.unwrap();
    assert!(matches!(svc.delete(account, key.id).await, Err(Error::NotFound(_))));

    let leftovers: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pubkey_resources WHERE pubkey_id = $1")
            .bind(key.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(leftovers, 0);
}
