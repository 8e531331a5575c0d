// Integration tests for the Postgres reservation repository.
// Skipped unless TEST_DATABASE_URL points at a disposable database.
mod common;

use common::{fresh_account, get_test_db_pool, launch, pg_service};
use futures_util::future::join_all;
use provisioning_common::{Error, ProviderType, ReservationDetail, ReservationState, INITIAL_STATUS};
use provisioning_orchestrator::watch_dog_job::fail_stale_reservations;

macro_rules! service_or_skip {
    () => {
        match pg_service().await {
            Some(svc) => svc,
            None => {
                eprintln!("TEST_DATABASE_URL not set, skipping");
                return;
            }
        }
    };
}

#[tokio::test]
async fn test_create_each_variant() {
    let svc = service_or_skip!();
    let account = fresh_account();

    let noop = svc.create_noop(account).await.unwrap();
    let aws = svc.create_aws(account, launch("us-east-1")).await.unwrap();
    let gcp = svc.create_gcp(account, launch("europe-west4-a")).await.unwrap();

    for r in [&noop, &aws, &gcp] {
        assert_eq!(r.account_id, account);
        assert_eq!(r.step, 0);
        assert_eq!(r.status, INITIAL_STATUS);
        assert_eq!(r.state(), ReservationState::Created);
    }
    assert_eq!(noop.detail, ReservationDetail::Noop);
    assert_eq!(aws.provider, ProviderType::Aws);

    let fetched = svc.get_aws(account, aws.id).await.unwrap();
    assert_eq!(fetched.detail.launch, launch("us-east-1"));
    assert_eq!(fetched.detail.aws_reservation_id, None);

    let fetched = svc.get_gcp(account, gcp.id).await.unwrap();
    assert_eq!(fetched.detail.launch.region, "europe-west4-a");
    assert!(svc.get_aws(account, gcp.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_concurrent_progress_is_summed() {
    let svc = service_or_skip!();
    let account = fresh_account();
    let id = svc.create_noop(account).await.unwrap().id;

    let updates = (1..=20u32).map(|delta| {
        let svc = svc.clone();
        tokio::spawn(async move { svc.record_progress(id, "Launching", delta).await })
    });
    for joined in join_all(updates).await {
        joined.unwrap().unwrap();
    }

    let r = svc.get(account, id).await.unwrap();
    assert_eq!(r.step, 210);
    assert_eq!(r.state(), ReservationState::InProgress);
}

#[tokio::test]
async fn test_finished_reservation_is_write_once() {
    let svc = service_or_skip!();
    let account = fresh_account();
    let id = svc.create_noop(account).await.unwrap().id;

    svc.record_progress(id, "Launching", 1).await.unwrap();
    svc.succeed(id).await.unwrap();

    assert!(matches!(
        svc.record_progress(id, "Late", 3).await,
        Err(Error::AlreadyFinished(_))
    ));
    assert!(matches!(svc.fail(id, "late").await, Err(Error::AlreadyFinished(_))));

    let r = svc.get(account, id).await.unwrap();
    assert_eq!(r.success, Some(true));
    assert_eq!(r.error, None);
    assert_eq!(r.step, 1);
    assert!(r.finished_at.is_some());
}

#[tokio::test]
async fn test_failure_message_is_stored() {
    let svc = service_or_skip!();
    let account = fresh_account();
    let id = svc.create_gcp(account, launch("us-central1-a")).await.unwrap().id;

    svc.attach_gcp_operation_name(id, "operation-1700000000000-abc")
        .await
        .unwrap();
    svc.fail(id, "QUOTA_EXCEEDED").await.unwrap();

    let r = svc.get_gcp(account, id).await.unwrap();
    assert_eq!(r.state(), ReservationState::Failed);
    assert_eq!(r.error.as_deref(), Some("QUOTA_EXCEEDED"));
    assert_eq!(
        r.detail.gcp_operation_name.as_deref(),
        Some("operation-1700000000000-abc")
    );
}

#[tokio::test]
async fn test_other_account_gets_not_found() {
    let svc = service_or_skip!();
    let owner = fresh_account();
    let other = fresh_account();
    let id = svc.create_aws(owner, launch("us-east-2")).await.unwrap().id;

    assert!(matches!(svc.get(other, id).await, Err(Error::NotFound(_))));
    assert!(svc.list(other, 100, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_orders_by_creation() {
    let svc = service_or_skip!();
    let account = fresh_account();
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(svc.create_noop(account).await.unwrap().id);
    }

    let all: Vec<i64> = svc.list(account, 10, 0).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(all, ids);
    let page: Vec<i64> = svc.list(account, 2, 1).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(page, ids[1..3]);
}

#[tokio::test]
async fn test_delete_cascades() {
    let svc = service_or_skip!();
    let account = fresh_account();
    let id = svc.create_aws(account, launch("us-west-2")).await.unwrap().id;
    svc.attach_aws_reservation_id(id, "r-0123456789abcdef0").await.unwrap();
    svc.record_instance(id, "i-0aaa").await.unwrap();
    svc.record_instance(id, "i-0bbb").await.unwrap();
    svc.record_progress(id, "Launched", 2).await.unwrap();

    let instances = svc.list_instances(id, 10, 0).await.unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].instance_id, "i-0aaa");

    svc.delete(id).await.unwrap();
    assert!(svc.get(account, id).await.unwrap_err().is_not_found());
    assert!(svc.list_instances(id, 10, 0).await.unwrap().is_empty());

    let pool = get_test_db_pool().await.unwrap();
    let leftovers: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM aws_reservation_details WHERE reservation_id = $1)
              + (SELECT COUNT(*) FROM reservation_state_history WHERE reservation_id = $1)",
    )
    .bind(id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(leftovers, 0);

    assert!(matches!(
        svc.delete(id).await,
        Err(Error::MismatchAffected { affected: 0, .. })
    ));
}

#[tokio::test]
async fn test_missing_reservation_mutations() {
    let svc = service_or_skip!();
    let missing = i64::MAX - 7;

    assert!(matches!(
        svc.record_progress(missing, "Launching", 1).await,
        Err(Error::MismatchAffected { .. })
    ));
    assert!(svc.succeed(missing).await.unwrap_err().is_not_found());
    assert!(svc.record_instance(missing, "i-0ccc").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_state_history_is_recorded() {
    let svc = service_or_skip!();
    let account = fresh_account();
    let id = svc.create_noop(account).await.unwrap().id;
    svc.record_progress(id, "Launching", 1).await.unwrap();
    svc.record_progress(id, "Waiting", 1).await.unwrap();
    svc.succeed(id).await.unwrap();

    let pool = get_test_db_pool().await.unwrap();
    let history: Vec<(String, i64, Option<bool>)> = sqlx::query_as(
        "SELECT status, step, success FROM reservation_state_history
         WHERE reservation_id = $1 ORDER BY id",
    )
    .bind(id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(
        history,
        vec![
            (INITIAL_STATUS.to_string(), 0, None),
            ("Launching".to_string(), 1, None),
            ("Waiting".to_string(), 2, None),
            ("Waiting".to_string(), 2, Some(true)),
        ]
    );
}

#[tokio::test]
async fn test_watchdog_fails_idle_reservations() {
    let svc = service_or_skip!();
    let account = fresh_account();
    let idle = svc.create_noop(account).await.unwrap().id;
    let done = svc.create_noop(account).await.unwrap().id;
    svc.succeed(done).await.unwrap();

    // Other tests share the database: age this row instead of moving the cutoff
    // past everyone's pending reservations.
    let pool = get_test_db_pool().await.unwrap();
    sqlx::query("UPDATE reservations SET created_at = NOW() - INTERVAL '1 day' WHERE id = $1")
        .bind(idle)
        .execute(&pool)
        .await
        .unwrap();

    let cutoff = chrono::Utc::now() - chrono::Duration::hours(1);
    let mut rounds = 0;
    while !svc.get(account, idle).await.unwrap().is_finished() && rounds < 20 {
        fail_stale_reservations(&svc, cutoff, "timed out").await.unwrap();
        rounds += 1;
    }

    let r = svc.get(account, idle).await.unwrap();
    assert_eq!(r.state(), ReservationState::Failed);
    assert_eq!(r.error.as_deref(), Some("timed out"));
    assert_eq!(
        svc.get(account, done).await.unwrap().state(),
        ReservationState::Succeeded
    );
}

#[tokio::test]
async fn test_watchdog_spares_reservations_that_moved_on() {
    let svc = service_or_skip!();
    let account = fresh_account();
    let idle = svc.create_noop(account).await.unwrap().id;
    let busy = svc.create_noop(account).await.unwrap().id;

    // Database clock, so the cutoff is ordered against created_at/updated_at.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let pool = get_test_db_pool().await.unwrap();
    let cutoff: chrono::DateTime<chrono::Utc> = sqlx::query_scalar("SELECT NOW()")
        .fetch_one(&pool)
        .await
        .unwrap();

    // The worker reports in between the listing and the timeout.
    svc.record_progress(busy, "Launching", 1).await.unwrap();

    assert!(svc.fail_if_stale(idle, cutoff, "timed out").await.unwrap());
    assert!(!svc.fail_if_stale(busy, cutoff, "timed out").await.unwrap());
    assert!(!svc.fail_if_stale(idle, cutoff, "again").await.unwrap());

    let r = svc.get(account, busy).await.unwrap();
    assert_eq!(r.state(), ReservationState::InProgress);
    assert_eq!(r.error, None);
    let r = svc.get(account, idle).await.unwrap();
    assert_eq!(r.error.as_deref(), Some("timed out"));
}

#[tokio::test]
async fn test_racing_finishers_have_one_winner() {
    let svc = service_or_skip!();
    let account = fresh_account();
    let id = svc.create_noop(account).await.unwrap().id;

    let attempts = (0..10).map(|i| {
        let svc = svc.clone();
        tokio::spawn(async move {
            if i % 2 == 0 {
                svc.succeed(id).await
            } else {
                svc.fail(id, "lost the race").await
            }
        })
    });
    let outcomes: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .filter_map(|o| o.as_ref().err())
        .all(|e| matches!(e, Error::AlreadyFinished(_))));

    let r = svc.get(account, id).await.unwrap();
    assert!(r.is_finished());
    let finishes: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM reservation_state_history
         WHERE reservation_id = $1 AND success IS NOT NULL",
    )
    .bind(id)
    .fetch_one(&get_test_db_pool().await.unwrap())
    .await
    .unwrap();
    assert_eq!(finishes, 1);
}
