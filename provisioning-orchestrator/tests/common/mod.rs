// Shared fixtures for Postgres-backed tests.
#![allow(dead_code)]

use provisioning_common::LaunchRequest;
use provisioning_orchestrator::{migrations, PgReservationDao, ReservationService};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

static MIGRATED: OnceCell<()> = OnceCell::const_new();
static NEXT_ACCOUNT: AtomicI64 = AtomicI64::new(0);

/// Pool on the test database, or `None` when `TEST_DATABASE_URL` is unset.
///
/// Every `#[tokio::test]` owns its runtime, so pools are per test; only the schema
/// setup is shared.
pub async fn get_test_db_pool() -> Option<Pool<Postgres>> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to create test database pool");

    MIGRATED
        .get_or_init(|| async {
            migrations::run_inline_migrations(&pool)
                .await
                .expect("Failed to run migrations on test database");
        })
        .await;

    Some(pool)
}

/// Service over the test database; `None` skips the calling test.
pub async fn pg_service() -> Option<ReservationService> {
    let pool = get_test_db_pool().await?;
    Some(ReservationService::new(Arc::new(PgReservationDao::new(pool))))
}

/// Account id no earlier run has used, so tests never see each other's rows.
pub fn fresh_account() -> i64 {
    let base = chrono::Utc::now().timestamp_micros();
    base * 100 + NEXT_ACCOUNT.fetch_add(1, Ordering::SeqCst) % 100
}

pub fn launch(region: &str) -> LaunchRequest {
    LaunchRequest {
        source_id: "42".to_string(),
        region: region.to_string(),
        instance_type: "t3.medium".to_string(),
        amount: 2,
        image_id: "ami-0c55b159cbfafe1f0".to_string(),
        name: Some("integration".to_string()),
        power_off: false,
    }
}
