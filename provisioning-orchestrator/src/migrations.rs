use sqlx::{Pool, Postgres};
use tracing::info;

/// Idempotent inline schema. Statements run in order; each one is safe to re-run.
const SCHEMA: &[&str] = &[
    // CREATE TYPE has no IF NOT EXISTS.
    r#"DO $$ BEGIN
        CREATE TYPE provider_type AS ENUM ('aws', 'gcp', 'azure', 'noop', 'unknown');
    EXCEPTION WHEN duplicate_object THEN NULL;
    END $$"#,
    r#"CREATE TABLE IF NOT EXISTS reservations (
        id BIGSERIAL PRIMARY KEY,
        account_id BIGINT NOT NULL,
        provider provider_type NOT NULL,
        status TEXT NOT NULL,
        step BIGINT NOT NULL DEFAULT 0 CHECK (step >= 0),
        success BOOLEAN,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        CHECK ((success IS NOT NULL AND NOT success) = (error IS NOT NULL))
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_reservations_account_created
        ON reservations (account_id, created_at, id)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_reservations_pending
        ON reservations (COALESCE(updated_at, created_at)) WHERE success IS NULL"#,
    r#"CREATE TABLE IF NOT EXISTS noop_reservation_details (
        reservation_id BIGINT PRIMARY KEY REFERENCES reservations(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS aws_reservation_details (
        reservation_id BIGINT PRIMARY KEY REFERENCES reservations(id) ON DELETE CASCADE,
        launch JSONB NOT NULL,
        aws_reservation_id TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS gcp_reservation_details (
        reservation_id BIGINT PRIMARY KEY REFERENCES reservations(id) ON DELETE CASCADE,
        launch JSONB NOT NULL,
        gcp_operation_name TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS reservation_instances (
        id BIGSERIAL PRIMARY KEY,
        reservation_id BIGINT NOT NULL REFERENCES reservations(id) ON DELETE CASCADE,
        instance_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_reservation_instances_reservation
        ON reservation_instances (reservation_id, id)"#,
    r#"CREATE TABLE IF NOT EXISTS reservation_state_history (
        id BIGSERIAL PRIMARY KEY,
        reservation_id BIGINT NOT NULL REFERENCES reservations(id) ON DELETE CASCADE,
        status TEXT NOT NULL,
        step BIGINT NOT NULL,
        success BOOLEAN,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_reservation_state_history_reservation
        ON reservation_state_history (reservation_id, id)"#,
    r#"CREATE TABLE IF NOT EXISTS accounts (
        id BIGSERIAL PRIMARY KEY,
        org_id TEXT UNIQUE,
        account_number TEXT UNIQUE,
        CHECK (org_id IS NOT NULL OR account_number IS NOT NULL)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS pubkeys (
        id BIGSERIAL PRIMARY KEY,
        account_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        body TEXT NOT NULL,
        UNIQUE (account_id, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS pubkey_resources (
        id BIGSERIAL PRIMARY KEY,
        pubkey_id BIGINT NOT NULL REFERENCES pubkeys(id) ON DELETE CASCADE,
        provider provider_type NOT NULL,
        handle TEXT NOT NULL,
        tag TEXT NOT NULL,
        UNIQUE (pubkey_id, provider)
    )"#,
];

pub async fn run_inline_migrations(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    info!(statements = SCHEMA.len(), "running inline migrations");
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("schema up to date");
    Ok(())
}
