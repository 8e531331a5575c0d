use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisioning_common::{
    Account, AwsDetail, AwsReservation, Error, GcpDetail, GcpReservation, LaunchRequest,
    ProviderType, Pubkey, PubkeyResource, Reservation, ReservationDetail, ReservationInstance,
    Result, INITIAL_STATUS,
};
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use tracing::debug;

use super::{identity_part, AccountDao, PubkeyDao, ReservationDao};

const SELECT_RESERVATION: &str = r#"
SELECT r.id, r.account_id, r.provider, r.status, r.step, r.success, r.error,
       r.created_at, r.updated_at, r.finished_at,
       (n.reservation_id IS NOT NULL) AS has_noop_detail,
       a.launch AS aws_launch, a.aws_reservation_id,
       g.launch AS gcp_launch, g.gcp_operation_name
FROM reservations r
LEFT JOIN noop_reservation_details n ON n.reservation_id = r.id
LEFT JOIN aws_reservation_details a ON a.reservation_id = r.id
LEFT JOIN gcp_reservation_details g ON g.reservation_id = r.id
"#;

// Postgres foreign_key_violation.
const FOREIGN_KEY_VIOLATION: &str = "23503";
// Postgres unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

fn has_code(e: &sqlx::Error, code: &str) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
}

#[derive(sqlx::FromRow)]
struct ReservationRow {
    id: i64,
    account_id: i64,
    provider: ProviderType,
    status: String,
    step: i64,
    success: Option<bool>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    has_noop_detail: bool,
    aws_launch: Option<Json<LaunchRequest>>,
    aws_reservation_id: Option<String>,
    gcp_launch: Option<Json<LaunchRequest>>,
    gcp_operation_name: Option<String>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = Error;

    fn try_from(row: ReservationRow) -> Result<Self> {
        let detail = match (row.provider, row.aws_launch, row.gcp_launch) {
            (ProviderType::Noop, _, _) if row.has_noop_detail => ReservationDetail::Noop,
            (ProviderType::Aws, Some(Json(launch)), _) => ReservationDetail::Aws(AwsDetail {
                launch,
                aws_reservation_id: row.aws_reservation_id,
            }),
            (ProviderType::Gcp, _, Some(Json(launch))) => ReservationDetail::Gcp(GcpDetail {
                launch,
                gcp_operation_name: row.gcp_operation_name,
            }),
            _ => return Err(Error::MissingDetail(row.id)),
        };
        Ok(Reservation {
            id: row.id,
            account_id: row.account_id,
            provider: row.provider,
            status: row.status,
            step: row.step,
            success: row.success,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
            detail,
        })
    }
}

#[derive(Clone)]
pub struct PgReservationDao {
    db: Pool<Postgres>,
}

impl PgReservationDao {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    /// A guarded mutation touched no row: tell a finished reservation from a missing one.
    async fn classify_miss(&self, operation: &'static str, id: i64) -> Error {
        let finished: Option<bool> =
            match sqlx::query_scalar::<_, bool>("SELECT success IS NOT NULL FROM reservations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await
            {
                Ok(found) => found,
                Err(e) => return Error::storage(operation)(e),
            };
        match finished {
            Some(true) => Error::AlreadyFinished(id),
            _ => Error::MismatchAffected {
                operation,
                expected: 1,
                affected: 0,
            },
        }
    }

    async fn guarded(&self, operation: &'static str, id: i64, affected: u64) -> Result<()> {
        match affected {
            1 => Ok(()),
            0 => Err(self.classify_miss(operation, id).await),
            n => Err(Error::MismatchAffected {
                operation,
                expected: 1,
                affected: n,
            }),
        }
    }
}

fn expect_one(operation: &'static str, affected: u64) -> Result<()> {
    if affected == 1 {
        Ok(())
    } else {
        Err(Error::MismatchAffected {
            operation,
            expected: 1,
            affected,
        })
    }
}

#[async_trait]
impl ReservationDao for PgReservationDao {
    async fn create(&self, account_id: i64, detail: ReservationDetail) -> Result<Reservation> {
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(Error::storage("begin create reservation"))?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO reservations (account_id, provider, status)
             VALUES ($1, $2, $3)
             RETURNING id",
        )
        .bind(account_id)
        .bind(detail.provider())
        .bind(INITIAL_STATUS)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::storage("insert reservation"))?;

        let inserted = match &detail {
            ReservationDetail::Noop => {
                sqlx::query("INSERT INTO noop_reservation_details (reservation_id) VALUES ($1)")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
            }
            ReservationDetail::Aws(aws) => {
                sqlx::query(
                    "INSERT INTO aws_reservation_details (reservation_id, launch, aws_reservation_id)
                     VALUES ($1, $2, $3)",
                )
                .bind(id)
                .bind(Json(aws.launch.clone()))
                .bind(aws.aws_reservation_id.as_deref())
                .execute(&mut *tx)
                .await
            }
            ReservationDetail::Gcp(gcp) => {
                sqlx::query(
                    "INSERT INTO gcp_reservation_details (reservation_id, launch, gcp_operation_name)
                     VALUES ($1, $2, $3)",
                )
                .bind(id)
                .bind(Json(gcp.launch.clone()))
                .bind(gcp.gcp_operation_name.as_deref())
                .execute(&mut *tx)
                .await
            }
        };
        inserted.map_err(Error::storage("insert reservation detail"))?;

        sqlx::query(
            "INSERT INTO reservation_state_history (reservation_id, status, step)
             VALUES ($1, $2, 0)",
        )
        .bind(id)
        .bind(INITIAL_STATUS)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage("record reservation history"))?;

        let row: ReservationRow = sqlx::query_as(&format!("{SELECT_RESERVATION} WHERE r.id = $1"))
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::storage("load created reservation"))?;

        tx.commit()
            .await
            .map_err(Error::storage("commit create reservation"))?;

        debug!(reservation_id = id, account_id, "reservation row created");
        Reservation::try_from(row)
    }

    async fn create_instance(&self, reservation_id: i64, instance_id: &str) -> Result<()> {
        let res = sqlx::query(
            "INSERT INTO reservation_instances (reservation_id, instance_id) VALUES ($1, $2)",
        )
        .bind(reservation_id)
        .bind(instance_id)
        .execute(&self.db)
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if has_code(&e, FOREIGN_KEY_VIOLATION) => {
                Err(Error::not_found(format!("reservation {reservation_id}")))
            }
            Err(e) => Err(Error::storage("insert reservation instance")(e)),
        }
    }

    async fn get_by_id(&self, account_id: i64, id: i64) -> Result<Reservation> {
        let row: Option<ReservationRow> = sqlx::query_as(&format!(
            "{SELECT_RESERVATION} WHERE r.id = $1 AND r.account_id = $2"
        ))
        .bind(id)
        .bind(account_id)
        .fetch_optional(&self.db)
        .await
        .map_err(Error::storage("get reservation"))?;

        match row {
            Some(row) => Reservation::try_from(row),
            None => Err(Error::not_found(format!("reservation {id}"))),
        }
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
        let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
            "{SELECT_RESERVATION} WHERE r.account_id = $1
             ORDER BY r.created_at, r.id
             LIMIT $2 OFFSET $3"
        ))
        .bind(account_id)
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.db)
        .await
        .map_err(Error::storage("list reservations"))?;

        rows.into_iter().map(Reservation::try_from).collect()
    }

    async fn list_instances(
        &self,
        reservation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReservationInstance>> {
        sqlx::query_as(
            "SELECT reservation_id, instance_id
             FROM reservation_instances
             WHERE reservation_id = $1
             ORDER BY id
             LIMIT $2 OFFSET $3",
        )
        .bind(reservation_id)
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.db)
        .await
        .map_err(Error::storage("list reservation instances"))
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT id FROM reservations
             WHERE success IS NULL
               AND COALESCE(updated_at, created_at) < $1
             ORDER BY id
             LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit.max(0))
        .fetch_all(&self.db)
        .await
        .map_err(Error::storage("list stale reservations"))
    }

    async fn update_status(&self, id: i64, status: &str, add_steps: u32) -> Result<()> {
        // Row lock on UPDATE serializes concurrent increments; the history insert rides
        // on the same statement so both commit together.
        let res = sqlx::query(
            "WITH updated AS (
                UPDATE reservations
                SET status = $2, step = step + $3, updated_at = NOW()
                WHERE id = $1 AND success IS NULL
                RETURNING id, status, step
             )
             INSERT INTO reservation_state_history (reservation_id, status, step)
             SELECT id, status, step FROM updated",
        )
        .bind(id)
        .bind(status)
        .bind(i64::from(add_steps))
        .execute(&self.db)
        .await
        .map_err(Error::storage("update reservation status"))?;

        self.guarded("update reservation status", id, res.rows_affected())
            .await
    }

    async fn update_reservation_id_for_aws(&self, id: i64, aws_reservation_id: &str) -> Result<()> {
        let res = sqlx::query(
            "UPDATE aws_reservation_details SET aws_reservation_id = $2 WHERE reservation_id = $1",
        )
        .bind(id)
        .bind(aws_reservation_id)
        .execute(&self.db)
        .await
        .map_err(Error::storage("update aws reservation id"))?;

        expect_one("update aws reservation id", res.rows_affected())
    }

    async fn update_operation_name_for_gcp(&self, id: i64, operation_name: &str) -> Result<()> {
        let res = sqlx::query(
            "UPDATE gcp_reservation_details SET gcp_operation_name = $2 WHERE reservation_id = $1",
        )
        .bind(id)
        .bind(operation_name)
        .execute(&self.db)
        .await
        .map_err(Error::storage("update gcp operation name"))?;

        expect_one("update gcp operation name", res.rows_affected())
    }

    async fn finish_with_success(&self, id: i64) -> Result<()> {
        let res = sqlx::query(
            "WITH updated AS (
                UPDATE reservations
                SET success = TRUE, finished_at = NOW()
                WHERE id = $1 AND success IS NULL
                RETURNING id, status, step
             )
             INSERT INTO reservation_state_history (reservation_id, status, step, success)
             SELECT id, status, step, TRUE FROM updated",
        )
        .bind(id)
        .execute(&self.db)
        .await
        .map_err(Error::storage("finish reservation"))?;

        self.guarded("finish reservation", id, res.rows_affected())
            .await
    }

    async fn finish_with_error(&self, id: i64, message: &str) -> Result<()> {
        let res = sqlx::query(
            "WITH updated AS (
                UPDATE reservations
                SET success = FALSE, error = $2, finished_at = NOW()
                WHERE id = $1 AND success IS NULL
                RETURNING id, status, step, error
             )
             INSERT INTO reservation_state_history (reservation_id, status, step, success, error)
             SELECT id, status, step, FALSE, error FROM updated",
        )
        .bind(id)
        .bind(message)
        .execute(&self.db)
        .await
        .map_err(Error::storage("finish reservation"))?;

        self.guarded("finish reservation", id, res.rows_affected())
            .await
    }

    async fn finish_stale_with_error(
        &self,
        id: i64,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<bool> {
        let res = sqlx::query(
            "WITH updated AS (
                UPDATE reservations
                SET success = FALSE, error = $2, finished_at = NOW()
                WHERE id = $1 AND success IS NULL
                  AND COALESCE(updated_at, created_at) < $3
                RETURNING id, status, step, error
             )
             INSERT INTO reservation_state_history (reservation_id, status, step, success, error)
             SELECT id, status, step, FALSE, error FROM updated",
        )
        .bind(id)
        .bind(message)
        .bind(cutoff)
        .execute(&self.db)
        .await
        .map_err(Error::storage("time out reservation"))?;

        match res.rows_affected() {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(Error::MismatchAffected {
                operation: "time out reservation",
                expected: 1,
                affected: n,
            }),
        }
    }

    async fn delete(&self, id: i64) -> Result<()> {
        // Detail, instance and history rows go with ON DELETE CASCADE.
        let res = sqlx::query("DELETE FROM reservations WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(Error::storage("delete reservation"))?;

        expect_one("delete reservation", res.rows_affected())
    }
}

#[derive(Clone)]
pub struct PgAccountDao {
    db: Pool<Postgres>,
}

impl PgAccountDao {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    async fn find(&self, column: &'static str, value: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT id, org_id, account_number FROM accounts WHERE {column} = $1"
        ))
        .bind(value)
        .fetch_optional(&self.db)
        .await
        .map_err(Error::storage("get account"))
    }

    async fn lookup(&self, org_id: Option<&str>, account_number: Option<&str>) -> Result<Option<Account>> {
        if let Some(org_id) = org_id {
            if let Some(account) = self.find("org_id", org_id).await? {
                return Ok(Some(account));
            }
        }
        match account_number {
            Some(number) => self.find("account_number", number).await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AccountDao for PgAccountDao {
    async fn create(&self, org_id: Option<&str>, account_number: Option<&str>) -> Result<Account> {
        let org_id = identity_part(org_id);
        let account_number = identity_part(account_number);
        if org_id.is_none() && account_number.is_none() {
            return Err(Error::MissingIdentity);
        }
        let res = sqlx::query_as::<_, Account>(
            "INSERT INTO accounts (org_id, account_number) VALUES ($1, $2)
             RETURNING id, org_id, account_number",
        )
        .bind(org_id)
        .bind(account_number)
        .fetch_one(&self.db)
        .await;
        match res {
            Ok(account) => Ok(account),
            Err(e) if has_code(&e, UNIQUE_VIOLATION) => Err(Error::AlreadyExists(format!(
                "account for org {:?} / number {:?}",
                org_id, account_number
            ))),
            Err(e) => Err(Error::storage("insert account")(e)),
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<Account> {
        sqlx::query_as::<_, Account>("SELECT id, org_id, account_number FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(Error::storage("get account"))?
            .ok_or_else(|| Error::not_found(format!("account {id}")))
    }

    async fn get_by_org_id(&self, org_id: &str) -> Result<Account> {
        self.find("org_id", org_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("account for org {org_id}")))
    }

    async fn get_by_account_number(&self, account_number: &str) -> Result<Account> {
        self.find("account_number", account_number)
            .await?
            .ok_or_else(|| Error::not_found(format!("account {account_number}")))
    }

    async fn get_or_create_by_identity(
        &self,
        org_id: Option<&str>,
        account_number: Option<&str>,
    ) -> Result<Account> {
        let org_id = identity_part(org_id);
        let account_number = identity_part(account_number);
        if let Some(account) = self.lookup(org_id, account_number).await? {
            return Ok(account);
        }
        match self.create(org_id, account_number).await {
            // A concurrent request created it between the lookup and the insert.
            Err(Error::AlreadyExists(_)) => self
                .lookup(org_id, account_number)
                .await?
                .ok_or_else(|| Error::not_found("account after unique violation")),
            other => {
                if let Ok(account) = &other {
                    debug!(account_id = account.id, "account created for new identity");
                }
                other
            }
        }
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Account>> {
        sqlx::query_as::<_, Account>(
            "SELECT id, org_id, account_number FROM accounts
             ORDER BY id
             LIMIT $1 OFFSET $2",
        )
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.db)
        .await
        .map_err(Error::storage("list accounts"))
    }
}

#[derive(Clone)]
pub struct PgPubkeyDao {
    db: Pool<Postgres>,
}

impl PgPubkeyDao {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PubkeyDao for PgPubkeyDao {
    async fn create(&self, account_id: i64, name: &str, body: &str) -> Result<Pubkey> {
        let res = sqlx::query_as::<_, Pubkey>(
            "INSERT INTO pubkeys (account_id, name, body) VALUES ($1, $2, $3)
             RETURNING id, account_id, name, body",
        )
        .bind(account_id)
        .bind(name)
        .bind(body)
        .fetch_one(&self.db)
        .await;
        match res {
            Ok(pubkey) => Ok(pubkey),
            Err(e) if has_code(&e, UNIQUE_VIOLATION) => {
                Err(Error::AlreadyExists(format!("pubkey {name}")))
            }
            Err(e) => Err(Error::storage("insert pubkey")(e)),
        }
    }

    async fn update(&self, account_id: i64, pubkey: &Pubkey) -> Result<()> {
        let res = sqlx::query(
            "UPDATE pubkeys SET name = $3, body = $4 WHERE id = $1 AND account_id = $2",
        )
        .bind(pubkey.id)
        .bind(account_id)
        .bind(&pubkey.name)
        .bind(&pubkey.body)
        .execute(&self.db)
        .await;
        match res {
            Ok(done) => expect_one("update pubkey", done.rows_affected()),
            Err(e) if has_code(&e, UNIQUE_VIOLATION) => {
                Err(Error::AlreadyExists(format!("pubkey {}", pubkey.name)))
            }
            Err(e) => Err(Error::storage("update pubkey")(e)),
        }
    }

    async fn get_by_id(&self, account_id: i64, id: i64) -> Result<Pubkey> {
        sqlx::query_as::<_, Pubkey>(
            "SELECT id, account_id, name, body FROM pubkeys WHERE id = $1 AND account_id = $2",
        )
        .bind(id)
        .bind(account_id)
        .fetch_optional(&self.db)
        .await
        .map_err(Error::storage("get pubkey"))?
        .ok_or_else(|| Error::not_found(format!("pubkey {id}")))
    }

    async fn list(&self, account_id: i64, limit: i64, offset: i64) -> Result<Vec<Pubkey>> {
        sqlx::query_as::<_, Pubkey>(
            "SELECT id, account_id, name, body FROM pubkeys
             WHERE account_id = $1
             ORDER BY id
             LIMIT $2 OFFSET $3",
        )
        .bind(account_id)
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.db)
        .await
        .map_err(Error::storage("list pubkeys"))
    }

    async fn delete(&self, account_id: i64, id: i64) -> Result<()> {
        // Resources go with ON DELETE CASCADE.
        let res = sqlx::query("DELETE FROM pubkeys WHERE id = $1 AND account_id = $2")
            .bind(id)
            .bind(account_id)
            .execute(&self.db)
            .await
            .map_err(Error::storage("delete pubkey"))?;

        expect_one("delete pubkey", res.rows_affected())
    }

    async fn unscoped_create_resource(
        &self,
        pubkey_id: i64,
        provider: ProviderType,
        handle: &str,
        tag: &str,
    ) -> Result<PubkeyResource> {
        let res = sqlx::query_as::<_, PubkeyResource>(
            "INSERT INTO pubkey_resources (pubkey_id, provider, handle, tag) VALUES ($1, $2, $3, $4)
             RETURNING id, pubkey_id, provider, handle, tag",
        )
        .bind(pubkey_id)
        .bind(provider)
        .bind(handle)
        .bind(tag)
        .fetch_one(&self.db)
        .await;
        match res {
            Ok(resource) => Ok(resource),
            Err(e) if has_code(&e, FOREIGN_KEY_VIOLATION) => {
                Err(Error::not_found(format!("pubkey {pubkey_id}")))
            }
            Err(e) if has_code(&e, UNIQUE_VIOLATION) => Err(Error::AlreadyExists(format!(
                "pubkey {pubkey_id} resource for {provider}"
            ))),
            Err(e) => Err(Error::storage("insert pubkey resource")(e)),
        }
    }

    async fn unscoped_get_resource_by_provider(
        &self,
        pubkey_id: i64,
        provider: ProviderType,
    ) -> Result<PubkeyResource> {
        sqlx::query_as::<_, PubkeyResource>(
            "SELECT id, pubkey_id, provider, handle, tag FROM pubkey_resources
             WHERE pubkey_id = $1 AND provider = $2",
        )
        .bind(pubkey_id)
        .bind(provider)
        .fetch_optional(&self.db)
        .await
        .map_err(Error::storage("get pubkey resource"))?
        .ok_or_else(|| Error::not_found(format!("pubkey {pubkey_id} resource for {provider}")))
    }

    async fn unscoped_list_resources(&self, pubkey_id: i64) -> Result<Vec<PubkeyResource>> {
        sqlx::query_as::<_, PubkeyResource>(
            "SELECT id, pubkey_id, provider, handle, tag FROM pubkey_resources
             WHERE pubkey_id = $1
             ORDER BY id",
        )
        .bind(pubkey_id)
        .fetch_all(&self.db)
        .await
        .map_err(Error::storage("list pubkey resources"))
    }

    async fn unscoped_delete_resource(&self, id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM pubkey_resources WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(Error::storage("delete pubkey resource"))?;

        expect_one("delete pubkey resource", res.rows_affected())
    }
}
