//! Reservation lifecycle.
//!
//! Created -> InProgress -> Succeeded | Failed. Progress reports move a pending
//! reservation forward; the first finish call wins and every later mutation is
//! rejected with `AlreadyFinished`.

use chrono::{DateTime, Utc};
use provisioning_common::{
    AwsDetail, AwsReservation, Error, GcpDetail, GcpReservation, LaunchRequest, Reservation,
    ReservationDetail, ReservationInstance, Result,
};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dao::ReservationDao;

#[derive(Clone)]
pub struct ReservationService {
    dao: Arc<dyn ReservationDao>,
    cancel: CancellationToken,
}

impl ReservationService {
    pub fn new(dao: Arc<dyn ReservationDao>) -> Self {
        Self {
            dao,
            cancel: CancellationToken::new(),
        }
    }

    /// Handle whose calls abort with `Cancelled` once `cancel` fires.
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

    pub async fn create_noop(&self, account_id: i64) -> Result<Reservation> {
        self.create(account_id, ReservationDetail::Noop).await
    }

    pub async fn create_aws(&self, account_id: i64, launch: LaunchRequest) -> Result<Reservation> {
        self.create(
            account_id,
            ReservationDetail::Aws(AwsDetail {
                launch,
                aws_reservation_id: None,
            }),
        )
        .await
    }

    pub async fn create_gcp(&self, account_id: i64, launch: LaunchRequest) -> Result<Reservation> {
        self.create(
            account_id,
            ReservationDetail::Gcp(GcpDetail {
                launch,
                gcp_operation_name: None,
            }),
        )
        .await
    }

    async fn create(&self, account_id: i64, detail: ReservationDetail) -> Result<Reservation> {
        let reservation = self.run(self.dao.create(account_id, detail)).await?;
        info!(
            reservation_id = reservation.id,
            account_id,
            provider = %reservation.provider,
            "reservation created"
        );
        Ok(reservation)
    }

    /// Reports worker progress. `add_steps` may be 0 to change only the label.
    pub async fn record_progress(&self, id: i64, status: &str, add_steps: u32) -> Result<()> {
        self.run(self.dao.update_status(id, status, add_steps)).await?;
        debug!(reservation_id = id, status, add_steps, "reservation progress");
        Ok(())
    }

    pub async fn record_instance(&self, id: i64, instance_id: &str) -> Result<()> {
        self.run(self.dao.create_instance(id, instance_id)).await?;
        debug!(reservation_id = id, instance_id, "instance recorded");
        Ok(())
    }

    pub async fn attach_aws_reservation_id(&self, id: i64, aws_reservation_id: &str) -> Result<()> {
        self.run(self.dao.update_reservation_id_for_aws(id, aws_reservation_id))
            .await
    }

    pub async fn attach_gcp_operation_name(&self, id: i64, operation_name: &str) -> Result<()> {
        self.run(self.dao.update_operation_name_for_gcp(id, operation_name))
            .await
    }

    pub async fn succeed(&self, id: i64) -> Result<()> {
        self.run(self.dao.finish_with_success(id)).await?;
        info!(reservation_id = id, "reservation succeeded");
        Ok(())
    }

    pub async fn fail(&self, id: i64, message: &str) -> Result<()> {
        self.run(self.dao.finish_with_error(id, message)).await?;
        warn!(reservation_id = id, error = message, "reservation failed");
        Ok(())
    }

    /// Watchdog path: fails `id` only if it is still idle since before `cutoff`.
    /// Returns whether it was failed.
    pub async fn fail_if_stale(&self, id: i64, cutoff: DateTime<Utc>, message: &str) -> Result<bool> {
        let failed = self
            .run(self.dao.finish_stale_with_error(id, cutoff, message))
            .await?;
        if failed {
            warn!(reservation_id = id, error = message, "reservation failed");
        }
        Ok(failed)
    }

    /// Records the outcome of the background job driving reservation `id`.
    pub async fn finish<E: Display>(&self, id: i64, outcome: std::result::Result<(), E>) -> Result<()> {
        match outcome {
            Ok(()) => self.succeed(id).await,
            Err(e) => self.fail(id, &e.to_string()).await,
        }
    }

    pub async fn get(&self, account_id: i64, id: i64) -> Result<Reservation> {
        self.run(self.dao.get_by_id(account_id, id)).await
    }

    pub async fn get_aws(&self, account_id: i64, id: i64) -> Result<AwsReservation> {
        self.run(self.dao.get_aws_by_id(account_id, id)).await
    }

    pub async fn get_gcp(&self, account_id: i64, id: i64) -> Result<GcpReservation> {
        self.run(self.dao.get_gcp_by_id(account_id, id)).await
    }

    pub async fn list(&self, account_id: i64, limit: i64, offset: i64) -> Result<Vec<Reservation>> {
        self.run(self.dao.list(account_id, limit, offset)).await
    }

    pub async fn list_instances(
        &self,
        reservation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReservationInstance>> {
        self.run(self.dao.list_instances(reservation_id, limit, offset))
            .await
    }

    pub async fn stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        self.run(self.dao.list_stale(cutoff, limit)).await
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.run(self.dao.delete(id)).await?;
        info!(reservation_id = id, "reservation deleted");
        Ok(())
    }
}
