use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};
use provisioning_common::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::settings::WatchdogSettings;
use crate::state_machine::ReservationService;

const BATCH_SIZE: i64 = 50;
const CONCURRENCY: usize = 8;

/// job-watch-dog: fails reservations whose worker stopped reporting progress.
pub async fn run(service: ReservationService, settings: WatchdogSettings, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(settings.interval);
    let timeout = Duration::seconds(i64::from(settings.reservation_timeout_secs));
    info!(
        interval_secs = settings.interval.as_secs(),
        timeout_secs = settings.reservation_timeout_secs,
        "job-watch-dog started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match fail_stale_reservations(&service, Utc::now() - timeout, &timeout_message(settings)).await {
            Ok(count) if count > 0 => info!(count, "job-watch-dog: stale reservation(s) failed"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "job-watch-dog error"),
        }
    }
    info!("job-watch-dog stopped");
}

fn timeout_message(settings: WatchdogSettings) -> String {
    format!(
        "reservation timed out: no progress for {}s",
        settings.reservation_timeout_secs
    )
}

/// Fails one batch of pending reservations idle since before `cutoff`.
/// Each failure re-checks the cutoff, so a reservation that finished, reported
/// progress or was deleted after the listing is skipped.
pub async fn fail_stale_reservations(
    service: &ReservationService,
    cutoff: DateTime<Utc>,
    message: &str,
) -> Result<usize> {
    let ids = service.stale(cutoff, BATCH_SIZE).await?;
    if ids.is_empty() {
        return Ok(0);
    }

    let outcomes: Vec<(i64, Result<bool>)> = stream::iter(ids)
        .map(|id| async move { (id, service.fail_if_stale(id, cutoff, message).await) })
        .buffer_unordered(CONCURRENCY)
        .collect()
        .await;

    let mut failed = 0;
    for (id, outcome) in outcomes {
        match outcome {
            Ok(true) => failed += 1,
            Ok(false) => debug!(reservation_id = id, "no longer stale, skipped"),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => warn!(reservation_id = id, error = %e, "failed to time out reservation"),
        }
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::{MemoryReservationDao, ReservationDao};
    use async_trait::async_trait;
    use provisioning_common::{
        AwsReservation, GcpReservation, Reservation, ReservationDetail, ReservationInstance,
        ReservationState,
    };
    use std::sync::Arc;

    fn service() -> ReservationService {
        ReservationService::new(Arc::new(MemoryReservationDao::new()))
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + Duration::seconds(5)
    }

    #[tokio::test]
    async fn stale_pending_reservations_are_failed() {
        let svc = service();
        let idle = svc.create_noop(1).await.unwrap();
        let working = svc.create_noop(1).await.unwrap();
        svc.record_progress(working.id, "Launching", 1).await.unwrap();
        let done = svc.create_noop(1).await.unwrap();
        svc.succeed(done.id).await.unwrap();

        let count = fail_stale_reservations(&svc, later(), "timed out").await.unwrap();
        assert_eq!(count, 2);

        let idle = svc.get(1, idle.id).await.unwrap();
        assert_eq!(idle.state(), ReservationState::Failed);
        assert_eq!(idle.error.as_deref(), Some("timed out"));
        assert_eq!(svc.get(1, working.id).await.unwrap().state(), ReservationState::Failed);

        let done = svc.get(1, done.id).await.unwrap();
        assert_eq!(done.state(), ReservationState::Succeeded);
        assert_eq!(done.error, None);
    }

    #[tokio::test]
    async fn recent_activity_is_left_alone() {
        let svc = service();
        let r = svc.create_noop(1).await.unwrap();
        let cutoff = Utc::now() - Duration::seconds(3600);
        assert_eq!(fail_stale_reservations(&svc, cutoff, "timed out").await.unwrap(), 0);
        assert_eq!(svc.get(1, r.id).await.unwrap().state(), ReservationState::Created);
    }

    #[tokio::test]
    async fn second_pass_finds_nothing() {
        let svc = service();
        svc.create_noop(1).await.unwrap();
        assert_eq!(fail_stale_reservations(&svc, later(), "timed out").await.unwrap(), 1);
        assert_eq!(fail_stale_reservations(&svc, later(), "timed out").await.unwrap(), 0);
    }

    /// Repository where every reservation reports progress right after the
    /// stale listing was taken, as a busy worker would.
    struct ProgressAfterListing(MemoryReservationDao);

    #[async_trait]
    impl ReservationDao for ProgressAfterListing {
        async fn create(&self, account_id: i64, detail: ReservationDetail) -> Result<Reservation> {
            self.0.create(account_id, detail).await
        }
        async fn create_instance(&self, reservation_id: i64, instance_id: &str) -> Result<()> {
            self.0.create_instance(reservation_id, instance_id).await
        }
        async fn get_by_id(&self, account_id: i64, id: i64) -> Result<Reservation> {
            self.0.get_by_id(account_id, id).await
        }
        async fn get_aws_by_id(&self, account_id: i64, id: i64) -> Result<AwsReservation> {
            self.0.get_aws_by_id(account_id, id).await
        }
        async fn get_gcp_by_id(&self, account_id: i64, id: i64) -> Result<GcpReservation> {
            self.0.get_gcp_by_id(account_id, id).await
        }
        async fn list(&self, account_id: i64, limit: i64, offset: i64) -> Result<Vec<Reservation>> {
            self.0.list(account_id, limit, offset).await
        }
        async fn list_instances(
            &self,
            reservation_id: i64,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<ReservationInstance>> {
            self.0.list_instances(reservation_id, limit, offset).await
        }
        async fn list_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
            let ids = self.0.list_stale(cutoff, limit).await?;
            for id in &ids {
                self.0.update_status(*id, "Launching", 1).await?;
            }
            Ok(ids)
        }
        async fn update_status(&self, id: i64, status: &str, add_steps: u32) -> Result<()> {
            self.0.update_status(id, status, add_steps).await
        }
        async fn update_reservation_id_for_aws(&self, id: i64, aws_reservation_id: &str) -> Result<()> {
            self.0.update_reservation_id_for_aws(id, aws_reservation_id).await
        }
        async fn update_operation_name_for_gcp(&self, id: i64, operation_name: &str) -> Result<()> {
            self.0.update_operation_name_for_gcp(id, operation_name).await
        }
        async fn finish_with_success(&self, id: i64) -> Result<()> {
            self.0.finish_with_success(id).await
        }
        async fn finish_with_error(&self, id: i64, message: &str) -> Result<()> {
            self.0.finish_with_error(id, message).await
        }
        async fn finish_stale_with_error(
            &self,
            id: i64,
            cutoff: DateTime<Utc>,
            message: &str,
        ) -> Result<bool> {
            self.0.finish_stale_with_error(id, cutoff, message).await
        }
        async fn delete(&self, id: i64) -> Result<()> {
            self.0.delete(id).await
        }
    }

    #[tokio::test]
    async fn progress_after_listing_is_not_failed() {
        let svc = ReservationService::new(Arc::new(ProgressAfterListing(MemoryReservationDao::new())));
        let r = svc.create_noop(1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let cutoff = Utc::now();

        assert_eq!(fail_stale_reservations(&svc, cutoff, "timed out").await.unwrap(), 0);

        let r = svc.get(1, r.id).await.unwrap();
        assert_eq!(r.state(), ReservationState::InProgress);
        assert_eq!(r.error, None);
        assert!(r.updated_at.unwrap() >= cutoff);
    }

    #[test]
    fn message_names_the_timeout() {
        let settings = WatchdogSettings {
            reservation_timeout_secs: 900,
            ..Default::default()
        };
        assert_eq!(
            timeout_message(settings),
            "reservation timed out: no progress for 900s"
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let svc = service();
        let r = svc.create_noop(1).await.unwrap();
        let shutdown = CancellationToken::new();
        let settings = WatchdogSettings {
            interval: std::time::Duration::from_millis(10),
            reservation_timeout_secs: 0,
        };

        let job = tokio::spawn(run(svc.clone(), settings, shutdown.clone()));
        // The first tick fires immediately.
        for _ in 0..100 {
            if svc.get(1, r.id).await.unwrap().is_finished() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        job.await.unwrap();

        assert_eq!(svc.get(1, r.id).await.unwrap().state(), ReservationState::Failed);
    }
}
