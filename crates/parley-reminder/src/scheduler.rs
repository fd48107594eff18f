use crate::error::ReminderError;
use crate::jobs::{self, JobPayload, ReminderJob};
use crate::store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_db::DbPool;
use parley_types::{DeliveryResult, DeliveryTarget, NotificationPayload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// `last_error` recorded for a job whose fire time passed beyond the grace
/// window, or passed while the scheduler was not running.
pub const MISSED_ERROR: &str = "missed";

/// Jobs claimed per batch.
const CLAIM_BATCH: usize = 64;

enum Outcome {
    Delivered,
    Failed(String),
    Missed,
}

/// Delivery seam the scheduler fires into.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        target: &DeliveryTarget,
        payload: &NotificationPayload,
    ) -> DeliveryResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How late a job may fire before it is recorded as missed.
    pub misfire_grace: Duration,
    /// Upper bound on the run loop's sleep between checks.
    pub max_idle: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            misfire_grace: Duration::from_secs(60),
            max_idle: Duration::from_secs(30),
        }
    }
}

pub struct ReminderScheduler {
    pool: DbPool,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    wake: Notify,
}

impl ReminderScheduler {
    pub fn new(pool: DbPool, notifier: Arc<dyn Notifier>, config: SchedulerConfig) -> Self {
        Self {
            pool,
            notifier,
            config,
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Persists a one-shot job and wakes the run loop.
    ///
    /// Scheduling an id that already has a pending job replaces it.
    ///
    /// # Errors
    ///
    /// [`ReminderError::InvalidSchedule`] if `run_at` is not strictly in the
    /// future, [`ReminderError::InvalidTransition`] if the id is already
    /// firing; storage errors otherwise.
    pub async fn schedule(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        payload: JobPayload,
    ) -> Result<(), ReminderError> {
        ensure_future(run_at)?;
        let job = ReminderJob {
            id: id.to_string(),
            run_at,
            payload,
        };
        self.with_conn(move |conn| jobs::upsert_job(conn, &job))
            .await?;
        tracing::info!(job_id = id, run_at = %run_at.to_rfc3339(), "reminder job scheduled");
        self.wake();
        Ok(())
    }

    /// Removes a pending job. Returns `false` if there was none, including
    /// when the job has already been claimed for firing.
    pub async fn cancel(&self, id: &str) -> Result<bool, ReminderError> {
        let owned = id.to_string();
        let removed = self
            .with_conn(move |conn| jobs::delete_job(conn, &owned))
            .await?;
        if removed {
            tracing::info!(job_id = id, "reminder job cancelled");
            self.wake();
        }
        Ok(removed)
    }

    pub async fn next_run_at(&self) -> Result<Option<DateTime<Utc>>, ReminderError> {
        self.with_conn(jobs::next_run_at).await
    }

    /// Wakes the run loop so it recomputes its next deadline.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Claims and processes every job due at `now`, in `run_at` order.
    /// Returns how many jobs were processed.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize, ReminderError> {
        let mut processed = 0;
        loop {
            let batch = self
                .with_conn(move |conn| jobs::claim_due(conn, now, CLAIM_BATCH))
                .await?;
            let batch_len = batch.len();
            for job in batch {
                self.fire(job, now).await;
                processed += 1;
            }
            if batch_len < CLAIM_BATCH {
                return Ok(processed);
            }
        }
    }

    async fn fire(&self, job: ReminderJob, now: DateTime<Utc>) {
        let id = job.id;
        let lateness = (now - job.run_at).to_std().unwrap_or_default();

        if lateness > self.config.misfire_grace {
            tracing::warn!(
                job_id = %id,
                late_secs = lateness.as_secs(),
                "reminder job missed its fire window"
            );
            self.settle(&id, Outcome::Missed).await;
            return;
        }

        let JobPayload {
            target,
            notification,
        } = job.payload;
        let result = self.notifier.notify(&target, &notification).await;

        let outcome = if result.delivered {
            tracing::info!(
                job_id = %id,
                device_id = %target.device_id,
                method = ?result.method,
                "reminder delivered"
            );
            Outcome::Delivered
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "delivery failed".to_string());
            tracing::warn!(
                job_id = %id,
                device_id = %target.device_id,
                error = %error,
                "reminder delivery failed"
            );
            Outcome::Failed(error)
        };
        self.settle(&id, outcome).await;
    }

    /// Records the outcome and removes the claimed job in one transaction.
    async fn settle(&self, id: &str, outcome: Outcome) {
        let owned = id.to_string();
        let recorded = self
            .with_conn(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let recorded = match &outcome {
                    Outcome::Delivered => store::mark_delivered(&tx, &owned),
                    Outcome::Failed(error) => store::mark_failed(&tx, &owned, error),
                    Outcome::Missed => store::mark_missed(&tx, &owned, MISSED_ERROR),
                };
                let recorded = match recorded {
                    // Rolls back; the stamped job is recovered as missed on restart.
                    Err(e) if !e.is_row_state() => return Err(e),
                    other => other,
                };
                jobs::complete_job(&tx, &owned)?;
                tx.commit()?;
                Ok(recorded)
            })
            .await;
        log_status_update(id, recorded.and_then(|inner| inner));
    }

    /// Settles every job that cannot fire on time after a restart.
    ///
    /// Jobs due before `started` are recorded as missed whatever the grace
    /// window, as are jobs an earlier process claimed but never settled and
    /// pending reminders whose job row is gone. Returns how many reminders
    /// moved to `FAILED`.
    pub async fn recover(&self, started: DateTime<Utc>) -> Result<usize, ReminderError> {
        let recovered = self
            .with_conn(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let mut moved = 0;
                for id in jobs::take_stale(&tx, started)? {
                    match store::mark_missed(&tx, &id, MISSED_ERROR) {
                        Ok(()) => moved += 1,
                        Err(e) if e.is_row_state() => {}
                        Err(e) => return Err(e),
                    }
                }
                moved += store::mark_orphans_missed(&tx, started, MISSED_ERROR)?;
                tx.commit()?;
                Ok(moved)
            })
            .await?;
        if recovered > 0 {
            tracing::warn!(recovered, "reminders missed while the scheduler was down");
        }
        Ok(recovered)
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Starts with [`recover`](Self::recover), then alternates between
    /// processing due jobs and sleeping until the next fire time, a wake-up,
    /// or `max_idle`, whichever is first.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            misfire_grace_secs = self.config.misfire_grace.as_secs(),
            max_idle_secs = self.config.max_idle.as_secs(),
            "reminder scheduler started"
        );

        if let Err(e) = self.recover(Utc::now()).await {
            tracing::error!(error = %e, "reminder startup recovery failed");
        }

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_due(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(processed = n, "reminder jobs processed"),
                Err(e) => tracing::error!(error = %e, "reminder tick failed"),
            }

            let sleep_for = match self.next_run_at().await {
                Ok(Some(next)) => (next - Utc::now())
                    .to_std()
                    .unwrap_or_default()
                    .min(self.config.max_idle),
                Ok(None) => self.config.max_idle,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read next reminder fire time");
                    self.config.max_idle
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.wake.notified() => {}
                () = tokio::time::sleep(sleep_for) => {}
            }
        }

        tracing::info!("reminder scheduler stopped");
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ReminderError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, ReminderError> + Send + 'static,
    {
        parley_db::with_conn(&self.pool, f).await
    }
}

pub(crate) fn ensure_future(run_at: DateTime<Utc>) -> Result<(), ReminderError> {
    if run_at <= Utc::now() {
        return Err(ReminderError::InvalidSchedule(run_at.to_rfc3339()));
    }
    Ok(())
}

fn log_status_update(id: &str, outcome: Result<(), ReminderError>) {
    match outcome {
        Ok(()) => {}
        Err(ReminderError::NotFound(_)) => {
            tracing::warn!(job_id = id, "fired job has no reminder row");
        }
        Err(e) => tracing::error!(job_id = id, error = %e, "failed to record reminder outcome"),
    }
}
