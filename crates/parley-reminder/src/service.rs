use crate::error::ReminderError;
use crate::jobs::{self, JobPayload, ReminderJob};
use crate::scheduler::{ensure_future, ReminderScheduler};
use crate::store::{self, NewReminder, Reminder};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use chrono_tz::Tz;
use parley_db::DbPool;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Request to create a reminder.
///
/// `remind_at` is either RFC 3339 with an offset, or a naive local time
/// interpreted in `timezone` (falling back to the service default).
#[derive(Debug, Clone, Deserialize)]
pub struct CreateReminder {
    pub agent_id: String,
    pub device_id: String,
    pub mac_address: String,
    pub remind_at: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub title: String,
    pub content: String,
    #[serde(default, alias = "useLLM")]
    pub use_llm: bool,
}

pub struct ReminderService {
    pool: DbPool,
    scheduler: Arc<ReminderScheduler>,
    default_tz: Tz,
}

impl ReminderService {
    pub fn new(pool: DbPool, scheduler: Arc<ReminderScheduler>, default_tz: Tz) -> Self {
        Self {
            pool,
            scheduler,
            default_tz,
        }
    }

    pub fn scheduler(&self) -> &Arc<ReminderScheduler> {
        &self.scheduler
    }

    /// Validates the request, stores the reminder and schedules its job in
    /// one transaction.
    pub async fn create(&self, request: CreateReminder) -> Result<Reminder, ReminderError> {
        for (field, value) in [
            ("agent_id", &request.agent_id),
            ("device_id", &request.device_id),
            ("mac_address", &request.mac_address),
            ("content", &request.content),
        ] {
            if value.trim().is_empty() {
                return Err(ReminderError::InvalidRequest(format!("{field} is required")));
            }
        }

        let tz = match request.timezone.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Tz::from_str(name)
                .map_err(|_| ReminderError::InvalidTime(format!("unknown time zone '{name}'")))?,
            _ => self.default_tz,
        };
        let run_at = parse_remind_at(&request.remind_at, tz)?;
        ensure_future(run_at)?;

        let id = uuid::Uuid::new_v4().to_string();
        let new = NewReminder {
            id: id.clone(),
            agent_id: request.agent_id,
            device_id: request.device_id,
            mac_address: request.mac_address,
            remind_at: run_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            remind_at_local: run_at
                .with_timezone(&tz)
                .to_rfc3339_opts(SecondsFormat::Secs, false),
            title: request.title,
            content: request.content,
            use_llm: request.use_llm,
        };
        let job = ReminderJob {
            id: id.clone(),
            run_at,
            payload: JobPayload {
                target: parley_types::DeliveryTarget::new(
                    new.device_id.clone(),
                    new.mac_address.clone(),
                ),
                notification: parley_types::NotificationPayload::new(
                    new.title.clone(),
                    new.content.clone(),
                    new.use_llm,
                ),
            },
        };

        let reminder = self
            .with_conn(move |conn| {
                let tx = conn.unchecked_transaction()?;
                store::create_reminder(&tx, &new)?;
                jobs::upsert_job(&tx, &job)?;
                let reminder = store::get_reminder(&tx, &new.id)?;
                tx.commit()?;
                Ok(reminder)
            })
            .await?;

        tracing::info!(
            reminder_id = %reminder.id,
            device_id = %reminder.device_id,
            remind_at = %reminder.remind_at,
            "reminder created"
        );
        self.scheduler.wake();
        Ok(reminder)
    }

    pub async fn get(&self, id: &str) -> Result<Reminder, ReminderError> {
        let id = id.to_string();
        self.with_conn(move |conn| store::get_reminder(conn, &id))
            .await
    }

    pub async fn list_for_device(&self, device_id: &str) -> Result<Vec<Reminder>, ReminderError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| store::list_reminders_for_device(conn, &device_id))
            .await
    }

    /// Records the device's acknowledgement of a delivered reminder.
    pub async fn mark_received(&self, id: &str) -> Result<Reminder, ReminderError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            store::mark_received(conn, &id)?;
            store::get_reminder(conn, &id)
        })
        .await
    }

    /// Cancels the pending job, if any, then deletes the reminder.
    pub async fn delete(&self, id: &str) -> Result<(), ReminderError> {
        let cancelled = self.scheduler.cancel(id).await?;
        let owned = id.to_string();
        let deleted = self
            .with_conn(move |conn| store::delete_reminder(conn, &owned))
            .await?;
        if !deleted {
            return Err(ReminderError::NotFound(id.to_string()));
        }
        tracing::info!(reminder_id = id, job_cancelled = cancelled, "reminder deleted");
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ReminderError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, ReminderError> + Send + 'static,
    {
        parley_db::with_conn(&self.pool, f).await
    }
}

/// Normalises a user-supplied time to UTC.
///
/// Offset-qualified input keeps its offset; naive input is read in `tz`. A
/// local time skipped by a DST transition is rejected, and an ambiguous one
/// resolves to the earlier instant. Fractional seconds are dropped so the
/// stored `remind_at` and the job fire at the same instant.
pub fn parse_remind_at(raw: &str, tz: Tz) -> Result<DateTime<Utc>, ReminderError> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc).trunc_subsecs(0));
    }
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| ReminderError::InvalidTime(raw.to_string()))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc).trunc_subsecs(0))
        .ok_or_else(|| ReminderError::InvalidTime(format!("{raw} does not exist in {tz}")))
}
