//! Persisted scheduler jobs.
//!
//! One row per reminder id. [`claim_due`] stamps due rows with `claimed_at`
//! instead of removing them, and the row is deleted by [`complete_job`] in
//! the same transaction that records the outcome. A cancel only deletes an
//! unclaimed row, so a cancel racing a fire resolves to one winner. Rows
//! still stamped when a process starts belong to a fire that never finished.

use crate::error::ReminderError;
use crate::scheduler::MISSED_ERROR;
use crate::store;
use chrono::{DateTime, Utc};
use parley_types::{DeliveryTarget, NotificationPayload, ReminderStatus};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// What to deliver when the job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub target: DeliveryTarget,
    pub notification: NotificationPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderJob {
    pub id: String,
    pub run_at: DateTime<Utc>,
    pub payload: JobPayload,
}

/// Inserts a job, replacing any unclaimed job with the same id.
///
/// # Errors
///
/// [`ReminderError::InvalidTransition`] if a job with this id is already
/// claimed for firing.
pub fn upsert_job(conn: &Connection, job: &ReminderJob) -> Result<(), ReminderError> {
    let payload_json = serde_json::to_string(&job.payload)?;
    let changed = conn.execute(
        "INSERT INTO reminder_jobs (id, run_at, payload_json) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET run_at = excluded.run_at, payload_json = excluded.payload_json
         WHERE reminder_jobs.claimed_at IS NULL",
        params![job.id, job.run_at.timestamp_millis(), payload_json],
    )?;
    if changed == 0 {
        return Err(ReminderError::InvalidTransition {
            id: job.id.clone(),
            to: ReminderStatus::Pending,
        });
    }
    Ok(())
}

/// Removes an unclaimed job; `true` only if one was pending.
pub fn delete_job(conn: &Connection, id: &str) -> Result<bool, ReminderError> {
    let removed = conn.execute(
        "DELETE FROM reminder_jobs WHERE id = ?1 AND claimed_at IS NULL",
        [id],
    )?;
    Ok(removed > 0)
}

/// Removes a job once its outcome is recorded, claimed or not.
pub fn complete_job(conn: &Connection, id: &str) -> Result<(), ReminderError> {
    conn.execute("DELETE FROM reminder_jobs WHERE id = ?1", [id])?;
    Ok(())
}

/// Stamps and returns up to `limit` unclaimed jobs with `run_at <= now`,
/// ordered by `run_at`.
pub fn claim_due(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<ReminderJob>, ReminderError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let claimed: Vec<(String, i64, String)> = {
        let mut stmt = conn.prepare(
            "UPDATE reminder_jobs SET claimed_at = ?1
             WHERE id IN (
                 SELECT id FROM reminder_jobs
                 WHERE claimed_at IS NULL AND run_at <= ?1
                 ORDER BY run_at ASC, id ASC LIMIT ?2
             )
             RETURNING id, run_at, payload_json",
        )?;
        let rows = stmt.query_map(params![now.timestamp_millis(), limit], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.collect::<Result<_, _>>()?
    };

    let mut jobs = Vec::with_capacity(claimed.len());
    for (id, run_at_ms, payload_json) in claimed {
        let payload = match serde_json::from_str::<JobPayload>(&payload_json) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "dropping job with corrupt payload");
                discard(conn, &id)?;
                continue;
            }
        };
        let Some(run_at) = DateTime::<Utc>::from_timestamp_millis(run_at_ms) else {
            tracing::error!(job_id = %id, run_at_ms, "dropping job with out-of-range run_at");
            discard(conn, &id)?;
            continue;
        };
        jobs.push(ReminderJob { id, run_at, payload });
    }
    // RETURNING does not guarantee order.
    jobs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));
    Ok(jobs)
}

/// Removes every job whose fire can no longer happen on time: rows claimed
/// by an earlier process and rows due before `started`. Returns their ids.
pub fn take_stale(conn: &Connection, started: DateTime<Utc>) -> Result<Vec<String>, ReminderError> {
    let mut stmt = conn.prepare(
        "DELETE FROM reminder_jobs WHERE claimed_at IS NOT NULL OR run_at < ?1 RETURNING id",
    )?;
    let ids = stmt
        .query_map([started.timestamp_millis()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Earliest unclaimed `run_at`, if any job is pending.
pub fn next_run_at(conn: &Connection) -> Result<Option<DateTime<Utc>>, ReminderError> {
    let ms: Option<i64> = conn
        .query_row(
            "SELECT MIN(run_at) FROM reminder_jobs WHERE claimed_at IS NULL",
            [],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(ms.and_then(DateTime::<Utc>::from_timestamp_millis))
}

pub fn job_exists(conn: &Connection, id: &str) -> Result<bool, ReminderError> {
    Ok(conn
        .query_row("SELECT 1 FROM reminder_jobs WHERE id = ?1", [id], |_| Ok(()))
        .optional()?
        .is_some())
}

/// A job that cannot fire still settles its reminder.
fn discard(conn: &Connection, id: &str) -> Result<(), ReminderError> {
    complete_job(conn, id)?;
    match store::mark_missed(conn, id, MISSED_ERROR) {
        Err(e) if !e.is_row_state() => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        parley_db::run_migrations(&conn).unwrap();
        conn
    }

    fn job(id: &str, run_at: DateTime<Utc>) -> ReminderJob {
        ReminderJob {
            id: id.into(),
            run_at,
            payload: JobPayload {
                target: DeliveryTarget::new("dev-1", "aa:bb"),
                notification: NotificationPayload::new("t", id, false),
            },
        }
    }

    #[test]
    fn claims_due_jobs_once_in_order() {
        let conn = conn();
        let now = Utc::now();
        upsert_job(&conn, &job("late", now - Duration::seconds(1))).unwrap();
        upsert_job(&conn, &job("early", now - Duration::seconds(10))).unwrap();
        upsert_job(&conn, &job("future", now + Duration::hours(1))).unwrap();

        let ids: Vec<_> = claim_due(&conn, now, 10)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, ["early", "late"]);
        assert!(claim_due(&conn, now, 10).unwrap().is_empty());
        assert!(job_exists(&conn, "future").unwrap());
    }

    #[test]
    fn claimed_job_cannot_be_cancelled() {
        let conn = conn();
        let now = Utc::now();
        upsert_job(&conn, &job("r1", now)).unwrap();
        assert_eq!(claim_due(&conn, now, 10).unwrap().len(), 1);
        assert!(!delete_job(&conn, "r1").unwrap());
        assert!(matches!(
            upsert_job(&conn, &job("r1", now + Duration::hours(1))),
            Err(ReminderError::InvalidTransition { .. })
        ));

        // The stamp keeps the row until the outcome is recorded.
        assert!(job_exists(&conn, "r1").unwrap());
        assert!(claim_due(&conn, now, 10).unwrap().is_empty());
        assert_eq!(next_run_at(&conn).unwrap(), None);
        complete_job(&conn, "r1").unwrap();
        assert!(!job_exists(&conn, "r1").unwrap());
    }

    #[test]
    fn take_stale_collects_claimed_and_overdue_rows() {
        let conn = conn();
        let now = Utc::now();
        upsert_job(&conn, &job("claimed", now - Duration::seconds(5))).unwrap();
        claim_due(&conn, now - Duration::seconds(1), 10).unwrap();
        upsert_job(&conn, &job("overdue", now - Duration::milliseconds(500))).unwrap();
        upsert_job(&conn, &job("future", now + Duration::minutes(5))).unwrap();

        let mut stale = take_stale(&conn, now).unwrap();
        stale.sort();
        assert_eq!(stale, ["claimed", "overdue"]);
        assert!(job_exists(&conn, "future").unwrap());
    }

    #[test]
    fn corrupt_job_settles_its_reminder_as_missed() {
        let conn = conn();
        conn.execute(
            "INSERT INTO reminders (id, agent_id, device_id, mac_address, remind_at,
                 remind_at_local, title, content, use_llm, status, created_at, updated_at)
             VALUES ('r1', 'a', 'd', 'm', '2030-01-01T00:00:00Z', '2030-01-01T00:00:00Z',
                 't', 'c', 0, 'PENDING', '2030-01-01T00:00:00Z', '2030-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO reminder_jobs (id, run_at, payload_json) VALUES ('r1', 0, 'not json')",
            [],
        )
        .unwrap();

        assert!(claim_due(&conn, Utc::now(), 10).unwrap().is_empty());
        assert!(!job_exists(&conn, "r1").unwrap());
        let stored = store::get_reminder(&conn, "r1").unwrap();
        assert_eq!(stored.status, ReminderStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some(MISSED_ERROR));
    }

    #[test]
    fn upsert_replaces_and_next_run_at_tracks_minimum() {
        let conn = conn();
        let now = Utc::now();
        assert_eq!(next_run_at(&conn).unwrap(), None);

        upsert_job(&conn, &job("r1", now + Duration::hours(2))).unwrap();
        upsert_job(&conn, &job("r1", now + Duration::hours(1))).unwrap();
        let next = next_run_at(&conn).unwrap().unwrap();
        assert_eq!(
            next.timestamp_millis(),
            (now + Duration::hours(1)).timestamp_millis()
        );

        assert!(delete_job(&conn, "r1").unwrap());
        assert!(!delete_job(&conn, "r1").unwrap());
    }
}
