//! Scheduled one-shot reminders.
//!
//! A reminder row lives in `reminders`; its pending fire lives in
//! `reminder_jobs`. The [`ReminderScheduler`] claims due jobs atomically and
//! hands them to a [`Notifier`], then records the outcome on the reminder.
//! [`ReminderService`] is the entry point for creating and deleting
//! reminders from the HTTP layer.

mod error;
pub mod jobs;
mod scheduler;
mod service;
pub mod store;

pub use error::ReminderError;
pub use jobs::{JobPayload, ReminderJob};
pub use scheduler::{Notifier, ReminderScheduler, SchedulerConfig, MISSED_ERROR};
pub use service::{parse_remind_at, CreateReminder, ReminderService};
pub use store::{NewReminder, Reminder};
