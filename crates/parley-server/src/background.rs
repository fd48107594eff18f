//! Background tasks for the Parley server.

use crate::AppState;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Starts the reminder scheduler loop.
///
/// Jobs that came due while the process was down are handled on the first
/// pass: within the grace window they fire, beyond it they are recorded as
/// missed.
pub fn start_reminder_scheduler(state: &AppState, shutdown: CancellationToken) -> JoinHandle<()> {
    let scheduler = state.scheduler().clone();
    tokio::spawn(scheduler.run(shutdown))
}
