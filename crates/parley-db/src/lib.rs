//! SQLite storage shared by the presence store and the reminder engine.
//!
//! One pool per process; migrations run once at startup before any store is
//! built on top of it.

mod blocking;
mod migrations;
mod pool;

pub use blocking::{with_conn, TaskError};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, PoolError, PoolSettings, MEMORY_PATH};
