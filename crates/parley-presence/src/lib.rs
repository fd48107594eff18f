//! Device presence for Parley.
//!
//! A device is "online" while its presence key exists in the shared
//! key-value store. The tracker writes the key when a WebSocket session is
//! registered and deletes it when the session ends. Every read and write is
//! best-effort: a store outage is logged and reported as "offline", never
//! raised into the caller's control flow.
//!
//! Keys:
//!
//! | Key | Use |
//! |-----|-----|
//! | `device:{id}:status` | canonical, JSON [`parley_types::DeviceStatus`] |
//! | `config:device:{id}:status` | legacy, read-only fallback |

mod kv;
mod tracker;

pub use kv::{glob_match, KvError, KvStore, MemoryKvStore, SqliteKvStore};
pub use tracker::{legacy_status_key, status_key, PresenceTracker, STATUS_KEY_PATTERN};
