//! Receiver directory and inbox storage
//!
//! The engine only sees the [`ReceiverDirectory`] and [`InboxWriter`]
//! traits. Two backends implement both: an in-memory store for tests and
//! embedding, and SQLite for the daemon.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryInbox;
pub use sqlite::SqliteInbox;
pub use traits::{InboxWriter, ReceiverDirectory};
