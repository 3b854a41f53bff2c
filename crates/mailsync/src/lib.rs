//! Mailsync crate - Mailbox synchronization engine
//!
//! Keeps every tenant's external mailbox ("receiver") mirrored into the
//! platform inbox store:
//! - Domain models (Receiver, Cursor, NormalizedMessage, SyncRun)
//! - Collaborator traits (ReceiverDirectory, MailboxClient, InboxWriter)
//!   with in-memory, SQLite and Gmail implementations
//! - Tier run guards and per-receiver locks
//! - Per-receiver sync worker with failure containment and timeouts
//! - Scheduler with cron timers and manual triggers

pub mod config;
pub mod error;
pub mod mailbox;
pub mod models;
pub mod storage;
pub mod sync;

pub use crate::config::{ConfigError, SyncConfig};
pub use error::{DirectoryError, GuardBusy, MailboxError, SyncError, TriggerError, WriteError};
pub use mailbox::{FullFetch, GmailMailboxClient, IncrementalFetch, MailboxClient};
pub use models::{
    Cursor, ExternalMessageId, MailboxConnection, NormalizedMessage, Receiver, ReceiverId,
    ReceiverOutcome, SyncReport, SyncRun, Tier, TriggerOrigin,
};
pub use storage::{InMemoryInbox, InboxWriter, ReceiverDirectory, SqliteInbox};
pub use sync::{
    CronTimer, ManualTimer, ReceiverLocks, Scheduler, SchedulerHandle, SyncWorker, TickSender,
    TierGuards, TierRunGuard, TimerSource,
};
