//! Sync engine
//!
//! Two tiers (incremental and full) driven by independent timers, guarded
//! against overlapping runs, with failures contained per receiver.

mod guard;
mod scheduler;
mod timer;
mod worker;

pub use guard::{ReceiverLease, ReceiverLocks, TierGuards, TierPermit, TierRunGuard};
pub use scheduler::{DEFAULT_HISTORY_SIZE, Scheduler, SchedulerHandle};
pub use timer::{CronTimer, ManualTimer, TickSender, TimerSource, normalize_cron, parse_cron};
pub use worker::SyncWorker;
