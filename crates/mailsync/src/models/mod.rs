//! Domain models for the sync engine

mod message;
mod receiver;
mod sync_run;

pub use message::{ExternalMessageId, NormalizedMessage};
pub use receiver::{Cursor, MailboxConnection, Receiver, ReceiverId};
pub use sync_run::{ParseTierError, ReceiverOutcome, SyncReport, SyncRun, Tier, TriggerOrigin};
