//! Collaborator contracts for receiver lookup and inbox persistence

use chrono::{DateTime, Utc};

use crate::error::{DirectoryError, WriteError};
use crate::models::{Cursor, NormalizedMessage, Receiver, ReceiverId};

/// Source of mailbox configurations for all tenants
///
/// Implementations are blocking; the engine calls them from the blocking pool.
pub trait ReceiverDirectory: Send + Sync {
    /// List receivers with `active == true`, in a stable order
    fn list_active(&self) -> Result<Vec<Receiver>, DirectoryError>;

    /// Look up one receiver regardless of its active flag
    fn get(&self, id: &ReceiverId) -> Result<Option<Receiver>, DirectoryError>;
}

/// Tenant inbox store
pub trait InboxWriter: Send + Sync {
    /// Store messages for a receiver, returning how many were new.
    ///
    /// Idempotent on the external message id: a message already stored for
    /// this receiver is skipped, never duplicated.
    fn upsert(&self, receiver: &ReceiverId, messages: &[NormalizedMessage])
    -> Result<usize, WriteError>;

    /// Move the receiver's incremental cursor forward.
    ///
    /// Returns `false` (and leaves the stored cursor untouched) if `cursor`
    /// is not ahead of the stored one.
    fn advance_cursor(&self, receiver: &ReceiverId, cursor: Cursor) -> Result<bool, WriteError>;

    /// Record completion of a full reconciliation
    fn mark_full_sync(&self, receiver: &ReceiverId, at: DateTime<Utc>) -> Result<(), WriteError>;
}
