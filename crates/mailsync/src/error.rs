//! Error taxonomy of the sync engine
//!
//! Receiver-level errors ([`MailboxError`], [`WriteError`], [`SyncError`]) are
//! contained by the sync worker and recorded as outcomes. [`GuardBusy`] is a
//! skip signal, not a failure. Nothing here is fatal to the scheduler.

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

use crate::models::{ReceiverId, Tier};

/// Remote fetch failed for one receiver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailboxError {
    #[error("{receiver}: connection to mailbox failed: {cause}")]
    Connection { receiver: ReceiverId, cause: String },

    #[error("{receiver}: mailbox rejected credentials: {cause}")]
    Auth { receiver: ReceiverId, cause: String },

    #[error("{receiver}: mailbox protocol error: {cause}")]
    Protocol { receiver: ReceiverId, cause: String },

    #[error("{receiver}: sync cursor expired or unknown to the mailbox")]
    CursorExpired { receiver: ReceiverId },

    #[error("{receiver}: connection kind '{provider}' is not supported by this client")]
    Unsupported { receiver: ReceiverId, provider: String },
}

impl MailboxError {
    pub fn connection(receiver: &ReceiverId, cause: impl Display) -> Self {
        Self::Connection {
            receiver: receiver.clone(),
            cause: format!("{:#}", cause),
        }
    }

    pub fn auth(receiver: &ReceiverId, cause: impl Display) -> Self {
        Self::Auth {
            receiver: receiver.clone(),
            cause: format!("{:#}", cause),
        }
    }

    pub fn protocol(receiver: &ReceiverId, cause: impl Display) -> Self {
        Self::Protocol {
            receiver: receiver.clone(),
            cause: format!("{:#}", cause),
        }
    }

    /// The receiver whose mailbox failed
    pub fn receiver(&self) -> &ReceiverId {
        match self {
            Self::Connection { receiver, .. }
            | Self::Auth { receiver, .. }
            | Self::Protocol { receiver, .. }
            | Self::CursorExpired { receiver }
            | Self::Unsupported { receiver, .. } => receiver,
        }
    }
}

/// Persisting messages or sync bookkeeping failed for one receiver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{receiver}: inbox write failed: {cause}")]
pub struct WriteError {
    pub receiver: ReceiverId,
    pub cause: String,
}

impl WriteError {
    pub fn new(receiver: &ReceiverId, cause: impl Display) -> Self {
        Self {
            receiver: receiver.clone(),
            cause: format!("{:#}", cause),
        }
    }
}

/// The receiver directory could not be queried
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("receiver directory unavailable: {cause}")]
pub struct DirectoryError {
    pub cause: String,
}

impl DirectoryError {
    pub fn new(cause: impl Display) -> Self {
        Self {
            cause: format!("{:#}", cause),
        }
    }
}

/// Why a single receiver sync did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("sync did not finish within {0:?}")]
    Timeout(Duration),

    #[error("receiver is already being synced")]
    ReceiverBusy,

    #[error("sync task aborted: {0}")]
    Aborted(String),
}

/// A run of this tier is already in progress; the tick is dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0} sync already running")]
pub struct GuardBusy(pub Tier);

/// A manual trigger could not start
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("receiver {0} not found")]
    NotFound(ReceiverId),

    #[error("receiver {0} is inactive")]
    Inactive(ReceiverId),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_error_carries_receiver() {
        let id = ReceiverId::new("acme", "support");
        let err = MailboxError::auth(&id, "invalid_grant");
        assert_eq!(err.receiver(), &id);
        assert_eq!(
            err.to_string(),
            "acme/support: mailbox rejected credentials: invalid_grant"
        );
    }

    #[test]
    fn test_anyhow_chain_is_flattened() {
        let id = ReceiverId::new("acme", "support");
        let cause = anyhow::anyhow!("connection reset").context("Failed to list history");
        let err = WriteError::new(&id, cause);
        assert_eq!(err.cause, "Failed to list history: connection reset");
    }

    #[test]
    fn test_sync_error_is_transparent() {
        let id = ReceiverId::new("acme", "support");
        let err: SyncError = MailboxError::CursorExpired { receiver: id }.into();
        assert_eq!(
            err.to_string(),
            "acme/support: sync cursor expired or unknown to the mailbox"
        );
    }
}
