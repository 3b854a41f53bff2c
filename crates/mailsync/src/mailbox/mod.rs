//! Remote mailbox access
//!
//! A [`MailboxClient`] turns a receiver's remote mailbox into
//! [`NormalizedMessage`]s. Clients are blocking and executor-agnostic; the
//! sync worker runs them on the blocking pool under a timeout.

pub mod gmail;

use crate::error::MailboxError;
use crate::models::{Cursor, NormalizedMessage, Receiver};

pub use gmail::GmailMailboxClient;

/// Result of an incremental fetch
#[derive(Debug, Clone, Default)]
pub struct IncrementalFetch {
    /// Messages received since the receiver's cursor
    pub messages: Vec<NormalizedMessage>,
    /// Watermark covering everything returned
    pub cursor: Option<Cursor>,
}

/// Result of a full fetch
#[derive(Debug, Clone, Default)]
pub struct FullFetch {
    /// Every message currently in the mailbox
    pub messages: Vec<NormalizedMessage>,
    /// Watermark observed before listing started, if the provider has one
    pub cursor: Option<Cursor>,
}

/// Client for a receiver's remote mailbox
pub trait MailboxClient: Send + Sync {
    /// Fetch messages received since `receiver.cursor`.
    ///
    /// Fails with [`MailboxError::CursorExpired`] when the remote side can no
    /// longer answer "since" queries for that cursor (or there is none yet).
    fn fetch_incremental(&self, receiver: &Receiver) -> Result<IncrementalFetch, MailboxError>;

    /// Fetch the complete current mailbox state
    fn fetch_full(&self, receiver: &Receiver) -> Result<FullFetch, MailboxError>;
}
