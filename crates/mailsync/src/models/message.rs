//! Normalized message model produced by mailbox clients

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ReceiverId;

/// Identifier of a message in the remote mailbox
///
/// Together with the receiver this is the dedup key of the inbox store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalMessageId(pub String);

impl ExternalMessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ExternalMessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExternalMessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ExternalMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message fetched from a receiver, ready for the inbox writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub external_id: ExternalMessageId,
    pub receiver_id: ReceiverId,
    /// Raw RFC 5322 content as delivered by the remote mailbox
    pub raw: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl NormalizedMessage {
    pub fn new(
        receiver_id: ReceiverId,
        external_id: impl Into<ExternalMessageId>,
        raw: impl Into<Vec<u8>>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            receiver_id,
            raw: raw.into(),
            received_at,
        }
    }
}
