//! In-memory receiver directory and inbox
//!
//! Used by tests and for embedding the engine without a database.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use super::{InboxWriter, ReceiverDirectory};
use crate::error::{DirectoryError, WriteError};
use crate::models::{
    Cursor, ExternalMessageId, MailboxConnection, NormalizedMessage, Receiver, ReceiverId,
};

/// In-memory implementation of [`ReceiverDirectory`] and [`InboxWriter`]
///
/// Receivers are kept in registration order so `list_active` is stable.
#[derive(Default)]
pub struct InMemoryInbox {
    receivers: RwLock<Vec<Receiver>>,
    /// receiver -> external id -> stored message
    messages: RwLock<HashMap<ReceiverId, BTreeMap<ExternalMessageId, NormalizedMessage>>>,
}

impl InMemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a receiver (tenant administration)
    pub fn register_receiver(&self, receiver: Receiver) {
        let mut receivers = self.receivers.write().unwrap_or_else(PoisonError::into_inner);
        match receivers.iter_mut().find(|r| r.id == receiver.id) {
            Some(existing) => *existing = receiver,
            None => receivers.push(receiver),
        }
    }

    /// Activate or deactivate a receiver. Returns false if unknown.
    pub fn set_active(&self, id: &ReceiverId, active: bool) -> bool {
        self.modify(id, |r| r.active = active)
    }

    /// Replace a receiver's connection parameters. Returns false if unknown.
    pub fn update_connection(&self, id: &ReceiverId, connection: MailboxConnection) -> bool {
        self.modify(id, |r| r.connection = connection)
    }

    /// Current snapshot of a receiver
    pub fn get_receiver(&self, id: &ReceiverId) -> Option<Receiver> {
        let receivers = self.receivers.read().unwrap_or_else(PoisonError::into_inner);
        receivers.iter().find(|r| &r.id == id).cloned()
    }

    /// Number of messages stored for a receiver
    pub fn message_count(&self, id: &ReceiverId) -> usize {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        messages.get(id).map_or(0, BTreeMap::len)
    }

    pub fn has_message(&self, id: &ReceiverId, external_id: &ExternalMessageId) -> bool {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        messages.get(id).is_some_and(|m| m.contains_key(external_id))
    }

    /// Stored messages for a receiver, ordered by external id
    pub fn messages_for(&self, id: &ReceiverId) -> Vec<NormalizedMessage> {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        messages
            .get(id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn modify(&self, id: &ReceiverId, f: impl FnOnce(&mut Receiver)) -> bool {
        let mut receivers = self.receivers.write().unwrap_or_else(PoisonError::into_inner);
        match receivers.iter_mut().find(|r| &r.id == id) {
            Some(receiver) => {
                f(receiver);
                true
            }
            None => false,
        }
    }
}

impl ReceiverDirectory for InMemoryInbox {
    fn list_active(&self) -> Result<Vec<Receiver>, DirectoryError> {
        let receivers = self.receivers.read().unwrap_or_else(PoisonError::into_inner);
        Ok(receivers.iter().filter(|r| r.active).cloned().collect())
    }

    fn get(&self, id: &ReceiverId) -> Result<Option<Receiver>, DirectoryError> {
        Ok(self.get_receiver(id))
    }
}

impl InboxWriter for InMemoryInbox {
    fn upsert(
        &self,
        receiver: &ReceiverId,
        messages: &[NormalizedMessage],
    ) -> Result<usize, WriteError> {
        let mut store = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        let stored = store.entry(receiver.clone()).or_default();

        let mut inserted = 0;
        for message in messages {
            if !stored.contains_key(&message.external_id) {
                stored.insert(message.external_id.clone(), message.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn advance_cursor(&self, receiver: &ReceiverId, cursor: Cursor) -> Result<bool, WriteError> {
        let mut receivers = self.receivers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = receivers.iter_mut().find(|r| &r.id == receiver) else {
            return Err(WriteError::new(receiver, "unknown receiver"));
        };

        if !cursor.advances(stored.cursor) {
            return Ok(false);
        }
        stored.cursor = Some(cursor);
        Ok(true)
    }

    fn mark_full_sync(&self, receiver: &ReceiverId, at: DateTime<Utc>) -> Result<(), WriteError> {
        if self.modify(receiver, |r| r.last_full_sync_at = Some(at)) {
            Ok(())
        } else {
            Err(WriteError::new(receiver, "unknown receiver"))
        }
    }
}
