//! Per-receiver sync worker
//!
//! Runs exactly one sync (incremental or full) for exactly one receiver and
//! turns every failure into a recorded [`ReceiverOutcome`]. Nothing a single
//! mailbox does can abort the caller's iteration over other receivers.

use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::guard::ReceiverLocks;
use crate::error::{MailboxError, SyncError};
use crate::mailbox::MailboxClient;
use crate::models::{Receiver, ReceiverOutcome, SyncReport, Tier};
use crate::storage::InboxWriter;

/// Executes receiver syncs against the mailbox client and inbox writer
pub struct SyncWorker {
    mailbox: Arc<dyn MailboxClient>,
    inbox: Arc<dyn InboxWriter>,
    locks: Arc<ReceiverLocks>,
    timeout: Duration,
}

impl SyncWorker {
    pub fn new(
        mailbox: Arc<dyn MailboxClient>,
        inbox: Arc<dyn InboxWriter>,
        timeout: Duration,
    ) -> Self {
        Self {
            mailbox,
            inbox,
            locks: ReceiverLocks::new(),
            timeout,
        }
    }

    /// Receiver locks shared by every path that syncs a receiver
    pub fn locks(&self) -> &Arc<ReceiverLocks> {
        &self.locks
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sync one receiver. Never fails: the error is the outcome.
    pub async fn sync_receiver(&self, receiver: Receiver, tier: Tier) -> ReceiverOutcome {
        let start = Instant::now();
        let receiver_id = receiver.id.clone();
        let result = self.execute(receiver, tier).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(report) => info!(
                "{} {} sync ok: fetched={} inserted={} skipped={} cursor={}{} ({}ms)",
                receiver_id,
                tier,
                report.messages_fetched,
                report.messages_inserted,
                report.messages_skipped,
                report
                    .cursor_advanced_to
                    .map_or_else(|| "unchanged".to_string(), |c| c.to_string()),
                if report.fell_back_to_full { " [fell back to full]" } else { "" },
                duration_ms
            ),
            Err(e) => warn!("{} {} sync failed: {} ({}ms)", receiver_id, tier, e, duration_ms),
        }

        ReceiverOutcome {
            receiver_id,
            tier,
            result,
            duration_ms,
        }
    }

    async fn execute(&self, receiver: Receiver, tier: Tier) -> Result<SyncReport, SyncError> {
        let lease = self
            .locks
            .try_lock(&receiver.id)
            .ok_or(SyncError::ReceiverBusy)?;

        let mailbox = Arc::clone(&self.mailbox);
        let inbox = Arc::clone(&self.inbox);

        // The lease moves into the blocking task: if we time out below, the
        // receiver stays locked until the mailbox call really returns.
        let task = tokio::task::spawn_blocking(move || {
            let _lease = lease;
            match tier {
                Tier::Incremental => sync_incremental(mailbox.as_ref(), inbox.as_ref(), &receiver),
                Tier::Full => sync_full(mailbox.as_ref(), inbox.as_ref(), &receiver),
            }
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(SyncError::Aborted(join_error.to_string())),
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        }
    }
}

/// Fetch since the cursor, store, advance the cursor
///
/// Falls back to a full fetch when the mailbox no longer honours the cursor.
fn sync_incremental(
    mailbox: &dyn MailboxClient,
    inbox: &dyn InboxWriter,
    receiver: &Receiver,
) -> Result<SyncReport, SyncError> {
    let fetch = match mailbox.fetch_incremental(receiver) {
        Ok(fetch) => fetch,
        Err(MailboxError::CursorExpired { .. }) => {
            info!(
                "{}: cursor {} not usable, falling back to full sync",
                receiver.id,
                receiver
                    .cursor
                    .map_or_else(|| "<none>".to_string(), |c| c.to_string())
            );
            let mut report = sync_full(mailbox, inbox, receiver)?;
            report.fell_back_to_full = true;
            return Ok(report);
        }
        Err(e) => return Err(e.into()),
    };

    let inserted = inbox.upsert(&receiver.id, &fetch.messages)?;
    let mut report = SyncReport::new(Tier::Incremental, fetch.messages.len(), inserted);

    if let Some(cursor) = fetch.cursor
        && cursor.advances(receiver.cursor)
        && inbox.advance_cursor(&receiver.id, cursor)?
    {
        report.cursor_advanced_to = Some(cursor);
    }

    Ok(report)
}

/// Fetch the whole mailbox and reconcile through the idempotent writer
fn sync_full(
    mailbox: &dyn MailboxClient,
    inbox: &dyn InboxWriter,
    receiver: &Receiver,
) -> Result<SyncReport, SyncError> {
    let fetch = mailbox.fetch_full(receiver)?;
    let inserted = inbox.upsert(&receiver.id, &fetch.messages)?;
    let mut report = SyncReport::new(Tier::Full, fetch.messages.len(), inserted);

    if let Some(cursor) = fetch.cursor
        && cursor.advances(receiver.cursor)
        && inbox.advance_cursor(&receiver.id, cursor)?
    {
        report.cursor_advanced_to = Some(cursor);
    }

    inbox.mark_full_sync(&receiver.id, Utc::now())?;
    Ok(report)
}
