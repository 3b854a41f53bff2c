//! Sync tiers, per-receiver outcomes and the run record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{Cursor, ReceiverId};
use crate::error::SyncError;

/// One of the two sync cadences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Frequent, cheap: only messages since the receiver's cursor
    Incremental,
    /// Daily reconciliation against the complete mailbox
    Full,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Incremental, Tier::Full];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Incremental => "incremental",
            Tier::Full => "full",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sync tier '{0}' (expected 'incremental' or 'full')")]
pub struct ParseTierError(pub String);

impl FromStr for Tier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" => Ok(Tier::Incremental),
            "full" => Ok(Tier::Full),
            other => Err(ParseTierError(other.to_string())),
        }
    }
}

/// What started a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOrigin {
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerOrigin::Scheduled => f.write_str("scheduled"),
            TriggerOrigin::Manual => f.write_str("manual"),
        }
    }
}

/// Statistics from one successful receiver sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Tier actually executed (differs from the request after a fallback)
    pub tier: Tier,
    /// Number of messages returned by the mailbox
    pub messages_fetched: usize,
    /// Number of messages stored for the first time
    pub messages_inserted: usize,
    /// Number of messages already present in the inbox
    pub messages_skipped: usize,
    /// New cursor, if it moved
    pub cursor_advanced_to: Option<Cursor>,
    /// Incremental request served by a full fetch after the cursor expired
    pub fell_back_to_full: bool,
}

impl SyncReport {
    pub fn new(tier: Tier, messages_fetched: usize, messages_inserted: usize) -> Self {
        Self {
            tier,
            messages_fetched,
            messages_inserted,
            messages_skipped: messages_fetched.saturating_sub(messages_inserted),
            cursor_advanced_to: None,
            fell_back_to_full: false,
        }
    }
}

/// Recorded result of syncing one receiver
#[derive(Debug, Clone)]
pub struct ReceiverOutcome {
    pub receiver_id: ReceiverId,
    /// Tier that was requested
    pub tier: Tier,
    pub result: Result<SyncReport, SyncError>,
    pub duration_ms: u64,
}

impl ReceiverOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn report(&self) -> Option<&SyncReport> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&SyncError> {
        self.result.as_ref().err()
    }
}

/// One execution of a tier, scheduled or manual
///
/// Kept in memory only: published to subscribers and retained in a bounded
/// history for diagnostics.
#[derive(Debug, Clone)]
pub struct SyncRun {
    pub id: u64,
    pub tier: Tier,
    pub origin: TriggerOrigin,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcomes in the order the receivers were visited
    pub outcomes: Vec<ReceiverOutcome>,
    /// Set when the receiver directory could not be queried
    pub directory_error: Option<String>,
}

impl SyncRun {
    pub fn start(id: u64, tier: Tier, origin: TriggerOrigin) -> Self {
        Self {
            id,
            tier,
            origin,
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
            directory_error: None,
        }
    }

    pub fn record(&mut self, outcome: ReceiverOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Find the outcome recorded for a receiver
    pub fn outcome_for(&self, receiver_id: &ReceiverId) -> Option<&ReceiverOutcome> {
        self.outcomes.iter().find(|o| &o.receiver_id == receiver_id)
    }
}
