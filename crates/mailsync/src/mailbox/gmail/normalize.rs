//! Gmail API response normalization
//!
//! Converts raw Gmail messages to [`NormalizedMessage`]s.

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::{TimeZone, Utc};

use super::api::RawMessage;
use crate::models::{Cursor, NormalizedMessage, ReceiverId};

/// Normalize a `format=raw` Gmail message for the inbox writer
pub fn normalize_message(gmail_msg: RawMessage, receiver: &ReceiverId) -> Result<NormalizedMessage> {
    // Gmail emits base64url, with or without padding
    let raw = BASE64_URL_SAFE_NO_PAD
        .decode(gmail_msg.raw.trim_end_matches('='))
        .with_context(|| format!("Message {} has invalid raw content", gmail_msg.id))?;

    // Parse internal date (milliseconds since epoch)
    let internal_date: i64 = gmail_msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);
    let received_at = Utc
        .timestamp_millis_opt(internal_date)
        .single()
        .filter(|_| internal_date > 0)
        .unwrap_or_else(Utc::now);

    Ok(NormalizedMessage::new(
        receiver.clone(),
        gmail_msg.id,
        raw,
        received_at,
    ))
}

/// Parse a Gmail history id into a cursor
pub fn parse_history_id(history_id: &str) -> Result<Cursor> {
    history_id
        .trim()
        .parse::<u64>()
        .map(Cursor::new)
        .with_context(|| format!("Invalid history id '{}'", history_id))
}
