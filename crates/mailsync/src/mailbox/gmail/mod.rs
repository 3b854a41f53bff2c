//! Gmail REST API adapter
//!
//! This module provides:
//! - Gmail API response types
//! - A blocking [`MailboxClient`](super::MailboxClient) over the history and
//!   messages endpoints
//! - Normalization of raw Gmail messages

mod client;
mod normalize;

pub use client::GmailMailboxClient;
pub use normalize::{normalize_message, parse_history_id};

/// Gmail API response types
pub mod api {
    use serde::Deserialize;

    /// Response from the profile endpoint
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProfileResponse {
        pub email_address: String,
        pub messages_total: Option<u64>,
        pub history_id: String,
    }

    /// Response from listing messages
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: Option<String>,
    }

    /// Message fetched with `format=raw`
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RawMessage {
        pub id: String,
        pub thread_id: Option<String>,
        pub history_id: Option<String>,
        /// Milliseconds since epoch, as a string
        pub internal_date: Option<String>,
        /// base64url-encoded RFC 5322 message
        pub raw: String,
    }

    /// Response from the history endpoint
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
        /// Current mailbox history id
        pub history_id: Option<String>,
    }

    /// One history record
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub id: String,
        pub messages_added: Option<Vec<MessageAdded>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct MessageAdded {
        pub message: MessageRef,
    }

}
