//! Gmail API HTTP client
//!
//! Implements [`MailboxClient`] on top of the Gmail REST API.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::time::Duration;

use super::api::{HistoryResponse, ListMessagesResponse, MessageRef, ProfileResponse, RawMessage};
use super::normalize::{normalize_message, parse_history_id};
use crate::error::MailboxError;
use crate::mailbox::{FullFetch, IncrementalFetch, MailboxClient};
use crate::models::{Cursor, MailboxConnection, NormalizedMessage, Receiver, ReceiverId};

/// Failure of a single Gmail API call
#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{what} returned HTTP {status}")]
    Status { what: &'static str, status: u16 },

    #[error("{what} request failed: {source}")]
    Transport {
        what: &'static str,
        #[source]
        source: ureq::Error,
    },

    #[error("failed to decode {what} response: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: ureq::Error,
    },
}

impl ApiError {
    fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Server-side and transport failures are worth another attempt
    fn is_transient(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::Transport { .. } => true,
            ApiError::Decode { .. } => false,
        }
    }

    fn into_mailbox_error(self, receiver: &ReceiverId) -> MailboxError {
        match self.status() {
            Some(401 | 403) => MailboxError::auth(receiver, &self),
            Some(_) => MailboxError::protocol(receiver, &self),
            None if matches!(self, ApiError::Transport { .. }) => {
                MailboxError::connection(receiver, &self)
            }
            None => MailboxError::protocol(receiver, &self),
        }
    }
}

/// Gmail mailbox client
///
/// The receiver's [`MailboxConnection::Gmail`] access token is sent as a
/// bearer token; refreshing it is the auth layer's job.
pub struct GmailMailboxClient {
    agent: ureq::Agent,
    base_url: String,
    request_timeout: Duration,
    max_retries: u32,
    /// Upper bound on messages pulled by a full fetch (None = whole mailbox)
    max_full_messages: Option<usize>,
}

impl Default for GmailMailboxClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GmailMailboxClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Page size for message listing (API maximum)
    const PAGE_SIZE: usize = 500;

    /// Default bound on a single HTTP request
    const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self {
            agent: Self::build_agent(Self::DEFAULT_REQUEST_TIMEOUT),
            base_url: Self::BASE_URL.to_string(),
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            max_retries: 3,
            max_full_messages: None,
        }
    }

    /// Point the client at another endpoint (proxies, test servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Bound every HTTP request, from connect to the end of the body.
    ///
    /// A server that accepts and never answers otherwise holds the blocking
    /// call (and the receiver's lease) indefinitely.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.agent = Self::build_agent(timeout);
        self.request_timeout = timeout;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn build_agent(timeout: Duration) -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_max_full_messages(mut self, max: usize) -> Self {
        self.max_full_messages = Some(max);
        self
    }

    /// Extract the bearer token, rejecting non-Gmail receivers
    fn access_token<'a>(&self, receiver: &'a Receiver) -> Result<&'a str, MailboxError> {
        match &receiver.connection {
            MailboxConnection::Gmail { access_token, .. } => Ok(access_token),
            other => Err(MailboxError::Unsupported {
                receiver: receiver.id.clone(),
                provider: other.provider().to_string(),
            }),
        }
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        token: &str,
        url: &str,
        what: &'static str,
    ) -> Result<T, ApiError> {
        let response = self
            .agent
            .get(url)
            .header("Authorization", &format!("Bearer {}", token))
            .call();

        match response {
            Ok(mut resp) => resp
                .body_mut()
                .read_json()
                .map_err(|source| ApiError::Decode { what, source }),
            Err(ureq::Error::StatusCode(status)) => Err(ApiError::Status { what, status }),
            Err(source) => Err(ApiError::Transport { what, source }),
        }
    }

    /// Current mailbox history id
    fn get_profile(&self, token: &str) -> Result<ProfileResponse, ApiError> {
        let url = format!("{}/users/me/profile", self.base_url);
        self.get_json(token, &url, "profile")
    }

    /// List one page of message IDs
    fn list_messages(&self, token: &str, page_token: Option<&str>) -> Result<ListMessagesResponse, ApiError> {
        let mut url = format!(
            "{}/users/me/messages?maxResults={}",
            self.base_url,
            Self::PAGE_SIZE
        );
        if let Some(page) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(page)));
        }
        self.get_json(token, &url, "list messages")
    }

    /// List message IDs across all pages, up to `max_full_messages`
    fn list_messages_all(&self, token: &str) -> Result<Vec<MessageRef>, ApiError> {
        let mut all_messages = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            if let Some(max) = self.max_full_messages
                && all_messages.len() >= max
            {
                break;
            }

            let response = self.list_messages(token, page_token.as_deref())?;
            all_messages.extend(response.messages.unwrap_or_default());

            match response.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        if let Some(max) = self.max_full_messages {
            all_messages.truncate(max);
        }
        Ok(all_messages)
    }

    /// List history pages since `start`, following pagination
    ///
    /// Returns `Ok(None)` when Gmail no longer knows the start id (404).
    fn list_history_all(
        &self,
        token: &str,
        start: Cursor,
    ) -> Result<Option<(Vec<MessageRef>, Option<String>)>, ApiError> {
        let mut added = Vec::new();
        let mut latest_history_id = None;
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/users/me/history?startHistoryId={}&historyTypes=messageAdded",
                self.base_url, start
            );
            if let Some(page) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(page)));
            }

            let response: HistoryResponse = match self.get_json(token, &url, "history") {
                Ok(response) => response,
                Err(ApiError::Status { status: 404, .. }) => return Ok(None),
                Err(e) => return Err(e),
            };

            for record in response.history.unwrap_or_default() {
                for entry in record.messages_added.unwrap_or_default() {
                    added.push(entry.message);
                }
            }
            if response.history_id.is_some() {
                latest_history_id = response.history_id;
            }

            match response.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(Some((added, latest_history_id)))
    }

    /// Fetch one raw message
    ///
    /// Returns `Ok(None)` if the message was deleted before we got to it.
    fn get_raw_message(&self, token: &str, id: &str) -> Result<Option<RawMessage>, ApiError> {
        let url = format!("{}/users/me/messages/{}?format=raw", self.base_url, id);
        match self.get_json(token, &url, "get message") {
            Ok(message) => Ok(Some(message)),
            Err(ApiError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Get a message with exponential backoff retry on transient failures
    fn get_raw_message_with_retry(&self, token: &str, id: &str) -> Result<Option<RawMessage>, ApiError> {
        let mut delay = Duration::from_millis(100);
        let mut attempt = 1;

        loop {
            match self.get_raw_message(token, id) {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    log::debug!("Retrying message {} after error: {}", id, e);
                    let jitter = Duration::from_millis(rand_jitter());
                    std::thread::sleep(delay + jitter);
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Download and normalize messages, skipping ids seen twice or deleted
    fn fetch_messages(
        &self,
        receiver: &Receiver,
        token: &str,
        refs: Vec<MessageRef>,
    ) -> Result<Vec<NormalizedMessage>, MailboxError> {
        let mut seen = HashSet::new();
        let mut messages = Vec::with_capacity(refs.len());

        for msg_ref in refs {
            if !seen.insert(msg_ref.id.clone()) {
                continue;
            }
            let raw = self
                .get_raw_message_with_retry(token, &msg_ref.id)
                .map_err(|e| e.into_mailbox_error(&receiver.id))?;
            let Some(raw) = raw else {
                log::debug!("{}: message {} vanished before fetch", receiver.id, msg_ref.id);
                continue;
            };
            let message = normalize_message(raw, &receiver.id)
                .map_err(|e| MailboxError::protocol(&receiver.id, e))?;
            messages.push(message);
        }

        Ok(messages)
    }
}

impl MailboxClient for GmailMailboxClient {
    fn fetch_incremental(&self, receiver: &Receiver) -> Result<IncrementalFetch, MailboxError> {
        let token = self.access_token(receiver)?;
        let Some(start) = receiver.cursor else {
            // No watermark yet: only a full fetch can establish one
            return Err(MailboxError::CursorExpired {
                receiver: receiver.id.clone(),
            });
        };

        let (refs, history_id) = self
            .list_history_all(token, start)
            .map_err(|e| e.into_mailbox_error(&receiver.id))?
            .ok_or_else(|| MailboxError::CursorExpired {
                receiver: receiver.id.clone(),
            })?;

        let messages = self.fetch_messages(receiver, token, refs)?;
        let cursor = history_id
            .as_deref()
            .map(parse_history_id)
            .transpose()
            .map_err(|e| MailboxError::protocol(&receiver.id, e))?;

        Ok(IncrementalFetch { messages, cursor })
    }

    fn fetch_full(&self, receiver: &Receiver) -> Result<FullFetch, MailboxError> {
        let token = self.access_token(receiver)?;

        // Capture the history id before listing so that anything arriving
        // during the listing is picked up by the next incremental run.
        let profile = self
            .get_profile(token)
            .map_err(|e| e.into_mailbox_error(&receiver.id))?;
        let cursor = parse_history_id(&profile.history_id)
            .map_err(|e| MailboxError::protocol(&receiver.id, e))?;

        let refs = self
            .list_messages_all(token)
            .map_err(|e| e.into_mailbox_error(&receiver.id))?;
        log::debug!(
            "{}: full listing returned {} of ~{} messages",
            receiver.id,
            refs.len(),
            profile.messages_total.unwrap_or_default()
        );

        let messages = self.fetch_messages(receiver, token, refs)?;
        Ok(FullFetch {
            messages,
            cursor: Some(cursor),
        })
    }
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver(connection: MailboxConnection) -> Receiver {
        Receiver::new(ReceiverId::new("acme", "support"), connection)
    }

    #[test]
    fn test_rejects_non_gmail_connection() {
        let client = GmailMailboxClient::new();
        let r = receiver(MailboxConnection::Custom {
            provider: "imap".to_string(),
            settings: Default::default(),
        });

        let err = client.fetch_full(&r).unwrap_err();
        assert!(matches!(err, MailboxError::Unsupported { ref provider, .. } if provider == "imap"));
    }

    #[test]
    fn test_incremental_without_cursor_requests_full() {
        let client = GmailMailboxClient::new();
        let r = receiver(MailboxConnection::gmail("support@acme.test", "token"));

        let err = client.fetch_incremental(&r).unwrap_err();
        assert_eq!(err, MailboxError::CursorExpired { receiver: r.id.clone() });
    }

    #[test]
    fn test_api_error_classification() {
        let id = ReceiverId::new("acme", "support");
        let auth = ApiError::Status { what: "history", status: 401 }.into_mailbox_error(&id);
        assert!(matches!(auth, MailboxError::Auth { .. }));

        let protocol = ApiError::Status { what: "history", status: 400 }.into_mailbox_error(&id);
        assert!(matches!(protocol, MailboxError::Protocol { .. }));

        assert!(ApiError::Status { what: "get message", status: 503 }.is_transient());
        assert!(ApiError::Status { what: "get message", status: 429 }.is_transient());
        assert!(!ApiError::Status { what: "get message", status: 404 }.is_transient());
    }

    #[test]
    fn test_silent_server_times_out() {
        use std::net::TcpListener;
        use std::time::Instant;

        // Accepts connections and never answers
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming() {
                held.push(stream);
            }
        });

        let client = GmailMailboxClient::new()
            .with_base_url(format!("http://{}", addr))
            .with_request_timeout(Duration::from_millis(200))
            .with_max_retries(1);
        let r = receiver(MailboxConnection::gmail("support@acme.test", "token"))
            .with_cursor(Cursor::new(7));

        let start = Instant::now();
        let err = client.fetch_incremental(&r).unwrap_err();
        assert!(matches!(err, MailboxError::Connection { .. }), "{:?}", err);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = GmailMailboxClient::new().with_base_url("http://localhost:8080/gmail/v1/");
        assert_eq!(client.base_url, "http://localhost:8080/gmail/v1");
    }
}
