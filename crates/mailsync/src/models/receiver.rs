//! Receiver model: a tenant's configured external mailbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tenant-scoped identifier of a receiver
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiverId {
    /// Owning tenant (organization) identifier
    pub tenant_id: String,
    /// Receiver identifier, unique within the tenant
    pub id: String,
}

impl ReceiverId {
    pub fn new(tenant_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.id)
    }
}

/// Incremental sync watermark
///
/// Opaque to the engine apart from its ordering: a Gmail history id, an IMAP
/// UID or a timestamp in milliseconds all fit. A receiver's cursor only ever
/// moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor(pub u64);

impl Cursor {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// True if moving from `current` to `self` is a forward step
    pub fn advances(self, current: Option<Cursor>) -> bool {
        current.is_none_or(|c| self > c)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection parameters for a receiver's remote mailbox
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MailboxConnection {
    /// Gmail REST API with a bearer token managed by the auth layer
    Gmail {
        address: String,
        access_token: String,
    },
    /// Any other provider, handled by a custom `MailboxClient`
    Custom {
        provider: String,
        #[serde(default)]
        settings: BTreeMap<String, String>,
    },
}

impl MailboxConnection {
    pub fn gmail(address: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self::Gmail {
            address: address.into(),
            access_token: access_token.into(),
        }
    }

    /// Provider name used in logs
    pub fn provider(&self) -> &str {
        match self {
            Self::Gmail { .. } => "gmail",
            Self::Custom { provider, .. } => provider,
        }
    }
}

// Credentials must never reach the logs.
impl fmt::Debug for MailboxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gmail { address, .. } => f
                .debug_struct("Gmail")
                .field("address", address)
                .field("access_token", &"<redacted>")
                .finish(),
            Self::Custom { provider, settings } => f
                .debug_struct("Custom")
                .field("provider", provider)
                .field("settings", &settings.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

/// A tenant's mailbox kept in sync with the internal inbox store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receiver {
    pub id: ReceiverId,
    /// Human-readable label set by tenant administration
    pub display_name: Option<String>,
    pub connection: MailboxConnection,
    /// Inactive receivers are skipped by scheduled runs and manual triggers
    pub active: bool,
    /// Incremental watermark, None until the first successful sync
    pub cursor: Option<Cursor>,
    /// When the last full reconciliation completed
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

impl Receiver {
    /// Create an active receiver that has never been synced
    pub fn new(id: ReceiverId, connection: MailboxConnection) -> Self {
        Self {
            id,
            display_name: None,
            connection,
            active: true,
            cursor: None,
            last_full_sync_at: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_id_display() {
        let id = ReceiverId::new("acme", "support");
        assert_eq!(id.to_string(), "acme/support");
    }

    #[test]
    fn test_cursor_advances() {
        assert!(Cursor::new(5).advances(None));
        assert!(Cursor::new(6).advances(Some(Cursor::new(5))));
        assert!(!Cursor::new(5).advances(Some(Cursor::new(5))));
        assert!(!Cursor::new(4).advances(Some(Cursor::new(5))));
    }

    #[test]
    fn test_debug_redacts_token() {
        let conn = MailboxConnection::gmail("ops@acme.test", "ya29.secret-token");
        let debug = format!("{:?}", conn);
        assert!(debug.contains("ops@acme.test"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn test_connection_serialization_tagged() {
        let conn = MailboxConnection::gmail("ops@acme.test", "token");
        let json = serde_json::to_value(&conn).unwrap();
        assert_eq!(json["kind"], "gmail");

        let back: MailboxConnection = serde_json::from_value(json).unwrap();
        assert_eq!(back, conn);
    }

    #[test]
    fn test_custom_connection_defaults_settings() {
        let conn: MailboxConnection =
            serde_json::from_str(r#"{"kind":"custom","provider":"imap"}"#).unwrap();
        assert_eq!(conn.provider(), "imap");
        assert!(matches!(conn, MailboxConnection::Custom { settings, .. } if settings.is_empty()));
    }

    #[test]
    fn test_new_receiver_is_active_and_unsynced() {
        let receiver = Receiver::new(
            ReceiverId::new("acme", "sales"),
            MailboxConnection::gmail("sales@acme.test", "t"),
        );
        assert!(receiver.active);
        assert!(receiver.cursor.is_none());
        assert!(receiver.last_full_sync_at.is_none());
    }
}
