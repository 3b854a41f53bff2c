//! SQLite-backed receiver directory and inbox store

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::{InboxWriter, ReceiverDirectory};
use crate::error::{DirectoryError, WriteError};
use crate::models::{
    Cursor, ExternalMessageId, MailboxConnection, NormalizedMessage, Receiver, ReceiverId,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Mailbox configurations, owned by tenant administration
            CREATE TABLE receivers (
                tenant_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                display_name TEXT,
                connection TEXT NOT NULL,  -- JSON MailboxConnection
                active INTEGER NOT NULL DEFAULT 1,
                cursor INTEGER,
                last_full_sync_at TEXT,
                updated_at TEXT,           -- last change by administration
                PRIMARY KEY (tenant_id, receiver_id)
            );

            CREATE INDEX idx_receivers_active ON receivers(active);

            -- Inbox records, deduplicated per receiver on the external id
            CREATE TABLE inbox_messages (
                tenant_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                raw BLOB NOT NULL,
                received_at TEXT NOT NULL,
                stored_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (tenant_id, receiver_id, external_id)
            );

            CREATE INDEX idx_inbox_messages_received_at
                ON inbox_messages(tenant_id, receiver_id, received_at DESC);
            "#,
        ),
    ])
}

/// SQLite implementation of [`ReceiverDirectory`] and [`InboxWriter`]
pub struct SqliteInbox {
    conn: Mutex<Connection>,
}

impl SqliteInbox {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// In-memory database, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets the directory be read while a writer holds the database.
        // busy_timeout covers the daemon and an admin tool sharing the file.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // === Tenant administration ===

    /// Register a receiver, or replace its configuration if it exists.
    ///
    /// Sync bookkeeping (cursor, last full sync) of an existing receiver is
    /// preserved.
    pub fn register_receiver(&self, receiver: &Receiver) -> Result<()> {
        let connection = serde_json::to_string(&receiver.connection)?;
        let cursor = receiver.cursor.map(cursor_to_sql).transpose()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO receivers
                (tenant_id, receiver_id, display_name, connection, active, cursor,
                 last_full_sync_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (tenant_id, receiver_id) DO UPDATE SET
                display_name = excluded.display_name,
                connection = excluded.connection,
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                receiver.id.tenant_id,
                receiver.id.id,
                receiver.display_name,
                connection,
                receiver.active,
                cursor,
                receiver.last_full_sync_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Activate or deactivate a receiver. Returns false if unknown.
    pub fn set_active(&self, id: &ReceiverId, active: bool) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE receivers SET active = ?3, updated_at = ?4
             WHERE tenant_id = ?1 AND receiver_id = ?2",
            params![id.tenant_id, id.id, active, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Replace a receiver's connection parameters. Returns false if unknown.
    pub fn update_connection(&self, id: &ReceiverId, connection: &MailboxConnection) -> Result<bool> {
        let connection = serde_json::to_string(connection)?;
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE receivers SET connection = ?3, updated_at = ?4
             WHERE tenant_id = ?1 AND receiver_id = ?2",
            params![id.tenant_id, id.id, connection, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    // === Inspection ===

    pub fn get_receiver(&self, id: &ReceiverId) -> Result<Option<Receiver>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT tenant_id, receiver_id, display_name, connection, active, cursor,
                        last_full_sync_at
                 FROM receivers WHERE tenant_id = ?1 AND receiver_id = ?2",
                params![id.tenant_id, id.id],
                ReceiverRow::from_row,
            )
            .optional()?;
        row.map(ReceiverRow::into_receiver).transpose()
    }

    fn list_active_receivers(&self) -> Result<Vec<Receiver>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT tenant_id, receiver_id, display_name, connection, active, cursor,
                    last_full_sync_at
             FROM receivers WHERE active = 1
             ORDER BY tenant_id, receiver_id",
        )?;
        let rows = stmt
            .query_map([], ReceiverRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // A row that no longer decodes only takes its own receiver out of
        // the listing.
        let mut receivers = Vec::with_capacity(rows.len());
        for row in rows {
            let id = ReceiverId::new(row.tenant_id.clone(), row.receiver_id.clone());
            match row.into_receiver() {
                Ok(receiver) => receivers.push(receiver),
                Err(e) => warn!("Skipping receiver {}: {:#}", id, e),
            }
        }
        Ok(receivers)
    }

    pub fn message_count(&self, id: &ReceiverId) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM inbox_messages WHERE tenant_id = ?1 AND receiver_id = ?2",
            params![id.tenant_id, id.id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn has_message(&self, id: &ReceiverId, external_id: &ExternalMessageId) -> Result<bool> {
        let conn = self.conn();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM inbox_messages
                           WHERE tenant_id = ?1 AND receiver_id = ?2 AND external_id = ?3)",
            params![id.tenant_id, id.id, external_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // === Sync bookkeeping ===

    fn insert_messages(&self, receiver: &ReceiverId, messages: &[NormalizedMessage]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO inbox_messages
                    (tenant_id, receiver_id, external_id, raw, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for message in messages {
                inserted += stmt.execute(params![
                    receiver.tenant_id,
                    receiver.id,
                    message.external_id.as_str(),
                    message.raw,
                    message.received_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit().context("Failed to commit inbox batch")?;
        Ok(inserted)
    }

    fn store_cursor(&self, receiver: &ReceiverId, cursor: Cursor) -> Result<bool> {
        let value = cursor_to_sql(cursor)?;
        let conn = self.conn();
        let known: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM receivers WHERE tenant_id = ?1 AND receiver_id = ?2)",
            params![receiver.tenant_id, receiver.id],
            |row| row.get(0),
        )?;
        anyhow::ensure!(known, "unknown receiver");

        let changed = conn.execute(
            "UPDATE receivers SET cursor = ?3
             WHERE tenant_id = ?1 AND receiver_id = ?2 AND (cursor IS NULL OR cursor < ?3)",
            params![receiver.tenant_id, receiver.id, value],
        )?;
        Ok(changed > 0)
    }

    fn store_full_sync(&self, receiver: &ReceiverId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE receivers SET last_full_sync_at = ?3
             WHERE tenant_id = ?1 AND receiver_id = ?2",
            params![receiver.tenant_id, receiver.id, at.to_rfc3339()],
        )?;
        anyhow::ensure!(changed > 0, "unknown receiver");
        Ok(())
    }
}

impl ReceiverDirectory for SqliteInbox {
    fn list_active(&self) -> Result<Vec<Receiver>, DirectoryError> {
        self.list_active_receivers().map_err(DirectoryError::new)
    }

    fn get(&self, id: &ReceiverId) -> Result<Option<Receiver>, DirectoryError> {
        self.get_receiver(id).map_err(DirectoryError::new)
    }
}

impl InboxWriter for SqliteInbox {
    fn upsert(
        &self,
        receiver: &ReceiverId,
        messages: &[NormalizedMessage],
    ) -> Result<usize, WriteError> {
        self.insert_messages(receiver, messages)
            .map_err(|e| WriteError::new(receiver, e))
    }

    fn advance_cursor(&self, receiver: &ReceiverId, cursor: Cursor) -> Result<bool, WriteError> {
        self.store_cursor(receiver, cursor)
            .map_err(|e| WriteError::new(receiver, e))
    }

    fn mark_full_sync(&self, receiver: &ReceiverId, at: DateTime<Utc>) -> Result<(), WriteError> {
        self.store_full_sync(receiver, at)
            .map_err(|e| WriteError::new(receiver, e))
    }
}

/// Raw column values of a receivers row
struct ReceiverRow {
    tenant_id: String,
    receiver_id: String,
    display_name: Option<String>,
    connection: String,
    active: bool,
    cursor: Option<i64>,
    last_full_sync_at: Option<String>,
}

impl ReceiverRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tenant_id: row.get(0)?,
            receiver_id: row.get(1)?,
            display_name: row.get(2)?,
            connection: row.get(3)?,
            active: row.get(4)?,
            cursor: row.get(5)?,
            last_full_sync_at: row.get(6)?,
        })
    }

    fn into_receiver(self) -> Result<Receiver> {
        let id = ReceiverId::new(self.tenant_id, self.receiver_id);
        let connection: MailboxConnection = serde_json::from_str(&self.connection)
            .with_context(|| format!("Invalid connection settings for receiver {}", id))?;
        let cursor = self
            .cursor
            .map(|c| u64::try_from(c).map(Cursor::new))
            .transpose()
            .with_context(|| format!("Negative cursor stored for receiver {}", id))?;
        let last_full_sync_at = self
            .last_full_sync_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .with_context(|| format!("Invalid last_full_sync_at for receiver {}", id))?;

        Ok(Receiver {
            id,
            display_name: self.display_name,
            connection,
            active: self.active,
            cursor,
            last_full_sync_at,
        })
    }
}

fn cursor_to_sql(cursor: Cursor) -> Result<i64> {
    i64::try_from(cursor.value()).with_context(|| format!("Cursor {} does not fit in SQLite", cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteInbox, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteInbox::open(dir.path().join("mailsync.db")).unwrap();
        (store, dir)
    }

    fn make_receiver(tenant: &str, id: &str) -> Receiver {
        Receiver::new(
            ReceiverId::new(tenant, id),
            MailboxConnection::gmail(format!("{}@{}.test", id, tenant), "token"),
        )
        .with_display_name(format!("{} inbox", id))
    }

    fn make_message(receiver: &ReceiverId, id: &str) -> NormalizedMessage {
        NormalizedMessage::new(
            receiver.clone(),
            id,
            format!("Message-ID: <{}@test>\r\n\r\nhello", id).into_bytes(),
            Utc::now(),
        )
    }

    #[test]
    fn test_receiver_roundtrip() {
        let (store, _dir) = create_test_store();
        let receiver = make_receiver("acme", "support").with_cursor(Cursor::new(42));
        store.register_receiver(&receiver).unwrap();

        let loaded = store.get_receiver(&receiver.id).unwrap().unwrap();
        assert_eq!(loaded, receiver);
        assert!(store.get_receiver(&ReceiverId::new("acme", "nope")).unwrap().is_none());
    }

    #[test]
    fn test_list_active_is_filtered_and_ordered() {
        let (store, _dir) = create_test_store();
        store.register_receiver(&make_receiver("globex", "a")).unwrap();
        store.register_receiver(&make_receiver("acme", "b")).unwrap();
        store
            .register_receiver(&make_receiver("acme", "c").with_active(false))
            .unwrap();

        let active = store.list_active().unwrap();
        let ids: Vec<String> = active.iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, vec!["acme/b", "globex/a"]);
    }

    #[test]
    fn test_list_active_skips_undecodable_rows() {
        let (store, _dir) = create_test_store();
        let good = make_receiver("acme", "good");
        let bad = make_receiver("zeta", "bad");
        let negative = make_receiver("zeta", "negative");
        for receiver in [&good, &bad, &negative] {
            store.register_receiver(receiver).unwrap();
        }

        {
            let conn = store.conn();
            conn.execute(
                "UPDATE receivers SET connection = '{\"kind\":\"imap2\"}'
                 WHERE tenant_id = 'zeta' AND receiver_id = 'bad'",
                [],
            )
            .unwrap();
            conn.execute(
                "UPDATE receivers SET cursor = -5
                 WHERE tenant_id = 'zeta' AND receiver_id = 'negative'",
                [],
            )
            .unwrap();
        }

        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, good.id);

        // Direct lookup still reports the broken row
        assert!(store.get(&bad.id).is_err());
    }

    #[test]
    fn test_reregister_preserves_bookkeeping() {
        let (store, _dir) = create_test_store();
        let receiver = make_receiver("acme", "support");
        store.register_receiver(&receiver).unwrap();
        store.advance_cursor(&receiver.id, Cursor::new(100)).unwrap();

        // Administration edits the receiver with a stale snapshot
        store
            .register_receiver(&receiver.clone().with_display_name("Support"))
            .unwrap();

        let loaded = store.get_receiver(&receiver.id).unwrap().unwrap();
        assert_eq!(loaded.cursor, Some(Cursor::new(100)));
        assert_eq!(loaded.display_name.as_deref(), Some("Support"));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (store, _dir) = create_test_store();
        let receiver = make_receiver("acme", "support");
        store.register_receiver(&receiver).unwrap();

        let batch = vec![make_message(&receiver.id, "m1"), make_message(&receiver.id, "m2")];
        assert_eq!(store.upsert(&receiver.id, &batch).unwrap(), 2);
        assert_eq!(store.upsert(&receiver.id, &batch).unwrap(), 0);

        let overlap = vec![make_message(&receiver.id, "m2"), make_message(&receiver.id, "m3")];
        assert_eq!(store.upsert(&receiver.id, &overlap).unwrap(), 1);
        assert_eq!(store.message_count(&receiver.id).unwrap(), 3);
        assert!(store.has_message(&receiver.id, &ExternalMessageId::new("m3")).unwrap());
    }

    #[test]
    fn test_cursor_monotonic() {
        let (store, _dir) = create_test_store();
        let receiver = make_receiver("acme", "support");
        store.register_receiver(&receiver).unwrap();

        assert!(store.advance_cursor(&receiver.id, Cursor::new(5)).unwrap());
        assert!(store.advance_cursor(&receiver.id, Cursor::new(9)).unwrap());
        assert!(!store.advance_cursor(&receiver.id, Cursor::new(3)).unwrap());

        let loaded = store.get_receiver(&receiver.id).unwrap().unwrap();
        assert_eq!(loaded.cursor, Some(Cursor::new(9)));
    }

    #[test]
    fn test_bookkeeping_unknown_receiver() {
        let (store, _dir) = create_test_store();
        let ghost = ReceiverId::new("acme", "ghost");
        let err = store.advance_cursor(&ghost, Cursor::new(1)).unwrap_err();
        assert_eq!(err.receiver, ghost);
        assert!(store.mark_full_sync(&ghost, Utc::now()).is_err());
    }

    #[test]
    fn test_mark_full_sync_and_admin_updates() {
        let store = SqliteInbox::open_in_memory().unwrap();
        let receiver = make_receiver("acme", "support");
        store.register_receiver(&receiver).unwrap();

        let at = Utc::now();
        store.mark_full_sync(&receiver.id, at).unwrap();
        let loaded = store.get_receiver(&receiver.id).unwrap().unwrap();
        assert_eq!(
            loaded.last_full_sync_at.map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );

        assert!(store.set_active(&receiver.id, false).unwrap());
        assert!(store.list_active().unwrap().is_empty());

        let conn = MailboxConnection::gmail("support@acme.test", "rotated");
        assert!(store.update_connection(&receiver.id, &conn).unwrap());
        assert_eq!(store.get_receiver(&receiver.id).unwrap().unwrap().connection, conn);
    }
}
