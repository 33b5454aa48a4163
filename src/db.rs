//! SQLite store for users and inbounds
//!
//! Inbound creation is a single INSERT, so a rejected write never leaves a
//! partial row behind. Uniqueness lives in the schema: `remark` is unique
//! across all inbounds, `port` only among enabled ones.

use crate::error::StoreError;
use crate::provision::InboundStore;
use crate::settings::{InboundSettings, Protocol, Sniffing, StreamSettings};
use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const INBOUND_COLUMNS: &str = "id, user_id, up, down, total, remark, enable, expiry_time, listen, port, \
     protocol, settings, stream_settings, sniffing, tag, created_at";

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL keeps list reads from blocking provisioning writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&conn)?;
            }

            if current_version < 2 {
                migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    // ==================== User Operations ====================

    /// Create a user, returning its id
    pub fn create_user(&self, username: &str, password: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
            params![username, hash_password(password)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The oldest user, which owns everything provisioned through the API
    pub fn get_first_user(&self) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, created_at FROM users ORDER BY id ASC LIMIT 1",
            [],
            |row| {
                Ok(UserRecord {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn count_users(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Create the admin user if the database has no users yet.
    /// Returns true when a user was created.
    pub fn bootstrap_admin(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        if self.count_users()? > 0 {
            debug!("Users already present, skipping admin bootstrap");
            return Ok(false);
        }
        self.create_user(username, password)?;
        info!(username, "Bootstrapped admin user");
        Ok(true)
    }

    // ==================== Inbound Operations ====================

    /// Atomically insert an inbound and return the stored row
    pub fn create_inbound(&self, inbound: &NewInbound) -> Result<Inbound, StoreError> {
        let settings = encode_json("settings", &inbound.settings)?;
        let stream_settings = encode_json("stream_settings", &inbound.stream_settings)?;
        let sniffing = encode_json("sniffing", &inbound.sniffing)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO inbounds (user_id, total, remark, enable, expiry_time, listen, port,
                                   protocol, settings, stream_settings, sniffing, tag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                inbound.user_id,
                inbound.total,
                inbound.remark,
                inbound.enable,
                inbound.expiry_time,
                inbound.listen,
                inbound.port,
                inbound.protocol.as_str(),
                settings,
                stream_settings,
                sniffing,
                inbound.tag,
            ],
        )
        .map_err(|e| classify_insert_error(e, inbound))?;

        let id = conn.last_insert_rowid();
        debug!(id, remark = %inbound.remark, port = inbound.port, "Inbound inserted");

        query_inbound(&conn, "WHERE id = ?1", params![id])?
            .ok_or(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn find_inbound_by_remark(&self, remark: &str) -> Result<Option<Inbound>, StoreError> {
        let conn = self.conn.lock();
        query_inbound(&conn, "WHERE remark = ?1", params![remark])
    }

    pub fn list_inbounds(&self) -> Result<Vec<Inbound>, StoreError> {
        let conn = self.conn.lock();
        query_inbounds(&conn, "ORDER BY id ASC")
    }

    /// Inbounds the managed proxy should be listening on
    pub fn list_enabled_inbounds(&self) -> Result<Vec<Inbound>, StoreError> {
        let conn = self.conn.lock();
        query_inbounds(&conn, "WHERE enable = 1 ORDER BY id ASC")
    }

    pub fn count_inbounds(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM inbounds", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl InboundStore for Database {
    fn create_inbound(&self, inbound: &NewInbound) -> Result<Inbound, StoreError> {
        Database::create_inbound(self, inbound)
    }

    fn find_inbound_by_remark(&self, remark: &str) -> Result<Option<Inbound>, StoreError> {
        Database::find_inbound_by_remark(self, remark)
    }

    fn primary_owner(&self) -> Result<Option<UserRecord>, StoreError> {
        self.get_first_user()
    }

    fn list_inbounds(&self) -> Result<Vec<Inbound>, StoreError> {
        Database::list_inbounds(self)
    }

    fn count_inbounds(&self) -> Result<i64, StoreError> {
        Database::count_inbounds(self)
    }
}

/// Migration v1: users and inbounds
fn migrate_v1(conn: &Connection) -> anyhow::Result<()> {
    debug!("Applying migration v1: initial schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS inbounds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            up INTEGER NOT NULL DEFAULT 0,
            down INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            remark TEXT NOT NULL UNIQUE,
            enable INTEGER NOT NULL DEFAULT 1,
            expiry_time INTEGER NOT NULL DEFAULT 0,
            listen TEXT NOT NULL DEFAULT '',
            port INTEGER NOT NULL,
            protocol TEXT NOT NULL,
            settings TEXT NOT NULL,
            stream_settings TEXT NOT NULL,
            sniffing TEXT NOT NULL,
            tag TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (user_id) REFERENCES users(id)
        );

        CREATE INDEX IF NOT EXISTS idx_inbounds_user ON inbounds(user_id);

        INSERT INTO schema_migrations (version) VALUES (1);
    "#,
    )?;

    Ok(())
}

/// Migration v2: port uniqueness among enabled inbounds
fn migrate_v2(conn: &Connection) -> anyhow::Result<()> {
    debug!("Applying migration v2: enabled port uniqueness");

    conn.execute_batch(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_inbounds_enabled_port
            ON inbounds(port) WHERE enable = 1;

        INSERT INTO schema_migrations (version) VALUES (2);
    "#,
    )?;

    Ok(())
}

/// Column named in a UNIQUE constraint failure, e.g. `inbounds.remark`
fn constraint_column(err: &rusqlite::Error) -> Option<String> {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg)) if e.code == ErrorCode::ConstraintViolation => {
            msg.strip_prefix("UNIQUE constraint failed: ").map(str::to_owned)
        }
        _ => None,
    }
}

fn classify_insert_error(err: rusqlite::Error, inbound: &NewInbound) -> StoreError {
    match constraint_column(&err).as_deref() {
        Some("inbounds.remark") => StoreError::RemarkConflict(inbound.remark.clone()),
        Some("inbounds.port") => StoreError::PortConflict(inbound.port),
        _ => StoreError::Sqlite(err),
    }
}

fn encode_json<T: Serialize>(field: &'static str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode { field, source })
}

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Inbound row as stored, before the JSON columns are decoded
struct InboundRow {
    id: i64,
    user_id: i64,
    up: i64,
    down: i64,
    total: i64,
    remark: String,
    enable: bool,
    expiry_time: i64,
    listen: String,
    port: i64,
    protocol: String,
    settings: String,
    stream_settings: String,
    sniffing: String,
    tag: String,
    created_at: String,
}

impl InboundRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            up: row.get(2)?,
            down: row.get(3)?,
            total: row.get(4)?,
            remark: row.get(5)?,
            enable: row.get(6)?,
            expiry_time: row.get(7)?,
            listen: row.get(8)?,
            port: row.get(9)?,
            protocol: row.get(10)?,
            settings: row.get(11)?,
            stream_settings: row.get(12)?,
            sniffing: row.get(13)?,
            tag: row.get(14)?,
            created_at: row.get(15)?,
        })
    }

    fn decode(self) -> Result<Inbound, StoreError> {
        let id = self.id;
        let corrupt = |field: &'static str, reason: String| StoreError::Corrupt { id, field, reason };

        let port = u16::try_from(self.port)
            .map_err(|_| corrupt("port", format!("{} is not a valid port", self.port)))?;
        let protocol: Protocol = self.protocol.parse().map_err(|e| corrupt("protocol", e))?;
        let settings: InboundSettings = serde_json::from_str(&self.settings)
            .map_err(|e| corrupt("settings", e.to_string()))?;
        let stream_settings: StreamSettings = serde_json::from_str(&self.stream_settings)
            .map_err(|e| corrupt("stream_settings", e.to_string()))?;
        let sniffing: Sniffing = serde_json::from_str(&self.sniffing)
            .map_err(|e| corrupt("sniffing", e.to_string()))?;

        Ok(Inbound {
            id,
            user_id: self.user_id,
            up: self.up,
            down: self.down,
            total: self.total,
            remark: self.remark,
            enable: self.enable,
            expiry_time: self.expiry_time,
            listen: self.listen,
            port,
            protocol,
            settings,
            stream_settings,
            sniffing,
            tag: self.tag,
            created_at: self.created_at,
        })
    }
}

fn query_inbound(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> Result<Option<Inbound>, StoreError> {
    let sql = format!("SELECT {} FROM inbounds {}", INBOUND_COLUMNS, clause);
    conn.query_row(&sql, params, InboundRow::from_row)
        .optional()?
        .map(InboundRow::decode)
        .transpose()
}

fn query_inbounds(conn: &Connection, clause: &str) -> Result<Vec<Inbound>, StoreError> {
    let sql = format!("SELECT {} FROM inbounds {}", INBOUND_COLUMNS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], InboundRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(InboundRow::decode).collect()
}

/// User record from database
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub created_at: String,
}

/// An inbound ready to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewInbound {
    pub user_id: i64,
    pub total: i64,
    pub remark: String,
    pub enable: bool,
    pub expiry_time: i64,
    pub listen: String,
    pub port: u16,
    pub protocol: Protocol,
    pub settings: InboundSettings,
    pub stream_settings: StreamSettings,
    pub sniffing: Sniffing,
    pub tag: String,
}

/// A stored inbound with its documents decoded
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub id: i64,
    pub user_id: i64,
    pub up: i64,
    pub down: i64,
    pub total: i64,
    pub remark: String,
    pub enable: bool,
    pub expiry_time: i64,
    pub listen: String,
    pub port: u16,
    pub protocol: Protocol,
    pub settings: InboundSettings,
    pub stream_settings: StreamSettings,
    pub sniffing: Sniffing,
    pub tag: String,
    pub created_at: String,
}
