//! API key persistence using SQLite.

use super::ApiKeyRecord;
use crate::vault::Sealed;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const SELECT_COLUMNS: &str = "id, name, key, secret, permissions_json, active, expires_at,
     seller_id, created_at, last_used_at";

/// Persists API key records. The `key` column is unique; the secret is stored sealed.
pub struct ApiKeyStore {
    conn: Mutex<Connection>,
}

impl ApiKeyStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open API key database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                key              TEXT UNIQUE NOT NULL,
                secret           TEXT NOT NULL,
                permissions_json TEXT NOT NULL,
                active           INTEGER NOT NULL,
                expires_at       TEXT,
                seller_id        TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                last_used_at     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_seller ON api_keys(seller_id);",
        )
        .context("Failed to create api_keys table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, record: &ApiKeyRecord) -> Result<()> {
        let permissions =
            serde_json::to_string(&record.permissions).context("Failed to serialize permissions")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO api_keys
                (id, name, key, secret, permissions_json, active, expires_at, seller_id, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.name,
                record.key,
                record.secret.as_str(),
                permissions,
                record.active,
                record.expires_at.map(|t| t.to_rfc3339()),
                record.seller_id,
                record.created_at.to_rfc3339(),
                record.last_used_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("Failed to insert API key")?;
        Ok(())
    }

    pub fn get_by_key(&self, key: &str) -> Result<Option<ApiKeyRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM api_keys WHERE key = ?1", SELECT_COLUMNS);
        let raw = conn
            .query_row(&sql, params![key], RawRow::read)
            .optional()
            .context("Failed to load API key")?;
        raw.map(RawRow::into_record).transpose()
    }

    pub fn list_by_seller(&self, seller_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM api_keys WHERE seller_id = ?1 ORDER BY created_at ASC",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).context("Failed to prepare list query")?;
        let rows = stmt
            .query_map(params![seller_id], RawRow::read)
            .context("Failed to query API keys")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read API key rows")?;
        rows.into_iter().map(RawRow::into_record).collect()
    }

    /// Flips the active flag of a seller's key. Returns false if no such key.
    pub fn set_active(&self, seller_id: &str, id: &str, active: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE api_keys SET active = ?1 WHERE id = ?2 AND seller_id = ?3",
                params![active, id, seller_id],
            )
            .context("Failed to update API key")?;
        Ok(updated > 0)
    }

    pub fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), id],
        )
        .context("Failed to record API key use")?;
        Ok(())
    }
}

struct RawRow {
    id: String,
    name: String,
    key: String,
    secret: String,
    permissions_json: String,
    active: bool,
    expires_at: Option<String>,
    seller_id: String,
    created_at: String,
    last_used_at: Option<String>,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            key: row.get(2)?,
            secret: row.get(3)?,
            permissions_json: row.get(4)?,
            active: row.get(5)?,
            expires_at: row.get(6)?,
            seller_id: row.get(7)?,
            created_at: row.get(8)?,
            last_used_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<ApiKeyRecord> {
        let permissions = serde_json::from_str(&self.permissions_json)
            .with_context(|| format!("Failed to parse permissions for API key {}", self.id))?;
        let parse = |s: &str| -> Result<DateTime<Utc>> {
            s.parse()
                .with_context(|| format!("Failed to parse timestamp for API key {}", self.id))
        };

        Ok(ApiKeyRecord {
            expires_at: self.expires_at.as_deref().map(parse).transpose()?,
            created_at: parse(&self.created_at)?,
            last_used_at: self.last_used_at.as_deref().map(parse).transpose()?,
            permissions,
            secret: Sealed::from_stored(self.secret),
            id: self.id,
            name: self.name,
            key: self.key,
            active: self.active,
            seller_id: self.seller_id,
        })
    }
}
