//! SQLite persistence for seller integrations.
//!
//! Credential values arrive already sealed by the vault; this layer never
//! sees plaintext.

use super::{
    ConnectionStatus, Environment, HistoryEntry, IntegrationKey, OAuthTokens, SellerIntegration,
    WebhookSettings,
};
use crate::vault::Sealed;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const SELECT_COLUMNS: &str = "id, seller_id, provider, environment, status, credentials_json,
     access_token, refresh_token, expires_at, webhook_json, last_error, version,
     created_at, updated_at";

/// Integration storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE seller_integrations (
///     id TEXT PRIMARY KEY,
///     seller_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     environment TEXT NOT NULL,         -- sandbox | live
///     status TEXT NOT NULL,
///     credentials_json TEXT NOT NULL,    -- field -> sealed value
///     access_token TEXT,                 -- sealed (optional)
///     refresh_token TEXT,                -- sealed (optional)
///     expires_at TEXT,                   -- RFC 3339 (optional)
///     webhook_json TEXT,                 -- enabled, url, sealed secret
///     last_error TEXT,
///     version INTEGER NOT NULL,          -- bumped on every write
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(seller_id, provider, environment)
/// );
/// ```
///
/// History lives in `integration_history` and is only ever appended to, in
/// the same transaction as the write that caused it.
pub struct IntegrationStore {
    conn: Mutex<Connection>,
}

impl IntegrationStore {
    /// Opens (or creates) the database and ensures the tables exist.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open integrations database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS seller_integrations (
                id               TEXT PRIMARY KEY,
                seller_id        TEXT NOT NULL,
                provider         TEXT NOT NULL,
                environment      TEXT NOT NULL,
                status           TEXT NOT NULL,
                credentials_json TEXT NOT NULL,
                access_token     TEXT,
                refresh_token    TEXT,
                expires_at       TEXT,
                webhook_json     TEXT,
                last_error       TEXT,
                version          INTEGER NOT NULL,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                UNIQUE(seller_id, provider, environment)
            );
            CREATE TABLE IF NOT EXISTS integration_history (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                integration_id TEXT NOT NULL,
                event          TEXT NOT NULL,
                message        TEXT NOT NULL,
                created_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_integration
                ON integration_history(integration_id);
            CREATE INDEX IF NOT EXISTS idx_integrations_status
                ON seller_integrations(status);
            "#,
        )
        .context("Failed to create integration tables")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Returns the integration for a (seller, provider, environment) tuple.
    pub fn get(&self, key: &IntegrationKey) -> Result<Option<SellerIntegration>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM seller_integrations
             WHERE seller_id = ?1 AND provider = ?2 AND environment = ?3",
            SELECT_COLUMNS
        );
        let found = conn
            .query_row(
                &sql,
                params![key.seller_id, key.provider, key.environment.as_str()],
                row_to_integration,
            )
            .optional()
            .context("Failed to load integration")?;

        found.map(|i| with_history(&conn, i)).transpose()
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<SellerIntegration>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM seller_integrations WHERE id = ?1", SELECT_COLUMNS);
        let found = conn
            .query_row(&sql, params![id], row_to_integration)
            .optional()
            .context("Failed to load integration")?;

        found.map(|i| with_history(&conn, i)).transpose()
    }

    /// All integrations of a seller, both environments.
    pub fn list_by_seller(&self, seller_id: &str) -> Result<Vec<SellerIntegration>> {
        self.query_many(
            "WHERE seller_id = ?1 ORDER BY provider, environment",
            params![seller_id],
        )
    }

    /// All integrations in a given status (used by the sync worker's discovery cycle).
    pub fn list_by_status(&self, status: ConnectionStatus) -> Result<Vec<SellerIntegration>> {
        self.query_many(
            "WHERE status = ?1 ORDER BY seller_id, provider",
            params![status.as_str()],
        )
    }

    /// Connected integrations of a seller with an enabled webhook sub-configuration.
    pub fn list_webhook_targets(&self, seller_id: &str) -> Result<Vec<SellerIntegration>> {
        let connected = self.query_many(
            "WHERE seller_id = ?1 AND status = 'connected' AND webhook_json IS NOT NULL",
            params![seller_id],
        )?;
        Ok(connected
            .into_iter()
            .filter(|i| i.webhook.as_ref().map(|w| w.enabled).unwrap_or(false))
            .collect())
    }

    /// Inserts or replaces the record for the integration's key, appending `event`
    /// to its history in the same transaction. Returns the stored record.
    pub fn save(
        &self,
        integration: &SellerIntegration,
        event: &HistoryEntry,
    ) -> Result<SellerIntegration> {
        let columns = Columns::from(integration)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("Failed to begin transaction")?;

        tx.execute(
            r#"
            INSERT INTO seller_integrations (
                id, seller_id, provider, environment, status, credentials_json,
                access_token, refresh_token, expires_at, webhook_json, last_error,
                version, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12, ?12)
            ON CONFLICT(seller_id, provider, environment) DO UPDATE SET
                status = excluded.status,
                credentials_json = excluded.credentials_json,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                webhook_json = excluded.webhook_json,
                last_error = excluded.last_error,
                version = seller_integrations.version + 1,
                updated_at = excluded.updated_at
            "#,
            params![
                integration.id,
                integration.seller_id,
                integration.provider,
                integration.environment.as_str(),
                integration.status.as_str(),
                columns.credentials_json,
                columns.access_token,
                columns.refresh_token,
                columns.expires_at,
                columns.webhook_json,
                integration.last_error,
                now,
            ],
        )
        .context("Failed to upsert integration")?;

        let id: String = tx
            .query_row(
                "SELECT id FROM seller_integrations
                 WHERE seller_id = ?1 AND provider = ?2 AND environment = ?3",
                params![
                    integration.seller_id,
                    integration.provider,
                    integration.environment.as_str()
                ],
                |row| row.get(0),
            )
            .context("Failed to read back integration id")?;

        insert_history(&tx, &id, event)?;
        tx.commit().context("Failed to commit integration upsert")?;

        load_by_id(&conn, &id)?.context("Integration vanished after upsert")
    }

    /// Writes `integration` only if the stored version still equals
    /// `integration.version`. Returns `None` when another writer got there first.
    pub fn compare_and_swap(
        &self,
        integration: &SellerIntegration,
        event: &HistoryEntry,
    ) -> Result<Option<SellerIntegration>> {
        let columns = Columns::from(integration)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let updated = tx
            .execute(
                r#"
                UPDATE seller_integrations SET
                    status = ?1,
                    credentials_json = ?2,
                    access_token = ?3,
                    refresh_token = ?4,
                    expires_at = ?5,
                    webhook_json = ?6,
                    last_error = ?7,
                    version = version + 1,
                    updated_at = ?8
                WHERE id = ?9 AND version = ?10
                "#,
                params![
                    integration.status.as_str(),
                    columns.credentials_json,
                    columns.access_token,
                    columns.refresh_token,
                    columns.expires_at,
                    columns.webhook_json,
                    integration.last_error,
                    now,
                    integration.id,
                    integration.version,
                ],
            )
            .context("Failed to update integration")?;

        if updated == 0 {
            return Ok(None);
        }

        insert_history(&tx, &integration.id, event)?;
        tx.commit().context("Failed to commit integration update")?;

        load_by_id(&conn, &integration.id)
    }

    fn query_many(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<SellerIntegration>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM seller_integrations {}", SELECT_COLUMNS, clause);
        let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;
        let rows = stmt
            .query_map(params, row_to_integration)
            .context("Failed to execute query")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read integrations")?;

        rows.into_iter().map(|i| with_history(&conn, i)).collect()
    }
}

/// Column values derived from a record before writing.
struct Columns {
    credentials_json: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<String>,
    webhook_json: Option<String>,
}

impl Columns {
    fn from(integration: &SellerIntegration) -> Result<Self> {
        let credentials_json = serde_json::to_string(&integration.credentials)
            .context("Failed to serialize credentials")?;
        let webhook_json = integration
            .webhook
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize webhook settings")?;
        let tokens = integration.tokens.as_ref();

        Ok(Self {
            credentials_json,
            access_token: tokens.map(|t| t.access_token.as_str().to_string()),
            refresh_token: tokens
                .and_then(|t| t.refresh_token.as_ref())
                .map(|r| r.as_str().to_string()),
            expires_at: tokens.and_then(|t| t.expires_at).map(|dt| dt.to_rfc3339()),
            webhook_json,
        })
    }
}

fn insert_history(conn: &Connection, integration_id: &str, event: &HistoryEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO integration_history (integration_id, event, message, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![integration_id, event.event, event.message, event.at.to_rfc3339()],
    )
    .context("Failed to append integration history")?;
    Ok(())
}

fn load_by_id(conn: &Connection, id: &str) -> Result<Option<SellerIntegration>> {
    let sql = format!("SELECT {} FROM seller_integrations WHERE id = ?1", SELECT_COLUMNS);
    let found = conn
        .query_row(&sql, params![id], row_to_integration)
        .optional()
        .context("Failed to load integration")?;
    found.map(|i| with_history(conn, i)).transpose()
}

fn with_history(conn: &Connection, mut integration: SellerIntegration) -> Result<SellerIntegration> {
    let mut stmt = conn
        .prepare(
            "SELECT event, message, created_at FROM integration_history
             WHERE integration_id = ?1 ORDER BY id",
        )
        .context("Failed to prepare history query")?;

    integration.history = stmt
        .query_map(params![integration.id], |row| {
            Ok(HistoryEntry {
                event: row.get(0)?,
                message: row.get(1)?,
                at: parse_timestamp(2, row.get(2)?)?,
            })
        })
        .context("Failed to execute history query")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read history")?;

    Ok(integration)
}

fn row_to_integration(row: &Row<'_>) -> rusqlite::Result<SellerIntegration> {
    let environment: String = row.get(3)?;
    let environment: Environment = environment
        .parse()
        .map_err(|e: String| conversion_error(3, e))?;

    let status: String = row.get(4)?;
    let status = ConnectionStatus::parse(&status)
        .ok_or_else(|| conversion_error(4, format!("unknown status '{}'", status)))?;

    let credentials_json: String = row.get(5)?;
    let credentials: BTreeMap<String, Sealed> =
        serde_json::from_str(&credentials_json).map_err(|e| conversion_error(5, e))?;

    let access_token: Option<String> = row.get(6)?;
    let refresh_token: Option<String> = row.get(7)?;
    let expires_at: Option<String> = row.get(8)?;
    let expires_at = expires_at.map(|s| parse_timestamp(8, s)).transpose()?;
    let tokens = access_token.map(|access| OAuthTokens {
        access_token: Sealed::from_stored(access),
        refresh_token: refresh_token.map(Sealed::from_stored),
        expires_at,
    });

    let webhook_json: Option<String> = row.get(9)?;
    let webhook: Option<WebhookSettings> = webhook_json
        .map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(9, e)))
        .transpose()?;

    Ok(SellerIntegration {
        id: row.get(0)?,
        seller_id: row.get(1)?,
        provider: row.get(2)?,
        environment,
        status,
        credentials,
        tokens,
        webhook,
        last_error: row.get(10)?,
        history: Vec::new(),
        version: row.get(11)?,
        created_at: parse_timestamp(12, row.get(12)?)?,
        updated_at: parse_timestamp(13, row.get(13)?)?,
    })
}

fn parse_timestamp(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}
