//! Seller-registered callback URLs for marketplace-originated events.

use crate::providers::event_matches;
use crate::vault::Sealed;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct CallbackEndpoint {
    pub id: String,
    pub seller_id: String,
    pub url: String,
    #[serde(skip)]
    pub secret: Sealed,
    /// Event patterns (`order.*`, `sync.completed`, `*`).
    pub events: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl CallbackEndpoint {
    pub fn wants_event(&self, event: &str) -> bool {
        self.active && self.events.iter().any(|p| event_matches(p, event))
    }
}

pub struct CallbackEndpointStore {
    conn: Mutex<Connection>,
}

impl CallbackEndpointStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open callback endpoint database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS callback_endpoints (
                id          TEXT PRIMARY KEY,
                seller_id   TEXT NOT NULL,
                url         TEXT NOT NULL,
                secret      TEXT NOT NULL,
                events_json TEXT NOT NULL,
                active      INTEGER NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_callback_endpoints_seller
                ON callback_endpoints(seller_id);",
        )
        .context("Failed to create callback_endpoints table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, endpoint: &CallbackEndpoint) -> Result<()> {
        let events = serde_json::to_string(&endpoint.events).context("Failed to serialize events")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO callback_endpoints
                (id, seller_id, url, secret, events_json, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                endpoint.id,
                endpoint.seller_id,
                endpoint.url,
                endpoint.secret.as_str(),
                events,
                endpoint.active,
                endpoint.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert callback endpoint")?;
        Ok(())
    }

    pub fn list_by_seller(&self, seller_id: &str) -> Result<Vec<CallbackEndpoint>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, seller_id, url, secret, events_json, active, created_at
                 FROM callback_endpoints WHERE seller_id = ?1 ORDER BY created_at ASC",
            )
            .context("Failed to prepare endpoint query")?;

        let rows = stmt
            .query_map(params![seller_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query callback endpoints")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read callback endpoint rows")?;

        rows.into_iter()
            .map(|(id, seller_id, url, secret, events_json, active, created_at)| {
                Ok(CallbackEndpoint {
                    events: serde_json::from_str(&events_json)
                        .with_context(|| format!("Failed to parse events for endpoint {}", id))?,
                    created_at: created_at
                        .parse()
                        .with_context(|| format!("Failed to parse timestamp for endpoint {}", id))?,
                    secret: Sealed::from_stored(secret),
                    id,
                    seller_id,
                    url,
                    active,
                })
            })
            .collect()
    }

    /// Returns false if the seller has no such endpoint.
    pub fn set_active(&self, seller_id: &str, id: &str, active: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE callback_endpoints SET active = ?1 WHERE id = ?2 AND seller_id = ?3",
                params![active, id, seller_id],
            )
            .context("Failed to update callback endpoint")?;
        Ok(updated > 0)
    }
}
