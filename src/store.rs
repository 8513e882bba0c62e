#![forbid(unsafe_code)]

//! Token persistence layer.
//!
//! The store is deliberately narrow: save, fetch, decrement, list, purge.
//! Handlers talk to the [`TokenStore`] trait so tests can swap in the
//! in-memory implementation; production uses the SQLite-backed one.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One issued credential and its remaining quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub credential: String,
    pub owner: String,
    pub remaining: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    /// A record past its expiry is treated as absent regardless of quota.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save(&self, record: &TokenRecord) -> Result<()>;
    async fn fetch(&self, credential: &str) -> Result<Option<TokenRecord>>;
    /// Consumes one unit of quota. Returns `Ok(true)` when a unit was
    /// consumed and `Ok(false)` when nothing remained; the check and the
    /// decrement are a single atomic step so concurrent requests cannot
    /// overspend.
    async fn decrement(&self, credential: &str) -> Result<bool>;
    async fn list(&self) -> Result<Vec<TokenRecord>>;
    /// Removes records whose expiry has passed; returns how many were purged.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    // `PRAGMA journal_mode` returns a result row, which libsql's
    // `execute_batch` rejects; run the pragmas through `query` instead.
    conn.query("PRAGMA journal_mode=WAL", ()).await?;
    conn.query("PRAGMA synchronous=NORMAL", ()).await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tokens (
            credential TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            remaining INTEGER NOT NULL,
            issued_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tokens_expires ON tokens(expires_at);
        "#,
    )
    .await?;
    Ok(())
}

/// SQLite-backed store used by the binaries.
pub struct SqliteTokenStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTokenStore").finish_non_exhaustive()
    }
}

impl SqliteTokenStore {
    /// Opens (and if necessary creates) the DB and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating token store directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening token DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }
}

fn row_to_record(row: &Row) -> Result<TokenRecord> {
    let credential: String = row.get(0)?;
    let owner: String = row.get(1)?;
    let remaining: i64 = row.get(2)?;
    let issued_at: String = row.get(3)?;
    let expires_at: String = row.get(4)?;

    Ok(TokenRecord {
        credential,
        owner,
        remaining,
        issued_at: DateTime::parse_from_rfc3339(&issued_at)
            .context("parsing issued_at")?
            .with_timezone(&Utc),
        expires_at: DateTime::parse_from_rfc3339(&expires_at)
            .context("parsing expires_at")?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn save(&self, record: &TokenRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO tokens (credential, owner, remaining, issued_at, expires_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(credential) DO UPDATE SET
                    owner = excluded.owner,
                    remaining = excluded.remaining,
                    issued_at = excluded.issued_at,
                    expires_at = excluded.expires_at
                "#,
                params![
                    record.credential.clone(),
                    record.owner.clone(),
                    record.remaining,
                    record.issued_at.to_rfc3339(),
                    record.expires_at.to_rfc3339(),
                ],
            )
            .await
            .context("saving token record")?;
        Ok(())
    }

    async fn fetch(&self, credential: &str) -> Result<Option<TokenRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT credential, owner, remaining, issued_at, expires_at FROM tokens WHERE credential = ?1",
                params![credential],
            )
            .await
            .context("fetching token record")?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn decrement(&self, credential: &str) -> Result<bool> {
        // The guard keeps remaining from ever going negative under
        // concurrent requests on the same credential.
        let changed = self
            .conn
            .execute(
                "UPDATE tokens SET remaining = remaining - 1 WHERE credential = ?1 AND remaining > 0",
                params![credential],
            )
            .await
            .context("decrementing token quota")?;
        Ok(changed > 0)
    }

    async fn list(&self) -> Result<Vec<TokenRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT credential, owner, remaining, issued_at, expires_at FROM tokens ORDER BY issued_at",
                params![],
            )
            .await
            .context("listing token records")?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        // RFC 3339 UTC strings order lexicographically, so TEXT comparison
        // matches chronological comparison here.
        let removed = self
            .conn
            .execute(
                "DELETE FROM tokens WHERE expires_at <= ?1",
                params![now.to_rfc3339()],
            )
            .await
            .context("purging expired tokens")?;
        Ok(removed)
    }
}

/// In-memory store backing the handler tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, TokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save(&self, record: &TokenRecord) -> Result<()> {
        self.entries
            .lock()
            .insert(record.credential.clone(), record.clone());
        Ok(())
    }

    async fn fetch(&self, credential: &str) -> Result<Option<TokenRecord>> {
        Ok(self.entries.lock().get(credential).cloned())
    }

    async fn decrement(&self, credential: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.get_mut(credential) {
            Some(record) if record.remaining > 0 => {
                record.remaining -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<TokenRecord>> {
        let mut records: Vec<TokenRecord> = self.entries.lock().values().cloned().collect();
        records.sort_by_key(|record| record.issued_at);
        Ok(records)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, record| !record.is_expired(now));
        Ok((before - entries.len()) as u64)
    }
}
