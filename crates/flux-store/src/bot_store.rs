//! Bot accounts: reusable third-party site credentials workers submit
//! through.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{classify_sqlite, StoreError, StoreResult};

/// A persisted `bots` row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bot {
    pub name: String,
    pub platform: String,
    pub cookies: HashMap<String, String>,
}

fn row_to_bot(row: &Row<'_>) -> rusqlite::Result<Bot> {
    let cookies_raw: String = row.get("cookies")?;
    let cookies = serde_json::from_str(&cookies_raw).unwrap_or_default();
    Ok(Bot {
        name: row.get("name")?,
        platform: row.get("platform")?,
        cookies,
    })
}

/// Typed access to the `bots` table.
#[derive(Clone)]
pub struct BotStore {
    db: Database,
}

impl BotStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert_bot(&self, name: String, platform: String) -> StoreResult<Bot> {
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO bots (name, platform, cookies) VALUES (?1, ?2, '{}')",
                    params![name, platform],
                )
                .map_err(|e| classify_sqlite(e, "bot", name.clone()))?;
                Ok(Bot {
                    name,
                    platform,
                    cookies: HashMap::new(),
                })
            })
            .await
    }

    pub async fn get_bot(&self, name: impl Into<String>) -> StoreResult<Bot> {
        let name = name.into();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT name, platform, cookies FROM bots WHERE name = ?1",
                    params![name],
                    row_to_bot,
                )
                .optional()
                .map_err(|e| classify_sqlite(e, "bot", name.clone()))?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "bot",
                    id: name.clone(),
                })
            })
            .await
    }

    pub async fn list_bots(&self) -> StoreResult<Vec<Bot>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare("SELECT name, platform, cookies FROM bots ORDER BY name ASC")?;
                let rows = stmt.query_map([], row_to_bot)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Persists a cookie jar returned by the site (session rotation).
    pub async fn update_cookies(
        &self,
        name: impl Into<String>,
        cookies: HashMap<String, String>,
    ) -> StoreResult<()> {
        let name = name.into();
        let cookies_raw = serde_json::to_string(&cookies)?;
        self.db
            .execute(move |conn| {
                let changed = conn
                    .execute(
                        "UPDATE bots SET cookies = ?1 WHERE name = ?2",
                        params![cookies_raw, name],
                    )
                    .map_err(|e| classify_sqlite(e, "bot", name.clone()))?;
                if changed == 0 {
                    return Err(StoreError::NotFound {
                        entity: "bot",
                        id: name.clone(),
                    });
                }
                Ok(())
            })
            .await
    }

    pub async fn get_cookies(&self, name: impl Into<String>) -> StoreResult<HashMap<String, String>> {
        Ok(self.get_bot(name).await?.cookies)
    }
}
