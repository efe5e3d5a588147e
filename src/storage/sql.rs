// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational session store, the durable tier.
//!
//! One table per cache pair (online and offline sessions use different
//! tables). The entity is a JSON payload; the columns next to it exist for
//! conditional writes and pushed-down bulk deletes:
//!
//! ```sql
//! CREATE TABLE sessions (
//!   id VARCHAR(255) PRIMARY KEY,
//!   realm_id VARCHAR(255) NOT NULL,
//!   user_id VARCHAR(255),
//!   offline TINYINT NOT NULL,
//!   version BIGINT NOT NULL,
//!   payload LONGTEXT NOT NULL,   -- SessionEntity JSON
//!   expires_at BIGINT NOT NULL   -- epoch millis, 0 = never
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL LONGTEXT comes back as bytes through the `Any` driver, so text
//! columns are read as `String` first and `Vec<u8>` second. Booleans are
//! stored as integers for the same reason.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use crate::entity::{now_millis, EntityWrapper, SessionEntity};
use crate::preload::source::{RowSource, RowStream, SegmentRange};
use crate::resilience::retry::{retry, RetryConfig};
use super::traits::{BulkDeleteFilter, Expiry, SessionStore, StorageError};
use std::sync::Once;
use std::time::Duration;
use tracing::debug;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Rows fetched per query when streaming a segment.
const PAGE_ROWS: u64 = 256;

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// TEXT on SQLite, bytes on MySQL through `Any`.
fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn expires_at(expiry: Expiry) -> i64 {
    expiry.ttl_ms().map_or(0, |ttl| now_millis() + ttl as i64)
}

pub struct SqlStore {
    name: String,
    pool: AnyPool,
    table: String,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong),
    /// using the `sessions` table.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_table(connection_string, "sessions").await
    }

    pub async fn with_table(connection_string: &str, table: &str) -> Result<Self, StorageError> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StorageError::Backend(format!("invalid table name: {}", table)));
        }
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self {
            name: format!("sql:{}", table),
            pool,
            table: table.to_string(),
            is_sqlite,
        };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;
        Ok(store)
    }

    /// Share the pool between the online and offline tables.
    pub async fn from_pool(pool: AnyPool, table: &str, is_sqlite: bool) -> Result<Self, StorageError> {
        let store = Self {
            name: format!("sql:{}", table),
            pool,
            table: table.to_string(),
            is_sqlite,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Concurrent readers during writes; one fsync per commit.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    realm_id TEXT NOT NULL,
                    user_id TEXT,
                    offline INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL DEFAULT 1,
                    payload TEXT NOT NULL,
                    expires_at INTEGER NOT NULL DEFAULT 0
                )
                "#,
                self.table
            )
        } else {
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t} (
                    id VARCHAR(255) PRIMARY KEY,
                    realm_id VARCHAR(255) NOT NULL,
                    user_id VARCHAR(255),
                    offline TINYINT NOT NULL DEFAULT 0,
                    version BIGINT NOT NULL DEFAULT 1,
                    payload LONGTEXT NOT NULL,
                    expires_at BIGINT NOT NULL DEFAULT 0,
                    INDEX idx_{t}_realm (realm_id),
                    INDEX idx_{t}_user (user_id)
                )
                "#,
                t = self.table
            )
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(&sql).execute(&self.pool).await.map_err(backend)
        })
        .await?;

        Ok(())
    }

    fn decode_row(row: &AnyRow) -> Result<(String, EntityWrapper), StorageError> {
        let id: String = text_column(row, "id")
            .ok_or_else(|| StorageError::Backend("row without id".to_string()))?;
        let version: i64 = row.try_get("version").map_err(backend)?;
        let payload = text_column(row, "payload")
            .ok_or_else(|| StorageError::Backend(format!("row {} without payload", id)))?;
        let entity = SessionEntity::decode(payload.as_bytes())?;
        Ok((id, EntityWrapper::with_version(entity, version as u64)))
    }

    async fn fetch_rows(&self, offset: u64, limit: u64) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let sql = format!(
            "SELECT id, payload FROM {} WHERE expires_at = 0 OR expires_at > ? ORDER BY id LIMIT ? OFFSET ?",
            self.table
        );
        let rows = retry("sql_scan", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(now_millis())
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        rows.iter()
            .map(|row| {
                let id = text_column(row, "id")
                    .ok_or_else(|| StorageError::Backend("row without id".to_string()))?;
                let payload = text_column(row, "payload").unwrap_or_default();
                Ok((id, payload.into_bytes()))
            })
            .collect()
    }

    /// WHERE clause and bind values for the structured part of a filter.
    fn structured_where(filter: &BulkDeleteFilter) -> (String, Vec<SqlArg>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(realm) = &filter.realm_id {
            clauses.push("realm_id = ?");
            args.push(SqlArg::Text(realm.clone()));
        }
        if let Some(user) = &filter.user_id {
            clauses.push("user_id = ?");
            args.push(SqlArg::Text(user.clone()));
        }
        if let Some(offline) = filter.offline {
            clauses.push("offline = ?");
            args.push(SqlArg::Int(i64::from(offline)));
        }
        if clauses.is_empty() {
            ("1 = 1".to_string(), args)
        } else {
            (clauses.join(" AND "), args)
        }
    }
}

#[derive(Debug, Clone)]
enum SqlArg {
    Text(String),
    Int(i64),
}

#[async_trait]
impl SessionStore for SqlStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<EntityWrapper>, StorageError> {
        let sql = format!(
            "SELECT id, version, payload FROM {} WHERE id = ? AND (expires_at = 0 OR expires_at > ?)",
            self.table
        );
        let row = retry("sql_get", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(key)
                .bind(now_millis())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        row.as_ref()
            .map(|row| Self::decode_row(row).map(|(_, wrapper)| wrapper))
            .transpose()
    }

    async fn put_if_absent(
        &self,
        key: &str,
        wrapper: &EntityWrapper,
        expiry: Expiry,
    ) -> Result<bool, StorageError> {
        let payload = String::from_utf8(wrapper.entity.encode()?)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let entity = &wrapper.entity;

        // An expired row must not block the create
        let purge = format!(
            "DELETE FROM {} WHERE id = ? AND expires_at > 0 AND expires_at <= ?",
            self.table
        );
        let insert = if self.is_sqlite {
            format!(
                "INSERT INTO {} (id, realm_id, user_id, offline, version, payload, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
                self.table
            )
        } else {
            format!(
                "INSERT IGNORE INTO {} (id, realm_id, user_id, offline, version, payload, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                self.table
            )
        };

        let inserted = retry("sql_insert", &RetryConfig::query(), || async {
            sqlx::query(&purge)
                .bind(key)
                .bind(now_millis())
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            let result = sqlx::query(&insert)
                .bind(key)
                .bind(&entity.realm_id)
                .bind(&entity.user_id)
                .bind(i64::from(entity.offline))
                .bind(wrapper.version as i64)
                .bind(&payload)
                .bind(expires_at(expiry))
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(result.rows_affected() == 1)
        })
        .await?;

        Ok(inserted)
    }

    async fn replace(
        &self,
        key: &str,
        expected_version: u64,
        wrapper: &EntityWrapper,
        expiry: Expiry,
    ) -> Result<bool, StorageError> {
        let payload = String::from_utf8(wrapper.entity.encode()?)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let entity = &wrapper.entity;
        let sql = format!(
            "UPDATE {} SET realm_id = ?, user_id = ?, offline = ?, version = ?, payload = ?, expires_at = ? \
             WHERE id = ? AND version = ? AND (expires_at = 0 OR expires_at > ?)",
            self.table
        );

        let updated = retry("sql_replace", &RetryConfig::query(), || async {
            let result = sqlx::query(&sql)
                .bind(&entity.realm_id)
                .bind(&entity.user_id)
                .bind(i64::from(entity.offline))
                .bind(wrapper.version as i64)
                .bind(&payload)
                .bind(expires_at(expiry))
                .bind(key)
                .bind(expected_version as i64)
                .bind(now_millis())
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(result.rows_affected() == 1)
        })
        .await?;

        Ok(updated)
    }

    async fn put(&self, key: &str, wrapper: &EntityWrapper, expiry: Expiry) -> Result<(), StorageError> {
        let payload = String::from_utf8(wrapper.entity.encode()?)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let entity = &wrapper.entity;

        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO {} (id, realm_id, user_id, offline, version, payload, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                    realm_id = excluded.realm_id, \
                    user_id = excluded.user_id, \
                    offline = excluded.offline, \
                    version = excluded.version, \
                    payload = excluded.payload, \
                    expires_at = excluded.expires_at",
                self.table
            )
        } else {
            format!(
                "INSERT INTO {} (id, realm_id, user_id, offline, version, payload, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                    realm_id = VALUES(realm_id), \
                    user_id = VALUES(user_id), \
                    offline = VALUES(offline), \
                    version = VALUES(version), \
                    payload = VALUES(payload), \
                    expires_at = VALUES(expires_at)",
                self.table
            )
        };

        retry("sql_put", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(key)
                .bind(&entity.realm_id)
                .bind(&entity.user_id)
                .bind(i64::from(entity.offline))
                .bind(wrapper.version as i64)
                .bind(&payload)
                .bind(expires_at(expiry))
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let sql = format!("DELETE FROM {} WHERE id = ?", self.table);
        retry("sql_delete", &RetryConfig::query(), || async {
            let result = sqlx::query(&sql)
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Structured filters become one `DELETE ... WHERE`; a custom predicate
    /// narrows by the structured part first, then is evaluated per row.
    async fn remove_matching(&self, filter: &BulkDeleteFilter) -> Result<u64, StorageError> {
        let (clause, args) = Self::structured_where(filter);

        if filter.is_structured() {
            let sql = format!("DELETE FROM {} WHERE {}", self.table, clause);
            let removed = retry("sql_bulk_delete", &RetryConfig::query(), || async {
                let mut query = sqlx::query(&sql);
                for arg in &args {
                    query = match arg {
                        SqlArg::Text(s) => query.bind(s.as_str()),
                        SqlArg::Int(i) => query.bind(*i),
                    };
                }
                let result = query.execute(&self.pool).await.map_err(backend)?;
                Ok(result.rows_affected())
            })
            .await?;
            debug!(store = %self.name, removed, "Bulk delete pushed down");
            return Ok(removed);
        }

        let select = format!("SELECT id, version, payload FROM {} WHERE {}", self.table, clause);
        let mut query = sqlx::query(&select);
        for arg in &args {
            query = match arg {
                SqlArg::Text(s) => query.bind(s.as_str()),
                SqlArg::Int(i) => query.bind(*i),
            };
        }
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;

        let mut removed = 0u64;
        for row in &rows {
            let Ok((id, wrapper)) = Self::decode_row(row) else {
                continue;
            };
            if filter.matches(&id, &wrapper.entity) && self.remove(&id).await? {
                removed += 1;
            }
        }
        debug!(store = %self.name, removed, scanned = rows.len(), "Bulk delete by scan");
        Ok(removed)
    }
}

#[async_trait]
impl RowSource for SqlStore {
    async fn total_rows(&self) -> Result<u64, StorageError> {
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE expires_at = 0 OR expires_at > ?",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(now_millis())
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let count: i64 = row.try_get("cnt").map_err(backend)?;
        Ok(count as u64)
    }

    /// Pages through the segment in key order, `PAGE_ROWS` at a time.
    fn rows(&self, range: SegmentRange) -> RowStream<'_> {
        let end = range.offset + range.limit;
        stream::unfold(Some(range.offset), move |next| async move {
            let offset = next?;
            if offset >= end {
                return None;
            }
            let take = (end - offset).min(PAGE_ROWS);
            let page = self.fetch_rows(offset, take).await;
            let following = match &page {
                Ok(rows) if rows.len() as u64 == take => Some(offset + take),
                _ => None,
            };
            Some((page, following))
        })
        .flat_map(|page| match page {
            Ok(rows) => stream::iter(rows.into_iter().map(Ok)).boxed(),
            Err(e) => stream::iter(vec![Err(e)]).boxed(),
        })
        .boxed()
    }
}
