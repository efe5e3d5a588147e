// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Session store backends.
//!
//! - [`memory::InMemoryStore`]: local in-process map (DashMap)
//! - [`redis::RedisStore`]: clustered cache or cross-DC replica
//! - [`sql::SqlStore`]: durable relational store (sqlx Any: SQLite/MySQL)

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use traits::{
    BulkDeleteFilter, ChangeFeed, Expiry, SessionStore, StorageError, StoreEvent, ENTRY_EXPIRED,
    IMMORTAL,
};
