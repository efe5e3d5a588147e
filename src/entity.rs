// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Session entity and the versioned wrapper exchanged with stores.
//!
//! A [`SessionEntity`] is the mutable record a transaction stages and
//! mutates. Stores never see it bare: they hold an [`EntityWrapper`] whose
//! `version` drives optimistic replace.
//!
//! # Example
//!
//! ```
//! use session_changelog::{SessionEntity, EntityWrapper};
//!
//! let entity = SessionEntity::new("s-1", "realm-a").with_user("alice");
//! let wrapper = EntityWrapper::new(entity);
//!
//! assert_eq!(wrapper.version, 1);
//! assert_eq!(wrapper.entity.realm_id, "realm-a");
//! assert!(!wrapper.entity.offline);
//! ```

use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Current time as epoch millis.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntity {
    pub id: String,
    pub realm_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Selects the offline cache pair instead of the online one
    #[serde(default)]
    pub offline: bool,
    /// Missing on records written before versioning existed
    #[serde(default)]
    pub schema_version: u32,
    /// Epoch millis
    #[serde(default)]
    pub started: i64,
    /// Epoch millis
    #[serde(default)]
    pub last_session_refresh: i64,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

impl SessionEntity {
    pub fn new(id: impl Into<String>, realm_id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            realm_id: realm_id.into(),
            user_id: None,
            offline: false,
            schema_version: CURRENT_SCHEMA_VERSION,
            started: now,
            last_session_refresh: now,
            notes: BTreeMap::new(),
        }
    }

    /// Blank placeholder for a key first touched by a create task.
    pub(crate) fn placeholder(id: &str, offline: bool) -> Self {
        Self::new(id, String::new()).offline(offline)
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    #[must_use]
    pub fn with_note(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.notes.insert(key.into(), value.into());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Decode a raw payload and bring it up to the current schema.
    pub fn decode(raw: &[u8]) -> Result<Self, StorageError> {
        let mut entity: SessionEntity = serde_json::from_slice(raw)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Migration::current().migrate(&mut entity);
        Ok(entity)
    }
}

/// The unit exchanged with stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityWrapper {
    pub entity: SessionEntity,
    pub version: u64,
}

impl EntityWrapper {
    /// Wrap a freshly created entity (version 1).
    pub fn new(entity: SessionEntity) -> Self {
        Self { entity, version: 1 }
    }

    pub fn with_version(entity: SessionEntity, version: u64) -> Self {
        Self { entity, version }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, StorageError> {
        let mut wrapper: EntityWrapper = serde_json::from_slice(raw)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Migration::current().migrate(&mut wrapper.entity);
        Ok(wrapper)
    }
}

/// Upgrades an entity by one schema version.
pub type Migrator = fn(&mut SessionEntity);

/// Ordered chain of migrators. Migrator `i` upgrades version `i` to `i + 1`.
pub struct Migration {
    migrators: Vec<Migrator>,
}

impl Migration {
    pub fn new(migrators: Vec<Migrator>) -> Self {
        Self { migrators }
    }

    /// The chain matching [`CURRENT_SCHEMA_VERSION`].
    pub fn current() -> Self {
        Self::new(vec![timestamps_to_millis])
    }

    #[must_use]
    pub fn target_version(&self) -> u32 {
        self.migrators.len() as u32
    }

    /// Apply every migrator from the entity's stored version onward.
    /// Returns true if anything ran.
    pub fn migrate(&self, entity: &mut SessionEntity) -> bool {
        let from = entity.schema_version as usize;
        if from >= self.migrators.len() {
            return false;
        }
        for migrator in self.migrators.iter().skip(from) {
            migrator(entity);
        }
        entity.schema_version = self.target_version();
        true
    }
}

// v0 stored timestamps as epoch seconds
fn timestamps_to_millis(entity: &mut SessionEntity) {
    entity.started = entity.started.saturating_mul(1000);
    entity.last_session_refresh = entity.last_session_refresh.saturating_mul(1000);
}
