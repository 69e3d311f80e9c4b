//! Storage layer for lab tracking records.

mod file;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::Identity;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

pub use file::FileRecordStore;

/// Identifies the one record a lab may have.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub server_id: String,
    /// Messaging identity of the owner, not the platform's owner key.
    pub identity: Identity,
    pub lab_id: String,
}

impl RecordKey {
    #[must_use]
    pub fn new(
        server_id: impl Into<String>,
        identity: Identity,
        lab_id: impl Into<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            identity,
            lab_id: lab_id.into(),
        }
    }
}

/// A lab that has been warned about and is being tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub key: RecordKey,
    /// Last warning sent, or when the current extension was granted.
    pub warning_date: DateTime<Utc>,
    /// Set by an extension, cleared once that extension runs out.
    pub renewal_flag: bool,
}

/// Partial update applied by [`RecordStore::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub warning_date: Option<DateTime<Utc>>,
    pub renewal_flag: Option<bool>,
}

impl RecordUpdate {
    /// A fresh warning: new warning date, extension consumed.
    #[must_use]
    pub fn rewarn(now: DateTime<Utc>) -> Self {
        Self {
            warning_date: Some(now),
            renewal_flag: Some(false),
        }
    }

    /// An extension granted at `now`.
    #[must_use]
    pub fn renew(now: DateTime<Utc>) -> Self {
        Self {
            warning_date: Some(now),
            renewal_flag: Some(true),
        }
    }

    fn apply(&self, record: &mut LabRecord) {
        if let Some(date) = self.warning_date {
            record.warning_date = date;
        }
        if let Some(flag) = self.renewal_flag {
            record.renewal_flag = flag;
        }
    }
}

/// Selects records for [`RecordStore::delete_many`]. Unset fields match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub server_id: Option<String>,
    pub identity: Option<Identity>,
    pub lab_id: Option<String>,
    /// Match only records whose lab is NOT in this set.
    pub lab_not_in: Option<BTreeSet<String>>,
}

impl RecordFilter {
    #[must_use]
    pub fn server(server_id: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn lab_not_in(mut self, labs: BTreeSet<String>) -> Self {
        self.lab_not_in = Some(labs);
        self
    }

    #[must_use]
    pub fn matches(&self, record: &LabRecord) -> bool {
        self.server_id
            .as_ref()
            .is_none_or(|s| *s == record.key.server_id)
            && self
                .identity
                .as_ref()
                .is_none_or(|i| *i == record.key.identity)
            && self
                .lab_id
                .as_ref()
                .is_none_or(|l| *l == record.key.lab_id)
            && self
                .lab_not_in
                .as_ref()
                .is_none_or(|labs| !labs.contains(&record.key.lab_id))
    }
}

/// Persistent collection of [`LabRecord`]s, at most one per [`RecordKey`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Look up the record for a lab.
    async fn find(&self, key: &RecordKey) -> Result<Option<LabRecord>, StoreError>;

    /// Return the existing record, or atomically create one with
    /// `renewal_flag = false`. The flag tells whether it was created.
    async fn find_or_create(
        &self,
        key: &RecordKey,
        warning_date: DateTime<Utc>,
    ) -> Result<(LabRecord, bool), StoreError>;

    /// Apply a partial update to the record with this id.
    async fn update(&self, id: Uuid, update: RecordUpdate) -> Result<LabRecord, StoreError>;

    /// Remove the record for a lab. Returns whether one existed.
    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError>;

    /// All records, optionally limited to one server.
    async fn list(&self, server_id: Option<&str>) -> Result<Vec<LabRecord>, StoreError>;

    /// Remove every matching record and return what was removed.
    async fn delete_many(&self, filter: &RecordFilter) -> Result<Vec<LabRecord>, StoreError>;
}

/// Grant an extension on a tracked lab: the countdown restarts from `now`
/// with the renewal flag set.
///
/// Fails with [`StoreError::NotFound`] if the lab has no record, since only
/// warned labs can be extended.
pub async fn grant_extension(
    store: &dyn RecordStore,
    key: &RecordKey,
    now: DateTime<Utc>,
) -> Result<LabRecord, StoreError> {
    let record = store.find(key).await?.ok_or_else(|| {
        StoreError::NotFound(format!(
            "lab {} of {} on {}",
            key.lab_id, key.identity, key.server_id
        ))
    })?;
    store.update(record.id, RecordUpdate::renew(now)).await
}
