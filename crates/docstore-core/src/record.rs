//! Record model shared by every storage backend.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest accepted collection name.
pub const MAX_COLLECTION_NAME_LEN: usize = 64;

/// Bookkeeping attached to every stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Starts at 1 on create, only ever increases
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Time to live in seconds, counted from `created_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl RecordMetadata {
    /// Fresh metadata for a record created at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            version: 1,
            tags: None,
            ttl: None,
        }
    }

    /// Whether the record's TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => self.created_at + Duration::seconds(ttl as i64) <= now,
            None => false,
        }
    }

    /// Whether the record carries every tag in `tags`.
    pub fn has_tags(&self, tags: &[String]) -> bool {
        let own = self.tags.as_deref().unwrap_or_default();
        tags.iter().all(|t| own.contains(t))
    }
}

/// One stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRecord<T = Value> {
    pub id: String,
    pub collection: String,
    pub data: T,
    pub metadata: RecordMetadata,
}

impl DataRecord<Value> {
    /// Build a record stamped with the current time.
    pub fn new(collection: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            data,
            metadata: RecordMetadata::new(Utc::now()),
        }
    }

    /// Build a record with a freshly generated UUID.
    pub fn with_generated_id(collection: impl Into<String>, data: Value) -> Self {
        Self::new(collection, uuid::Uuid::new_v4().to_string(), data)
    }

    /// Attach tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.metadata.tags = Some(tags);
        self
    }

    /// Attach a TTL in seconds.
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.metadata.ttl = Some(ttl);
        self
    }

    /// Deserialize the payload into a concrete type.
    pub fn into_typed<U: DeserializeOwned>(self) -> Result<DataRecord<U>> {
        Ok(DataRecord {
            id: self.id,
            collection: self.collection,
            data: serde_json::from_value(self.data)?,
            metadata: self.metadata,
        })
    }

    /// Size of the serialized payload in bytes.
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.data).map(|v| v.len()).unwrap_or(0)
    }

    /// Shallow-merge `patch` into the payload and bump bookkeeping.
    ///
    /// Object patches overwrite top-level keys; any other patch replaces the
    /// payload outright.
    pub fn apply_patch(&mut self, patch: Value, increment_version: bool, now: DateTime<Utc>) {
        match (&mut self.data, patch) {
            (Value::Object(existing), Value::Object(changes)) => {
                for (key, value) in changes {
                    existing.insert(key, value);
                }
            }
            (data, patch) => *data = patch,
        }
        self.metadata.updated_at = now;
        if increment_version {
            self.metadata.version += 1;
        }
    }
}

impl<T: Serialize> DataRecord<T> {
    /// Convert a typed record back into the untyped storage form.
    pub fn into_untyped(self) -> Result<DataRecord<Value>> {
        Ok(DataRecord {
            id: self.id,
            collection: self.collection,
            data: serde_json::to_value(self.data)?,
            metadata: self.metadata,
        })
    }
}

/// Fixed-width RFC 3339 form; sorts lexicographically in time order.
pub fn timestamp_string(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a timestamp written by [`timestamp_string`].
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("invalid timestamp '{}': {}", raw, e)))
}

/// Reject collection names that are unsafe as directory names or SQL suffixes.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("collection name must not be empty".into()));
    }
    if name.len() > MAX_COLLECTION_NAME_LEN {
        return Err(Error::Validation(format!(
            "collection name '{}' exceeds {} characters",
            name, MAX_COLLECTION_NAME_LEN
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().map_or(false, |c| c.is_ascii_alphanumeric());
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(Error::Validation(format!(
            "collection name '{}' must match [A-Za-z0-9][A-Za-z0-9_-]*",
            name
        )));
    }
    Ok(())
}

/// Reject record ids that are empty or would escape a collection directory.
pub fn validate_record_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation("record id must not be empty".into()));
    }
    if id.contains(['/', '\\', '\0']) || id == "." || id == ".." {
        return Err(Error::Validation(format!("record id '{}' contains path characters", id)));
    }
    Ok(())
}

/// Extra information returned alongside a [`StorageResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

/// JSON envelope used at transport boundaries.
///
/// `success: true` with no `data` means the operation completed and found
/// nothing, which is distinct from `success: false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageResult<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
}

impl<T> StorageResult<T> {
    pub fn ok(data: Option<T>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            metadata: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: ResultMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Convert back into a `Result`, failing on `success: false`.
    pub fn into_result(self) -> Result<Option<T>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(Error::Worker(
                self.error.unwrap_or_else(|| "operation failed without a message".into()),
            ))
        }
    }
}

impl<T> From<Result<Option<T>>> for StorageResult<T> {
    fn from(result: Result<Option<T>>) -> Self {
        match result {
            Ok(data) => StorageResult::ok(data),
            Err(e) => StorageResult::failure(e.to_string()),
        }
    }
}

/// Derived per-collection statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    pub name: String,
    pub record_count: usize,
    /// Sum of payload sizes in bytes
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl CollectionStats {
    /// Stats computed from a set of records.
    pub fn from_records<'a>(name: &str, records: impl IntoIterator<Item = &'a DataRecord>) -> Self {
        let mut stats = CollectionStats {
            name: name.to_string(),
            record_count: 0,
            total_size: 0,
            last_modified: None,
            schema: None,
        };
        for record in records {
            stats.record_count += 1;
            stats.total_size += record.payload_size() as u64;
            let updated = record.metadata.updated_at;
            if stats.last_modified.map_or(true, |t| updated > t) {
                stats.last_modified = Some(updated);
            }
        }
        stats
    }
}

/// An embedding attached to a record, stored apart from the record itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredVector {
    pub record_id: String,
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl StoredVector {
    pub fn new(record_id: impl Into<String>, embedding: Vec<f32>, model: Option<String>) -> Self {
        Self {
            record_id: record_id.into(),
            embedding,
            model,
            generated_at: Utc::now(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.embedding.len()
    }
}
