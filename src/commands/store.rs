//! Record storage behind the mutating commands.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, ToolError};

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Defines the interface for record storage implementations.
#[async_trait]
pub trait RecordStore: Send + Sync + Debug {
    async fn get(&self, id: &str) -> Result<Option<Record>>;

    /// All records, ordered by id.
    async fn list(&self) -> Result<Vec<Record>>;

    /// Insert a new record. Without an id a UUID is generated; an id already
    /// in use is rejected.
    async fn create(&self, id: Option<String>, data: Value) -> Result<Record>;

    /// Replace the data of an existing record.
    async fn update(&self, id: &str, data: Value) -> Result<Record>;

    /// Remove a record, returning what was removed.
    async fn delete(&self, id: &str) -> Result<Record>;
}

/// Process-local store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    inner: Arc<Mutex<BTreeMap<String, Record>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Record>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.lock().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Record>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn create(&self, id: Option<String>, data: Value) -> Result<Record> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut records = self.lock();
        if records.contains_key(&id) {
            return Err(ToolError::Validation {
                message: format!("record '{id}' already exists"),
                details: Vec::new(),
            });
        }
        let now = Utc::now();
        let record = Record {
            id: id.clone(),
            data,
            created_at: now,
            updated_at: now,
        };
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, id: &str, data: Value) -> Result<Record> {
        let mut records = self.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| ToolError::not_found("record", id))?;
        record.data = data;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn delete(&self, id: &str) -> Result<Record> {
        self.lock()
            .remove(id)
            .ok_or_else(|| ToolError::not_found("record", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[tokio::test]
    async fn crud_round() {
        let store = InMemoryRecordStore::new();
        let a = store.create(Some("a".into()), json!({ "n": 1 })).await.unwrap();
        let generated = store.create(None, json!({})).await.unwrap();
        assert!(Uuid::parse_str(&generated.id).is_ok());

        let updated = store.update("a", json!({ "n": 2 })).await.unwrap();
        assert_eq!(updated.created_at, a.created_at);
        assert_eq!(store.get("a").await.unwrap().unwrap().data, json!({ "n": 2 }));

        let removed = store.delete("a").await.unwrap();
        assert_eq!(removed.data, json!({ "n": 2 }));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_and_duplicate_ids_are_rejected() {
        let store = InMemoryRecordStore::new();
        store.create(Some("a".into()), json!(1)).await.unwrap();
        let dup = store.create(Some("a".into()), json!(2)).await.unwrap_err();
        assert_eq!(dup.code(), ErrorCode::ValidationError);
        assert_eq!(
            store.update("zz", json!(1)).await.unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert_eq!(store.delete("zz").await.unwrap_err().code(), ErrorCode::NotFound);
    }
}
