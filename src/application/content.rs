//! In-process content collections served behind the response cache.
//!
//! Entries are schemaless JSON objects grouped by collection. The store
//! enforces only the collection allow-list and that payloads are objects.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const DEFAULT_COLLECTIONS: &[&str] = &["news", "resources", "activities"];
const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("unknown collection `{0}`")]
    UnknownCollection(String),
    #[error("entry `{id}` not found in `{collection}`")]
    NotFound { collection: String, id: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentItem {
    pub id: Uuid,
    pub collection: String,
    #[serde(serialize_with = "time::serde::rfc3339::serialize")]
    pub created_at: OffsetDateTime,
    #[serde(serialize_with = "time::serde::rfc3339::serialize")]
    pub updated_at: OffsetDateTime,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemPage {
    pub items: Vec<ContentItem>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

pub struct ContentStore {
    collections: RwLock<HashMap<String, BTreeMap<Uuid, ContentItem>>>,
    reads: AtomicU64,
}

impl ContentStore {
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let collections = collections
            .into_iter()
            .map(|name| (name.into(), BTreeMap::new()))
            .collect();
        Self {
            collections: RwLock::new(collections),
            reads: AtomicU64::new(0),
        }
    }

    /// Number of read operations served, cached responses excluded.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub async fn list(&self, collection: &str, query: &ListQuery) -> Result<ItemPage, ContentError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.collections.read().await;
        let entries = guard
            .get(collection)
            .ok_or_else(|| ContentError::UnknownCollection(collection.to_string()))?;

        let per_page = query
            .per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE);
        let page = query.page.unwrap_or(1).max(1);

        let mut items: Vec<ContentItem> = entries.values().cloned().collect();
        items.sort_by(|left, right| right.created_at.cmp(&left.created_at).then(left.id.cmp(&right.id)));
        let total = items.len();
        let items = items
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();

        Ok(ItemPage {
            items,
            page,
            per_page,
            total,
        })
    }

    pub async fn get(&self, collection: &str, id: Uuid) -> Result<ContentItem, ContentError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.collections.read().await;
        guard
            .get(collection)
            .ok_or_else(|| ContentError::UnknownCollection(collection.to_string()))?
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(collection, id))
    }

    pub async fn create(&self, collection: &str, payload: Value) -> Result<ContentItem, ContentError> {
        let data = into_object(payload)?;
        let mut guard = self.collections.write().await;
        let entries = guard
            .get_mut(collection)
            .ok_or_else(|| ContentError::UnknownCollection(collection.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let item = ContentItem {
            id: Uuid::new_v4(),
            collection: collection.to_string(),
            created_at: now,
            updated_at: now,
            data,
        };
        entries.insert(item.id, item.clone());
        Ok(item)
    }

    /// Replace the payload wholesale.
    pub async fn replace(
        &self,
        collection: &str,
        id: Uuid,
        payload: Value,
    ) -> Result<ContentItem, ContentError> {
        let data = into_object(payload)?;
        self.modify(collection, id, |item| item.data = data).await
    }

    /// Merge top-level fields; `null` removes a field.
    pub async fn patch(
        &self,
        collection: &str,
        id: Uuid,
        payload: Value,
    ) -> Result<ContentItem, ContentError> {
        let changes = into_object(payload)?;
        self.modify(collection, id, |item| {
            for (field, value) in changes {
                if value.is_null() {
                    item.data.remove(&field);
                } else {
                    item.data.insert(field, value);
                }
            }
        })
        .await
    }

    pub async fn delete(&self, collection: &str, id: Uuid) -> Result<(), ContentError> {
        let mut guard = self.collections.write().await;
        guard
            .get_mut(collection)
            .ok_or_else(|| ContentError::UnknownCollection(collection.to_string()))?
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(collection, id))
    }

    async fn modify(
        &self,
        collection: &str,
        id: Uuid,
        apply: impl FnOnce(&mut ContentItem),
    ) -> Result<ContentItem, ContentError> {
        let mut guard = self.collections.write().await;
        let item = guard
            .get_mut(collection)
            .ok_or_else(|| ContentError::UnknownCollection(collection.to_string()))?
            .get_mut(&id)
            .ok_or_else(|| not_found(collection, id))?;
        apply(item);
        item.updated_at = OffsetDateTime::now_utc();
        Ok(item.clone())
    }
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new(DEFAULT_COLLECTIONS.iter().copied())
    }
}

fn into_object(payload: Value) -> Result<Map<String, Value>, ContentError> {
    match payload {
        Value::Object(map) => Ok(map),
        other => Err(ContentError::InvalidPayload(format!(
            "expected a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn not_found(collection: &str, id: Uuid) -> ContentError {
    ContentError::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn create_then_read_back() {
        let store = ContentStore::default();
        let created = store
            .create("news", json!({"title": "Opening day"}))
            .await
            .unwrap();

        let fetched = store.get("news", created.id).await.unwrap();
        assert_eq!(fetched.data["title"], "Opening day");
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn unknown_collections_are_rejected() {
        let store = ContentStore::default();
        let err = store.create("secrets", json!({})).await.unwrap_err();
        assert_eq!(err, ContentError::UnknownCollection("secrets".to_string()));
    }

    #[tokio::test]
    async fn payload_must_be_an_object() {
        let store = ContentStore::default();
        let err = store.create("news", json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, ContentError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn patch_merges_and_removes_fields() {
        let store = ContentStore::default();
        let item = store
            .create("resources", json!({"title": "Guide", "draft": true}))
            .await
            .unwrap();

        let patched = store
            .patch("resources", item.id, json!({"draft": null, "pages": 12}))
            .await
            .unwrap();
        assert!(!patched.data.contains_key("draft"));
        assert_eq!(patched.data["pages"], 12);
        assert_eq!(patched.data["title"], "Guide");
    }

    #[tokio::test]
    async fn list_paginates() {
        let store = ContentStore::default();
        for n in 0..5 {
            store.create("activities", json!({"n": n})).await.unwrap();
        }
        let page = store
            .list(
                "activities",
                &ListQuery {
                    page: Some(2),
                    per_page: Some(2),
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn pages_past_the_end_are_empty() {
        let store = ContentStore::default();
        store.create("news", json!({"n": 1})).await.unwrap();
        let page = store
            .list(
                "news",
                &ListQuery {
                    page: Some(usize::MAX),
                    per_page: Some(usize::MAX),
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert!(page.items.is_empty());
        assert_eq!(page.page, usize::MAX);
    }

    #[tokio::test]
    async fn delete_missing_entry_is_not_found() {
        let store = ContentStore::default();
        let err = store.delete("news", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ContentError::NotFound { .. }));
    }
}
