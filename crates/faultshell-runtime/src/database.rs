/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Object-store database boundary.
//!
//! Stores hold JSON records by string key. An index names a top-level field
//! of the records; querying it returns every record whose field equals the
//! looked-up value, in key order.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    NoSuchStore(String),
    NoSuchIndex { store: String, index: String },
    TransactionAborted(String),
    NotFound { store: String, key: String },
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchStore(store) => write!(f, "object store {store:?} does not exist"),
            Self::NoSuchIndex { store, index } => {
                write!(f, "index {index:?} does not exist on {store:?}")
            }
            Self::TransactionAborted(message) => write!(f, "transaction aborted: {message}"),
            Self::NotFound { store, key } => write!(f, "no record {key:?} in {store:?}"),
        }
    }
}

impl std::error::Error for DbError {}

pub type IndexHits = Vec<(String, Value)>;

pub trait Database: Send + Sync {
    /// Idempotent.
    fn create_store(&self, store: &str);
    fn create_index(&self, store: &str, index: &str, field: &str) -> Result<(), DbError>;
    fn delete_index(&self, store: &str, index: &str) -> Result<bool, DbError>;
    fn index_names(&self, store: &str) -> Result<Vec<String>, DbError>;
    fn put(&self, store: &str, key: &str, value: Value) -> BoxFuture<'static, Result<(), DbError>>;
    fn get(&self, store: &str, key: &str) -> BoxFuture<'static, Result<Option<Value>, DbError>>;
    fn delete(&self, store: &str, key: &str) -> BoxFuture<'static, Result<bool, DbError>>;
    fn query_index(
        &self,
        store: &str,
        index: &str,
        value: Value,
    ) -> BoxFuture<'static, Result<IndexHits, DbError>>;
}

#[derive(Debug, Default)]
struct ObjectStore {
    records: BTreeMap<String, Value>,
    indexes: BTreeMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MemoryDatabase {
    stores: Arc<RwLock<BTreeMap<String, ObjectStore>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self, store: &str) -> usize {
        self.stores
            .read()
            .get(store)
            .map(|s| s.records.len())
            .unwrap_or(0)
    }
}

fn no_store(store: &str) -> DbError {
    DbError::NoSuchStore(store.to_string())
}

impl Database for MemoryDatabase {
    fn create_store(&self, store: &str) {
        self.stores.write().entry(store.to_string()).or_default();
    }

    fn create_index(&self, store: &str, index: &str, field: &str) -> Result<(), DbError> {
        let mut stores = self.stores.write();
        let object_store = stores.get_mut(store).ok_or_else(|| no_store(store))?;
        object_store
            .indexes
            .insert(index.to_string(), field.to_string());
        Ok(())
    }

    fn delete_index(&self, store: &str, index: &str) -> Result<bool, DbError> {
        let mut stores = self.stores.write();
        let object_store = stores.get_mut(store).ok_or_else(|| no_store(store))?;
        Ok(object_store.indexes.remove(index).is_some())
    }

    fn index_names(&self, store: &str) -> Result<Vec<String>, DbError> {
        let stores = self.stores.read();
        let object_store = stores.get(store).ok_or_else(|| no_store(store))?;
        Ok(object_store.indexes.keys().cloned().collect())
    }

    fn put(&self, store: &str, key: &str, value: Value) -> BoxFuture<'static, Result<(), DbError>> {
        let stores = self.stores.clone();
        let (store, key) = (store.to_string(), key.to_string());
        async move {
            let mut stores = stores.write();
            let object_store = stores.get_mut(&store).ok_or_else(|| no_store(&store))?;
            object_store.records.insert(key, value);
            Ok(())
        }
        .boxed()
    }

    fn get(&self, store: &str, key: &str) -> BoxFuture<'static, Result<Option<Value>, DbError>> {
        let stores = self.stores.clone();
        let (store, key) = (store.to_string(), key.to_string());
        async move {
            let stores = stores.read();
            let object_store = stores.get(&store).ok_or_else(|| no_store(&store))?;
            Ok(object_store.records.get(&key).cloned())
        }
        .boxed()
    }

    fn delete(&self, store: &str, key: &str) -> BoxFuture<'static, Result<bool, DbError>> {
        let stores = self.stores.clone();
        let (store, key) = (store.to_string(), key.to_string());
        async move {
            let mut stores = stores.write();
            let object_store = stores.get_mut(&store).ok_or_else(|| no_store(&store))?;
            Ok(object_store.records.remove(&key).is_some())
        }
        .boxed()
    }

    fn query_index(
        &self,
        store: &str,
        index: &str,
        value: Value,
    ) -> BoxFuture<'static, Result<IndexHits, DbError>> {
        let stores = self.stores.clone();
        let (store, index) = (store.to_string(), index.to_string());
        async move {
            let stores = stores.read();
            let object_store = stores.get(&store).ok_or_else(|| no_store(&store))?;
            let field = object_store
                .indexes
                .get(&index)
                .ok_or_else(|| DbError::NoSuchIndex {
                    store: store.clone(),
                    index: index.clone(),
                })?;
            Ok(object_store
                .records
                .iter()
                .filter(|(_, record)| record.get(field) == Some(&value))
                .map(|(key, record)| (key.clone(), record.clone()))
                .collect())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_store("users");
        db.create_index("users", "by_role", "role").unwrap();
        db.put("users", "b", json!({"role": "admin", "name": "Bea"})).await.unwrap();
        db.put("users", "a", json!({"role": "admin", "name": "Al"})).await.unwrap();
        db.put("users", "c", json!({"role": "guest", "name": "Cy"})).await.unwrap();
        db
    }

    #[tokio::test]
    async fn index_query_returns_matches_in_key_order() {
        let db = seeded().await;
        let hits = db.query_index("users", "by_role", json!("admin")).await.unwrap();
        let keys = hits.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn missing_stores_and_indexes_are_errors() {
        let db = seeded().await;
        assert_eq!(
            db.get("orders", "1").await,
            Err(DbError::NoSuchStore("orders".into()))
        );
        assert!(db.delete_index("users", "by_role").unwrap());
        assert!(matches!(
            db.query_index("users", "by_role", json!("admin")).await,
            Err(DbError::NoSuchIndex { .. })
        ));
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let db = seeded().await;
        assert!(db.delete("users", "a").await.unwrap());
        assert!(!db.delete("users", "a").await.unwrap());
        assert_eq!(db.get("users", "a").await, Ok(None));
        assert_eq!(db.record_count("users"), 2);
    }
}
