// tunebase-core/src/store.rs
//! Entity store abstraction.
//!
//! The engine consumes storage exclusively through the [`EntityStore`]
//! trait: id lookups, filtered scans, inserts, patches, batch patches and
//! deletes. Anything beyond these operations (real transactions, server-side
//! sorting) is deliberately out of the contract so the engine stays portable
//! across backends.
//!
//! [`MemoryStore`] is the in-process implementation used by the JSON-snapshot
//! persistence path, the CLI and the test suites.

use ahash::AHashMap;
use serde_json::Value;

use crate::entity::{Collection, EntityId};
use crate::error::{CatalogError, Result};

// ========== FILTER MATCHING ==========

/// Check a raw document against a JSON filter.
///
/// Supported shapes (the subset the engine actually issues):
/// - field equality: `{"brandId": 1}`
/// - membership: `{"typeId": {"$in": [1, 2, 3]}}`
///
/// An empty filter matches every document.
pub fn matches_filter(doc: &Value, filter: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return false;
    };
    for (field, cond) in conditions {
        let actual = doc.get(field).unwrap_or(&Value::Null);
        match cond.as_object().and_then(|o| o.get("$in")) {
            Some(Value::Array(allowed)) => {
                if !allowed.contains(actual) {
                    return false;
                }
            }
            Some(_) => return false,
            None => {
                if actual != cond {
                    return false;
                }
            }
        }
    }
    true
}

// ========== FIND OPTIONS ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// Sort/limit options for [`EntityStore::find_by`].
/// Multi-key sort compares key by key, like a Mongo sort document.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Vec<(String, SortDir)>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted_by(field: &str, dir: SortDir) -> Self {
        FindOptions {
            sort: vec![(field.to_string(), dir)],
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        // Mixed types keep their relative scan order
        _ => Ordering::Equal,
    }
}

pub(crate) fn apply_sort(docs: &mut [Value], sort: &[(String, SortDir)]) {
    docs.sort_by(|a, b| {
        for (field, dir) in sort {
            let va = a.get(field).unwrap_or(&Value::Null);
            let vb = b.get(field).unwrap_or(&Value::Null);
            let ord = compare_values(va, vb);
            if ord != std::cmp::Ordering::Equal {
                return match dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                };
            }
        }
        std::cmp::Ordering::Equal
    });
}

// ========== STORE TRAIT ==========

/// Storage contract consumed by every engine component.
///
/// Writes go through `&mut self`; the catalog facade serializes writers
/// behind one `parking_lot::RwLock`, so implementations don't need interior
/// locking of their own.
pub trait EntityStore: Send + Sync {
    /// O(1)-ish single document lookup. `Ok(None)` when absent.
    fn find_by_id(&self, collection: Collection, id: EntityId) -> Result<Option<Value>>;

    /// Filtered scan with optional sort/limit applied by the store.
    fn find_by(&self, collection: Collection, filter: &Value, options: &FindOptions)
        -> Result<Vec<Value>>;

    /// Insert a document. A positive `id` field is honored (snapshot import);
    /// otherwise the store assigns the next never-reused id. Returns the id.
    fn insert(&mut self, collection: Collection, doc: Value) -> Result<EntityId>;

    /// Merge `patch`'s top-level fields into the document. Returns whether
    /// the document existed.
    fn update_by_id(&mut self, collection: Collection, id: EntityId, patch: &Value)
        -> Result<bool>;

    /// Apply many patches as one batch write. Returns the number of
    /// documents that existed and were patched.
    fn update_batch(&mut self, collection: Collection, patches: &[(EntityId, Value)])
        -> Result<u64> {
        let mut applied = 0u64;
        for (id, patch) in patches {
            if self.update_by_id(collection, *id, patch)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Remove a document. Returns whether it existed. The id is never reused.
    fn delete_by_id(&mut self, collection: Collection, id: EntityId) -> Result<bool>;

    fn count_documents(&self, collection: Collection, filter: &Value) -> Result<u64>;
}

// ========== MEMORY STORE ==========

#[derive(Debug, Default)]
struct CollectionData {
    docs: AHashMap<EntityId, Value>,
    next_id: EntityId,
}

/// In-memory store backing the JSON-snapshot persistence path.
///
/// One `AHashMap` per collection; insertion ids only ever grow, so deleted
/// ids are never handed out again.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: AHashMap<Collection, CollectionData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self, collection: Collection) -> Option<&CollectionData> {
        self.collections.get(&collection)
    }

    fn data_mut(&mut self, collection: Collection) -> &mut CollectionData {
        self.collections.entry(collection).or_default()
    }
}

impl EntityStore for MemoryStore {
    fn find_by_id(&self, collection: Collection, id: EntityId) -> Result<Option<Value>> {
        Ok(self.data(collection).and_then(|d| d.docs.get(&id)).cloned())
    }

    fn find_by(
        &self,
        collection: Collection,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Vec<Value>> {
        let mut results: Vec<Value> = match self.data(collection) {
            Some(data) => data
                .docs
                .values()
                .filter(|doc| matches_filter(doc, filter))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        if options.sort.is_empty() {
            // Deterministic order even without an explicit sort
            apply_sort(&mut results, &[("id".to_string(), SortDir::Asc)]);
        } else {
            apply_sort(&mut results, &options.sort);
        }
        if let Some(limit) = options.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    fn insert(&mut self, collection: Collection, mut doc: Value) -> Result<EntityId> {
        let Some(obj) = doc.as_object_mut() else {
            return Err(CatalogError::Serialization(
                "document must be a JSON object".to_string(),
            ));
        };

        let explicit_id = obj.get("id").and_then(|v| v.as_i64()).filter(|id| *id > 0);
        let data = self.collections.entry(collection).or_default();

        // ID generálás
        let id = match explicit_id {
            Some(id) => {
                if data.docs.contains_key(&id) {
                    return Err(CatalogError::DuplicateId { collection, id });
                }
                data.next_id = data.next_id.max(id);
                id
            }
            None => {
                data.next_id += 1;
                let id = data.next_id;
                obj.insert("id".to_string(), Value::from(id));
                id
            }
        };

        data.docs.insert(id, doc);
        Ok(id)
    }

    fn update_by_id(
        &mut self,
        collection: Collection,
        id: EntityId,
        patch: &Value,
    ) -> Result<bool> {
        let data = self.data_mut(collection);
        let Some(doc) = data.docs.get_mut(&id) else {
            return Ok(false);
        };
        let (Some(target), Some(fields)) = (doc.as_object_mut(), patch.as_object()) else {
            return Err(CatalogError::Serialization(
                "patch and document must be JSON objects".to_string(),
            ));
        };
        for (field, value) in fields {
            if field == "id" {
                continue; // ids are immutable
            }
            target.insert(field.clone(), value.clone());
        }
        Ok(true)
    }

    fn delete_by_id(&mut self, collection: Collection, id: EntityId) -> Result<bool> {
        Ok(self.data_mut(collection).docs.remove(&id).is_some())
    }

    fn count_documents(&self, collection: Collection, filter: &Value) -> Result<u64> {
        Ok(match self.data(collection) {
            Some(data) => data
                .docs
                .values()
                .filter(|doc| matches_filter(doc, filter))
                .count() as u64,
            None => 0,
        })
    }
}
