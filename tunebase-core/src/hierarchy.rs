// tunebase-core/src/hierarchy.rs
//! Hierarchy resolver.
//!
//! Builds an eager, request-lifetime cache of all five collections so that
//! ancestor chains resolve with map lookups instead of N+1 store reads.
//! The cache is an explicit object passed into resolution calls - never
//! hidden global state - and is rebuilt per request, not shared across them.

use ahash::AHashMap;
use serde_json::Value;

use crate::entity::{display_name, id_field, Collection, EntityId};
use crate::error::Result;
use crate::store::{EntityStore, FindOptions};
use crate::log_trace;

/// Preloaded per-collection id -> document maps.
pub struct EntityCache {
    collections: AHashMap<Collection, AHashMap<EntityId, Value>>,
}

impl EntityCache {
    /// Eagerly load every catalog collection from the store.
    pub fn load<S: EntityStore>(store: &S) -> Result<Self> {
        let mut collections = AHashMap::new();
        for collection in Collection::HIERARCHY {
            let docs = store.find_by(collection, &Value::Object(Default::default()), &FindOptions::default())?;
            let mut by_id = AHashMap::with_capacity(docs.len());
            for doc in docs {
                if let Some(id) = id_field(&doc, "id") {
                    by_id.insert(id, doc);
                }
            }
            log_trace!("cache: loaded {} {} documents", by_id.len(), collection);
            collections.insert(collection, by_id);
        }
        Ok(EntityCache { collections })
    }

    pub fn get(&self, collection: Collection, id: EntityId) -> Option<&Value> {
        self.collections.get(&collection)?.get(&id)
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.collections.get(&collection).map_or(0, |m| m.len())
    }
}

/// Resolve the full ancestor name chain of a document, root first,
/// joined with `" → "` (e.g. `Audi → RS → RS3 → 8V → 2.5 TFSI → Stage 1`).
///
/// Used for human display in audit trails, so it degrades gracefully:
/// a missing ancestor link is skipped, never an error.
pub fn resolve_path(collection: Collection, doc: &Value, cache: &EntityCache) -> String {
    let mut names: Vec<String> = Vec::with_capacity(6);
    if let Some(name) = display_name(collection, doc) {
        names.push(name.to_string());
    }

    let mut current_collection = collection;
    let mut current_doc = doc.clone();
    while let Some((fk_field, parent_collection)) = current_collection.parent_link() {
        let Some(parent_id) = id_field(&current_doc, fk_field) else {
            break;
        };
        let Some(parent) = cache.get(parent_collection, parent_id) else {
            // Orphaned link - omit and keep walking upward is impossible
            // without the parent document, so stop here.
            log_trace!(
                "resolve_path: {} missing ancestor {} {}",
                current_collection,
                parent_collection,
                parent_id
            );
            break;
        };
        if let Some(name) = display_name(parent_collection, parent) {
            names.push(name.to_string());
        }
        current_doc = parent.clone();
        current_collection = parent_collection;
    }

    names.reverse();
    names.join(" → ")
}

/// Walk parent pointers up to the owning Brand id. Used to scope the
/// advisory structural-mutation locks; returns `None` for orphaned chains.
pub fn root_brand_of<S: EntityStore>(
    store: &S,
    collection: Collection,
    id: EntityId,
) -> Result<Option<EntityId>> {
    let mut current_collection = collection;
    let mut current_id = id;
    loop {
        if current_collection == Collection::Brands {
            return Ok(Some(current_id));
        }
        let Some((fk_field, parent_collection)) = current_collection.parent_link() else {
            return Ok(None);
        };
        let Some(doc) = store.find_by_id(current_collection, current_id)? else {
            return Ok(None);
        };
        let Some(parent_id) = id_field(&doc, fk_field) else {
            return Ok(None);
        };
        current_collection = parent_collection;
        current_id = parent_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn seeded_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store
            .insert(Collection::Brands, json!({"id": 1, "name": "Audi", "slug": "audi"}))
            .unwrap();
        store
            .insert(Collection::Groups, json!({"id": 10, "brandId": 1, "name": "RS", "slug": "rs"}))
            .unwrap();
        store
            .insert(
                Collection::Models,
                json!({"id": 100, "brandId": 1, "groupId": 10, "name": "RS3", "slug": "rs3"}),
            )
            .unwrap();
        store
            .insert(
                Collection::Types,
                json!({"id": 1000, "modelId": 100, "brandId": 1, "name": "8V", "slug": "8v"}),
            )
            .unwrap();
        store
            .insert(
                Collection::Engines,
                json!({"id": 10000, "typeId": 1000, "modelId": 100, "name": "2.5 TFSI", "type": "petrol", "slug": "2-5-tfsi"}),
            )
            .unwrap();
        store
            .insert(
                Collection::Stages,
                json!({"id": 100000, "engineId": 10000, "stageName": "Stage 1",
                       "stockHp": 400, "tunedHp": 480, "stockNm": 480, "tunedNm": 600,
                       "gainHp": 80, "gainNm": 120, "price": 500.0}),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_resolve_path_full_chain() {
        let store = seeded_store();
        let cache = EntityCache::load(&store).unwrap();
        let stage = store.find_by_id(Collection::Stages, 100000).unwrap().unwrap();
        assert_eq!(
            resolve_path(Collection::Stages, &stage, &cache),
            "Audi → RS → RS3 → 8V → 2.5 TFSI → Stage 1"
        );
    }

    #[test]
    fn test_resolve_path_mid_hierarchy() {
        let store = seeded_store();
        let cache = EntityCache::load(&store).unwrap();
        let model = store.find_by_id(Collection::Models, 100).unwrap().unwrap();
        assert_eq!(resolve_path(Collection::Models, &model, &cache), "Audi → RS → RS3");
    }

    #[test]
    fn test_resolve_path_degrades_on_missing_ancestor() {
        let mut store = seeded_store();
        store.delete_by_id(Collection::Types, 1000).unwrap();
        let cache = EntityCache::load(&store).unwrap();
        let stage = store.find_by_id(Collection::Stages, 100000).unwrap().unwrap();
        // chain stops at the orphaned link instead of failing
        assert_eq!(
            resolve_path(Collection::Stages, &stage, &cache),
            "2.5 TFSI → Stage 1"
        );
    }

    #[test]
    fn test_root_brand_of_every_level() {
        let store = seeded_store();
        for (collection, id) in [
            (Collection::Brands, 1),
            (Collection::Groups, 10),
            (Collection::Models, 100),
            (Collection::Types, 1000),
            (Collection::Engines, 10000),
            (Collection::Stages, 100000),
        ] {
            assert_eq!(root_brand_of(&store, collection, id).unwrap(), Some(1));
        }
    }

    #[test]
    fn test_root_brand_of_orphan_is_none() {
        let mut store = seeded_store();
        store.delete_by_id(Collection::Engines, 10000).unwrap();
        assert_eq!(root_brand_of(&store, Collection::Stages, 100000).unwrap(), None);
    }

    #[test]
    fn test_cache_len_counts_collections() {
        let store = seeded_store();
        let cache = EntityCache::load(&store).unwrap();
        assert_eq!(cache.len(Collection::Brands), 1);
        assert_eq!(cache.len(Collection::Stages), 1);
    }
}
