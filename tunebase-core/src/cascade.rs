// tunebase-core/src/cascade.rs
//! Cascade engine: structural deletes and reparenting.
//!
//! Deletes collect the full descendant closure (ids and snapshots) before
//! touching storage, then execute bottom-up - stages, engines, types,
//! models, groups, root - so a child is never left pointing at a missing
//! parent. A failure partway is fatal: the exact completed counts are
//! surfaced in [`CatalogError::PartialCascade`], never swallowed.
//!
//! Moves rewrite the foreign key onto the new parent and re-derive every
//! denormalized ancestor id (`brandId` on a moved Type, `modelId` on a
//! moved Engine and on the Engines under a moved Type) from the new parent
//! chain, rejecting the whole operation before any write when the target
//! cannot be resolved.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audit::{record_change, AuditAction};
use crate::entity::{id_field, Collection, EntityId};
use crate::error::{CatalogError, Result};
use crate::store::{EntityStore, FindOptions};
use crate::{log_error, log_info};

// ========== DELETE ==========

/// Exact number of removed documents per collection, for caller reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub brands: u64,
    pub groups: u64,
    pub models: u64,
    pub types: u64,
    pub engines: u64,
    pub stages: u64,
}

impl DeleteReport {
    pub fn total(&self) -> u64 {
        self.brands + self.groups + self.models + self.types + self.engines + self.stages
    }

    fn slot(&mut self, collection: Collection) -> &mut u64 {
        match collection {
            Collection::Brands => &mut self.brands,
            Collection::Groups => &mut self.groups,
            Collection::Models => &mut self.models,
            Collection::Types => &mut self.types,
            Collection::Engines => &mut self.engines,
            Collection::Stages => &mut self.stages,
            Collection::AuditLogs => unreachable!("audit log is never cascade-deleted"),
        }
    }
}

impl fmt::Display for DeleteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "brands={} groups={} models={} types={} engines={} stages={}",
            self.brands, self.groups, self.models, self.types, self.engines, self.stages
        )
    }
}

/// Snapshots of every descendant of a node, collected before any write.
#[derive(Debug, Default)]
pub struct DescendantClosure {
    pub groups: Vec<Value>,
    pub models: Vec<Value>,
    pub types: Vec<Value>,
    pub engines: Vec<Value>,
    pub stages: Vec<Value>,
}

fn ids_of(docs: &[Value]) -> Vec<EntityId> {
    docs.iter().filter_map(|d| id_field(d, "id")).collect()
}

fn children_in<S: EntityStore>(
    store: &S,
    collection: Collection,
    fk_field: &str,
    parent_ids: &[EntityId],
) -> Result<Vec<Value>> {
    if parent_ids.is_empty() {
        return Ok(Vec::new());
    }
    store.find_by(
        collection,
        &json!({ fk_field: { "$in": parent_ids } }),
        &FindOptions::default(),
    )
}

/// Resolve the full descendant closure of a node, walking child collections
/// top-down in hierarchy order. Read-only; nothing is written.
pub fn collect_closure<S: EntityStore>(
    store: &S,
    collection: Collection,
    id: EntityId,
) -> Result<(Value, DescendantClosure)> {
    let Some(root) = store.find_by_id(collection, id)? else {
        log_error!("cascade: {} {} does not exist, nothing collected", collection, id);
        return Err(CatalogError::NotFound { collection, id });
    };

    let mut closure = DescendantClosure::default();

    if collection == Collection::Brands {
        closure.groups =
            store.find_by(Collection::Groups, &json!({"brandId": id}), &FindOptions::default())?;
    }

    closure.models = match collection {
        Collection::Brands => {
            store.find_by(Collection::Models, &json!({"brandId": id}), &FindOptions::default())?
        }
        Collection::Groups => {
            store.find_by(Collection::Models, &json!({"groupId": id}), &FindOptions::default())?
        }
        _ => Vec::new(),
    };

    closure.types = match collection {
        Collection::Brands | Collection::Groups => {
            children_in(store, Collection::Types, "modelId", &ids_of(&closure.models))?
        }
        Collection::Models => {
            store.find_by(Collection::Types, &json!({"modelId": id}), &FindOptions::default())?
        }
        _ => Vec::new(),
    };

    closure.engines = match collection {
        Collection::Brands | Collection::Groups | Collection::Models => {
            children_in(store, Collection::Engines, "typeId", &ids_of(&closure.types))?
        }
        Collection::Types => {
            store.find_by(Collection::Engines, &json!({"typeId": id}), &FindOptions::default())?
        }
        _ => Vec::new(),
    };

    closure.stages = match collection {
        Collection::Brands | Collection::Groups | Collection::Models | Collection::Types => {
            children_in(store, Collection::Stages, "engineId", &ids_of(&closure.engines))?
        }
        Collection::Engines => {
            store.find_by(Collection::Stages, &json!({"engineId": id}), &FindOptions::default())?
        }
        _ => Vec::new(),
    };

    Ok((root, closure))
}

fn delete_level<S: EntityStore>(
    store: &mut S,
    collection: Collection,
    docs: &[Value],
    report: &mut DeleteReport,
    root: (Collection, EntityId),
    changed_by: &str,
) -> Result<()> {
    for doc in docs {
        let Some(doc_id) = id_field(doc, "id") else {
            continue;
        };
        let removed = store.delete_by_id(collection, doc_id).map_err(|e| {
            log_error!(
                "cascade delete of {} {} failed at {} {} ({}), completed: {}",
                root.0,
                root.1,
                collection,
                doc_id,
                e,
                report
            );
            CatalogError::PartialCascade {
                completed: *report,
                reason: format!("delete of {} {} failed: {}", collection, doc_id, e),
            }
        })?;
        if !removed {
            continue;
        }
        *report.slot(collection) += 1;
        record_change(
            store,
            collection,
            doc_id,
            AuditAction::Delete,
            Some(doc.clone()),
            None,
            changed_by,
            json!({"cascadedFrom": {"collection": root.0.name(), "documentId": root.1}}),
        )
        .map_err(|e| CatalogError::PartialCascade {
            completed: *report,
            reason: format!("audit write for {} {} failed: {}", collection, doc_id, e),
        })?;
    }
    Ok(())
}

/// Cascade-delete a node and everything transitively reachable under it.
///
/// Deletion order is strictly innermost-first; each removed document gets
/// its own `delete` audit entry, the root entry additionally records the
/// cascade scope in `metadata.deletedCounts`.
pub fn delete_cascade<S: EntityStore>(
    store: &mut S,
    collection: Collection,
    id: EntityId,
    changed_by: &str,
) -> Result<DeleteReport> {
    if !Collection::HIERARCHY.contains(&collection) {
        return Err(CatalogError::InvalidSelector(format!(
            "cannot cascade-delete from {}",
            collection
        )));
    }

    let (root, closure) = collect_closure(store, collection, id)?;
    log_info!(
        "cascade delete {} {}: {} groups, {} models, {} types, {} engines, {} stages in scope",
        collection,
        id,
        closure.groups.len(),
        closure.models.len(),
        closure.types.len(),
        closure.engines.len(),
        closure.stages.len()
    );

    let mut report = DeleteReport::default();
    let root_ref = (collection, id);

    // Bottom-up: a child must never outlive its parent's deletion point.
    delete_level(store, Collection::Stages, &closure.stages, &mut report, root_ref, changed_by)?;
    delete_level(store, Collection::Engines, &closure.engines, &mut report, root_ref, changed_by)?;
    delete_level(store, Collection::Types, &closure.types, &mut report, root_ref, changed_by)?;
    delete_level(store, Collection::Models, &closure.models, &mut report, root_ref, changed_by)?;
    delete_level(store, Collection::Groups, &closure.groups, &mut report, root_ref, changed_by)?;

    store.delete_by_id(collection, id).map_err(|e| {
        log_error!(
            "cascade delete of {} {} failed at the root itself ({}), completed: {}",
            collection,
            id,
            e,
            report
        );
        CatalogError::PartialCascade {
            completed: report,
            reason: format!("delete of root {} {} failed: {}", collection, id, e),
        }
    })?;
    *report.slot(collection) += 1;

    record_change(
        store,
        collection,
        id,
        AuditAction::Delete,
        Some(root),
        None,
        changed_by,
        json!({"cascade": true, "deletedCounts": report}),
    )?;

    Ok(report)
}

// ========== MOVE ==========

fn expected_parent(item: Collection) -> Result<Collection> {
    match item {
        Collection::Models => Ok(Collection::Groups),
        Collection::Types => Ok(Collection::Models),
        Collection::Engines => Ok(Collection::Types),
        other => Err(CatalogError::InvalidSelector(format!(
            "{} documents cannot be moved",
            other
        ))),
    }
}

/// Reparent a Model, Type or Engine under a new parent.
///
/// Validates the target before any write, rewrites the foreign key and all
/// denormalized ancestor ids on the item and its descendants, and records
/// one `move` audit entry with the before/after state. Moving an item onto
/// its current parent is an idempotent no-op (no write, no audit entry).
pub fn move_item<S: EntityStore>(
    store: &mut S,
    item: Collection,
    item_id: EntityId,
    parent: Collection,
    parent_id: EntityId,
    changed_by: &str,
) -> Result<Value> {
    let expected = expected_parent(item)?;
    if parent != expected {
        return Err(CatalogError::InvalidReference(format!(
            "{} can only be moved under {}, not {}",
            item, expected, parent
        )));
    }

    let Some(item_doc) = store.find_by_id(item, item_id)? else {
        return Err(CatalogError::NotFound { collection: item, id: item_id });
    };
    let Some(parent_doc) = store.find_by_id(parent, parent_id)? else {
        log_error!(
            "move: target {} {} does not exist (moving {} {}, actor {})",
            parent,
            parent_id,
            item,
            item_id,
            changed_by
        );
        return Err(CatalogError::NotFound { collection: parent, id: parent_id });
    };

    // Build the patch for the item plus any descendant denorm rewrites.
    let (fk_field, _) = item.parent_link().expect("movable collections have a parent link");
    let mut patch = serde_json::Map::new();
    patch.insert(fk_field.to_string(), Value::from(parent_id));

    let mut descendant_patches: Vec<(EntityId, Value)> = Vec::new();

    match item {
        Collection::Models => {
            // Cross-brand reparenting is wrong lineage, not a rewrite case.
            let item_brand = id_field(&item_doc, "brandId");
            let group_brand = id_field(&parent_doc, "brandId");
            if item_brand != group_brand {
                return Err(CatalogError::InvalidReference(format!(
                    "group {} belongs to brand {:?}, model {} to brand {:?}",
                    parent_id, group_brand, item_id, item_brand
                )));
            }
        }
        Collection::Types => {
            // brandId on the Type is derived from the new Model.
            let new_brand = id_field(&parent_doc, "brandId").ok_or_else(|| {
                CatalogError::InvalidReference(format!(
                    "model {} has no resolvable brand",
                    parent_id
                ))
            })?;
            patch.insert("brandId".to_string(), Value::from(new_brand));
            // Engines under the Type carry the Model id denormalized.
            let engines = store.find_by(
                Collection::Engines,
                &json!({"typeId": item_id}),
                &FindOptions::default(),
            )?;
            for engine in &engines {
                if let Some(engine_id) = id_field(engine, "id") {
                    if id_field(engine, "modelId") != Some(parent_id) {
                        descendant_patches.push((engine_id, json!({"modelId": parent_id})));
                    }
                }
            }
        }
        Collection::Engines => {
            // modelId on the Engine is derived from the new Type.
            let new_model = id_field(&parent_doc, "modelId").ok_or_else(|| {
                CatalogError::InvalidReference(format!(
                    "type {} has no resolvable model",
                    parent_id
                ))
            })?;
            patch.insert("modelId".to_string(), Value::from(new_model));
        }
        _ => unreachable!("expected_parent already rejected this collection"),
    }

    // Idempotent no-op: every patched field already holds its target value.
    let unchanged = patch
        .iter()
        .all(|(field, value)| item_doc.get(field) == Some(value));
    if unchanged && descendant_patches.is_empty() {
        return Ok(item_doc);
    }

    let patch = Value::Object(patch);
    store.update_by_id(item, item_id, &patch)?;
    let rewritten = if descendant_patches.is_empty() {
        0
    } else {
        store.update_batch(Collection::Engines, &descendant_patches)?
    };

    let after = store
        .find_by_id(item, item_id)?
        .ok_or(CatalogError::NotFound { collection: item, id: item_id })?;

    record_change(
        store,
        item,
        item_id,
        AuditAction::Move,
        Some(item_doc),
        Some(after.clone()),
        changed_by,
        json!({
            "movedTo": {"collection": parent.name(), "documentId": parent_id},
            "descendantsRewritten": rewritten,
        }),
    )?;

    Ok(after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{history, AuditAction};
    use crate::store::MemoryStore;

    /// Two-brand fixture: Audi (RS group, RS3 model, 8V type, one engine,
    /// two stages) and BMW (M group, M3 model).
    fn seeded_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        for (collection, doc) in [
            (Collection::Brands, json!({"id": 1, "name": "Audi", "slug": "audi"})),
            (Collection::Brands, json!({"id": 2, "name": "BMW", "slug": "bmw"})),
            (Collection::Groups, json!({"id": 10, "brandId": 1, "name": "RS", "slug": "rs", "isPerformance": true})),
            (Collection::Groups, json!({"id": 11, "brandId": 1, "name": "Standard", "slug": "standard"})),
            (Collection::Groups, json!({"id": 20, "brandId": 2, "name": "M", "slug": "m", "isPerformance": true})),
            (Collection::Models, json!({"id": 100, "brandId": 1, "groupId": 10, "name": "RS3", "slug": "rs3"})),
            (Collection::Models, json!({"id": 200, "brandId": 2, "groupId": 20, "name": "M3", "slug": "m3"})),
            (Collection::Types, json!({"id": 1000, "modelId": 100, "brandId": 1, "name": "8V", "slug": "8v"})),
            (Collection::Engines, json!({"id": 10000, "typeId": 1000, "modelId": 100, "name": "2.5 TFSI", "type": "petrol", "slug": "2-5-tfsi"})),
            (Collection::Stages, json!({"id": 100000, "engineId": 10000, "stageName": "Stage 1", "stockHp": 400, "tunedHp": 480, "stockNm": 480, "tunedNm": 600, "gainHp": 80, "gainNm": 120, "price": 500.0})),
            (Collection::Stages, json!({"id": 100001, "engineId": 10000, "stageName": "Stage 2", "stockHp": 400, "tunedHp": 520, "stockNm": 480, "tunedNm": 650, "gainHp": 120, "gainNm": 170, "price": 900.0})),
        ] {
            store.insert(collection, doc).unwrap();
        }
        store
    }

    #[test]
    fn test_closure_of_brand_reaches_every_level() {
        let store = seeded_store();
        let (_, closure) = collect_closure(&store, Collection::Brands, 1).unwrap();
        assert_eq!(closure.groups.len(), 2);
        assert_eq!(closure.models.len(), 1);
        assert_eq!(closure.types.len(), 1);
        assert_eq!(closure.engines.len(), 1);
        assert_eq!(closure.stages.len(), 2);
    }

    #[test]
    fn test_delete_brand_cascades_completely() {
        let mut store = seeded_store();
        let report = delete_cascade(&mut store, Collection::Brands, 1, "admin").unwrap();
        assert_eq!(
            report,
            DeleteReport { brands: 1, groups: 2, models: 1, types: 1, engines: 1, stages: 2 }
        );

        // nothing under brand 1 remains
        for collection in Collection::HIERARCHY {
            for doc in store
                .find_by(collection, &json!({}), &FindOptions::default())
                .unwrap()
            {
                assert_ne!(id_field(&doc, "brandId"), Some(1), "{} survived", collection);
            }
        }
        // the sibling brand is untouched
        assert!(store.find_by_id(Collection::Brands, 2).unwrap().is_some());
        assert!(store.find_by_id(Collection::Models, 200).unwrap().is_some());
    }

    #[test]
    fn test_delete_group_takes_model_descendants() {
        let mut store = seeded_store();
        let report = delete_cascade(&mut store, Collection::Groups, 10, "admin").unwrap();
        assert_eq!(
            report,
            DeleteReport { brands: 0, groups: 1, models: 1, types: 1, engines: 1, stages: 2 }
        );
        // sibling group of the same brand survives
        assert!(store.find_by_id(Collection::Groups, 11).unwrap().is_some());
        assert!(store.find_by_id(Collection::Brands, 1).unwrap().is_some());
    }

    #[test]
    fn test_delete_writes_audit_entries_for_root_and_children() {
        let mut store = seeded_store();
        delete_cascade(&mut store, Collection::Engines, 10000, "admin").unwrap();

        let root_history = history(&store, Collection::Engines, 10000, 10).unwrap();
        assert_eq!(root_history.len(), 1);
        assert_eq!(root_history[0].action, AuditAction::Delete);
        assert_eq!(root_history[0].metadata["cascade"], json!(true));
        assert_eq!(root_history[0].metadata["deletedCounts"]["stages"], json!(2));

        let child_history = history(&store, Collection::Stages, 100000, 10).unwrap();
        assert_eq!(child_history.len(), 1);
        assert_eq!(
            child_history[0].metadata["cascadedFrom"]["collection"],
            json!("engines")
        );
    }

    #[test]
    fn test_delete_missing_target_is_not_found() {
        let mut store = seeded_store();
        let err = delete_cascade(&mut store, Collection::Models, 999, "admin").unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { id: 999, .. }));
    }

    #[test]
    fn test_move_engine_rewrites_model_denorm() {
        let mut store = seeded_store();
        store
            .insert(Collection::Types, json!({"id": 1001, "modelId": 200, "brandId": 2, "name": "G80", "slug": "g80"}))
            .unwrap();

        let moved = move_item(&mut store, Collection::Engines, 10000, Collection::Types, 1001, "admin").unwrap();
        assert_eq!(moved["typeId"], json!(1001));
        assert_eq!(moved["modelId"], json!(200));

        let entries = history(&store, Collection::Engines, 10000, 10).unwrap();
        assert_eq!(entries[0].action, AuditAction::Move);
        assert_eq!(entries[0].before.as_ref().unwrap()["typeId"], json!(1000));
    }

    #[test]
    fn test_move_type_rewrites_brand_and_engine_denorms() {
        let mut store = seeded_store();
        let moved = move_item(&mut store, Collection::Types, 1000, Collection::Models, 200, "admin").unwrap();
        assert_eq!(moved["modelId"], json!(200));
        assert_eq!(moved["brandId"], json!(2));

        // the engine under the moved type follows the new model
        let engine = store.find_by_id(Collection::Engines, 10000).unwrap().unwrap();
        assert_eq!(engine["modelId"], json!(200));
    }

    #[test]
    fn test_move_model_across_brands_is_rejected() {
        let mut store = seeded_store();
        let err = move_item(&mut store, Collection::Models, 100, Collection::Groups, 20, "admin").unwrap_err();
        assert!(matches!(err, CatalogError::InvalidReference(_)));
        // rejected before any write
        let model = store.find_by_id(Collection::Models, 100).unwrap().unwrap();
        assert_eq!(model["groupId"], json!(10));
    }

    #[test]
    fn test_move_model_within_brand() {
        let mut store = seeded_store();
        let moved = move_item(&mut store, Collection::Models, 100, Collection::Groups, 11, "admin").unwrap();
        assert_eq!(moved["groupId"], json!(11));
        assert_eq!(moved["brandId"], json!(1));
    }

    #[test]
    fn test_move_to_current_parent_is_noop_without_audit() {
        let mut store = seeded_store();
        let result = move_item(&mut store, Collection::Models, 100, Collection::Groups, 10, "admin").unwrap();
        assert_eq!(result["groupId"], json!(10));
        assert!(history(&store, Collection::Models, 100, 10).unwrap().is_empty());
    }

    #[test]
    fn test_move_to_wrong_parent_collection_is_invalid() {
        let mut store = seeded_store();
        let err = move_item(&mut store, Collection::Engines, 10000, Collection::Models, 100, "admin").unwrap_err();
        assert!(matches!(err, CatalogError::InvalidReference(_)));

        let err = move_item(&mut store, Collection::Brands, 1, Collection::Groups, 10, "admin").unwrap_err();
        assert!(matches!(err, CatalogError::InvalidSelector(_)));
    }

    // A store whose delete fails on one specific document, for partial-
    // failure surfacing.
    struct FlakyStore {
        inner: MemoryStore,
        fail_on: (Collection, EntityId),
    }

    impl EntityStore for FlakyStore {
        fn find_by_id(&self, c: Collection, id: EntityId) -> Result<Option<Value>> {
            self.inner.find_by_id(c, id)
        }
        fn find_by(&self, c: Collection, f: &Value, o: &FindOptions) -> Result<Vec<Value>> {
            self.inner.find_by(c, f, o)
        }
        fn insert(&mut self, c: Collection, d: Value) -> Result<EntityId> {
            self.inner.insert(c, d)
        }
        fn update_by_id(&mut self, c: Collection, id: EntityId, p: &Value) -> Result<bool> {
            self.inner.update_by_id(c, id, p)
        }
        fn delete_by_id(&mut self, c: Collection, id: EntityId) -> Result<bool> {
            if (c, id) == self.fail_on {
                return Err(CatalogError::Serialization("disk on fire".to_string()));
            }
            self.inner.delete_by_id(c, id)
        }
        fn count_documents(&self, c: Collection, f: &Value) -> Result<u64> {
            self.inner.count_documents(c, f)
        }
    }

    #[test]
    fn test_partial_cascade_failure_reports_completed_counts() {
        let mut store = FlakyStore {
            inner: seeded_store(),
            fail_on: (Collection::Engines, 10000),
        };
        let err = delete_cascade(&mut store, Collection::Brands, 1, "admin").unwrap_err();
        match err {
            CatalogError::PartialCascade { completed, reason } => {
                // both stages went before the engine blew up
                assert_eq!(completed.stages, 2);
                assert_eq!(completed.engines, 0);
                assert!(reason.contains("engines 10000"));
            }
            other => panic!("expected PartialCascade, got {other:?}"),
        }
    }
}
