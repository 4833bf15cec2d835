// tunebase-core/src/catalog.rs
//! Catalog facade.
//!
//! [`CatalogCore`] owns the entity store behind one writer lock plus the
//! advisory per-subtree locks, and exposes the actor-stamped entry points
//! the admin surface calls. Every mutation passes through here so that the
//! audit trail stays complete: direct store writes bypassing the facade
//! break the trail, which is a correctness requirement, not a style
//! preference.
//!
//! Generic over the storage backend; the engine only ever sees the
//! [`EntityStore`] trait:
//! - `CatalogCore<MemoryStore>` - JSON-snapshot-backed catalogs, tests, CLI

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::audit::{self, AuditFilter, AuditLogEntry};
use crate::bulk::{self, BulkSelector, BulkUpdateResult, DataType, ScopeLevel, UpdatePolicy};
use crate::cascade::{self, DeleteReport};
use crate::entity::{from_doc, id_field, slugify, Collection, EntityId, Stage};
use crate::error::{CatalogError, Result};
use crate::hierarchy::{resolve_path, root_brand_of, EntityCache};
use crate::locks::SubtreeLocks;
use crate::snapshot::CatalogSnapshot;
use crate::store::{EntityStore, FindOptions};
use crate::log_error;

/// Authorization decision issued by the external admin gate. The core
/// trusts it and stamps `changedBy` with the actor.
#[derive(Debug, Clone)]
pub struct AuthDecision {
    pub authorized: bool,
    pub actor: String,
}

impl AuthDecision {
    pub fn allow(actor: impl Into<String>) -> Self {
        AuthDecision { authorized: true, actor: actor.into() }
    }

    pub fn deny(actor: impl Into<String>) -> Self {
        AuthDecision { authorized: false, actor: actor.into() }
    }
}

/// The engine facade: store + advisory locks + audited entry points.
pub struct CatalogCore<S: EntityStore> {
    store: Arc<RwLock<S>>,
    locks: SubtreeLocks,
}

// Parent foreign keys are rewritten by moves only; a plain update touching
// one is wrong lineage by definition.
const PARENT_KEY_FIELDS: [&str; 5] = ["brandId", "groupId", "modelId", "typeId", "engineId"];

impl<S: EntityStore> CatalogCore<S> {
    pub fn new(store: S) -> Self {
        CatalogCore {
            store: Arc::new(RwLock::new(store)),
            locks: SubtreeLocks::new(),
        }
    }

    /// Shared handle to the underlying store, for read-only collaborators.
    pub fn store(&self) -> Arc<RwLock<S>> {
        Arc::clone(&self.store)
    }

    fn authorize<'a>(&self, auth: &'a AuthDecision) -> Result<&'a str> {
        if !auth.authorized {
            log_error!("rejected unauthorized catalog mutation by '{}'", auth.actor);
            return Err(CatalogError::Unauthorized(auth.actor.clone()));
        }
        Ok(&auth.actor)
    }

    /// The advisory lock for the subtree owning `(collection, id)`;
    /// falls back to the catalog-wide lock for brands and orphans.
    fn subtree_lock(&self, collection: Collection, id: EntityId) -> Arc<parking_lot::Mutex<()>> {
        if collection == Collection::Brands {
            return self.locks.for_brand(id);
        }
        let root = {
            let store = self.store.read();
            root_brand_of(&*store, collection, id).unwrap_or(None)
        };
        match root {
            Some(brand_id) => self.locks.for_brand(brand_id),
            None => self.locks.catalog_wide(),
        }
    }

    // ========== SINGLE-DOCUMENT MUTATIONS ==========

    /// Create one entity. Validates the parent lineage, derives the slug
    /// from the name when missing, forces the denormalized ancestor ids
    /// from the parent chain and records a `create` audit entry.
    pub fn create(&self, collection: Collection, mut doc: Value, auth: &AuthDecision) -> Result<Value> {
        let actor = self.authorize(auth)?;
        if !Collection::HIERARCHY.contains(&collection) {
            return Err(CatalogError::InvalidSelector(format!("cannot create {} documents", collection)));
        }

        let lock = match collection {
            Collection::Brands => self.locks.catalog_wide(),
            _ => {
                let parent_id = doc
                    .get(collection.parent_link().expect("non-brand has a parent").0)
                    .and_then(|v| v.as_i64());
                match parent_id {
                    Some(pid) => {
                        let (_, parent_collection) = collection.parent_link().unwrap();
                        self.subtree_lock(parent_collection, pid)
                    }
                    None => self.locks.catalog_wide(),
                }
            }
        };
        let _guard = lock.lock();

        let mut store = self.store.write();
        self.validate_and_derive(&mut *store, collection, &mut doc)?;

        let id = store.insert(collection, doc)?;
        let created = store
            .find_by_id(collection, id)?
            .ok_or(CatalogError::NotFound { collection, id })?;

        audit::record_change(
            &mut *store,
            collection,
            id,
            audit::AuditAction::Create,
            None,
            Some(created.clone()),
            actor,
            json!({}),
        )?;
        Ok(created)
    }

    fn validate_and_derive(&self, store: &mut S, collection: Collection, doc: &mut Value) -> Result<()> {
        let obj = doc.as_object_mut().ok_or_else(|| {
            CatalogError::Serialization("document must be a JSON object".to_string())
        })?;

        // slug from name, unless the caller brought one
        if !obj.contains_key("slug") {
            if let Some(name) = obj.get("name").and_then(|v| v.as_str()) {
                let slug = slugify(name);
                obj.insert("slug".to_string(), Value::from(slug));
            }
        }

        let parent = match collection.parent_link() {
            Some((fk_field, parent_collection)) => {
                let parent_id = obj.get(fk_field).and_then(|v| v.as_i64()).ok_or_else(|| {
                    CatalogError::InvalidReference(format!(
                        "new {} document needs a {}",
                        collection, fk_field
                    ))
                })?;
                let parent_doc = store.find_by_id(parent_collection, parent_id)?.ok_or(
                    CatalogError::NotFound { collection: parent_collection, id: parent_id },
                )?;
                Some(parent_doc)
            }
            None => None,
        };

        match collection {
            Collection::Models => {
                // groupId must belong to the model's own brand
                let group = parent.expect("models have a parent");
                let group_brand = id_field(&group, "brandId");
                match obj.get("brandId").and_then(|v| v.as_i64()) {
                    Some(brand_id) if Some(brand_id) != group_brand => {
                        return Err(CatalogError::InvalidReference(format!(
                            "group belongs to brand {:?}, not {}",
                            group_brand, brand_id
                        )));
                    }
                    Some(_) => {}
                    None => {
                        obj.insert("brandId".to_string(), json!(group_brand));
                    }
                }
            }
            Collection::Types => {
                let model = parent.expect("types have a parent");
                let brand_id = id_field(&model, "brandId").ok_or_else(|| {
                    CatalogError::InvalidReference("parent model has no resolvable brand".to_string())
                })?;
                obj.insert("brandId".to_string(), json!(brand_id));
            }
            Collection::Engines => {
                let ty = parent.expect("engines have a parent");
                let model_id = id_field(&ty, "modelId").ok_or_else(|| {
                    CatalogError::InvalidReference("parent type has no resolvable model".to_string())
                })?;
                obj.insert("modelId".to_string(), json!(model_id));
            }
            Collection::Stages => {
                let stock_hp = obj.get("stockHp").and_then(|v| v.as_i64()).unwrap_or(0);
                let tuned_hp = obj.get("tunedHp").and_then(|v| v.as_i64()).unwrap_or(0);
                let stock_nm = obj.get("stockNm").and_then(|v| v.as_i64()).unwrap_or(0);
                let tuned_nm = obj.get("tunedNm").and_then(|v| v.as_i64()).unwrap_or(0);
                obj.insert("gainHp".to_string(), json!(tuned_hp - stock_hp));
                obj.insert("gainNm".to_string(), json!(tuned_nm - stock_nm));
            }
            _ => {}
        }
        Ok(())
    }

    /// Patch one entity's own fields. Parent foreign keys can only change
    /// through [`CatalogCore::move_item`]; stage stock/tuned edits re-derive
    /// the gain fields in the same write.
    pub fn update(&self, collection: Collection, id: EntityId, patch: Value, auth: &AuthDecision) -> Result<Value> {
        let actor = self.authorize(auth)?;
        let lock = self.subtree_lock(collection, id);
        let _guard = lock.lock();

        let mut store = self.store.write();
        let Some(before) = store.find_by_id(collection, id)? else {
            log_error!("update: {} {} not found (actor {})", collection, id, actor);
            return Err(CatalogError::NotFound { collection, id });
        };

        let fields = patch.as_object().ok_or_else(|| {
            CatalogError::Serialization("patch must be a JSON object".to_string())
        })?;
        for fk in PARENT_KEY_FIELDS {
            if let Some(new_value) = fields.get(fk) {
                if before.get(fk).is_some() && before.get(fk) != Some(new_value) {
                    return Err(CatalogError::InvalidReference(format!(
                        "updating {} would reparent {} {}; use move instead",
                        fk, collection, id
                    )));
                }
            }
        }

        // Merge in memory so gains derive from the final field values.
        let mut merged = before.clone();
        let merged_obj = merged.as_object_mut().expect("documents are objects");
        for (field, value) in fields {
            if field == "id" {
                continue;
            }
            merged_obj.insert(field.clone(), value.clone());
        }
        if collection == Collection::Stages {
            let mut stage: Stage = from_doc(&merged)?;
            stage.recompute_gains();
            merged = crate::entity::to_doc(&stage)?;
        }

        store.update_by_id(collection, id, &merged)?;
        let after = store
            .find_by_id(collection, id)?
            .ok_or(CatalogError::NotFound { collection, id })?;

        audit::record_change(
            &mut *store,
            collection,
            id,
            audit::AuditAction::Update,
            Some(before),
            Some(after.clone()),
            actor,
            json!({}),
        )?;
        Ok(after)
    }

    // ========== STRUCTURAL MUTATIONS ==========

    /// Cascade-delete a node and its entire descendant closure.
    pub fn delete_cascade(&self, collection: Collection, id: EntityId, auth: &AuthDecision) -> Result<DeleteReport> {
        let actor = self.authorize(auth)?;
        let lock = self.subtree_lock(collection, id);
        let _guard = lock.lock();

        let mut store = self.store.write();
        cascade::delete_cascade(&mut *store, collection, id, actor)
    }

    /// Reparent a Model, Type or Engine. A cross-brand move would need two
    /// subtree locks; the catalog-wide lock covers that case instead of
    /// risking lock-order inversion.
    pub fn move_item(
        &self,
        item: Collection,
        item_id: EntityId,
        parent: Collection,
        parent_id: EntityId,
        auth: &AuthDecision,
    ) -> Result<Value> {
        let actor = self.authorize(auth)?;

        let (src_root, dst_root) = {
            let store = self.store.read();
            (
                root_brand_of(&*store, item, item_id)?,
                root_brand_of(&*store, parent, parent_id)?,
            )
        };
        let lock = match (src_root, dst_root) {
            (Some(a), Some(b)) if a == b => self.locks.for_brand(a),
            _ => self.locks.catalog_wide(),
        };
        let _guard = lock.lock();

        let mut store = self.store.write();
        cascade::move_item(&mut *store, item, item_id, parent, parent_id, actor)
    }

    /// Resolve a bulk selector and apply one update policy to the stages
    /// in scope, as one batch write.
    pub fn bulk_update(
        &self,
        selector: BulkSelector,
        data_type: DataType,
        policy: &UpdatePolicy,
        auth: &AuthDecision,
    ) -> Result<BulkUpdateResult> {
        let actor = self.authorize(auth)?;

        let lock = match (selector.level, selector.target_id) {
            (ScopeLevel::All, _) | (_, None) => self.locks.catalog_wide(),
            (ScopeLevel::Brand, Some(id)) => self.locks.for_brand(id),
            (ScopeLevel::Model, Some(id)) => self.subtree_lock(Collection::Models, id),
            (ScopeLevel::Generation, Some(id)) => self.subtree_lock(Collection::Types, id),
            (ScopeLevel::Engine, Some(id)) => self.subtree_lock(Collection::Engines, id),
        };
        let _guard = lock.lock();

        let mut store = self.store.write();
        let engine_ids = bulk::resolve_scope(&*store, &selector)?;
        bulk::apply_bulk(&mut *store, &engine_ids, data_type, policy, actor)
    }

    // ========== AUDIT SURFACE ==========

    pub fn history(&self, collection: Collection, id: EntityId, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let store = self.store.read();
        audit::history(&*store, collection, id, limit)
    }

    pub fn recent_logs(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let store = self.store.read();
        audit::recent_logs(&*store, filter, limit)
    }

    /// Roll a document back to the `before` snapshot of an audit version.
    pub fn rollback(&self, collection: Collection, id: EntityId, version: u64, auth: &AuthDecision) -> Result<AuditLogEntry> {
        let actor = self.authorize(auth)?;
        let lock = self.subtree_lock(collection, id);
        let _guard = lock.lock();

        let mut store = self.store.write();
        audit::rollback(&mut *store, collection, id, version, actor)
    }

    // ========== READ API ==========

    /// Presentation-facing scope resolution (read-only, unlocked).
    pub fn resolve_scope(&self, level: ScopeLevel, target_id: Option<EntityId>, group_id: Option<EntityId>) -> Result<Vec<EntityId>> {
        let store = self.store.read();
        bulk::resolve_scope(&*store, &BulkSelector { level, target_id, group_id })
    }

    /// Whether the brand's group selector is meaningful: false exactly when
    /// the brand has one group and it is not a performance group.
    pub fn has_groups(&self, brand_id: EntityId) -> Result<bool> {
        let store = self.store.read();
        if store.find_by_id(Collection::Brands, brand_id)?.is_none() {
            return Err(CatalogError::NotFound { collection: Collection::Brands, id: brand_id });
        }
        let groups = store.find_by(
            Collection::Groups,
            &json!({"brandId": brand_id}),
            &FindOptions::default(),
        )?;
        Ok(match groups.as_slice() {
            [] => false,
            [only] => only
                .get("isPerformance")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            _ => true,
        })
    }

    /// Human-readable ancestor chain of one document, for audit display.
    pub fn resolve_display_path(&self, collection: Collection, id: EntityId) -> Result<String> {
        let store = self.store.read();
        let Some(doc) = store.find_by_id(collection, id)? else {
            return Err(CatalogError::NotFound { collection, id });
        };
        let cache = EntityCache::load(&*store)?;
        Ok(resolve_path(collection, &doc, &cache))
    }

    // ========== SNAPSHOT TRANSFER ==========

    /// Bootstrap the store from a snapshot (no audit entries; this is the
    /// load path, not a mutation of an existing catalog).
    pub fn import_snapshot(&self, snapshot: &CatalogSnapshot, auth: &AuthDecision) -> Result<u64> {
        self.authorize(auth)?;
        let lock = self.locks.catalog_wide();
        let _guard = lock.lock();
        let mut store = self.store.write();
        snapshot.import_into(&mut *store)
    }

    pub fn export_snapshot(&self) -> Result<CatalogSnapshot> {
        let store = self.store.read();
        CatalogSnapshot::export_from(&*store)
    }
}
