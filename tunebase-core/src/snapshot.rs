// tunebase-core/src/snapshot.rs
//! JSON-backed persistence: the whole catalog as one document.
//!
//! The alternate persistence path keeps all five collections in a single
//! JSON file. After any structural edit on this path the ids are rebuilt
//! dense and sequential: [`CatalogSnapshot::renumber`] assigns new ids per
//! collection in hierarchy order and rewrites every foreign key through the
//! old→new maps built so far, in the same pass. The live-collection path
//! never renumbers (ids keep their gaps and are never reused).

use std::fs;
use std::path::Path;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::entity::{to_doc, Brand, Engine, EntityId, Group, Model, Stage, TypeGen};
use crate::entity::{from_doc, Collection};
use crate::error::Result;
use crate::store::{EntityStore, FindOptions};
use crate::log_warn;

/// The full dataset as one serializable document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub brands: Vec<Brand>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default)]
    pub types: Vec<TypeGen>,
    #[serde(default)]
    pub engines: Vec<Engine>,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// Counts from a renumbering pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenumberReport {
    /// Documents that received a new dense id.
    pub remapped: u64,
    /// Orphaned documents dropped because their parent no longer exists.
    pub pruned: u64,
}

impl CatalogSnapshot {
    // ========== FILE I/O ==========

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    // ========== RENUMBERING ==========

    /// Rebuild all ids dense and sequential (1..n per collection, ordered
    /// by current id) and rewrite every foreign key consistently.
    ///
    /// Denormalized ancestor ids are re-derived from the new parent chain
    /// rather than remapped, so a renumbered snapshot is always internally
    /// consistent. Orphaned documents (parent missing) cannot be rewritten
    /// and are pruned with a warning.
    pub fn renumber(&mut self) -> RenumberReport {
        let mut report = RenumberReport::default();

        self.brands.sort_by_key(|b| b.id);
        let mut brand_map: AHashMap<EntityId, EntityId> = AHashMap::new();
        for (index, brand) in self.brands.iter_mut().enumerate() {
            let new_id = index as EntityId + 1;
            brand_map.insert(brand.id, new_id);
            brand.id = new_id;
            report.remapped += 1;
        }

        self.groups.sort_by_key(|g| g.id);
        let mut group_map: AHashMap<EntityId, EntityId> = AHashMap::new();
        // brand of each surviving group, keyed by new group id
        let mut group_brand: AHashMap<EntityId, EntityId> = AHashMap::new();
        let mut next = 1;
        self.groups.retain_mut(|group| {
            let Some(&brand_id) = brand_map.get(&group.brand_id) else {
                log_warn!("renumber: pruning group {} (brand {} missing)", group.id, group.brand_id);
                report.pruned += 1;
                return false;
            };
            group_map.insert(group.id, next);
            group.id = next;
            group.brand_id = brand_id;
            group_brand.insert(next, brand_id);
            next += 1;
            report.remapped += 1;
            true
        });

        self.models.sort_by_key(|m| m.id);
        let mut model_map: AHashMap<EntityId, EntityId> = AHashMap::new();
        let mut model_brand: AHashMap<EntityId, EntityId> = AHashMap::new();
        next = 1;
        self.models.retain_mut(|model| {
            let Some(&group_id) = group_map.get(&model.group_id) else {
                log_warn!("renumber: pruning model {} (group {} missing)", model.id, model.group_id);
                report.pruned += 1;
                return false;
            };
            model_map.insert(model.id, next);
            model.id = next;
            model.group_id = group_id;
            // brandId re-derived from the new parent group
            model.brand_id = group_brand[&group_id];
            model_brand.insert(next, model.brand_id);
            next += 1;
            report.remapped += 1;
            true
        });

        self.types.sort_by_key(|t| t.id);
        let mut type_map: AHashMap<EntityId, EntityId> = AHashMap::new();
        let mut type_model: AHashMap<EntityId, EntityId> = AHashMap::new();
        next = 1;
        self.types.retain_mut(|ty| {
            let Some(&model_id) = model_map.get(&ty.model_id) else {
                log_warn!("renumber: pruning type {} (model {} missing)", ty.id, ty.model_id);
                report.pruned += 1;
                return false;
            };
            type_map.insert(ty.id, next);
            ty.id = next;
            ty.model_id = model_id;
            ty.brand_id = model_brand[&model_id];
            type_model.insert(next, model_id);
            next += 1;
            report.remapped += 1;
            true
        });

        self.engines.sort_by_key(|e| e.id);
        let mut engine_map: AHashMap<EntityId, EntityId> = AHashMap::new();
        next = 1;
        self.engines.retain_mut(|engine| {
            let Some(&type_id) = type_map.get(&engine.type_id) else {
                log_warn!("renumber: pruning engine {} (type {} missing)", engine.id, engine.type_id);
                report.pruned += 1;
                return false;
            };
            engine_map.insert(engine.id, next);
            engine.id = next;
            engine.type_id = type_id;
            engine.model_id = type_model[&type_id];
            next += 1;
            report.remapped += 1;
            true
        });

        self.stages.sort_by_key(|s| s.id);
        next = 1;
        self.stages.retain_mut(|stage| {
            let Some(&engine_id) = engine_map.get(&stage.engine_id) else {
                log_warn!("renumber: pruning stage {} (engine {} missing)", stage.id, stage.engine_id);
                report.pruned += 1;
                return false;
            };
            stage.id = next;
            stage.engine_id = engine_id;
            next += 1;
            report.remapped += 1;
            true
        });

        report
    }

    // ========== STORE TRANSFER ==========

    /// Insert every document into the store with its explicit id,
    /// hierarchy order, parents first. Returns the document count.
    pub fn import_into<S: EntityStore>(&self, store: &mut S) -> Result<u64> {
        let mut count = 0u64;
        for brand in &self.brands {
            store.insert(Collection::Brands, to_doc(brand)?)?;
            count += 1;
        }
        for group in &self.groups {
            store.insert(Collection::Groups, to_doc(group)?)?;
            count += 1;
        }
        for model in &self.models {
            store.insert(Collection::Models, to_doc(model)?)?;
            count += 1;
        }
        for ty in &self.types {
            store.insert(Collection::Types, to_doc(ty)?)?;
            count += 1;
        }
        for engine in &self.engines {
            store.insert(Collection::Engines, to_doc(engine)?)?;
            count += 1;
        }
        for stage in &self.stages {
            store.insert(Collection::Stages, to_doc(stage)?)?;
            count += 1;
        }
        Ok(count)
    }

    /// Read the five collections out of a store, ordered by id.
    pub fn export_from<S: EntityStore>(store: &S) -> Result<Self> {
        fn read_all<S: EntityStore, T: for<'de> Deserialize<'de>>(
            store: &S,
            collection: Collection,
        ) -> Result<Vec<T>> {
            store
                .find_by(collection, &serde_json::json!({}), &FindOptions::default())?
                .iter()
                .map(from_doc)
                .collect()
        }

        Ok(CatalogSnapshot {
            brands: read_all(store, Collection::Brands)?,
            groups: read_all(store, Collection::Groups)?,
            models: read_all(store, Collection::Models)?,
            types: read_all(store, Collection::Types)?,
            engines: read_all(store, Collection::Engines)?,
            stages: read_all(store, Collection::Stages)?,
        })
    }
}
