// tunebase-core/src/entity.rs
// Typed catalog entities - the on-disk contract of the five collections

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CatalogError, Result};

/// Small integer identifier, unique within its own collection.
/// Ids are never reused after deletion on the live-collection path.
pub type EntityId = i64;

/// The five catalog collections plus the append-only audit log.
///
/// The array order of [`Collection::HIERARCHY`] is the parent-before-child
/// order the cascade engine walks when collecting descendant closures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Brands,
    Groups,
    Models,
    Types,
    Engines,
    Stages,
    AuditLogs,
}

impl Collection {
    /// Top-down hierarchy order (root first).
    pub const HIERARCHY: [Collection; 6] = [
        Collection::Brands,
        Collection::Groups,
        Collection::Models,
        Collection::Types,
        Collection::Engines,
        Collection::Stages,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Brands => "brands",
            Collection::Groups => "groups",
            Collection::Models => "models",
            Collection::Types => "types",
            Collection::Engines => "engines",
            Collection::Stages => "stages",
            Collection::AuditLogs => "audit_logs",
        }
    }

    /// Parse a collection name (singular forms accepted for CLI convenience).
    pub fn parse(s: &str) -> Option<Collection> {
        match s.to_lowercase().as_str() {
            "brands" | "brand" => Some(Collection::Brands),
            "groups" | "group" => Some(Collection::Groups),
            "models" | "model" => Some(Collection::Models),
            "types" | "type" | "generation" => Some(Collection::Types),
            "engines" | "engine" => Some(Collection::Engines),
            "stages" | "stage" => Some(Collection::Stages),
            "audit_logs" => Some(Collection::AuditLogs),
            _ => None,
        }
    }

    /// The foreign-key field pointing at this collection's parent, if any.
    ///
    /// Denormalized ancestor ids (`brandId` on types, `modelId` on engines)
    /// are deliberately not listed here; they are derived fields, recomputed
    /// by the mutation paths, never walked as the primary parent link.
    pub fn parent_link(&self) -> Option<(&'static str, Collection)> {
        match self {
            Collection::Brands => None,
            Collection::Groups => Some(("brandId", Collection::Brands)),
            Collection::Models => Some(("groupId", Collection::Groups)),
            Collection::Types => Some(("modelId", Collection::Models)),
            Collection::Engines => Some(("typeId", Collection::Types)),
            Collection::Stages => Some(("engineId", Collection::Engines)),
            Collection::AuditLogs => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ========== ENTITY STRUCTS ==========
// Field names are the persisted contract; serde camelCase keeps the JSON
// identical to the existing data ("brandId", "stageName", ...).

/// Root of the hierarchy. `isTest` partitions production vs. test catalogs
/// for display only; mutation semantics ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Brand {
    pub id: EntityId,
    pub name: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default)]
    pub is_test: bool,
}

/// Performance sub-brand ("M", "RS", "AMG") or the implicit "Standard" bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: EntityId,
    pub brand_id: EntityId,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub is_performance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default)]
    pub order: i64,
}

/// Child of Group. `brandId` is carried redundantly for query convenience
/// and must always equal the parent Group's `brandId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: EntityId,
    pub brand_id: EntityId,
    pub group_id: EntityId,
    pub name: String,
    pub slug: String,
}

/// Generation of a model (collection name "types").
/// `brandId` is denormalized from the parent Model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeGen {
    pub id: EntityId,
    pub model_id: EntityId,
    pub brand_id: EntityId,
    pub name: String,
    pub slug: String,
}

/// Child of Type. `modelId` is denormalized from the parent Type;
/// `type` is the fuel type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Engine {
    pub id: EntityId,
    pub type_id: EntityId,
    pub model_id: EntityId,
    pub name: String,
    #[serde(rename = "type")]
    pub fuel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<i64>,
    pub slug: String,
}

/// Tuning stage of an engine. The gain fields are derived:
/// `gainHp = tunedHp - stockHp`, `gainNm = tunedNm - stockNm` must hold
/// after every mutation touching the stock/tuned values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: EntityId,
    pub engine_id: EntityId,
    pub stage_name: String,
    pub stock_hp: i64,
    pub tuned_hp: i64,
    pub stock_nm: i64,
    pub tuned_nm: i64,
    pub gain_hp: i64,
    pub gain_nm: i64,
    pub price: f64,
    #[serde(default)]
    pub ecu_unlock: bool,
    #[serde(default)]
    pub cpc_upgrade: bool,
}

impl Stage {
    /// Re-derive both gain fields from the current stock/tuned values.
    pub fn recompute_gains(&mut self) {
        self.gain_hp = self.tuned_hp - self.stock_hp;
        self.gain_nm = self.tuned_nm - self.stock_nm;
    }

    pub fn gains_consistent(&self) -> bool {
        self.gain_hp == self.tuned_hp - self.stock_hp && self.gain_nm == self.tuned_nm - self.stock_nm
    }
}

// ========== HELPERS ==========

/// Derive a URL slug from a display name: lowercase, alphanumeric runs
/// joined by single dashes ("2.5 TFSI" -> "2-5-tfsi").
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Display name of a raw document: `stageName` for stages, `name` elsewhere.
pub fn display_name(collection: Collection, doc: &Value) -> Option<&str> {
    let field = match collection {
        Collection::Stages => "stageName",
        _ => "name",
    };
    doc.get(field).and_then(|v| v.as_str())
}

/// Read an id-valued field from a raw document.
pub fn id_field(doc: &Value, field: &str) -> Option<EntityId> {
    doc.get(field).and_then(|v| v.as_i64())
}

/// Serialize a typed entity into its document form.
pub fn to_doc<T: Serialize>(entity: &T) -> Result<Value> {
    serde_json::to_value(entity).map_err(|e| CatalogError::Serialization(e.to_string()))
}

/// Deserialize a raw document into a typed entity.
pub fn from_doc<T: for<'de> Deserialize<'de>>(doc: &Value) -> Result<T> {
    serde_json::from_value(doc.clone()).map_err(|e| CatalogError::Serialization(e.to_string()))
}
