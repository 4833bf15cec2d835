// tunebase-core/src/bulk.rs
//! Bulk mutation engine.
//!
//! A bulk update is resolved in two steps: a selector (`level` + target id
//! + optional group filter) becomes a concrete ordered set of Engine ids,
//! then one update policy is applied to the Stages of those engines for a
//! chosen numeric field. The dependent gain field is re-derived from the
//! stage's own stock value on every power/torque write, and all patches go
//! to the store as one batch.

use std::collections::HashMap;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audit::{record_change, AuditAction};
use crate::entity::{from_doc, id_field, Collection, EntityId, Stage};
use crate::error::{CatalogError, Result};
use crate::store::{EntityStore, FindOptions};
use crate::{log_debug, log_info};

// ========== SELECTORS ==========

/// Granularity at which a bulk update is scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    All,
    Brand,
    Model,
    Generation,
    Engine,
}

impl ScopeLevel {
    pub fn parse(s: &str) -> Option<ScopeLevel> {
        match s.to_lowercase().as_str() {
            "all" => Some(ScopeLevel::All),
            "brand" => Some(ScopeLevel::Brand),
            "model" => Some(ScopeLevel::Model),
            "generation" | "type" => Some(ScopeLevel::Generation),
            "engine" => Some(ScopeLevel::Engine),
            _ => None,
        }
    }
}

/// `level + target id [+ group filter]` selector for a bulk update.
/// `group_id` is an AND filter on top of a brand target, never a target
/// of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkSelector {
    pub level: ScopeLevel,
    pub target_id: Option<EntityId>,
    pub group_id: Option<EntityId>,
}

/// Resolve a selector into the ordered set of Engine ids in scope.
///
/// Zero resolved engines is a distinguishable [`CatalogError::EmptyScope`],
/// never a silent empty success.
pub fn resolve_scope<S: EntityStore>(store: &S, selector: &BulkSelector) -> Result<Vec<EntityId>> {
    let target = |level: &str| -> Result<EntityId> {
        selector.target_id.ok_or_else(|| {
            CatalogError::InvalidSelector(format!("level '{}' requires a target id", level))
        })
    };
    if selector.group_id.is_some() && selector.level != ScopeLevel::Brand {
        return Err(CatalogError::InvalidSelector(
            "a group filter only applies to brand-level updates".to_string(),
        ));
    }

    let engines: Vec<Value> = match selector.level {
        ScopeLevel::All => store.find_by(Collection::Engines, &json!({}), &FindOptions::default())?,
        ScopeLevel::Engine => {
            let id = target("engine")?;
            match store.find_by_id(Collection::Engines, id)? {
                Some(doc) => vec![doc],
                None => return Err(CatalogError::NotFound { collection: Collection::Engines, id }),
            }
        }
        ScopeLevel::Generation => {
            let id = target("generation")?;
            if store.find_by_id(Collection::Types, id)?.is_none() {
                return Err(CatalogError::NotFound { collection: Collection::Types, id });
            }
            store.find_by(Collection::Engines, &json!({"typeId": id}), &FindOptions::default())?
        }
        ScopeLevel::Model => {
            let id = target("model")?;
            if store.find_by_id(Collection::Models, id)?.is_none() {
                return Err(CatalogError::NotFound { collection: Collection::Models, id });
            }
            let types =
                store.find_by(Collection::Types, &json!({"modelId": id}), &FindOptions::default())?;
            engines_under_types(store, &types)?
        }
        ScopeLevel::Brand => {
            let id = target("brand")?;
            if store.find_by_id(Collection::Brands, id)?.is_none() {
                return Err(CatalogError::NotFound { collection: Collection::Brands, id });
            }
            let mut model_filter = json!({"brandId": id});
            if let Some(group_id) = selector.group_id {
                model_filter["groupId"] = json!(group_id);
            }
            let models =
                store.find_by(Collection::Models, &model_filter, &FindOptions::default())?;
            let model_ids: Vec<EntityId> =
                models.iter().filter_map(|d| id_field(d, "id")).collect();
            let types = if model_ids.is_empty() {
                Vec::new()
            } else {
                store.find_by(
                    Collection::Types,
                    &json!({"modelId": {"$in": model_ids}}),
                    &FindOptions::default(),
                )?
            };
            engines_under_types(store, &types)?
        }
    };

    let mut ids: Vec<EntityId> = engines.iter().filter_map(|d| id_field(d, "id")).collect();
    ids.sort_unstable();
    ids.dedup();

    if ids.is_empty() {
        return Err(CatalogError::EmptyScope(format!(
            "level {:?}, target {:?}, group {:?}",
            selector.level, selector.target_id, selector.group_id
        )));
    }
    log_debug!("resolved bulk scope to {} engines", ids.len());
    Ok(ids)
}

fn engines_under_types<S: EntityStore>(store: &S, types: &[Value]) -> Result<Vec<Value>> {
    let type_ids: Vec<EntityId> = types.iter().filter_map(|d| id_field(d, "id")).collect();
    if type_ids.is_empty() {
        return Ok(Vec::new());
    }
    store.find_by(
        Collection::Engines,
        &json!({"typeId": {"$in": type_ids}}),
        &FindOptions::default(),
    )
}

// ========== POLICIES ==========

/// Numeric Stage field targeted by a bulk update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Price,
    Power,
    Torque,
}

impl DataType {
    pub fn parse(s: &str) -> Option<DataType> {
        match s.to_lowercase().as_str() {
            "price" => Some(DataType::Price),
            "power" => Some(DataType::Power),
            "torque" => Some(DataType::Torque),
            _ => None,
        }
    }

    fn field(&self) -> &'static str {
        match self {
            DataType::Price => "price",
            DataType::Power => "tunedHp",
            DataType::Torque => "tunedNm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PercentOp {
    Increase,
    Decrease,
    Set,
}

/// How the new value of each selected Stage is computed.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePolicy {
    /// Per-stage values keyed by normalized stage name; stages without a
    /// matching key stay untouched (still counted as in scope).
    Absolute { values: HashMap<String, f64> },
    /// Percentage adjustment relative to the current value (`increase` /
    /// `decrease`, 0-100), or `set` with the raw target value.
    Percentage { operation: PercentOp, percentage: f64 },
    /// One literal value for every selected stage.
    Fixed { value: f64 },
    /// Derived tier rule: "Stage 1+" gets Stage 1's current value +pct%,
    /// "Stage 2+" gets Stage 2's, siblings always scoped to one engine.
    StagePlus { percentage: f64 },
}

impl UpdatePolicy {
    fn kind(&self) -> &'static str {
        match self {
            UpdatePolicy::Absolute { .. } => "absolute",
            UpdatePolicy::Percentage { .. } => "percentage",
            UpdatePolicy::Fixed { .. } => "fixed",
            UpdatePolicy::StagePlus { .. } => "stagePlus",
        }
    }
}

/// Normalize a stage name for policy matching: lowercase, whitespace
/// stripped, `+` spelled out ("Stage 1+" -> "stage1plus").
pub fn normalize_stage_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_whitespace() {
            continue;
        }
        if ch == '+' {
            normalized.push_str("plus");
        } else {
            normalized.extend(ch.to_lowercase());
        }
    }
    normalized
}

fn rounded(value: f64) -> f64 {
    value.round().max(0.0)
}

/// Outcome counts: stages actually modified vs. stages that were in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateResult {
    pub updated_count: u64,
    pub total_stages: u64,
    pub engine_count: u64,
}

// ========== APPLY ==========

/// Apply one policy to every Stage under the given engines.
///
/// Power/torque writes re-derive the gain field per stage from its own
/// stock value; all patches are issued as a single batch, then each
/// modified stage gets its own `update` audit entry.
pub fn apply_bulk<S: EntityStore>(
    store: &mut S,
    engine_ids: &[EntityId],
    data_type: DataType,
    policy: &UpdatePolicy,
    changed_by: &str,
) -> Result<BulkUpdateResult> {
    if let UpdatePolicy::Percentage { operation, percentage } = policy {
        if matches!(operation, PercentOp::Increase | PercentOp::Decrease)
            && !(0.0..=100.0).contains(percentage)
        {
            return Err(CatalogError::InvalidSelector(format!(
                "percentage must be within 0-100, got {}",
                percentage
            )));
        }
    }

    let stages = store.find_by(
        Collection::Stages,
        &json!({"engineId": {"$in": engine_ids}}),
        &FindOptions::default(),
    )?;

    // Live sibling values per engine, for the Stage+ rule.
    let mut by_engine: AHashMap<EntityId, Vec<(String, f64)>> = AHashMap::new();
    if matches!(policy, UpdatePolicy::StagePlus { .. }) {
        for doc in &stages {
            let stage: Stage = from_doc(doc)?;
            by_engine
                .entry(stage.engine_id)
                .or_default()
                .push((normalize_stage_name(&stage.stage_name), current_of(&stage, data_type)));
        }
    }

    let mut patches: Vec<(EntityId, Value)> = Vec::new();
    let mut audits: Vec<(EntityId, Value, Value)> = Vec::new();

    for doc in &stages {
        let mut stage: Stage = from_doc(doc)?;
        let current = current_of(&stage, data_type);
        let normalized = normalize_stage_name(&stage.stage_name);

        let new_value = match policy {
            UpdatePolicy::Absolute { values } => match values.get(&normalized) {
                Some(v) => *v,
                None => continue, // in scope, not matched
            },
            UpdatePolicy::Percentage { operation, percentage } => match operation {
                PercentOp::Increase => rounded(current * (1.0 + percentage / 100.0)),
                PercentOp::Decrease => rounded(current * (1.0 - percentage / 100.0)),
                PercentOp::Set => *percentage,
            },
            UpdatePolicy::Fixed { value } => *value,
            UpdatePolicy::StagePlus { percentage } => {
                let Some(base) = normalized.strip_suffix("plus") else {
                    continue; // only the derived "+" tiers are touched
                };
                let Some(siblings) = by_engine.get(&stage.engine_id) else {
                    continue;
                };
                match siblings.iter().find(|(name, _)| name == base) {
                    Some((_, base_value)) => rounded(base_value * (1.0 + percentage / 100.0)),
                    None => continue, // no base tier on this engine
                }
            }
        };

        apply_value(&mut stage, data_type, new_value);
        if current_of(&stage, data_type) == current {
            continue; // nothing actually changed
        }

        // after-snapshot is the stored state: the patch merged over the doc
        let patch = patch_for(&stage, data_type);
        let mut after = doc.clone();
        if let (Some(obj), Some(fields)) = (after.as_object_mut(), patch.as_object()) {
            for (field, value) in fields {
                obj.insert(field.clone(), value.clone());
            }
        }
        patches.push((stage.id, patch));
        audits.push((stage.id, doc.clone(), after));
    }

    // Single batch write, then the per-stage audit entries.
    store.update_batch(Collection::Stages, &patches)?;
    let metadata = json!({"bulk": {"dataType": data_type.field(), "updateType": policy.kind()}});
    for (stage_id, before, after) in &audits {
        record_change(
            store,
            Collection::Stages,
            *stage_id,
            AuditAction::Update,
            Some(before.clone()),
            Some(after.clone()),
            changed_by,
            metadata.clone(),
        )?;
    }

    let result = BulkUpdateResult {
        updated_count: patches.len() as u64,
        total_stages: stages.len() as u64,
        engine_count: engine_ids.len() as u64,
    };
    log_info!(
        "bulk {} update: {}/{} stages across {} engines",
        policy.kind(),
        result.updated_count,
        result.total_stages,
        result.engine_count
    );
    Ok(result)
}

fn current_of(stage: &Stage, data_type: DataType) -> f64 {
    match data_type {
        DataType::Price => stage.price,
        DataType::Power => stage.tuned_hp as f64,
        DataType::Torque => stage.tuned_nm as f64,
    }
}

fn apply_value(stage: &mut Stage, data_type: DataType, value: f64) {
    match data_type {
        DataType::Price => stage.price = value.max(0.0),
        DataType::Power => {
            stage.tuned_hp = value.round().max(0.0) as i64;
            stage.recompute_gains();
        }
        DataType::Torque => {
            stage.tuned_nm = value.round().max(0.0) as i64;
            stage.recompute_gains();
        }
    }
}

fn patch_for(stage: &Stage, data_type: DataType) -> Value {
    match data_type {
        DataType::Price => json!({"price": stage.price}),
        DataType::Power => json!({"tunedHp": stage.tuned_hp, "gainHp": stage.gain_hp}),
        DataType::Torque => json!({"tunedNm": stage.tuned_nm, "gainNm": stage.gain_nm}),
    }
}
