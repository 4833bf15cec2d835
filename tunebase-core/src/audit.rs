// tunebase-core/src/audit.rs
//! Audit & versioning engine.
//!
//! Every create/update/delete/move against the entity store is recorded as
//! an append-only [`AuditLogEntry`] carrying the before/after snapshots, a
//! per-(collection, document) monotonically increasing version counter and,
//! for updates, a field-level diff. Rollback re-applies a recorded `before`
//! snapshot as a brand-new audited update; history is never rewritten.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::entity::{from_doc, to_doc, Collection, EntityId};
use crate::error::{CatalogError, Result};
use crate::store::{EntityStore, FindOptions, SortDir};
use crate::{log_debug, log_error};

// ========== TYPES ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Move,
}

/// One changed field: serialized value before and after the mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub from: Value,
    pub to: Value,
}

/// Persisted audit record. Field names are the on-disk contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// Globally unique entry identifier, stable across snapshot round-trips.
    pub entry_id: String,
    pub collection: Collection,
    pub document_id: EntityId,
    pub action: AuditAction,
    pub before: Option<Value>,
    pub after: Option<Value>,
    /// Populated for `update` actions only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<BTreeMap<String, FieldChange>>,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
    /// Per-(collection, documentId) counter starting at 1. Never reused.
    pub version: u64,
    #[serde(default)]
    pub metadata: Value,
}

/// Filters for the dashboard-facing recent-logs query.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub collection: Option<Collection>,
    pub action: Option<AuditAction>,
    pub changed_by: Option<String>,
}

// ========== DIFF ==========

/// Generic field-level differ: walks the top-level fields of `after` and
/// records every field whose structural value differs from `before`.
/// Entity schemas evolve; nothing here is per-entity.
pub fn diff_fields(before: &Value, after: &Value) -> BTreeMap<String, FieldChange> {
    let mut changes = BTreeMap::new();
    let Some(after_obj) = after.as_object() else {
        return changes;
    };
    for (field, new_value) in after_obj {
        if field == "id" {
            continue;
        }
        let old_value = before.get(field).unwrap_or(&Value::Null);
        if old_value != new_value {
            changes.insert(
                field.clone(),
                FieldChange {
                    from: old_value.clone(),
                    to: new_value.clone(),
                },
            );
        }
    }
    changes
}

// ========== RECORDING ==========

fn next_version<S: EntityStore>(
    store: &S,
    collection: Collection,
    document_id: EntityId,
) -> Result<u64> {
    let filter = json!({
        "collection": collection.name(),
        "documentId": document_id,
    });
    let opts = FindOptions::sorted_by("version", SortDir::Desc).with_limit(1);
    let latest = store.find_by(Collection::AuditLogs, &filter, &opts)?;
    let max = latest
        .first()
        .and_then(|doc| doc.get("version"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Ok(max + 1)
}

/// Append one audit entry for a mutation that already happened.
///
/// `before = None` for creates and `after = None` for deletes are both
/// tolerated; the diff is computed for updates only.
pub fn record_change<S: EntityStore>(
    store: &mut S,
    collection: Collection,
    document_id: EntityId,
    action: AuditAction,
    before: Option<Value>,
    after: Option<Value>,
    changed_by: &str,
    metadata: Value,
) -> Result<AuditLogEntry> {
    let changes = match (action, &before, &after) {
        (AuditAction::Update, Some(b), Some(a)) => Some(diff_fields(b, a)),
        _ => None,
    };

    let entry = AuditLogEntry {
        entry_id: Uuid::new_v4().to_string(),
        collection,
        document_id,
        action,
        before,
        after,
        changes,
        changed_by: changed_by.to_string(),
        changed_at: Utc::now(),
        version: next_version(store, collection, document_id)?,
        metadata,
    };

    store.insert(Collection::AuditLogs, to_doc(&entry)?)?;
    log_debug!(
        "audit: {:?} {} {} v{} by {}",
        entry.action,
        collection,
        document_id,
        entry.version,
        entry.changed_by
    );
    Ok(entry)
}

// ========== QUERIES ==========

/// Full change history of one document, most recent first
/// (`changedAt` descending, ties broken by `version` descending).
pub fn history<S: EntityStore>(
    store: &S,
    collection: Collection,
    document_id: EntityId,
    limit: usize,
) -> Result<Vec<AuditLogEntry>> {
    let filter = json!({
        "collection": collection.name(),
        "documentId": document_id,
    });
    let opts = FindOptions {
        sort: vec![
            ("changedAt".to_string(), SortDir::Desc),
            ("version".to_string(), SortDir::Desc),
        ],
        limit: Some(limit),
    };
    let docs = store.find_by(Collection::AuditLogs, &filter, &opts)?;
    docs.iter().map(from_doc).collect()
}

/// Dashboard feed: newest entries across the catalog, optionally filtered.
pub fn recent_logs<S: EntityStore>(
    store: &S,
    filter: &AuditFilter,
    limit: usize,
) -> Result<Vec<AuditLogEntry>> {
    let mut query = serde_json::Map::new();
    if let Some(collection) = filter.collection {
        query.insert("collection".to_string(), json!(collection.name()));
    }
    if let Some(action) = filter.action {
        query.insert("action".to_string(), serde_json::to_value(action)?);
    }
    if let Some(actor) = &filter.changed_by {
        query.insert("changedBy".to_string(), json!(actor));
    }
    let opts = FindOptions {
        sort: vec![
            ("changedAt".to_string(), SortDir::Desc),
            ("version".to_string(), SortDir::Desc),
        ],
        limit: Some(limit),
    };
    let docs = store.find_by(Collection::AuditLogs, &Value::Object(query), &opts)?;
    docs.iter().map(from_doc).collect()
}

// ========== ROLLBACK ==========

/// Roll a live document back to the `before` snapshot stored at `version`.
///
/// The restore is itself an audited update (`metadata.rollback = true`,
/// `metadata.targetVersion`) and bumps the version counter forward —
/// history is append-only, never rewritten.
pub fn rollback<S: EntityStore>(
    store: &mut S,
    collection: Collection,
    document_id: EntityId,
    version: u64,
    changed_by: &str,
) -> Result<AuditLogEntry> {
    let filter = json!({
        "collection": collection.name(),
        "documentId": document_id,
        "version": version,
    });
    let found = store.find_by(Collection::AuditLogs, &filter, &FindOptions::default())?;
    let entry: AuditLogEntry = match found.first() {
        Some(doc) => from_doc(doc)?,
        None => {
            log_error!(
                "rollback: no audit entry for {} {} v{} (actor {})",
                collection,
                document_id,
                version,
                changed_by
            );
            return Err(CatalogError::VersionNotFound {
                collection,
                document_id,
                version,
            });
        }
    };

    // Cannot roll back to a state that never existed (before creation).
    let Some(snapshot) = entry.before else {
        log_error!(
            "rollback: version {} of {} {} has no prior snapshot (actor {})",
            version,
            collection,
            document_id,
            changed_by
        );
        return Err(CatalogError::VersionNotFound {
            collection,
            document_id,
            version,
        });
    };

    let Some(live) = store.find_by_id(collection, document_id)? else {
        log_error!(
            "rollback: {} {} no longer exists (actor {})",
            collection,
            document_id,
            changed_by
        );
        return Err(CatalogError::NotFound {
            collection,
            id: document_id,
        });
    };

    store.update_by_id(collection, document_id, &snapshot)?;
    let restored = store
        .find_by_id(collection, document_id)?
        .unwrap_or(snapshot);

    record_change(
        store,
        collection,
        document_id,
        AuditAction::Update,
        Some(live),
        Some(restored),
        changed_by,
        json!({"rollback": true, "targetVersion": version}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record_update(
        store: &mut MemoryStore,
        id: EntityId,
        before: Value,
        after: Value,
    ) -> AuditLogEntry {
        record_change(
            store,
            Collection::Stages,
            id,
            AuditAction::Update,
            Some(before),
            Some(after),
            "tester",
            json!({}),
        )
        .unwrap()
    }

    #[test]
    fn test_diff_reports_only_changed_fields() {
        let before = json!({"id": 1, "price": 500.0, "stageName": "Stage 1", "tunedHp": 480});
        let after = json!({"id": 1, "price": 600.0, "stageName": "Stage 1", "tunedHp": 490});
        let changes = diff_fields(&before, &after);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes["price"].from, json!(500.0));
        assert_eq!(changes["price"].to, json!(600.0));
        assert_eq!(changes["tunedHp"].to, json!(490));
        assert!(!changes.contains_key("stageName"));
        assert!(!changes.contains_key("id"));
    }

    #[test]
    fn test_diff_treats_new_field_as_from_null() {
        let changes = diff_fields(&json!({"id": 1}), &json!({"id": 1, "color": "red"}));
        assert_eq!(changes["color"].from, Value::Null);
        assert_eq!(changes["color"].to, json!("red"));
    }

    #[test]
    fn test_versions_increase_per_document() {
        let mut store = MemoryStore::new();
        let e1 = record_update(&mut store, 7, json!({"a": 1}), json!({"a": 2}));
        let e2 = record_update(&mut store, 7, json!({"a": 2}), json!({"a": 3}));
        // independent counter for a different document
        let other = record_update(&mut store, 8, json!({"a": 1}), json!({"a": 2}));
        assert_eq!(e1.version, 1);
        assert_eq!(e2.version, 2);
        assert_eq!(other.version, 1);
    }

    #[test]
    fn test_create_and_delete_tolerate_missing_snapshots() {
        let mut store = MemoryStore::new();
        let created = record_change(
            &mut store,
            Collection::Brands,
            1,
            AuditAction::Create,
            None,
            Some(json!({"id": 1, "name": "Audi"})),
            "tester",
            json!({}),
        )
        .unwrap();
        assert!(created.before.is_none());
        assert!(created.changes.is_none());

        let deleted = record_change(
            &mut store,
            Collection::Brands,
            1,
            AuditAction::Delete,
            Some(json!({"id": 1, "name": "Audi"})),
            None,
            "tester",
            json!({}),
        )
        .unwrap();
        assert!(deleted.after.is_none());
        assert_eq!(deleted.version, 2);
    }

    #[test]
    fn test_history_is_most_recent_first() {
        let mut store = MemoryStore::new();
        for round in 1..=3 {
            record_update(
                &mut store,
                5,
                json!({"price": round - 1}),
                json!({"price": round}),
            );
        }
        let entries = history(&store, Collection::Stages, 5, 10).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].version, 3);
        assert_eq!(entries[2].version, 1);

        let limited = history(&store, Collection::Stages, 5, 2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].version, 3);
    }

    #[test]
    fn test_recent_logs_filters() {
        let mut store = MemoryStore::new();
        record_change(
            &mut store,
            Collection::Brands,
            1,
            AuditAction::Create,
            None,
            Some(json!({"id": 1})),
            "alice",
            json!({}),
        )
        .unwrap();
        record_update(&mut store, 2, json!({"a": 1}), json!({"a": 2}));

        let by_actor = recent_logs(
            &store,
            &AuditFilter {
                changed_by: Some("alice".to_string()),
                ..Default::default()
            },
            10,
        )
        .unwrap();
        assert_eq!(by_actor.len(), 1);
        assert_eq!(by_actor[0].collection, Collection::Brands);

        let by_action = recent_logs(
            &store,
            &AuditFilter {
                action: Some(AuditAction::Update),
                ..Default::default()
            },
            10,
        )
        .unwrap();
        assert_eq!(by_action.len(), 1);
        assert_eq!(by_action[0].document_id, 2);
    }

    #[test]
    fn test_rollback_restores_before_snapshot_and_appends() {
        let mut store = MemoryStore::new();
        store
            .insert(Collection::Stages, json!({"id": 5, "price": 700.0, "stageName": "Stage 1"}))
            .unwrap();
        // v1: price 500 -> 600, v2: 600 -> 700
        record_update(
            &mut store,
            5,
            json!({"id": 5, "price": 500.0, "stageName": "Stage 1"}),
            json!({"id": 5, "price": 600.0, "stageName": "Stage 1"}),
        );
        record_update(
            &mut store,
            5,
            json!({"id": 5, "price": 600.0, "stageName": "Stage 1"}),
            json!({"id": 5, "price": 700.0, "stageName": "Stage 1"}),
        );

        let entry = rollback(&mut store, Collection::Stages, 5, 2, "tester").unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.metadata["rollback"], json!(true));
        assert_eq!(entry.metadata["targetVersion"], json!(2));

        // live document equals the before snapshot stored at v2
        let live = store.find_by_id(Collection::Stages, 5).unwrap().unwrap();
        assert_eq!(live["price"], json!(600.0));
    }

    #[test]
    fn test_rollback_unknown_version_fails_without_mutation() {
        let mut store = MemoryStore::new();
        store.insert(Collection::Stages, json!({"id": 5, "price": 700.0})).unwrap();
        let err = rollback(&mut store, Collection::Stages, 5, 9, "tester").unwrap_err();
        assert!(matches!(err, CatalogError::VersionNotFound { version: 9, .. }));
        let live = store.find_by_id(Collection::Stages, 5).unwrap().unwrap();
        assert_eq!(live["price"], json!(700.0));
    }

    #[test]
    fn test_rollback_to_before_creation_fails() {
        let mut store = MemoryStore::new();
        store.insert(Collection::Brands, json!({"id": 1, "name": "Audi"})).unwrap();
        record_change(
            &mut store,
            Collection::Brands,
            1,
            AuditAction::Create,
            None,
            Some(json!({"id": 1, "name": "Audi"})),
            "tester",
            json!({}),
        )
        .unwrap();
        let err = rollback(&mut store, Collection::Brands, 1, 1, "tester").unwrap_err();
        assert!(matches!(err, CatalogError::VersionNotFound { version: 1, .. }));
    }
}
