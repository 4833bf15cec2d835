// Integration tests for cascade delete and move through the catalog facade
use serde_json::json;
use tunebase_core::{
    AuthDecision, CatalogCore, CatalogError, Collection, EntityStore, FindOptions, MemoryStore,
};

fn admin() -> AuthDecision {
    AuthDecision::allow("admin")
}

/// Two full brand trees: Audi (two groups, two models) and BMW (one chain).
fn build_catalog() -> CatalogCore<MemoryStore> {
    let catalog = CatalogCore::new(MemoryStore::new());
    let auth = admin();

    for (collection, doc) in [
        (Collection::Brands, json!({"id": 1, "name": "Audi"})),
        (Collection::Brands, json!({"id": 2, "name": "BMW"})),
        (Collection::Groups, json!({"id": 10, "brandId": 1, "name": "RS", "isPerformance": true})),
        (Collection::Groups, json!({"id": 11, "brandId": 1, "name": "Standard"})),
        (Collection::Groups, json!({"id": 20, "brandId": 2, "name": "M", "isPerformance": true})),
        (Collection::Models, json!({"id": 100, "brandId": 1, "groupId": 10, "name": "RS3"})),
        (Collection::Models, json!({"id": 101, "brandId": 1, "groupId": 11, "name": "A3"})),
        (Collection::Models, json!({"id": 200, "brandId": 2, "groupId": 20, "name": "M3"})),
        (Collection::Types, json!({"id": 1000, "modelId": 100, "name": "8V"})),
        (Collection::Types, json!({"id": 1001, "modelId": 101, "name": "8Y"})),
        (Collection::Types, json!({"id": 2000, "modelId": 200, "name": "G80"})),
        (Collection::Engines, json!({"id": 10000, "typeId": 1000, "name": "2.5 TFSI", "type": "petrol"})),
        (Collection::Engines, json!({"id": 10001, "typeId": 1001, "name": "35 TFSI", "type": "petrol"})),
        (Collection::Engines, json!({"id": 20000, "typeId": 2000, "name": "S58", "type": "petrol"})),
        (Collection::Stages, json!({"id": 1, "engineId": 10000, "stageName": "Stage 1", "stockHp": 400, "tunedHp": 480, "stockNm": 480, "tunedNm": 600, "price": 500.0})),
        (Collection::Stages, json!({"id": 2, "engineId": 10000, "stageName": "Stage 2", "stockHp": 400, "tunedHp": 520, "stockNm": 480, "tunedNm": 650, "price": 900.0})),
        (Collection::Stages, json!({"id": 3, "engineId": 10001, "stageName": "Stage 1", "stockHp": 150, "tunedHp": 190, "stockNm": 250, "tunedNm": 320, "price": 400.0})),
        (Collection::Stages, json!({"id": 4, "engineId": 20000, "stageName": "Stage 1", "stockHp": 510, "tunedHp": 600, "stockNm": 650, "tunedNm": 750, "price": 1200.0})),
    ] {
        catalog.create(collection, doc, &auth).unwrap();
    }
    catalog
}

#[test]
fn test_brand_cascade_removes_everything_reachable() {
    let catalog = build_catalog();
    let report = catalog.delete_cascade(Collection::Brands, 1, &admin()).unwrap();

    assert_eq!(report.brands, 1);
    assert_eq!(report.groups, 2);
    assert_eq!(report.models, 2);
    assert_eq!(report.types, 2);
    assert_eq!(report.engines, 2);
    assert_eq!(report.stages, 3);
    assert_eq!(report.total(), 12);

    // no document referencing a deleted ancestor id remains
    let store = catalog.store();
    let store = store.read();
    for collection in Collection::HIERARCHY {
        let survivors = store
            .find_by(collection, &json!({}), &FindOptions::default())
            .unwrap();
        for doc in survivors {
            assert_ne!(doc.get("brandId"), Some(&json!(1)));
            assert_ne!(doc.get("groupId"), Some(&json!(10)));
            assert_ne!(doc.get("engineId"), Some(&json!(10000)));
        }
    }

    // BMW's tree is intact
    assert!(store.find_by_id(Collection::Stages, 4).unwrap().is_some());
}

#[test]
fn test_group_cascade_spares_sibling_group() {
    let catalog = build_catalog();
    let report = catalog.delete_cascade(Collection::Groups, 10, &admin()).unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.models, 1);
    assert_eq!(report.stages, 2);

    let store = catalog.store();
    let store = store.read();
    assert!(store.find_by_id(Collection::Groups, 11).unwrap().is_some());
    assert!(store.find_by_id(Collection::Models, 101).unwrap().is_some());
    assert!(store.find_by_id(Collection::Stages, 3).unwrap().is_some());
}

#[test]
fn test_cascade_on_missing_target_has_no_effect() {
    let catalog = build_catalog();
    let err = catalog.delete_cascade(Collection::Types, 9999, &admin()).unwrap_err();
    assert!(matches!(err, CatalogError::NotFound { id: 9999, .. }));

    let store = catalog.store();
    let store = store.read();
    assert_eq!(store.count_documents(Collection::Stages, &json!({})).unwrap(), 4);
}

#[test]
fn test_move_keeps_denormalized_ancestors_consistent() {
    let catalog = build_catalog();
    // move the 8V generation from RS3 to M3 (cross-brand type move)
    let moved = catalog
        .move_item(Collection::Types, 1000, Collection::Models, 200, &admin())
        .unwrap();
    assert_eq!(moved["modelId"], json!(200));
    assert_eq!(moved["brandId"], json!(2));

    // the engine under the moved type follows the new parent chain
    let store = catalog.store();
    let store = store.read();
    let engine = store.find_by_id(Collection::Engines, 10000).unwrap().unwrap();
    assert_eq!(engine["modelId"], json!(200));
    assert_eq!(engine["typeId"], json!(1000));
}

#[test]
fn test_move_engine_between_generations() {
    let catalog = build_catalog();
    let moved = catalog
        .move_item(Collection::Engines, 10001, Collection::Types, 1000, &admin())
        .unwrap();
    assert_eq!(moved["typeId"], json!(1000));
    assert_eq!(moved["modelId"], json!(100));

    // its stage still points at the engine, which is all a stage knows
    let store = catalog.store();
    let store = store.read();
    let stage = store.find_by_id(Collection::Stages, 3).unwrap().unwrap();
    assert_eq!(stage["engineId"], json!(10001));
}

#[test]
fn test_move_model_to_foreign_brand_group_is_rejected() {
    let catalog = build_catalog();
    let err = catalog
        .move_item(Collection::Models, 100, Collection::Groups, 20, &admin())
        .unwrap_err();
    assert!(matches!(err, CatalogError::InvalidReference(_)));

    let store = catalog.store();
    let store = store.read();
    let model = store.find_by_id(Collection::Models, 100).unwrap().unwrap();
    assert_eq!(model["groupId"], json!(10));
}

#[test]
fn test_move_to_missing_parent_is_rejected_before_write() {
    let catalog = build_catalog();
    let err = catalog
        .move_item(Collection::Engines, 10000, Collection::Types, 7777, &admin())
        .unwrap_err();
    assert!(matches!(err, CatalogError::NotFound { id: 7777, .. }));

    let store = catalog.store();
    let store = store.read();
    let engine = store.find_by_id(Collection::Engines, 10000).unwrap().unwrap();
    assert_eq!(engine["typeId"], json!(1000));
}

#[test]
fn test_delete_then_recreate_never_reuses_ids() {
    let catalog = build_catalog();
    catalog.delete_cascade(Collection::Brands, 2, &admin()).unwrap();
    // a fresh brand gets a brand-new id, not the freed 2
    let created = catalog
        .create(Collection::Brands, json!({"name": "Cupra"}), &admin())
        .unwrap();
    assert_eq!(created["id"], json!(3));
}

#[test]
fn test_cascade_is_fully_audited() {
    let catalog = build_catalog();
    catalog.delete_cascade(Collection::Models, 101, &admin()).unwrap();

    // root entry carries the cascade scope
    let entries = catalog.history(Collection::Models, 101, 10).unwrap();
    let delete_entry = &entries[0];
    assert_eq!(delete_entry.metadata["cascade"], json!(true));
    assert_eq!(delete_entry.metadata["deletedCounts"]["stages"], json!(1));

    // cascaded children each get their own entry pointing at the root
    let stage_entries = catalog.history(Collection::Stages, 3, 10).unwrap();
    assert_eq!(
        stage_entries[0].metadata["cascadedFrom"],
        json!({"collection": "models", "documentId": 101})
    );
}
