// tunebase-core/src/locks.rs
// Advisory per-subtree locking for structural mutations

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::entity::EntityId;

/// Advisory locks giving at-most-one concurrent structural mutation per
/// Brand subtree. Cascade deletes, moves and bulk updates take the lock of
/// the root Brand they touch; catalog-wide operations (`level='all'`) take
/// the catalog lock. Read queries never lock.
///
/// The registry only grows (one entry per brand ever mutated), which is
/// bounded by the catalog size.
#[derive(Default)]
pub struct SubtreeLocks {
    catalog: Arc<Mutex<()>>,
    brands: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl SubtreeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding one Brand's subtree. Callers hold the guard for
    /// the duration of the mutation:
    ///
    /// ```ignore
    /// let lock = locks.for_brand(brand_id);
    /// let _guard = lock.lock();
    /// ```
    pub fn for_brand(&self, brand_id: EntityId) -> Arc<Mutex<()>> {
        self.brands
            .entry(brand_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The catalog-wide lock, for mutations without a single root Brand.
    pub fn catalog_wide(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.catalog)
    }
}
