// tunebase-core/src/error.rs
// Error taxonomy for the catalog engine

use thiserror::Error;

use crate::cascade::DeleteReport;
use crate::entity::{Collection, EntityId};

/// All errors the catalog engine can produce.
///
/// Mutating entry points return these directly; the CLI wraps them in
/// anyhow context. Read endpoints never produce errors for empty results,
/// only for malformed input.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Referenced id does not exist in its collection. No partial effect.
    #[error("{collection} document {id} not found")]
    NotFound { collection: Collection, id: EntityId },

    /// A foreign key would point at a document of the wrong parent lineage.
    /// Rejected before any write.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A bulk selector resolved to zero engines. Distinct from "matched but
    /// nothing to change" so callers can tell the two apart.
    #[error("bulk scope resolved no engines: {0}")]
    EmptyScope(String),

    /// A cascade failed after some levels had already been written. Fatal;
    /// carries the exact counts completed so an operator can reconcile.
    #[error("cascade aborted after partial delete ({completed}): {reason}")]
    PartialCascade {
        completed: DeleteReport,
        reason: String,
    },

    /// Rollback target version does not exist, or has no prior snapshot.
    #[error("no usable audit version {version} for {collection} document {document_id}")]
    VersionNotFound {
        collection: Collection,
        document_id: EntityId,
        version: u64,
    },

    /// The external authorization gate said no.
    #[error("actor '{0}' is not authorized for catalog mutations")]
    Unauthorized(String),

    /// Malformed bulk selector, move target, or filter.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// An explicit-id insert collided with an existing document.
    #[error("{collection} already contains document {id}")]
    DuplicateId { collection: Collection, id: EntityId },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_names_collection_and_id() {
        let err = CatalogError::NotFound {
            collection: Collection::Engines,
            id: 42,
        };
        assert_eq!(err.to_string(), "engines document 42 not found");
    }

    #[test]
    fn test_partial_cascade_carries_counts() {
        let mut completed = DeleteReport::default();
        completed.stages = 7;
        completed.engines = 2;
        let err = CatalogError::PartialCascade {
            completed,
            reason: "delete_by_id failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("stages=7"));
        assert!(msg.contains("engines=2"));
    }

    #[test]
    fn test_serde_error_converts() {
        let bad = serde_json::from_str::<serde_json::Value>("{nope");
        let err: CatalogError = bad.unwrap_err().into();
        assert!(matches!(err, CatalogError::Serialization(_)));
    }
}
