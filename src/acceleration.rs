//! Optional hardware acceleration path.
//!
//! An [`AccelerationEngine`] keeps a resident set of schemas it can validate
//! against directly. The cache decides which artifacts belong in that set;
//! the engine only reports what it could not load.

use std::collections::HashMap;
use std::sync::Arc;

use crate::artifact::ArtifactId;
use crate::engine::ValidationResult;

/// A schema offered to the acceleration engine
#[derive(Debug, Clone, PartialEq)]
pub struct ResidentSchema {
    pub id: ArtifactId,
    pub system_id: String,
    pub target_namespace: String,
    pub text: Arc<str>,
    /// Ids of the imported schemas, all of which precede this one in a resident set
    pub imports: Vec<ArtifactId>,
}

pub trait AccelerationEngine: Send + Sync {
    /// False disables promotion entirely
    fn is_available(&self) -> bool {
        true
    }

    /// Whether the engine can accept this schema at all
    fn check(&self, schema: &ResidentSchema) -> Result<(), String>;

    /// Replace the resident set, dependencies first. Returns per-artifact failures.
    fn set_resident_set(&self, schemas: &[ResidentSchema]) -> HashMap<ArtifactId, String>;

    /// Validate with a resident schema; `None` when it is not loaded
    fn validate(&self, _id: ArtifactId, _document: &[u8]) -> Option<ValidationResult> {
        None
    }
}

/// Software-only operation
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAcceleration;

impl AccelerationEngine for NoAcceleration {
    fn is_available(&self) -> bool {
        false
    }

    fn check(&self, _schema: &ResidentSchema) -> Result<(), String> {
        Err("no acceleration engine".to_string())
    }

    fn set_resident_set(&self, _schemas: &[ResidentSchema]) -> HashMap<ArtifactId, String> {
        HashMap::new()
    }
}
