//! The schema compiler and validator the cache drives.
//!
//! The cache never interprets XML Schema itself. It hands a
//! [`CompilationUnit`] (the schema text plus its already compiled
//! dependencies) to a [`SchemaEngine`] and keeps the returned
//! [`SchemaValidator`] inside the artifact.

use std::sync::Arc;

use crate::artifact::{CompiledArtifact, EdgeKind};
use crate::error::EngineResult;

/// Compiles schema documents
///
/// Compilation is serialized by the cache; implementations need not be
/// reentrant. Validators they return must be usable from many threads.
pub trait SchemaEngine: Send + Sync {
    fn compile(&self, unit: &CompilationUnit<'_>) -> EngineResult<Arc<dyn SchemaValidator>>;
}

/// Validates documents against one compiled schema
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, document: &[u8]) -> ValidationResult;
}

/// Everything the engine needs to compile one schema document
pub struct CompilationUnit<'a> {
    pub system_id: &'a str,
    pub target_namespace: Option<&'a str>,
    pub text: &'a str,
    pub dependencies: Vec<Dependency<'a>>,
}

/// A compiled dependency, keyed by how the parent referred to it
pub struct Dependency<'a> {
    /// `schemaLocation` as written in the parent, when there was one
    pub location: Option<&'a str>,
    pub system_id: &'a str,
    pub kind: EdgeKind,
    pub artifact: &'a CompiledArtifact,
}

impl<'a> CompilationUnit<'a> {
    /// Dependencies reached through import elements
    pub fn imports(&self) -> impl Iterator<Item = &Dependency<'a>> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == EdgeKind::Import)
    }
}

/// Outcome of validating one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Document conforms
    Valid,
    /// Document violates the schema
    Invalid {
        error_count: usize,
        errors: Vec<String>,
    },
    /// The engine could not complete validation
    InternalError { details: String },
}

impl ValidationResult {
    /// Build a result from a list of collected errors
    pub fn from_errors(errors: Vec<String>) -> Self {
        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid {
                error_count: errors.len(),
                errors,
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationResult::Invalid { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ValidationResult::InternalError { .. })
    }

    /// Error messages carried by this result
    pub fn messages(&self) -> Vec<String> {
        match self {
            ValidationResult::Valid => Vec::new(),
            ValidationResult::Invalid { errors, error_count } => {
                if errors.is_empty() {
                    vec![format!("{} validation error(s)", error_count)]
                } else {
                    errors.clone()
                }
            }
            ValidationResult::InternalError { details } => vec![details.clone()],
        }
    }
}

/// Receives every validation error of a call, in order
pub trait ErrorSink {
    fn report(&mut self, message: &str);
}

impl ErrorSink for Vec<String> {
    fn report(&mut self, message: &str) {
        self.push(message.to_string());
    }
}

/// Sink that only counts
#[derive(Debug, Default)]
pub struct CountingSink {
    pub count: usize,
}

impl ErrorSink for CountingSink {
    fn report(&mut self, _message: &str) {
        self.count += 1;
    }
}
