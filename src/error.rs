use thiserror::Error;

/// Every way a schema lookup, compile or validation can fail
///
/// Payloads are plain strings so that errors can be cloned, cached in a
/// prefetch set and handed to several waiting callers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("IO error: {uri} - {details}")]
    Io { uri: String, details: String },

    #[error("Request timeout: {uri} after {timeout_seconds} seconds")]
    Timeout { uri: String, timeout_seconds: u64 },

    #[error("HTTP status error: {status} for {uri}")]
    HttpStatus { uri: String, status: u16 },

    #[error("Invalid schema: {uri} - {details}")]
    Invalid { uri: String, details: String },

    #[error("Unresolved dependency '{reference}' of {uri}: {source}")]
    UnresolvedDependency {
        uri: String,
        reference: String,
        source: Box<SchemaError>,
    },

    #[error("Circular schema reference: {uri}")]
    CircularDependency { uri: String },

    #[error("XML validation failed against {uri}: {error_count} error(s), first: {first}")]
    ValidationFailed {
        uri: String,
        error_count: usize,
        first: String,
    },

    #[error("Schema handle already closed: {uri}")]
    ClosedHandle { uri: String },

    #[error("Unclassified schema compile failure: {uri} - {details}")]
    Unclassified { uri: String, details: String },

    #[error("Acceleration engine error: {details}")]
    Acceleration { details: String },

    #[error("Configuration error: {details}")]
    Config { details: String },
}

impl SchemaError {
    pub(crate) fn io(uri: impl Into<String>, details: impl Into<String>) -> Self {
        SchemaError::Io {
            uri: uri.into(),
            details: details.into(),
        }
    }

    pub(crate) fn invalid(uri: impl Into<String>, details: impl Into<String>) -> Self {
        SchemaError::Invalid {
            uri: uri.into(),
            details: details.into(),
        }
    }

    /// True for failures to obtain schema text (network, file system, size limits)
    pub fn is_io(&self) -> bool {
        match self {
            SchemaError::Io { .. } | SchemaError::Timeout { .. } | SchemaError::HttpStatus { .. } => {
                true
            }
            SchemaError::UnresolvedDependency { source, .. } => source.is_io(),
            _ => false,
        }
    }

    /// True for schema text that was obtained but could not be compiled
    pub fn is_invalid(&self) -> bool {
        match self {
            SchemaError::Invalid { .. } | SchemaError::Unclassified { .. } => true,
            SchemaError::UnresolvedDependency { source, .. } => source.is_invalid(),
            _ => false,
        }
    }

    /// The innermost cause of a chain of dependency failures
    pub fn root_cause(&self) -> &SchemaError {
        match self {
            SchemaError::UnresolvedDependency { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for SchemaError {
    fn from(err: reqwest::Error) -> Self {
        let uri = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        if let Some(status) = err.status() {
            return SchemaError::HttpStatus {
                uri,
                status: status.as_u16(),
            };
        }
        SchemaError::Io {
            uri,
            details: err.to_string(),
        }
    }
}

impl From<crate::config::ConfigError> for SchemaError {
    fn from(err: crate::config::ConfigError) -> Self {
        SchemaError::Config {
            details: err.to_string(),
        }
    }
}

/// Failure reported by a [`crate::engine::SchemaEngine`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Schema parsing failed: {details}")]
    SchemaParseFailed { details: String },

    #[error("Memory allocation failed in schema engine")]
    MemoryAllocation,

    #[error("Schema engine internal error: {details}")]
    Internal { details: String },
}

impl EngineError {
    /// Attach the system id being compiled
    pub(crate) fn into_schema_error(self, uri: &str) -> SchemaError {
        match self {
            EngineError::SchemaParseFailed { details } => SchemaError::invalid(uri, details),
            other => SchemaError::Unclassified {
                uri: uri.to_string(),
                details: other.to_string(),
            },
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Engine result type alias
pub type EngineResult<T> = std::result::Result<T, EngineError>;
