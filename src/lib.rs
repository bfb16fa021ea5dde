//! # xsd-cache Library
//!
//! A compiled XML Schema cache for XML gateways: one authority for compiled
//! schemas, with dependency tracking across imports and includes, cascade
//! invalidation, target-namespace conflict resolution and debounced
//! promotion into an optional acceleration engine.

pub mod acceleration;
pub mod artifact;
pub mod builtin;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod file_resolver;
pub mod hardware;
pub mod http_resolver;
#[cfg(feature = "libxml2")]
pub mod libxml2;
pub mod logging;
pub mod maintenance;
pub mod report;
pub mod scanner;
pub mod source;


pub use acceleration::{AccelerationEngine, NoAcceleration, ResidentSchema};
pub use artifact::{ArtifactHandle, ArtifactId, CompiledArtifact, EdgeKind, HardwareState};
pub use cache::{REGISTERED_RESOLVER_ID, SchemaCache, SchemaCacheBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, Config, ConfigError, ConfigManager, EnvProvider, HardwareConfig, NetworkConfig,
    SystemEnvProvider, ValidationConfig,
};
pub use engine::{
    CompilationUnit, CountingSink, Dependency, ErrorSink, SchemaEngine, SchemaValidator,
    ValidationResult,
};
pub use error::{EngineError, EngineResult, Result, SchemaError};
pub use file_resolver::FileSchemaResolver;
pub use hardware::ReloadSummary;
pub use http_resolver::{HttpResolverConfig, HttpSchemaResolver};
#[cfg(feature = "libxml2")]
pub use libxml2::{LibXml2Engine, LibXml2Validator};
pub use logging::init_logging;
pub use maintenance::{MaintenanceReport, MaintenanceScheduler};
pub use report::CacheStats;
pub use scanner::{ScannedSchema, SchemaReference};
pub use source::{InvalidationListener, RefreshOutcome, SchemaSource, SourceResolver};
