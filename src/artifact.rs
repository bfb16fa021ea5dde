//! Compiled schemas and the refcounted handles callers hold on to.
//!
//! A [`CompiledArtifact`] is jointly owned by its cache slot, by every
//! outstanding [`ArtifactHandle`] and by the dependency maps of the
//! artifacts that import or include it. Each of those owners holds one
//! handle, and the artifact closes once the last handle is closed.
//! Back-edges (`exports`) are weak and never keep an artifact alive.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::acceleration::ResidentSchema;
use crate::cache::Shared;
use crate::clock::Clock;
use crate::engine::{ErrorSink, SchemaValidator, ValidationResult};
use crate::error::{Result, SchemaError};

/// Process-unique artifact identity, used as the key of non-owning references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArtifactId(u64);

impl ArtifactId {
    pub(crate) fn new(raw: u64) -> Self {
        ArtifactId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a parent document refers to a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EdgeKind {
    /// Cross-namespace `import`
    Import,
    /// Same-namespace `include` or `redefine`
    Include,
}

/// Position in the acceleration promotion state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum HardwareState {
    #[default]
    Ineligible,
    PendingPromotion,
    Eligible,
}

#[derive(Debug, Default)]
struct Status {
    conflicting_tns: bool,
    hardware: HardwareState,
    rejected: bool,
}

pub(crate) struct Export {
    pub(crate) artifact: Weak<CompiledArtifact>,
    pub(crate) kind: EdgeKind,
}

#[derive(Default)]
pub(crate) struct Links {
    pub(crate) imports: HashMap<String, ArtifactHandle>,
    pub(crate) includes: HashMap<String, ArtifactHandle>,
    /// `schemaLocation` as written, mapped to the system id it resolved to
    pub(crate) locations: Vec<(String, String)>,
    pub(crate) exports: HashMap<ArtifactId, Export>,
}

/// Everything needed to construct an artifact
pub(crate) struct ArtifactParts {
    pub(crate) id: ArtifactId,
    pub(crate) system_id: String,
    pub(crate) target_namespace: Option<String>,
    pub(crate) schema_text: Arc<str>,
    pub(crate) source_resolver_id: String,
    pub(crate) validator: Arc<dyn SchemaValidator>,
    pub(crate) transient: bool,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cache: Weak<Shared>,
    pub(crate) links: Links,
}

/// One compiled schema document and its links to other documents
pub struct CompiledArtifact {
    id: ArtifactId,
    system_id: String,
    target_namespace: Option<String>,
    schema_text: Arc<str>,
    source_resolver_id: String,
    validator: Arc<dyn SchemaValidator>,
    transient: bool,
    created_at: u64,
    last_used: AtomicU64,
    ref_count: AtomicUsize,
    closed: AtomicBool,
    links: Mutex<Links>,
    status: Mutex<Status>,
    clock: Arc<dyn Clock>,
    cache: Weak<Shared>,
    self_ref: Weak<CompiledArtifact>,
}

impl CompiledArtifact {
    pub(crate) fn create(parts: ArtifactParts) -> Arc<Self> {
        let now = parts.clock.now_millis();
        Arc::new_cyclic(|self_ref| CompiledArtifact {
            id: parts.id,
            system_id: parts.system_id,
            target_namespace: parts.target_namespace,
            schema_text: parts.schema_text,
            source_resolver_id: parts.source_resolver_id,
            validator: parts.validator,
            transient: parts.transient,
            created_at: now,
            last_used: AtomicU64::new(now),
            ref_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            links: Mutex::new(parts.links),
            status: Mutex::new(Status::default()),
            clock: parts.clock,
            cache: parts.cache,
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> ArtifactId {
        self.id
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn target_namespace(&self) -> Option<&str> {
        self.target_namespace.as_deref()
    }

    pub fn schema_text(&self) -> &str {
        &self.schema_text
    }

    pub fn source_resolver_id(&self) -> &str {
        &self.source_resolver_id
    }

    /// Compiled from a remote, non-durable source
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    /// Number of open handles: cache slot, callers and dependent artifacts
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_conflicting(&self) -> bool {
        self.status.lock().conflicting_tns
    }

    pub fn hardware_state(&self) -> HardwareState {
        self.status.lock().hardware
    }

    /// The acceleration engine refused this schema
    pub fn is_rejected(&self) -> bool {
        self.status.lock().rejected
    }

    /// System ids of imported schemas
    pub fn imports(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.links.lock().imports.keys().cloned().collect();
        uris.sort();
        uris
    }

    /// System ids of included and redefined schemas
    pub fn includes(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.links.lock().includes.keys().cloned().collect();
        uris.sort();
        uris
    }

    pub fn depends_on(&self, uri: &str) -> bool {
        let links = self.links.lock();
        links.imports.contains_key(uri) || links.includes.contains_key(uri)
    }

    /// System ids of live artifacts that import or include this one
    pub fn exporters(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .live_exporters()
            .iter()
            .map(|(parent, _)| parent.system_id.clone())
            .collect();
        uris.sort();
        uris.dedup();
        uris
    }

    /// Every live dependent reached this artifact through an include or redefine.
    ///
    /// An artifact nobody depends on is an independent claim on its namespace.
    pub fn is_include_only(&self) -> bool {
        let exporters = self.live_exporters();
        !exporters.is_empty() && exporters.iter().all(|(_, kind)| *kind == EdgeKind::Include)
    }

    /// This artifact and everything that transitively depends on it are transient
    pub fn is_transiently_referenced(&self) -> bool {
        if !self.transient {
            return false;
        }
        let mut visited = HashSet::from([self.id]);
        let mut stack: Vec<Arc<CompiledArtifact>> = self
            .live_exporters()
            .into_iter()
            .map(|(parent, _)| parent)
            .collect();
        while let Some(parent) = stack.pop() {
            if !visited.insert(parent.id) {
                continue;
            }
            if !parent.transient {
                return false;
            }
            stack.extend(parent.live_exporters().into_iter().map(|(p, _)| p));
        }
        true
    }

    /// Validate one document, reporting every error to `sink`
    pub fn validate(&self, document: &[u8], sink: &mut dyn ErrorSink) -> Result<()> {
        self.validate_all(&[document], sink)
    }

    /// Validate several documents in one pass.
    ///
    /// Errors from all documents are reported before failing; the first one
    /// is carried by the returned [`SchemaError::ValidationFailed`].
    pub fn validate_all(&self, documents: &[&[u8]], sink: &mut dyn ErrorSink) -> Result<()> {
        self.ensure_open()?;
        self.mark_used();

        let mut error_count = 0;
        let mut first: Option<String> = None;
        for document in documents {
            let result = self.run_validation(document)?;
            for message in result.messages() {
                sink.report(&message);
                error_count += 1;
                if first.is_none() {
                    first = Some(message);
                }
            }
        }

        match first {
            None => Ok(()),
            Some(first) => Err(SchemaError::ValidationFailed {
                uri: self.system_id.clone(),
                error_count,
                first,
            }),
        }
    }

    fn run_validation(&self, document: &[u8]) -> Result<ValidationResult> {
        if self.hardware_state() == HardwareState::Eligible {
            if let Some(shared) = self.cache.upgrade() {
                if let Some(result) = shared.accelerator.validate(self.id, document) {
                    return Ok(result);
                }
                if !shared.software_fallback() {
                    return Err(SchemaError::Acceleration {
                        details: format!(
                            "hardware validation unavailable for {} and software fallback disabled",
                            self.system_id
                        ),
                    });
                }
            }
        }
        Ok(self.validator.validate(document))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SchemaError::ClosedHandle {
                uri: self.system_id.clone(),
            });
        }
        Ok(())
    }

    /// Record use now; dependencies catch up during the next usage sweep
    fn mark_used(&self) {
        self.last_used
            .fetch_max(self.clock.now_millis(), Ordering::AcqRel);
        if let Some(shared) = self.cache.upgrade() {
            shared.note_usage(self.id, self.self_ref.clone());
        }
    }

    /// Push `last_used` down to every transitive dependency
    pub(crate) fn propagate_last_used(&self) {
        let stamp = self.last_used();
        let mut visited = HashSet::from([self.id]);
        let mut stack = self.dependency_artifacts();
        while let Some(dependency) = stack.pop() {
            if !visited.insert(dependency.id) {
                continue;
            }
            dependency.last_used.fetch_max(stamp, Ordering::AcqRel);
            stack.extend(dependency.dependency_artifacts());
        }
    }

    pub(crate) fn live_exporters(&self) -> Vec<(Arc<CompiledArtifact>, EdgeKind)> {
        self.links
            .lock()
            .exports
            .values()
            .filter_map(|export| {
                export
                    .artifact
                    .upgrade()
                    .filter(|parent| !parent.is_closed())
                    .map(|parent| (parent, export.kind))
            })
            .collect()
    }

    /// Artifacts this one holds handles to, imports and includes alike
    pub(crate) fn dependency_artifacts(&self) -> Vec<Arc<CompiledArtifact>> {
        let links = self.links.lock();
        let mut seen = HashSet::new();
        links
            .imports
            .values()
            .chain(links.includes.values())
            .map(|handle| handle.shared_artifact().clone())
            .filter(|artifact| seen.insert(artifact.id))
            .collect()
    }

    /// Dependencies with the kind of edge, sorted by system id
    pub(crate) fn dependency_edges(&self) -> Vec<(EdgeKind, Arc<CompiledArtifact>)> {
        let links = self.links.lock();
        let mut edges: Vec<(EdgeKind, Arc<CompiledArtifact>)> = links
            .imports
            .values()
            .map(|handle| (EdgeKind::Import, handle.shared_artifact().clone()))
            .chain(
                links
                    .includes
                    .values()
                    .map(|handle| (EdgeKind::Include, handle.shared_artifact().clone())),
            )
            .collect();
        edges.sort_by(|a, b| a.1.system_id.cmp(&b.1.system_id));
        edges
    }

    pub(crate) fn import_artifacts(&self) -> Vec<Arc<CompiledArtifact>> {
        self.links
            .lock()
            .imports
            .values()
            .map(|handle| handle.shared_artifact().clone())
            .collect()
    }

    /// `schemaLocation` strings as written, with the system id each resolved to
    pub(crate) fn locations(&self) -> Vec<(String, String)> {
        self.links.lock().locations.clone()
    }

    pub(crate) fn add_export(&self, parent: &Arc<CompiledArtifact>, kind: EdgeKind) {
        let mut links = self.links.lock();
        let entry = links.exports.entry(parent.id).or_insert(Export {
            artifact: Arc::downgrade(parent),
            kind,
        });
        if kind == EdgeKind::Import {
            entry.kind = EdgeKind::Import;
        }
    }

    pub(crate) fn remove_export(&self, parent: ArtifactId) {
        self.links.lock().exports.remove(&parent);
    }

    pub(crate) fn set_conflicting(&self, conflicting: bool) -> bool {
        let mut status = self.status.lock();
        let changed = status.conflicting_tns != conflicting;
        status.conflicting_tns = conflicting;
        changed
    }

    pub(crate) fn set_hardware_state(&self, state: HardwareState) -> HardwareState {
        std::mem::replace(&mut self.status.lock().hardware, state)
    }

    pub(crate) fn set_rejected(&self) {
        self.status.lock().rejected = true;
    }

    pub(crate) fn resident_schema(&self) -> Option<ResidentSchema> {
        let target_namespace = self.target_namespace.clone()?;
        let mut imports: Vec<ArtifactId> =
            self.import_artifacts().iter().map(|a| a.id).collect();
        imports.sort();
        Some(ResidentSchema {
            id: self.id,
            system_id: self.system_id.clone(),
            target_namespace,
            text: self.schema_text.clone(),
            imports,
        })
    }

    /// Mark closed; true only for the caller that actually closed it
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Detach the dependency handles so they can be closed outside the cache lock
    pub(crate) fn take_dependencies(&self) -> Vec<ArtifactHandle> {
        let mut guard = self.links.lock();
        let links = &mut *guard;
        links
            .imports
            .drain()
            .chain(links.includes.drain())
            .map(|(_, handle)| handle)
            .collect()
    }

    fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(this: &Arc<CompiledArtifact>) {
        if this.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            match this.cache.upgrade() {
                Some(shared) => shared.retire(this.clone()),
                None => Self::close_detached(this),
            }
        }
    }

    /// Close without a cache to report to (the cache is being torn down)
    fn close_detached(this: &Arc<CompiledArtifact>) {
        if this.mark_closed() {
            for handle in this.take_dependencies() {
                handle.close();
            }
        }
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("id", &self.id)
            .field("system_id", &self.system_id)
            .field("target_namespace", &self.target_namespace)
            .field("transient", &self.transient)
            .field("ref_count", &self.ref_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A counted reference to a [`CompiledArtifact`]
///
/// Closing is idempotent and also happens on drop. Every operation through
/// a closed handle fails with [`SchemaError::ClosedHandle`].
pub struct ArtifactHandle {
    artifact: Arc<CompiledArtifact>,
    closed: AtomicBool,
}

impl ArtifactHandle {
    pub(crate) fn new(artifact: Arc<CompiledArtifact>) -> Self {
        artifact.acquire();
        ArtifactHandle {
            artifact,
            closed: AtomicBool::new(false),
        }
    }

    /// Another handle to the same artifact, with its own lifetime
    pub fn dup(&self) -> Result<ArtifactHandle> {
        self.artifact()?;
        Ok(ArtifactHandle::new(self.artifact.clone()))
    }

    pub fn artifact(&self) -> Result<&CompiledArtifact> {
        if self.is_closed() || self.artifact.is_closed() {
            return Err(SchemaError::ClosedHandle {
                uri: self.artifact.system_id.clone(),
            });
        }
        Ok(&self.artifact)
    }

    pub fn validate(&self, document: &[u8], sink: &mut dyn ErrorSink) -> Result<()> {
        self.artifact()?.validate(document, sink)
    }

    pub fn validate_all(&self, documents: &[&[u8]], sink: &mut dyn ErrorSink) -> Result<()> {
        self.artifact()?.validate_all(documents, sink)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            CompiledArtifact::release(&self.artifact);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn shared_artifact(&self) -> &Arc<CompiledArtifact> {
        &self.artifact
    }

    pub(crate) fn uri(&self) -> &str {
        &self.artifact.system_id
    }
}

impl Drop for ArtifactHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactHandle")
            .field("system_id", &self.artifact.system_id)
            .field("id", &self.artifact.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
