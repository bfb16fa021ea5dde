//! The schema cache: one authority for compiled artifacts.
//!
//! All indices live in a single [`CacheState`] behind one reader/writer
//! lock. Lookups take the read lock. Everything that changes the indices
//! takes the write lock, including the final compile-and-install step of a
//! cache miss. Fetching schema text never happens under the lock: a miss
//! first prefetches the whole reference closure, then compiles from that
//! snapshot under the write lock. One global lock (instead of one per URI)
//! keeps mutually importing schemas from deadlocking each other.
//!
//! Handles are never closed while the calling thread holds the lock,
//! because closing an artifact needs the write lock itself. Anything
//! released under the lock is queued and closed right after the guard is
//! dropped.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use reqwest::Url;
use tracing::{debug, info};

use crate::acceleration::{AccelerationEngine, NoAcceleration};
use crate::artifact::{
    ArtifactHandle, ArtifactId, ArtifactParts, CompiledArtifact, EdgeKind, Links,
};
use crate::builtin;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigManager};
use crate::engine::{CompilationUnit, Dependency, SchemaEngine};
use crate::error::{Result, SchemaError};
use crate::hardware::{HardwareQueue, Promoter};
use crate::scanner::{self, ScannedSchema, SchemaReference};
use crate::source::{InvalidationListener, SchemaSource, SourceResolver, is_policy_uri};

/// Resolver id recorded on artifacts compiled from registered schemas
pub const REGISTERED_RESOLVER_ID: &str = "registered";

/// Attempts at compiling a miss when cached dependencies vanish mid-compile
const MAX_COMPILE_ATTEMPTS: usize = 3;

thread_local! {
    static LOCK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// True while the current thread holds a cache lock
pub(crate) fn lock_held() -> bool {
    LOCK_DEPTH.with(|depth| depth.get() > 0)
}

/// Lock guard that records the hold in [`LOCK_DEPTH`]
pub(crate) struct Held<G> {
    guard: G,
}

impl<G> Held<G> {
    fn new(guard: G) -> Self {
        LOCK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Held { guard }
    }
}

impl<G> Drop for Held<G> {
    fn drop(&mut self) {
        LOCK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

impl<G: Deref> Deref for Held<G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for Held<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// A schema supplied through [`SchemaCache::register`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RegisteredSchema {
    pub(crate) namespace: Option<String>,
    pub(crate) text: Arc<str>,
}

/// Everything guarded by the cache lock
#[derive(Default)]
pub(crate) struct CacheState {
    pub(crate) by_system_id: HashMap<String, ArtifactHandle>,
    pub(crate) tns_index: HashMap<String, HashMap<ArtifactId, Weak<CompiledArtifact>>>,
    pub(crate) registered: HashMap<String, RegisteredSchema>,
    pub(crate) registered_by_namespace: HashMap<String, BTreeSet<String>>,
    pub(crate) interest: HashMap<String, usize>,
    pub(crate) hardware: HardwareQueue,
    pub(crate) recently_superseded: BTreeSet<String>,
    pub(crate) rewarm: BTreeSet<String>,
    /// Handles released under the lock, closed once it is dropped
    pub(crate) deferred_close: Vec<ArtifactHandle>,
    /// Bumped whenever a registration or invalidation may change schema sources
    pub(crate) generation: u64,
}

impl CacheState {
    pub(crate) fn is_required(&self, uri: &str) -> bool {
        self.registered.contains_key(uri) || self.interest.contains_key(uri)
    }

    /// Drop the slot for `uri` without touching its dependents
    pub(crate) fn evict_uri(&mut self, uri: &str) -> bool {
        match self.by_system_id.remove(uri) {
            Some(handle) => {
                self.deferred_close.push(handle);
                true
            }
            None => false,
        }
    }

    /// Drop the slot for `uri` and remember it so that dependents follow
    pub(crate) fn invalidate_uri(&mut self, uri: &str) -> bool {
        self.generation += 1;
        if self.evict_uri(uri) {
            debug!(uri = %uri, "Schema superseded");
            self.recently_superseded.insert(uri.to_string());
            true
        } else {
            false
        }
    }

    /// Invalidate every cached parent of a superseded URI, transitively
    pub(crate) fn invalidate_parents_of_superseded(&mut self) -> usize {
        let mut invalidated = 0;
        while let Some(uri) = self.recently_superseded.pop_first() {
            let parents: Vec<String> = self
                .by_system_id
                .iter()
                .filter(|(_, handle)| handle.shared_artifact().depends_on(&uri))
                .map(|(parent, _)| parent.clone())
                .collect();
            for parent in parents {
                debug!(uri = %parent, child = %uri, "Invalidating parent of superseded schema");
                if self.invalidate_uri(&parent) {
                    invalidated += 1;
                }
            }
        }
        invalidated
    }

    pub(crate) fn lookup(&self, uri: &str) -> Option<&ArtifactHandle> {
        self.by_system_id
            .get(uri)
            .filter(|handle| !handle.shared_artifact().is_closed())
    }

    fn registered_source(&self, uri: &str) -> Option<SchemaSource> {
        self.registered.get(uri).map(|registered| {
            SchemaSource::new(uri, registered.text.clone(), REGISTERED_RESOLVER_ID)
        })
    }

    fn registered_by_namespace(&self, namespace: &str) -> Option<SchemaSource> {
        self.registered_by_namespace
            .get(namespace)
            .and_then(|uris| uris.iter().next())
            .and_then(|uri| self.registered_source(uri))
    }

    fn unlink_registered_namespace(&mut self, uri: &str, namespace: Option<&str>) {
        if let Some(namespace) = namespace {
            if let Some(uris) = self.registered_by_namespace.get_mut(namespace) {
                uris.remove(uri);
                if uris.is_empty() {
                    self.registered_by_namespace.remove(namespace);
                }
            }
        }
    }

    /// Unhook a closed artifact from every index and from its dependencies
    fn forget(&mut self, artifact: &Arc<CompiledArtifact>, promoter: &Promoter<'_>) {
        self.hardware.remove(artifact.id());
        self.demote(artifact, promoter.now, &mut HashSet::new());

        let mut namespaces = BTreeSet::new();
        for dependency in artifact.dependency_artifacts() {
            dependency.remove_export(artifact.id());
            if let Some(namespace) = dependency.target_namespace() {
                namespaces.insert(namespace.to_string());
            }
        }

        if let Some(namespace) = artifact.target_namespace() {
            if let Some(members) = self.tns_index.get_mut(namespace) {
                members.remove(&artifact.id());
            }
            namespaces.insert(namespace.to_string());
        }

        for namespace in namespaces {
            self.recheck_namespace(&namespace, promoter);
        }
    }
}

/// Validated configuration plus the compiled remote allow pattern
pub(crate) struct RuntimeConfig {
    pub(crate) config: Config,
    pub(crate) allow_remote: Regex,
}

impl RuntimeConfig {
    fn new(config: Config) -> Result<Self> {
        ConfigManager::validate_config(&config)?;
        let allow_remote = config.network.allow_regex()?;
        Ok(Self {
            config,
            allow_remote,
        })
    }
}

/// State shared by every clone of a [`SchemaCache`]
pub(crate) struct Shared {
    state: RwLock<CacheState>,
    deferred: Mutex<Vec<ArtifactHandle>>,
    retiring: Mutex<Vec<Arc<CompiledArtifact>>>,
    usage: Mutex<HashMap<ArtifactId, Weak<CompiledArtifact>>>,
    runtime: RwLock<Arc<RuntimeConfig>>,
    pub(crate) engine: Arc<dyn SchemaEngine>,
    pub(crate) accelerator: Arc<dyn AccelerationEngine>,
    pub(crate) local: Vec<Arc<dyn SourceResolver>>,
    pub(crate) remote: Vec<Arc<dyn SourceResolver>>,
    pub(crate) clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    self_ref: Weak<Shared>,
}

impl Shared {
    pub(crate) fn read(&self) -> Held<parking_lot::RwLockReadGuard<'_, CacheState>> {
        Held::new(self.state.read())
    }

    fn write(&self) -> Held<parking_lot::RwLockWriteGuard<'_, CacheState>> {
        Held::new(self.state.write())
    }

    /// Run `f` under the read lock, then close whatever was released meanwhile
    pub(crate) fn with_read<R>(&self, f: impl FnOnce(&CacheState) -> R) -> R {
        let result = {
            let state = self.read();
            f(&state)
        };
        self.drain_deferred();
        result
    }

    /// Run `f` under the write lock, then close whatever it released
    pub(crate) fn with_write<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        let (result, released) = {
            let mut state = self.write();
            let result = f(&mut state);
            let released = std::mem::take(&mut state.deferred_close);
            (result, released)
        };
        self.deferred.lock().extend(released);
        self.drain_deferred();
        result
    }

    pub(crate) fn runtime(&self) -> Arc<RuntimeConfig> {
        self.runtime.read().clone()
    }

    pub(crate) fn software_fallback(&self) -> bool {
        self.runtime.read().config.validation.software_fallback
    }

    pub(crate) fn promoter(&self) -> Promoter<'_> {
        Promoter {
            accelerator: self.accelerator.as_ref(),
            now: self.clock.now_millis(),
        }
    }

    pub(crate) fn note_usage(&self, id: ArtifactId, artifact: Weak<CompiledArtifact>) {
        self.usage.lock().insert(id, artifact);
    }

    pub(crate) fn take_usage(&self) -> Vec<Arc<CompiledArtifact>> {
        std::mem::take(&mut *self.usage.lock())
            .into_values()
            .filter_map(|artifact| artifact.upgrade())
            .collect()
    }

    /// The last handle to `artifact` was closed
    pub(crate) fn retire(&self, artifact: Arc<CompiledArtifact>) {
        if lock_held() {
            self.retiring.lock().push(artifact);
            return;
        }
        self.close_artifact(artifact);
        self.drain_deferred();
    }

    fn close_artifact(&self, artifact: Arc<CompiledArtifact>) {
        if !artifact.mark_closed() {
            return;
        }
        debug!(uri = %artifact.system_id(), id = %artifact.id(), "Closing compiled schema");
        let promoter = self.promoter();
        self.with_write(|state| state.forget(&artifact, &promoter));
        for handle in artifact.take_dependencies() {
            handle.close();
        }
    }

    /// Close everything released while some thread held the lock
    pub(crate) fn drain_deferred(&self) {
        if lock_held() {
            return;
        }
        loop {
            let handles = std::mem::take(&mut *self.deferred.lock());
            let retiring = std::mem::take(&mut *self.retiring.lock());
            if handles.is_empty() && retiring.is_empty() {
                break;
            }
            debug!(
                handles = handles.len(),
                artifacts = retiring.len(),
                "Schema cache closing unused schema handles"
            );
            for handle in handles {
                handle.close();
            }
            for artifact in retiring {
                self.close_artifact(artifact);
            }
        }
    }

    pub(crate) fn invalidate(&self, uri: &str, known_valid: bool) {
        let uri = scanner::canonical_uri(uri);
        self.with_write(|state| {
            if state.invalidate_uri(&uri) {
                info!(uri = %uri, "Schema invalidated");
            }
            state.invalidate_parents_of_superseded();
            if known_valid && state.is_required(&uri) {
                state.rewarm.insert(uri.clone());
            }
        });
    }

    /// The resolver an artifact's source came from
    pub(crate) fn resolver(&self, id: &str) -> Option<Arc<dyn SourceResolver>> {
        self.local
            .iter()
            .chain(self.remote.iter())
            .find(|resolver| resolver.id() == id)
            .cloned()
    }

    fn next_id(&self) -> ArtifactId {
        ArtifactId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn is_cached(&self, uri: &str) -> bool {
        self.with_read(|state| state.lookup(uri).is_some())
    }

    fn registered_source(&self, uri: &str) -> Option<SchemaSource> {
        self.with_read(|state| state.registered_source(uri))
    }

    fn registered_by_namespace(&self, namespace: &str) -> Option<SchemaSource> {
        self.with_read(|state| state.registered_by_namespace(namespace))
    }

    /// Registered schemas first, then local resolvers
    async fn fetch_local(&self, as_written: &str, resolved: &str) -> Result<Option<SchemaSource>> {
        if let Some(source) = self
            .registered_source(as_written)
            .or_else(|| self.registered_source(resolved))
        {
            return Ok(Some(source));
        }
        for resolver in &self.local {
            if let Some(source) = resolver.get_by_uri(resolved).await? {
                return Ok(Some(source));
            }
        }
        Ok(None)
    }

    async fn fetch_remote(&self, uri: &str, remote_allowed: bool) -> Result<Option<SchemaSource>> {
        if self.remote.is_empty() {
            return Ok(None);
        }
        let fetchable = Url::parse(uri)
            .map(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !remote_allowed {
            if fetchable {
                return Err(SchemaError::io(
                    uri,
                    "remote schema access is not permitted from a policy-scoped schema",
                ));
            }
            return Ok(None);
        }
        if !self.runtime().allow_remote.is_match(uri) {
            if fetchable {
                return Err(SchemaError::io(uri, "not permitted by remote URL pattern"));
            }
            return Ok(None);
        }
        for resolver in &self.remote {
            if let Some(source) = resolver.get_by_uri(uri).await? {
                return Ok(Some(source));
            }
        }
        Ok(None)
    }

    async fn fetch_by_namespace(&self, namespace: &str) -> Result<Option<SchemaSource>> {
        if let Some(source) = self.registered_by_namespace(namespace) {
            return Ok(Some(source));
        }
        for resolver in &self.local {
            if let Some(source) = resolver.get_by_namespace(namespace).await? {
                return Ok(Some(source));
            }
        }
        Ok(None)
    }

    /// Source text for a top-level request
    async fn resolve_top(&self, uri: &str) -> Result<SchemaSource> {
        if let Some(source) = self.fetch_local(uri, uri).await? {
            return Ok(source);
        }
        self.fetch_remote(uri, true)
            .await?
            .ok_or_else(|| SchemaError::io(uri, "no resolver could supply this schema"))
    }

    /// Registered, local, by namespace, then remote
    async fn resolve_reference(
        &self,
        parent: &SchemaSource,
        reference: &SchemaReference,
        known: &HashMap<String, SchemaSource>,
    ) -> Result<Resolved> {
        let remote_allowed = parent.is_remote
            || !parent.is_policy_scoped()
            || self.runtime().config.network.allow_remote_from_policy;

        let resolved = reference
            .location
            .as_deref()
            .map(|location| (location, scanner::resolve_location(&parent.uri, location)));

        if let Some((location, resolved)) = &resolved {
            if is_policy_uri(location) || is_policy_uri(resolved) {
                return Err(SchemaError::io(
                    *location,
                    "policy: schema references are not permitted in this context",
                ));
            }
            for candidate in [*location, resolved.as_str()] {
                if self.is_cached(candidate) {
                    return Ok(Resolved::Cached(candidate.to_string()));
                }
                if let Some(source) = known.get(candidate) {
                    return Ok(Resolved::Source(source.clone()));
                }
            }
            if let Some(source) = self.fetch_local(location, resolved).await? {
                return Ok(Resolved::Source(source));
            }
        }

        if let Some(namespace) = &reference.namespace {
            if let Some(source) = self.fetch_by_namespace(namespace).await? {
                return Ok(Resolved::Source(source));
            }
        }

        if let Some((_, resolved)) = &resolved {
            if let Some(source) = self.fetch_remote(resolved, remote_allowed).await? {
                return Ok(Resolved::Source(source));
            }
        }

        Err(SchemaError::io(
            reference.describe(),
            "unable to resolve schema reference",
        ))
    }

    /// Fetch the reference closure of `top` without holding any lock
    async fn prefetch(&self, top: &SchemaSource) -> SourceSet {
        let mut set = SourceSet::default();
        let mut known: HashMap<String, SchemaSource> = HashMap::new();
        known.insert(top.uri.clone(), top.clone());
        let mut queue = VecDeque::from([top.clone()]);

        while let Some(source) = queue.pop_front() {
            let scanned = scanner::scan(&source.content);
            for reference in &scanned.references {
                let key = RefKey::new(&source.uri, reference);
                if set.fetched.contains_key(&key) {
                    continue;
                }
                let outcome = self.resolve_reference(&source, reference, &known).await;
                if let Ok(Resolved::Source(child)) = &outcome {
                    if !known.contains_key(&child.uri) {
                        known.insert(child.uri.clone(), child.clone());
                        queue.push_back(child.clone());
                    }
                }
                set.fetched.insert(key, outcome);
            }
            set.scanned.insert(source.uri.clone(), scanned);
        }
        set
    }
}

/// Where a reference leads, as learned during prefetch
#[derive(Debug, Clone)]
enum Resolved {
    /// Already compiled under this URI
    Cached(String),
    Source(SchemaSource),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RefKey {
    base: String,
    reference: SchemaReference,
}

impl RefKey {
    fn new(base: &str, reference: &SchemaReference) -> Self {
        Self {
            base: base.to_string(),
            reference: reference.clone(),
        }
    }
}

/// Prefetched reference closure of one top-level request
#[derive(Default)]
struct SourceSet {
    scanned: HashMap<String, ScannedSchema>,
    fetched: HashMap<RefKey, Result<Resolved>>,
}

enum CompileFailure {
    /// Sources changed or a cached dependency disappeared after prefetch; fetch again
    Retry(String),
    Failed(SchemaError),
}

/// Recursive compile of one top-level request, under the write lock
struct Compiler<'a> {
    shared: &'a Shared,
    state: &'a mut CacheState,
    sources: &'a SourceSet,
    runtime: &'a RuntimeConfig,
    promoter: Promoter<'a>,
    seen: HashSet<String>,
}

impl Compiler<'_> {
    fn compile(
        &mut self,
        source: &SchemaSource,
    ) -> std::result::Result<Option<ArtifactHandle>, CompileFailure> {
        if let Some(handle) = self.state.lookup(&source.uri) {
            return handle.dup().map(Some).map_err(CompileFailure::Failed);
        }
        if !self.seen.insert(source.uri.clone()) {
            info!(uri = %source.uri, "Circular schema reference skipped");
            return Ok(None);
        }

        let sources = self.sources;
        let rescanned;
        let scanned = match sources.scanned.get(&source.uri) {
            Some(scanned) => scanned,
            None => {
                rescanned = scanner::scan(&source.content);
                &rescanned
            }
        };

        if scanned.has_doctype && !self.runtime.config.validation.allow_doctype {
            return Err(CompileFailure::Failed(SchemaError::invalid(
                source.uri.as_str(),
                "DOCTYPE declarations are not permitted in schema documents",
            )));
        }

        let mut acquired: Vec<(SchemaReference, ArtifactHandle)> = Vec::new();
        for reference in &scanned.references {
            match self.dependency(source, reference) {
                Ok(Some(handle)) => acquired.push((reference.clone(), handle)),
                Ok(None) => {}
                Err(failure) => {
                    self.release(acquired);
                    return Err(failure);
                }
            }
        }

        let validator = {
            let unit = CompilationUnit {
                system_id: &source.uri,
                target_namespace: scanned.target_namespace.as_deref(),
                text: &source.content,
                dependencies: acquired
                    .iter()
                    .map(|(reference, handle)| Dependency {
                        location: reference.location.as_deref(),
                        system_id: handle.uri(),
                        kind: reference.kind,
                        artifact: handle.shared_artifact(),
                    })
                    .collect(),
            };
            debug!(uri = %source.uri, dependencies = unit.dependencies.len(), "Compiling schema");
            self.shared.engine.compile(&unit)
        };
        let validator = match validator {
            Ok(validator) => validator,
            Err(error) => {
                self.release(acquired);
                return Err(CompileFailure::Failed(error.into_schema_error(&source.uri)));
            }
        };

        let mut links = Links::default();
        let mut edges: Vec<(Arc<CompiledArtifact>, EdgeKind)> = Vec::new();
        for (reference, handle) in acquired {
            let uri = handle.uri().to_string();
            edges.push((handle.shared_artifact().clone(), reference.kind));
            if let Some(location) = &reference.location {
                links.locations.push((location.clone(), uri.clone()));
            }
            let map = match reference.kind {
                EdgeKind::Import => &mut links.imports,
                EdgeKind::Include => &mut links.includes,
            };
            if let Some(duplicate) = map.insert(uri, handle) {
                self.state.deferred_close.push(duplicate);
            }
        }

        let artifact = CompiledArtifact::create(ArtifactParts {
            id: self.shared.next_id(),
            system_id: source.uri.clone(),
            target_namespace: scanned.target_namespace.clone(),
            schema_text: source.content.clone(),
            source_resolver_id: source.resolver_id.clone(),
            validator,
            transient: source.is_transient,
            clock: self.shared.clock.clone(),
            cache: self.shared.self_ref.clone(),
            links,
        });

        let mut namespaces = BTreeSet::new();
        for (dependency, kind) in &edges {
            dependency.add_export(&artifact, *kind);
            if let Some(namespace) = dependency.target_namespace() {
                namespaces.insert(namespace.to_string());
            }
        }

        let slot = ArtifactHandle::new(artifact.clone());
        if let Some(previous) = self.state.by_system_id.insert(source.uri.clone(), slot) {
            self.state.deferred_close.push(previous);
        }
        if let Some(namespace) = artifact.target_namespace() {
            self.state
                .tns_index
                .entry(namespace.to_string())
                .or_default()
                .insert(artifact.id(), Arc::downgrade(&artifact));
            namespaces.insert(namespace.to_string());
        }
        for namespace in namespaces {
            self.state.recheck_namespace(&namespace, &self.promoter);
        }

        debug!(
            uri = %artifact.system_id(),
            id = %artifact.id(),
            transient = artifact.is_transient(),
            "Compiled schema installed"
        );
        Ok(Some(ArtifactHandle::new(artifact)))
    }

    fn dependency(
        &mut self,
        parent: &SchemaSource,
        reference: &SchemaReference,
    ) -> std::result::Result<Option<ArtifactHandle>, CompileFailure> {
        let unresolved = |source: SchemaError| {
            CompileFailure::Failed(SchemaError::UnresolvedDependency {
                uri: parent.uri.clone(),
                reference: reference.describe(),
                source: Box::new(source),
            })
        };

        let sources = self.sources;
        match sources.fetched.get(&RefKey::new(&parent.uri, reference)) {
            None => Err(CompileFailure::Retry(reference.describe())),
            Some(Err(error)) => Err(unresolved(error.clone())),
            Some(Ok(Resolved::Cached(uri))) => match self.state.lookup(uri) {
                Some(handle) => handle.dup().map(Some).map_err(CompileFailure::Failed),
                None if self.seen.contains(uri) => {
                    info!(uri = %uri, parent = %parent.uri, "Circular schema reference skipped");
                    Ok(None)
                }
                None => Err(CompileFailure::Retry(uri.clone())),
            },
            Some(Ok(Resolved::Source(child))) => match self.compile(child) {
                Err(CompileFailure::Failed(error)) => Err(unresolved(error)),
                other => other,
            },
        }
    }

    fn release(&mut self, acquired: Vec<(SchemaReference, ArtifactHandle)>) {
        self.state
            .deferred_close
            .extend(acquired.into_iter().map(|(_, handle)| handle));
    }
}

/// Compiled XML Schema cache
///
/// Cheap to clone; all clones share one cache.
#[derive(Clone)]
pub struct SchemaCache {
    pub(crate) shared: Arc<Shared>,
}

impl SchemaCache {
    pub fn builder(engine: Arc<dyn SchemaEngine>) -> SchemaCacheBuilder {
        SchemaCacheBuilder::new(engine)
    }

    /// A fresh, caller-owned handle to the compiled schema for `uri`
    pub async fn get_by_uri(&self, uri: &str) -> Result<ArtifactHandle> {
        let uri = scanner::canonical_uri(uri);
        let shared: &Shared = &self.shared;

        if let Some(handle) = shared.with_read(|state| state.lookup(&uri).map(|h| h.dup())) {
            return handle;
        }

        let mut last_missing = String::new();

        for attempt in 1..=MAX_COMPILE_ATTEMPTS {
            let generation = shared.with_read(|state| state.generation);
            let top = shared.resolve_top(&uri).await?;
            let sources = shared.prefetch(&top).await;
            let runtime = shared.runtime();

            let outcome = shared.with_write(|state| {
                if let Some(handle) = state.lookup(&uri) {
                    return handle.dup().map(Some).map_err(CompileFailure::Failed);
                }
                // Sources fetched before a registration or invalidation may be stale
                if state.generation != generation {
                    return Err(CompileFailure::Retry(uri.clone()));
                }
                state.invalidate_parents_of_superseded();
                let mut compiler = Compiler {
                    shared,
                    state,
                    sources: &sources,
                    runtime: runtime.as_ref(),
                    promoter: shared.promoter(),
                    seen: HashSet::new(),
                };
                compiler.compile(&top)
            });

            match outcome {
                Ok(Some(handle)) => return Ok(handle),
                Ok(None) => {
                    return Err(SchemaError::CircularDependency { uri });
                }
                Err(CompileFailure::Failed(error)) => {
                    debug!(uri = %uri, error = %error, "Schema compile failed");
                    return Err(error);
                }
                Err(CompileFailure::Retry(missing)) => {
                    debug!(uri = %uri, missing = %missing, attempt, "Schema sources changed during prefetch; fetching again");
                    last_missing = missing;
                }
            }
        }

        Err(SchemaError::io(
            uri,
            format!("sources for {} kept changing during compilation", last_missing),
        ))
    }

    /// Register a durable schema. Identical re-registration is a no-op.
    pub fn register(&self, uri: &str, namespace: Option<&str>, text: &str) {
        let uri = scanner::canonical_uri(uri);
        let namespace = namespace
            .map(str::to_string)
            .or_else(|| scanner::target_namespace(text));
        self.shared.with_write(|state| {
            let schema = RegisteredSchema {
                namespace,
                text: Arc::from(text),
            };
            if state.registered.get(&uri) == Some(&schema) {
                return;
            }
            if let Some(previous) = state.registered.remove(&uri) {
                state.unlink_registered_namespace(&uri, previous.namespace.as_deref());
            }
            if let Some(namespace) = &schema.namespace {
                state
                    .registered_by_namespace
                    .entry(namespace.clone())
                    .or_default()
                    .insert(uri.clone());
            }
            state.registered.insert(uri.clone(), schema);
            info!(uri = %uri, "Schema registered");
            state.invalidate_uri(&uri);
            state.invalidate_parents_of_superseded();
        });
    }

    pub fn unregister(&self, uri: &str) {
        let uri = scanner::canonical_uri(uri);
        self.shared.with_write(|state| {
            if let Some(previous) = state.registered.remove(&uri) {
                state.unlink_registered_namespace(&uri, previous.namespace.as_deref());
                info!(uri = %uri, "Schema unregistered");
                state.invalidate_uri(&uri);
                state.invalidate_parents_of_superseded();
            }
        });
    }

    /// Keep `uri` required without compiling it
    pub fn register_interest(&self, uri: &str) {
        let uri = scanner::canonical_uri(uri);
        self.shared
            .with_write(|state| *state.interest.entry(uri).or_insert(0) += 1);
    }

    pub fn unregister_interest(&self, uri: &str) {
        let uri = scanner::canonical_uri(uri);
        self.shared.with_write(|state| {
            if let Some(count) = state.interest.get_mut(&uri) {
                *count -= 1;
                if *count == 0 {
                    state.interest.remove(&uri);
                }
            }
        });
    }

    pub fn is_registered(&self, uri: &str) -> bool {
        let uri = scanner::canonical_uri(uri);
        self.shared
            .with_read(|state| state.registered.contains_key(&uri))
    }

    /// Registered URIs plus URIs somebody registered interest in
    pub fn required_uris(&self) -> BTreeSet<String> {
        self.shared.with_read(|state| {
            state
                .registered
                .keys()
                .chain(state.interest.keys())
                .cloned()
                .collect()
        })
    }

    /// Drop `uri` and every cached schema built on it
    pub fn invalidate(&self, uri: &str, known_valid: bool) {
        self.shared.invalidate(uri, known_valid);
    }

    /// Push channel for resolvers that learn about changes on their own
    pub fn listener(&self) -> InvalidationListener {
        InvalidationListener::new(Arc::downgrade(&self.shared))
    }

    pub fn contains(&self, uri: &str) -> bool {
        let uri = scanner::canonical_uri(uri);
        self.shared.is_cached(&uri)
    }

    pub fn len(&self) -> usize {
        self.shared.with_read(|state| state.by_system_id.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> Config {
        self.shared.runtime().config.clone()
    }

    /// Swap in a new configuration
    pub fn update_config(&self, config: Config) -> Result<()> {
        let runtime = RuntimeConfig::new(config)?;
        *self.shared.runtime.write() = Arc::new(runtime);
        info!("Schema cache configuration updated");
        Ok(())
    }

    /// Release every cache slot. Outstanding caller handles stay usable until closed.
    pub fn shutdown(&self) {
        self.shared.with_write(|state| {
            let slots: Vec<ArtifactHandle> =
                state.by_system_id.drain().map(|(_, handle)| handle).collect();
            state.deferred_close.extend(slots);
            state.recently_superseded.clear();
            state.rewarm.clear();
        });
        info!("Schema cache shut down");
    }
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache")
            .field("entries", &self.len())
            .finish()
    }
}

/// Assembles a [`SchemaCache`] from its collaborators
pub struct SchemaCacheBuilder {
    engine: Arc<dyn SchemaEngine>,
    accelerator: Arc<dyn AccelerationEngine>,
    resolvers: Vec<Arc<dyn SourceResolver>>,
    clock: Arc<dyn Clock>,
    config: Config,
    builtin_schemas: bool,
}

impl SchemaCacheBuilder {
    pub fn new(engine: Arc<dyn SchemaEngine>) -> Self {
        Self {
            engine,
            accelerator: Arc::new(NoAcceleration),
            resolvers: Vec::new(),
            clock: Arc::new(SystemClock),
            config: Config::default(),
            builtin_schemas: false,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Add a resolver; local ones are consulted before remote ones, each in insertion order
    pub fn resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn accelerator(mut self, accelerator: Arc<dyn AccelerationEngine>) -> Self {
        self.accelerator = accelerator;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Pre-register the W3C schemas every gateway needs offline
    pub fn with_builtin_schemas(mut self) -> Self {
        self.builtin_schemas = true;
        self
    }

    pub fn build(self) -> Result<SchemaCache> {
        let runtime = RuntimeConfig::new(self.config)?;
        let (remote, local): (Vec<_>, Vec<_>) =
            self.resolvers.into_iter().partition(|r| r.is_remote());

        let shared = Arc::new_cyclic(|self_ref| Shared {
            state: RwLock::new(CacheState::default()),
            deferred: Mutex::new(Vec::new()),
            retiring: Mutex::new(Vec::new()),
            usage: Mutex::new(HashMap::new()),
            runtime: RwLock::new(Arc::new(runtime)),
            engine: self.engine,
            accelerator: self.accelerator,
            local,
            remote,
            clock: self.clock,
            next_id: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        });

        let cache = SchemaCache { shared };
        for resolver in cache.shared.local.iter().chain(cache.shared.remote.iter()) {
            resolver.subscribe(cache.listener());
        }
        if self.builtin_schemas {
            for schema in builtin::SCHEMAS {
                cache.register(schema.uri, Some(schema.namespace), schema.text);
            }
        }
        info!(
            local_resolvers = cache.shared.local.len(),
            remote_resolvers = cache.shared.remote.len(),
            acceleration = cache.shared.accelerator.is_available(),
            "Schema cache ready"
        );
        Ok(cache)
    }
}
