//! Where schema text comes from.
//!
//! A [`SourceResolver`] hands out immutable [`SchemaSource`] values for a
//! URI or a target namespace. The cache asks resolvers in priority order:
//! its own registered schemas first, then local resolvers, then remote ones.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::cache::Shared;
use crate::error::Result;

/// Raw schema text plus where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaSource {
    pub uri: String,
    pub content: Arc<str>,
    pub resolver_id: String,
    pub is_transient: bool,
    pub is_remote: bool,
}

impl SchemaSource {
    pub fn new(
        uri: impl Into<String>,
        content: impl Into<Arc<str>>,
        resolver_id: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            content: content.into(),
            resolver_id: resolver_id.into(),
            is_transient: false,
            is_remote: false,
        }
    }

    /// Mark as fetched from a remote, non-durable origin
    pub fn remote(mut self) -> Self {
        self.is_transient = true;
        self.is_remote = true;
        self
    }

    pub fn transient(mut self, transient: bool) -> Self {
        self.is_transient = transient;
        self
    }

    /// Sources under the `policy:` scheme are scoped to a single policy
    pub fn is_policy_scoped(&self) -> bool {
        is_policy_uri(&self.uri)
    }
}

pub(crate) fn is_policy_uri(uri: &str) -> bool {
    uri.get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("policy:"))
}

/// Result of asking a resolver whether a previously served URI is still current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Unchanged,
    Changed,
    Gone,
}

/// Supplies schema text to the cache
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Identifier recorded on every artifact compiled from this resolver's sources
    fn id(&self) -> &str;

    async fn get_by_uri(&self, uri: &str) -> Result<Option<SchemaSource>>;

    async fn get_by_namespace(&self, _namespace: &str) -> Result<Option<SchemaSource>> {
        Ok(None)
    }

    /// Re-check a URI this resolver served earlier
    async fn refresh(&self, _uri: &str) -> Result<RefreshOutcome> {
        Ok(RefreshOutcome::Unchanged)
    }

    fn is_remote(&self) -> bool;

    fn is_transient(&self) -> bool;

    /// Receives the cache's push-invalidation channel when the cache is built
    fn subscribe(&self, _listener: InvalidationListener) {}
}

/// Push channel from a resolver back into the cache
///
/// Holds the cache weakly; once the cache is gone, invalidations are dropped.
#[derive(Clone)]
pub struct InvalidationListener {
    cache: Weak<Shared>,
}

impl InvalidationListener {
    pub(crate) fn new(cache: Weak<Shared>) -> Self {
        Self { cache }
    }

    /// Drop the compiled artifact for `uri` and everything built on it.
    ///
    /// With `known_valid`, a registered or required URI is recompiled by the
    /// next maintenance pass instead of waiting for the next lookup.
    pub fn invalidate(&self, uri: &str, known_valid: bool) {
        if let Some(shared) = self.cache.upgrade() {
            shared.invalidate(uri, known_valid);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.cache.strong_count() > 0
    }
}

impl std::fmt::Debug for InvalidationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationListener")
            .field("connected", &self.is_connected())
            .finish()
    }
}
