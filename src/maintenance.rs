//! Periodic upkeep: usage sweep, eviction, refresh, cascade and rewarm.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{Level, debug, enabled, trace, warn};

use crate::cache::{CacheState, REGISTERED_RESOLVER_ID, SchemaCache};
use crate::config::ConfigManager;
use crate::source::RefreshOutcome;

/// What one maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Entries dropped to get back under the size budget
    pub evicted: usize,
    /// Idle transient entries dropped for claiming a contested namespace
    pub stale_conflicts_evicted: usize,
    /// URIs re-checked with their resolver
    pub refreshed: usize,
    /// Entries dropped because they or a dependency changed
    pub invalidated: usize,
    /// Required URIs recompiled eagerly
    pub rewarmed: usize,
    /// Entries left after the pass
    pub entries: usize,
}

impl CacheState {
    /// LRU eviction of transient entries beyond `max_entries` plus the registered count
    pub(crate) fn evict_over_budget(&mut self, max_entries: usize) -> usize {
        let budget = max_entries + self.registered.len();
        let excess = self.by_system_id.len().saturating_sub(budget);
        if excess == 0 {
            return 0;
        }

        let mut candidates: Vec<(bool, u64, String)> = self
            .by_system_id
            .iter()
            .map(|(uri, handle)| (uri, handle.shared_artifact()))
            .filter(|(_, artifact)| artifact.is_transiently_referenced())
            .map(|(uri, artifact)| (artifact.ref_count() > 1, artifact.last_used(), uri.clone()))
            .collect();
        candidates.sort();

        let mut evicted = 0;
        for (referenced, last_used, uri) in candidates.into_iter().take(excess) {
            debug!(uri = %uri, referenced, last_used, "Evicting schema over cache budget");
            if self.evict_uri(&uri) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Drop transient entries stuck in a namespace conflict for longer than `max_stale_age_ms`
    pub(crate) fn evict_idle_conflicts(&mut self, now: u64, max_stale_age_ms: u64) -> usize {
        let stale: Vec<String> = self
            .by_system_id
            .iter()
            .filter(|(_, handle)| {
                let artifact = handle.shared_artifact();
                artifact.is_conflicting()
                    && artifact.is_transiently_referenced()
                    && now.saturating_sub(artifact.last_used()) > max_stale_age_ms
            })
            .map(|(uri, _)| uri.clone())
            .collect();

        let mut evicted = 0;
        for uri in stale {
            debug!(uri = %uri, "Evicting idle schema with conflicting target namespace");
            if self.evict_uri(&uri) {
                evicted += 1;
            }
        }
        evicted
    }
}

impl SchemaCache {
    /// One maintenance pass. The cache lock is never held across a resolver call.
    pub async fn maintain(&self) -> MaintenanceReport {
        let shared = &self.shared;
        let mut report = MaintenanceReport::default();

        shared.drain_deferred();
        for artifact in shared.take_usage() {
            artifact.propagate_last_used();
        }

        let config = shared.runtime().config.clone();
        let now = shared.clock.now_millis();
        shared.with_write(|state| {
            report.evicted = state.evict_over_budget(config.cache.max_entries);
            report.stale_conflicts_evicted =
                state.evict_idle_conflicts(now, config.cache.max_stale_age_ms);
        });

        let origins: Vec<(String, String)> = shared.with_read(|state| {
            state
                .by_system_id
                .iter()
                .map(|(uri, handle)| (uri.clone(), handle.shared_artifact().source_resolver_id().to_string()))
                .filter(|(_, resolver_id)| resolver_id != REGISTERED_RESOLVER_ID)
                .collect()
        });
        for (uri, resolver_id) in origins {
            let Some(resolver) = shared.resolver(&resolver_id) else {
                continue;
            };
            report.refreshed += 1;
            match resolver.refresh(&uri).await {
                Ok(RefreshOutcome::Unchanged) => {}
                Ok(outcome) => {
                    debug!(uri = %uri, outcome = ?outcome, "Schema source changed");
                    if shared.with_write(|state| state.invalidate_uri(&uri)) {
                        report.invalidated += 1;
                    }
                }
                Err(error) => {
                    warn!(uri = %uri, resolver = %resolver_id, error = %error, "Schema refresh failed");
                }
            }
        }

        report.invalidated += shared.with_write(|state| state.invalidate_parents_of_superseded());

        let rewarm: Vec<String> = shared.with_write(|state| {
            let queued = std::mem::take(&mut state.rewarm);
            queued
                .into_iter()
                .filter(|uri| state.is_required(uri))
                .collect()
        });
        for uri in rewarm {
            match self.get_by_uri(&uri).await {
                Ok(_handle) => report.rewarmed += 1,
                Err(error) => {
                    warn!(uri = %uri, error = %error, "Eager recompile of required schema failed");
                }
            }
        }

        report.entries = self.len();
        debug!(
            evicted = report.evicted,
            stale_conflicts_evicted = report.stale_conflicts_evicted,
            refreshed = report.refreshed,
            invalidated = report.invalidated,
            rewarmed = report.rewarmed,
            entries = report.entries,
            "Schema cache maintenance finished"
        );
        if enabled!(Level::TRACE) {
            trace!("Schema cache contents:\n{}", self.report());
        }
        report
    }
}

/// Background task running [`SchemaCache::maintain`] and hardware reload checks
pub struct MaintenanceScheduler {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl MaintenanceScheduler {
    /// Start the task on the current tokio runtime
    pub fn spawn(cache: SchemaCache) -> Self {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let task = tokio::spawn(async move {
            let config = cache.config();
            let mut maintenance = interval(ConfigManager::get_maintenance_interval(&config));
            maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut hardware = interval(ConfigManager::get_hardware_check_interval(&config));
            hardware.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // Both intervals fire immediately; skip that
            maintenance.tick().await;
            hardware.tick().await;

            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = maintenance.tick() => {
                        cache.maintain().await;
                    }
                    _ = hardware.tick() => {
                        cache.maybe_reload_hardware();
                    }
                }
            }
            debug!("Schema cache maintenance stopped");
        });

        Self { shutdown, task }
    }

    /// Stop the task and wait for it
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(error) = self.task.await {
            warn!(error = %error, "Schema cache maintenance task failed");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
