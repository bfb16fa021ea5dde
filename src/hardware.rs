//! Acceleration promotion.
//!
//! Artifacts move `Ineligible -> PendingPromotion -> Eligible` and fall back
//! to `Ineligible` on demotion. Promotions are queued and loaded into the
//! acceleration engine in debounced batches, since a reload replaces the
//! engine's whole resident set.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crate::acceleration::{AccelerationEngine, ResidentSchema};
use crate::artifact::{ArtifactId, CompiledArtifact, HardwareState};
use crate::cache::{CacheState, SchemaCache};
use crate::config::HardwareConfig;

/// Accelerator and timestamp for one locked operation
pub(crate) struct Promoter<'a> {
    pub(crate) accelerator: &'a dyn AccelerationEngine,
    pub(crate) now: u64,
}

/// Artifacts waiting for the next reload, plus debounce timestamps
#[derive(Debug, Default)]
pub(crate) struct HardwareQueue {
    pending: HashMap<ArtifactId, Weak<CompiledArtifact>>,
    first_pending_at: Option<u64>,
    last_pending_at: Option<u64>,
    last_reload_at: Option<u64>,
    /// An eligible artifact was demoted; the resident set is stale
    dirty: bool,
}

impl HardwareQueue {
    fn touch(&mut self, now: u64) {
        self.first_pending_at.get_or_insert(now);
        self.last_pending_at = Some(now);
    }

    pub(crate) fn enqueue(&mut self, artifact: &Arc<CompiledArtifact>, now: u64) {
        self.pending.insert(artifact.id(), Arc::downgrade(artifact));
        self.touch(now);
    }

    pub(crate) fn remove(&mut self, id: ArtifactId) {
        self.pending.remove(&id);
    }

    pub(crate) fn mark_dirty(&mut self, now: u64) {
        self.dirty = true;
        self.touch(now);
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn should_reload_now(&self, now: u64, config: &HardwareConfig) -> bool {
        if self.pending.is_empty() && !self.dirty {
            return false;
        }
        if let Some(last_reload) = self.last_reload_at {
            if now.saturating_sub(last_reload) < config.latency_ms {
                return false;
            }
        }
        let quiet = self
            .last_pending_at
            .is_none_or(|last| now.saturating_sub(last) >= config.min_age_ms);
        let overdue = self
            .first_pending_at
            .is_some_and(|first| now.saturating_sub(first) >= config.max_age_ms);
        quiet || overdue
    }

    fn finish_reload(&mut self, now: u64) -> Vec<Arc<CompiledArtifact>> {
        self.first_pending_at = None;
        self.last_pending_at = None;
        self.last_reload_at = Some(now);
        self.dirty = false;
        self.pending
            .drain()
            .filter_map(|(_, artifact)| artifact.upgrade())
            .collect()
    }
}

/// What one reload batch did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub resident: usize,
    pub promoted: usize,
    pub rejected: usize,
}

impl CacheState {
    /// Settle conflicts in `namespace` and promote or demote its members
    pub(crate) fn recheck_namespace(&mut self, namespace: &str, promoter: &Promoter<'_>) {
        let members: Vec<Arc<CompiledArtifact>> = match self.tns_index.get_mut(namespace) {
            Some(members) => {
                members.retain(|_, artifact| {
                    artifact.upgrade().is_some_and(|a| !a.is_closed())
                });
                members.values().filter_map(Weak::upgrade).collect()
            }
            None => return,
        };
        if members.is_empty() {
            self.tns_index.remove(namespace);
            return;
        }

        // A superseded instance still held by callers counts as a claimant until
        // its last handle closes
        let claimants: Vec<&Arc<CompiledArtifact>> =
            members.iter().filter(|a| !a.is_include_only()).collect();

        if claimants.len() >= 2 {
            for claimant in &claimants {
                if claimant.set_conflicting(true) {
                    info!(
                        namespace = %namespace,
                        uri = %claimant.system_id(),
                        claimants = claimants.len(),
                        "Target namespace conflict"
                    );
                }
                self.demote(claimant, promoter.now, &mut HashSet::new());
            }
            for member in members.iter().filter(|a| a.is_include_only()) {
                member.set_conflicting(false);
                self.withdraw(member, promoter.now);
            }
            return;
        }

        for member in &members {
            if member.set_conflicting(false) {
                info!(namespace = %namespace, uri = %member.system_id(), "Target namespace conflict cleared");
            }
        }
        for member in &members {
            if member.is_include_only() {
                self.withdraw(member, promoter.now);
            } else {
                self.attempt_promotion(member, promoter);
            }
        }
    }

    /// Take an include-only artifact out of the resident set; its includers are unaffected
    fn withdraw(&mut self, artifact: &Arc<CompiledArtifact>, now: u64) {
        self.hardware.remove(artifact.id());
        if artifact.set_hardware_state(HardwareState::Ineligible) == HardwareState::Eligible {
            self.hardware.mark_dirty(now);
        }
    }

    /// Move `artifact` towards `Eligible` if nothing stands in the way
    pub(crate) fn attempt_promotion(
        &mut self,
        artifact: &Arc<CompiledArtifact>,
        promoter: &Promoter<'_>,
    ) -> bool {
        self.attempt_promotion_from(artifact, promoter, &mut HashSet::new())
    }

    fn attempt_promotion_from(
        &mut self,
        artifact: &Arc<CompiledArtifact>,
        promoter: &Promoter<'_>,
        visiting: &mut HashSet<ArtifactId>,
    ) -> bool {
        match artifact.hardware_state() {
            HardwareState::Eligible | HardwareState::PendingPromotion => return true,
            HardwareState::Ineligible => {}
        }
        if !promoter.accelerator.is_available()
            || artifact.is_closed()
            || artifact.is_conflicting()
            || artifact.is_rejected()
            || artifact.target_namespace().is_none()
            || artifact.is_include_only()
        {
            return false;
        }
        if !visiting.insert(artifact.id()) {
            return false;
        }

        let mut imports_ready = true;
        for dependency in artifact.import_artifacts() {
            self.attempt_promotion_from(&dependency, promoter, visiting);
            if dependency.hardware_state() != HardwareState::Eligible {
                imports_ready = false;
            }
        }
        if !imports_ready {
            return false;
        }

        let Some(schema) = artifact.resident_schema() else {
            return false;
        };
        if let Err(reason) = promoter.accelerator.check(&schema) {
            warn!(uri = %artifact.system_id(), reason = %reason, "Acceleration engine rejected schema");
            artifact.set_rejected();
            return false;
        }

        artifact.set_hardware_state(HardwareState::PendingPromotion);
        self.hardware.enqueue(artifact, promoter.now);
        debug!(uri = %artifact.system_id(), id = %artifact.id(), "Schema pending promotion");
        true
    }

    /// Drop `artifact` and everything that depends on it back to `Ineligible`
    pub(crate) fn demote(
        &mut self,
        artifact: &Arc<CompiledArtifact>,
        now: u64,
        visited: &mut HashSet<ArtifactId>,
    ) {
        if !visited.insert(artifact.id()) {
            return;
        }
        let previous = artifact.set_hardware_state(HardwareState::Ineligible);
        self.hardware.remove(artifact.id());
        match previous {
            HardwareState::Eligible => {
                debug!(uri = %artifact.system_id(), "Schema demoted from acceleration");
                self.hardware.mark_dirty(now);
            }
            HardwareState::PendingPromotion => {
                debug!(uri = %artifact.system_id(), "Pending promotion withdrawn");
            }
            HardwareState::Ineligible => {}
        }
        for (parent, _) in artifact.live_exporters() {
            self.demote(&parent, now, visited);
        }
    }

    /// Load the current resident set into the acceleration engine
    pub(crate) fn reload_hardware(&mut self, promoter: &Promoter<'_>) -> ReloadSummary {
        let universe: Vec<Arc<CompiledArtifact>> = self
            .tns_index
            .values()
            .flat_map(|members| members.values().filter_map(Weak::upgrade))
            .filter(|a| {
                !a.is_closed()
                    && matches!(
                        a.hardware_state(),
                        HardwareState::PendingPromotion | HardwareState::Eligible
                    )
            })
            .collect();

        let ordered = dependencies_first(universe);
        let resident: Vec<ResidentSchema> =
            ordered.iter().filter_map(|a| a.resident_schema()).collect();
        let failures = promoter.accelerator.set_resident_set(&resident);
        let pending = self.hardware.finish_reload(promoter.now);

        let mut summary = ReloadSummary {
            resident: resident.len(),
            ..ReloadSummary::default()
        };

        let mut demoted = HashSet::new();
        for artifact in &ordered {
            if let Some(reason) = failures.get(&artifact.id()) {
                warn!(uri = %artifact.system_id(), reason = %reason, "Acceleration engine rejected schema");
                artifact.set_rejected();
                self.demote(artifact, promoter.now, &mut demoted);
                summary.rejected += 1;
            }
        }

        let mut promoted = Vec::new();
        for artifact in pending {
            if artifact.hardware_state() == HardwareState::PendingPromotion {
                artifact.set_hardware_state(HardwareState::Eligible);
                promoted.push(artifact);
            }
        }
        summary.promoted = promoted.len();

        info!(
            resident = summary.resident,
            promoted = summary.promoted,
            rejected = summary.rejected,
            "Acceleration engine reloaded"
        );

        for artifact in &promoted {
            for (parent, _) in artifact.live_exporters() {
                self.attempt_promotion(&parent, promoter);
            }
        }
        summary
    }
}

/// Order artifacts so every import precedes its importer
fn dependencies_first(artifacts: Vec<Arc<CompiledArtifact>>) -> Vec<Arc<CompiledArtifact>> {
    fn visit(
        artifact: &Arc<CompiledArtifact>,
        members: &HashSet<ArtifactId>,
        done: &mut HashSet<ArtifactId>,
        ordered: &mut Vec<Arc<CompiledArtifact>>,
    ) {
        if !done.insert(artifact.id()) {
            return;
        }
        for dependency in artifact.import_artifacts() {
            if members.contains(&dependency.id()) {
                visit(&dependency, members, done, ordered);
            }
        }
        ordered.push(artifact.clone());
    }

    let members: HashSet<ArtifactId> = artifacts.iter().map(|a| a.id()).collect();
    let mut sorted = artifacts;
    sorted.sort_by_key(|a| a.id());

    let mut done = HashSet::new();
    let mut ordered = Vec::with_capacity(sorted.len());
    for artifact in &sorted {
        visit(artifact, &members, &mut done, &mut ordered);
    }
    ordered
}

impl SchemaCache {
    /// Run a reload batch if the debounce window allows it
    pub fn maybe_reload_hardware(&self) -> bool {
        let hardware = self.shared.runtime().config.hardware.clone();
        let promoter = self.shared.promoter();
        self.shared.with_write(|state| {
            if !state.hardware.should_reload_now(promoter.now, &hardware) {
                return false;
            }
            state.reload_hardware(&promoter);
            true
        })
    }

    /// Reload immediately, ignoring the debounce window
    pub fn reload_hardware(&self) -> ReloadSummary {
        let promoter = self.shared.promoter();
        self.shared
            .with_write(|state| state.reload_hardware(&promoter))
    }

    /// Artifacts waiting for the next reload
    pub fn pending_promotions(&self) -> usize {
        self.shared.with_read(|state| state.hardware.pending_len())
    }
}
