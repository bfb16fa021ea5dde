//! Cache statistics and a human-readable dump of the cache contents.

use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

use serde::Serialize;

use crate::artifact::{ArtifactId, CompiledArtifact, EdgeKind, HardwareState};
use crate::cache::SchemaCache;

/// Point-in-time counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub registered: usize,
    pub required: usize,
    pub namespaces: usize,
    pub conflicting: usize,
    pub pending: usize,
    pub eligible: usize,
}

impl SchemaCache {
    pub fn stats(&self) -> CacheStats {
        self.shared.with_read(|state| {
            let artifacts: Vec<&Arc<CompiledArtifact>> = state
                .by_system_id
                .values()
                .map(|handle| handle.shared_artifact())
                .collect();
            let required: HashSet<&String> = state
                .registered
                .keys()
                .chain(state.interest.keys())
                .collect();
            CacheStats {
                entries: artifacts.len(),
                registered: state.registered.len(),
                required: required.len(),
                namespaces: state.tns_index.len(),
                conflicting: artifacts.iter().filter(|a| a.is_conflicting()).count(),
                pending: state.hardware.pending_len(),
                eligible: artifacts
                    .iter()
                    .filter(|a| a.hardware_state() == HardwareState::Eligible)
                    .count(),
            }
        })
    }

    /// Every cached root with its dependency tree, one artifact per line
    pub fn report(&self) -> String {
        let roots: Vec<Arc<CompiledArtifact>> = self.shared.with_read(|state| {
            let mut roots: Vec<Arc<CompiledArtifact>> = state
                .by_system_id
                .values()
                .map(|handle| handle.shared_artifact().clone())
                .filter(|artifact| artifact.live_exporters().is_empty())
                .collect();
            roots.sort_by(|a, b| a.system_id().cmp(b.system_id()));
            roots
        });

        let mut output = String::new();
        for root in &roots {
            let mut path = HashSet::new();
            render(&mut output, root, None, 0, &mut path);
        }
        if output.is_empty() {
            output.push_str("(empty)\n");
        }
        output
    }
}

fn render(
    output: &mut String,
    artifact: &Arc<CompiledArtifact>,
    edge: Option<EdgeKind>,
    depth: usize,
    path: &mut HashSet<ArtifactId>,
) {
    let indent = "  ".repeat(depth);
    let edge = match edge {
        Some(EdgeKind::Import) => "import ",
        Some(EdgeKind::Include) => "include ",
        None => "",
    };
    let _ = writeln!(
        output,
        "{}{}{} {}{}",
        indent,
        edge,
        artifact.system_id(),
        artifact.id(),
        markers(artifact)
    );

    if !path.insert(artifact.id()) {
        return;
    }
    for (kind, dependency) in artifact.dependency_edges() {
        render(output, &dependency, Some(kind), depth + 1, path);
    }
    path.remove(&artifact.id());
}

fn markers(artifact: &CompiledArtifact) -> String {
    let mut markers = Vec::new();
    if let Some(namespace) = artifact.target_namespace() {
        markers.push(format!("tns={}", namespace));
    }
    match artifact.hardware_state() {
        HardwareState::Eligible => markers.push("eligible".to_string()),
        HardwareState::PendingPromotion => markers.push("pending".to_string()),
        HardwareState::Ineligible => {}
    }
    if artifact.is_conflicting() {
        markers.push("conflicting".to_string());
    }
    if artifact.is_rejected() {
        markers.push("rejected".to_string());
    }
    if artifact.is_transient() {
        markers.push("transient".to_string());
    }
    if markers.is_empty() {
        String::new()
    } else {
        format!(" [{}]", markers.join(", "))
    }
}
