//! The ProximityGraphBuilder - ranked, capped "constellation" edges.
//!
//! Builds the graph from an immutable `Snapshot` in three stages:
//! 1. Distance gating: every placeable participant within `max_distance` of self
//! 2. Ranking: ascending distance, ties broken by participant id, capped at `max_connections`
//! 3. Secondary pairs: neighbor-to-neighbor links shorter than `max_distance * secondary_factor`
//!
//! The graph is recomputed from scratch on every store change. Adding one
//! closer participant can evict another from the top-k, so there is no
//! incremental path; k is small and the full rebuild is cheap.

use constellation_env::ParticipantId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use crate::config::GraphConfig;
use crate::geomath::{distance_m, GeoPoint};
use crate::position_store::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// self → neighbor
    Primary,

    /// neighbor → neighbor, both primary-selected
    Secondary,
}

/// A derived, never-persisted graph edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub distance_m: f64,

    /// 0-based position within its edge list
    pub rank: usize,

    pub kind: EdgeKind,
}

/// Output of one build: both edge lists, in deterministic order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstellationEdges {
    pub primary: Vec<Edge>,
    pub secondary: Vec<Edge>,
}

impl ConstellationEdges {
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty()
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.secondary.len()
    }

    /// Ids of the primary-selected neighbors, in rank order.
    pub fn neighbors(&self) -> impl Iterator<Item = &ParticipantId> {
        self.primary.iter().map(|e| &e.to)
    }
}

#[derive(Debug, Clone)]
pub struct ProximityGraphBuilder {
    secondary_factor: f64,
}

impl Default for ProximityGraphBuilder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SECONDARY_FACTOR)
    }
}

impl ProximityGraphBuilder {
    pub const DEFAULT_SECONDARY_FACTOR: f64 = 0.8;

    pub fn new(secondary_factor: f64) -> Self {
        Self { secondary_factor }
    }

    pub fn from_config(config: &GraphConfig) -> Self {
        Self::new(config.secondary_factor)
    }

    pub fn secondary_factor(&self) -> f64 {
        self.secondary_factor
    }

    /// Builds primary and secondary edges for `snapshot`.
    ///
    /// Never fails: participants without a position, or offline, are skipped.
    pub fn build(
        &self,
        snapshot: &Snapshot,
        max_distance_m: f64,
        max_connections: usize,
    ) -> ConstellationEdges {
        let origin = match snapshot.self_participant.position {
            Some(position) => position,
            None => return ConstellationEdges::default(),
        };
        if snapshot.others.is_empty() || max_connections == 0 {
            return ConstellationEdges::default();
        }

        // Stage 1: gate by distance
        let mut candidates: Vec<(&ParticipantId, GeoPoint, f64)> = snapshot
            .others
            .iter()
            .filter(|p| p.online)
            .filter_map(|p| p.position.map(|pos| (&p.id, pos)))
            .map(|(id, pos)| (id, pos, distance_m(&origin, &pos)))
            .filter(|(_, _, d)| *d < max_distance_m)
            .collect();

        // Stage 2: rank
        candidates.sort_by(|a, b| match a.2.total_cmp(&b.2) {
            Ordering::Equal => a.0.cmp(b.0),
            other => other,
        });
        candidates.truncate(max_connections);

        let self_id = &snapshot.self_participant.id;
        let primary: Vec<Edge> = candidates
            .iter()
            .enumerate()
            .map(|(rank, (id, _, d))| Edge {
                from: self_id.clone(),
                to: (*id).clone(),
                distance_m: *d,
                rank,
                kind: EdgeKind::Primary,
            })
            .collect();

        // Stage 3: neighbor pairs, bounded by k², not by participant count
        let threshold = max_distance_m * self.secondary_factor;
        let mut secondary = Vec::new();
        for i in 0..candidates.len() {
            for j in (i + 1)..candidates.len() {
                let (a_id, a_pos, _) = &candidates[i];
                let (b_id, b_pos, _) = &candidates[j];
                let d = distance_m(a_pos, b_pos);
                if d < threshold {
                    secondary.push(Edge {
                        from: (*a_id).clone(),
                        to: (*b_id).clone(),
                        distance_m: d,
                        rank: secondary.len(),
                        kind: EdgeKind::Secondary,
                    });
                }
            }
        }

        ConstellationEdges { primary, secondary }
    }

    /// Convenience wrapper reading limits from configuration.
    pub fn build_with(&self, snapshot: &Snapshot, config: &GraphConfig) -> ConstellationEdges {
        self.build(snapshot, config.max_distance_m, config.max_connections)
    }
}

// ============================================================================
// TESTS
// ============================================================================
