//! The PositionStore - authoritative participant-id → participant map.
//!
//! Reconciles updates from many independent sources under duplicate and
//! out-of-order delivery:
//! - Last-write-wins by `last_seen` (stale-update rejection)
//! - Self-echo suppression (the local participant is only written locally)
//! - Staleness eviction after an idle window
//!
//! Readers never see live state: `snapshot()` hands out an owned copy.

use constellation_env::ParticipantId;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};
use crate::geomath::GeoPoint;
use crate::participant::{Color, Participant, PositionUpdate};

// ============================================================================
// OUTCOMES
// ============================================================================

/// Result of applying a remote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First entry for this id
    Inserted,

    /// Existing entry overwritten with different content
    Updated,

    /// Accepted, but identical to what was stored (duplicate delivery)
    Unchanged,

    /// Older than the stored entry; discarded
    Stale,

    /// Carried the local participant's id; discarded
    SelfEcho,

    /// Coordinates out of range; discarded
    Invalid,
}

impl UpsertOutcome {
    /// Whether downstream consumers (graph, renderer) need to recompute.
    pub fn changed(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Updated)
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Immutable copy of the store contents. `others` is sorted by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub self_participant: Participant,
    pub others: Vec<Participant>,
}

impl Snapshot {
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        if &self.self_participant.id == id {
            return Some(&self.self_participant);
        }
        self.others
            .binary_search_by(|p| p.id.cmp(id))
            .ok()
            .map(|idx| &self.others[idx])
    }

    /// Number of participants including self.
    pub fn participant_count(&self) -> usize {
        self.others.len() + 1
    }
}

// ============================================================================
// STORE
// ============================================================================

pub struct PositionStore {
    self_participant: Participant,
    others: HashMap<ParticipantId, Participant>,
}

impl PositionStore {
    /// Creates a store holding only the (position-less) local participant.
    pub fn new(self_id: ParticipantId, now: u64) -> Self {
        Self {
            self_participant: Participant::new(self_id, now),
            others: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> &ParticipantId {
        &self.self_participant.id
    }

    pub fn self_participant(&self) -> &Participant {
        &self.self_participant
    }

    pub fn self_position(&self) -> Option<GeoPoint> {
        self.self_participant.position
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        if id == self.self_id() {
            Some(&self.self_participant)
        } else {
            self.others.get(id)
        }
    }

    /// Number of remote participants.
    pub fn others_len(&self) -> usize {
        self.others.len()
    }

    /// Sets the local position; self is never removed.
    pub fn upsert_self(&mut self, position: GeoPoint, now: u64) {
        self.self_participant.position = Some(position);
        self.self_participant.last_seen = now;
        self.self_participant.online = true;
    }

    /// Applies a remote update under last-write-wins.
    ///
    /// Accepted iff `update.timestamp >= stored.last_seen`, or the stored
    /// entry is a presence-only placeholder without a position.
    pub fn upsert_other(&mut self, update: &PositionUpdate) -> UpsertOutcome {
        if &update.participant_id == self.self_id() {
            debug!(id = %update.participant_id, "Ignoring self echo");
            return UpsertOutcome::SelfEcho;
        }

        let position = match update.position() {
            Ok(position) => position,
            Err(_) => return UpsertOutcome::Invalid,
        };

        let existing = self.others.get(&update.participant_id);

        if let Some(stored) = existing {
            if stored.position.is_some() && update.timestamp < stored.last_seen {
                trace!(
                    id = %update.participant_id,
                    stored = stored.last_seen,
                    received = update.timestamp,
                    "Rejecting stale update"
                );
                return UpsertOutcome::Stale;
            }
        }

        let color = existing
            .map(|p| p.color.clone())
            .unwrap_or_else(|| Color::from_id(&update.participant_id));

        let next = Participant {
            id: update.participant_id.clone(),
            color,
            position: Some(position),
            last_seen: update.timestamp,
            online: update.online,
        };

        match self.others.insert(update.participant_id.clone(), next.clone()) {
            None => UpsertOutcome::Inserted,
            Some(previous) if previous == next => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        }
    }

    /// Overrides the color of a remote participant (bootstrap from identity rows).
    pub fn set_color(&mut self, id: &ParticipantId, color: Color) -> bool {
        match self.others.get_mut(id) {
            Some(p) if p.color != color => {
                p.color = color;
                true
            }
            _ => false,
        }
    }

    /// Presence join: inserts a placeholder or marks an existing entry online.
    ///
    /// `last_seen` of an existing entry is left alone so that position
    /// ordering is not disturbed by presence traffic.
    pub fn mark_present(&mut self, id: &ParticipantId, now: u64) -> bool {
        if id == self.self_id() {
            return false;
        }
        match self.others.get_mut(id) {
            Some(p) if p.online => false,
            Some(p) => {
                p.online = true;
                true
            }
            None => {
                self.others.insert(id.clone(), Participant::new(id.clone(), now));
                true
            }
        }
    }

    /// Removes a remote participant. Returns false if absent (or self).
    pub fn remove(&mut self, id: &ParticipantId) -> bool {
        self.others.remove(id).is_some()
    }

    /// Removes every remote participant with `last_seen < now - idle_window`.
    ///
    /// Returns the removed ids, sorted.
    pub fn prune_stale(&mut self, now: u64, idle_window: Duration) -> Vec<ParticipantId> {
        let cutoff = now.saturating_sub(idle_window.as_millis() as u64);

        let mut removed: Vec<ParticipantId> = self
            .others
            .iter()
            .filter(|(_, p)| p.last_seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &removed {
            self.others.remove(id);
        }

        removed.sort();
        removed
    }

    /// Drops every remote participant, returning how many were removed.
    pub fn clear_others(&mut self) -> usize {
        let count = self.others.len();
        self.others.clear();
        count
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut others: Vec<Participant> = self.others.values().cloned().collect();
        others.sort_by(|a, b| a.id.cmp(&b.id));

        Snapshot {
            self_participant: self.self_participant.clone(),
            others,
        }
    }

    /// Structural checks run after every mutation when debugging is enabled.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.others.contains_key(self.self_id()) {
            return Err(format!("self id {} present among remote participants", self.self_id()));
        }
        for (key, participant) in &self.others {
            if key != &participant.id {
                return Err(format!("entry keyed {} holds participant {}", key, participant.id));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
