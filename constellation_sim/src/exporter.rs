//! JSON exporter for simulation runs.
//!
//! Exports each session's view, frame by frame, so a renderer can replay
//! how the constellation formed.

use constellation_core::{ConnectionState, ConstellationEdges, EdgeKind, Snapshot};
use constellation_env::ParticipantId;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// All sessions' views at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    pub step: u64,

    /// Simulation time in seconds
    pub time_sec: f64,

    pub views: Vec<ViewFrame>,

    /// Injected faults and lifecycle changes since the previous frame
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<SimEvent>,
}

/// One session's rendered view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewFrame {
    pub observer: ParticipantId,
    pub status: String,
    pub participants: Vec<ParticipantFrame>,
    pub edges: Vec<EdgeFrame>,
}

impl ViewFrame {
    pub fn capture(
        observer: &ParticipantId,
        status: ConnectionState,
        snapshot: &Snapshot,
        edges: &ConstellationEdges,
    ) -> Self {
        let participants = std::iter::once((&snapshot.self_participant, true))
            .chain(snapshot.others.iter().map(|p| (p, false)))
            .filter_map(|(p, is_self)| {
                p.position.map(|position| ParticipantFrame {
                    id: p.id.clone(),
                    lat: position.lat,
                    lng: position.lng,
                    color: p.color.as_str().to_string(),
                    online: p.online,
                    is_self,
                })
            })
            .collect();

        let edges = edges
            .primary
            .iter()
            .chain(edges.secondary.iter())
            .map(|e| EdgeFrame {
                from: e.from.clone(),
                to: e.to.clone(),
                distance_m: e.distance_m,
                rank: e.rank,
                kind: e.kind,
            })
            .collect();

        Self {
            observer: observer.clone(),
            status: status.to_string(),
            participants,
            edges,
        }
    }
}

/// Participant with a known position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantFrame {
    pub id: ParticipantId,
    pub lat: f64,
    pub lng: f64,
    pub color: String,
    pub online: bool,
    pub is_self: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeFrame {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub distance_m: f64,
    pub rank: usize,
    pub kind: EdgeKind,
}

/// Simulation event (partition, disconnect, etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub scenario: String,
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    pub frames: Vec<SimFrame>,
    pub passed: bool,
}

impl SimExport {
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
        }
    }

    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    pub fn finalize(&mut self, passed: bool) {
        self.passed = passed;
    }

    /// Writes pretty-printed JSON to `path`.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
