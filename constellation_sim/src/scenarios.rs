//! Fault-injection scenarios for the sync engine.

use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Participants gather and build their constellation over a clean network
    Rendezvous,

    /// A participant joins late and must see everyone from the durable store
    LateJoiner,

    /// Loss, duplication, reordering and write failures, then recovery
    FlakyNetwork,

    /// One host runs bots; observers track them; cleanup leaves no rows
    BotSwarm,

    /// A partitioned participant is evicted after the idle window and returns on heal
    StaleEviction,

    /// A dropped connection clears the view; reconnecting restores it
    Reconnect,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Rendezvous,
            ScenarioId::LateJoiner,
            ScenarioId::FlakyNetwork,
            ScenarioId::BotSwarm,
            ScenarioId::StaleEviction,
            ScenarioId::Reconnect,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Rendezvous => "rendezvous",
            ScenarioId::LateJoiner => "late_joiner",
            ScenarioId::FlakyNetwork => "flaky_network",
            ScenarioId::BotSwarm => "bot_swarm",
            ScenarioId::StaleEviction => "stale_eviction",
            ScenarioId::Reconnect => "reconnect",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Rendezvous => "Walkers connect on a clean network; every view matches ground truth",
            ScenarioId::LateJoiner => "Late participant sees everyone from bootstrap before any heartbeat",
            ScenarioId::FlakyNetwork => "30% loss, duplication, reordering and failed writes; views recover once calm",
            ScenarioId::BotSwarm => "Host drives 8 bots; observers track them; dispose removes every bot row",
            ScenarioId::StaleEviction => "Partitioned participant pruned after the idle window, rediscovered on heal",
            ScenarioId::Reconnect => "Dropped connection clears the view; reconnect re-bootstraps and converges",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "rendezvous" => Ok(ScenarioId::Rendezvous),
            "late_joiner" | "latejoiner" => Ok(ScenarioId::LateJoiner),
            "flaky_network" | "flakynetwork" | "flaky" => Ok(ScenarioId::FlakyNetwork),
            "bot_swarm" | "botswarm" | "bots" => Ok(ScenarioId::BotSwarm),
            "stale_eviction" | "staleeviction" => Ok(ScenarioId::StaleEviction),
            "reconnect" => Ok(ScenarioId::Reconnect),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("Late-Joiner".parse::<ScenarioId>(), Ok(ScenarioId::LateJoiner));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
