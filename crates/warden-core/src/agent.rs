//! Agent state types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of the agent, owned by the reconciliation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Init,
    Applying,
    Connected,
    Disconnected,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Init => "INIT",
            AgentState::Applying => "APPLYING",
            AgentState::Connected => "CONNECTED",
            AgentState::Disconnected => "DISCONNECTED",
            AgentState::Error => "ERROR",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link state as reported by a backend status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObservedState {
    Connected,
    Disconnected,
}

impl ObservedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservedState::Connected => "CONNECTED",
            ObservedState::Disconnected => "DISCONNECTED",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ObservedState::Connected)
    }
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObservedState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONNECTED" => Ok(ObservedState::Connected),
            "DISCONNECTED" => Ok(ObservedState::Disconnected),
            other => Err(format!("unknown link status '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_state_serializes_upper_case() {
        let json = serde_json::to_string(&AgentState::Disconnected).unwrap();
        assert_eq!(json, "\"DISCONNECTED\"");
        assert_eq!(AgentState::Applying.to_string(), "APPLYING");
    }

    #[test]
    fn observed_state_parses_case_insensitively() {
        assert_eq!(
            "connected".parse::<ObservedState>().unwrap(),
            ObservedState::Connected
        );
        assert_eq!(
            " DISCONNECTED\n".parse::<ObservedState>().unwrap(),
            ObservedState::Disconnected
        );
        assert!("UNKNOWN".parse::<ObservedState>().is_err());
    }
}
