// src/topology/types.rs
//! Team definitions and team-execution records

use crate::runtime::execution::AgentSpec;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One edge of a hierarchical delegation graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationEdge {
    pub from: String,
    pub to: String,
}

/// How a team's agents are composed
///
/// Tagged by `kind` in serialized form. Kinds this version does not know
/// deserialize to [`Topology::Unknown`] and fail at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    /// Each agent's output is the next agent's input
    Sequential { agents: Vec<String> },

    /// All agents receive the message concurrently
    Parallel { agents: Vec<String> },

    /// Coordinator output fans out to all workers
    Coordinator {
        coordinator: String,
        workers: Vec<String>,
    },

    /// Generate, critique, revise until the critic approves
    GeneratorCritic {
        generator: String,
        critic: String,
        #[serde(default)]
        max_iterations: Option<u32>,
    },

    /// Depth-first delegation from a lead agent
    Hierarchical {
        lead: String,
        #[serde(default)]
        edges: Vec<DelegationEdge>,
    },

    /// Sequential, pausing for approval before each gated agent
    HumanInLoop {
        agents: Vec<String>,
        #[serde(default)]
        approval_gates: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },

    /// Ordered groups of other topologies
    Composite { groups: Vec<Topology> },

    #[serde(other)]
    Unknown,
}

impl Topology {
    pub fn kind(&self) -> &'static str {
        match self {
            Topology::Sequential { .. } => "sequential",
            Topology::Parallel { .. } => "parallel",
            Topology::Coordinator { .. } => "coordinator",
            Topology::GeneratorCritic { .. } => "generator_critic",
            Topology::Hierarchical { .. } => "hierarchical",
            Topology::HumanInLoop { .. } => "human_in_loop",
            Topology::Composite { .. } => "composite",
            Topology::Unknown => "unknown",
        }
    }

    /// Check agent references and nesting against the team's members
    ///
    /// `Unknown` passes validation; it fails when the team executes.
    pub fn validate(&self, team: &TeamConfig) -> Result<()> {
        let members: HashSet<&str> = team.members.iter().map(|m| m.agent_id.as_str()).collect();
        self.validate_at(team, &members, 0)
    }

    fn validate_at(&self, team: &TeamConfig, members: &HashSet<&str>, depth: usize) -> Result<()> {
        let known = |agent_id: &str| -> Result<()> {
            if members.contains(agent_id) {
                Ok(())
            } else {
                Err(EngineError::AgentNotInTeam {
                    team_id: team.team_id.clone(),
                    agent_id: agent_id.to_string(),
                })
            }
        };
        let non_empty = |agents: &[String], what: &str| -> Result<()> {
            if agents.is_empty() {
                Err(EngineError::InvalidTopology(format!(
                    "{} topology of team {} has no {}",
                    self.kind(),
                    team.team_id,
                    what
                )))
            } else {
                Ok(())
            }
        };

        match self {
            Topology::Sequential { agents } | Topology::Parallel { agents } => {
                non_empty(agents.as_slice(), "agents")?;
                agents.iter().try_for_each(|a| known(a.as_str()))
            }
            Topology::Coordinator {
                coordinator,
                workers,
            } => {
                known(coordinator.as_str())?;
                non_empty(workers.as_slice(), "workers")?;
                workers.iter().try_for_each(|a| known(a.as_str()))
            }
            Topology::GeneratorCritic {
                generator,
                critic,
                max_iterations,
            } => {
                known(generator.as_str())?;
                known(critic.as_str())?;
                if *max_iterations == Some(0) {
                    return Err(EngineError::InvalidTopology(
                        "generator_critic max_iterations must be at least 1".into(),
                    ));
                }
                Ok(())
            }
            Topology::Hierarchical { lead, edges } => {
                known(lead.as_str())?;
                edges.iter().try_for_each(|edge| {
                    known(edge.from.as_str())?;
                    known(edge.to.as_str())
                })
            }
            Topology::HumanInLoop {
                agents,
                approval_gates,
                ..
            } => {
                non_empty(agents.as_slice(), "agents")?;
                agents.iter().try_for_each(|a| known(a.as_str()))?;
                match approval_gates.iter().find(|g| !agents.contains(*g)) {
                    Some(gate) => Err(EngineError::InvalidTopology(format!(
                        "approval gate {} is not in the agent list",
                        gate
                    ))),
                    None => Ok(()),
                }
            }
            Topology::Composite { groups } => {
                if depth > 0 {
                    return Err(EngineError::InvalidTopology(
                        "composite topologies cannot be nested".into(),
                    ));
                }
                if groups.is_empty() {
                    return Err(EngineError::InvalidTopology(format!(
                        "composite topology of team {} has no groups",
                        team.team_id
                    )));
                }
                groups
                    .iter()
                    .try_for_each(|group| group.validate_at(team, members, depth + 1))
            }
            Topology::Unknown => Ok(()),
        }
    }
}

/// A team as read from the team directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamConfig {
    pub team_id: String,

    #[serde(default)]
    pub members: Vec<AgentSpec>,

    pub topology: Topology,
}

impl TeamConfig {
    pub fn member(&self, agent_id: &str) -> Option<&AgentSpec> {
        self.members.iter().find(|m| m.agent_id == agent_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    Running,
    Completed,
    Failed,
    PendingApproval,
    ApprovalTimeout,
}

impl TeamExecution {
    pub fn start(team_exec_id: String, team_id: &str, topology: &Topology) -> Self {
        Self {
            team_exec_id,
            team_id: team_id.to_string(),
            topology: topology.kind().to_string(),
            status: TeamStatus::Running,
            children: vec![],
            awaiting_agent: None,
            approval_deadline: None,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

impl TeamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamStatus::Running => "running",
            TeamStatus::Completed => "completed",
            TeamStatus::Failed => "failed",
            TeamStatus::PendingApproval => "pending_approval",
            TeamStatus::ApprovalTimeout => "approval_timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TeamStatus::Completed | TeamStatus::Failed | TeamStatus::ApprovalTimeout
        )
    }
}

/// Tracking record for one team run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamExecution {
    pub team_exec_id: String,
    pub team_id: String,
    pub topology: String,
    pub status: TeamStatus,

    /// Child execution ids in dispatch order
    pub children: Vec<String>,

    pub awaiting_agent: Option<String>,
    pub approval_deadline: Option<DateTime<Utc>>,

    /// Output of the last agent, once the team completes
    #[serde(default)]
    pub output: Option<String>,

    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What to hand to the next agent when an agent produced no output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyOutputPolicy {
    /// Pass the previous input along instead
    #[default]
    FallbackToInput,
    /// Fail the team execution
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::backend::BackendType;

    fn team(topology: Topology) -> TeamConfig {
        TeamConfig {
            team_id: "t".into(),
            members: ["a", "b", "c"]
                .iter()
                .map(|id| AgentSpec::new(*id, BackendType::Claude))
                .collect(),
            topology,
        }
    }

    fn agents(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unknown_member_rejected() {
        let config = team(Topology::Sequential {
            agents: agents(&["a", "z"]),
        });
        let err = config.topology.validate(&config).unwrap_err();
        assert!(matches!(err, EngineError::AgentNotInTeam { ref agent_id, .. } if agent_id == "z"));
    }

    #[test]
    fn test_nested_composite_rejected() {
        let config = team(Topology::Composite {
            groups: vec![
                Topology::Sequential { agents: agents(&["a"]) },
                Topology::Composite {
                    groups: vec![Topology::Parallel { agents: agents(&["b"]) }],
                },
            ],
        });
        assert!(matches!(
            config.topology.validate(&config),
            Err(EngineError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_gate_must_be_in_agent_list() {
        let config = team(Topology::HumanInLoop {
            agents: agents(&["a", "b"]),
            approval_gates: agents(&["c"]),
            timeout_secs: None,
        });
        assert!(config.topology.validate(&config).is_err());
    }

    #[test]
    fn test_topology_deserializes_by_kind() {
        let topology: Topology = serde_json::from_str(
            r#"{"kind":"generator_critic","generator":"a","critic":"b"}"#,
        )
        .unwrap();
        assert_eq!(
            topology,
            Topology::GeneratorCritic {
                generator: "a".into(),
                critic: "b".into(),
                max_iterations: None,
            }
        );

        let unknown: Topology = serde_json::from_str(r#"{"kind":"swarm"}"#).unwrap();
        assert_eq!(unknown, Topology::Unknown);
        let config = team(unknown);
        assert!(config.topology.validate(&config).is_ok());
    }
}
