// src/topology/engine.rs
//! Team execution: validate, track, run the strategy in the background

use crate::collaborators::{ExecutionStore, TeamDirectory};
use crate::topology::runner::{AgentRunner, TeamRunContext};
use crate::topology::strategies::{self, StrategyContext};
use crate::topology::tracker::TeamTracker;
use crate::topology::types::TeamExecution;
use crate::utils::config::TopologyConfig;
use crate::utils::errors::{EngineError, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

pub struct TopologyEngine {
    config: TopologyConfig,
    runner: Arc<dyn AgentRunner>,
    teams: Arc<dyn TeamDirectory>,
    tracker: Arc<TeamTracker>,
}

impl TopologyEngine {
    pub fn new(
        config: TopologyConfig,
        runner: Arc<dyn AgentRunner>,
        teams: Arc<dyn TeamDirectory>,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let tracker = Arc::new(TeamTracker::new(store, config.gc_delay()));
        Self {
            config,
            runner,
            teams,
            tracker,
        }
    }

    /// Start a team run and return its tracking id
    ///
    /// Lookup and validation errors are returned here. Anything that goes
    /// wrong once the strategy is running lands on the tracking record as
    /// `failed`.
    pub fn execute_team(&self, team_id: &str, message: &str, event_context: Option<Value>) -> Result<String> {
        let team = self
            .teams
            .team(team_id)
            .ok_or_else(|| EngineError::TeamNotFound(team_id.to_string()))?;
        team.topology.validate(&team)?;

        let handle = Handle::try_current()
            .map_err(|e| EngineError::RuntimeError(format!("No async runtime for team execution: {}", e)))?;

        let record = self.tracker.create(&team.team_id, &team.topology);
        let team_exec_id = record.team_exec_id.clone();
        info!(
            team_exec_id = %team_exec_id,
            team_id = %team.team_id,
            topology = team.topology.kind(),
            "Team execution started"
        );

        let ctx = StrategyContext {
            runner: Arc::clone(&self.runner),
            team: Arc::new(team),
            run_ctx: TeamRunContext {
                team_id: team_id.to_string(),
                team_execution_id: team_exec_id.clone(),
                event_context,
            },
            tracker: Arc::clone(&self.tracker),
            policy: self.config.empty_output_policy,
            approval_timeout: self.config.approval_timeout(),
            default_max_iterations: self.config.default_max_iterations,
        };

        let tracker = Arc::clone(&self.tracker);
        let message = message.to_string();
        let id = team_exec_id.clone();
        handle.spawn(async move {
            let inner = tokio::spawn(async move {
                let topology = ctx.team.topology.clone();
                strategies::run(&ctx, &topology, &message).await
            });

            match inner.await {
                Ok(Ok(outcome)) if outcome.approval_timed_out => tracker.approval_timeout(&id),
                Ok(Ok(outcome)) => tracker.complete(&id, outcome.last_output),
                Ok(Err(e)) => {
                    warn!(team_exec_id = %id, "Team execution failed: {}", e);
                    tracker.fail(&id, e.to_string());
                }
                Err(e) => {
                    error!(team_exec_id = %id, "Team strategy task aborted: {}", e);
                    tracker.fail(&id, format!("team strategy aborted: {}", e));
                }
            }
        });

        Ok(team_exec_id)
    }

    /// Release a human-in-loop gate. False when nothing is awaiting approval.
    pub fn approve(&self, team_exec_id: &str) -> bool {
        let approved = self.tracker.approve(team_exec_id);
        if approved {
            info!(team_exec_id = %team_exec_id, "Approval granted");
        }
        approved
    }

    pub fn team_execution(&self, team_exec_id: &str) -> Option<TeamExecution> {
        self.tracker.get(team_exec_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryStore, StaticTeams};
    use crate::runtime::backend::BackendType;
    use crate::runtime::execution::{AgentSpec, ExecutionStatus};
    use crate::topology::runner::AgentOutput;
    use crate::topology::types::{DelegationEdge, EmptyOutputPolicy, TeamConfig, TeamStatus, Topology};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    type Respond = dyn Fn(&str, &str) -> (ExecutionStatus, String) + Send + Sync;

    /// Records every dispatch and answers from a closure
    struct FakeRunner {
        respond: Box<Respond>,
        events: Mutex<Vec<String>>,
        inputs: Mutex<Vec<(String, String)>>,
        pending: Mutex<HashMap<String, (String, ExecutionStatus, String)>>,

        /// agent id -> continuation ids its run rotates through
        rotations: Mutex<HashMap<String, Vec<String>>>,
    }

    impl FakeRunner {
        fn new(respond: impl Fn(&str, &str) -> (ExecutionStatus, String) + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                respond: Box::new(respond),
                events: Mutex::new(vec![]),
                inputs: Mutex::new(vec![]),
                pending: Mutex::new(HashMap::new()),
                rotations: Mutex::new(HashMap::new()),
            })
        }

        fn rotate(&self, agent_id: &str, continuations: &[&str]) {
            self.rotations
                .lock()
                .insert(agent_id.to_string(), agents(continuations));
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn inputs(&self) -> Vec<(String, String)> {
            self.inputs.lock().clone()
        }

        fn started(&self) -> Vec<String> {
            self.inputs().into_iter().map(|(agent, _)| agent).collect()
        }
    }

    #[async_trait]
    impl AgentRunner for FakeRunner {
        fn start(&self, agent: &AgentSpec, message: &str, ctx: &TeamRunContext) -> Result<String> {
            let (status, output) = (self.respond)(&agent.agent_id, message);
            let execution_id = format!("{}-{}", ctx.team_execution_id, self.inputs.lock().len());
            self.inputs
                .lock()
                .push((agent.agent_id.clone(), message.to_string()));
            self.events.lock().push(format!("start:{}", agent.agent_id));
            self.pending
                .lock()
                .insert(execution_id.clone(), (agent.agent_id.clone(), status, output));
            Ok(execution_id)
        }

        async fn finish(&self, execution_id: &str) -> Result<AgentOutput> {
            let (agent_id, status, output) = self
                .pending
                .lock()
                .remove(execution_id)
                .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
            self.events.lock().push(format!("finish:{}", agent_id));
            let continuations = self.rotations.lock().get(&agent_id).cloned().unwrap_or_default();
            Ok(AgentOutput {
                execution_id: continuations
                    .last()
                    .cloned()
                    .unwrap_or_else(|| execution_id.to_string()),
                status,
                error: None,
                output,
                continuations,
            })
        }
    }

    fn ok(output: impl Into<String>) -> (ExecutionStatus, String) {
        (ExecutionStatus::Success, output.into())
    }

    fn agents(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn engine_with(runner: Arc<FakeRunner>, topology: Topology, config: TopologyConfig) -> TopologyEngine {
        let teams = StaticTeams::default();
        teams.insert(TeamConfig {
            team_id: "team-1".into(),
            members: ["a", "b", "c", "d"]
                .iter()
                .map(|id| AgentSpec::new(*id, BackendType::Claude))
                .collect(),
            topology,
        });
        TopologyEngine::new(config, runner, Arc::new(teams), Arc::new(MemoryStore::default()))
    }

    fn engine(runner: Arc<FakeRunner>, topology: Topology) -> TopologyEngine {
        engine_with(runner, topology, TopologyConfig::default())
    }

    async fn wait_terminal(engine: &TopologyEngine, team_exec_id: &str) -> TeamExecution {
        for _ in 0..500 {
            if let Some(record) = engine.team_execution(team_exec_id) {
                if record.status.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("team execution {} did not finish", team_exec_id);
    }

    async fn wait_status(engine: &TopologyEngine, team_exec_id: &str, status: TeamStatus) {
        for _ in 0..500 {
            if engine.team_execution(team_exec_id).map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("team execution {} never reached {:?}", team_exec_id, status);
    }

    #[tokio::test]
    async fn test_sequential_passes_output_exactly() {
        let runner = FakeRunner::new(|agent, _| match agent {
            "a" => ok("X"),
            _ => ok("done"),
        });
        let engine = engine(runner.clone(), Topology::Sequential { agents: agents(&["a", "b"]) });

        let id = engine.execute_team("team-1", "start here", None).unwrap();
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, TeamStatus::Completed);
        assert_eq!(record.output.as_deref(), Some("done"));
        assert_eq!(
            runner.inputs(),
            vec![
                ("a".to_string(), "start here".to_string()),
                ("b".to_string(), "X".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_generator_critic_stops_at_max_iterations() {
        let runner = FakeRunner::new(|agent, _| match agent {
            "a" => ok("draft"),
            _ => ok("needs work"),
        });
        let engine = engine(
            runner.clone(),
            Topology::GeneratorCritic {
                generator: "a".into(),
                critic: "b".into(),
                max_iterations: Some(3),
            },
        );

        let id = engine.execute_team("team-1", "write it", None).unwrap();
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, TeamStatus::Completed);
        let started = runner.started();
        assert_eq!(started.iter().filter(|a| *a == "a").count(), 3);
        assert_eq!(started.iter().filter(|a| *a == "b").count(), 3);
        assert_eq!(record.children.len(), 6);
    }

    #[tokio::test]
    async fn test_generator_critic_approval_ends_loop() {
        let runner = FakeRunner::new(|agent, message| match agent {
            "a" => ok(format!("draft for {}", message)),
            _ => ok("APPROVED, ship it"),
        });
        let engine = engine(
            runner.clone(),
            Topology::GeneratorCritic {
                generator: "a".into(),
                critic: "b".into(),
                max_iterations: None,
            },
        );

        let id = engine.execute_team("team-1", "topic", None).unwrap();
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(runner.started(), agents(&["a", "b"]));
        assert_eq!(record.output.as_deref(), Some("draft for topic"));
    }

    #[tokio::test]
    async fn test_composite_runs_groups_in_order() {
        let runner = FakeRunner::new(|agent, _| ok(format!("{} out", agent)));
        let engine = engine(
            runner.clone(),
            Topology::Composite {
                groups: vec![
                    Topology::Sequential { agents: agents(&["a", "b"]) },
                    Topology::Parallel { agents: agents(&["c", "d"]) },
                ],
            },
        );

        let id = engine.execute_team("team-1", "go", None).unwrap();
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, TeamStatus::Completed);
        assert_eq!(record.children.len(), 4);

        let events = runner.events();
        let at = |event: &str| events.iter().position(|e| e == event).unwrap();
        assert!(at("finish:a") < at("start:b"));
        assert!(at("finish:b") < at("start:c"));
        // Both parallel members are dispatched before either is awaited
        assert!(at("start:d") < at("finish:c"));

        let inputs: HashMap<_, _> = runner.inputs().into_iter().collect();
        assert_eq!(inputs["c"], "b out");
        assert_eq!(inputs["d"], "b out");
    }

    #[tokio::test]
    async fn test_coordinator_output_fans_out() {
        let runner = FakeRunner::new(|agent, _| match agent {
            "a" => ok("plan"),
            other => ok(format!("{} did it", other)),
        });
        let engine = engine(
            runner.clone(),
            Topology::Coordinator {
                coordinator: "a".into(),
                workers: agents(&["b", "c"]),
            },
        );

        let id = engine.execute_team("team-1", "task", None).unwrap();
        wait_terminal(&engine, &id).await;

        let inputs = runner.inputs();
        assert_eq!(inputs[0], ("a".to_string(), "task".to_string()));
        assert!(inputs[1..].iter().all(|(_, message)| message == "plan"));
    }

    #[tokio::test]
    async fn test_hierarchical_preorder_runs_shared_node_once() {
        let runner = FakeRunner::new(|agent, _| ok(format!("from {}", agent)));
        let edge = |from: &str, to: &str| DelegationEdge {
            from: from.into(),
            to: to.into(),
        };
        let engine = engine(
            runner.clone(),
            Topology::Hierarchical {
                lead: "a".into(),
                edges: vec![edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
            },
        );

        let id = engine.execute_team("team-1", "root", None).unwrap();
        wait_terminal(&engine, &id).await;

        assert_eq!(
            runner.inputs(),
            vec![
                ("a".to_string(), "root".to_string()),
                ("b".to_string(), "from a".to_string()),
                ("d".to_string(), "from b".to_string()),
                ("c".to_string(), "from a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_approval_timeout_keeps_earlier_children() {
        let runner = FakeRunner::new(|agent, _| ok(agent.to_string()));
        let engine = engine(
            runner.clone(),
            Topology::HumanInLoop {
                agents: agents(&["a", "b", "c"]),
                approval_gates: agents(&["b"]),
                timeout_secs: Some(1),
            },
        );

        let id = engine.execute_team("team-1", "go", None).unwrap();
        wait_status(&engine, &id, TeamStatus::PendingApproval).await;
        assert_eq!(
            engine.team_execution(&id).unwrap().awaiting_agent.as_deref(),
            Some("b")
        );

        let record = wait_terminal(&engine, &id).await;
        assert_eq!(record.status, TeamStatus::ApprovalTimeout);
        assert_eq!(record.children.len(), 1);
        assert_eq!(runner.started(), agents(&["a"]));
    }

    #[tokio::test]
    async fn test_approval_timeout_inside_composite_ends_team() {
        let runner = FakeRunner::new(|agent, _| ok(agent.to_string()));
        let engine = engine(
            runner.clone(),
            Topology::Composite {
                groups: vec![
                    Topology::Sequential { agents: agents(&["a"]) },
                    Topology::HumanInLoop {
                        agents: agents(&["b", "c"]),
                        approval_gates: agents(&["b"]),
                        timeout_secs: Some(1),
                    },
                    Topology::Parallel { agents: agents(&["d"]) },
                ],
            },
        );

        let id = engine.execute_team("team-1", "go", None).unwrap();
        wait_status(&engine, &id, TeamStatus::PendingApproval).await;

        let record = wait_terminal(&engine, &id).await;
        assert_eq!(record.status, TeamStatus::ApprovalTimeout);
        assert_eq!(record.children.len(), 1);
        assert_eq!(runner.started(), agents(&["a"]));
        assert!(!engine.approve(&id));
    }

    #[tokio::test]
    async fn test_rotation_continuations_are_team_children() {
        let runner = FakeRunner::new(|agent, _| ok(format!("{} out", agent)));
        runner.rotate("a", &["exec_a_cont_1", "exec_a_cont_2"]);
        let engine = engine(runner.clone(), Topology::Sequential { agents: agents(&["a", "b"]) });

        let id = engine.execute_team("team-1", "go", None).unwrap();
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, TeamStatus::Completed);
        assert_eq!(
            record.children,
            vec![
                format!("{}-0", id),
                "exec_a_cont_1".to_string(),
                "exec_a_cont_2".to_string(),
                format!("{}-1", id),
            ]
        );
    }

    #[tokio::test]
    async fn test_approval_resumes_run() {
        let runner = FakeRunner::new(|agent, _| ok(agent.to_string()));
        let engine = engine(
            runner.clone(),
            Topology::HumanInLoop {
                agents: agents(&["a", "b", "c"]),
                approval_gates: agents(&["b"]),
                timeout_secs: Some(30),
            },
        );

        let id = engine.execute_team("team-1", "go", None).unwrap();
        wait_status(&engine, &id, TeamStatus::PendingApproval).await;
        assert!(engine.approve(&id));

        let record = wait_terminal(&engine, &id).await;
        assert_eq!(record.status, TeamStatus::Completed);
        assert_eq!(runner.started(), agents(&["a", "b", "c"]));
        assert!(!engine.approve(&id));
    }

    #[tokio::test]
    async fn test_empty_output_policies() {
        let respond = |agent: &str, _: &str| match agent {
            "a" => ok("   "),
            _ => ok("b out"),
        };
        let topology = Topology::Sequential { agents: agents(&["a", "b"]) };

        let runner = FakeRunner::new(respond);
        let fallback = engine(runner.clone(), topology.clone());
        let id = fallback.execute_team("team-1", "original", None).unwrap();
        assert_eq!(wait_terminal(&fallback, &id).await.status, TeamStatus::Completed);
        assert_eq!(runner.inputs()[1], ("b".to_string(), "original".to_string()));

        let runner = FakeRunner::new(respond);
        let config = TopologyConfig {
            empty_output_policy: EmptyOutputPolicy::Fail,
            ..Default::default()
        };
        let strict = engine_with(runner.clone(), topology, config);
        let id = strict.execute_team("team-1", "original", None).unwrap();
        let record = wait_terminal(&strict, &id).await;
        assert_eq!(record.status, TeamStatus::Failed);
        assert!(record.error.unwrap().contains("Agent a produced no output"));
        assert_eq!(runner.started(), agents(&["a"]));
    }

    #[tokio::test]
    async fn test_failed_member_fails_team() {
        let runner = FakeRunner::new(|agent, _| match agent {
            "a" => (ExecutionStatus::Timeout, String::new()),
            _ => ok("never"),
        });
        let engine = engine(runner.clone(), Topology::Sequential { agents: agents(&["a", "b"]) });

        let id = engine.execute_team("team-1", "go", None).unwrap();
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, TeamStatus::Failed);
        assert!(record.error.unwrap().contains("finished with status timeout"));
        assert_eq!(runner.started(), agents(&["a"]));
    }

    #[tokio::test]
    async fn test_unknown_topology_fails_in_background() {
        let runner = FakeRunner::new(|_, _| ok("x"));
        let engine = engine(runner.clone(), Topology::Unknown);

        let id = engine.execute_team("team-1", "go", None).unwrap();
        let record = wait_terminal(&engine, &id).await;

        assert_eq!(record.status, TeamStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("Unknown topology kind"));
        assert!(runner.started().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_and_validation_errors_are_immediate() {
        let runner = FakeRunner::new(|_, _| ok("x"));
        let engine = engine(runner, Topology::Sequential { agents: agents(&["a", "zed"]) });

        assert!(matches!(
            engine.execute_team("missing", "go", None),
            Err(EngineError::TeamNotFound(_))
        ));
        assert!(matches!(
            engine.execute_team("team-1", "go", None),
            Err(EngineError::AgentNotInTeam { .. })
        ));
    }
}
