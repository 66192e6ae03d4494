//! Goal Lifecycle Integration Tests
//!
//! Drives goals end to end through the `AutonomousAgent` facade.

use async_trait::async_trait;
use autonomy_core::autonomous::goals::Parameters;
use autonomy_core::{
    AgentError, AiExecutor, AutonomousAgent, Collaborators, Config, Goal, GoalStatus, InMemoryPersistence,
    PlannedStep, Planner, Priority, SqlitePersistence, StepStatus, Tool, ToolRegistry, ToolSchema,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

struct ScriptedPlanner(Vec<PlannedStep>);

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _description: &str, _priority: Priority) -> anyhow::Result<Vec<PlannedStep>> {
        Ok(self.0.clone())
    }
}

/// Answers every step with the action name
struct EchoExecutor;

#[async_trait]
impl AiExecutor for EchoExecutor {
    async fn execute_step(&self, action: &str, _parameters: &Parameters, _goal: &Goal) -> anyhow::Result<Value> {
        Ok(json!({ "handled_by": "ai", "action": action }))
    }
}

fn step(id: &str, action: &str, deps: &[&str]) -> PlannedStep {
    PlannedStep {
        id: id.to_string(),
        action: action.to_string(),
        parameters: Map::new(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
    }
}

fn agent_with(steps: Vec<PlannedStep>, tools: ToolRegistry) -> AutonomousAgent {
    let collaborators = Collaborators::new(
        Arc::new(ScriptedPlanner(steps)),
        Arc::new(EchoExecutor),
        Arc::new(InMemoryPersistence::new()),
    )
    .with_tools(tools);
    AutonomousAgent::new(&Config::default(), collaborators)
}

/// Tool that records the order in which it was called
fn recording_tool(name: &str, log: Arc<parking_lot::Mutex<Vec<String>>>) -> Tool {
    let label = name.to_string();
    Tool::new(ToolSchema::new(name, "Records its call"), move |_params| {
        let log = log.clone();
        let label = label.clone();
        async move {
            log.lock().push(label.clone());
            Ok::<_, anyhow::Error>(json!({ "done": label }))
        }
    })
}

#[tokio::test]
async fn test_steps_run_in_dependency_order() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    for name in ["draft", "review", "publish"] {
        tools.register(recording_tool(name, log.clone()));
    }

    // Listed out of order on purpose
    let agent = agent_with(
        vec![
            step("step_3", "publish", &["step_2"]),
            step("step_1", "draft", &[]),
            step("step_2", "review", &["step_1"]),
        ],
        tools,
    );

    let goal = agent.set_goal("alice", "Publish the newsletter", Priority::Medium).await.unwrap();
    assert_eq!(goal.status, GoalStatus::Pending);
    assert_eq!(goal.steps.len(), 3);

    let status = agent.execute_goal(&goal.id).await.unwrap();
    assert_eq!(status, GoalStatus::Completed);
    assert_eq!(*log.lock(), vec!["draft", "review", "publish"]);

    let done = agent.get_goal(&goal.id).await.unwrap();
    assert!(done.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(done.steps[0].result, Some(json!({ "done": "publish" })));

    // Completed goals leave working memory
    assert!(agent.get_active_goals("alice").await.is_empty());
    let memory = agent.memory().get_or_create("alice").await;
    assert_eq!(memory.long_term_memory.completed_goals.len(), 1);
}

#[tokio::test]
async fn test_unregistered_actions_go_to_ai_executor() {
    let agent = agent_with(vec![step("step_1", "summarize", &[])], ToolRegistry::new());
    let goal = agent.set_goal("alice", "Summarize the report", Priority::Low).await.unwrap();

    agent.execute_goal(&goal.id).await.unwrap();
    let done = agent.get_goal(&goal.id).await.unwrap();
    assert_eq!(done.steps[0].result, Some(json!({ "handled_by": "ai", "action": "summarize" })));
}

#[tokio::test]
async fn test_cyclic_plan_falls_back_to_single_step() {
    let agent = agent_with(
        vec![step("a", "first", &["b"]), step("b", "second", &["a"])],
        ToolRegistry::new(),
    );

    let goal = agent.set_goal("alice", "Untangle this", Priority::Low).await.unwrap();
    assert_eq!(goal.steps.len(), 1);
    assert_eq!(goal.steps[0].action, "analyze_goal");
    assert_eq!(goal.steps[0].parameters.get("goal"), Some(&json!("Untangle this")));

    assert_eq!(agent.execute_goal(&goal.id).await.unwrap(), GoalStatus::Completed);
}

#[tokio::test]
async fn test_failing_step_fails_goal() {
    let mut tools = ToolRegistry::new();
    tools.register(Tool::new(ToolSchema::new("deploy", "Always fails"), |_params| async {
        Err::<Value, _>(anyhow::anyhow!("cluster unreachable"))
    }));
    let agent = agent_with(
        vec![step("step_1", "deploy", &[]), step("step_2", "announce", &["step_1"])],
        tools,
    );

    let goal = agent.set_goal("bob", "Ship v2", Priority::Medium).await.unwrap();
    let err = agent.execute_goal(&goal.id).await.unwrap_err();
    assert!(matches!(err, AgentError::StepExecutionFailure { ref step_id, .. } if step_id == "step_1"));

    let failed = agent.get_goal(&goal.id).await.unwrap();
    assert_eq!(failed.status, GoalStatus::Failed);
    assert_eq!(failed.steps[0].status, StepStatus::Failed);
    assert_eq!(failed.steps[1].status, StepStatus::Pending);
    assert!(failed.steps[0].result.as_ref().unwrap()["error"]
        .as_str()
        .unwrap()
        .contains("cluster unreachable"));
}

#[tokio::test]
async fn test_approval_required_tool_is_denied_without_approval() {
    let mut tools = ToolRegistry::new();
    tools.register(
        Tool::new(ToolSchema::new("send_email", "Sends mail"), |_params| async {
            Ok::<_, anyhow::Error>(json!("sent"))
        })
        .requires_approval(),
    );
    let agent = agent_with(vec![step("step_1", "send_email", &[])], tools);

    let goal = agent.set_goal("bob", "Email the landlord", Priority::Medium).await.unwrap();
    let err = agent.execute_goal(&goal.id).await.unwrap_err();
    assert!(err.to_string().contains("approval"));
}

#[tokio::test]
async fn test_pause_and_resume_through_agent() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut tools = ToolRegistry::new();
    {
        let entered = entered.clone();
        let release = release.clone();
        tools.register(Tool::new(ToolSchema::new("gate", "Blocks until released"), move |_params| {
            let entered = entered.clone();
            let release = release.clone();
            async move {
                entered.notify_one();
                release.notified().await;
                Ok::<_, anyhow::Error>(json!("gate opened"))
            }
        }));
    }
    tools.register(recording_tool("pack", log.clone()));
    tools.register(recording_tool("ship", log.clone()));

    let agent = Arc::new(agent_with(
        vec![
            step("step_1", "gate", &[]),
            step("step_2", "pack", &["step_1"]),
            step("step_3", "ship", &["step_2"]),
        ],
        tools,
    ));
    let goal = agent.set_goal("carol", "Send the parcel", Priority::Medium).await.unwrap();

    let runner = {
        let agent = agent.clone();
        let id = goal.id.clone();
        tokio::spawn(async move { agent.execute_goal(&id).await })
    };

    entered.notified().await;
    let paused = agent.pause_goal(&goal.id).await.unwrap();
    assert_eq!(paused.status, GoalStatus::Paused);
    release.notify_one();

    assert_eq!(runner.await.unwrap().unwrap(), GoalStatus::Paused);
    assert!(log.lock().is_empty());

    let active = agent.get_active_goals("carol").await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].status, GoalStatus::Paused);
    assert_eq!(active[0].steps[0].status, StepStatus::Completed);

    assert_eq!(agent.resume_goal(&goal.id).await.unwrap(), Some(GoalStatus::Completed));
    assert_eq!(*log.lock(), vec!["pack", "ship"]);
}

#[tokio::test]
async fn test_active_goals_sorted_by_priority() {
    let agent = agent_with(vec![], ToolRegistry::new());
    let low = agent.set_goal("dana", "Tidy desk", Priority::Low).await.unwrap();
    let medium = agent.set_goal("dana", "Plan trip", Priority::Medium).await.unwrap();
    agent.set_goal("erin", "Someone else's goal", Priority::Medium).await.unwrap();

    let active = agent.get_active_goals("dana").await;
    let ids: Vec<&str> = active.iter().map(|g| g.id.as_str()).collect();
    assert_eq!(ids, vec![medium.id.as_str(), low.id.as_str()]);
}

#[tokio::test]
async fn test_interrupted_goal_comes_back_paused() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp.path().join("state.db");

    let goal_id = {
        let persistence = Arc::new(SqlitePersistence::open(&db_path).unwrap());
        let collaborators = Collaborators::new(
            Arc::new(ScriptedPlanner(vec![step("step_1", "work", &[])])),
            Arc::new(EchoExecutor),
            persistence,
        );
        let agent = AutonomousAgent::new(&Config::default(), collaborators);
        let goal = agent.set_goal("frank", "Long running job", Priority::Medium).await.unwrap();

        // Simulate a crash mid-step
        agent
            .memory()
            .update("frank", |memory| {
                let stored = &mut memory.working_memory.current_goals[0];
                stored.status = GoalStatus::InProgress;
                stored.steps[0].status = StepStatus::InProgress;
            })
            .await;
        goal.id
    };

    let persistence = Arc::new(SqlitePersistence::open(&db_path).unwrap());
    let collaborators = Collaborators::new(
        Arc::new(ScriptedPlanner(vec![])),
        Arc::new(EchoExecutor),
        persistence,
    );
    let agent = AutonomousAgent::new(&Config::default(), collaborators);

    let active = agent.get_active_goals("frank").await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, goal_id);
    assert_eq!(active[0].status, GoalStatus::Paused);
    assert_eq!(active[0].steps[0].status, StepStatus::Pending);

    assert_eq!(agent.resume_goal(&goal_id).await.unwrap(), Some(GoalStatus::Completed));
}
