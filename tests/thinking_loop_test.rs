//! Thinking Loop Integration Tests
//!
//! Single-flight cycles, failure isolation, the ticker and autonomous starts.

use async_trait::async_trait;
use autonomy_core::agent::recovery::StepPolicy;
use autonomy_core::autonomous::goals::{GoalStore, Parameters};
use autonomy_core::autonomous::{
    DecisionEngine, GoalEvent, PatternTable, SuggestionConfig, SuggestionRegistry, ThinkingConfig, ThinkingLoop,
};
use autonomy_core::{
    AgentError, AgentMemory, AiExecutor, Clock, CycleOutcome, Goal, GoalStatus, InMemoryPersistence, ManualClock,
    MemoryStore, PersistencePort, PlannedStep, Planner, Priority, StepScheduler, SuggestionDraft, SuggestionSource,
    SuggestionType, ToolRegistry,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct NoPlan;

#[async_trait]
impl Planner for NoPlan {
    async fn plan(&self, _description: &str, _priority: Priority) -> anyhow::Result<Vec<PlannedStep>> {
        Ok(vec![])
    }
}

struct Done;

#[async_trait]
impl AiExecutor for Done {
    async fn execute_step(&self, _action: &str, _parameters: &Parameters, _goal: &Goal) -> anyhow::Result<Value> {
        Ok(Value::Bool(true))
    }
}

/// Blocks inside `propose` until released
struct GatedSource {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl SuggestionSource for GatedSource {
    async fn propose(&self, _memory: &AgentMemory) -> anyhow::Result<Vec<SuggestionDraft>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(vec![SuggestionDraft::new(SuggestionType::Insight, "Mornings are productive", "")])
    }
}

struct PanickingSource;

#[async_trait]
impl SuggestionSource for PanickingSource {
    async fn propose(&self, _memory: &AgentMemory) -> anyhow::Result<Vec<SuggestionDraft>> {
        panic!("source exploded")
    }
}

struct Harness {
    thinking: Arc<ThinkingLoop>,
    goals: Arc<GoalStore>,
    memory: Arc<MemoryStore>,
    suggestions: Arc<SuggestionRegistry>,
    decisions: Arc<DecisionEngine>,
}

fn harness(config: ThinkingConfig, source: Option<Arc<dyn SuggestionSource>>) -> Harness {
    let persistence: Arc<dyn PersistencePort> = Arc::new(InMemoryPersistence::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());

    let memory = Arc::new(MemoryStore::new(persistence.clone(), clock.clone()));
    let scheduler = Arc::new(StepScheduler::new(
        Arc::new(ToolRegistry::new()),
        Arc::new(Done),
        StepPolicy::default(),
    ));
    let goals = Arc::new(GoalStore::new(
        Arc::new(NoPlan),
        scheduler,
        memory.clone(),
        persistence.clone(),
        clock.clone(),
    ));
    let suggestions = Arc::new(SuggestionRegistry::new(
        SuggestionConfig::default(),
        persistence.clone(),
        clock.clone(),
    ));
    let patterns = Arc::new(PatternTable::new(persistence.clone(), clock.clone()));
    let decisions = Arc::new(DecisionEngine::new(patterns, persistence, clock.clone()));
    let thinking = Arc::new(ThinkingLoop::new(
        config,
        goals.clone(),
        memory.clone(),
        suggestions.clone(),
        decisions.clone(),
        source,
        clock,
    ));

    Harness {
        thinking,
        goals,
        memory,
        suggestions,
        decisions,
    }
}

fn manual_config() -> ThinkingConfig {
    ThinkingConfig {
        autonomous_execution: false,
        ..ThinkingConfig::default()
    }
}

#[tokio::test]
async fn test_overlapping_cycle_is_skipped() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let source = Arc::new(GatedSource {
        entered: entered.clone(),
        release: release.clone(),
    });
    let h = harness(manual_config(), Some(source));
    h.memory.get_or_create("u1").await;

    let first = {
        let thinking = h.thinking.clone();
        tokio::spawn(async move { thinking.run_cycle().await })
    };
    entered.notified().await;
    assert!(h.thinking.is_running());

    assert_eq!(h.thinking.run_cycle().await.unwrap(), CycleOutcome::Skipped);

    release.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), CycleOutcome::Completed { suggestions: 1 });
    assert!(!h.thinking.is_running());

    let stats = h.thinking.stats();
    assert_eq!(stats.cycles_completed, 1);
    assert_eq!(stats.cycles_skipped, 1);
    assert_eq!(stats.suggestions_generated, 1);

    let stored = h.suggestions.get_proactive_suggestions("u1").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].title, "Mornings are productive");
}

#[tokio::test]
async fn test_panicking_cycle_is_contained() {
    let h = harness(manual_config(), Some(Arc::new(PanickingSource)));
    h.memory.get_or_create("u1").await;

    let err = h.thinking.run_cycle().await.unwrap_err();
    match err {
        AgentError::CycleFailure(message) => assert!(message.contains("source exploded")),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!h.thinking.is_running());

    // The flag was released, so the next cycle runs instead of being skipped
    assert!(h.thinking.run_cycle().await.is_err());
    let stats = h.thinking.stats();
    assert_eq!(stats.cycles_failed, 2);
    assert_eq!(stats.cycles_skipped, 0);
}

#[tokio::test]
async fn test_duplicate_proposals_are_not_repeated() {
    struct Repeating;

    #[async_trait]
    impl SuggestionSource for Repeating {
        async fn propose(&self, _memory: &AgentMemory) -> anyhow::Result<Vec<SuggestionDraft>> {
            Ok(vec![
                SuggestionDraft::new(SuggestionType::Task, "Back up photos", ""),
                SuggestionDraft::new(SuggestionType::Task, "back up  photos", ""),
            ])
        }
    }

    let h = harness(manual_config(), Some(Arc::new(Repeating)));
    h.memory.get_or_create("u1").await;

    assert_eq!(h.thinking.run_cycle().await.unwrap(), CycleOutcome::Completed { suggestions: 1 });
    assert_eq!(h.thinking.run_cycle().await.unwrap(), CycleOutcome::Completed { suggestions: 0 });
    assert_eq!(h.suggestions.get_proactive_suggestions("u1").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ticker_runs_cycles_until_shutdown() {
    let h = harness(
        ThinkingConfig {
            interval: Duration::from_secs(30),
            ..manual_config()
        },
        None,
    );

    let handle = h.thinking.spawn();
    // No tick fires at start
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(h.thinking.stats().cycles_completed, 0);

    tokio::time::sleep(Duration::from_secs(62)).await;
    assert_eq!(h.thinking.stats().cycles_completed, 3);

    handle.shutdown().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.thinking.stats().cycles_completed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_cycle() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let source = Arc::new(GatedSource {
        entered: entered.clone(),
        release: release.clone(),
    });
    let h = harness(
        ThinkingConfig {
            interval: Duration::from_secs(30),
            ..manual_config()
        },
        Some(source),
    );
    h.memory.get_or_create("u1").await;

    let handle = h.thinking.spawn();
    tokio::time::sleep(Duration::from_secs(31)).await;
    entered.notified().await;
    assert!(h.thinking.is_running());

    let stopping = tokio::spawn(handle.shutdown());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!stopping.is_finished());

    release.notify_one();
    stopping.await.unwrap();
    assert!(!h.thinking.is_running());
    assert_eq!(h.thinking.stats().cycles_completed, 1);
    assert_eq!(h.suggestions.get_proactive_suggestions("u1").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_loop_never_ticks() {
    let h = harness(
        ThinkingConfig {
            enabled: false,
            ..manual_config()
        },
        None,
    );

    let handle = h.thinking.spawn();
    tokio::time::sleep(Duration::from_secs(300)).await;
    handle.shutdown().await;
    assert_eq!(h.thinking.stats().cycles_completed, 0);
}

#[tokio::test]
async fn test_no_autonomous_start_without_independence() {
    let h = harness(ThinkingConfig::default(), None);
    let goal = h.goals.set_goal("u1", "Water plants", Priority::Medium).await.unwrap();

    h.thinking.run_cycle().await.unwrap();
    assert_eq!(h.thinking.stats().goals_started, 0);
    assert_eq!(h.goals.get_goal(&goal.id).await.unwrap().status, GoalStatus::Pending);
    assert_eq!(h.decisions.decision_count().await, 0);
}

#[tokio::test]
async fn test_independent_agent_starts_pending_goal() {
    let h = harness(ThinkingConfig::default(), None);
    for _ in 0..20 {
        h.decisions.record_feedback(true, 0.9).await;
    }
    assert!(h.decisions.can_act().await);

    // Past success with starting this goal steers the choice
    h.decisions
        .patterns()
        .reinforce("start goal: Water plants", true, 0.9)
        .await;

    let mut events = h.goals.subscribe();
    let goal = h.goals.set_goal("u1", "Water plants", Priority::Medium).await.unwrap();

    h.thinking.run_cycle().await.unwrap();
    assert_eq!(h.thinking.stats().goals_started, 1);

    let completed = loop {
        match events.recv().await.unwrap() {
            GoalEvent::Completed { goal } => break goal,
            _ => continue,
        }
    };
    assert_eq!(completed.id, goal.id);

    // The next cycle credits the decision that started the goal
    h.thinking.run_cycle().await.unwrap();
    assert_eq!(h.decisions.independence_score().await, 0.51);
    assert_eq!(h.thinking.stats().outcomes_learned, 1);

    let memory = h.memory.load_user_memory("u1").await.unwrap();
    assert_eq!(
        memory.long_term_memory.learned_patterns.get("goals_completed"),
        Some(&Value::from(1u64))
    );
    assert!(memory
        .working_memory
        .recent_interactions
        .iter()
        .any(|i| i.kind == "goal_completed"));

    // Nothing left to start
    h.thinking.run_cycle().await.unwrap();
    assert_eq!(h.thinking.stats().goals_started, 1);
}
