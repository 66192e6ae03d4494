//! Persistence Integration Tests
//!
//! State written through one set of stores must be visible to a fresh set
//! opened on the same SQLite file.

use async_trait::async_trait;
use autonomy_core::autonomous::goals::Parameters;
use autonomy_core::autonomous::{DecisionEngine, PatternTable, SuggestionConfig, SuggestionRegistry};
use autonomy_core::{
    AiExecutor, AutonomousAgent, Clock, Collaborators, Config, Goal, GoalStatus, ManualClock, PersistencePort,
    PlannedStep, Planner, Priority, SqlitePersistence, StorageKey, SuggestionDraft, SuggestionType,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct NoPlan;

#[async_trait]
impl Planner for NoPlan {
    async fn plan(&self, _description: &str, _priority: Priority) -> anyhow::Result<Vec<PlannedStep>> {
        anyhow::bail!("offline")
    }
}

struct Done;

#[async_trait]
impl AiExecutor for Done {
    async fn execute_step(&self, _action: &str, _parameters: &Parameters, _goal: &Goal) -> anyhow::Result<Value> {
        Ok(Value::Bool(true))
    }
}

fn temp_db(name: &str) -> (PathBuf, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join(format!("{}.db", name));
    (db_path, temp_dir)
}

fn open(path: &Path) -> Arc<SqlitePersistence> {
    Arc::new(SqlitePersistence::open(path).expect("Failed to open store"))
}

fn agent(persistence: Arc<SqlitePersistence>) -> AutonomousAgent {
    AutonomousAgent::new(
        &Config::default(),
        Collaborators::new(Arc::new(NoPlan), Arc::new(Done), persistence),
    )
}

#[tokio::test]
async fn test_raw_records_survive_reopen() {
    let (path, _temp) = temp_db("raw");
    {
        let store = open(&path);
        store.set(&StorageKey::Goal("g1".into()), b"one".to_vec()).await.unwrap();
        store.set(&StorageKey::Goal("g1".into()), b"two".to_vec()).await.unwrap();
        store.set(&StorageKey::LearningPatterns, b"[]".to_vec()).await.unwrap();
    }

    let store = open(&path);
    assert_eq!(store.count().unwrap(), 2);
    assert_eq!(store.get(&StorageKey::Goal("g1".into())).await.unwrap(), Some(b"two".to_vec()));
    assert!(store.get(&StorageKey::Goal("g2".into())).await.unwrap().is_none());
}

#[tokio::test]
async fn test_open_creates_parent_directories() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let path = temp.path().join("nested").join("deeper").join("state.db");
    let store = open(&path);
    assert_eq!(store.count().unwrap(), 0);
    assert!(path.exists());
}

#[tokio::test]
async fn test_goals_and_memory_survive_restart() {
    let (path, _temp) = temp_db("goals");

    let (pending_id, completed_id) = {
        let agent = agent(open(&path));
        let pending = agent.set_goal("alice", "Learn to juggle", Priority::Low).await.unwrap();
        let completed = agent.set_goal("alice", "Buy juggling balls", Priority::Medium).await.unwrap();
        agent.execute_goal(&completed.id).await.unwrap();
        (pending.id, completed.id)
    };

    let agent = agent(open(&path));

    let pending = agent.get_goal(&pending_id).await.unwrap();
    assert_eq!(pending.status, GoalStatus::Pending);
    assert_eq!(pending.title, "Learn to juggle");
    assert_eq!(pending.context.get("userId"), Some(&Value::from("alice")));

    let completed = agent.get_goal(&completed_id).await.unwrap();
    assert_eq!(completed.status, GoalStatus::Completed);

    let active = agent.get_active_goals("alice").await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, pending_id);

    let memory = agent.memory().load_user_memory("alice").await.unwrap();
    assert_eq!(memory.long_term_memory.completed_goals.len(), 1);
    assert!(memory
        .working_memory
        .recent_interactions
        .iter()
        .any(|i| i.kind == "goal_created"));
}

#[tokio::test]
async fn test_suggestions_survive_restart() {
    let (path, _temp) = temp_db("suggestions");
    let clock = Arc::new(ManualClock::starting_now());

    let kept = {
        let registry = SuggestionRegistry::new(SuggestionConfig::default(), open(&path), clock.clone());
        let draft = SuggestionDraft::new(SuggestionType::Insight, "You finish more on Mondays", "")
            .with_confidence(0.7);
        let list = registry
            .add_suggestions("alice", vec![draft.into_suggestion(clock.now())])
            .await;
        list[0].clone()
    };

    let registry = SuggestionRegistry::new(SuggestionConfig::default(), open(&path), clock.clone());
    let loaded = registry.get_proactive_suggestions("alice").await;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, kept.id);
    assert_eq!(loaded[0].title, "You finish more on Mondays");
    assert_eq!(loaded[0].suggestion_type, SuggestionType::Insight);
    assert_eq!(loaded[0].created_at, kept.created_at);

    // Expiry applies to loaded suggestions too
    clock.advance(chrono::Duration::hours(25));
    let registry = SuggestionRegistry::new(SuggestionConfig::default(), open(&path), clock.clone());
    assert!(registry.get_proactive_suggestions("alice").await.is_empty());
}

#[tokio::test]
async fn test_decision_log_survives_restart() {
    let (path, _temp) = temp_db("decisions");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());

    let decision_id = {
        let persistence = open(&path);
        let patterns = Arc::new(PatternTable::new(persistence.clone(), clock.clone()));
        let engine = DecisionEngine::new(patterns, persistence, clock.clone());
        for _ in 0..20 {
            engine.record_feedback(true, 0.95).await;
        }

        let options = vec!["water now".to_string(), "water tomorrow".to_string()];
        let decision = engine.make_autonomous_decision("plants look dry", &options).await.unwrap();
        engine.record_outcome(&decision.decision_id, true, 0.9).await.unwrap();
        decision.decision_id
    };

    let persistence = open(&path);
    let patterns = Arc::new(PatternTable::new(persistence.clone(), clock.clone()));
    let engine = DecisionEngine::new(patterns.clone(), persistence, clock);

    assert_eq!(engine.independence_score().await, 0.51);
    let decision = engine.get_decision(&decision_id).await.unwrap();
    assert_eq!(decision.success, Some(true));
    assert!(decision.learned_from_outcome);

    let learned = patterns.all().await;
    assert_eq!(learned.len(), 1);
    assert_eq!(learned[0].pattern, "plants look dry");
    assert_eq!(learned[0].frequency, 1);
}
