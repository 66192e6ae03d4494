//! Autonomous Agent Facade
//!
//! Wires the stores, the decision engine and the thinking loop together
//! and exposes the public control API. There are no globals; every
//! collaborator is passed in through `Collaborators`.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::planner::Planner;
use crate::agent::scheduler::StepScheduler;
use crate::agent::tools::{AiExecutor, ToolRegistry};
use crate::autonomous::decision::{AutonomousDecision, DecisionEngine};
use crate::autonomous::goals::{Goal, GoalStatus, GoalStore, Priority};
use crate::autonomous::learner::PatternTable;
use crate::autonomous::suggestions::{ProactiveSuggestion, SuggestionRegistry, SuggestionSource};
use crate::autonomous::thinking::{CycleOutcome, ThinkingHandle, ThinkingLoop, ThinkingSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::memory::{MemoryStats, MemoryStore};
use crate::persistence::PersistencePort;

/// Quality credited when the user accepts a suggestion
const ACCEPTED_SUGGESTION_QUALITY: f64 = 0.9;

/// External services the agent depends on
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub executor: Arc<dyn AiExecutor>,
    pub tools: ToolRegistry,
    pub persistence: Arc<dyn PersistencePort>,
    pub suggestion_source: Option<Arc<dyn SuggestionSource>>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Minimal set with no tools, no suggestion source and the wall clock
    pub fn new(
        planner: Arc<dyn Planner>,
        executor: Arc<dyn AiExecutor>,
        persistence: Arc<dyn PersistencePort>,
    ) -> Self {
        Self {
            planner,
            executor,
            tools: ToolRegistry::new(),
            persistence,
            suggestion_source: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_suggestion_source(mut self, source: Arc<dyn SuggestionSource>) -> Self {
        self.suggestion_source = Some(source);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Aggregate agent statistics
#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub memory: MemoryStats,
    pub thinking: ThinkingSnapshot,
    pub independence_score: f64,
    pub learning_patterns: usize,
    pub decisions: usize,
    pub cached_suggestions: usize,
    pub registered_tools: usize,
}

/// The autonomous goal-execution agent
pub struct AutonomousAgent {
    goals: Arc<GoalStore>,
    memory: Arc<MemoryStore>,
    suggestions: Arc<SuggestionRegistry>,
    decisions: Arc<DecisionEngine>,
    thinking: Arc<ThinkingLoop>,
    scheduler: Arc<StepScheduler>,
    ticker: Mutex<Option<ThinkingHandle>>,
}

impl AutonomousAgent {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            planner,
            executor,
            tools,
            persistence,
            suggestion_source,
            clock,
        } = collaborators;

        let memory = Arc::new(MemoryStore::new(persistence.clone(), clock.clone()));
        debug!("Registered tools: {:?}", tools.list());
        let scheduler = Arc::new(StepScheduler::new(Arc::new(tools), executor, config.step_policy()));
        let goals = Arc::new(GoalStore::new(
            planner,
            scheduler.clone(),
            memory.clone(),
            persistence.clone(),
            clock.clone(),
        ));
        let suggestions = Arc::new(SuggestionRegistry::new(
            config.suggestions(),
            persistence.clone(),
            clock.clone(),
        ));
        let patterns = Arc::new(PatternTable::new(persistence.clone(), clock.clone()));
        let decisions = Arc::new(DecisionEngine::new(patterns, persistence, clock.clone()));
        let thinking = Arc::new(ThinkingLoop::new(
            config.thinking(),
            goals.clone(),
            memory.clone(),
            suggestions.clone(),
            decisions.clone(),
            suggestion_source,
            clock,
        ));

        Self {
            goals,
            memory,
            suggestions,
            decisions,
            thinking,
            scheduler,
            ticker: Mutex::new(None),
        }
    }

    /// Start the thinking loop; calling it twice is a no-op
    pub async fn start(&self) {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_none() {
            *ticker = Some(self.thinking.spawn());
            info!("Autonomous agent started");
        }
    }

    /// Stop the thinking loop and wait for the ticker to exit
    pub async fn shutdown(&self) {
        let handle = self.ticker.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            info!("Autonomous agent stopped");
        }
    }

    /// Run a single thinking cycle now
    pub async fn think_now(&self) -> Result<CycleOutcome> {
        self.thinking.run_cycle().await
    }

    pub async fn set_goal(&self, user_id: &str, description: &str, priority: Priority) -> Result<Goal> {
        let goal = self.goals.set_goal(user_id, description, priority).await?;
        self.memory
            .record_interaction(user_id, "goal_created", &goal.title)
            .await;
        Ok(goal)
    }

    pub async fn pause_goal(&self, goal_id: &str) -> Option<Goal> {
        self.goals.pause_goal(goal_id).await
    }

    pub async fn resume_goal(&self, goal_id: &str) -> Result<Option<GoalStatus>> {
        self.goals.resume_goal(goal_id).await
    }

    pub async fn execute_goal(&self, goal_id: &str) -> Result<GoalStatus> {
        self.goals.execute_goal(goal_id).await
    }

    pub async fn get_goal(&self, goal_id: &str) -> Option<Goal> {
        self.goals.get_goal(goal_id).await
    }

    pub async fn get_active_goals(&self, user_id: &str) -> Vec<Goal> {
        self.goals.get_active_goals(user_id).await
    }

    pub async fn get_proactive_suggestions(&self, user_id: &str) -> Vec<ProactiveSuggestion> {
        self.suggestions.get_proactive_suggestions(user_id).await
    }

    pub async fn remove_suggestion(&self, user_id: &str, suggestion_id: &str) -> Option<ProactiveSuggestion> {
        self.suggestions.remove_suggestion(user_id, suggestion_id).await
    }

    /// Remove a suggestion and keep it from being proposed again
    pub async fn dismiss_suggestion(&self, user_id: &str, suggestion_id: &str) -> Result<ProactiveSuggestion> {
        let suggestion = self
            .suggestions
            .remove_suggestion(user_id, suggestion_id)
            .await
            .ok_or_else(|| AgentError::SuggestionNotFound(suggestion_id.to_string()))?;

        self.suggestions.mark_dismissed(user_id, &suggestion);
        self.decisions.record_feedback(false, 0.0).await;
        self.memory
            .record_interaction(user_id, "suggestion_dismissed", &suggestion.title)
            .await;
        Ok(suggestion)
    }

    /// Accept a suggestion by turning its title into a medium-priority goal
    ///
    /// The suggestion is removed exactly once whether or not goal creation
    /// succeeds.
    pub async fn promote_suggestion_to_goal(&self, user_id: &str, suggestion_id: &str) -> Result<Goal> {
        let suggestion = self
            .suggestions
            .find(user_id, suggestion_id)
            .await
            .ok_or_else(|| AgentError::SuggestionNotFound(suggestion_id.to_string()))?;

        let created = self.set_goal(user_id, &suggestion.title, Priority::Medium).await;

        if self.suggestions.remove_suggestion(user_id, suggestion_id).await.is_none() {
            warn!("Suggestion {} was already removed", suggestion_id);
        }

        let goal = created?;
        self.decisions
            .record_feedback(true, ACCEPTED_SUGGESTION_QUALITY.max(suggestion.confidence))
            .await;
        self.memory
            .record_interaction(user_id, "suggestion_accepted", &suggestion.title)
            .await;
        Ok(goal)
    }

    pub async fn make_autonomous_decision(&self, context: &str, options: &[String]) -> Result<AutonomousDecision> {
        self.decisions.make_autonomous_decision(context, options).await
    }

    pub async fn record_decision_outcome(
        &self,
        decision_id: &str,
        success: bool,
        quality: f64,
    ) -> Result<AutonomousDecision> {
        self.decisions.record_outcome(decision_id, success, quality).await
    }

    pub async fn independence_score(&self) -> f64 {
        self.decisions.independence_score().await
    }

    pub async fn get_memory_stats(&self) -> AgentStats {
        AgentStats {
            memory: self.memory.stats().await,
            thinking: self.thinking.stats(),
            independence_score: self.decisions.independence_score().await,
            learning_patterns: self.decisions.patterns().len().await,
            decisions: self.decisions.decision_count().await,
            cached_suggestions: self.suggestions.total().await,
            registered_tools: self.scheduler.tools().len(),
        }
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }
}
