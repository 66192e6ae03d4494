//! Goal Tracking and Execution State Machine
//!
//! Goals are decomposed into `TaskStep`s by the planner and executed in
//! dependency order by the step scheduler:
//! - Priority-driven immediate execution (high/critical)
//! - Cooperative pause at step boundaries, resume from the first open step
//! - Durable checkpoints through the goal record and the owner's memory
//! - Completed goals retire into long-term memory, nothing is hard-deleted
//!
//! Status transitions:
//!
//! ```text
//! pending ──► in_progress ──► completed
//!                 │  ▲
//!           pause │  │ resume
//!                 ▼  │
//!               paused          (any step failure) ──► failed ──resume──► in_progress
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::planner::{default_step, into_task_steps, Planner};
use crate::agent::scheduler::StepScheduler;
use crate::clock::Clock;
use crate::error::{AgentError, Result};
use crate::memory::MemoryStore;
use crate::persistence::{load_json, store_json, PersistencePort, StorageKey};

/// Schema-validated step/tool payload
pub type Parameters = Map<String, Value>;

/// Longest derived goal title
const MAX_TITLE_CHARS: usize = 80;

/// Priority level for goals
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    /// High and critical goals start executing as soon as they are planned
    pub fn runs_immediately(&self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }
}

/// Goal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    InProgress,
    Completed,
    Paused,
    Failed,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Pending => "pending",
            GoalStatus::InProgress => "in_progress",
            GoalStatus::Completed => "completed",
            GoalStatus::Paused => "paused",
            GoalStatus::Failed => "failed",
        }
    }

    /// Still on the user's plate
    pub fn is_active(&self) -> bool {
        matches!(self, GoalStatus::Pending | GoalStatus::InProgress | GoalStatus::Paused)
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One unit of work within a goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub id: String,
    /// Symbolic operation name, resolved against the tool registry
    pub action: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    /// Ids of steps in the same goal that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TaskStep {
    pub fn new(id: &str, action: &str, parameters: Parameters) -> Self {
        Self {
            id: id.to_string(),
            action: action.to_string(),
            parameters,
            status: StepStatus::Pending,
            result: None,
            executed_at: None,
            dependencies: vec![],
        }
    }

    /// Add dependency (duplicates are ignored)
    ///
    /// A step naming itself is kept so ordering reports it as a cycle.
    pub fn depends_on(mut self, step_id: &str) -> Self {
        if !self.dependencies.iter().any(|d| d == step_id) {
            self.dependencies.push(step_id.to_string());
        }
        self
    }

    /// All dependencies completed
    pub fn can_start(&self, completed: &HashSet<&str>) -> bool {
        self.dependencies.iter().all(|d| completed.contains(d.as_str()))
    }
}

/// A tracked goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: GoalStatus,
    pub steps: Vec<TaskStep>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Opaque context bag; always carries `userId`
    #[serde(default)]
    pub context: Parameters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    /// Create a pending goal with no steps
    pub fn new(user_id: &str, description: &str, priority: Priority, now: DateTime<Utc>) -> Self {
        let mut context = Map::new();
        context.insert("userId".to_string(), Value::String(user_id.to_string()));

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: derive_title(description),
            description: description.to_string(),
            priority,
            status: GoalStatus::Pending,
            steps: vec![],
            deadline: None,
            context,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Ids of completed steps
    pub fn completed_step_ids(&self) -> HashSet<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.as_str())
            .collect()
    }

    /// First step (in declared order) that is not completed
    pub fn first_open_step(&self) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.status != StepStatus::Completed)
    }

    /// Calculate progress (0.0 - 1.0)
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let completed = self.steps.iter().filter(|s| s.status == StepStatus::Completed).count();
        completed as f64 / self.steps.len() as f64
    }
}

/// First line of the description, cut on a word boundary
pub fn derive_title(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or("").trim();
    if first_line.chars().count() <= MAX_TITLE_CHARS {
        return first_line.to_string();
    }

    let cut: String = first_line.chars().take(MAX_TITLE_CHARS).collect();
    match cut.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => format!("{}…", cut[..pos].trim_end()),
        _ => format!("{}…", cut),
    }
}

/// Lifecycle notifications for the thinking loop
#[derive(Debug, Clone)]
pub enum GoalEvent {
    Completed { goal: Goal },
    Failed { goal: Goal, error: String },
    Paused { goal_id: String, user_id: String },
}

/// Marks a goal as having a live executor; released on drop
struct ExecutionGuard<'a> {
    executing: &'a parking_lot::Mutex<HashSet<String>>,
    goal_id: String,
}

impl<'a> ExecutionGuard<'a> {
    fn acquire(executing: &'a parking_lot::Mutex<HashSet<String>>, goal_id: &str) -> Option<Self> {
        if !executing.lock().insert(goal_id.to_string()) {
            return None;
        }
        Some(Self {
            executing,
            goal_id: goal_id.to_string(),
        })
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.executing.lock().remove(&self.goal_id);
    }
}

/// Goal table plus execution driver
pub struct GoalStore {
    goals: RwLock<HashMap<String, Goal>>,
    executing: parking_lot::Mutex<HashSet<String>>,
    planner: Arc<dyn Planner>,
    scheduler: Arc<StepScheduler>,
    memory: Arc<MemoryStore>,
    persistence: Arc<dyn PersistencePort>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<GoalEvent>,
}

impl GoalStore {
    pub fn new(
        planner: Arc<dyn Planner>,
        scheduler: Arc<StepScheduler>,
        memory: Arc<MemoryStore>,
        persistence: Arc<dyn PersistencePort>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            goals: RwLock::new(HashMap::new()),
            executing: parking_lot::Mutex::new(HashSet::new()),
            planner,
            scheduler,
            memory,
            persistence,
            clock,
            events,
        }
    }

    /// Receive completion/failure/pause events
    pub fn subscribe(&self) -> broadcast::Receiver<GoalEvent> {
        self.events.subscribe()
    }

    /// Create and plan a goal; high/critical goals start executing at once
    pub async fn set_goal(
        self: &Arc<Self>,
        user_id: &str,
        description: &str,
        priority: Priority,
    ) -> Result<Goal> {
        let description = description.trim();
        if description.is_empty() {
            return Err(AgentError::InvalidInput("goal description is empty".to_string()));
        }
        if user_id.trim().is_empty() {
            return Err(AgentError::InvalidInput("user id is empty".to_string()));
        }

        self.memory.get_or_create(user_id).await;

        let mut goal = Goal::new(user_id, description, priority, self.clock.now());
        goal.steps = self.plan_steps(description, priority).await;

        self.goals.write().await.insert(goal.id.clone(), goal.clone());
        self.persist_goal(&goal).await;
        self.memory.upsert_current_goal(user_id, &goal).await;

        info!(
            "Created goal '{}' ({}) for user {} with {} steps",
            goal.title,
            priority.as_str(),
            user_id,
            goal.steps.len()
        );

        if priority.runs_immediately() {
            self.spawn_execution(&goal.id);
        }

        Ok(goal)
    }

    /// Run `execute_goal` as an independent task
    pub fn spawn_execution(self: &Arc<Self>, goal_id: &str) -> JoinHandle<Result<GoalStatus>> {
        let store = Arc::clone(self);
        let goal_id = goal_id.to_string();
        tokio::spawn(async move {
            let result = store.execute_goal(&goal_id).await;
            if let Err(ref e) = result {
                warn!("Background execution of goal {} failed: {}", goal_id, e);
            }
            result
        })
    }

    /// Ask the planner for steps, falling back to the single default step
    async fn plan_steps(&self, description: &str, priority: Priority) -> Vec<TaskStep> {
        match self.planner.plan(description, priority).await {
            Ok(planned) => match into_task_steps(planned) {
                Ok(steps) => steps,
                Err(e) => {
                    warn!("Rejected plan for '{}', using default step: {}", description, e);
                    vec![default_step(description)]
                }
            },
            Err(e) => {
                warn!("Planner failed for '{}', using default step: {}", description, e);
                vec![default_step(description)]
            }
        }
    }

    /// Execute a goal's steps in dependency order
    ///
    /// Returns the goal status when execution stops: `Completed`, `Paused`
    /// (observed at a step boundary), or the status of a goal whose executor
    /// is already running elsewhere. A failing step marks the goal `Failed`
    /// and is returned as `StepExecutionFailure`.
    ///
    /// Every terminal transition is written and the execution guard released
    /// while the goal table is still write-locked, so `resume_goal` either
    /// sees a live executor that will still observe the status or a goal
    /// with none.
    pub async fn execute_goal(&self, goal_id: &str) -> Result<GoalStatus> {
        let guard = match ExecutionGuard::acquire(&self.executing, goal_id) {
            Some(guard) => guard,
            None => {
                debug!("Goal {} already has a running executor", goal_id);
                return self
                    .get_goal(goal_id)
                    .await
                    .map(|g| g.status)
                    .ok_or_else(|| AgentError::GoalNotFound(goal_id.to_string()));
            }
        };

        // Pull a durable copy into the table if this process has not seen it
        if self.get_goal(goal_id).await.is_none() {
            return Err(AgentError::GoalNotFound(goal_id.to_string()));
        }

        let order = {
            let mut goals = self.goals.write().await;
            let goal = goals
                .get_mut(goal_id)
                .ok_or_else(|| AgentError::GoalNotFound(goal_id.to_string()))?;

            if matches!(goal.status, GoalStatus::Completed | GoalStatus::Paused) {
                let status = goal.status;
                drop(guard);
                return Ok(status);
            }

            goal.updated_at = self.clock.now();
            match StepScheduler::order(&goal.steps) {
                Ok(order) => {
                    goal.status = GoalStatus::InProgress;
                    let snapshot = goal.clone();
                    drop(goals);
                    self.sync(&snapshot).await;
                    order
                }
                Err(e) => {
                    goal.status = GoalStatus::Failed;
                    let failed = goal.clone();
                    self.sync(&failed).await;
                    let _ = self.events.send(GoalEvent::Failed {
                        goal: failed,
                        error: e.to_string(),
                    });
                    drop(guard);
                    return Err(e);
                }
            }
        };

        for idx in order {
            let (step, snapshot) = {
                let mut goals = self.goals.write().await;
                let goal = goals
                    .get_mut(goal_id)
                    .ok_or_else(|| AgentError::GoalNotFound(goal_id.to_string()))?;

                if goal.status == GoalStatus::Paused {
                    info!("Goal {} paused before step {}", goal_id, goal.steps[idx].id);
                    drop(guard);
                    return Ok(GoalStatus::Paused);
                }
                if goal.steps[idx].status == StepStatus::Completed {
                    continue;
                }
                debug_assert!(goal.steps[idx].can_start(&goal.completed_step_ids()));

                let now = self.clock.now();
                let step = &mut goal.steps[idx];
                step.status = StepStatus::InProgress;
                step.executed_at = Some(now);
                step.result = None;
                let step = step.clone();
                goal.updated_at = now;
                (step, goal.clone())
            };
            self.sync(&snapshot).await;

            debug!("Executing step {} ({}) of goal {}", step.id, step.action, goal_id);
            let outcome = self.scheduler.dispatch(&step, &snapshot).await;

            let mut goals = self.goals.write().await;
            let goal = goals
                .get_mut(goal_id)
                .ok_or_else(|| AgentError::GoalNotFound(goal_id.to_string()))?;
            let now = self.clock.now();
            match outcome {
                Ok(value) => {
                    let state = &mut goal.steps[idx];
                    state.status = StepStatus::Completed;
                    state.result = Some(value);
                    goal.updated_at = now;
                    let snapshot = goal.clone();
                    drop(goals);
                    self.sync(&snapshot).await;
                }
                Err(e) => {
                    let state = &mut goal.steps[idx];
                    state.status = StepStatus::Failed;
                    state.result = Some(serde_json::json!({ "error": e.to_string() }));
                    goal.status = GoalStatus::Failed;
                    goal.updated_at = now;
                    let failed = goal.clone();
                    self.sync(&failed).await;

                    warn!("Goal {} failed at step {} ({}): {}", goal_id, step.id, e.kind(), e);
                    let _ = self.events.send(GoalEvent::Failed {
                        goal: failed,
                        error: e.to_string(),
                    });
                    drop(guard);
                    return Err(e);
                }
            }
        }

        let mut goals = self.goals.write().await;
        let goal = goals
            .get_mut(goal_id)
            .ok_or_else(|| AgentError::GoalNotFound(goal_id.to_string()))?;
        if goal.status == GoalStatus::Paused {
            drop(guard);
            return Ok(GoalStatus::Paused);
        }
        goal.status = GoalStatus::Completed;
        goal.updated_at = self.clock.now();
        let goal = goal.clone();

        self.persist_goal(&goal).await;
        self.memory.retire_goal(&goal.user_id, &goal).await;
        drop(guard);
        drop(goals);

        info!("Goal '{}' completed for user {}", goal.title, goal.user_id);
        let _ = self.events.send(GoalEvent::Completed { goal });

        Ok(GoalStatus::Completed)
    }

    /// Pause an in-progress goal; anything else is left untouched
    ///
    /// Returns `None` for unknown goals.
    pub async fn pause_goal(&self, goal_id: &str) -> Option<Goal> {
        self.get_goal(goal_id).await?;

        let goal = {
            let mut goals = self.goals.write().await;
            let goal = goals.get_mut(goal_id)?;
            if goal.status != GoalStatus::InProgress {
                return Some(goal.clone());
            }
            goal.status = GoalStatus::Paused;
            goal.updated_at = self.clock.now();
            goal.clone()
        };

        self.sync(&goal).await;
        info!("Paused goal '{}' at {:.0}%", goal.title, goal.progress() * 100.0);
        let _ = self.events.send(GoalEvent::Paused {
            goal_id: goal.id.clone(),
            user_id: goal.user_id.clone(),
        });
        Some(goal)
    }

    /// Resume a goal from its first non-completed step
    ///
    /// Returns `Ok(None)` for unknown goals. When an executor is still
    /// finishing an in-flight step, only the status flips back and that
    /// executor carries on.
    pub async fn resume_goal(&self, goal_id: &str) -> Result<Option<GoalStatus>> {
        if self.get_goal(goal_id).await.is_none() {
            return Ok(None);
        }

        let (goal, running) = {
            let mut goals = self.goals.write().await;
            let Some(goal) = goals.get_mut(goal_id) else {
                return Ok(None);
            };
            if goal.status == GoalStatus::Completed {
                return Ok(Some(GoalStatus::Completed));
            }

            // Executors release their guard under this lock
            let running = self.executing.lock().contains(goal_id);
            goal.status = GoalStatus::InProgress;
            if !running {
                for step in goal.steps.iter_mut().filter(|s| s.status != StepStatus::Completed) {
                    step.status = StepStatus::Pending;
                }
            }
            goal.updated_at = self.clock.now();
            (goal.clone(), running)
        };

        self.sync(&goal).await;
        match goal.first_open_step() {
            Some(step) => info!("Resumed goal '{}' at step {}", goal.title, step.id),
            None => info!("Resumed goal '{}'", goal.title),
        }

        if running {
            return Ok(Some(GoalStatus::InProgress));
        }
        self.execute_goal(goal_id).await.map(Some)
    }

    /// Look up a goal, hydrating it from durable storage if needed
    pub async fn get_goal(&self, goal_id: &str) -> Option<Goal> {
        if let Some(goal) = self.goals.read().await.get(goal_id) {
            return Some(goal.clone());
        }

        let key = StorageKey::Goal(goal_id.to_string());
        let stored = match load_json::<Goal>(self.persistence.as_ref(), &key).await {
            Ok(goal) => goal?,
            Err(e) => {
                warn!("Failed to load goal {}: {}", goal_id, e);
                return None;
            }
        };

        let mut goals = self.goals.write().await;
        Some(goals.entry(goal_id.to_string()).or_insert(stored).clone())
    }

    /// Pending, in-progress and paused goals, highest priority first
    pub async fn get_active_goals(&self, user_id: &str) -> Vec<Goal> {
        self.hydrate_user(user_id).await;

        let mut active: Vec<Goal> = self
            .goals
            .read()
            .await
            .values()
            .filter(|g| g.user_id == user_id && g.status.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        active
    }

    /// Every goal of a user known to this process, including finished ones
    pub async fn goals_for_user(&self, user_id: &str) -> Vec<Goal> {
        self.hydrate_user(user_id).await;

        let mut goals: Vec<Goal> = self
            .goals
            .read()
            .await
            .values()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect();
        goals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        goals
    }

    /// Load a user's working-memory goals into the table
    ///
    /// Goals persisted as in-progress without a live executor were
    /// interrupted by a restart; they come back paused so they can be resumed.
    async fn hydrate_user(&self, user_id: &str) {
        let Some(memory) = self.memory.load_user_memory(user_id).await else {
            return;
        };

        let mut recovered = Vec::new();
        {
            let executing = self.executing.lock().clone();
            let mut goals = self.goals.write().await;
            for mut goal in memory.working_memory.current_goals {
                if goals.contains_key(&goal.id) {
                    continue;
                }
                if goal.status == GoalStatus::InProgress && !executing.contains(&goal.id) {
                    goal.status = GoalStatus::Paused;
                    for step in goal.steps.iter_mut().filter(|s| s.status == StepStatus::InProgress) {
                        step.status = StepStatus::Pending;
                    }
                    recovered.push(goal.clone());
                }
                goals.insert(goal.id.clone(), goal);
            }
        }

        for goal in recovered {
            info!("Recovered interrupted goal '{}' as paused", goal.title);
            self.sync(&goal).await;
        }
    }

    /// Write a goal to its record and to the owner's working memory
    async fn sync(&self, goal: &Goal) {
        self.persist_goal(goal).await;
        self.memory.upsert_current_goal(&goal.user_id, goal).await;
    }

    async fn persist_goal(&self, goal: &Goal) {
        let key = StorageKey::Goal(goal.id.clone());
        if let Err(e) = store_json(self.persistence.as_ref(), &key, goal).await {
            warn!("Failed to persist goal {}: {}", goal.id, e);
        }
    }
}
