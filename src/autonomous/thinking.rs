//! Autonomous Thinking Loop
//!
//! Periodic control cycle that ties the agent together:
//! - Learns from goal outcomes (completion, failure, pause events)
//! - Expires stale suggestions and proposes new ones per user
//! - Starts pending goals on its own once the decision engine is independent
//!
//! Only one cycle runs at a time. A tick that arrives while a cycle is still
//! running is skipped and counted, never queued. Each cycle runs in its own
//! task, and a failing or panicking cycle is logged without stopping the
//! ticker.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::autonomous::decision::DecisionEngine;
use crate::autonomous::goals::{Goal, GoalEvent, GoalStatus, GoalStore};
use crate::autonomous::suggestions::{
    SuggestedAction, SuggestionDraft, SuggestionRegistry, SuggestionSource, SuggestionType,
};
use crate::clock::Clock;
use crate::error::{AgentError, Result};
use crate::memory::{AgentMemory, MemoryStore};

/// Paused this long without activity earns a reminder
const STALE_PAUSE_HOURS: i64 = 24;
/// Deadlines closer than this earn a reminder
const DEADLINE_WINDOW_HOURS: i64 = 24;
/// Failed goals are only revisited while the failure is recent
const RECENT_FAILURE_HOURS: i64 = 24;

/// Quality credited to a goal that completed
const COMPLETED_QUALITY: f64 = 0.9;
const FAILED_QUALITY: f64 = 0.2;

/// Option meaning "leave the goal for the user"
const WAIT_OPTION: &str = "wait for user";

/// Configuration for the thinking loop
#[derive(Debug, Clone)]
pub struct ThinkingConfig {
    /// Time between ticks
    pub interval: Duration,
    pub enabled: bool,
    /// Allow the loop to start pending goals by itself
    pub autonomous_execution: bool,
}

impl Default for ThinkingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            enabled: true,
            autonomous_execution: true,
        }
    }
}

/// Loop counters
#[derive(Debug, Default)]
pub struct ThinkingStats {
    pub cycles_completed: AtomicU64,
    pub cycles_skipped: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub suggestions_generated: AtomicU64,
    pub outcomes_learned: AtomicU64,
    pub goals_started: AtomicU64,
}

/// Point-in-time copy of `ThinkingStats`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThinkingSnapshot {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub cycles_failed: u64,
    pub suggestions_generated: u64,
    pub outcomes_learned: u64,
    pub goals_started: u64,
}

impl ThinkingStats {
    pub fn snapshot(&self) -> ThinkingSnapshot {
        ThinkingSnapshot {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            suggestions_generated: self.suggestions_generated.load(Ordering::Relaxed),
            outcomes_learned: self.outcomes_learned.load(Ordering::Relaxed),
            goals_started: self.goals_started.load(Ordering::Relaxed),
        }
    }
}

/// Result of one `run_cycle` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { suggestions: usize },
    /// Another cycle was still running
    Skipped,
}

/// Clears the running flag however the cycle ends
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to a spawned ticker
pub struct ThinkingHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ThinkingHandle {
    /// Stop the ticker and wait for it and any in-flight cycle to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Thinking loop task ended abnormally: {}", e);
        }
    }
}

/// The periodic control loop
pub struct ThinkingLoop {
    config: ThinkingConfig,
    stats: Arc<ThinkingStats>,
    running: AtomicBool,
    goals: Arc<GoalStore>,
    memory: Arc<MemoryStore>,
    suggestions: Arc<SuggestionRegistry>,
    decisions: Arc<DecisionEngine>,
    source: Option<Arc<dyn SuggestionSource>>,
    clock: Arc<dyn Clock>,
    events: Mutex<broadcast::Receiver<GoalEvent>>,
    /// goal id → decision that started it
    started_by_decision: parking_lot::Mutex<HashMap<String, String>>,
}

impl ThinkingLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ThinkingConfig,
        goals: Arc<GoalStore>,
        memory: Arc<MemoryStore>,
        suggestions: Arc<SuggestionRegistry>,
        decisions: Arc<DecisionEngine>,
        source: Option<Arc<dyn SuggestionSource>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = Mutex::new(goals.subscribe());
        Self {
            config,
            stats: Arc::new(ThinkingStats::default()),
            running: AtomicBool::new(false),
            goals,
            memory,
            suggestions,
            decisions,
            source,
            clock,
            events,
            started_by_decision: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> ThinkingSnapshot {
        self.stats.snapshot()
    }

    /// Check if a cycle is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one cycle unless one is already in flight
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.stats.cycles_skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Thinking cycle still running, skipping tick");
            return Ok(CycleOutcome::Skipped);
        }
        let _guard = CycleGuard(&self.running);

        let failure = match AssertUnwindSafe(self.think()).catch_unwind().await {
            Ok(Ok(suggestions)) => {
                self.stats.cycles_completed.fetch_add(1, Ordering::Relaxed);
                return Ok(CycleOutcome::Completed { suggestions });
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                format!("panicked: {}", message)
            }
        };

        self.stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
        error!("Thinking cycle failed: {}", failure);
        Err(AgentError::CycleFailure(failure))
    }

    /// Tick until `shutdown` flips to true, then drain the running cycle
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Thinking loop disabled");
            return;
        }

        info!("Starting thinking loop (every {:?})", self.config.interval);
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cycles = JoinSet::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while cycles.try_join_next().is_some() {}
                    let this = Arc::clone(&self);
                    cycles.spawn(async move {
                        // Failures are already logged and counted
                        let _ = this.run_cycle().await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Thinking loop shutting down");
                        break;
                    }
                }
            }
        }

        if !cycles.is_empty() {
            debug!("Waiting for in-flight thinking cycle");
        }
        while cycles.join_next().await.is_some() {}
    }

    /// Spawn the ticker as a background task
    pub fn spawn(self: &Arc<Self>) -> ThinkingHandle {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(self).run(rx));
        ThinkingHandle { shutdown: tx, task }
    }

    /// One pass over every known user; returns suggestions added
    async fn think(&self) -> Result<usize> {
        self.learn_from_outcomes().await;

        let mut added = 0;
        for user_id in self.memory.known_users().await {
            added += self.think_for_user(&user_id).await;
        }

        self.stats.suggestions_generated.fetch_add(added as u64, Ordering::Relaxed);
        debug!("Thinking cycle finished, {} new suggestions", added);
        Ok(added)
    }

    /// Drain goal events into decision feedback and user memory
    async fn learn_from_outcomes(&self) {
        let mut events = Vec::new();
        {
            let mut rx = self.events.lock().await;
            loop {
                match rx.try_recv() {
                    Ok(event) => events.push(event),
                    Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                        warn!("Missed {} goal events", missed);
                    }
                    Err(_) => break,
                }
            }
        }

        for event in events {
            match event {
                GoalEvent::Completed { goal } => {
                    self.learn_goal_outcome(&goal, true, COMPLETED_QUALITY).await;
                    self.memory
                        .record_interaction(&goal.user_id, "goal_completed", &goal.title)
                        .await;
                }
                GoalEvent::Failed { goal, error } => {
                    self.learn_goal_outcome(&goal, false, FAILED_QUALITY).await;
                    self.memory
                        .record_interaction(&goal.user_id, "goal_failed", &format!("{}: {}", goal.title, error))
                        .await;
                }
                GoalEvent::Paused { goal_id, user_id } => {
                    self.memory.record_interaction(&user_id, "goal_paused", &goal_id).await;
                }
            }
            self.stats.outcomes_learned.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn learn_goal_outcome(&self, goal: &Goal, success: bool, quality: f64) {
        let decision_id = self.started_by_decision.lock().remove(&goal.id);
        match decision_id {
            Some(decision_id) => {
                if let Err(e) = self.decisions.record_outcome(&decision_id, success, quality).await {
                    warn!("Failed to record outcome of {}: {}", decision_id, e);
                }
            }
            None => self.decisions.record_feedback(success, quality).await,
        }

        let counter = if success { "goals_completed" } else { "goals_failed" };
        self.memory
            .update(&goal.user_id, |memory| {
                let patterns = &mut memory.long_term_memory.learned_patterns;
                bump_counter(patterns, counter);
                bump_counter(patterns, &format!("priority_{}_{}", goal.priority.as_str(), counter));
            })
            .await;
    }

    async fn think_for_user(&self, user_id: &str) -> usize {
        self.suggestions.clear_old_suggestions(user_id).await;

        let Some(memory) = self.memory.load_user_memory(user_id).await else {
            return 0;
        };
        let goals = self.goals.goals_for_user(user_id).await;
        let now = self.clock.now();

        let mut drafts = analyze_state(&goals, &memory, now);
        if let Some(source) = &self.source {
            match source.propose(&memory).await {
                Ok(mut proposed) => drafts.append(&mut proposed),
                Err(e) => warn!("Suggestion source failed for {}: {}", user_id, e),
            }
        }

        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for draft in drafts {
            if draft.title.is_empty() || !seen.insert(draft.dedupe_key()) {
                continue;
            }
            if self.suggestions.is_duplicate(user_id, &draft).await {
                continue;
            }
            fresh.push(draft.into_suggestion(now));
        }

        let added = fresh.len();
        if added > 0 {
            self.suggestions.add_suggestions(user_id, fresh).await;
            info!("Proposed {} suggestions for {}", added, user_id);
        }

        if self.config.autonomous_execution {
            self.maybe_start_goal(&goals).await;
        }

        added
    }

    /// Let the decision engine pick whether to start the oldest pending goal
    async fn maybe_start_goal(&self, goals: &[Goal]) {
        if !self.decisions.can_act().await {
            return;
        }

        let candidate = {
            let started = self.started_by_decision.lock();
            goals
                .iter()
                .filter(|g| g.status == GoalStatus::Pending && !started.contains_key(&g.id))
                .min_by_key(|g| g.created_at)
                .cloned()
        };
        let Some(goal) = candidate else {
            return;
        };

        let start = format!("start goal: {}", goal.title);
        let options = vec![start.clone(), WAIT_OPTION.to_string()];
        let decision = match self.decisions.make_autonomous_decision(&start, &options).await {
            Ok(decision) => decision,
            Err(e) => {
                debug!("No autonomous decision for {}: {}", goal.id, e);
                return;
            }
        };

        if decision.decision == start {
            self.started_by_decision
                .lock()
                .insert(goal.id.clone(), decision.decision_id.clone());
            self.goals.spawn_execution(&goal.id);
            self.stats.goals_started.fetch_add(1, Ordering::Relaxed);
            info!(
                "Autonomously started goal '{}' (confidence {:.2})",
                goal.title, decision.confidence
            );
        }
    }
}

fn bump_counter(counters: &mut serde_json::Map<String, Value>, key: &str) {
    let count = counters.get(key).and_then(Value::as_u64).unwrap_or(0);
    counters.insert(key.to_string(), Value::from(count + 1));
}

/// Heuristic suggestions from a user's goals
pub fn analyze_state(goals: &[Goal], memory: &AgentMemory, now: DateTime<Utc>) -> Vec<SuggestionDraft> {
    let mut drafts = Vec::new();

    for goal in goals {
        let resume = SuggestedAction::new("resume_goal").with_param("goalId", goal.id.clone());

        match goal.status {
            GoalStatus::Paused if now - goal.updated_at >= chrono::Duration::hours(STALE_PAUSE_HOURS) => {
                drafts.push(
                    SuggestionDraft::new(SuggestionType::Reminder, &format!("Resume: {}", goal.title), &goal.description)
                        .with_confidence(0.6)
                        .with_reasoning("Goal has been paused for more than a day")
                        .with_action(resume.clone()),
                );
            }
            GoalStatus::Failed if now - goal.updated_at <= chrono::Duration::hours(RECENT_FAILURE_HOURS) => {
                drafts.push(
                    SuggestionDraft::new(SuggestionType::Improvement, &format!("Retry: {}", goal.title), &goal.description)
                        .with_confidence(0.5)
                        .with_reasoning("A step failed; adjusting parameters and retrying may succeed")
                        .with_action(resume.clone()),
                );
            }
            _ => {}
        }

        if let Some(deadline) = goal.deadline {
            let remaining = deadline - now;
            if goal.status.is_active()
                && remaining >= chrono::Duration::zero()
                && remaining <= chrono::Duration::hours(DEADLINE_WINDOW_HOURS)
            {
                drafts.push(
                    SuggestionDraft::new(
                        SuggestionType::Reminder,
                        &format!("Deadline approaching: {}", goal.title),
                        &format!("Due {}", deadline.to_rfc3339()),
                    )
                    .with_confidence(0.8)
                    .with_reasoning("Deadline is less than a day away")
                    .with_action(resume),
                );
            }
        }
    }

    let has_active = goals.iter().any(|g| g.status.is_active());
    if let (false, Some(last)) = (has_active, memory.long_term_memory.completed_goals.last()) {
        drafts.push(
            SuggestionDraft::new(
                SuggestionType::Opportunity,
                &format!("Build on: {}", last.title),
                "No goals are in progress; a follow-up could keep momentum",
            )
            .with_confidence(0.4)
            .with_reasoning("All goals are finished")
            .with_action(
                SuggestedAction::new("create_goal").with_param("description", format!("Follow up on {}", last.title)),
            ),
        );
    }

    drafts
}
