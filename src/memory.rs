//! Per-User Agent Memory
//!
//! One `AgentMemory` per user, split into short-lived working memory (current
//! goals, active context, recent interactions) and accumulated long-term
//! memory (preferences, learned patterns, completed goals).
//!
//! Memories are cached in process and mirrored to the persistence port on
//! every mutation. Writes for one user are serialized through a per-user
//! async mutex so concurrent goal executions cannot lose each other's updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::autonomous::goals::Goal;
use crate::clock::Clock;
use crate::persistence::{load_json, store_json, PersistencePort, StorageKey};

/// Maximum recent interactions kept in working memory
pub const MAX_RECENT_INTERACTIONS: usize = 50;

/// Something that happened with or for the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub summary: String,
}

/// Accumulated knowledge about a user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongTermMemory {
    #[serde(default)]
    pub user_preferences: Map<String, Value>,
    #[serde(default)]
    pub learned_patterns: Map<String, Value>,
    #[serde(default)]
    pub completed_goals: Vec<Goal>,
    #[serde(default)]
    pub user_context: Map<String, Value>,
}

/// Short-lived state for the current session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingMemory {
    #[serde(default)]
    pub current_goals: Vec<Goal>,
    #[serde(default)]
    pub active_context: Map<String, Value>,
    #[serde(default)]
    pub recent_interactions: Vec<Interaction>,
}

/// Durable per-user state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMemory {
    pub user_id: String,
    pub session_id: String,
    pub long_term_memory: LongTermMemory,
    pub working_memory: WorkingMemory,
    pub last_updated: DateTime<Utc>,
}

impl AgentMemory {
    /// Empty memory for a user
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            long_term_memory: LongTermMemory::default(),
            working_memory: WorkingMemory::default(),
            last_updated: now,
        }
    }

    /// Find a goal in working memory
    pub fn current_goal(&self, goal_id: &str) -> Option<&Goal> {
        self.working_memory.current_goals.iter().find(|g| g.id == goal_id)
    }

    fn push_interaction(&mut self, interaction: Interaction) {
        let recent = &mut self.working_memory.recent_interactions;
        recent.push(interaction);
        if recent.len() > MAX_RECENT_INTERACTIONS {
            let overflow = recent.len() - MAX_RECENT_INTERACTIONS;
            recent.drain(..overflow);
        }
    }
}

/// Aggregate counts across cached memories
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub users: usize,
    pub active_goals: usize,
    pub completed_goals: usize,
    pub recent_interactions: usize,
    pub learned_patterns: usize,
}

type Entry = Arc<Mutex<AgentMemory>>;

/// Owner of every `AgentMemory`
pub struct MemoryStore {
    persistence: Arc<dyn PersistencePort>,
    clock: Arc<dyn Clock>,
    users: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new(persistence: Arc<dyn PersistencePort>, clock: Arc<dyn Clock>) -> Self {
        Self {
            persistence,
            clock,
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Load a user's memory, or `None` if it was never created
    pub async fn load_user_memory(&self, user_id: &str) -> Option<AgentMemory> {
        let entry = self.existing_entry(user_id).await?;
        let memory = entry.lock().await;
        Some(memory.clone())
    }

    /// Replace a user's memory and write it through
    ///
    /// Returns the stored value with its fresh `last_updated` stamp.
    pub async fn save_user_memory(&self, user_id: &str, memory: AgentMemory) -> AgentMemory {
        let entry = match self.existing_entry(user_id).await {
            Some(entry) => entry,
            None => self.insert_entry(user_id, memory.clone()).await,
        };

        let mut current = entry.lock().await;
        let previous = current.last_updated;
        *current = memory;
        current.last_updated = previous.max(current.last_updated);
        self.stamp(&mut current);
        self.write_through(&current).await;
        current.clone()
    }

    /// Get the user's memory, creating and persisting an empty one if needed
    pub async fn get_or_create(&self, user_id: &str) -> AgentMemory {
        let entry = self.entry(user_id).await;
        let memory = entry.lock().await;
        memory.clone()
    }

    /// Serialized read-modify-write of one user's memory
    pub async fn update<F, R>(&self, user_id: &str, f: F) -> R
    where
        F: FnOnce(&mut AgentMemory) -> R,
    {
        let entry = self.entry(user_id).await;
        let mut memory = entry.lock().await;
        let result = f(&mut memory);
        self.stamp(&mut memory);
        self.write_through(&memory).await;
        result
    }

    /// Insert or replace a goal in working memory
    pub async fn upsert_current_goal(&self, user_id: &str, goal: &Goal) {
        self.update(user_id, |memory| {
            let goals = &mut memory.working_memory.current_goals;
            match goals.iter_mut().find(|g| g.id == goal.id) {
                Some(existing) => *existing = goal.clone(),
                None => goals.push(goal.clone()),
            }
        })
        .await
    }

    /// Move a finished goal from working memory into long-term memory
    pub async fn retire_goal(&self, user_id: &str, goal: &Goal) {
        self.update(user_id, |memory| {
            memory.working_memory.current_goals.retain(|g| g.id != goal.id);
            let completed = &mut memory.long_term_memory.completed_goals;
            match completed.iter_mut().find(|g| g.id == goal.id) {
                Some(existing) => *existing = goal.clone(),
                None => completed.push(goal.clone()),
            }
        })
        .await;
        debug!("Retired goal {} for user {}", goal.id, user_id);
    }

    /// Append to the user's recent interactions
    pub async fn record_interaction(&self, user_id: &str, kind: &str, summary: &str) {
        let at = self.clock.now();
        self.update(user_id, |memory| {
            memory.push_interaction(Interaction {
                at,
                kind: kind.to_string(),
                summary: summary.to_string(),
            })
        })
        .await
    }

    /// Users with a memory cached in this process
    pub async fn known_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.users.read().await.keys().cloned().collect();
        users.sort();
        users
    }

    /// Aggregate statistics over cached memories
    pub async fn stats(&self) -> MemoryStats {
        let entries: Vec<Entry> = self.users.read().await.values().cloned().collect();
        let mut stats = MemoryStats {
            users: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            let memory = entry.lock().await;
            stats.active_goals += memory
                .working_memory
                .current_goals
                .iter()
                .filter(|g| g.status.is_active())
                .count();
            stats.completed_goals += memory.long_term_memory.completed_goals.len();
            stats.recent_interactions += memory.working_memory.recent_interactions.len();
            stats.learned_patterns += memory.long_term_memory.learned_patterns.len();
        }

        stats
    }

    /// Cached entry, falling back to durable storage; never creates
    async fn existing_entry(&self, user_id: &str) -> Option<Entry> {
        if let Some(entry) = self.users.read().await.get(user_id) {
            return Some(entry.clone());
        }

        let loaded = self.read_durable(user_id).await?;
        Some(self.insert_entry(user_id, loaded).await)
    }

    /// Cached or durable entry, creating an empty memory when absent
    async fn entry(&self, user_id: &str) -> Entry {
        if let Some(entry) = self.existing_entry(user_id).await {
            return entry;
        }

        let fresh = AgentMemory::new(user_id, self.clock.now());
        let entry = self.insert_entry(user_id, fresh).await;
        {
            let memory = entry.lock().await;
            self.write_through(&memory).await;
        }
        info!("Created agent memory for user {}", user_id);
        entry
    }

    /// Insert unless another task won the race; returns the cached entry
    async fn insert_entry(&self, user_id: &str, memory: AgentMemory) -> Entry {
        let mut users = self.users.write().await;
        users
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(memory)))
            .clone()
    }

    async fn read_durable(&self, user_id: &str) -> Option<AgentMemory> {
        let key = StorageKey::UserMemory(user_id.to_string());
        match load_json::<AgentMemory>(self.persistence.as_ref(), &key).await {
            Ok(memory) => memory,
            Err(e) => {
                warn!("Failed to load memory for user {}: {}", user_id, e);
                None
            }
        }
    }

    async fn write_through(&self, memory: &AgentMemory) {
        let key = StorageKey::UserMemory(memory.user_id.clone());
        if let Err(e) = store_json(self.persistence.as_ref(), &key, memory).await {
            warn!("Failed to persist memory for user {}: {}", memory.user_id, e);
        }
    }

    /// Advance `last_updated` strictly monotonically
    fn stamp(&self, memory: &mut AgentMemory) {
        let now = self.clock.now();
        memory.last_updated = if now > memory.last_updated {
            now
        } else {
            memory.last_updated + chrono::Duration::microseconds(1)
        };
    }
}
