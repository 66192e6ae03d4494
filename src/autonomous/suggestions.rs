//! Proactive Suggestions
//!
//! Per-user, bounded and time-decaying list of things the agent thinks the
//! user might want to do next. Lists are loaded lazily from storage the first
//! time a user is touched in this process, then served from cache and written
//! through on every change.
//!
//! Duplicates (same id, or same type and normalized title) collapse to the
//! newest entry; lists are kept newest first and capped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::memory::AgentMemory;
use crate::persistence::{load_json, store_json, PersistencePort, StorageKey};

/// Kind of suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionType {
    Task,
    Improvement,
    Insight,
    Reminder,
    Opportunity,
}

impl SuggestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionType::Task => "task",
            SuggestionType::Improvement => "improvement",
            SuggestionType::Insight => "insight",
            SuggestionType::Reminder => "reminder",
            SuggestionType::Opportunity => "opportunity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "task" => Some(SuggestionType::Task),
            "improvement" => Some(SuggestionType::Improvement),
            "insight" => Some(SuggestionType::Insight),
            "reminder" => Some(SuggestionType::Reminder),
            "opportunity" => Some(SuggestionType::Opportunity),
            _ => None,
        }
    }
}

/// What accepting a suggestion would do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl SuggestedAction {
    pub fn new(action_type: &str) -> Self {
        Self {
            action_type: action_type.to_string(),
            parameters: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }
}

/// A stored suggestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProactiveSuggestion {
    pub id: String,
    #[serde(rename = "type")]
    pub suggestion_type: SuggestionType,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub reasoning: String,
    pub suggested_action: SuggestedAction,
    pub created_at: DateTime<Utc>,
}

impl ProactiveSuggestion {
    /// Identity used for duplicate detection across ids
    pub fn dedupe_key(&self) -> String {
        dedupe_key(self.suggestion_type, &self.title)
    }
}

/// A suggestion before it gets an id and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct SuggestionDraft {
    pub suggestion_type: SuggestionType,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub reasoning: String,
    pub suggested_action: SuggestedAction,
}

impl SuggestionDraft {
    pub fn new(suggestion_type: SuggestionType, title: &str, description: &str) -> Self {
        Self {
            suggestion_type,
            title: title.trim().to_string(),
            description: description.to_string(),
            confidence: 0.5,
            reasoning: String::new(),
            suggested_action: SuggestedAction::new("create_goal").with_param("description", title.trim()),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        self.reasoning = reasoning.to_string();
        self
    }

    pub fn with_action(mut self, action: SuggestedAction) -> Self {
        self.suggested_action = action;
        self
    }

    pub fn dedupe_key(&self) -> String {
        dedupe_key(self.suggestion_type, &self.title)
    }

    pub fn into_suggestion(self, now: DateTime<Utc>) -> ProactiveSuggestion {
        ProactiveSuggestion {
            id: format!("suggestion_{}", uuid::Uuid::new_v4()),
            suggestion_type: self.suggestion_type,
            title: self.title,
            description: self.description,
            confidence: self.confidence,
            reasoning: self.reasoning,
            suggested_action: self.suggested_action,
            created_at: now,
        }
    }
}

/// `type:normalized title`, ignoring case, punctuation and spacing
pub fn dedupe_key(suggestion_type: SuggestionType, title: &str) -> String {
    let normalized: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    format!(
        "{}:{}",
        suggestion_type.as_str(),
        normalized.split_whitespace().collect::<Vec<_>>().join(" ")
    )
}

/// Extra suggestion ideas from a collaborator (usually an LLM)
#[async_trait]
pub trait SuggestionSource: Send + Sync {
    async fn propose(&self, memory: &AgentMemory) -> anyhow::Result<Vec<SuggestionDraft>>;
}

/// Registry limits
#[derive(Debug, Clone)]
pub struct SuggestionConfig {
    pub max_per_user: usize,
    /// Suggestions older than this are dropped
    pub ttl: chrono::Duration,
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            max_per_user: 10,
            ttl: chrono::Duration::hours(24),
        }
    }
}

/// Per-user suggestion lists
pub struct SuggestionRegistry {
    config: SuggestionConfig,
    cache: RwLock<HashMap<String, Vec<ProactiveSuggestion>>>,
    /// Dedupe keys the user dismissed during this process lifetime
    dismissed: parking_lot::Mutex<HashMap<String, HashSet<String>>>,
    persistence: Arc<dyn PersistencePort>,
    clock: Arc<dyn Clock>,
}

impl SuggestionRegistry {
    pub fn new(config: SuggestionConfig, persistence: Arc<dyn PersistencePort>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
            dismissed: parking_lot::Mutex::new(HashMap::new()),
            persistence,
            clock,
        }
    }

    pub fn config(&self) -> &SuggestionConfig {
        &self.config
    }

    /// Load a user's list on first access; returns true if it was loaded now
    async fn ensure_loaded(&self, user_id: &str) -> bool {
        if self.cache.read().await.contains_key(user_id) {
            return false;
        }

        let key = StorageKey::Suggestions(user_id.to_string());
        let stored = match load_json::<Vec<ProactiveSuggestion>>(self.persistence.as_ref(), &key).await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => {
                warn!("Failed to load suggestions for {}: {}", user_id, e);
                Vec::new()
            }
        };

        let mut cache = self.cache.write().await;
        if cache.contains_key(user_id) {
            return false;
        }
        debug!("Loaded {} suggestions for {}", stored.len(), user_id);
        cache.insert(user_id.to_string(), stored);
        true
    }

    /// Merge new suggestions into a user's list
    ///
    /// Returns the resulting list, newest first.
    pub async fn add_suggestions(&self, user_id: &str, new: Vec<ProactiveSuggestion>) -> Vec<ProactiveSuggestion> {
        self.ensure_loaded(user_id).await;

        let dismissed = self.dismissed.lock().get(user_id).cloned().unwrap_or_default();
        let new: Vec<ProactiveSuggestion> = new
            .into_iter()
            .filter(|s| !dismissed.contains(&s.dedupe_key()))
            .collect();
        if new.is_empty() {
            return self.cached(user_id).await;
        }

        let merged = {
            let mut cache = self.cache.write().await;
            let list = cache.entry(user_id.to_string()).or_default();

            // Newcomers first so they win ties on created_at
            let mut merged = new;
            merged.append(list);
            merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            let mut ids = HashSet::new();
            let mut keys = HashSet::new();
            merged.retain(|s| ids.insert(s.id.clone()) && keys.insert(s.dedupe_key()));
            merged.truncate(self.config.max_per_user);

            *list = merged.clone();
            merged
        };

        self.persist(user_id, &merged).await;
        debug!("User {} now has {} suggestions", user_id, merged.len());
        merged
    }

    /// Current suggestions for a user, newest first, expired ones removed
    pub async fn get_proactive_suggestions(&self, user_id: &str) -> Vec<ProactiveSuggestion> {
        self.ensure_loaded(user_id).await;
        self.clear_old_suggestions(user_id).await;
        self.cached(user_id).await
    }

    /// Drop suggestions older than the TTL; returns how many were removed
    pub async fn clear_old_suggestions(&self, user_id: &str) -> usize {
        self.ensure_loaded(user_id).await;

        let cutoff = self.clock.now() - self.config.ttl;
        let (removed, remaining) = {
            let mut cache = self.cache.write().await;
            let Some(list) = cache.get_mut(user_id) else {
                return 0;
            };
            let before = list.len();
            list.retain(|s| s.created_at >= cutoff);
            (before - list.len(), list.clone())
        };

        if removed > 0 {
            info!("Expired {} suggestions for {}", removed, user_id);
            self.persist(user_id, &remaining).await;
        }
        removed
    }

    pub async fn find(&self, user_id: &str, suggestion_id: &str) -> Option<ProactiveSuggestion> {
        self.ensure_loaded(user_id).await;
        self.cache
            .read()
            .await
            .get(user_id)?
            .iter()
            .find(|s| s.id == suggestion_id)
            .cloned()
    }

    /// Remove one suggestion; `None` if it was not there
    pub async fn remove_suggestion(&self, user_id: &str, suggestion_id: &str) -> Option<ProactiveSuggestion> {
        self.ensure_loaded(user_id).await;

        let (removed, remaining) = {
            let mut cache = self.cache.write().await;
            let list = cache.get_mut(user_id)?;
            let idx = list.iter().position(|s| s.id == suggestion_id)?;
            let removed = list.remove(idx);
            (removed, list.clone())
        };

        self.persist(user_id, &remaining).await;
        Some(removed)
    }

    /// Remember a dismissal so the same idea is not proposed again
    pub fn mark_dismissed(&self, user_id: &str, suggestion: &ProactiveSuggestion) {
        self.dismissed
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(suggestion.dedupe_key());
    }

    /// Whether a draft repeats a dismissed or currently listed suggestion
    pub async fn is_duplicate(&self, user_id: &str, draft: &SuggestionDraft) -> bool {
        let key = draft.dedupe_key();
        if self
            .dismissed
            .lock()
            .get(user_id)
            .is_some_and(|keys| keys.contains(&key))
        {
            return true;
        }

        self.ensure_loaded(user_id).await;
        self.cache
            .read()
            .await
            .get(user_id)
            .is_some_and(|list| list.iter().any(|s| s.dedupe_key() == key))
    }

    /// Total suggestions held in cache across users
    pub async fn total(&self) -> usize {
        self.cache.read().await.values().map(|l| l.len()).sum()
    }

    async fn cached(&self, user_id: &str) -> Vec<ProactiveSuggestion> {
        self.cache.read().await.get(user_id).cloned().unwrap_or_default()
    }

    async fn persist(&self, user_id: &str, list: &[ProactiveSuggestion]) {
        let key = StorageKey::Suggestions(user_id.to_string());
        if let Err(e) = store_json(self.persistence.as_ref(), &key, list).await {
            warn!("Failed to persist suggestions for {}: {}", user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::InMemoryPersistence;
    use chrono::Duration;

    fn registry() -> (SuggestionRegistry, Arc<ManualClock>, Arc<InMemoryPersistence>) {
        let clock = Arc::new(ManualClock::starting_now());
        let persistence = Arc::new(InMemoryPersistence::new());
        let registry = SuggestionRegistry::new(SuggestionConfig::default(), persistence.clone(), clock.clone());
        (registry, clock, persistence)
    }

    fn suggestion(title: &str, at: DateTime<Utc>) -> ProactiveSuggestion {
        SuggestionDraft::new(SuggestionType::Task, title, "").into_suggestion(at)
    }

    #[test]
    fn test_dedupe_key_normalizes() {
        assert_eq!(
            dedupe_key(SuggestionType::Task, "  Review   PRs! "),
            dedupe_key(SuggestionType::Task, "review prs")
        );
        assert_ne!(
            dedupe_key(SuggestionType::Task, "review prs"),
            dedupe_key(SuggestionType::Insight, "review prs")
        );
    }

    #[tokio::test]
    async fn test_cap_and_order() {
        let (registry, clock, _) = registry();
        let start = clock.now();

        let batch: Vec<_> = (0..12)
            .map(|i| suggestion(&format!("idea {}", i), start + Duration::minutes(i)))
            .collect();
        let list = registry.add_suggestions("u1", batch).await;

        assert_eq!(list.len(), 10);
        assert_eq!(list[0].title, "idea 11");
        assert_eq!(list[9].title, "idea 2");
        assert!(list.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn test_duplicate_title_newest_wins() {
        let (registry, clock, _) = registry();
        let t0 = clock.now();

        registry.add_suggestions("u1", vec![suggestion("Clean up notes", t0)]).await;
        let newer = suggestion("clean up NOTES", t0 + Duration::minutes(5));
        let list = registry.add_suggestions("u1", vec![newer.clone()]).await;

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, newer.id);
    }

    #[tokio::test]
    async fn test_expiry() {
        let (registry, clock, _) = registry();
        let t0 = clock.now();
        registry
            .add_suggestions(
                "u1",
                vec![
                    suggestion("old", t0 - Duration::hours(25)),
                    suggestion("recent", t0 - Duration::hours(23)),
                ],
            )
            .await;

        let list = registry.get_proactive_suggestions("u1").await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "recent");

        clock.advance(Duration::hours(2));
        assert_eq!(registry.clear_old_suggestions("u1").await, 1);
        assert!(registry.get_proactive_suggestions("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_lazy_load_from_storage() {
        let (registry, clock, persistence) = registry();
        let stored = vec![suggestion("from disk", clock.now())];
        store_json(persistence.as_ref(), &StorageKey::Suggestions("u1".into()), &stored)
            .await
            .unwrap();

        let list = registry.get_proactive_suggestions("u1").await;
        assert_eq!(list, stored);
    }

    #[tokio::test]
    async fn test_remove_persists() {
        let (registry, clock, persistence) = registry();
        let s = suggestion("to remove", clock.now());
        registry.add_suggestions("u1", vec![s.clone()]).await;

        assert_eq!(registry.remove_suggestion("u1", &s.id).await, Some(s.clone()));
        assert!(registry.remove_suggestion("u1", &s.id).await.is_none());

        let fresh = SuggestionRegistry::new(SuggestionConfig::default(), persistence, clock);
        assert!(fresh.get_proactive_suggestions("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_dismissed_not_readded() {
        let (registry, clock, _) = registry();
        let s = suggestion("Learn piano", clock.now());
        registry.add_suggestions("u1", vec![s.clone()]).await;
        registry.mark_dismissed("u1", &s);
        registry.remove_suggestion("u1", &s.id).await;

        let draft = SuggestionDraft::new(SuggestionType::Task, "learn piano", "");
        assert!(registry.is_duplicate("u1", &draft).await);
        let list = registry.add_suggestions("u1", vec![draft.into_suggestion(clock.now())]).await;
        assert!(list.is_empty());
    }
}
