//! Outcome Learning
//!
//! Learning patterns summarize how well past decisions in a given context
//! turned out. A pattern is keyed by the normalized prefix of the decision
//! context and is never deleted; each recorded outcome moves its frequency,
//! success rate, satisfaction and effectiveness.
//!
//! The table is loaded lazily from storage on first use and written back
//! after every change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::persistence::{load_json, store_json, PersistencePort, StorageKey};

/// Characters of normalized context that form a pattern key
pub const PATTERN_KEY_CHARS: usize = 50;

/// Effectiveness of a freshly created pattern
pub const INITIAL_EFFECTIVENESS: f64 = 0.7;

/// Effectiveness gained per successful outcome
const EFFECTIVENESS_STEP: f64 = 0.1;

/// A learned context → outcome association
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningPattern {
    pub id: String,
    /// Normalized context prefix; matched as a substring of new contexts
    pub pattern: String,
    /// Full context of the most recent outcome
    pub context: String,
    pub frequency: u64,
    pub success_rate: f64,
    pub user_satisfaction: f64,
    pub effectiveness: f64,
    pub timestamp: DateTime<Utc>,
}

impl LearningPattern {
    pub fn new(pattern: &str, context: &str, now: DateTime<Utc>) -> Self {
        let key = normalize_context(pattern);
        Self {
            id: pattern_id(&key),
            pattern: key,
            context: context.to_string(),
            frequency: 0,
            success_rate: 0.0,
            user_satisfaction: 0.0,
            effectiveness: INITIAL_EFFECTIVENESS,
            timestamp: now,
        }
    }

    /// Weight this pattern contributes to decision confidence
    pub fn weighted_success(&self) -> f64 {
        self.success_rate * self.effectiveness
    }

    fn record(&mut self, context: &str, success: bool, satisfaction: f64, now: DateTime<Utc>) {
        let previous = self.frequency as f64;
        self.frequency += 1;
        let n = self.frequency as f64;

        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = ((self.success_rate * previous + outcome) / n).clamp(0.0, 1.0);
        self.user_satisfaction =
            ((self.user_satisfaction * previous + satisfaction.clamp(0.0, 1.0)) / n).clamp(0.0, 1.0);

        // Brand-new patterns keep their initial effectiveness
        if success && previous > 0.0 {
            self.effectiveness = (self.effectiveness + EFFECTIVENESS_STEP).min(1.0);
        }

        self.context = context.to_string();
        self.timestamp = now;
    }
}

/// Lowercase, collapse whitespace, keep the leading key characters
pub fn normalize_context(context: &str) -> String {
    context
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(PATTERN_KEY_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn pattern_id(key: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("pattern_{}", hex::encode(&hasher.finalize()[..8]))
}

/// Shared, persisted pattern table
pub struct PatternTable {
    patterns: RwLock<Vec<LearningPattern>>,
    loaded: OnceCell<()>,
    persistence: Arc<dyn PersistencePort>,
    clock: Arc<dyn Clock>,
}

impl PatternTable {
    pub fn new(persistence: Arc<dyn PersistencePort>, clock: Arc<dyn Clock>) -> Self {
        Self {
            patterns: RwLock::new(Vec::new()),
            loaded: OnceCell::new(),
            persistence,
            clock,
        }
    }

    /// Pull the stored table in once per process
    async fn ensure_loaded(&self) {
        self.loaded
            .get_or_init(|| async {
                match load_json::<Vec<LearningPattern>>(self.persistence.as_ref(), &StorageKey::LearningPatterns)
                    .await
                {
                    Ok(Some(stored)) => {
                        info!("Loaded {} learning patterns", stored.len());
                        let mut patterns = self.patterns.write().await;
                        // Keep anything inserted before the first load
                        for p in stored {
                            if !patterns.iter().any(|existing| existing.pattern == p.pattern) {
                                patterns.push(p);
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Failed to load learning patterns: {}", e),
                }
            })
            .await;
    }

    /// Up to `limit` patterns found in `context`, most effective first
    pub async fn matching(&self, context: &str, limit: usize) -> Vec<LearningPattern> {
        self.ensure_loaded().await;

        let haystack = normalize_context_full(context);
        let mut found: Vec<LearningPattern> = self
            .patterns
            .read()
            .await
            .iter()
            .filter(|p| !p.pattern.is_empty() && haystack.contains(&p.pattern.to_lowercase()))
            .cloned()
            .collect();

        found.sort_by(|a, b| b.effectiveness.total_cmp(&a.effectiveness));
        found.truncate(limit);
        found
    }

    /// Record an outcome for the pattern keyed by `context`
    pub async fn reinforce(&self, context: &str, success: bool, satisfaction: f64) -> LearningPattern {
        self.ensure_loaded().await;

        let key = normalize_context(context);
        let now = self.clock.now();
        let updated = {
            let mut patterns = self.patterns.write().await;
            let idx = match patterns.iter().position(|p| p.pattern == key) {
                Some(idx) => idx,
                None => {
                    debug!("New learning pattern: {}", key);
                    patterns.push(LearningPattern::new(&key, context, now));
                    patterns.len() - 1
                }
            };
            patterns[idx].record(context, success, satisfaction, now);
            patterns[idx].clone()
        };

        self.persist().await;
        updated
    }

    /// Add or replace a pattern wholesale
    pub async fn insert(&self, pattern: LearningPattern) {
        self.ensure_loaded().await;
        {
            let mut patterns = self.patterns.write().await;
            match patterns.iter_mut().find(|p| p.pattern == pattern.pattern) {
                Some(existing) => *existing = pattern,
                None => patterns.push(pattern),
            }
        }
        self.persist().await;
    }

    pub async fn all(&self) -> Vec<LearningPattern> {
        self.ensure_loaded().await;
        self.patterns.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.ensure_loaded().await;
        self.patterns.read().await.len()
    }

    async fn persist(&self) {
        let snapshot = self.patterns.read().await.clone();
        if let Err(e) = store_json(self.persistence.as_ref(), &StorageKey::LearningPatterns, &snapshot).await {
            warn!("Failed to persist learning patterns: {}", e);
        }
    }
}

/// Whole-context normalization used on the matching side
/// Lowercase and collapse whitespace without truncating
pub fn normalize_context_full(context: &str) -> String {
    context.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
