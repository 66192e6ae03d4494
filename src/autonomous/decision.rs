//! Autonomous Decisions
//!
//! Chooses between options using learned patterns, and earns the right to
//! do so through feedback. Independence starts at 0.30, grows by 0.01 for
//! every clearly positive outcome (quality above 0.8) and is capped at 0.95;
//! no decision is made below 0.50. The score is kept in whole hundredths so
//! the threshold comparison is exact.
//!
//! Every decision is appended to a persisted log together with the
//! independence score.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::autonomous::learner::{normalize_context_full, PatternTable};
use crate::clock::Clock;
use crate::error::{AgentError, Result};
use crate::persistence::{load_json, store_json, PersistencePort, StorageKey};

/// Independence in hundredths
pub const INITIAL_INDEPENDENCE: u32 = 30;
pub const MAX_INDEPENDENCE: u32 = 95;
pub const INDEPENDENCE_THRESHOLD: u32 = 50;

/// Outcomes above this quality count towards independence
pub const POSITIVE_QUALITY: f64 = 0.8;

/// Patterns consulted per decision
const PATTERN_LIMIT: usize = 5;
const NO_PATTERN_CONFIDENCE: f64 = 0.3;
const MAX_CONFIDENCE: f64 = 0.95;
const FALLBACK_OPTIONS: usize = 2;

/// A logged decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutonomousDecision {
    pub decision_id: String,
    pub context: String,
    /// The chosen option
    pub decision: String,
    pub confidence: f64,
    pub reasoning: Vec<String>,
    /// Runner-up options, best first
    pub fallback_plan: Vec<String>,
    pub execution_time: DateTime<Utc>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub learned_from_outcome: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionState {
    independence: u32,
    decisions: Vec<AutonomousDecision>,
}

impl Default for DecisionState {
    fn default() -> Self {
        Self {
            independence: INITIAL_INDEPENDENCE,
            decisions: Vec::new(),
        }
    }
}

/// Pattern-driven decision maker
pub struct DecisionEngine {
    patterns: Arc<PatternTable>,
    state: RwLock<DecisionState>,
    loaded: OnceCell<()>,
    persistence: Arc<dyn PersistencePort>,
    clock: Arc<dyn Clock>,
}

impl DecisionEngine {
    pub fn new(patterns: Arc<PatternTable>, persistence: Arc<dyn PersistencePort>, clock: Arc<dyn Clock>) -> Self {
        Self {
            patterns,
            state: RwLock::new(DecisionState::default()),
            loaded: OnceCell::new(),
            persistence,
            clock,
        }
    }

    pub fn patterns(&self) -> &Arc<PatternTable> {
        &self.patterns
    }

    async fn ensure_loaded(&self) {
        self.loaded
            .get_or_init(|| async {
                match load_json::<DecisionState>(self.persistence.as_ref(), &StorageKey::DecisionLog).await {
                    Ok(Some(stored)) => {
                        info!(
                            "Loaded decision log: {} decisions, independence {:.2}",
                            stored.decisions.len(),
                            stored.independence as f64 / 100.0
                        );
                        *self.state.write().await = stored;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Failed to load decision log: {}", e),
                }
            })
            .await;
    }

    /// Current independence score (0.0 - 1.0)
    pub async fn independence_score(&self) -> f64 {
        self.ensure_loaded().await;
        self.state.read().await.independence as f64 / 100.0
    }

    /// Whether decisions are currently allowed
    pub async fn can_act(&self) -> bool {
        self.ensure_loaded().await;
        self.state.read().await.independence >= INDEPENDENCE_THRESHOLD
    }

    /// Pick one of `options` for `context`
    pub async fn make_autonomous_decision(&self, context: &str, options: &[String]) -> Result<AutonomousDecision> {
        if options.is_empty() {
            return Err(AgentError::InvalidInput("no options to decide between".to_string()));
        }

        self.ensure_loaded().await;
        let independence = self.state.read().await.independence;
        if independence < INDEPENDENCE_THRESHOLD {
            return Err(AgentError::IndependenceGuardRejection {
                score: independence as f64 / 100.0,
                threshold: INDEPENDENCE_THRESHOLD as f64 / 100.0,
            });
        }
        let independence = independence as f64 / 100.0;

        let patterns = self.patterns.matching(context, PATTERN_LIMIT).await;

        let base = if patterns.is_empty() {
            NO_PATTERN_CONFIDENCE
        } else {
            patterns.iter().map(|p| p.weighted_success()).sum::<f64>() / patterns.len() as f64
        };
        let confidence = (base + independence * 0.2).min(MAX_CONFIDENCE);

        let mut any_match = false;
        let scores: Vec<f64> = options
            .iter()
            .map(|option| {
                let option = normalize_context_full(option);
                patterns
                    .iter()
                    .filter(|p| option.contains(&p.pattern))
                    .fold(0.5, |score, p| {
                        any_match = true;
                        score + 0.3 * p.effectiveness
                    })
            })
            .collect();

        let chosen = if any_match {
            let mut best = 0;
            for (i, score) in scores.iter().enumerate() {
                if *score > scores[best] {
                    best = i;
                }
            }
            best
        } else {
            rand::thread_rng().gen_range(0..options.len())
        };

        let mut ranked: Vec<usize> = (0..options.len()).filter(|&i| i != chosen).collect();
        ranked.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        let fallback_plan = ranked
            .into_iter()
            .take(FALLBACK_OPTIONS)
            .map(|i| options[i].clone())
            .collect();

        let best_rate = patterns
            .iter()
            .map(|p| p.success_rate)
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))));
        let reasoning = vec![
            format!("Matched {} learned patterns", patterns.len()),
            match best_rate {
                Some(rate) => format!("Best pattern success rate: {:.0}%", rate * 100.0),
                None => "No prior patterns for this context".to_string(),
            },
            format!("Independence score: {:.2}", independence),
            format!("Options considered: {}", options.len()),
        ];

        let decision = AutonomousDecision {
            decision_id: format!("decision_{}", uuid::Uuid::new_v4()),
            context: context.to_string(),
            decision: options[chosen].clone(),
            confidence,
            reasoning,
            fallback_plan,
            execution_time: self.clock.now(),
            success: None,
            learned_from_outcome: false,
        };

        self.state.write().await.decisions.push(decision.clone());
        self.persist().await;

        info!(
            "Decided '{}' for '{}' (confidence {:.2})",
            decision.decision, decision.context, decision.confidence
        );
        Ok(decision)
    }

    /// Attach an outcome to a logged decision and learn from it
    ///
    /// Outcomes are learned once; repeating the call returns the decision
    /// unchanged.
    pub async fn record_outcome(&self, decision_id: &str, success: bool, quality: f64) -> Result<AutonomousDecision> {
        self.ensure_loaded().await;

        let decision = {
            let mut state = self.state.write().await;
            let decision = state
                .decisions
                .iter_mut()
                .find(|d| d.decision_id == decision_id)
                .ok_or_else(|| AgentError::DecisionNotFound(decision_id.to_string()))?;

            if decision.learned_from_outcome {
                debug!("Outcome for {} already recorded", decision_id);
                return Ok(decision.clone());
            }
            decision.success = Some(success);
            decision.learned_from_outcome = true;
            let decision = decision.clone();

            if success && quality > POSITIVE_QUALITY {
                state.independence = (state.independence + 1).min(MAX_INDEPENDENCE);
            }
            decision
        };

        self.patterns.reinforce(&decision.context, success, quality).await;
        self.persist().await;
        Ok(decision)
    }

    /// Feedback that did not come from a logged decision
    pub async fn record_feedback(&self, positive: bool, quality: f64) {
        if !(positive && quality > POSITIVE_QUALITY) {
            return;
        }

        self.ensure_loaded().await;
        let raised = {
            let mut state = self.state.write().await;
            let before = state.independence;
            state.independence = (state.independence + 1).min(MAX_INDEPENDENCE);
            state.independence != before
        };
        if raised {
            self.persist().await;
        }
    }

    pub async fn get_decision(&self, decision_id: &str) -> Option<AutonomousDecision> {
        self.ensure_loaded().await;
        self.state
            .read()
            .await
            .decisions
            .iter()
            .find(|d| d.decision_id == decision_id)
            .cloned()
    }

    pub async fn decision_count(&self) -> usize {
        self.ensure_loaded().await;
        self.state.read().await.decisions.len()
    }

    async fn persist(&self) {
        let snapshot = self.state.read().await.clone();
        if let Err(e) = store_json(self.persistence.as_ref(), &StorageKey::DecisionLog, &snapshot).await {
            warn!("Failed to persist decision log: {}", e);
        }
    }
}
