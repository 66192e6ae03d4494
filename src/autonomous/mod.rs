//! Autonomous Behavior System
//!
//! Goal tracking plus the self-directed parts of the agent:
//! 1. **Goals**: state machine, pause/resume, durable checkpoints
//! 2. **Suggestions**: proactive, deduplicated, capped and expiring
//! 3. **Learning**: outcome patterns feeding decision confidence
//! 4. **Decisions**: option selection gated by earned independence
//! 5. **Thinking**: the periodic single-flight loop driving 2-4

pub mod decision;
pub mod goals;
pub mod learner;
pub mod suggestions;
pub mod thinking;

pub use decision::{AutonomousDecision, DecisionEngine};
pub use goals::{Goal, GoalEvent, GoalStatus, GoalStore, Priority, StepStatus, TaskStep};
pub use learner::{LearningPattern, PatternTable};
pub use suggestions::{
    ProactiveSuggestion, SuggestedAction, SuggestionConfig, SuggestionDraft, SuggestionRegistry, SuggestionSource,
    SuggestionType,
};
pub use thinking::{CycleOutcome, ThinkingConfig, ThinkingHandle, ThinkingLoop, ThinkingSnapshot};
