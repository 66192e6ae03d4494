//! Error taxonomy for the goal-execution core

use thiserror::Error;

/// Core errors
#[derive(Error, Debug)]
pub enum AgentError {
    /// Planner output was unusable (parse failure, cycle, dangling dependency)
    #[error("Planning failed: {0}")]
    PlanningFailure(String),

    /// A tool or the AI execution path failed a step
    #[error("Step '{step_id}' failed: {message}")]
    StepExecutionFailure { step_id: String, message: String },

    /// Durable storage read/write failed
    #[error("Persistence error: {0}")]
    PersistenceFailure(String),

    /// A thinking cycle failed or panicked
    #[error("Thinking cycle failed: {0}")]
    CycleFailure(String),

    /// Autonomous decision requested before enough positive feedback
    #[error("Independence score {score:.2} is below the required {threshold:.2}")]
    IndependenceGuardRejection { score: f64, threshold: f64 },

    #[error("Goal not found: {0}")]
    GoalNotFound(String),

    #[error("Suggestion not found: {0}")]
    SuggestionNotFound(String),

    #[error("Decision not found: {0}")]
    DecisionNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    pub fn step_failure(step_id: &str, message: impl Into<String>) -> Self {
        AgentError::StepExecutionFailure {
            step_id: step_id.to_string(),
            message: message.into(),
        }
    }

    /// Short machine-friendly name, used in logs and interaction records
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::PlanningFailure(_) => "planning_failure",
            AgentError::StepExecutionFailure { .. } => "step_execution_failure",
            AgentError::PersistenceFailure(_) => "persistence_failure",
            AgentError::CycleFailure(_) => "cycle_failure",
            AgentError::IndependenceGuardRejection { .. } => "independence_guard_rejection",
            AgentError::GoalNotFound(_) => "goal_not_found",
            AgentError::SuggestionNotFound(_) => "suggestion_not_found",
            AgentError::DecisionNotFound(_) => "decision_not_found",
            AgentError::InvalidInput(_) => "invalid_input",
            AgentError::Serialization(_) => "serialization",
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::PersistenceFailure(e.to_string())
    }
}

/// Result alias for the core
pub type Result<T> = std::result::Result<T, AgentError>;
