//! Autonomy Core
//!
//! Goal-directed agent core with a background thinking loop.
//!
//! # Features
//!
//! - **Goals**: planned into dependency-ordered steps, executed, paused and resumed
//! - **Tools**: schema-validated handlers with availability rules and an AI fallback
//! - **Suggestions**: proactive, deduplicated, capped per user, expiring
//! - **Learning**: outcome patterns that feed decision confidence
//! - **Independence**: autonomous decisions gated by earned trust
//! - **Persistence**: pluggable port with SQLite and in-memory backends
//!
//! # Architecture
//!
//! ```text
//! caller ──► AutonomousAgent ──► GoalStore ──► StepScheduler ──► Tool / AiExecutor
//!                 │                  │
//!                 │                  └── Planner (Ollama/Llama)
//!                 ├── ThinkingLoop (interval, single-flight)
//!                 │       ├── SuggestionRegistry
//!                 │       └── DecisionEngine ──► PatternTable
//!                 ├── MemoryStore
//!                 └── PersistencePort (SQLite | in-memory)
//! ```

pub mod agent;
pub mod autonomous;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod llama_worker;
pub mod memory;
pub mod persistence;

pub use agent::{AiExecutor, PlannedStep, Planner, StepScheduler, Tool, ToolAvailability, ToolRegistry, ToolSchema};
pub use autonomous::{
    AutonomousDecision, CycleOutcome, Goal, GoalEvent, GoalStatus, LearningPattern, Priority, ProactiveSuggestion,
    StepStatus, SuggestionDraft, SuggestionSource, SuggestionType, TaskStep,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::{AgentStats, AutonomousAgent, Collaborators};
pub use error::{AgentError, Result};
pub use llama_worker::{LlamaWorker, LlamaWorkerConfig};
pub use memory::{AgentMemory, MemoryStats, MemoryStore};
pub use persistence::{InMemoryPersistence, PersistencePort, SqlitePersistence, StorageKey};
