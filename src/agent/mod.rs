//! Step Planning and Execution
//!
//! The "act" half of the agent:
//! - Planning (objective → validated steps, with a safe fallback)
//! - Structured tools (JSON schema, availability, async handlers)
//! - Dependency-ordered dispatch with retry and timeout policy
//!
//! Goal state itself lives in `autonomous::goals`.

pub mod planner;
pub mod recovery;
pub mod scheduler;
pub mod tools;

pub use planner::{default_step, parse_plan_response, PlannedStep, Planner};
pub use recovery::{ErrorClass, RetryPolicy, StepPolicy};
pub use scheduler::StepScheduler;
pub use tools::{AiExecutor, Tool, ToolAvailability, ToolRegistry, ToolSchema};
