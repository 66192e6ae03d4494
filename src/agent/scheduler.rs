//! Step Scheduler
//!
//! Orders a goal's steps by their dependencies and dispatches one step at a
//! time, either to its registered tool or to the generic AI executor.
//! Goal state transitions stay in `GoalStore`; this module only decides
//! order and runs individual steps.

use anyhow::anyhow;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agent::recovery::StepPolicy;
use crate::agent::tools::{Admission, AiExecutor, ToolRegistry};
use crate::autonomous::goals::{Goal, TaskStep};
use crate::error::{AgentError, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Sequential step dispatcher
pub struct StepScheduler {
    tools: Arc<ToolRegistry>,
    executor: Arc<dyn AiExecutor>,
    policy: StepPolicy,
}

impl StepScheduler {
    pub fn new(tools: Arc<ToolRegistry>, executor: Arc<dyn AiExecutor>, policy: StepPolicy) -> Self {
        Self { tools, executor, policy }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Execution order as indices into `steps`
    ///
    /// Depth-first: each step comes after its dependencies, and otherwise
    /// keeps its declared position. Cycles and dependencies on ids outside
    /// the goal are `PlanningFailure`.
    pub fn order(steps: &[TaskStep]) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut marks = vec![Mark::Unvisited; steps.len()];
        let mut order = Vec::with_capacity(steps.len());

        for start in 0..steps.len() {
            visit(start, steps, &index, &mut marks, &mut order)?;
        }

        Ok(order)
    }

    /// Run one step to a result, honoring availability and the retry policy
    pub async fn dispatch(&self, step: &TaskStep, goal: &Goal) -> Result<Value> {
        let tool = match self.tools.get(&step.action) {
            Some(tool) => match tool.admission(&step.parameters) {
                Admission::Run => Some(tool),
                Admission::Fallback => {
                    debug!("Tool '{}' declined step {}, using AI executor", step.action, step.id);
                    None
                }
                Admission::Denied => {
                    return Err(AgentError::step_failure(
                        &step.id,
                        format!("tool '{}' requires user approval", step.action),
                    ));
                }
            },
            None => None,
        };

        let mut attempt = 0;
        loop {
            let run = async {
                match tool {
                    Some(tool) => tool.execute(step.parameters.clone()).await,
                    None => self.executor.execute_step(&step.action, &step.parameters, goal).await,
                }
            };

            let outcome = match self.policy.step_timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("step timed out after {:?}", limit)),
                },
                None => run.await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let message = e.to_string();
                    if !self.policy.retry.should_retry(attempt, &message) {
                        return Err(AgentError::step_failure(&step.id, message));
                    }

                    let delay = self.policy.retry.delay_for_attempt(attempt);
                    warn!(
                        "Step {} attempt {} failed ({}), retrying in {:?}",
                        step.id,
                        attempt + 1,
                        message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn visit(
    i: usize,
    steps: &[TaskStep],
    index: &HashMap<&str, usize>,
    marks: &mut [Mark],
    order: &mut Vec<usize>,
) -> Result<()> {
    match marks[i] {
        Mark::Done => return Ok(()),
        Mark::Visiting => {
            return Err(AgentError::PlanningFailure(format!(
                "dependency cycle through step '{}'",
                steps[i].id
            )));
        }
        Mark::Unvisited => {}
    }

    marks[i] = Mark::Visiting;
    for dep in &steps[i].dependencies {
        let Some(&j) = index.get(dep.as_str()) else {
            return Err(AgentError::PlanningFailure(format!(
                "step '{}' depends on unknown step '{}'",
                steps[i].id, dep
            )));
        };
        visit(j, steps, index, marks, order)?;
    }
    marks[i] = Mark::Done;
    order.push(i);

    Ok(())
}
