//! Goal Planning
//!
//! Turns a natural-language objective into `TaskStep`s:
//! - `Planner` is the collaborator seam (LLM-backed or scripted)
//! - `parse_plan_response` recovers steps from raw model text
//! - `into_task_steps` validates a plan before it reaches the goal table
//!
//! Anything unusable collapses to the single `default_step`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::agent::scheduler::StepScheduler;
use crate::autonomous::goals::{Priority, TaskStep};
use crate::error::{AgentError, Result};

/// Action used when no usable plan exists
pub const DEFAULT_ACTION: &str = "analyze_goal";

/// A step as proposed by a planner, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub id: String,
    pub action: String,
    pub parameters: Map<String, Value>,
    pub dependencies: Vec<String>,
}

/// Decomposes objectives into steps
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, description: &str, priority: Priority) -> anyhow::Result<Vec<PlannedStep>>;
}

/// The fallback plan: a single analysis step over the whole objective
pub fn default_step(description: &str) -> TaskStep {
    let mut parameters = Map::new();
    parameters.insert("goal".to_string(), Value::String(description.to_string()));
    TaskStep::new("step_1", DEFAULT_ACTION, parameters)
}

/// Validate a proposed plan and convert it into pending steps
///
/// Empty plans, blank actions, duplicate ids, unknown dependencies and
/// cycles are all `PlanningFailure`.
pub fn into_task_steps(planned: Vec<PlannedStep>) -> Result<Vec<TaskStep>> {
    if planned.is_empty() {
        return Err(AgentError::PlanningFailure("plan has no steps".to_string()));
    }

    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(planned.len());
    for p in planned {
        let action = p.action.trim();
        if action.is_empty() {
            return Err(AgentError::PlanningFailure(format!("step '{}' has no action", p.id)));
        }
        if !seen.insert(p.id.clone()) {
            return Err(AgentError::PlanningFailure(format!("duplicate step id '{}'", p.id)));
        }

        let mut step = TaskStep::new(&p.id, action, p.parameters);
        for dep in &p.dependencies {
            step = step.depends_on(dep);
        }
        steps.push(step);
    }

    StepScheduler::order(&steps)?;
    Ok(steps)
}

/// Parse a model response into planned steps
///
/// Accepts either `{"steps": [...]}` or a bare array, optionally wrapped in
/// prose or a code fence. Step ids default to `step_<n>`; dependency ids may
/// be strings or numbers.
pub fn parse_plan_response(response: &str) -> Result<Vec<PlannedStep>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PlanJson {
        Wrapped { steps: Vec<StepJson> },
        Bare(Vec<StepJson>),
    }

    #[derive(Deserialize)]
    struct StepJson {
        id: Option<Value>,
        action: Option<String>,
        #[serde(alias = "params")]
        parameters: Option<Map<String, Value>>,
        #[serde(alias = "depends_on", alias = "dependsOn")]
        dependencies: Option<Vec<Value>>,
    }

    let json_str = extract_json(response)
        .ok_or_else(|| AgentError::PlanningFailure("no JSON in planner response".to_string()))?;
    let parsed: PlanJson = serde_json::from_str(json_str)
        .map_err(|e| AgentError::PlanningFailure(format!("malformed plan: {}", e)))?;

    let steps = match parsed {
        PlanJson::Wrapped { steps } => steps,
        PlanJson::Bare(steps) => steps,
    };

    Ok(steps
        .into_iter()
        .enumerate()
        .map(|(i, s)| PlannedStep {
            id: s
                .id
                .as_ref()
                .and_then(id_string)
                .unwrap_or_else(|| format!("step_{}", i + 1)),
            action: s.action.unwrap_or_default(),
            parameters: s.parameters.unwrap_or_default(),
            dependencies: s
                .dependencies
                .unwrap_or_default()
                .iter()
                .filter_map(id_string)
                .collect(),
        })
        .collect())
}

/// Step references arrive as `"step_2"`, `2` or `"2"`; numeric ids map onto
/// the positional `step_<n>` form
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => {
            let s = s.trim();
            match s.parse::<u64>() {
                Ok(n) => Some(format!("step_{}", n)),
                Err(_) => Some(s.to_string()),
            }
        }
        Value::Number(n) => n.as_u64().map(|n| format!("step_{}", n)),
        _ => None,
    }
}

/// Extract the first balanced JSON object or array from text
pub fn extract_json(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let (open, close) = if s[start..].starts_with('{') { ('{', '}') } else { ('[', ']') };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(id: &str, deps: &[&str]) -> PlannedStep {
        PlannedStep {
            id: id.to_string(),
            action: "do".to_string(),
            parameters: Map::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn test_extract_json() {
        let text = "Here is the plan:\n```json\n{\"steps\": [{\"action\": \"a}\"}]}\n```";
        assert_eq!(extract_json(text), Some("{\"steps\": [{\"action\": \"a}\"}]}"));
        assert_eq!(extract_json("[1, [2]] trailing"), Some("[1, [2]]"));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("{ unterminated"), None);
    }

    #[test]
    fn test_parse_wrapped_plan() {
        let response = r#"Sure! {"steps": [
            {"id": "research", "action": "web_search", "parameters": {"query": "rust"}},
            {"id": "summarize", "action": "summarize", "dependencies": ["research"]}
        ]}"#;
        let steps = parse_plan_response(response).unwrap();

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].parameters.get("query"), Some(&Value::String("rust".into())));
        assert_eq!(steps[1].dependencies, vec!["research".to_string()]);
    }

    #[test]
    fn test_parse_bare_array_with_numeric_refs() {
        let response = r#"[{"action": "fetch"}, {"action": "store", "depends_on": [1]}]"#;
        let steps = parse_plan_response(response).unwrap();

        assert_eq!(steps[0].id, "step_1");
        assert_eq!(steps[1].id, "step_2");
        assert_eq!(steps[1].dependencies, vec!["step_1".to_string()]);
        assert!(into_task_steps(steps).is_ok());
    }

    #[test]
    fn test_parse_garbage_is_planning_failure() {
        assert!(matches!(
            parse_plan_response("I cannot help with that"),
            Err(AgentError::PlanningFailure(_))
        ));
        assert!(matches!(
            parse_plan_response("{\"steps\": 42}"),
            Err(AgentError::PlanningFailure(_))
        ));
    }

    #[test]
    fn test_into_task_steps_rejects_bad_plans() {
        assert!(into_task_steps(vec![]).is_err());
        assert!(into_task_steps(vec![planned("a", &["b"]), planned("b", &["a"])]).is_err());
        assert!(into_task_steps(vec![planned("a", &["ghost"])]).is_err());
        assert!(into_task_steps(vec![planned("a", &[]), planned("a", &[])]).is_err());

        let mut blank = planned("a", &[]);
        blank.action = "  ".to_string();
        assert!(into_task_steps(vec![blank]).is_err());
    }

    #[test]
    fn test_into_task_steps_rejects_self_dependency() {
        let err = into_task_steps(vec![planned("a", &["a"]), planned("b", &["a"])]).unwrap_err();
        assert!(matches!(err, AgentError::PlanningFailure(ref msg) if msg.contains("'a'")));
    }

    #[test]
    fn test_into_task_steps_keeps_order_and_dedupes_dependencies() {
        let steps = into_task_steps(vec![planned("b", &["a", "a"]), planned("a", &[])]).unwrap();
        assert_eq!(steps[0].id, "b");
        assert_eq!(steps[0].dependencies, vec!["a".to_string()]);
        assert!(steps[1].dependencies.is_empty());
    }

    #[test]
    fn test_default_step() {
        let step = default_step("Plan a trip");
        assert_eq!(step.action, DEFAULT_ACTION);
        assert_eq!(step.parameters.get("goal"), Some(&Value::String("Plan a trip".into())));
        assert!(step.dependencies.is_empty());
    }
}
