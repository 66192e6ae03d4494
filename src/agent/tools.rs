//! Step Tools
//!
//! Registered tools execute goal steps whose `action` matches their name:
//! - JSON schema per tool, checked before every call
//! - Availability tag (`always`, `conditional`, `user_approval_required`)
//! - Async handlers returning structured JSON results
//!
//! Actions with no registered tool go to the `AiExecutor`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

use crate::autonomous::goals::{Goal, Parameters};

/// JSON Schema for tool parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name (snake_case), matched against step actions
    pub name: String,
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: Value,
    /// Required parameter names
    pub required: Vec<String>,
}

impl ToolSchema {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {}
            }),
            required: vec![],
        }
    }

    fn with_param(mut self, name: &str, property: Value, required: bool) -> Self {
        if let Some(props) = self.parameters.get_mut("properties") {
            props[name] = property;
        }
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    pub fn with_string_param(self, name: &str, description: &str, required: bool) -> Self {
        self.with_param(name, serde_json::json!({ "type": "string", "description": description }), required)
    }

    pub fn with_int_param(self, name: &str, description: &str, required: bool) -> Self {
        self.with_param(name, serde_json::json!({ "type": "integer", "description": description }), required)
    }

    pub fn with_enum_param(self, name: &str, description: &str, values: &[&str], required: bool) -> Self {
        self.with_param(
            name,
            serde_json::json!({ "type": "string", "description": description, "enum": values }),
            required,
        )
    }

    /// Validate step parameters against the schema
    pub fn validate(&self, params: &Parameters) -> Result<()> {
        for req in &self.required {
            if !params.contains_key(req) {
                return Err(anyhow!("Missing required parameter: {}", req));
            }
        }

        let Some(props) = self.parameters.get("properties").and_then(|p| p.as_object()) else {
            return Ok(());
        };

        for (name, schema) in props {
            let Some(value) = params.get(name) else {
                continue;
            };

            let expected_type = schema.get("type").and_then(|t| t.as_str());
            let valid = match expected_type {
                Some("string") => value.is_string(),
                Some("integer") => value.is_i64() || value.is_u64(),
                Some("number") => value.is_number(),
                Some("boolean") => value.is_boolean(),
                Some("array") => value.is_array(),
                Some("object") => value.is_object(),
                _ => true,
            };
            if !valid {
                return Err(anyhow!(
                    "Parameter '{}' has wrong type, expected {}",
                    name,
                    expected_type.unwrap_or("unknown")
                ));
            }

            if let (Some(allowed), Some(s)) = (schema.get("enum").and_then(|e| e.as_array()), value.as_str()) {
                if !allowed.iter().any(|a| a.as_str() == Some(s)) {
                    return Err(anyhow!("Parameter '{}' must be one of {:?}", name, allowed));
                }
            }
        }

        Ok(())
    }
}

/// Async tool body
pub type ToolHandler = Arc<dyn Fn(Parameters) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Predicate gating a conditional tool
pub type ToolCondition = Arc<dyn Fn(&Parameters) -> bool + Send + Sync>;

/// When a tool may run
#[derive(Clone)]
pub enum ToolAvailability {
    Always,
    /// Runs only when the predicate accepts the step parameters
    Conditional(ToolCondition),
    /// Runs only when the step parameters carry `"approved": true`
    UserApprovalRequired,
}

impl ToolAvailability {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolAvailability::Always => "always",
            ToolAvailability::Conditional(_) => "conditional",
            ToolAvailability::UserApprovalRequired => "user_approval_required",
        }
    }
}

impl std::fmt::Debug for ToolAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of checking a tool's availability against a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Run,
    /// Condition rejected; use the AI path instead
    Fallback,
    /// Approval missing; the step fails
    Denied,
}

/// A registered tool with schema and handler
pub struct Tool {
    pub schema: ToolSchema,
    pub availability: ToolAvailability,
    handler: ToolHandler,
}

impl Tool {
    /// Create an always-available tool
    pub fn new<F, Fut>(schema: ToolSchema, handler: F) -> Self
    where
        F: Fn(Parameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            schema,
            availability: ToolAvailability::Always,
            handler: Arc::new(move |params| Box::pin(handler(params))),
        }
    }

    /// Only run when `condition` accepts the parameters
    pub fn when<C>(mut self, condition: C) -> Self
    where
        C: Fn(&Parameters) -> bool + Send + Sync + 'static,
    {
        self.availability = ToolAvailability::Conditional(Arc::new(condition));
        self
    }

    /// Require `"approved": true` in the parameters
    pub fn requires_approval(mut self) -> Self {
        self.availability = ToolAvailability::UserApprovalRequired;
        self
    }

    pub fn admission(&self, params: &Parameters) -> Admission {
        match &self.availability {
            ToolAvailability::Always => Admission::Run,
            ToolAvailability::Conditional(condition) => {
                if condition(params) {
                    Admission::Run
                } else {
                    Admission::Fallback
                }
            }
            ToolAvailability::UserApprovalRequired => {
                if params.get("approved").and_then(|v| v.as_bool()) == Some(true) {
                    Admission::Run
                } else {
                    Admission::Denied
                }
            }
        }
    }

    /// Validate then run the handler
    pub async fn execute(&self, params: Parameters) -> Result<Value> {
        self.schema.validate(&params)?;
        (self.handler)(params).await
    }
}

/// Tool registry keyed by action name
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) {
        info!(
            "Registered tool: {} ({})",
            tool.schema.name,
            tool.availability.as_str()
        );
        self.tools.insert(tool.schema.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Generic execution path for actions with no registered tool
#[async_trait]
pub trait AiExecutor: Send + Sync {
    async fn execute_step(&self, action: &str, parameters: &Parameters, goal: &Goal) -> Result<Value>;
}
